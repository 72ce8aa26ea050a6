use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Upcoming,
    Active,
    Expired,
}

impl CampaignStatus {
    /// Convert from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "UPCOMING" => Some(CampaignStatus::Upcoming),
            "ACTIVE" => Some(CampaignStatus::Active),
            "EXPIRED" => Some(CampaignStatus::Expired),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CampaignStatus::Upcoming => "UPCOMING",
            CampaignStatus::Active => "ACTIVE",
            CampaignStatus::Expired => "EXPIRED",
        }
    }
}

impl TryFrom<&str> for CampaignStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::from_str(value).ok_or_else(|| format!("Invalid campaign status: {}", value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropCampaign {
    pub id: String,
    pub game_id: String,
    pub name: String,
    pub description: Option<String>,
    /// Explicit status that wins over the time-derived one.
    pub status_override: Option<CampaignStatus>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub details_url: Option<String>,
    pub account_link_url: Option<String>,
    pub image_url: Option<String>,
}

impl DropCampaign {
    /// Status of the campaign at `now`. Both ends of the window are inclusive.
    pub fn status_at(&self, now: DateTime<Utc>) -> CampaignStatus {
        if let Some(status) = self.status_override {
            return status;
        }
        if now < self.starts_at {
            CampaignStatus::Upcoming
        } else if now > self.ends_at {
            CampaignStatus::Expired
        } else {
            CampaignStatus::Active
        }
    }

    /// Account linking has its own page only when it differs from the details page.
    pub fn separate_account_link(&self) -> Option<&str> {
        match (&self.account_link_url, &self.details_url) {
            (Some(link), Some(details)) if link == details => None,
            (Some(link), _) => Some(link.as_str()),
            (None, _) => None,
        }
    }
}

/// Row shape of the `drop_campaigns` table.
#[derive(Debug, Clone, FromRow)]
pub struct DropCampaignRow {
    pub id: String,
    pub game_id: String,
    pub name: String,
    pub description: Option<String>,
    pub status_override: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub details_url: Option<String>,
    pub account_link_url: Option<String>,
    pub image_url: Option<String>,
}

impl From<DropCampaignRow> for DropCampaign {
    fn from(row: DropCampaignRow) -> Self {
        DropCampaign {
            status_override: row
                .status_override
                .as_deref()
                .and_then(CampaignStatus::from_str),
            id: row.id,
            game_id: row.game_id,
            name: row.name,
            description: row.description,
            starts_at: row.starts_at,
            ends_at: row.ends_at,
            details_url: row.details_url,
            account_link_url: row.account_link_url,
            image_url: row.image_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn campaign() -> DropCampaign {
        DropCampaign {
            id: "c1".to_string(),
            game_id: "g1".to_string(),
            name: "Week 1".to_string(),
            description: None,
            status_override: None,
            starts_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ends_at: Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap(),
            details_url: None,
            account_link_url: None,
            image_url: None,
        }
    }

    #[test]
    fn status_is_derived_from_window() {
        let c = campaign();
        let before = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        let during = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 1).unwrap();

        assert_eq!(c.status_at(before), CampaignStatus::Upcoming);
        assert_eq!(c.status_at(during), CampaignStatus::Active);
        assert_eq!(c.status_at(after), CampaignStatus::Expired);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let c = campaign();
        assert_eq!(c.status_at(c.starts_at), CampaignStatus::Active);
        assert_eq!(c.status_at(c.ends_at), CampaignStatus::Active);
    }

    #[test]
    fn override_wins() {
        let mut c = campaign();
        c.status_override = Some(CampaignStatus::Expired);
        let during = Utc.with_ymd_and_hms(2024, 1, 5, 0, 0, 0).unwrap();
        assert_eq!(c.status_at(during), CampaignStatus::Expired);
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!(
            CampaignStatus::from_str("active"),
            Some(CampaignStatus::Active)
        );
        assert_eq!(
            CampaignStatus::try_from("EXPIRED"),
            Ok(CampaignStatus::Expired)
        );
        assert!(CampaignStatus::try_from("UNKNOWN").is_err());
    }

    #[test]
    fn account_link_hidden_when_same_as_details() {
        let mut c = campaign();
        c.details_url = Some("https://example.com".to_string());
        c.account_link_url = Some("https://example.com".to_string());
        assert_eq!(c.separate_account_link(), None);

        c.account_link_url = Some("https://example.com/link".to_string());
        assert_eq!(c.separate_account_link(), Some("https://example.com/link"));
    }
}
