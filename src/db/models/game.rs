use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const DEFAULT_BOX_ART_URL: &str = "https://static-cdn.jtvnw.net/ttv-static/404_boxart.jpg";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    /// Twitch category id, e.g. "509658".
    pub id: String,
    pub name: String,
    pub slug: Option<String>,
    pub box_art_url: Option<String>,
    pub organization_id: Option<String>,
}

impl Game {
    /// Link to the game's Twitch directory page.
    pub fn twitch_url(&self) -> String {
        match self.slug.as_deref() {
            Some(slug) if !slug.is_empty() => {
                format!("https://www.twitch.tv/directory/category/{}", slug)
            }
            _ => "https://www.twitch.tv/directory".to_string(),
        }
    }

    pub fn box_art(&self) -> &str {
        self.box_art_url.as_deref().unwrap_or(DEFAULT_BOX_ART_URL)
    }
}

/// Row shape of the `games` table.
#[derive(Debug, Clone, FromRow)]
pub struct GameRow {
    pub id: String,
    pub name: String,
    pub slug: Option<String>,
    pub box_art_url: Option<String>,
    pub organization_id: Option<String>,
    pub snapshot_taken_at: DateTime<Utc>,
}

impl From<GameRow> for Game {
    fn from(row: GameRow) -> Self {
        Game {
            id: row.id,
            name: row.name,
            slug: row.slug,
            box_art_url: row.box_art_url,
            organization_id: row.organization_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn twitch_url_uses_slug_when_present() {
        let game = Game {
            id: "509658".to_string(),
            name: "Halo Infinite".to_string(),
            slug: Some("halo-infinite".to_string()),
            box_art_url: None,
            organization_id: None,
        };
        assert_eq!(
            game.twitch_url(),
            "https://www.twitch.tv/directory/category/halo-infinite"
        );
        assert_eq!(game.box_art(), DEFAULT_BOX_ART_URL);
    }

    #[test]
    fn twitch_url_falls_back_to_directory() {
        let game = Game {
            id: "1".to_string(),
            name: "Unknown".to_string(),
            slug: Some(String::new()),
            box_art_url: None,
            organization_id: None,
        };
        assert_eq!(game.twitch_url(), "https://www.twitch.tv/directory");
    }
}
