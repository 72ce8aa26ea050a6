use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A reward unlocked by watching a campaign's streams for a number of minutes.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct TimeBasedDrop {
    pub id: String,
    pub campaign_id: String,
    pub name: String,
    pub required_minutes_watched: i64,
}
