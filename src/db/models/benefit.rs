use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The in-game item granted by a drop.
///
/// Twitch reuses benefit ids across drops; rows are keyed by `(drop_id, id)` so
/// each drop owns its own copy.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Benefit {
    pub id: String,
    pub drop_id: String,
    pub name: String,
    pub image_url: Option<String>,
    pub entitlement_limit: Option<i64>,
}

impl Benefit {
    /// Limits of one (or none) are not worth showing.
    pub fn display_limit(&self) -> Option<i64> {
        self.entitlement_limit.filter(|limit| *limit > 1)
    }
}
