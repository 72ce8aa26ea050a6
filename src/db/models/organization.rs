use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// The company that owns one or more games ("Microsoft", "Ubisoft", ...).
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: Option<String>,
}

impl Organization {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown organization")
    }
}
