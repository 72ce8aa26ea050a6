//! Database models split into separate files.
//! This module re-exports individual model modules so imports like
//! `use crate::db::models::*;` work.

pub mod benefit;
pub mod campaign;
pub mod delivery_queue;
pub mod game;
pub mod organization;
pub mod owner_subscription;
pub mod snapshot;
pub mod subscription;
pub mod time_based_drop;
pub mod webhook;

pub use self::benefit::*;
pub use self::campaign::*;
pub use self::delivery_queue::*;
pub use self::game::*;
pub use self::organization::*;
pub use self::owner_subscription::*;
pub use self::snapshot::*;
pub use self::subscription::*;
pub use self::time_based_drop::*;
pub use self::webhook::*;
