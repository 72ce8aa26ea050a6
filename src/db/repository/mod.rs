pub mod delivery_queue;
pub mod owner_subscription;
pub mod snapshot;
pub mod subscription;
pub mod webhook;

pub use delivery_queue::DeliveryQueueRepository;
pub use owner_subscription::OwnerSubscriptionRepository;
pub use snapshot::{SnapshotRepository, SqliteSnapshotRepository};
pub use subscription::SubscriptionRepository;
pub use webhook::WebhookRepository;
