pub mod delivery;
pub mod detector;
pub mod discord;
pub mod dispatcher;
pub mod format;
pub mod ingest;
pub mod init;
pub mod pipeline;
pub mod retry;
pub mod webhooks;
