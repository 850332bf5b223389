pub mod analytics;
pub mod notifications;
pub mod retention;
pub mod store;
