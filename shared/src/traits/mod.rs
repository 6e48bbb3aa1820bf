pub mod repository;

pub use repository::{ConnectionStore, EmailStore, WatchSubscriptionStore};
