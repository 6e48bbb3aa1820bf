pub mod connection;
pub mod email;
pub mod watch_subscription;

pub use connection::ConnectionRepository;
pub use email::EmailRepository;
pub use watch_subscription::WatchSubscriptionRepository;
