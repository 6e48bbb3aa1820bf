pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod engine;
pub mod executor;
pub mod fetch;
pub mod history;
pub mod migration;
pub mod models;
pub mod processor;
pub mod scheduler;
pub mod watch;

pub use auth::{CredentialError, CredentialManager, REAUTH_MESSAGE};
pub use client::{GmailClient, MailProvider};
pub use engine::{EngineDeps, EngineOptions, SyncEngine};
pub use executor::{AutoSyncResult, AutoSyncSettings, SyncExecutor};
pub use fetch::MessageFetcher;
pub use history::{HistorySync, HistorySyncResult};
pub use migration::{
    MigrationError, MigrationManager, MigrationResult, MigrationStatus, RollbackResult,
};
pub use processor::{ExtractionClient, MessageProcessor};
pub use watch::{WatchManager, WatchSetupResult, WatchStopResult};
