//! Event Log Sync Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, category registry, logging and error handling for the
//! event log sync workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`EventLogError`] and the [`Result`] alias
//! - **Categories**: the static registry describing how each log category is
//!   turned into log messages and metric labels
//! - **Types**: sync states, statuses, file locators and checkpoints
//! - **Logging**: tracing subscriber setup, including the secure log destination
//!
//! # Example
//!
//! ```no_run
//! use eventlog_common::{Category, Result};
//!
//! fn lookup(name: &str) -> Result<()> {
//!     let category: Category = name.parse()?;
//!     let descriptor = category.descriptor();
//!     tracing::info!(category = %category, labels = descriptor.metric_labels.len(), "Found category");
//!     Ok(())
//! }
//! ```

pub mod category;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use category::{Category, CategoryDescriptor};
pub use error::{EventLogError, Result};
pub use types::{Checkpoint, FileLocator, SyncState, SyncStatus};
