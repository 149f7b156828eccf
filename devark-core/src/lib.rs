//! # devark-core
//!
//! Core library for devark - prompt capture and scoring for AI coding
//! assistants.
//!
//! This library provides:
//! - Unified prompt detection across Cursor and Claude Code
//! - Session reading and aggregation over both tools' on-disk formats
//! - An LLM provider registry and the five-dimension scoring pipeline
//! - Encrypted token storage and bounded prompt-history stores
//! - Idempotent cloud sync and the typed UI message bus
//!
//! ## Architecture
//!
//! Data flows capture-first:
//! - **Detection** watches each tool's capture surface and emits canonical
//!   prompt events
//! - **Scoring** runs the rubric through the active provider and caches by
//!   fingerprint
//! - **Stores** persist annotated prompts and derived daily stats
//! - **Sync** uploads only sessions the backend has not acknowledged
//!
//! ## Example
//!
//! ```rust,no_run
//! use devark_core::config::ConfigStore;
//! use devark_core::sessions::SessionAggregator;
//!
//! let config = ConfigStore::open_default().expect("failed to open config");
//! let sessions = SessionAggregator::open_default();
//! for session in sessions.list_sessions(None) {
//!     println!("{} ({})", session.workspace_name, session.source);
//! }
//! # let _ = config;
//! ```

// Re-export commonly used items at the crate root
pub use config::{Config, ConfigStore};
pub use error::{Error, Result};
pub use services::Services;
pub use types::*;

// Public modules
pub mod bus;
pub mod config;
pub mod detect;
pub mod error;
pub mod logging;
pub mod prompt;
pub mod scoring;
pub mod services;
pub mod sessions;
pub mod store;
pub mod sync;
pub mod types;
