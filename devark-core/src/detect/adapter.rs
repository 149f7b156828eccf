//! Tool adapter abstraction
//!
//! Each supported AI tool plugs into the detection service through this
//! trait. Adapters own their capture mechanism (SQLite polling for Cursor,
//! hook-fed queue tailing for Claude Code) and surface new prompts when the
//! service drives their `poll`.
//!
//! ## Design Principles
//!
//! 1. **Isolation**: one adapter failing must not stop the others
//! 2. **Cooperative**: `poll` does a bounded amount of work and returns
//! 3. **Degradation**: persistent capture errors mark the adapter
//!    unavailable instead of erroring the service

use crate::error::Result;
use crate::types::{PromptDetectedEvent, SessionSource};

/// Trait implemented by all tool adapters.
pub trait ToolAdapter: Send {
    /// Which tool this adapter captures from
    fn source(&self) -> SessionSource;

    /// One-time setup (open handles, install hooks). Failure marks the
    /// adapter unavailable; it stays registered.
    fn initialize(&mut self) -> Result<()>;

    /// Begin capturing. Re-entrant: starting a started adapter is a no-op.
    fn start(&mut self) -> Result<()>;

    /// Stop capturing. Re-entrant.
    fn stop(&mut self);

    /// Whether the adapter can currently capture prompts.
    fn is_available(&self) -> bool;

    /// Collect prompts detected since the last poll, in detection order.
    ///
    /// Individual record problems should be logged and skipped; an `Err`
    /// signals the whole poll failed (the service logs it and keeps the
    /// other adapters running).
    fn poll(&mut self) -> Result<Vec<PromptDetectedEvent>>;
}
