//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Build (app.rs):
//!     Validate options → id defaults to UUID v4 → Server::init for each server
//!
//! Run (app.rs, group.rs):
//!     before_start hooks
//!     → per server: start task + stop waiter in one TaskGroup
//!     → all start tasks scheduled → after_start hooks
//!     → signal watcher (signals.rs)
//!     → wait for the group; first error cancels the rest
//!
//! Stop (shutdown.rs):
//!     before_stop hooks → cancel root token → servers stop (bounded) → after_stop hooks
//! ```
//!
//! # Design Decisions
//! - Cancellation is a token tree: parent → root → group → per-call contexts
//! - Stop is idempotent and can be triggered from any clone of the handle
//! - Each server's stop gets a fresh context bounded by the stop timeout
//! - A run ended only by cancellation is a clean exit

pub mod app;
pub mod group;
pub mod hooks;
pub mod shutdown;
pub mod signals;

pub use app::{App, AppBuilder, AppInfo};
pub use group::TaskGroup;
pub use hooks::{hook, Hook, Hooks};
pub use shutdown::ShutdownHandle;
pub use signals::Signal;
