//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     Load config → Validate → SecurityEngine::from_config → SecurityEngine::start
//!
//! Shutdown (shutdown.rs):
//!     Shutdown::trigger → background tasks observe ShutdownSignal
//!     → audit dispatcher drains its queue → tasks exit
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop producing, drain audit queue, exit
//! - The signal is level-triggered; late subscribers still see it

pub mod shutdown;

pub use shutdown::{Shutdown, ShutdownSignal};
