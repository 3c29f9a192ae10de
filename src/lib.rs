//! Corral Actor Runtime
//!
//! A runtime core for an actor-like concurrency model: concurrently-owned
//! objects ("cowns") execute asynchronous message batches under an
//! at-most-one-active-runner guarantee, scheduled across a fixed pool of
//! worker threads via work stealing. Reference cycles between cowns are
//! reclaimed by a distributed, non-blocking leak-detection protocol, and
//! residual cown stubs are freed through epoch-based reclamation.
//!
//! # Example
//!
//! ```no_run
//! use corral::{Scheduler, SchedulerConfig};
//!
//! # fn main() -> corral::Result<()> {
//! let config = SchedulerConfig {
//!     num_workers: 2,
//!     ..Default::default()
//! };
//! let mut scheduler = Scheduler::start(config, |_ctx| {
//!     tracing::info!("hello from the bootstrap cown");
//! })?;
//! scheduler.join()?;
//! # Ok(())
//! # }
//! ```

#![doc(html_root_url = "https://docs.rs/corral")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod program;
pub mod runtime;

// Utility modules
pub mod util;

// Re-exports
pub use anyhow::{Context, Result};
pub use thiserror::Error;

pub use program::{EntryPoint, EntryPointError, Program};
pub use runtime::cown::{BehaviourCtx, CownPtr, CownRef, CownState, CownWeak};
pub use runtime::scheduler::{Scheduler, SchedulerConfig, ThreadStartFn};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime name
pub const NAME: &str = "Corral";

/// Validate a program's entry point and start it on a fresh scheduler pool.
///
/// This is the embedding entry point mirroring what a compiler front end
/// would do: validate `Main.main`, then hand it to the runtime. A program
/// without a well-formed entry point never starts a scheduler; the
/// diagnostic is returned instead.
pub fn boot(
    program: Program,
    config: SchedulerConfig,
) -> Result<Scheduler> {
    let entry = program
        .entry_point()
        .context("entry point validation failed")?;
    tracing::debug!(entry = %entry.name(), "starting runtime");
    Scheduler::start_entry(config, entry)
}
