//! Queue, dispatcher and run lifecycle for the Laminar scheduling core.
//!
//! All scheduler state lives on a single actor task; the public
//! surface is a cheap clonable handle feeding its mailbox. Log drain
//! and completion signals from launched builds come back through the
//! same mailbox, which serializes every mutation and gives the
//! per-run event ordering guarantee (queued, started, log chunks in
//! byte order, completed) for free.

pub mod dispatcher;
pub mod notifier;
pub mod status;
pub mod workspace;

mod queue;
mod settings;

#[cfg(test)]
mod testing;

pub use dispatcher::{LogTail, QueueOptions, QueuedRun, Scheduler, SchedulerHandle};
pub use notifier::{Frame, Scope, Subscription};
pub use settings::Settings;
pub use status::StatusRequest;
pub use workspace::Workspace;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// No `<job>.run` recipe exists in the jobs configuration directory.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    #[error(transparent)]
    Store(#[from] laminar_db::DbError),

    #[error("scheduler is shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
