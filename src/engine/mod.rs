//! Execution engine interface.
//!
//! The interchange only needs three things from an engine: accept a task,
//! eventually push a result onto the results channel, and shut down. How
//! tasks are scheduled and run is the engine's business.
//!
//! # Components
//!
//! - [`ExecutionEngine`]: the seam the interchange drives
//! - [`ShellEngine`]: reference engine running each task buffer as a shell
//!   command with bounded concurrency

pub mod shell;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::EngineError;
use crate::messages::{GlobalState, QueueMessage, Task};

pub use shell::ShellEngine;

pub trait ExecutionEngine: Send {
    /// Begin accepting work. Results (and any self-reported status) are sent
    /// on `results`.
    fn start(
        &mut self,
        endpoint_id: Uuid,
        results: mpsc::UnboundedSender<QueueMessage>,
    ) -> Result<(), EngineError>;

    /// Hand a task over. Must not block.
    fn submit(&mut self, task: Task) -> Result<(), EngineError>;

    /// Current engine-side state, merged into the interchange's status reports.
    fn snapshot(&self) -> GlobalState {
        GlobalState::new()
    }

    /// Stop accepting work and answer every task still running with a failed
    /// result on the results channel. Returns how many tasks were cancelled.
    fn cancel_in_flight(&mut self) -> usize {
        0
    }

    /// Stop accepting work and release resources.
    fn shutdown(&mut self);
}
