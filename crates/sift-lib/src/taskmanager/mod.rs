//! Task manager: a bounded worker pool fed by a durable waiting queue,
//! driven by JSON messages over TCP.

mod client;
mod launcher;
mod manager;
mod protocol;
mod queue;

#[cfg(test)]
mod tests;

pub use client::TaskClient;
pub use launcher::{ProcessHandle, ProcessLauncher, WorkerHandle, WorkerLauncher};
pub use manager::{TaskManager, TaskManagerConfig};
pub use protocol::{Message, MessageFramer, StatusReply};
pub use queue::{QueueEntry, WaitingQueue};
