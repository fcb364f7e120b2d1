//! Client side of the task manager protocol.
//!
//! Each call opens one connection, writes its message, closes the write half
//! and reads until the manager closes. Only `status_query` gets a reply.

use super::protocol::{Message, StatusReply};
use crate::error::{Result, SiftError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone)]
pub struct TaskClient {
    addr: String,
    timeout: Duration,
}

impl TaskClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send a message and return whatever the manager wrote back
    pub async fn send(&self, message: &Message) -> Result<Vec<u8>> {
        let payload = message.encode()?;
        timeout(self.timeout, self.exchange(&payload))
            .await
            .map_err(|_| {
                SiftError::Scheduling(format!("task manager at {} timed out", self.addr))
            })?
    }

    async fn exchange(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(&self.addr).await.map_err(|e| {
            SiftError::Scheduling(format!("cannot reach task manager at {}: {}", self.addr, e))
        })?;
        stream.write_all(payload).await?;
        stream.shutdown().await?;

        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        Ok(reply)
    }

    pub async fn status(&self) -> Result<StatusReply> {
        let reply = self.send(&Message::StatusQuery).await?;
        serde_json::from_slice(&reply).map_err(|e| {
            SiftError::Protocol(format!("invalid status reply: {}", e))
        })
    }

    pub async fn insert(&self, project_id: &str, simulation: bool) -> Result<()> {
        self.send(&Message::insert(project_id, simulation)).await?;
        Ok(())
    }

    /// Report success; `launch_id` is the id the manager started the worker with
    pub async fn remove(&self, project_id: &str, launch_id: Option<u64>) -> Result<()> {
        self.send(&Message::remove(project_id).for_launch(launch_id)).await?;
        Ok(())
    }

    pub async fn failure(&self, project_id: &str, launch_id: Option<u64>) -> Result<()> {
        self.send(&Message::failure(project_id).for_launch(launch_id)).await?;
        Ok(())
    }

    pub async fn reset_pending(&self) -> Result<()> {
        self.send(&Message::ResetPending).await?;
        Ok(())
    }
}
