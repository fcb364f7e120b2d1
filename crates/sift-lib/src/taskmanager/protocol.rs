//! Task manager wire protocol
//!
//! Messages are bare JSON objects with an `action` tag, written back to back
//! on a TCP stream with no line delimiter. [`MessageFramer`] splits the byte
//! stream on balanced braces, ignoring braces inside string literals.

use crate::error::{Result, SiftError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Message {
    /// Enqueue a job; a no-op when the project is already waiting
    Insert {
        project_id: String,
        #[serde(default)]
        simulation: bool,
    },
    /// Worker finished successfully
    Remove {
        project_id: String,
        /// Launch the report belongs to; reports from an earlier launch are ignored
        #[serde(default, skip_serializing_if = "Option::is_none")]
        launch_id: Option<u64>,
    },
    /// Worker failed
    Failure {
        project_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        launch_id: Option<u64>,
    },
    /// Terminate all running workers; the waiting queue is kept
    ResetPending,
    StatusQuery,
}

impl Message {
    pub fn insert(project_id: impl Into<String>, simulation: bool) -> Self {
        Message::Insert {
            project_id: project_id.into(),
            simulation,
        }
    }

    pub fn remove(project_id: impl Into<String>) -> Self {
        Message::Remove {
            project_id: project_id.into(),
            launch_id: None,
        }
    }

    pub fn failure(project_id: impl Into<String>) -> Self {
        Message::Failure {
            project_id: project_id.into(),
            launch_id: None,
        }
    }

    /// Tag a worker report with the launch it came from
    pub fn for_launch(mut self, id: Option<u64>) -> Self {
        if let Message::Remove { launch_id, .. } | Message::Failure { launch_id, .. } = &mut self {
            *launch_id = id;
        }
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame).map_err(|e| {
            SiftError::Protocol(format!(
                "invalid message {}: {}",
                String::from_utf8_lossy(frame),
                e
            ))
        })
    }
}

/// Project ids name a directory under the projects root, so they must be a
/// single plain path component.
pub fn validate_project_id(project_id: &str) -> Result<()> {
    let plain = !project_id.is_empty()
        && project_id != "."
        && project_id != ".."
        && !project_id.contains(&['/', '\\', ':', '\0'][..]);
    if plain {
        Ok(())
    } else {
        Err(SiftError::Protocol(format!(
            "invalid project id {:?}: must be a single path component",
            project_id
        )))
    }
}

/// Answer to `status_query`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReply {
    pub max_workers: usize,
    pub currently_running: usize,
    pub available_slots: usize,
    pub running_project_ids: Vec<String>,
}

/// Incremental brace-balanced splitter for a stream of JSON objects
#[derive(Debug, Default)]
pub struct MessageFramer {
    buf: Vec<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return every object completed by them.
    ///
    /// Whitespace between objects is skipped; anything else outside an
    /// object is a protocol error and resets the framer.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut frames = Vec::new();
        for &byte in data {
            if self.depth == 0 {
                match byte {
                    b'{' => {
                        self.depth = 1;
                        self.buf.push(byte);
                    }
                    b if b.is_ascii_whitespace() => {}
                    other => {
                        self.reset();
                        return Err(SiftError::Protocol(format!(
                            "unexpected byte {:?} between messages",
                            other as char
                        )));
                    }
                }
                continue;
            }

            self.buf.push(byte);
            if self.in_string {
                match byte {
                    _ if self.escaped => self.escaped = false,
                    b'\\' => self.escaped = true,
                    b'"' => self.in_string = false,
                    _ => {}
                }
                continue;
            }
            match byte {
                b'"' => self.in_string = true,
                b'{' => self.depth += 1,
                b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        frames.push(std::mem::take(&mut self.buf));
                    }
                }
                _ => {}
            }
        }
        Ok(frames)
    }

    /// True when no partial object is buffered
    pub fn is_idle(&self) -> bool {
        self.depth == 0
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.depth = 0;
        self.in_string = false;
        self.escaped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format() {
        let json = String::from_utf8(Message::insert("p1", true).encode().unwrap()).unwrap();
        assert_eq!(json, r#"{"action":"insert","project_id":"p1","simulation":true}"#);

        assert_eq!(
            Message::decode(br#"{"action":"insert","project_id":"p2"}"#).unwrap(),
            Message::insert("p2", false)
        );
        assert_eq!(
            Message::decode(br#"{"action":"reset_pending"}"#).unwrap(),
            Message::ResetPending
        );
        assert!(matches!(
            Message::decode(br#"{"action":"explode"}"#),
            Err(SiftError::Protocol(_))
        ));
    }

    #[test]
    fn test_launch_id_is_optional_on_the_wire() {
        let tagged = Message::failure("p1").for_launch(Some(3));
        let json = String::from_utf8(tagged.encode().unwrap()).unwrap();
        assert_eq!(json, r#"{"action":"failure","project_id":"p1","launch_id":3}"#);
        assert_eq!(Message::decode(json.as_bytes()).unwrap(), tagged);

        let json = String::from_utf8(Message::remove("p1").encode().unwrap()).unwrap();
        assert_eq!(json, r#"{"action":"remove","project_id":"p1"}"#);
        assert_eq!(Message::insert("p1", false).for_launch(Some(1)), Message::insert("p1", false));
    }

    #[test]
    fn test_project_id_must_be_one_component() {
        for ok in ["p1", "review-2024_v2", "with space", "..hidden"] {
            assert!(validate_project_id(ok).is_ok(), "{:?} should be accepted", ok);
        }
        for bad in ["", ".", "..", "/etc", "../../home/victim", "a/b", "a\\b", "C:evil", "nul\0"] {
            assert!(
                matches!(validate_project_id(bad), Err(SiftError::Protocol(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_framer_splits_concatenated_objects() {
        let mut framer = MessageFramer::new();
        let frames = framer
            .push(br#"{"action":"status_query"} {"action":"remove","project_id":"a"}"#)
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(Message::decode(&frames[1]).unwrap(), Message::remove("a"));
        assert!(framer.is_idle());
    }

    #[test]
    fn test_framer_handles_split_reads_and_braces_in_strings() {
        let mut framer = MessageFramer::new();
        let raw = br#"{"action":"insert","project_id":"we{ird}\"\\"}"#;
        let (head, tail) = raw.split_at(17);
        assert!(framer.push(head).unwrap().is_empty());
        assert!(!framer.is_idle());

        let frames = framer.push(tail).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            Message::decode(&frames[0]).unwrap(),
            Message::insert(r#"we{ird}"\"#, false)
        );
    }

    #[test]
    fn test_framer_rejects_garbage() {
        let mut framer = MessageFramer::new();
        assert!(framer.push(b"hello").is_err());
        assert!(framer.is_idle());
        assert_eq!(framer.push(br#"{"action":"status_query"}"#).unwrap().len(), 1);
    }
}
