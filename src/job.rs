//! Client-side job handles
//!
//! A [`Job`] is created by the caller, handed to [`crate::Client::submit_job`],
//! and then updated by the client's reader task as WORK_* packets arrive.
//! Clones share state, so one clone can be awaited while another is inspected.

use crate::error::{Error, Result};
use crate::protocol::PacketType;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Queue priority band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Dispatched first
    High,
    /// Default band
    Normal,
    /// Dispatched last
    Low,
}

impl Priority {
    /// All bands, highest first
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Index into per-band arrays, 0 for HIGH
    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }

    /// Submission packet type for this band
    #[must_use]
    pub fn submit_packet(self, background: bool) -> PacketType {
        match (self, background) {
            (Priority::High, false) => PacketType::SubmitJobHigh,
            (Priority::High, true) => PacketType::SubmitJobHighBg,
            (Priority::Normal, false) => PacketType::SubmitJob,
            (Priority::Normal, true) => PacketType::SubmitJobBg,
            (Priority::Low, false) => PacketType::SubmitJobLow,
            (Priority::Low, true) => PacketType::SubmitJobLowBg,
        }
    }

    /// Band and background flag of a submission packet
    #[must_use]
    pub fn from_submit_packet(ptype: PacketType) -> Option<(Priority, bool)> {
        match ptype {
            PacketType::SubmitJobHigh => Some((Priority::High, false)),
            PacketType::SubmitJobHighBg => Some((Priority::High, true)),
            PacketType::SubmitJob => Some((Priority::Normal, false)),
            PacketType::SubmitJobBg => Some((Priority::Normal, true)),
            PacketType::SubmitJobLow => Some((Priority::Low, false)),
            PacketType::SubmitJobLowBg => Some((Priority::Low, true)),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Priority::High => "HIGH",
            Priority::Normal => "NORMAL",
            Priority::Low => "LOW",
        };
        f.write_str(name)
    }
}

/// Server-side status reported by GET_STATUS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobStatus {
    /// Server knows the handle
    pub known: bool,
    /// A worker holds the job
    pub running: bool,
    /// Progress numerator
    pub numerator: u64,
    /// Progress denominator
    pub denominator: u64,
}

/// Mutable part of a job, updated from the reader task
#[derive(Debug, Clone, Default)]
pub struct JobState {
    /// Submission has been started
    pub submitted: bool,
    /// Handle assigned by the server
    pub handle: Option<String>,
    /// Data chunks in arrival order (WORK_DATA and WORK_COMPLETE)
    pub data: Vec<Bytes>,
    /// WORK_WARNING chunks
    pub warnings: Vec<Bytes>,
    /// Last WORK_STATUS progress as (numerator, denominator)
    pub progress: Option<(u64, u64)>,
    /// Terminal state reached
    pub complete: bool,
    /// Worker sent WORK_FAIL
    pub failed: bool,
    /// Message from WORK_EXCEPTION
    pub exception: Option<String>,
}

struct JobInner {
    name: String,
    arguments: Bytes,
    unique: Option<String>,
    state: watch::Sender<JobState>,
}

/// A unit of work as seen by the submitting client
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl Job {
    /// Create a job for `name` with opaque arguments
    pub fn new(name: impl Into<String>, arguments: impl Into<Bytes>) -> Self {
        Self::build(name.into(), arguments.into(), None)
    }

    /// Create a job with a de-duplication token
    pub fn with_unique(
        name: impl Into<String>,
        arguments: impl Into<Bytes>,
        unique: impl Into<String>,
    ) -> Self {
        let unique = unique.into();
        let unique = if unique.is_empty() { None } else { Some(unique) };
        Self::build(name.into(), arguments.into(), unique)
    }

    /// Create a job whose arguments are text
    pub fn text(name: impl Into<String>, arguments: &str) -> Self {
        Self::new(name, Bytes::copy_from_slice(arguments.as_bytes()))
    }

    fn build(name: String, arguments: Bytes, unique: Option<String>) -> Self {
        let (state, _) = watch::channel(JobState::default());
        Self {
            inner: Arc::new(JobInner {
                name,
                arguments,
                unique,
                state,
            }),
        }
    }

    /// Function name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Argument payload
    #[must_use]
    pub fn arguments(&self) -> &Bytes {
        &self.inner.arguments
    }

    /// Unique token, if any
    #[must_use]
    pub fn unique(&self) -> Option<&str> {
        self.inner.unique.as_deref()
    }

    /// Server-assigned handle once submitted
    #[must_use]
    pub fn handle(&self) -> Option<String> {
        self.inner.state.borrow().handle.clone()
    }

    /// Whether a terminal packet has been received
    #[must_use]
    pub fn complete(&self) -> bool {
        self.inner.state.borrow().complete
    }

    /// Whether the worker reported WORK_FAIL
    #[must_use]
    pub fn failed(&self) -> bool {
        self.inner.state.borrow().failed
    }

    /// Exception message, if the worker reported one
    #[must_use]
    pub fn exception(&self) -> Option<String> {
        self.inner.state.borrow().exception.clone()
    }

    /// Data chunks received so far
    #[must_use]
    pub fn data(&self) -> Vec<Bytes> {
        self.inner.state.borrow().data.clone()
    }

    /// Data chunks decoded as text
    ///
    /// # Errors
    ///
    /// Returns a protocol error if a chunk is not valid UTF-8.
    pub fn data_text(&self) -> Result<Vec<String>> {
        self.inner
            .state
            .borrow()
            .data
            .iter()
            .map(|chunk| crate::protocol::bytes_to_string(chunk))
            .collect()
    }

    /// Snapshot of the whole mutable state
    #[must_use]
    pub fn state(&self) -> JobState {
        self.inner.state.borrow().clone()
    }

    /// Wait until a terminal packet arrives.
    ///
    /// Never resolves if the server connection drops first; wrap in
    /// `tokio::time::timeout` when that matters.
    pub async fn wait_complete(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|state| state.complete).await;
    }

    pub(crate) fn mark_submitted(&self) -> Result<()> {
        let mut result = Ok(());
        self.inner.state.send_if_modified(|state| {
            if state.submitted {
                result = Err(Error::AlreadySubmitted);
                return false;
            }
            state.submitted = true;
            true
        });
        result
    }

    /// Undo [`Job::mark_submitted`] after a failed send
    pub(crate) fn clear_submitted(&self) {
        self.inner.state.send_modify(|state| {
            if state.handle.is_none() {
                state.submitted = false;
            }
        });
    }

    pub(crate) fn set_handle(&self, handle: String) {
        self.inner.state.send_modify(|state| state.handle = Some(handle));
    }

    /// Apply a WORK_* payload (without the handle). Returns true if terminal.
    pub(crate) fn apply_work(&self, ptype: PacketType, payload: Bytes) -> bool {
        let mut terminal = false;
        self.inner.state.send_modify(|state| match ptype {
            PacketType::WorkData => state.data.push(payload),
            PacketType::WorkWarning => state.warnings.push(payload),
            PacketType::WorkStatus => {
                if let Some((num, den)) = parse_progress(&payload) {
                    state.progress = Some((num, den));
                }
            }
            PacketType::WorkComplete => {
                if !payload.is_empty() {
                    state.data.push(payload);
                }
                state.complete = true;
                terminal = true;
            }
            PacketType::WorkFail => {
                state.failed = true;
                state.complete = true;
                terminal = true;
            }
            PacketType::WorkException => {
                state.exception = Some(String::from_utf8_lossy(&payload).into_owned());
                state.complete = true;
                terminal = true;
            }
            _ => {}
        });
        terminal
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.inner.name)
            .field("unique", &self.inner.unique)
            .field("handle", &self.handle())
            .field("complete", &self.complete())
            .finish()
    }
}

/// Parse `numerator\0denominator`
pub(crate) fn parse_progress(payload: &[u8]) -> Option<(u64, u64)> {
    let pos = payload.iter().position(|b| *b == 0)?;
    let num = std::str::from_utf8(&payload[..pos]).ok()?.parse().ok()?;
    let den = std::str::from_utf8(&payload[pos + 1..]).ok()?.parse().ok()?;
    Some((num, den))
}
