//! Per-operation progress and cooperative cancellation.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Shared context carried through one long-running operation.
///
/// Orchestrators and peripherals report progress through it; callers poll
/// [`ProgressMonitor::snapshot`] and request cancellation with
/// [`ProgressMonitor::cancel`]. Cancellation is checked between discrete
/// steps, never mid-operation.
pub struct ProgressMonitor {
    topic: String,
    label_key: Mutex<String>,
    current: AtomicU32,
    target: AtomicU32,
    error: Mutex<Option<String>>,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
}

/// Point-in-time view of a [`ProgressMonitor`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub topic: String,
    pub label_key: String,
    pub current_amount: u32,
    pub target_amount: u32,
    pub cancelled: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl ProgressMonitor {
    pub fn new(topic: impl Into<String>, step: &str) -> Self {
        let topic = topic.into();
        let label_key = label_key(&topic, step);
        Self {
            topic,
            label_key: Mutex::new(label_key),
            current: AtomicU32::new(0),
            target: AtomicU32::new(0),
            error: Mutex::new(None),
            started_at: Utc::now(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Switches the label to `Progress.<topic>.<step>`.
    pub fn update_label(&self, step: &str) {
        let key = label_key(&self.topic, step);
        *self.label_key.lock().unwrap_or_else(PoisonError::into_inner) = key;
    }

    pub fn update_progress(&self, current: u32, target: u32) {
        self.target.store(target, Ordering::Relaxed);
        self.current.store(current, Ordering::Relaxed);
    }

    pub fn label(&self) -> String {
        self.label_key
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn current_amount(&self) -> u32 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn target_amount(&self) -> u32 {
        self.target.load(Ordering::Relaxed)
    }

    /// Records the message of the error that ended the operation.
    pub fn fail(&self, message: impl Into<String>) {
        *self.error.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.into());
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that fires when the operation is cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            topic: self.topic.clone(),
            label_key: self.label(),
            current_amount: self.current_amount(),
            target_amount: self.target_amount(),
            cancelled: self.is_cancelled(),
            error: self
                .error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            started_at: self.started_at,
        }
    }
}

impl fmt::Debug for ProgressMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressMonitor")
            .field("label_key", &self.label())
            .field("current", &self.current_amount())
            .field("target", &self.target_amount())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn label_key(topic: &str, step: &str) -> String {
    format!("Progress.{topic}.{step}")
}
