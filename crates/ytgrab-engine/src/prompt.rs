//! Prompt broker: correlates duplicate-on-disk events with operator
//! responses. A non-interactive worker parks on [`PromptBroker::ask`] while
//! an interactive client (web UI, CLI) answers through
//! [`PromptBroker::resolve`]; silence defaults to the safe choice.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::bus::JobPublisher;
use crate::error::DownloadError;

/// Operator's answer to a duplicate prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Resolution {
    Overwrite,
    Skip,
    RenameAuto,
    #[serde(rename_all = "camelCase")]
    Rename { new_name: String },
}

enum PromptState {
    Waiting {
        tx: oneshot::Sender<Resolution>,
        job_id: String,
    },
    Resolved,
}

struct Inner {
    prompts: Mutex<HashMap<String, PromptState>>,
    timeout: Duration,
}

/// Correlation table between pending prompts and their answers.
#[derive(Clone)]
pub struct PromptBroker {
    inner: Arc<Inner>,
}

impl PromptBroker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                prompts: Mutex::new(HashMap::new()),
                timeout,
            }),
        }
    }

    /// Raise a duplicate prompt and wait for its resolution.
    ///
    /// Emits `duplicate` on the bus, then parks until the prompt is
    /// resolved, the job is cancelled, or the deadline fires; the latter
    /// two default to [`Resolution::Skip`]. Always emits
    /// `duplicate-resolved` before returning.
    pub async fn ask(
        &self,
        publisher: &JobPublisher,
        path: &Path,
        token: &CancellationToken,
    ) -> Resolution {
        let prompt_id = Uuid::new_v4().to_string();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let (tx, rx) = oneshot::channel();

        self.inner.prompts.lock().insert(
            prompt_id.clone(),
            PromptState::Waiting {
                tx,
                job_id: publisher.job_id().to_string(),
            },
        );
        publisher.duplicate(&prompt_id, &path.to_string_lossy(), &filename);

        let resolution = tokio::select! {
            answer = rx => answer.unwrap_or(Resolution::Skip),
            _ = token.cancelled() => {
                debug!(prompt_id = %prompt_id, "prompt abandoned by cancellation");
                Resolution::Skip
            }
            _ = tokio::time::sleep(self.inner.timeout) => {
                debug!(prompt_id = %prompt_id, "prompt deadline fired, defaulting to skip");
                Resolution::Skip
            }
        };

        // The waiting entry becomes a tombstone so later `resolve` calls
        // stay idempotent instead of reporting an unknown id.
        self.inner
            .prompts
            .lock()
            .insert(prompt_id.clone(), PromptState::Resolved);
        publisher.duplicate_resolved(&prompt_id);
        resolution
    }

    /// Deliver an operator response. The first resolution wins; repeats
    /// are accepted and ignored. Unknown ids are an error.
    pub fn resolve(&self, prompt_id: &str, resolution: Resolution) -> Result<(), DownloadError> {
        let mut prompts = self.inner.prompts.lock();
        match prompts.get_mut(prompt_id) {
            Some(state @ PromptState::Waiting { .. }) => {
                let previous = std::mem::replace(state, PromptState::Resolved);
                if let PromptState::Waiting { tx, .. } = previous {
                    // A dropped receiver means ask() already timed out; the
                    // tombstone stays and the response is a no-op.
                    let _ = tx.send(resolution);
                }
                Ok(())
            }
            Some(PromptState::Resolved) => Ok(()),
            None => Err(DownloadError::UnknownPrompt {
                prompt_id: prompt_id.to_string(),
            }),
        }
    }

    /// Drop all prompt state belonging to a finished job.
    pub fn forget_job(&self, job_id: &str) {
        self.inner.prompts.lock().retain(|_, state| match state {
            PromptState::Waiting { job_id: owner, .. } => owner != job_id,
            // Tombstones cannot be attributed once resolved; they are
            // cheap and cleared wholesale when no prompt is waiting.
            PromptState::Resolved => false,
        });
    }
}
