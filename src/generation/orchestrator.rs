//! Single-flight text-to-motion runs.
//!
//! ```text
//! submit ──CAS──> Reserved ─> Connecting ─> Awaiting ─> Converting ─> Publishing ─> Idle
//!                    │             │            │             │             │
//!                    └─────────────┴────────────┴─────────────┴─────────────┴──> Idle (failed)
//! ```
//!
//! [`GenerationOrchestrator::submit`] runs on whichever thread handles the
//! request and only reserves the slot. The run itself is marshalled to the
//! event context, where [`run_dispatcher`] spawns it. The slot is released
//! when the run's [`SlotGuard`] drops, which also happens on panic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::upstream::{BackendReply, GenerateRequest, MotionBackend};
use crate::broadcasting::{HubHandle, StatusState, ViewerMessage};
use crate::error::{FormatError, UpstreamError};
use crate::library::ArtifactLibrary;
use crate::motion::ClipConverter;

/// Stages of a run, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Reserved,
    Connecting,
    Awaiting,
    Converting,
    Publishing,
}

/// Outcome of [`GenerationOrchestrator::submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    /// Another run holds the slot.
    Busy,
    /// The event context is gone.
    Unavailable,
}

/// Ownership of the generation slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct SlotGuard {
    slot: Arc<AtomicBool>,
}

impl SlotGuard {
    fn reserve(slot: &Arc<AtomicBool>) -> Option<Self> {
        slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                slot: Arc::clone(slot),
            })
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
    }
}

/// An accepted request on its way to the event context.
#[derive(Debug)]
pub struct GenerationJob {
    pub request: GenerateRequest,
    slot: SlotGuard,
}

/// Submission side of the orchestrator. Cheap to clone.
#[derive(Debug, Clone)]
pub struct GenerationOrchestrator {
    slot: Arc<AtomicBool>,
    jobs: mpsc::UnboundedSender<GenerationJob>,
}

/// Creates the orchestrator and the job queue [`run_dispatcher`] drains.
pub fn channel() -> (GenerationOrchestrator, mpsc::UnboundedReceiver<GenerationJob>) {
    let (jobs, queue) = mpsc::unbounded_channel();
    let orchestrator = GenerationOrchestrator {
        slot: Arc::new(AtomicBool::new(false)),
        jobs,
    };
    (orchestrator, queue)
}

impl GenerationOrchestrator {
    /// Reserves the slot and queues a run. Never blocks.
    pub fn submit(&self, text: impl Into<String>, length: f64, steps: u32) -> Submission {
        let Some(slot) = SlotGuard::reserve(&self.slot) else {
            return Submission::Busy;
        };

        let job = GenerationJob {
            request: GenerateRequest::new(text, length, steps),
            slot,
        };
        match self.jobs.send(job) {
            Ok(()) => Submission::Accepted,
            // The returned job drops here and frees the slot.
            Err(_) => {
                warn!("Generation dispatcher is not running");
                Submission::Unavailable
            }
        }
    }

    pub fn is_busy(&self) -> bool {
        self.slot.load(Ordering::Acquire)
    }
}

/// What a run needs from the rest of the bridge.
pub struct GenerationContext {
    pub hub: HubHandle,
    pub backend: Arc<dyn MotionBackend>,
    pub converter: Arc<ClipConverter>,
    pub library: ArtifactLibrary,
}

/// A run that ended early. The display text is the viewer-facing status.
#[derive(Debug, Error)]
enum RunError {
    #[error("Failed to connect to motion server: {0}")]
    Connect(UpstreamError),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Generation failed: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Generation failed: {0}")]
    Format(#[from] FormatError),

    #[error("Generation failed: {0}")]
    Persist(#[from] std::io::Error),
}

/// Drains the job queue, running each job as its own task. Must run on the
/// event context.
pub async fn run_dispatcher(mut queue: mpsc::UnboundedReceiver<GenerationJob>, ctx: Arc<GenerationContext>) {
    while let Some(job) = queue.recv().await {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let text = job.request.text.clone();
            let run = tokio::spawn(Arc::clone(&ctx).run(job));
            if let Err(e) = run.await {
                error!(text = %text, error = %e, "Generation task aborted");
                ctx.hub.publish(ViewerMessage::status(
                    StatusState::Error,
                    format!("Generation failed: {}", e),
                ));
            }
        });
    }
    info!("Generation dispatcher stopped");
}

impl GenerationContext {
    /// Runs one job to completion and reports the outcome to viewers.
    pub async fn run(self: Arc<Self>, job: GenerationJob) {
        let GenerationJob { request, slot } = job;

        match self.drive(&request).await {
            Ok(stem) => info!(text = %request.text, artifact = %stem, "Generation finished"),
            Err(e) => {
                match &e {
                    RunError::Server(_) => warn!(text = %request.text, error = %e, "Motion server rejected request"),
                    _ => error!(text = %request.text, error = %e, "Generation run failed"),
                }
                self.hub.publish(ViewerMessage::status(StatusState::Error, e.to_string()));
            }
        }

        drop(slot);
    }

    async fn drive(&self, request: &GenerateRequest) -> Result<String, RunError> {
        let text = &request.text;
        let mut stage = Stage::Reserved;
        info!(text = %text, seed = request.seed, ?stage, "Generation started");
        self.status(StatusState::Generating, format!("Generating: '{}'", text));

        stage = Stage::Connecting;
        debug!(?stage, "Connecting to motion server");
        let mut session = self.backend.connect().await.map_err(RunError::Connect)?;

        stage = Stage::Awaiting;
        info!(?stage, "Sending generation request");
        let reply = async {
            session.send(request).await?;
            self.status(StatusState::Generating, "Waiting for server response...");
            session.recv().await
        }
        .await;
        session.close().await;

        let payload = match reply? {
            BackendReply::Motion(payload) => payload,
            BackendReply::Error(message) => return Err(RunError::Server(message)),
        };

        stage = Stage::Converting;
        info!(?stage, bytes = payload.len(), "Received motion payload");
        self.status(StatusState::Generating, "Converting motion data...");
        let clip = self.converter.decode_bytes(&payload)?;

        stage = Stage::Publishing;
        let stem = self.library.persist_generated(&clip)?;
        info!(?stage, frames = clip.frame_count(), artifact = %stem, "Publishing generated motion");
        self.hub.publish(ViewerMessage::motion(
            format!("[T2M] {}", text),
            clip.to_web_clip(),
            Some(stem.clone()),
        ));
        self.status(StatusState::Done, format!("Done: '{}'", text));

        Ok(stem)
    }

    fn status(&self, state: StatusState, message: impl Into<String>) {
        self.hub.publish(ViewerMessage::status(state, message));
    }
}
