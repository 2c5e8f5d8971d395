//! # Generation Module
//!
//! Text-to-motion runs against the remote generation server.
//!
//! - [`upstream`]: the request/reply protocol and the [`MotionBackend`] seam,
//!   with [`TunnelBackend`] dialing the local end of the SSH tunnel.
//! - [`orchestrator`]: the single-flight slot and the staged run that turns a
//!   reply into a broadcast clip and a `generated/` artifact.

pub mod orchestrator;
pub mod upstream;

pub use orchestrator::{channel, run_dispatcher, GenerationContext, GenerationOrchestrator, Submission};
pub use upstream::{BackendReply, GenerateRequest, MotionBackend, MotionSession, TunnelBackend};
