//! # Motion Data Module
//!
//! Everything needed to turn a capture payload into the canonical clip the
//! viewers and the artifact library share.
//!
//! ## Sub-modules
//! *   `npz`: `.npz` / `.npy` container codec.
//! *   `joints`: the two humanoid joint orderings and the permutation between them.
//! *   `converter`: layout detection and normalization into [`MotionClip`].

pub mod converter;
pub mod joints;
pub mod npz;

pub use converter::{ClipConverter, MotionClip, RawCapture, WebClip};
pub use joints::JointPermutation;
