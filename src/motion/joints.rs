//! Joint orderings of the 29-DoF humanoid and the permutation between them.
//!
//! Captures recorded in the simulator list joints *interleaved* (left/right
//! alternating across the whole body), while every clip the bridge stores or
//! broadcasts uses the *canonical* order grouped by body segment.

use crate::error::FormatError;

/// Simulator order: left/right limbs alternate.
pub const INTERLEAVED_JOINT_ORDER: [&str; 29] = [
    "left_hip_pitch_joint",
    "right_hip_pitch_joint",
    "waist_yaw_joint",
    "left_hip_roll_joint",
    "right_hip_roll_joint",
    "waist_roll_joint",
    "left_hip_yaw_joint",
    "right_hip_yaw_joint",
    "waist_pitch_joint",
    "left_knee_joint",
    "right_knee_joint",
    "left_shoulder_pitch_joint",
    "right_shoulder_pitch_joint",
    "left_ankle_pitch_joint",
    "right_ankle_pitch_joint",
    "left_shoulder_roll_joint",
    "right_shoulder_roll_joint",
    "left_ankle_roll_joint",
    "right_ankle_roll_joint",
    "left_shoulder_yaw_joint",
    "right_shoulder_yaw_joint",
    "left_elbow_joint",
    "right_elbow_joint",
    "left_wrist_roll_joint",
    "right_wrist_roll_joint",
    "left_wrist_pitch_joint",
    "right_wrist_pitch_joint",
    "left_wrist_yaw_joint",
    "right_wrist_yaw_joint",
];

/// Dataset order: left leg, right leg, waist, left arm, right arm.
pub const CANONICAL_JOINT_ORDER: [&str; 29] = [
    "left_hip_pitch_joint",
    "left_hip_roll_joint",
    "left_hip_yaw_joint",
    "left_knee_joint",
    "left_ankle_pitch_joint",
    "left_ankle_roll_joint",
    "right_hip_pitch_joint",
    "right_hip_roll_joint",
    "right_hip_yaw_joint",
    "right_knee_joint",
    "right_ankle_pitch_joint",
    "right_ankle_roll_joint",
    "waist_yaw_joint",
    "waist_roll_joint",
    "waist_pitch_joint",
    "left_shoulder_pitch_joint",
    "left_shoulder_roll_joint",
    "left_shoulder_yaw_joint",
    "left_elbow_joint",
    "left_wrist_roll_joint",
    "left_wrist_pitch_joint",
    "left_wrist_yaw_joint",
    "right_shoulder_pitch_joint",
    "right_shoulder_roll_joint",
    "right_shoulder_yaw_joint",
    "right_elbow_joint",
    "right_wrist_roll_joint",
    "right_wrist_pitch_joint",
    "right_wrist_yaw_joint",
];

/// Bijection between interleaved and canonical joint indices.
///
/// `indices()[i]` is the interleaved position of canonical joint `i`, so a
/// frame is reordered with `canonical[i] = interleaved[indices()[i]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JointPermutation {
    forward: Vec<usize>,
    inverse: Vec<usize>,
    canonical_names: Vec<String>,
}

impl JointPermutation {
    /// Builds the permutation from two name lists.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Permutation`] when the lists differ in length,
    /// contain duplicates, or when a canonical name is missing from the
    /// interleaved list.
    pub fn new<S: AsRef<str>>(interleaved: &[S], canonical: &[S]) -> Result<Self, FormatError> {
        if interleaved.len() != canonical.len() {
            return Err(FormatError::Permutation(format!(
                "{} interleaved names vs {} canonical names",
                interleaved.len(),
                canonical.len()
            )));
        }

        let mut forward = Vec::with_capacity(canonical.len());
        let mut inverse = vec![usize::MAX; canonical.len()];

        for (canonical_idx, name) in canonical.iter().enumerate() {
            let name = name.as_ref();
            let source_idx = interleaved
                .iter()
                .position(|candidate| candidate.as_ref() == name)
                .ok_or_else(|| FormatError::Permutation(format!("'{}' missing from interleaved list", name)))?;
            if inverse[source_idx] != usize::MAX {
                return Err(FormatError::Permutation(format!("'{}' listed twice", name)));
            }
            inverse[source_idx] = canonical_idx;
            forward.push(source_idx);
        }

        Ok(Self {
            forward,
            inverse,
            canonical_names: canonical.iter().map(|s| s.as_ref().to_string()).collect(),
        })
    }

    /// The permutation for the 29-joint humanoid.
    pub fn humanoid() -> Self {
        let mut inverse = vec![0; CANONICAL_JOINT_ORDER.len()];
        let forward: Vec<usize> = CANONICAL_JOINT_ORDER
            .iter()
            .enumerate()
            .map(|(canonical_idx, name)| {
                let source_idx = INTERLEAVED_JOINT_ORDER
                    .iter()
                    .position(|candidate| candidate == name)
                    .unwrap_or(canonical_idx);
                inverse[source_idx] = canonical_idx;
                source_idx
            })
            .collect();

        Self {
            forward,
            inverse,
            canonical_names: CANONICAL_JOINT_ORDER.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.forward
    }

    pub fn inverse_indices(&self) -> &[usize] {
        &self.inverse
    }

    pub fn canonical_names(&self) -> &[String] {
        &self.canonical_names
    }

    /// Reorders one interleaved frame into canonical order.
    pub fn to_canonical<T: Copy>(&self, interleaved: &[T]) -> Vec<T> {
        self.forward.iter().map(|&src| interleaved[src]).collect()
    }

    /// Reorders one canonical frame back into interleaved order.
    pub fn to_interleaved<T: Copy>(&self, canonical: &[T]) -> Vec<T> {
        self.inverse.iter().map(|&src| canonical[src]).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanoid_matches_generic_construction() {
        let built = JointPermutation::new(&INTERLEAVED_JOINT_ORDER, &CANONICAL_JOINT_ORDER)
            .expect("lists are a permutation");
        assert_eq!(built, JointPermutation::humanoid());
    }

    #[test]
    fn humanoid_is_a_permutation() {
        let perm = JointPermutation::humanoid();
        let mut seen = perm.indices().to_vec();
        seen.sort_unstable();
        assert_eq!(seen, (0..29).collect::<Vec<_>>());
    }

    #[test]
    fn reorders_names_into_canonical_order() {
        let perm = JointPermutation::humanoid();
        assert_eq!(perm.to_canonical(&INTERLEAVED_JOINT_ORDER), CANONICAL_JOINT_ORDER.to_vec());
        assert_eq!(perm.to_interleaved(&CANONICAL_JOINT_ORDER), INTERLEAVED_JOINT_ORDER.to_vec());
    }

    #[test]
    fn forward_then_inverse_round_trips_any_frame_count() {
        let perm = JointPermutation::humanoid();
        for frames in [0usize, 1, 7, 30] {
            let clip: Vec<Vec<f32>> = (0..frames)
                .map(|f| (0..29).map(|j| (f * 100 + j) as f32 * 0.01).collect())
                .collect();
            let restored: Vec<Vec<f32>> = clip
                .iter()
                .map(|frame| perm.to_interleaved(&perm.to_canonical(frame)))
                .collect();
            assert_eq!(restored, clip);
        }
    }

    #[test]
    fn rejects_missing_and_duplicate_names() {
        let missing = JointPermutation::new(&["a", "b"], &["a", "c"]).unwrap_err();
        assert!(matches!(missing, FormatError::Permutation(_)));

        let duplicate = JointPermutation::new(&["a", "a"], &["a", "a"]).unwrap_err();
        assert!(matches!(duplicate, FormatError::Permutation(_)));

        let short = JointPermutation::new(&["a"], &["a", "b"]).unwrap_err();
        assert!(matches!(short, FormatError::Permutation(_)));
    }
}
