#![allow(dead_code)]

use std::time::Duration;

use ndarray::Array2;
use serde_json::Value;

use motion_bridge_lib::broadcasting::Viewer;
use motion_bridge_lib::motion::joints::CANONICAL_JOINT_ORDER;
use motion_bridge_lib::motion::MotionClip;

/// A canonical clip whose values encode (frame, column).
pub fn sample_clip(frames: usize) -> MotionClip {
    MotionClip {
        dof_pos: Array2::from_shape_fn((frames, 29), |(f, j)| f as f32 + j as f32 / 100.0),
        root_pos: Array2::from_shape_fn((frames, 3), |(f, c)| f as f32 * 0.1 + c as f32),
        root_rot: Array2::from_shape_fn((frames, 4), |(_, c)| [0.1, 0.2, 0.3, 0.9][c]),
        fps: 30,
        joint_names: CANONICAL_JOINT_ORDER.iter().map(|s| s.to_string()).collect(),
    }
}

/// Next frame delivered to `viewer`, parsed as JSON.
pub async fn next_message(viewer: &mut Viewer) -> Value {
    let frame = tokio::time::timeout(Duration::from_secs(5), viewer.recv())
        .await
        .expect("message within timeout")
        .expect("hub still running");
    serde_json::from_str(&frame).expect("valid json frame")
}
