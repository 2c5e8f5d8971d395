//! # Clip Converter
//!
//! Normalizes the three capture layouts the bridge receives into one
//! [`MotionClip`]:
//!
//! | Layout | Detected by | Joint order | Root quaternion |
//! |--------|-------------|-------------|-----------------|
//! | Canonical | `dof_pos` | canonical | `x, y, z, w` |
//! | Body frame | `joint_pos` + `body_pos_w` | interleaved | `w, x, y, z` (body 0) |
//! | Flat root | `joint_pos` + `root_pos` | interleaved | `w, x, y, z` |
//!
//! Detection is a closed decode into [`RawCapture`]; anything else is a
//! [`FormatError`]. Conversion itself is pure: joint columns are gathered
//! through the [`JointPermutation`] and quaternion components are reordered,
//! never renormalized.

use std::path::Path;

use ndarray::{Array2, Array3, Axis, Ix2, Ix3};
use serde::{Deserialize, Serialize};

use crate::error::FormatError;
use crate::motion::joints::JointPermutation;
use crate::motion::npz::{NpyArray, NpzArchive};

/// Column gather turning `w, x, y, z` into `x, y, z, w`.
const SCALAR_LAST: [usize; 4] = [1, 2, 3, 0];

/// Column gather turning `x, y, z, w` into `w, x, y, z`.
const SCALAR_FIRST: [usize; 4] = [3, 0, 1, 2];

/// Moves the scalar component of a `w, x, y, z` quaternion to the end.
pub fn to_scalar_last(q: [f32; 4]) -> [f32; 4] {
    [q[1], q[2], q[3], q[0]]
}

/// Moves the scalar component of an `x, y, z, w` quaternion to the front.
pub fn to_scalar_first(q: [f32; 4]) -> [f32; 4] {
    [q[3], q[0], q[1], q[2]]
}

/// The canonical motion record every input is normalized into.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionClip {
    /// Joint angles, F x J, canonical joint order.
    pub dof_pos: Array2<f32>,
    /// Root translation, F x 3.
    pub root_pos: Array2<f32>,
    /// Root orientation, F x 4, scalar-last.
    pub root_rot: Array2<f32>,
    pub fps: u32,
    pub joint_names: Vec<String>,
}

impl MotionClip {
    pub fn frame_count(&self) -> usize {
        self.dof_pos.nrows()
    }

    pub fn joint_count(&self) -> usize {
        self.dof_pos.ncols()
    }

    /// The viewer representation: nested rows with scalar-first quaternions.
    pub fn to_web_clip(&self) -> WebClip {
        WebClip {
            joint_pos: rows(&self.dof_pos),
            root_pos: rows(&self.root_pos),
            root_quat: rows(&self.root_rot.select(Axis(1), &SCALAR_FIRST)),
        }
    }

    /// The on-disk artifact layout (`fps`, `dof_pos`, `root_pos`, `root_rot`,
    /// `joint_names`).
    pub fn to_npz(&self) -> NpzArchive {
        let mut archive = NpzArchive::new();
        archive.insert("fps", NpyArray::scalar_f32(self.fps as f32));
        archive.insert("dof_pos", NpyArray::matrix_f32(&self.dof_pos));
        archive.insert("root_pos", NpyArray::matrix_f32(&self.root_pos));
        archive.insert("root_rot", NpyArray::matrix_f32(&self.root_rot));
        archive.insert("joint_names", NpyArray::strings(&self.joint_names));
        archive
    }
}

fn rows(matrix: &Array2<f32>) -> Vec<Vec<f32>> {
    matrix.outer_iter().map(|row| row.to_vec()).collect()
}

/// Clip payload of a `motion` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebClip {
    /// F x J joint angles.
    pub joint_pos: Vec<Vec<f32>>,
    /// F x 3 root translation.
    pub root_pos: Vec<Vec<f32>>,
    /// F x 4 root orientation, scalar-first.
    pub root_quat: Vec<Vec<f32>>,
}

impl WebClip {
    /// Checks that an externally supplied clip is rectangular and consistent.
    pub fn check_shape(&self) -> Result<(), FormatError> {
        let frames = self.joint_pos.len();
        let joints = self.joint_pos.first().map_or(0, Vec::len);

        let fields: [(&'static str, &Vec<Vec<f32>>, usize); 3] = [
            ("joint_pos", &self.joint_pos, joints),
            ("root_pos", &self.root_pos, 3),
            ("root_quat", &self.root_quat, 4),
        ];
        for (field, values, width) in fields {
            if values.len() != frames {
                return Err(FormatError::FrameMismatch {
                    field,
                    expected: frames,
                    found: values.len(),
                });
            }
            if let Some(row) = values.iter().find(|row| row.len() != width) {
                return Err(FormatError::BadShape {
                    field,
                    expected: format!("{} values per frame", width),
                    found: vec![values.len(), row.len()],
                });
            }
        }
        Ok(())
    }
}

/// A decoded capture, tagged by the layout it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCapture {
    Canonical {
        dof_pos: Array2<f32>,
        root_pos: Array2<f32>,
        root_rot: Array2<f32>,
        joint_names: Option<Vec<String>>,
        fps: f64,
    },
    BodyFrame {
        joint_pos: Array2<f32>,
        body_pos_w: Array3<f32>,
        body_quat_w: Array3<f32>,
        fps: f64,
    },
    FlatRoot {
        joint_pos: Array2<f32>,
        root_pos: Array2<f32>,
        root_rot: Array2<f32>,
        fps: f64,
    },
}

impl RawCapture {
    pub fn layout(&self) -> &'static str {
        match self {
            Self::Canonical { .. } => "canonical",
            Self::BodyFrame { .. } => "body-frame",
            Self::FlatRoot { .. } => "flat-root",
        }
    }

    /// Detects the layout of an archive by field presence.
    ///
    /// The canonical layout wins when `dof_pos` is present; otherwise
    /// `joint_pos` with `body_pos_w` beats `joint_pos` with `root_pos`.
    pub fn detect(archive: &NpzArchive) -> Result<Self, FormatError> {
        if archive.contains("dof_pos") {
            const LAYOUT: &str = "canonical";
            let joint_names = archive
                .get("joint_names")
                .and_then(NpyArray::as_strings)
                .map(<[String]>::to_vec);
            Ok(Self::Canonical {
                dof_pos: matrix(archive, LAYOUT, "dof_pos")?,
                root_pos: matrix(archive, LAYOUT, "root_pos")?,
                root_rot: matrix(archive, LAYOUT, "root_rot")?,
                joint_names,
                fps: fps(archive, LAYOUT)?,
            })
        } else if archive.contains("joint_pos") && archive.contains("body_pos_w") {
            const LAYOUT: &str = "body-frame";
            Ok(Self::BodyFrame {
                joint_pos: matrix(archive, LAYOUT, "joint_pos")?,
                body_pos_w: tensor(archive, LAYOUT, "body_pos_w")?,
                body_quat_w: tensor(archive, LAYOUT, "body_quat_w")?,
                fps: fps(archive, LAYOUT)?,
            })
        } else if archive.contains("joint_pos") && archive.contains("root_pos") {
            const LAYOUT: &str = "flat-root";
            Ok(Self::FlatRoot {
                joint_pos: matrix(archive, LAYOUT, "joint_pos")?,
                root_pos: matrix(archive, LAYOUT, "root_pos")?,
                root_rot: matrix(archive, LAYOUT, "root_rot")?,
                fps: fps(archive, LAYOUT)?,
            })
        } else {
            Err(FormatError::UnrecognizedShape {
                fields: archive.keys(),
            })
        }
    }
}

fn field<'a>(archive: &'a NpzArchive, layout: &'static str, name: &'static str) -> Result<&'a NpyArray, FormatError> {
    archive.get(name).ok_or(FormatError::MissingField {
        shape: layout,
        field: name,
    })
}

fn matrix(archive: &NpzArchive, layout: &'static str, name: &'static str) -> Result<Array2<f32>, FormatError> {
    let array = field(archive, layout, name)?;
    array
        .to_f32(name)?
        .into_dimensionality::<Ix2>()
        .map_err(|_| FormatError::BadShape {
            field: name,
            expected: "a 2-D array".to_string(),
            found: array.shape.clone(),
        })
}

fn tensor(archive: &NpzArchive, layout: &'static str, name: &'static str) -> Result<Array3<f32>, FormatError> {
    let array = field(archive, layout, name)?;
    array
        .to_f32(name)?
        .into_dimensionality::<Ix3>()
        .map_err(|_| FormatError::BadShape {
            field: name,
            expected: "a 3-D array".to_string(),
            found: array.shape.clone(),
        })
}

fn fps(archive: &NpzArchive, layout: &'static str) -> Result<f64, FormatError> {
    let array = field(archive, layout, "fps")?;
    array.scalar().ok_or_else(|| FormatError::BadShape {
        field: "fps",
        expected: "a numeric scalar".to_string(),
        found: array.shape.clone(),
    })
}

/// Stateless normalizer built around a fixed joint permutation.
#[derive(Debug, Clone)]
pub struct ClipConverter {
    permutation: JointPermutation,
}

impl ClipConverter {
    pub fn new(permutation: JointPermutation) -> Self {
        Self { permutation }
    }

    /// Converter for the 29-joint humanoid.
    pub fn humanoid() -> Self {
        Self::new(JointPermutation::humanoid())
    }

    pub fn permutation(&self) -> &JointPermutation {
        &self.permutation
    }

    /// Decodes and normalizes the bytes of an `.npz` payload.
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<MotionClip, FormatError> {
        let archive = NpzArchive::from_bytes(bytes)?;
        self.normalize(RawCapture::detect(&archive)?)
    }

    /// Decodes and normalizes an `.npz` file.
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<MotionClip, FormatError> {
        let archive = NpzArchive::open(path)?;
        self.normalize(RawCapture::detect(&archive)?)
    }

    /// Converts a detected capture into the canonical clip.
    pub fn normalize(&self, raw: RawCapture) -> Result<MotionClip, FormatError> {
        let canonical_names = self.permutation.canonical_names();

        match raw {
            RawCapture::Canonical {
                dof_pos,
                root_pos,
                root_rot,
                joint_names,
                fps,
            } => {
                let joint_names = match joint_names {
                    Some(names) if !names.is_empty() => {
                        if names != canonical_names {
                            return Err(FormatError::JointNames);
                        }
                        names
                    }
                    // Absent and empty lists both get the canonical names.
                    _ => canonical_names.to_vec(),
                };
                self.assemble(dof_pos, root_pos, root_rot, fps, joint_names)
            }
            RawCapture::BodyFrame {
                joint_pos,
                body_pos_w,
                body_quat_w,
                fps,
            } => {
                check_bodies("body_pos_w", &body_pos_w, 3)?;
                check_bodies("body_quat_w", &body_quat_w, 4)?;

                let dof_pos = self.reorder_joints(&joint_pos)?;
                let root_pos = body_pos_w.index_axis(Axis(1), 0).to_owned();
                let root_rot = scalar_first_to_last("body_quat_w", &body_quat_w.index_axis(Axis(1), 0).to_owned())?;
                self.assemble(dof_pos, root_pos, root_rot, fps, canonical_names.to_vec())
            }
            RawCapture::FlatRoot {
                joint_pos,
                root_pos,
                root_rot,
                fps,
            } => {
                let dof_pos = self.reorder_joints(&joint_pos)?;
                let root_rot = scalar_first_to_last("root_rot", &root_rot)?;
                self.assemble(dof_pos, root_pos, root_rot, fps, canonical_names.to_vec())
            }
        }
    }

    fn reorder_joints(&self, joint_pos: &Array2<f32>) -> Result<Array2<f32>, FormatError> {
        check_columns("joint_pos", joint_pos, self.permutation.len())?;
        Ok(joint_pos.select(Axis(1), self.permutation.indices()))
    }

    fn assemble(
        &self,
        dof_pos: Array2<f32>,
        root_pos: Array2<f32>,
        root_rot: Array2<f32>,
        fps: f64,
        joint_names: Vec<String>,
    ) -> Result<MotionClip, FormatError> {
        check_columns("dof_pos", &dof_pos, self.permutation.len())?;
        check_columns("root_pos", &root_pos, 3)?;
        check_columns("root_rot", &root_rot, 4)?;

        let frames = dof_pos.nrows();
        for (field, found) in [("root_pos", root_pos.nrows()), ("root_rot", root_rot.nrows())] {
            if found != frames {
                return Err(FormatError::FrameMismatch {
                    field,
                    expected: frames,
                    found,
                });
            }
        }

        Ok(MotionClip {
            dof_pos,
            root_pos,
            root_rot,
            fps: validate_fps(fps)?,
            joint_names,
        })
    }
}

/// Integer frame rate, truncated toward zero; must end up positive.
fn validate_fps(fps: f64) -> Result<u32, FormatError> {
    let whole = fps.trunc();
    if !fps.is_finite() || whole < 1.0 || whole > f64::from(u32::MAX) {
        return Err(FormatError::InvalidFps(fps));
    }
    Ok(whole as u32)
}

fn check_columns(field: &'static str, matrix: &Array2<f32>, width: usize) -> Result<(), FormatError> {
    if matrix.ncols() != width {
        return Err(FormatError::BadShape {
            field,
            expected: format!("F x {}", width),
            found: matrix.shape().to_vec(),
        });
    }
    Ok(())
}

fn check_bodies(field: &'static str, tensor: &Array3<f32>, width: usize) -> Result<(), FormatError> {
    let shape = tensor.shape();
    if shape[1] == 0 || shape[2] != width {
        return Err(FormatError::BadShape {
            field,
            expected: format!("F x B x {} with at least one body", width),
            found: shape.to_vec(),
        });
    }
    Ok(())
}

fn scalar_first_to_last(field: &'static str, quats: &Array2<f32>) -> Result<Array2<f32>, FormatError> {
    check_columns(field, quats, 4)?;
    Ok(quats.select(Axis(1), &SCALAR_LAST))
}
