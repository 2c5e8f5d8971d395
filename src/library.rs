//! # Artifact Library
//!
//! The on-disk collection of `.npz` clips the viewers can load.
//!
//! ## Layout
//! ```text
//! <data_dir>/
//!   saved/       clips kept under a permanent name
//!   generated/   gen_<YYYYmmdd_HHMMSS>.npz from text-to-motion runs
//!   dataset/     reference captures dropped in by hand
//! ```
//!
//! Generated clips get timestamp names and saved clips are written only after
//! an existence check (with an explicit overwrite flag), so no two code paths
//! ever write the same file concurrently.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::motion::{ClipConverter, MotionClip};

const ARTIFACT_EXTENSION: &str = "npz";

/// Prefix of clips written by the generation orchestrator.
const GENERATED_PREFIX: &str = "gen_";

/// Characters stripped from a user-supplied save name.
const FORBIDDEN_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// One of the three artifact folders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    Saved,
    Generated,
    Dataset,
}

impl Folder {
    /// Display order of the load picker.
    pub const ALL: [Folder; 3] = [Folder::Saved, Folder::Generated, Folder::Dataset];

    pub fn dir_name(self) -> &'static str {
        match self {
            Folder::Saved => "saved",
            Folder::Generated => "generated",
            Folder::Dataset => "dataset",
        }
    }

    /// Parses a folder tag; absent or unknown tags mean `generated`.
    pub fn from_tag(tag: Option<&str>) -> Self {
        match tag.map(str::trim) {
            Some("saved") => Folder::Saved,
            Some("dataset") => Folder::Dataset,
            _ => Folder::Generated,
        }
    }
}

/// An entry of the load picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub name: String,
    pub folder: Folder,
}

/// Handle to the data directory.
#[derive(Debug, Clone)]
pub struct ArtifactLibrary {
    root: PathBuf,
}

impl ArtifactLibrary {
    /// Opens the library at `root`, creating the three folders if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> std::io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        for folder in Folder::ALL {
            fs::create_dir_all(root.join(folder.dir_name()))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn folder_path(&self, folder: Folder) -> PathBuf {
        self.root.join(folder.dir_name())
    }

    /// Every clip of every folder; folders in [`Folder::ALL`] order, names
    /// sorted case-insensitively within a folder.
    pub fn list(&self) -> Vec<ArtifactEntry> {
        Folder::ALL
            .iter()
            .flat_map(|&folder| {
                self.stems(folder, |_| true)
                    .into_iter()
                    .map(move |name| ArtifactEntry { name, folder })
            })
            .collect()
    }

    fn stems(&self, folder: Folder, keep: impl Fn(&str) -> bool) -> Vec<String> {
        let dir = self.folder_path(folder);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to read artifact folder");
                return Vec::new();
            }
        };

        let mut stems: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == ARTIFACT_EXTENSION))
            .filter_map(|path| path.file_stem().map(|stem| stem.to_string_lossy().into_owned()))
            .filter(|stem| keep(stem))
            .collect();

        stems.sort_by(|a, b| a.to_lowercase().cmp(&b.to_lowercase()).then_with(|| a.cmp(b)));
        stems
    }

    /// Path of `<folder>/<name>.npz`. Names that could escape the folder are
    /// rejected.
    pub fn locate(&self, folder: Folder, name: &str) -> BridgeResult<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
            return Err(BridgeError::Validation(format!("invalid name: {}", name)));
        }
        Ok(self
            .folder_path(folder)
            .join(format!("{}.{}", name, ARTIFACT_EXTENSION)))
    }

    /// Loads and normalizes a stored clip.
    ///
    /// # Errors
    /// `NotFound` naming the clip when the file is absent, `Format` when it
    /// cannot be converted.
    pub fn load(&self, folder: Folder, name: &str, converter: &ClipConverter) -> BridgeResult<MotionClip> {
        let path = self.locate(folder, name)?;
        if !path.is_file() {
            return Err(BridgeError::NotFound(format!("not found: {}", name)));
        }
        Ok(converter.load_file(&path)?)
    }

    /// Writes a generated clip as `generated/gen_<timestamp>.npz` and returns
    /// its stem. A clip finishing in the same second as an existing one gets a
    /// `_1`, `_2`, ... suffix instead of replacing it.
    pub fn persist_generated(&self, clip: &MotionClip) -> std::io::Result<String> {
        let base = format!("{}{}", GENERATED_PREFIX, Local::now().format("%Y%m%d_%H%M%S"));
        let (stem, path) = claim_stem(&self.folder_path(Folder::Generated), &base)?;
        clip.to_npz().write_to(&path)?;
        info!(path = %path.display(), "Saved generated clip");
        Ok(stem)
    }

    /// Copies `generated/<source>.npz` to `saved/<name>.npz` and returns the
    /// sanitized name.
    ///
    /// # Errors
    /// `Validation` for empty or unusable names, `NotFound` for a missing
    /// source, `Conflict` when the destination exists and `overwrite` is off.
    pub fn save(&self, name: &str, source: &str, overwrite: bool) -> BridgeResult<String> {
        let name = name.trim().trim_end_matches('.').trim();
        let source = source.trim();
        if name.is_empty() || source.is_empty() {
            return Err(BridgeError::Validation("need 'name' and 'source'".to_string()));
        }

        let source_path = self.locate(Folder::Generated, source)?;
        if !source_path.is_file() {
            return Err(BridgeError::NotFound(format!("source not found: {}", source)));
        }

        let safe_name: String = name.chars().filter(|c| !FORBIDDEN_NAME_CHARS.contains(c)).collect();
        let safe_name = safe_name.trim();
        if safe_name.is_empty() || safe_name == "." || safe_name == ".." {
            return Err(BridgeError::Validation("invalid name".to_string()));
        }

        let destination = self.locate(Folder::Saved, safe_name)?;
        if destination.exists() && !overwrite {
            return Err(BridgeError::Conflict("exists".to_string()));
        }

        fs::copy(&source_path, &destination)?;
        info!(name = safe_name, source, "Saved clip to library");
        Ok(safe_name.to_string())
    }

    /// Deletes every `generated/gen_*.npz` and returns how many matched.
    pub fn clear_generated(&self) -> usize {
        let stems = self.stems(Folder::Generated, |stem| stem.starts_with(GENERATED_PREFIX));
        let dir = self.folder_path(Folder::Generated);

        for stem in &stems {
            let path = dir.join(format!("{}.{}", stem, ARTIFACT_EXTENSION));
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Failed to delete generated clip");
            }
        }

        info!(count = stems.len(), "Cleared generated clips");
        stems.len()
    }
}

/// Atomically creates an empty `<dir>/<base>[_n].npz` that no other file
/// occupies and returns its stem and path.
fn claim_stem(dir: &Path, base: &str) -> std::io::Result<(String, PathBuf)> {
    for attempt in 0u32.. {
        let stem = match attempt {
            0 => base.to_string(),
            n => format!("{}_{}", base, n),
        };
        let path = dir.join(format!("{}.{}", stem, ARTIFACT_EXTENSION));
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok((stem, path)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(std::io::Error::other(format!("no free artifact name for {}", base)))
}
