//! # Settings Module
//!
//! Persists the remote generation-server port that the SSH tunnel forwards
//! to. The record is a small JSON file inside the data directory:
//!
//! ```json
//! { "remote_port": 8000 }
//! ```
//!
//! ## Failure Policy
//! A missing or corrupted file never stops the bridge: [`RemotePortStore::load`]
//! falls back to [`DEFAULT_REMOTE_PORT`] and logs a warning. Writes, on the
//! other hand, are reported to the caller so a reconfigure request can fail
//! loudly.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// The filename of the tunnel record within the data directory.
const TUNNEL_CONFIG_FILENAME: &str = "tunnel_config.json";

/// Port used when no record has been written yet.
pub const DEFAULT_REMOTE_PORT: u16 = 8000;

/// On-disk shape of the record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TunnelRecord {
    pub remote_port: u16,
}

/// Reads and writes the persisted remote port.
#[derive(Debug, Clone)]
pub struct RemotePortStore {
    path: PathBuf,
}

impl RemotePortStore {
    /// A store backed by `<data_dir>/tunnel_config.json`.
    pub fn in_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        Self {
            path: data_dir.as_ref().join(TUNNEL_CONFIG_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the stored port, or [`DEFAULT_REMOTE_PORT`] when the record is
    /// missing or unreadable.
    pub fn load(&self) -> u16 {
        if !self.path.exists() {
            return DEFAULT_REMOTE_PORT;
        }

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to open tunnel config");
                return DEFAULT_REMOTE_PORT;
            }
        };

        match serde_json::from_reader::<_, TunnelRecord>(BufReader::new(file)) {
            Ok(record) if record.remote_port != 0 => record.remote_port,
            Ok(_) => DEFAULT_REMOTE_PORT,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to parse tunnel config");
                DEFAULT_REMOTE_PORT
            }
        }
    }

    /// Writes `port`, creating the data directory if necessary.
    ///
    /// # Errors
    /// Returns an error if the directory or file cannot be written.
    pub fn save(&self, port: u16) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&self.path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &TunnelRecord { remote_port: port })?;
        writer.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_record_yields_default() {
        let dir = tempdir().expect("tempdir");
        assert_eq!(RemotePortStore::in_dir(dir.path()).load(), DEFAULT_REMOTE_PORT);
    }

    #[test]
    fn saved_port_is_read_back() {
        let dir = tempdir().expect("tempdir");
        let store = RemotePortStore::in_dir(dir.path().join("nested"));
        store.save(8123).expect("save");
        assert_eq!(store.load(), 8123);

        let raw = fs::read_to_string(store.path()).expect("read");
        assert_eq!(raw, r#"{"remote_port":8123}"#);
    }

    #[test]
    fn corrupted_record_yields_default() {
        let dir = tempdir().expect("tempdir");
        let store = RemotePortStore::in_dir(dir.path());
        fs::write(store.path(), "{ not json").expect("write");
        assert_eq!(store.load(), DEFAULT_REMOTE_PORT);
    }
}
