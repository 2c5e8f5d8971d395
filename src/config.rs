//! Command-line configuration.
//!
//! The remote server port is not a flag. It lives in
//! [`crate::settings::RemotePortStore`] and changes through `POST /config`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Motion bridge CLI arguments
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root of the artifact library and tunnel record
    #[arg(long, default_value = "data")]
    pub data_dir: PathBuf,

    /// Viewer WebSocket bind host
    #[arg(long, default_value = "127.0.0.1")]
    pub ws_host: String,

    /// Viewer WebSocket bind port
    #[arg(long, default_value_t = 8765)]
    pub ws_port: u16,

    /// Control-plane HTTP bind host
    #[arg(long, default_value = "127.0.0.1")]
    pub http_host: String,

    /// Control-plane HTTP bind port
    #[arg(long, default_value_t = 8766)]
    pub http_port: u16,

    /// SSH host (or alias) running the generation server
    #[arg(long, default_value = "006")]
    pub tunnel_host: String,

    /// Local end of the SSH port-forward
    #[arg(long, default_value_t = 17000)]
    pub tunnel_local_port: u16,

    /// Forwarding executable
    #[arg(long, default_value = "ssh")]
    pub ssh_program: String,

    /// Seconds to wait for the generation server to accept a connection
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Seconds to wait for a generation reply
    #[arg(long, default_value_t = 600)]
    pub response_timeout_secs: u64,
}

impl Cli {
    pub fn ws_addr(&self) -> String {
        format!("{}:{}", self.ws_host, self.ws_port)
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http_host, self.http_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_viewer_page() {
        let cli = Cli::parse_from(["motion-bridge"]);
        assert_eq!(cli.data_dir, PathBuf::from("data"));
        assert_eq!(cli.ws_addr(), "127.0.0.1:8765");
        assert_eq!(cli.http_addr(), "127.0.0.1:8766");
        assert_eq!(cli.tunnel_host, "006");
        assert_eq!(cli.tunnel_local_port, 17000);
        assert_eq!(cli.ssh_program, "ssh");
        assert_eq!(cli.connect_timeout(), Duration::from_secs(10));
        assert_eq!(cli.response_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "motion-bridge",
            "--data-dir",
            "/tmp/clips",
            "--ws-port",
            "9000",
            "--tunnel-host",
            "gpu-box",
            "--response-timeout-secs",
            "30",
        ]);
        assert_eq!(cli.data_dir, PathBuf::from("/tmp/clips"));
        assert_eq!(cli.ws_port, 9000);
        assert_eq!(cli.tunnel_host, "gpu-box");
        assert_eq!(cli.response_timeout(), Duration::from_secs(30));
    }
}
