//! # eman
//!
//! Service broker binary: loads settings, installs logging and metrics, and
//! serves the broker until Ctrl-C.

#![deny(unsafe_code)]

mod logging;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use eman_server::config::ServerConfig;
use eman_server::server::{COMMUNICATION_PATH, EmanServer};
use eman_settings::EmanSettings;

/// Eman service broker.
#[derive(Parser, Debug)]
#[command(name = "eman", about = "Eman service broker")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.eman/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Handshake deadline in milliseconds (overrides settings).
    #[arg(long)]
    handshake_timeout_ms: Option<u64>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn load_settings(&self) -> Result<EmanSettings> {
        let mut settings = match &self.settings {
            Some(path) => eman_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => eman_settings::load_settings().context("Failed to load settings")?,
        };
        self.apply(&mut settings);
        eman_settings::loader::validate(&settings).context("Invalid settings")?;
        Ok(settings)
    }

    /// Flags win over every other layer.
    fn apply(&self, settings: &mut EmanSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(timeout) = self.handshake_timeout_ms {
            settings.handshake.timeout_ms = timeout;
        }
        if self.log_json {
            settings.logging.json = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load_settings()?;

    logging::init(&settings.logging)?;

    let metrics = match eman_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics disabled");
            None
        }
    };

    let server = EmanServer::new(ServerConfig::from(&settings), metrics);
    let (addr, serve) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Eman listening on http://{addr} (websocket at {COMMUNICATION_PATH})");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    let report = server.stop(serve, None).await;
    if report.is_clean() {
        tracing::info!("Shutdown complete");
    } else {
        tracing::warn!(aborted = ?report.aborted, "Shutdown forced");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn cli_defaults_leave_settings_alone() {
        let cli = Cli::parse_from(["eman"]);
        let mut settings = EmanSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 9001);
        assert_eq!(settings.handshake.timeout_ms, 2000);
        assert!(!settings.logging.json);
    }

    #[test]
    fn cli_overrides() {
        let cli = Cli::parse_from([
            "eman",
            "--host",
            "127.0.0.1",
            "--port",
            "8080",
            "--handshake-timeout-ms",
            "500",
            "--log-json",
        ]);
        let mut settings = EmanSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.handshake.timeout_ms, 500);
        assert!(settings.logging.json);
    }

    #[test]
    fn cli_settings_path() {
        let cli = Cli::parse_from(["eman", "--settings", "/tmp/eman.json"]);
        assert_eq!(cli.settings, Some(PathBuf::from("/tmp/eman.json")));
    }

    #[test]
    fn cli_rejects_bad_port() {
        assert!(Cli::try_parse_from(["eman", "--port", "99999"]).is_err());
    }

    #[test]
    fn load_settings_layers_file_then_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"server": {{"port": 7000, "host": "10.0.0.1"}}}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::parse_from(["eman", "--settings", path.as_str(), "--port", "7001"]);
        let settings = cli.load_settings().unwrap();
        assert_eq!(settings.server.port, 7001);
        assert_eq!(settings.server.host, "10.0.0.1");
    }

    #[test]
    fn zero_handshake_timeout_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.json");
        let cli = Cli::parse_from([
            "eman",
            "--settings",
            missing.to_str().unwrap(),
            "--handshake-timeout-ms",
            "0",
        ]);
        assert!(cli.load_settings().is_err());
    }
}
