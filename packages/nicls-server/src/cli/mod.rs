use crate::config::{ConfigError, ExperimentConfig, ServerConfig};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// NICLS Server - closed-loop EEG classification backend
#[derive(Debug, Parser)]
#[command(name = "nicls-server")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address the task server binds to [env: NICLS_HOST]
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port the task server listens on [env: NICLS_PORT]
    #[arg(short, long, global = true)]
    pub port: Option<u16>,

    /// Base experiment configuration file (JSON) [env: NICLS_CONFIG]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Activity log file [env: NICLS_DATA_LOG]
    #[arg(long, global = true)]
    pub data_log: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the task server (default)
    Serve,

    /// Load, validate and print an experiment configuration
    CheckConfig,
}

impl Cli {
    /// Flags take precedence over environment values
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(path) = &self.config {
            config.experiment_config = Some(path.clone());
        }
        if let Some(path) = &self.data_log {
            config.data_log = path.clone();
        }
    }
}

/// Validated configuration from `path`, rendered as pretty JSON
pub fn check_config(path: &Path) -> Result<String, ConfigError> {
    let config = ExperimentConfig::load(path)?;
    config.validate()?;
    Ok(serde_json::to_string_pretty(&config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8889,
            experiment_config: None,
            data_log: PathBuf::from("nicls-activity.jsonl"),
        }
    }

    #[test]
    fn test_defaults_to_serve() {
        let cli = Cli::try_parse_from(["nicls-server"]).unwrap();
        assert!(cli.command.is_none());

        let mut config = server_config();
        cli.apply(&mut config);
        assert_eq!(config.bind_address(), "127.0.0.1:8889");
    }

    #[test]
    fn test_flags_override() {
        let cli = Cli::try_parse_from([
            "nicls-server",
            "serve",
            "--host",
            "0.0.0.0",
            "--port",
            "9000",
            "--config",
            "experiment.json",
            "--data-log",
            "out.jsonl",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::Serve)));

        let mut config = server_config();
        cli.apply(&mut config);
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
        assert_eq!(config.experiment_config, Some(PathBuf::from("experiment.json")));
        assert_eq!(config.data_log, PathBuf::from("out.jsonl"));
    }

    #[test]
    fn test_check_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiment.json");

        std::fs::write(&path, r#"{"channels": 16, "model_path": "model.json"}"#).unwrap();
        let rendered = check_config(&path).unwrap();
        assert!(rendered.contains("\"channels\": 16"));

        std::fs::write(&path, r#"{"channels": 0, "model_path": "model.json"}"#).unwrap();
        assert!(matches!(
            check_config(&path),
            Err(ConfigError::InvalidValue(_))
        ));

        let cli = Cli::try_parse_from(["nicls-server", "check-config", "--config", "x.json"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::CheckConfig)));
        assert_eq!(cli.config, Some(PathBuf::from("x.json")));
    }
}
