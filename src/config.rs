use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Port the HTTP surface listens on
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Backend server configurations, keyed by route name
    pub servers: HashMap<String, ServerConfig>,

    /// Seconds a session may sit idle before the reaper closes it (default: 300)
    #[serde(default = "default_session_idle_timeout")]
    pub session_idle_timeout_secs: u64,

    /// Interval between idle sweeps in seconds (default: 60)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds allowed for a backend's initialize handshake (default: 30)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    /// Grace period in seconds between closing a backend's stdin and SIGTERM (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

/// Configuration for a single stdio backend server
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Command used to launch the backend process
    pub command: String,

    /// Arguments passed to the command
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables overlaid on the inherited environment
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Config {
    /// Load and validate configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == 0 {
            anyhow::bail!("'port' must be greater than 0");
        }
        for (name, server) in &self.servers {
            if name.is_empty() {
                anyhow::bail!("server names must not be empty");
            }
            server
                .validate()
                .map_err(|e| anyhow::anyhow!("server '{}': {}", name, e))?;
        }
        Ok(())
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

impl ServerConfig {
    /// Create a server config for a bare command (builder pattern)
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Set arguments for this server config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Validate the server configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.command.is_empty() {
            return Err("'command' must be a non-empty string".to_string());
        }
        Ok(())
    }
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_session_idle_timeout() -> u64 {
    300 // 5 minutes
}

fn default_sweep_interval() -> u64 {
    60 // 1 minute between reaper sweeps
}

fn default_handshake_timeout() -> u64 {
    30 // 30 seconds for spawn + initialize
}

fn default_shutdown_grace_period() -> u64 {
    5 // 5 seconds between stdin close and SIGTERM
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let json = r#"{
            "port": 9802,
            "servers": {
                "echo": {
                    "command": "echo-server",
                    "args": ["--verbose"],
                    "env": {"LOG_LEVEL": "debug"}
                },
                "files": {
                    "command": "file-server"
                }
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 9802);
        assert_eq!(config.bind, "127.0.0.1");
        assert_eq!(config.servers.len(), 2);

        let echo = &config.servers["echo"];
        assert_eq!(echo.command, "echo-server");
        assert_eq!(echo.args, vec!["--verbose"]);
        assert_eq!(echo.env["LOG_LEVEL"], "debug");

        let files = &config.servers["files"];
        assert!(files.args.is_empty());
        assert!(files.env.is_empty());
    }

    #[test]
    fn test_defaults_applied() {
        let config: Config =
            serde_json::from_str(r#"{"port": 8080, "servers": {}}"#).unwrap();
        assert_eq!(config.session_idle_timeout_secs, 300);
        assert_eq!(config.sweep_interval_secs, 60);
        assert_eq!(config.handshake_timeout_secs, 30);
        assert_eq!(config.shutdown_grace_period_secs, 5);
        assert_eq!(config.session_idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_missing_servers_fails() {
        let result = serde_json::from_str::<Config>(r#"{"port": 8080}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_command_fails() {
        let result = serde_json::from_str::<Config>(
            r#"{"port": 8080, "servers": {"echo": {"args": []}}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_empty_command() {
        let config: Config = serde_json::from_str(
            r#"{"port": 8080, "servers": {"echo": {"command": ""}}}"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("echo"));
        assert!(err.contains("command"));
    }

    #[test]
    fn test_validate_rejects_port_zero() {
        let config: Config =
            serde_json::from_str(r#"{"port": 0, "servers": {}}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"port": 9802, "servers": {{"echo": {{"command": "echo-server", "args": []}}}}}}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.port, 9802);
        assert!(config.servers.contains_key("echo"));
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = Config::load("/nonexistent/config.json");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_json_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(Config::load(file.path()).is_err());
    }
}
