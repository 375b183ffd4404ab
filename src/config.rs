//! Startup configuration, read once from flags and environment.

use crate::error::AgentError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Flags for `remote-agent serve`.
#[derive(clap::Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, env = "AGENT_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "AGENT_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Working directory exposed to clients
    #[arg(long, env = "AGENT_ROOT", default_value = ".")]
    pub root: PathBuf,

    /// Shared bearer token
    #[arg(long, env = "AGENT_TOKEN", hide_env_values = true)]
    pub token: String,

    /// Maximum file size in bytes for reads and writes
    #[arg(long, env = "AGENT_MAX_FILE_SIZE", default_value_t = DEFAULT_MAX_FILE_SIZE)]
    pub max_file_size: u64,

    /// Comma-separated list of extensions allowed for writes
    #[arg(long, env = "AGENT_ALLOWED_EXTENSIONS", value_delimiter = ',')]
    pub allowed_extensions: Vec<String>,

    /// Shell used for terminals and commands
    #[arg(long, env = "AGENT_SHELL")]
    pub shell: Option<String>,

    /// Default command timeout in milliseconds
    #[arg(long, env = "AGENT_COMMAND_TIMEOUT_MS", default_value_t = DEFAULT_COMMAND_TIMEOUT_MS)]
    pub command_timeout_ms: u64,
}

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub addr: SocketAddr,
    pub root: PathBuf,
    pub token: String,
    pub max_file_size: u64,
    pub allowed_extensions: Option<Vec<String>>,
    pub shell: String,
    pub command_timeout: Duration,
}

impl AgentConfig {
    /// Configuration with defaults for everything but the root and token.
    pub fn new(root: impl Into<PathBuf>, token: impl Into<String>) -> Result<Self, AgentError> {
        let config = Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            root: root.into(),
            token: token.into(),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            allowed_extensions: None,
            shell: default_shell(),
            command_timeout: Duration::from_millis(DEFAULT_COMMAND_TIMEOUT_MS),
        };
        config.validated()
    }

    pub fn with_allowed_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_extensions = normalize_extensions(extensions);
        self
    }

    fn validated(mut self) -> Result<Self, AgentError> {
        if self.token.is_empty() {
            return Err(AgentError::InvalidRequest(
                "an authentication token is required".to_string(),
            ));
        }
        let root = self
            .root
            .canonicalize()
            .map_err(|e| AgentError::io(self.root.display(), e))?;
        if !root.is_dir() {
            return Err(AgentError::InvalidPath(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        self.root = root;
        Ok(self)
    }
}

impl TryFrom<ServeArgs> for AgentConfig {
    type Error = AgentError;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        Self {
            addr: SocketAddr::new(args.host, args.port),
            root: args.root,
            token: args.token,
            max_file_size: args.max_file_size,
            allowed_extensions: normalize_extensions(args.allowed_extensions),
            shell: args.shell.unwrap_or_else(default_shell),
            command_timeout: Duration::from_millis(args.command_timeout_ms),
        }
        .validated()
    }
}

pub fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Lowercase, strip leading dots, drop blanks. An empty result means "any".
fn normalize_extensions<I, S>(extensions: I) -> Option<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let list: Vec<String> = extensions
        .into_iter()
        .map(|e| e.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect();
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        serve: ServeArgs,
    }

    #[test]
    fn parses_flags_into_config() {
        let dir = TempDir::new().unwrap();
        let cli = Cli::parse_from([
            "agent",
            "--port",
            "9000",
            "--root",
            dir.path().to_str().unwrap(),
            "--token",
            "abc",
            "--allowed-extensions",
            ".JS, ts,,md",
            "--shell",
            "/bin/sh",
        ]);
        let config = AgentConfig::try_from(cli.serve).unwrap();
        assert_eq!(config.addr.port(), 9000);
        assert_eq!(config.root, dir.path().canonicalize().unwrap());
        assert_eq!(
            config.allowed_extensions,
            Some(vec!["js".to_string(), "ts".to_string(), "md".to_string()])
        );
        assert_eq!(config.shell, "/bin/sh");
        assert_eq!(config.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(config.command_timeout, Duration::from_secs(30));
    }

    #[test]
    fn rejects_empty_token() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            AgentConfig::new(dir.path(), ""),
            Err(AgentError::InvalidRequest(_))
        ));
    }

    #[test]
    fn rejects_root_that_is_a_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(
            AgentConfig::new(&file, "token"),
            Err(AgentError::InvalidPath(_))
        ));
        assert!(AgentConfig::new(dir.path().join("missing"), "token").is_err());
    }

    #[test]
    fn blank_extension_list_means_any() {
        let dir = TempDir::new().unwrap();
        let config = AgentConfig::new(dir.path(), "t")
            .unwrap()
            .with_allowed_extensions([" ", ""]);
        assert!(config.allowed_extensions.is_none());
    }
}
