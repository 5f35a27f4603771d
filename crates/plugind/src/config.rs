use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

use crate::pool::DEFAULT_POOL_SIZE;
use crate::runtime::{LocalRuntimeConfig, ManagerConfig, SupervisorOptions};
use crate::transport::HolderConfig;

/// Config file looked up when none is given on the command line.
pub const DEFAULT_CONFIG_FILE: &str = "plugind.yaml";
/// Base directory of plugin working directories (relative to the config file).
pub const DEFAULT_WORKING_PATH: &str = ".plugind/plugins";

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub stdio: StdioConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub launch: LaunchConfig,
    #[serde(default)]
    pub working_path: Option<PathBuf>,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    /// Plugins launched as local child processes.
    #[serde(default)]
    pub plugins: Vec<PluginDeclaration>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("unclosed variable reference '${{' (missing '}}')")]
    UnclosedVarReference,

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Load from `path`. A missing file yields the defaults.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = match fs::read_to_string(path.as_ref()).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        let expanded = expand_env_vars(&contents)?;
        Ok(serde_saphyr::from_str(&expanded)?)
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.size == 0 {
            return Err(ConfigError::Invalid("pool.size must be positive".into()));
        }
        if self.stdio.buffer_size == 0 || self.stdio.max_buffer_size < self.stdio.buffer_size {
            return Err(ConfigError::Invalid(
                "stdio.max_buffer_size must be at least stdio.buffer_size (and both positive)".into(),
            ));
        }
        if self.heartbeat.check_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat.check_interval_seconds must be positive".into(),
            ));
        }
        if self.launch.max_concurrent == 0 {
            return Err(ConfigError::Invalid("launch.max_concurrent must be positive".into()));
        }
        if self.remote.enabled && self.remote.key.is_empty() {
            return Err(ConfigError::Invalid("remote.key is required when remote is enabled".into()));
        }

        let mut seen = HashSet::new();
        for plugin in &self.plugins {
            if plugin.name.is_empty() || plugin.version.is_empty() {
                return Err(ConfigError::Invalid("plugin name and version are required".into()));
            }
            if plugin.command.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "plugin '{}' has no command",
                    plugin.identity()
                )));
            }
            if !seen.insert(plugin.identity()) {
                return Err(ConfigError::Invalid(format!(
                    "plugin '{}' is declared twice",
                    plugin.identity()
                )));
            }
        }
        Ok(())
    }

    /// Working directory root, resolved against the config file location.
    pub fn working_path(&self, config_path: &Path) -> PathBuf {
        let path = self
            .working_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKING_PATH));
        resolve_path(config_path, &path)
    }

    pub fn holder_config(&self) -> HolderConfig {
        HolderConfig {
            buffer_size: self.stdio.buffer_size,
            max_buffer_size: self.stdio.max_buffer_size,
            check_interval: Duration::from_secs(self.heartbeat.check_interval_seconds),
            max_heartbeat_interval: Duration::from_secs(self.heartbeat.max_interval_seconds),
        }
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            restart_cooldown: Duration::from_secs(self.launch.restart_cooldown_seconds),
            max_init_failures: self.launch.max_init_failures,
        }
    }

    pub fn manager_config(&self, config_path: &Path) -> ManagerConfig {
        ManagerConfig {
            working_path: self.working_path(config_path),
            max_concurrent_launches: self.launch.max_concurrent,
            supervisor: self.supervisor_options(),
            local: LocalRuntimeConfig {
                holder: self.holder_config(),
                proxy: self.proxy.clone(),
                ..LocalRuntimeConfig::default()
            },
        }
    }
}

/// Resolve `path` against the directory containing `config_path`.
///
/// Absolute paths are returned unchanged.
pub fn resolve_path(config_path: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(path)
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Worker pool size. Fixed for the life of the process.
    #[serde(default = "default_pool_size")]
    pub size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StdioConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_buffer_size")]
    pub max_buffer_size: usize,
}

impl Default for StdioConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_buffer_size: default_max_buffer_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_max_interval")]
    pub max_interval_seconds: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_interval(),
            max_interval_seconds: default_max_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LaunchConfig {
    /// Plugins allowed in the launching phase at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_restart_cooldown")]
    pub restart_cooldown_seconds: u64,
    #[serde(default = "default_max_init_failures")]
    pub max_init_failures: u32,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            restart_cooldown_seconds: default_restart_cooldown(),
            max_init_failures: default_max_init_failures(),
        }
    }
}

/// Proxy settings handed to local plugin processes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub http: Option<String>,
    #[serde(default)]
    pub https: Option<String>,
    #[serde(default)]
    pub no_proxy: Option<String>,
}

impl ProxyConfig {
    /// Environment variables for the configured proxies.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = Vec::new();
        if let Some(http) = &self.http {
            vars.push(("HTTP_PROXY", http.clone()));
        }
        if let Some(https) = &self.https {
            vars.push(("HTTPS_PROXY", https.clone()));
        }
        if let Some(no_proxy) = &self.no_proxy {
            vars.push(("NO_PROXY", no_proxy.clone()));
        }
        vars
    }
}

/// TCP listener for plugins that dial in (debugging).
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_remote_host")]
    pub host: String,
    #[serde(default = "default_remote_port")]
    pub port: u16,
    /// Shared secret every handshake must present.
    #[serde(default)]
    pub key: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_remote_host(),
            port: default_remote_port(),
            key: String::new(),
        }
    }
}

/// A plugin to launch as a local child process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDeclaration {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Directory the command runs in. Defaults to the plugin's managed
    /// working directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl PluginDeclaration {
    /// `author/name:version`, or `name:version` without an author.
    pub fn identity(&self) -> String {
        if self.author.is_empty() {
            format!("{}:{}", self.name, self.version)
        } else {
            format!("{}/{}:{}", self.author, self.name, self.version)
        }
    }
}

// ============================================================================
// Private Helpers (Serde Defaults)
// ============================================================================

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_buffer_size() -> usize {
    1024
}

fn default_max_buffer_size() -> usize {
    5 * 1024 * 1024
}

fn default_check_interval() -> u64 {
    5
}

fn default_max_interval() -> u64 {
    120
}

fn default_max_concurrent() -> usize {
    2
}

fn default_restart_cooldown() -> u64 {
    5
}

fn default_max_init_failures() -> u32 {
    3
}

fn default_remote_host() -> String {
    "127.0.0.1".to_string()
}

fn default_remote_port() -> u16 {
    5003
}

// ============================================================================
// Environment Variable Expansion
// ============================================================================

/// Substitute environment variables in raw config text.
///
/// - `${VAR}` must be set.
/// - `${VAR:-fallback}` uses `fallback` (possibly empty) when `VAR` is unset.
/// - `$$` is a literal `$`. Any other `$` is kept as is.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body.find('}').ok_or(ConfigError::UnclosedVarReference)?;
            out.push_str(&lookup_var(&body[..end])?);
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = after;
        }
    }

    out.push_str(rest);
    Ok(out)
}

fn lookup_var(reference: &str) -> Result<String, ConfigError> {
    let (name, fallback) = match reference.split_once(":-") {
        Some((name, fallback)) => (name, Some(fallback)),
        None => (reference, None),
    };
    match (std::env::var(name), fallback) {
        (Ok(value), _) => Ok(value),
        (Err(_), Some(fallback)) => Ok(fallback.to_string()),
        (Err(_), None) => Err(ConfigError::MissingEnvVar(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.yaml")).await.unwrap();

        assert_eq!(config.pool.size, 10_000);
        assert_eq!(config.stdio.buffer_size, 1024);
        assert_eq!(config.stdio.max_buffer_size, 5 * 1024 * 1024);
        assert_eq!(config.heartbeat.check_interval_seconds, 5);
        assert_eq!(config.heartbeat.max_interval_seconds, 120);
        assert_eq!(config.launch.max_concurrent, 2);
        assert_eq!(config.launch.max_init_failures, 3);
        assert!(!config.remote.enabled);
        assert!(config.plugins.is_empty());
        config.validate().unwrap();
    }

    #[tokio::test]
    async fn full_config_parses() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
pool:
  size: 64
heartbeat:
  max_interval_seconds: 30
launch:
  restart_cooldown_seconds: 1
working_path: /var/lib/plugind
proxy:
  https: http://proxy:3128
remote:
  enabled: true
  port: 6000
  key: secret
plugins:
  - name: echo
    version: 0.1.0
    author: acme
    command: python3
    args: ["-m", "main"]
    env:
      LOG_LEVEL: debug
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        config.validate().unwrap();

        assert_eq!(config.pool.size, 64);
        assert_eq!(config.heartbeat.max_interval_seconds, 30);
        assert_eq!(config.heartbeat.check_interval_seconds, 5);
        assert_eq!(config.launch.restart_cooldown_seconds, 1);
        assert_eq!(
            config.working_path(file.path()),
            PathBuf::from("/var/lib/plugind")
        );
        assert_eq!(config.remote.port, 6000);
        assert_eq!(
            config.proxy.env_vars(),
            vec![("HTTPS_PROXY", "http://proxy:3128".to_string())]
        );

        let plugin = &config.plugins[0];
        assert_eq!(plugin.identity(), "acme/echo:0.1.0");
        assert_eq!(plugin.args, vec!["-m", "main"]);
        assert_eq!(plugin.env.get("LOG_LEVEL").map(String::as_str), Some("debug"));

        let holder = config.holder_config();
        assert_eq!(holder.max_heartbeat_interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn invalid_yaml_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "pool: [").unwrap();
        assert!(Config::load(file.path()).await.is_err());
    }

    #[test]
    fn relative_working_path_follows_config_file() {
        let config = Config::default();
        assert_eq!(
            config.working_path(Path::new("/etc/plugind/plugind.yaml")),
            PathBuf::from("/etc/plugind/.plugind/plugins")
        );
    }

    #[test]
    fn identity_without_author() {
        let decl = PluginDeclaration {
            name: "echo".into(),
            version: "1.0.0".into(),
            author: String::new(),
            command: "sh".into(),
            args: vec![],
            env: BTreeMap::new(),
            working_dir: None,
        };
        assert_eq!(decl.identity(), "echo:1.0.0");
    }

    // ========================================================================
    // Validation
    // ========================================================================

    fn declaration(name: &str) -> PluginDeclaration {
        PluginDeclaration {
            name: name.into(),
            version: "1.0.0".into(),
            author: "acme".into(),
            command: "sh".into(),
            args: vec![],
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    #[test]
    fn duplicate_plugins_rejected() {
        let config = Config {
            plugins: vec![declaration("a"), declaration("a")],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn remote_requires_key() {
        let config = Config {
            remote: RemoteConfig {
                enabled: true,
                ..RemoteConfig::default()
            },
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn empty_command_rejected() {
        let mut decl = declaration("a");
        decl.command.clear();
        let config = Config {
            plugins: vec![decl],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    // ========================================================================
    // Environment expansion
    // ========================================================================

    #[test]
    fn expand_required_var() {
        // SAFETY: Single-threaded test
        unsafe { std::env::set_var("PLUGIND_TEST_REQUIRED", "value") };
        let result = expand_env_vars("a ${PLUGIND_TEST_REQUIRED} b").unwrap();
        assert_eq!(result, "a value b");
        unsafe { std::env::remove_var("PLUGIND_TEST_REQUIRED") };
    }

    #[test]
    fn expand_missing_var_fails() {
        // SAFETY: Single-threaded test
        unsafe { std::env::remove_var("PLUGIND_TEST_MISSING") };
        match expand_env_vars("key: ${PLUGIND_TEST_MISSING}") {
            Err(ConfigError::MissingEnvVar(name)) => assert_eq!(name, "PLUGIND_TEST_MISSING"),
            other => panic!("expected MissingEnvVar, got {other:?}"),
        }
    }

    #[test]
    fn expand_fallbacks() {
        // SAFETY: Single-threaded test
        unsafe { std::env::remove_var("PLUGIND_TEST_UNSET") };
        assert_eq!(
            expand_env_vars("${PLUGIND_TEST_UNSET:-6000}").unwrap(),
            "6000"
        );
        assert_eq!(expand_env_vars("[${PLUGIND_TEST_UNSET:-}]").unwrap(), "[]");
    }

    #[test]
    fn expand_escapes_and_plain_dollars() {
        assert_eq!(expand_env_vars("cost $$5 or $5").unwrap(), "cost $5 or $5");
        assert_eq!(expand_env_vars("trailing $").unwrap(), "trailing $");
    }

    #[test]
    fn expand_unclosed_reference_fails() {
        assert!(matches!(
            expand_env_vars("key: ${OPEN"),
            Err(ConfigError::UnclosedVarReference)
        ));
    }
}
