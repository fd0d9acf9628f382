use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

const PROJECT_CONFIG_PATH: &str = "./interceptproxy.toml";
const HOME_CONFIG_RELATIVE: &str = ".interceptproxy/config.toml";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub proxy: ProxyConfig,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub tls: TlsConfig,
    pub logging: Option<LoggingConfig>,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// Explicit override wins; otherwise the project file, then the home
    /// file, then built-in defaults.
    pub fn load(override_path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = override_path {
            return Self::from_path(path);
        }

        let project = Path::new(PROJECT_CONFIG_PATH);
        if project.exists() {
            return Self::from_path(project)
                .with_context(|| format!("load config from project {PROJECT_CONFIG_PATH}"));
        }

        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home).join(HOME_CONFIG_RELATIVE);
            if home_path.exists() {
                return Self::from_path(&home_path)
                    .with_context(|| format!("load config from home {}", home_path.display()));
            }
        }

        Ok(Self::default())
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8081)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("interceptproxy.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: PathBuf::from("cert.pem"),
            key: PathBuf::from("key.pem"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::tempdir;

    use super::{Config, LogFormat};

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::from_toml_str("").expect("empty config should parse");

        assert_eq!(config.proxy.listen.to_string(), "127.0.0.1:8081");
        assert_eq!(config.api.listen.to_string(), "127.0.0.1:8000");
        assert_eq!(config.storage.path, PathBuf::from("interceptproxy.db"));
        assert_eq!(config.tls.cert, PathBuf::from("cert.pem"));
        assert_eq!(config.tls.key, PathBuf::from("key.pem"));
        assert!(config.logging.is_none());
    }

    #[test]
    fn every_section_is_configurable() {
        let config = Config::from_toml_str(
            r#"
[proxy]
listen = "0.0.0.0:9081"

[api]
listen = "0.0.0.0:9000"

[storage]
path = "/var/lib/interceptproxy/capture.db"

[tls]
cert = "/etc/interceptproxy/tls.crt"
key = "/etc/interceptproxy/tls.key"

[logging]
level = "debug"
format = "pretty"
"#,
        )
        .expect("config should parse");

        assert_eq!(config.proxy.listen.to_string(), "0.0.0.0:9081");
        assert_eq!(config.api.listen.to_string(), "0.0.0.0:9000");
        assert_eq!(
            config.storage.path,
            PathBuf::from("/var/lib/interceptproxy/capture.db")
        );
        assert_eq!(config.tls.cert, PathBuf::from("/etc/interceptproxy/tls.crt"));
        assert_eq!(config.tls.key, PathBuf::from("/etc/interceptproxy/tls.key"));

        let logging = config.logging.expect("logging section should be present");
        assert_eq!(logging.level.as_deref(), Some("debug"));
        assert_eq!(logging.format, Some(LogFormat::Pretty));
    }

    #[test]
    fn malformed_toml_is_rejected_with_context() {
        let err = Config::from_toml_str("[proxy").unwrap_err();
        assert!(
            err.to_string().contains("parse config TOML"),
            "error: {err}"
        );
    }

    #[test]
    fn listen_must_be_a_socket_address() {
        let err = Config::from_toml_str(
            r#"
[proxy]
listen = "not-an-address"
"#,
        )
        .unwrap_err();
        assert!(
            format!("{err:#}").contains("invalid socket address"),
            "error: {err:#}"
        );
    }

    #[test]
    fn explicit_path_loads_and_missing_path_names_the_file() {
        let dir = tempdir().expect("tempdir should be created");
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            r#"
[proxy]
listen = "127.0.0.1:0"
"#,
        )
        .expect("config file should write");

        let config = Config::load(Some(&path)).expect("config should load");
        assert_eq!(config.proxy.listen.to_string(), "127.0.0.1:0");

        let missing = dir.path().join("missing.toml");
        let err = Config::load(Some(&missing)).unwrap_err();
        assert!(
            format!("{err:#}").contains("missing.toml"),
            "error: {err:#}"
        );
    }
}
