use std::path::PathBuf;
use std::str::FromStr;

/// Server settings read from `INNKEEP_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let password = lookup("INNKEEP_PASSWORD")
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::Missing("INNKEEP_PASSWORD"))?;

        Ok(Self {
            port: parse_or(&lookup, "INNKEEP_PORT", 5433)?,
            bind: lookup("INNKEEP_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("INNKEEP_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password,
            max_connections: parse_or(&lookup, "INNKEEP_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "INNKEEP_COMPACT_THRESHOLD", 1000)?,
            metrics_port: parse_opt(&lookup, "INNKEEP_METRICS_PORT")?,
            tls_cert: lookup("INNKEEP_TLS_CERT"),
            tls_key: lookup("INNKEEP_TLS_KEY"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_opt<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(lookup, var)?.unwrap_or(default))
}

#[derive(Debug, PartialEq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { var: &'static str, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Missing(var) => write!(f, "{var} must be set"),
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}
