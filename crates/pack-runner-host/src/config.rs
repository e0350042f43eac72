//! Runner configuration: built-in defaults, then an optional TOML file, then
//! `PACK_RUNNER_*` environment overrides.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::host::secrets::SecretsBackend;

pub const ENV_HOME: &str = "PACK_RUNNER_HOME";
pub const ENV_ENVIRONMENT: &str = "PACK_RUNNER_ENV";
pub const ENV_MAX_SLEEP: &str = "PACK_RUNNER_MAX_SLEEP";
pub const ENV_STOP_GRACE: &str = "PACK_RUNNER_STOP_GRACE";
pub const ENV_HTTP_TIMEOUT: &str = "PACK_RUNNER_HTTP_TIMEOUT";

const DEFAULT_HOME: &str = ".pack-runner";
const DEFAULT_MAX_SLEEP: Duration = Duration::from_secs(10 * 60);
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LOG_BUFFER: usize = 1000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Local,
    Prod,
}

impl Environment {
    /// Reads `PACK_RUNNER_ENV`; anything other than `prod` is local.
    pub fn from_env() -> Self {
        match std::env::var(ENV_ENVIRONMENT) {
            Ok(value) if value.eq_ignore_ascii_case("prod") => Environment::Prod,
            _ => Environment::Local,
        }
    }

    pub fn is_prod(self) -> bool {
        matches!(self, Environment::Prod)
    }
}

impl FromStr for Environment {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "local" | "dev" => Ok(Environment::Local),
            "prod" => Ok(Environment::Prod),
            other => Err(anyhow!("unknown environment `{other}`")),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Local => f.write_str("local"),
            Environment::Prod => f.write_str("prod"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    Default,
    File,
    Env,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Default => f.write_str("default"),
            ConfigSource::File => f.write_str("file"),
            ConfigSource::Env => f.write_str("env"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunnerConfig {
    pub home: PathBuf,
    pub packs_dir: PathBuf,
    pub state_dir: PathBuf,
    pub environment: Environment,
    pub secrets: SecretsBackend,
    pub max_sleep: Duration,
    pub stop_grace: Duration,
    pub http_timeout: Duration,
    pub log_buffer: usize,
    provenance: BTreeMap<&'static str, ConfigSource>,
}

/// On-disk shape; every key is optional and overlays the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    home: Option<PathBuf>,
    packs_dir: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    environment: Option<Environment>,
    secrets: Option<SecretsBackend>,
    max_sleep: Option<String>,
    stop_grace: Option<String>,
    http_timeout: Option<String>,
    log_buffer: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::with_home(PathBuf::from(DEFAULT_HOME))
    }
}

impl RunnerConfig {
    /// Built-in defaults rooted at `home`, without consulting file or env.
    pub fn with_home(home: PathBuf) -> Self {
        Self {
            packs_dir: home.join("packs"),
            state_dir: home.join("state"),
            home,
            environment: Environment::Local,
            secrets: SecretsBackend::Memory,
            max_sleep: DEFAULT_MAX_SLEEP,
            stop_grace: DEFAULT_STOP_GRACE,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            log_buffer: DEFAULT_LOG_BUFFER,
            provenance: BTreeMap::new(),
        }
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Some(
                    toml::from_str::<ConfigFile>(&contents)
                        .with_context(|| format!("failed to parse config {}", path.display()))?,
                )
            }
            None => None,
        };
        let env: BTreeMap<&'static str, String> = [
            ENV_HOME,
            ENV_ENVIRONMENT,
            ENV_MAX_SLEEP,
            ENV_STOP_GRACE,
            ENV_HTTP_TIMEOUT,
        ]
        .into_iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key, value)))
        .collect();
        Self::resolve(file.unwrap_or_default(), &env)
    }

    /// Parse a TOML document with no environment layered on top.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(raw).context("failed to parse config")?;
        Self::resolve(file, &BTreeMap::new())
    }

    fn resolve(file: ConfigFile, env: &BTreeMap<&'static str, String>) -> Result<Self> {
        let mut provenance = BTreeMap::new();
        let mut pick = |key: &'static str, from_file: bool, env_key: Option<&str>| {
            let source = if env_key.is_some_and(|k| env.contains_key(k)) {
                ConfigSource::Env
            } else if from_file {
                ConfigSource::File
            } else {
                ConfigSource::Default
            };
            provenance.insert(key, source);
        };
        pick("home", file.home.is_some(), Some(ENV_HOME));
        pick("packs_dir", file.packs_dir.is_some(), None);
        pick("state_dir", file.state_dir.is_some(), None);
        pick("environment", file.environment.is_some(), Some(ENV_ENVIRONMENT));
        pick("secrets", file.secrets.is_some(), None);
        pick("max_sleep", file.max_sleep.is_some(), Some(ENV_MAX_SLEEP));
        pick("stop_grace", file.stop_grace.is_some(), Some(ENV_STOP_GRACE));
        pick("http_timeout", file.http_timeout.is_some(), Some(ENV_HTTP_TIMEOUT));
        pick("log_buffer", file.log_buffer.is_some(), None);

        let home = env
            .get(ENV_HOME)
            .map(PathBuf::from)
            .or(file.home)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HOME));
        let mut config = Self::with_home(home);
        if let Some(dir) = file.packs_dir {
            config.packs_dir = dir;
        }
        if let Some(dir) = file.state_dir {
            config.state_dir = dir;
        }
        config.environment = match env.get(ENV_ENVIRONMENT) {
            Some(raw) => raw.parse()?,
            None => file.environment.unwrap_or_default(),
        };
        if let Some(secrets) = file.secrets {
            config.secrets = secrets;
        }
        config.max_sleep = duration_setting(
            "max_sleep",
            env.get(ENV_MAX_SLEEP).or(file.max_sleep.as_ref()),
            DEFAULT_MAX_SLEEP,
        )?;
        config.stop_grace = duration_setting(
            "stop_grace",
            env.get(ENV_STOP_GRACE).or(file.stop_grace.as_ref()),
            DEFAULT_STOP_GRACE,
        )?;
        config.http_timeout = duration_setting(
            "http_timeout",
            env.get(ENV_HTTP_TIMEOUT).or(file.http_timeout.as_ref()),
            DEFAULT_HTTP_TIMEOUT,
        )?;
        if let Some(buffer) = file.log_buffer {
            if buffer == 0 {
                bail!("log_buffer must be greater than zero");
            }
            config.log_buffer = buffer;
        }
        config.provenance = provenance;
        Ok(config)
    }

    pub fn source_of(&self, key: &str) -> ConfigSource {
        self.provenance
            .get(key)
            .copied()
            .unwrap_or(ConfigSource::Default)
    }

    /// Human-readable dump of every resolved key and where it came from.
    pub fn explain(&self) -> String {
        let rows: [(&str, String); 9] = [
            ("home", self.home.display().to_string()),
            ("packs_dir", self.packs_dir.display().to_string()),
            ("state_dir", self.state_dir.display().to_string()),
            ("environment", self.environment.to_string()),
            ("secrets", self.secrets.to_string()),
            ("max_sleep", humantime::format_duration(self.max_sleep).to_string()),
            ("stop_grace", humantime::format_duration(self.stop_grace).to_string()),
            ("http_timeout", humantime::format_duration(self.http_timeout).to_string()),
            ("log_buffer", self.log_buffer.to_string()),
        ];
        let mut out = String::new();
        for (key, value) in rows {
            let _ = writeln!(out, "{key:<13} = {value:<40} [{}]", self.source_of(key));
        }
        out
    }
}

fn duration_setting(key: &str, raw: Option<&String>, default: Duration) -> Result<Duration> {
    match raw {
        Some(raw) => humantime::parse_duration(raw.trim())
            .with_context(|| format!("`{key}` is not a duration: `{raw}`")),
        None => Ok(default),
    }
}
