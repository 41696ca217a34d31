//! Configuration of the Certa daemon.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fmt, fs, io};

use log::{LevelFilter, error};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use serde::de;
use serde::{Deserialize, Deserializer};
#[cfg(unix)]
use syslog::Facility;

use crate::commons::crypto::SignAlgo;
use crate::constants::*;
use crate::server::ca::CaSettings;
use crate::server::profile::StaticProfileConfig;
use crate::server::publisher::PublisherConfig;

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn log_level() -> LevelFilter {
        match env::var(CERTA_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!("Unrecognized value for log level in env var {CERTA_ENV_LOG_LEVEL}");
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./certa.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn master() -> bool {
        true
    }

    fn shutdown_grace_seconds() -> u64 {
        10
    }

    fn signer_pool_size() -> u32 {
        SIGNER_POOL_DEFAULT_SIZE
    }
}

//------------ Config --------------------------------------------------------

/// Global configuration for the Certa daemon.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "deserialize_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    /// Whether this instance runs the jobs that change shared state.
    #[serde(default = "ConfigDefaults::master")]
    pub master: bool,

    /// How long to wait for running jobs when shutting down.
    #[serde(default = "ConfigDefaults::shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,

    #[serde(default)]
    pub cas: Vec<CaConfig>,

    #[serde(default)]
    pub profiles: Vec<StaticProfileConfig>,

    #[serde(default)]
    pub publishers: Vec<PublisherConfig>,
}

impl Config {
    pub fn read_config(file: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let file = file.as_ref();
        let content = fs::read_to_string(file)
            .map_err(|e| ConfigError::Other(format!("Cannot read config file '{}': {e}", file.display())))?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.cas.is_empty() {
            return Err(ConfigError::other("At least one CA must be configured"));
        }

        let profiles = unique_names("profile", self.profiles.iter().map(|p| (p.id, p.name.as_str())))?;
        let publishers = unique_names("publisher", self.publishers.iter().map(|p| (p.id, p.name.as_str())))?;
        unique_names("CA", self.cas.iter().map(|ca| (ca.id, ca.name.as_str())))?;

        for ca in &self.cas {
            ca.verify(&profiles, &publishers)?;
        }
        Ok(())
    }

    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = Facility::from_str(&self.syslog_facility)
                    .map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => Err(ConfigError::other("Syslog is only supported on unix")),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger(true)
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {e}")))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!("Failed to open log file '{}': {err}", path.display());
                error!("{error_string}");
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger(true)
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {e}")))
    }

    /// Creates a syslog logger, trying the local socket first.
    #[cfg(unix)]
    fn syslog_logger(&self, facility: Facility) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from("certad"));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514)));
        match logger {
            Ok(logger) => self
                .fern_logger(false)
                .chain(logger)
                .apply()
                .map_err(|e| ConfigError::Other(format!("Failed to init syslog: {e}"))),
            Err(err) => Err(ConfigError::Other(format!("Cannot connect to syslog: {err}"))),
        }
    }

    /// Creates a fern logger with the levels of noisy targets capped.
    fn fern_logger(&self, timestamp: bool) -> fern::Dispatch {
        let framework_level = self.log_level.min(LevelFilter::Warn);

        fern::Dispatch::new()
            .format(move |out, message, record| {
                if timestamp {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!("[{}] {}", record.level(), message))
                }
            })
            .level(self.log_level)
            .level_for("tokio", framework_level)
            .level_for("mio", framework_level)
            .level_for("r2d2", framework_level)
    }
}

fn unique_names<'a>(
    what: &str,
    items: impl Iterator<Item = (u32, &'a str)>,
) -> Result<HashSet<&'a str>, ConfigError> {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for (id, name) in items {
        if name.is_empty() {
            return Err(ConfigError::Other(format!("The {what} with id {id} has no name")));
        }
        if !ids.insert(id) {
            return Err(ConfigError::Other(format!("Duplicate {what} id {id}")));
        }
        if !names.insert(name) {
            return Err(ConfigError::Other(format!("Duplicate {what} name '{name}'")));
        }
    }
    Ok(names)
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(d: D) -> Result<LevelFilter, D::Error> {
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(|_| de::Error::custom(format!("invalid log level '{string}'")))
}

//------------ CaConfig ------------------------------------------------------

/// The configuration of one CA.
#[derive(Clone, Debug, Deserialize)]
pub struct CaConfig {
    pub id: u32,
    pub name: String,

    /// The CA certificate, PEM encoded.
    pub cert_file: PathBuf,

    /// The CA private key, PEM encoded.
    pub key_file: PathBuf,

    /// Derived from the key if missing.
    #[serde(default)]
    pub signature_algorithm: Option<SignAlgo>,

    #[serde(default = "ConfigDefaults::signer_pool_size")]
    pub signer_pool_size: u32,

    /// Key of a separate CRL signer, for indirect CRLs.
    #[serde(default)]
    pub crl_signer_key_file: Option<PathBuf>,

    #[serde(default)]
    pub crl_signer_cert_file: Option<PathBuf>,

    /// Names of the profiles this CA issues with.
    #[serde(default)]
    pub profiles: Vec<String>,

    /// Names of the publishers this CA publishes to.
    #[serde(default)]
    pub publishers: Vec<String>,

    #[serde(flatten)]
    pub settings: CaSettings,
}

impl CaConfig {
    fn verify(&self, profiles: &HashSet<&str>, publishers: &HashSet<&str>) -> Result<(), ConfigError> {
        let ca = &self.name;
        self.settings
            .verify()
            .map_err(|e| ConfigError::Other(format!("Invalid settings for CA '{ca}': {e}")))?;

        if self.signer_pool_size == 0 {
            return Err(ConfigError::Other(format!("signer_pool_size of CA '{ca}' must be at least 1")));
        }

        if let Some(name) = self.profiles.iter().find(|name| !profiles.contains(name.as_str())) {
            return Err(ConfigError::Other(format!("CA '{ca}' refers to unknown profile '{name}'")));
        }
        if let Some(name) = self.publishers.iter().find(|name| !publishers.contains(name.as_str())) {
            return Err(ConfigError::Other(format!("CA '{ca}' refers to unknown publisher '{name}'")));
        }

        match (&self.crl_signer_key_file, &self.crl_signer_cert_file) {
            (None, None) => {}
            (Some(_), Some(_)) => {
                if self.settings.crl_control.is_none() {
                    return Err(ConfigError::Other(format!(
                        "CA '{ca}' has a CRL signer but no crl_control"
                    )));
                }
            }
            _ => {
                return Err(ConfigError::Other(format!(
                    "CA '{ca}' needs both crl_signer_key_file and crl_signer_cert_file"
                )));
            }
        }
        Ok(())
    }

    pub fn load_cert(&self) -> Result<X509, ConfigError> {
        load_cert(&self.cert_file)
    }

    pub fn load_key(&self) -> Result<PKey<Private>, ConfigError> {
        load_key(&self.key_file)
    }

    /// Loads the key and certificate of the separate CRL signer, if any.
    pub fn load_crl_signer(&self) -> Result<Option<(PKey<Private>, X509)>, ConfigError> {
        match (&self.crl_signer_key_file, &self.crl_signer_cert_file) {
            (Some(key), Some(cert)) => Ok(Some((load_key(key)?, load_cert(cert)?))),
            _ => Ok(None),
        }
    }
}

fn load_cert(path: &Path) -> Result<X509, ConfigError> {
    let pem = fs::read(path)?;
    X509::from_pem(&pem)
        .map_err(|e| ConfigError::Other(format!("Invalid certificate in '{}': {e}", path.display())))
}

fn load_key(path: &Path) -> Result<PKey<Private>, ConfigError> {
    let pem = fs::read(path)?;
    PKey::private_key_from_pem(&pem)
        .map_err(|e| ConfigError::Other(format!("Invalid private key in '{}': {e}", path.display())))
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{string}\""
            ))),
        }
    }
}

//------------ Tests ---------------------------------------------------------
