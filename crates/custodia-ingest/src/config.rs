//! Ingestion configuration
//!
//! Read from `CUSTODIA_*` environment variables, with a `.env` file honoured
//! through `dotenvy`. Paths default to locations under the source root.

use encoding_rs::Encoding;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::cvm::downloader::encoding_for;
use crate::cvm::registry;
use crate::sink::LoadMode;

pub const ENV_PREFIX: &str = "CUSTODIA_";

pub const DEFAULT_SOURCE_ROOT: &str = "./data";
pub const DEFAULT_CVM_BASE_URL: &str = "https://dados.cvm.gov.br/dados/FI/";
pub const DEFAULT_SOURCE_ENCODING: &str = "latin1";
pub const DEFAULT_TARGET_ENCODING: &str = "utf-8";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
/// Archives of the historical daily positions are large
pub const MIN_DOWNLOAD_TIMEOUT_SECS: u64 = 180;

#[derive(Debug, thiserror::Error)]
#[error("Configuration error: {0}")]
pub struct ConfigError(pub String);

impl From<ConfigError> for crate::cvm::CvmError {
    fn from(err: ConfigError) -> Self {
        crate::cvm::CvmError::Configuration(err.0)
    }
}

/// Settings shared by the CVM and CEI pipelines
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub source_root: PathBuf,
    /// CEI workbooks
    pub input_folder: PathBuf,
    pub history_folder: PathBuf,
    /// CSV side-car root
    pub output_folder: PathBuf,
    pub catalog_db_url: String,
    pub store_db_url: String,
    pub templates_path: PathBuf,
    pub mappings_path: PathBuf,
    pub write_csv: bool,
    pub parallelize: bool,
    pub source_encoding: String,
    pub target_encoding: String,
    pub check_header: bool,
    pub halt_on_new_fields: bool,
    pub load_mode: LoadMode,
    pub http_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub cvm_base_url: Url,
}

impl IngestConfig {
    /// Defaults rooted at `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let root = root.into();
        let catalog_db_url = sqlite_url(&root.join("catalog.db"));
        Ok(Self {
            input_folder: root.join("input"),
            history_folder: root.join("history"),
            output_folder: root.join("output"),
            store_db_url: catalog_db_url.clone(),
            catalog_db_url,
            templates_path: root.join("templates.csv"),
            mappings_path: root.join("mappings.csv"),
            write_csv: false,
            parallelize: false,
            source_encoding: DEFAULT_SOURCE_ENCODING.to_string(),
            target_encoding: DEFAULT_TARGET_ENCODING.to_string(),
            check_header: true,
            halt_on_new_fields: true,
            load_mode: LoadMode::Replace,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            cvm_base_url: parse_base_url(DEFAULT_CVM_BASE_URL)?,
            source_root: root,
        })
    }

    /// Load from the process environment (after reading `.env`, if any)
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "Loaded .env file");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable lookup; `lookup` receives full names
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(&format!("{}{}", ENV_PREFIX, name))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let root = var("SOURCE_ROOT").unwrap_or_else(|| DEFAULT_SOURCE_ROOT.to_string());
        let mut config = Self::with_root(root)?;

        if let Some(v) = var("HISTORY_FOLDER") {
            config.history_folder = PathBuf::from(v);
        }
        if let Some(v) = var("OUTPUT_FOLDER") {
            config.output_folder = PathBuf::from(v);
        }
        if let Some(v) = var("CATALOG_DB_URL") {
            config.store_db_url = v.clone();
            config.catalog_db_url = v;
        }
        if let Some(v) = var("STORE_DB_URL") {
            config.store_db_url = v;
        }
        if let Some(v) = var("TEMPLATES_PATH") {
            config.templates_path = PathBuf::from(v);
        }
        if let Some(v) = var("MAPPINGS_PATH") {
            config.mappings_path = PathBuf::from(v);
        }
        if let Some(v) = var("WRITE_CSV") {
            config.write_csv = parse_bool("WRITE_CSV", &v)?;
        }
        if let Some(v) = var("PARALLELIZE") {
            config.parallelize = parse_bool("PARALLELIZE", &v)?;
        }
        if let Some(v) = var("SOURCE_ENCODING") {
            config.source_encoding = v;
        }
        if let Some(v) = var("TARGET_ENCODING") {
            config.target_encoding = v;
        }
        if let Some(v) = var("CHECK_HEADER") {
            config.check_header = parse_bool("CHECK_HEADER", &v)?;
        }
        if let Some(v) = var("HALT_ON_NEW_FIELDS") {
            config.halt_on_new_fields = parse_bool("HALT_ON_NEW_FIELDS", &v)?;
        }
        if let Some(v) = var("LOAD_MODE") {
            config.load_mode = v.parse().map_err(|e| ConfigError(format!("{}", e)))?;
        }
        if let Some(v) = var("HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = parse_secs("HTTP_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("DOWNLOAD_TIMEOUT_SECS") {
            config.download_timeout_secs = parse_secs("DOWNLOAD_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = var("CVM_BASE_URL") {
            config.cvm_base_url = parse_base_url(&v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source_encoding()?;
        self.target_encoding()?;

        if self.http_timeout_secs == 0 {
            return Err(ConfigError("HTTP timeout must be greater than 0".to_string()));
        }
        if self.download_timeout_secs < MIN_DOWNLOAD_TIMEOUT_SECS {
            return Err(ConfigError(format!(
                "download timeout must be at least {} seconds",
                MIN_DOWNLOAD_TIMEOUT_SECS
            )));
        }
        if !matches!(self.cvm_base_url.scheme(), "http" | "https") {
            return Err(ConfigError(format!(
                "CVM base URL must be http(s): {}",
                self.cvm_base_url
            )));
        }
        if !registry::is_writable(&self.mappings_path) {
            return Err(ConfigError(format!(
                "mappings table must be a .csv or .xlsx file: {}",
                self.mappings_path.display()
            )));
        }
        for (name, url) in [("catalog", &self.catalog_db_url), ("store", &self.store_db_url)] {
            if !url.starts_with("sqlite:") {
                return Err(ConfigError(format!("{} database URL must be a sqlite URL: {}", name, url)));
            }
        }
        Ok(())
    }

    pub fn source_encoding(&self) -> Result<&'static Encoding, ConfigError> {
        resolve_encoding(&self.source_encoding)
    }

    pub fn target_encoding(&self) -> Result<&'static Encoding, ConfigError> {
        resolve_encoding(&self.target_encoding)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

fn resolve_encoding(label: &str) -> Result<&'static Encoding, ConfigError> {
    encoding_for(label).ok_or_else(|| ConfigError(format!("unknown encoding '{}'", label)))
}

fn sqlite_url(path: &std::path::Path) -> String {
    format!("sqlite://{}", path.display())
}

/// Directory URLs must end in `/` so relative joins stay beneath them
fn parse_base_url(value: &str) -> Result<Url, ConfigError> {
    let value = if value.ends_with('/') {
        value.to_string()
    } else {
        format!("{}/", value)
    };
    Url::parse(&value).map_err(|e| ConfigError(format!("invalid CVM base URL '{}': {}", value, e)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError(format!(
            "{}{} must be a boolean, got '{}'",
            ENV_PREFIX, name, value
        ))),
    }
}

fn parse_secs(name: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| {
        ConfigError(format!(
            "{}{} must be a whole number of seconds, got '{}'",
            ENV_PREFIX, name, value
        ))
    })
}
