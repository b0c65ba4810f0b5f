use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = ".audioshelf";
const DEFAULT_DATA_DIR: &str = "audioshelf_data";
const DEFAULT_PUBLIC_URL: &str = "http://127.0.0.1:8090";
const DEFAULT_LOG_LEVEL: &str = "warn";

/// A validation error in the configuration
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.field, self.message)
    }
}

/// Output format of diagnostic logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "compact" => Some(Self::Compact),
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

/// Where the store, attachments and session live, and how files are served
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AuditConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Defaults to `<data_dir>/audit`
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct AuthConfig {
    /// Defaults to `<data_dir>/session.json`
    #[serde(default)]
    pub session_file: Option<PathBuf>,
}

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from default paths
    /// Priority: local (.audioshelf/config.local.toml) > project (.audioshelf/config.toml)
    /// > user (~/.audioshelf/config.toml) > built-in defaults
    pub fn load() -> Result<Self> {
        Self::load_layers(dirs::home_dir().as_deref(), Path::new("."))
    }

    /// Layered load with explicit home and project roots
    pub fn load_layers(home: Option<&Path>, project: &Path) -> Result<Self> {
        let mut config = Config::default();

        if let Some(home) = home {
            let user_config = home.join(CONFIG_DIR).join("config.toml");
            if user_config.exists() {
                config.merge(Self::load_from(&user_config)?);
            }
        }

        let project_config = project.join(CONFIG_DIR).join("config.toml");
        if project_config.exists() {
            config.merge(Self::load_from(&project_config)?);
        }

        // Should be gitignored
        let local_config = project.join(CONFIG_DIR).join("config.local.toml");
        if local_config.exists() {
            config.merge(Self::load_from(&local_config)?);
        }

        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Merge another config into this one (other takes priority for every set value)
    pub fn merge(&mut self, other: Config) {
        if other.storage.data_dir.is_some() {
            self.storage.data_dir = other.storage.data_dir;
        }
        if other.storage.public_url.is_some() {
            self.storage.public_url = other.storage.public_url;
        }
        if other.logging.level.is_some() {
            self.logging.level = other.logging.level;
        }
        if other.logging.format.is_some() {
            self.logging.format = other.logging.format;
        }
        if other.audit.enabled.is_some() {
            self.audit.enabled = other.audit.enabled;
        }
        if other.audit.dir.is_some() {
            self.audit.dir = other.audit.dir;
        }
        if other.auth.session_file.is_some() {
            self.auth.session_file = other.auth.session_file;
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    pub fn public_url(&self) -> &str {
        self.storage
            .public_url
            .as_deref()
            .unwrap_or(DEFAULT_PUBLIC_URL)
    }

    pub fn log_level(&self) -> &str {
        self.logging.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn log_format(&self) -> LogFormat {
        self.logging
            .format
            .as_deref()
            .and_then(LogFormat::from_str)
            .unwrap_or_default()
    }

    pub fn audit_enabled(&self) -> bool {
        self.audit.enabled.unwrap_or(true)
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.audit
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("audit"))
    }

    pub fn session_file(&self) -> PathBuf {
        self.auth
            .session_file
            .clone()
            .unwrap_or_else(|| self.data_dir().join(crate::auth::SESSION_FILE))
    }

    /// Validate configuration and return any errors found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.data_dir().as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.data_dir".to_string(),
                message: "Must not be empty".to_string(),
            });
        }

        let url = self.public_url();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            errors.push(ValidationError {
                field: "storage.public_url".to_string(),
                message: format!("Expected an http(s) URL, got '{}'", url),
            });
        }

        if let Some(format) = &self.logging.format {
            if LogFormat::from_str(format).is_none() {
                errors.push(ValidationError {
                    field: "logging.format".to_string(),
                    message: format!(
                        "Invalid log format '{}', expected compact, pretty or json",
                        format
                    ),
                });
            }
        }

        if tracing_subscriber::EnvFilter::try_new(self.log_level()).is_err() {
            errors.push(ValidationError {
                field: "logging.level".to_string(),
                message: format!("Invalid log level '{}'", self.log_level()),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.data_dir(), PathBuf::from("audioshelf_data"));
        assert_eq!(config.public_url(), "http://127.0.0.1:8090");
        assert_eq!(config.log_format(), LogFormat::Compact);
        assert!(config.audit_enabled());
        assert_eq!(config.audit_dir(), PathBuf::from("audioshelf_data/audit"));
        assert_eq!(
            config.session_file(),
            PathBuf::from("audioshelf_data/session.json")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_layers_override_in_order() {
        let home = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        write(
            &home.path().join(".audioshelf/config.toml"),
            "[storage]\ndata_dir = \"/srv/shelf\"\npublic_url = \"https://files.example.com\"\n\n[logging]\nlevel = \"info\"\n",
        );
        write(
            &project.path().join(".audioshelf/config.toml"),
            "[storage]\npublic_url = \"http://localhost:9000\"\n\n[audit]\nenabled = false\n",
        );
        write(
            &project.path().join(".audioshelf/config.local.toml"),
            "[logging]\nformat = \"json\"\n",
        );

        let config = Config::load_layers(Some(home.path()), project.path()).unwrap();
        assert_eq!(config.data_dir(), PathBuf::from("/srv/shelf"));
        assert_eq!(config.public_url(), "http://localhost:9000");
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.log_format(), LogFormat::Json);
        assert!(!config.audit_enabled());
        assert_eq!(config.session_file(), PathBuf::from("/srv/shelf/session.json"));
    }

    #[test]
    fn test_missing_layers_are_skipped() {
        let project = tempfile::tempdir().unwrap();
        let config = Config::load_layers(None, project.path()).unwrap();
        assert!(config.storage.data_dir.is_none());
    }

    #[test]
    fn test_parse_error_names_file() {
        let project = tempfile::tempdir().unwrap();
        let path = project.path().join(".audioshelf/config.toml");
        write(&path, "[storage\n");
        let err = Config::load_layers(None, project.path()).unwrap_err();
        assert!(err.to_string().contains("config.toml"));
    }

    #[test]
    fn test_validate_invalid_url_and_format() {
        let mut config = Config::default();
        config.storage.public_url = Some("ftp://example.com".to_string());
        config.logging.format = Some("xml".to_string());
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].field.contains("public_url"));
        assert!(errors[1].message.contains("Invalid log format"));
    }

    #[test]
    fn test_validate_invalid_level() {
        let mut config = Config::default();
        config.logging.level = Some("loud=[".to_string());
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].field.contains("level"));
    }

    #[test]
    fn test_log_format_names() {
        assert_eq!(LogFormat::from_str("PRETTY"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::Json.as_str(), "json");
        assert!(LogFormat::from_str("xml").is_none());
    }
}
