use crate::constants::{AWS_STORE, AZURE_STORE, GCP_STORE};
use crate::error::{CostError, Result};
use crate::infra::http_client::RetryPolicy;
use crate::types::Provider;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "finops.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub ingestion: IngestionConfig,
    pub aws: AwsConfig,
    pub azure: AzureConfig,
    pub gcp: GcpConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub stores: StoreNames,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            stores: StoreNames::default(),
        }
    }
}

/// Store name per provider, without the file extension.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StoreNames {
    pub aws: String,
    pub azure: String,
    pub gcp: String,
}

impl Default for StoreNames {
    fn default() -> Self {
        Self {
            aws: AWS_STORE.to_string(),
            azure: AZURE_STORE.to_string(),
            gcp: GCP_STORE.to_string(),
        }
    }
}

impl StoreNames {
    pub fn for_provider(&self, provider: Provider) -> &str {
        match provider {
            Provider::Aws => &self.aws,
            Provider::Azure => &self.azure,
            Provider::Gcp => &self.gcp,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    /// Upper bound on one provider's whole fetch, pagination included.
    pub fetch_timeout_secs: u64,
    /// Upper bound on a single HTTP request.
    pub request_timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// BigQuery result polls before giving up on an incomplete job.
    pub max_result_polls: u32,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_secs: 300,
            request_timeout_secs: 60,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            max_result_polls: 30,
        }
    }
}

impl IngestionConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    /// Signing region. Cost Explorer is served from us-east-1.
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            session_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub subscription_id: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub access_token: Option<String>,
    pub management_endpoint: String,
    pub login_endpoint: String,
    pub api_version: String,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            subscription_id: None,
            tenant_id: None,
            client_id: None,
            client_secret: None,
            access_token: None,
            management_endpoint: "https://management.azure.com".to_string(),
            login_endpoint: "https://login.microsoftonline.com".to_string(),
            api_version: "2023-03-01".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcpConfig {
    pub project_id: Option<String>,
    pub dataset: Option<String>,
    pub table: Option<String>,
    pub access_token: Option<String>,
    pub endpoint: String,
    pub metadata_endpoint: String,
}

impl Default for GcpConfig {
    fn default() -> Self {
        Self {
            project_id: None,
            dataset: None,
            table: None,
            access_token: None,
            endpoint: "https://bigquery.googleapis.com".to_string(),
            metadata_endpoint: "http://metadata.google.internal".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            filter: "finops_costs=info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file and overlay environment variables.
    ///
    /// Lookup order for the file: `path`, then `FINOPS_CONFIG`, then
    /// `finops.toml` in the working directory. An explicitly named file must
    /// exist; without one the defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("FINOPS_CONFIG").ok().map(PathBuf::from));

        let mut config = match explicit {
            Some(p) => Self::from_file(&p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            CostError::Config(format!("Failed to read config file '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay values from the environment; empty variables are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(dir) = get("FINOPS_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = get("FINOPS_LOG_DIR") {
            self.logging.dir = PathBuf::from(dir);
        }
        if let Some(port) = get("FINOPS_PORT") {
            self.server.port = port
                .parse()
                .map_err(|e| CostError::Config(format!("FINOPS_PORT '{port}': {e}")))?;
        }

        let set = |slot: &mut Option<String>, key: &str| {
            if let Some(v) = get(key) {
                *slot = Some(v);
            }
        };
        set(&mut self.aws.access_key_id, "AWS_ACCESS_KEY_ID");
        set(&mut self.aws.secret_access_key, "AWS_SECRET_ACCESS_KEY");
        set(&mut self.aws.session_token, "AWS_SESSION_TOKEN");
        if let Some(region) = get("AWS_REGION") {
            self.aws.region = region;
        }

        set(&mut self.azure.subscription_id, "AZURE_SUBSCRIPTION_ID");
        set(&mut self.azure.tenant_id, "AZURE_TENANT_ID");
        set(&mut self.azure.client_id, "AZURE_CLIENT_ID");
        set(&mut self.azure.client_secret, "AZURE_CLIENT_SECRET");
        set(&mut self.azure.access_token, "AZURE_ACCESS_TOKEN");

        set(&mut self.gcp.project_id, "GCP_PROJECT_ID");
        set(&mut self.gcp.dataset, "GCP_DATASET");
        set(&mut self.gcp.table, "GCP_TABLE");
        set(&mut self.gcp.access_token, "GCP_ACCESS_TOKEN");

        Ok(())
    }
}
