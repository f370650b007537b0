//! Configuration module
//!
//! Environment-driven configuration for the database pool, the storage
//! backend and the reconciliation sweep. `.env` files are honoured through
//! dotenvy.

use std::env;
use std::time::Duration;

use crate::storage_types::StorageBackend;

const DB_MAX_CONNECTIONS: u32 = 10;
const DB_TIMEOUT_SECS: u64 = 30;
const DEFAULT_S3_REGION: &str = "us-east-1";
const DEFAULT_OSS_REGION: &str = "cn-hangzhou";
const DEFAULT_LOCAL_BASE_URL: &str = "http://localhost:8080/files";
const RECONCILE_INTERVAL_SECS: u64 = 3600;
const RECONCILE_PENDING_MAX_AGE_SECS: u64 = 24 * 3600;
const RECONCILE_UPLOADING_MAX_AGE_SECS: u64 = 7 * 24 * 3600;
const RECONCILE_BATCH_SIZE: i64 = 100;

#[derive(Clone, Debug)]
pub struct S3Config {
    pub region: String,
    pub bucket: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Custom endpoint for S3-compatible providers (MinIO, R2, ...)
    pub endpoint: Option<String>,
    pub use_path_style: bool,
}

#[derive(Clone, Debug)]
pub struct OssConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key_id: String,
    pub access_key_secret: String,
}

impl OssConfig {
    /// Region embedded in an `oss-{region}.aliyuncs.com` endpoint, with the
    /// public default when the endpoint does not follow that shape.
    pub fn region(&self) -> String {
        let host = self
            .endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        let host = host.split(['/', ':']).next().unwrap_or_default();

        host.split('.')
            .next()
            .and_then(|label| label.strip_prefix("oss-"))
            .map(|region| region.trim_end_matches("-internal"))
            .filter(|region| !region.is_empty())
            .map(String::from)
            .unwrap_or_else(|| DEFAULT_OSS_REGION.to_string())
    }

    /// Endpoint with a scheme, as required by the SDK.
    pub fn endpoint_url(&self) -> String {
        if self.endpoint.starts_with("http://") || self.endpoint.starts_with("https://") {
            self.endpoint.clone()
        } else {
            format!("https://{}", self.endpoint)
        }
    }
}

#[derive(Clone, Debug)]
pub struct LocalStorageConfig {
    pub base_path: String,
    pub base_url: String,
    /// HMAC key for presigned local URLs. A random key is generated when absent.
    pub signing_secret: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ReconcileConfig {
    pub interval: Duration,
    /// `None` disables reaping of `pending` rows.
    pub pending_max_age: Option<Duration>,
    /// `None` disables reaping of `uploading` rows.
    pub uploading_max_age: Option<Duration>,
    pub batch_size: i64,
}

/// Application configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub storage_backend: StorageBackend,
    pub s3: Option<S3Config>,
    pub oss: Option<OssConfig>,
    pub local: Option<LocalStorageConfig>,
    pub verify_on_confirm: bool,
    pub reconcile: ReconcileConfig,
}

fn var_opt(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn var_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    var_opt(name)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn var_bool(name: &str, default: bool) -> bool {
    match var_opt(name).map(|v| v.to_lowercase()) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

/// Seconds to an optional duration; 0 means disabled.
fn var_max_age(name: &str, default_secs: u64) -> Option<Duration> {
    match var_parse(name, default_secs) {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let storage_backend = match var_opt("STORAGE_TYPE") {
            Some(v) => v.parse::<StorageBackend>()?,
            None => StorageBackend::S3,
        };

        let s3 = var_opt("S3_BUCKET").map(|bucket| S3Config {
            region: var_opt("S3_REGION")
                .or_else(|| var_opt("AWS_REGION"))
                .unwrap_or_else(|| DEFAULT_S3_REGION.to_string()),
            bucket,
            access_key_id: var_opt("S3_ACCESS_KEY_ID"),
            secret_access_key: var_opt("S3_SECRET_ACCESS_KEY"),
            endpoint: var_opt("S3_ENDPOINT"),
            use_path_style: var_bool("S3_USE_PATH_STYLE", false),
        });

        let oss = match (var_opt("OSS_ENDPOINT"), var_opt("OSS_BUCKET")) {
            (Some(endpoint), Some(bucket)) => Some(OssConfig {
                endpoint,
                bucket,
                access_key_id: var_opt("OSS_ACCESS_KEY_ID").unwrap_or_default(),
                access_key_secret: var_opt("OSS_ACCESS_KEY_SECRET").unwrap_or_default(),
            }),
            _ => None,
        };

        let local = var_opt("LOCAL_STORAGE_PATH").map(|base_path| LocalStorageConfig {
            base_path,
            base_url: var_opt("LOCAL_STORAGE_BASE_URL")
                .unwrap_or_else(|| DEFAULT_LOCAL_BASE_URL.to_string()),
            signing_secret: var_opt("LOCAL_STORAGE_SIGNING_SECRET"),
        });

        let reconcile = ReconcileConfig {
            interval: Duration::from_secs(
                var_parse("RECONCILE_INTERVAL_SECS", RECONCILE_INTERVAL_SECS).max(1),
            ),
            pending_max_age: var_max_age(
                "RECONCILE_PENDING_MAX_AGE_SECS",
                RECONCILE_PENDING_MAX_AGE_SECS,
            ),
            uploading_max_age: var_max_age(
                "RECONCILE_UPLOADING_MAX_AGE_SECS",
                RECONCILE_UPLOADING_MAX_AGE_SECS,
            ),
            batch_size: var_parse("RECONCILE_BATCH_SIZE", RECONCILE_BATCH_SIZE).max(1),
        };

        Ok(Config {
            database_url: var_opt("DATABASE_URL").unwrap_or_default(),
            db_max_connections: var_parse("DB_MAX_CONNECTIONS", DB_MAX_CONNECTIONS),
            db_timeout_seconds: var_parse("DB_TIMEOUT_SECONDS", DB_TIMEOUT_SECS),
            storage_backend,
            s3,
            oss,
            local,
            verify_on_confirm: var_bool("VERIFY_ON_CONFIRM", false),
            reconcile,
        })
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if !self.database_url.starts_with("postgres://")
            && !self.database_url.starts_with("postgresql://")
        {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid PostgreSQL connection string"
            ));
        }

        self.validate_storage()
    }

    /// Check that the selected backend has its required settings.
    pub fn validate_storage(&self) -> Result<(), anyhow::Error> {
        match self.storage_backend {
            StorageBackend::S3 => {
                let s3 = self.s3.as_ref().ok_or_else(|| {
                    anyhow::anyhow!("S3_BUCKET must be set when using S3 storage backend")
                })?;
                if s3.access_key_id.is_some() != s3.secret_access_key.is_some() {
                    return Err(anyhow::anyhow!(
                        "S3_ACCESS_KEY_ID and S3_SECRET_ACCESS_KEY must be set together"
                    ));
                }
            }
            StorageBackend::Oss => {
                let oss = self.oss.as_ref().ok_or_else(|| {
                    anyhow::anyhow!(
                        "OSS_ENDPOINT and OSS_BUCKET must be set when using OSS storage backend"
                    )
                })?;
                if oss.access_key_id.is_empty() || oss.access_key_secret.is_empty() {
                    return Err(anyhow::anyhow!(
                        "OSS_ACCESS_KEY_ID and OSS_ACCESS_KEY_SECRET must be set when using OSS storage backend"
                    ));
                }
            }
            StorageBackend::Local => {
                if self.local.is_none() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_STORAGE_PATH must be set when using local storage backend"
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn db_max_connections(&self) -> u32 {
        self.db_max_connections
    }

    pub fn db_timeout_seconds(&self) -> u64 {
        self.db_timeout_seconds
    }

    pub fn storage_backend(&self) -> StorageBackend {
        self.storage_backend
    }

    pub fn verify_on_confirm(&self) -> bool {
        self.verify_on_confirm
    }
}
