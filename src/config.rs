use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use uuid::Uuid;

/// Default ceiling for a single request body (all multipart parts together).
const DEFAULT_MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub spool_dir: String,
    pub database_url: String,
    pub public_url: String,
    pub signing_key: String,
    pub admin_secret: Option<String>,
    pub clamd_addr: Option<String>,
    pub max_body_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "File storage gateway")]
pub struct Args {
    /// Host to bind to (overrides FILE_GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where file contents are stored (overrides FILE_GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Directory where uploads wait while being scanned and stored
    /// (overrides FILE_GATEWAY_SPOOL_DIR)
    #[arg(long)]
    pub spool_dir: Option<String>,

    /// Database URL (overrides FILE_GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Externally reachable base URL, used to build presigned URLs
    /// (overrides FILE_GATEWAY_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Key used to sign presigned URLs (overrides FILE_GATEWAY_SIGNING_KEY)
    #[arg(long)]
    pub signing_key: Option<String>,

    /// Secret required in `x-admin-secret` for maintenance endpoints
    /// (overrides FILE_GATEWAY_ADMIN_SECRET)
    #[arg(long)]
    pub admin_secret: Option<String>,

    /// clamd address, e.g. `127.0.0.1:3310` (overrides FILE_GATEWAY_CLAMD_ADDR)
    #[arg(long)]
    pub clamd_addr: Option<String>,

    /// Maximum request body size in bytes (overrides FILE_GATEWAY_MAX_BODY_BYTES)
    #[arg(long)]
    pub max_body_bytes: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("FILE_GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env("FILE_GATEWAY_PORT", 8000u16)?;
        let env_storage =
            env::var("FILE_GATEWAY_STORAGE_DIR").unwrap_or_else(|_| "./data/files".into());
        let env_spool =
            env::var("FILE_GATEWAY_SPOOL_DIR").unwrap_or_else(|_| "./data/spool".into());
        let env_db = env::var("FILE_GATEWAY_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/file_gateway.db".into());
        let env_max_body = parse_env("FILE_GATEWAY_MAX_BODY_BYTES", DEFAULT_MAX_BODY_BYTES)?;

        let port = args.port.unwrap_or(env_port);
        let public_url = args
            .public_url
            .or_else(|| env::var("FILE_GATEWAY_PUBLIC_URL").ok())
            .unwrap_or_else(|| format!("http://localhost:{}", port));

        // A random key still works for a single process; presigned URLs just
        // do not survive a restart.
        let signing_key = match args
            .signing_key
            .or_else(|| env::var("FILE_GATEWAY_SIGNING_KEY").ok())
        {
            Some(key) => key,
            None => {
                tracing::warn!("no signing key configured, presigned URLs will not survive restarts");
                format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
            }
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            spool_dir: args.spool_dir.unwrap_or(env_spool),
            database_url: args.database_url.unwrap_or(env_db),
            public_url: public_url.trim_end_matches('/').to_string(),
            signing_key,
            admin_secret: args
                .admin_secret
                .or_else(|| env::var("FILE_GATEWAY_ADMIN_SECRET").ok())
                .filter(|s| !s.is_empty()),
            clamd_addr: args
                .clamd_addr
                .or_else(|| env::var("FILE_GATEWAY_CLAMD_ADDR").ok())
                .filter(|s| !s.is_empty()),
            max_body_bytes: args.max_body_bytes.unwrap_or(env_max_body),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
