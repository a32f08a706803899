use anyhow::Result;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use handlers::AppState;
use services::{
    content_store::DiskContentStore,
    metadata_store::SqliteMetadataStore,
    scanner::{AntivirusScanner, ClamdScanner, NoOpScanner},
    spool::Spooler,
    storage_service::FileService,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!(
        host = %cfg.host,
        port = cfg.port,
        storage_dir = %cfg.storage_dir,
        spool_dir = %cfg.spool_dir,
        database_url = %cfg.database_url,
        public_url = %cfg.public_url,
        clamd = cfg.clamd_addr.as_deref().unwrap_or("disabled"),
        ops_protected = cfg.admin_secret.is_some(),
        "Starting file-gateway"
    );

    // --- Ensure storage and spool directories exist ---
    for dir in [&cfg.storage_dir, &cfg.spool_dir] {
        if !Path::new(dir).exists() {
            fs::create_dir_all(dir)?;
            tracing::info!("Created directory at {}", dir);
        }
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    let db_path_obj = Path::new(db_path);
    if !db_path.starts_with(":memory:") {
        // Create parent directory if needed
        if let Some(parent) = db_path_obj.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }

        // SQLx will not create the database file itself
        match fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(db_path)
        {
            Ok(_) => tracing::debug!("Database file can be created/opened."),
            Err(e) => tracing::warn!("Failed to open database file manually: {}", e),
        }
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );
    let metadata = SqliteMetadataStore::new(db);

    // --- Apply schema; migration mode stops here ---
    metadata.migrate().await?;
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize collaborators ---
    let content = DiskContentStore::new(&cfg.storage_dir, &cfg.signing_key);
    let scanner: Arc<dyn AntivirusScanner> = match &cfg.clamd_addr {
        Some(addr) => Arc::new(ClamdScanner::new(addr.clone())),
        None => {
            tracing::warn!("no clamd address configured, uploads are not scanned");
            Arc::new(NoOpScanner)
        }
    };
    let service = FileService::new(Arc::new(metadata), Arc::new(content), scanner);

    let state = AppState {
        service,
        public_url: cfg.public_url.clone(),
        admin_secret: cfg.admin_secret.clone(),
        spooler: Spooler::new(&cfg.spool_dir),
    };

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_body_bytes).with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
