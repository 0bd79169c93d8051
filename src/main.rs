use tracing_subscriber::{EnvFilter, fmt};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    let http_port = std::env::var("PITCHDESK_HTTP_PORT").unwrap_or_else(|_| "8790".to_string());
    let db_folder = std::env::var("PITCHDESK_DB_FOLDER").unwrap_or_else(|_| "data".to_string());
    let identity_url = std::env::var("PITCHDESK_IDENTITY_URL").unwrap_or_else(|_| "<local>".to_string());
    info!(
        target: "pitchdesk",
        "PitchDesk starting: RUST_LOG='{}', http_port={}, identity={}, db_root='{}'",
        rust_log, http_port, identity_url, db_folder
    );

    pitchdesk::server::run().await
}
