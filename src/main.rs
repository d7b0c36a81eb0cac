use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};
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
    let http_port: u16 = std::env::var("BOOKMARKD_HTTP_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(7878);
    let session_ttl_secs: u64 = std::env::var("BOOKMARKD_SESSION_TTL_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(60 * 60);
    info!(
        target: "bookmarkd",
        "bookmarkd starting: RUST_LOG='{}', http_port={}, session_ttl_secs={}",
        rust_log, http_port, session_ttl_secs
    );

    bookmarkd::server::run_with_port(http_port, Duration::from_secs(session_ttl_secs)).await
}
