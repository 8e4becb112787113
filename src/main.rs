use nightline_orchestrator::config::Config;
use nightline_orchestrator::server;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("startup configuration error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server::run(config).await {
        tracing::error!("💥 server exited with error: {}", e);
        std::process::exit(1);
    }
}
