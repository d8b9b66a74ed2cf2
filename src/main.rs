use leafcare::utils::{ensure_files_exist, load_env_file, Settings};
use leafcare::{init_logging, run_server, AppState};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_file = load_env_file()?;
    let settings = Settings::from_env()?;
    init_logging(settings.log_level);

    info!("=== Plant Disease Classifier v{} ===", env!("CARGO_PKG_VERSION"));
    match env_file {
        Some(path) => info!("Loaded environment variables from {}", path.display()),
        None => warn!("No .env.local file found in expected locations"),
    }

    ensure_files_exist(&settings).await?;
    let state = AppState::initialize(&settings).await?;

    run_server(&settings, state).await?;
    Ok(())
}
