mod setup;

use aperture_core::Config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let app = crate::setup::initialize_app(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    app.shutdown().await;

    Ok(())
}
