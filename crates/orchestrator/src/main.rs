use cnc_orchestrator::kernel::OrchestratorKernel;
use cnc_orchestrator::Config;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let config = Config::from_env()?;
    let kernel = OrchestratorKernel::ignite(config).await.inspect_err(|err| {
        error!(%err, "failed to initialize orchestrator kernel");
    })?;
    kernel.serve().await
}
