#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use clap::Parser as _;
use cli::Cli;
use poolgate::build;
use poolgate::config::GatewayConfig;
use poolgate::runtime::GatewayRuntime;

mod cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tokio_graceful=off,poolgate=info".into()),
        )
        .init();

    tracing::info!(
        "poolgate version: v{} commit: {} buildtime: {}",
        build::PKG_VERSION,
        build::COMMIT_HASH,
        build::BUILD_TIME
    );
    tracing::info!("current process PID: {}", std::process::id());

    let fut = async {
        let config = GatewayConfig::from_env();
        if config.api_secret_token_was_generated {
            tracing::warn!(
                token = %config.api_secret_token,
                "API_SECRET_TOKEN was not set, generated a random one for this run"
            );
        }

        tracing::info!("starting gateway runtime now");
        GatewayRuntime::from_config(config, &cli.config)
            .await?
            .serve_forever()
            .await?;

        tracing::info!("gracefully exiting now");
        Ok::<_, anyhow::Error>(())
    };

    if let Err(error) = fut.await {
        tracing::error!(error = format!("{error:#}"));
        std::process::exit(1);
    }
}
