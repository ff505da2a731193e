use anyhow::Result;
use clap::Parser;
use perfgate::cli::{Cli, Commands};
use perfgate::commands;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,perfgate=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    if let Err(err) = init_tracing() {
        eprintln!("perfgate: {err:#}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Commands::Validate(args) => commands::validate(&args),
        Commands::Run(args) => {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    eprintln!("perfgate: failed to start runtime: {err}");
                    return ExitCode::FAILURE;
                }
            };
            runtime.block_on(async move {
                let cancel = CancellationToken::new();
                let on_signal = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::warn!("interrupt received; cancelling runs");
                        on_signal.cancel();
                    }
                });
                match commands::run(args, cancel).await {
                    Ok(code) => code,
                    Err(err) => {
                        tracing::error!(error = %format!("{err:#}"), "run failed");
                        eprintln!("perfgate: {err:#}");
                        ExitCode::FAILURE
                    }
                }
            })
        }
    }
}
