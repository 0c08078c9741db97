use anyhow::{Context, Result, anyhow, bail};
use pvctl::app::{self, Role};
use pvctl::config::Config;
use pvctl::logging::init_logging;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const USAGE: &str = "usage: pvctl <controller|router|canbridge|all> [--config PATH]";

struct Args {
    role: Role,
    config: Option<String>,
}

enum Command {
    Run(Args),
    Help,
    Version,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command> {
    let mut role = None;
    let mut config = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "-V" | "--version" => return Ok(Command::Version),
            "-c" | "--config" => {
                config = Some(args.next().ok_or_else(|| anyhow!("--config needs a path"))?);
            }
            other if role.is_none() => role = Some(other.parse::<Role>()?),
            other => bail!("unexpected argument '{}'\n{}", other, USAGE),
        }
    }
    let role = role.ok_or_else(|| anyhow!(USAGE))?;
    Ok(Command::Run(Args { role, config }))
}

async fn wait_for_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("Cannot install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = term.recv() => info!("SIGTERM received"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = match parse_args(std::env::args().skip(1))? {
        Command::Run(args) => args,
        Command::Help => {
            println!("{}", USAGE);
            return Ok(());
        }
        Command::Version => {
            println!("pvctl {}", env!("APP_VERSION"));
            return Ok(());
        }
    };

    let path = Config::locate(args.config.as_deref())
        .ok_or_else(|| anyhow!("No configuration file found"))?;
    let config = Config::from_file(&path)
        .and_then(|c| c.validate().map(|_| c))
        .with_context(|| format!("Configuration {}", path.display()))?;
    init_logging(&config.logging).context("Failed to initialize logging")?;

    info!(
        "pvctl {} starting as {} with {}",
        env!("APP_VERSION"),
        args.role,
        path.display()
    );

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    app::run(args.role, config, path, shutdown)
        .await
        .with_context(|| format!("Role {} failed to start", args.role))?;
    info!("pvctl stopped");
    Ok(())
}
