use clap::Parser;
use pumpkin::{setup_logging, Cli, CliRunner, Config};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let args = Cli::parse();
    setup_logging(args.verbose);

    info!("starting pumpkin v{}", env!("CARGO_PKG_VERSION"));

    // Startup refuses with a one-line message naming the missing variable.
    let config = match Config::from_env().and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let _signal_task = spawn_signal_handler(shutdown_tx.clone());

    let runner = CliRunner::new(config, &args);
    match runner.run(args.command, shutdown_tx).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e}");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

fn spawn_signal_handler(
    shutdown_tx: tokio::sync::broadcast::Sender<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot install SIGINT handler: {e}");
                return;
            }
        };
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("cannot install SIGTERM handler: {e}");
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        let _ = shutdown_tx.send(());
    })
}
