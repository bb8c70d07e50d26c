use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dhcpserve::lease::INFINITE_LEASE;
use dhcpserve::persistence::read_records;
use dhcpserve::{Client, Config, DhcpServer, Error, Result, ServerConfig};

/// Pause before a failed instance is rebuilt.
const RESTART_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "dhcpserve")]
#[command(author, version, about = "A multi-subnet DHCP server", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
    ListLeases,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let loaded = Config::load_or_create(&cli.config)?;
    for rejected in &loaded.rejected {
        error!(
            "Skipping server entry {} ({}): {}",
            rejected.index,
            rejected.name.as_deref().unwrap_or("unnamed"),
            rejected.error
        );
    }
    let config = loaded.config;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            if config.servers.is_empty() {
                return Err(Error::InvalidConfig("no usable server entries".to_string()));
            }

            info!("Starting DHCP servers with config: {:?}", cli.config);
            let (shutdown, _) = watch::channel(false);
            let supervisors: Vec<_> = config
                .servers
                .into_iter()
                .map(|server| tokio::spawn(supervise(server, shutdown.subscribe())))
                .collect();

            tokio::signal::ctrl_c().await?;
            info!("Received shutdown signal, stopping servers...");
            shutdown.send_replace(true);

            for supervisor in supervisors {
                if let Err(e) = supervisor.await {
                    error!("Supervisor task failed: {}", e);
                }
            }
            Ok(())
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListLeases => {
            println!(
                "{:<12} {:<24} {:<16} {:<10} {:<24}",
                "Server", "Client ID", "IP Address", "State", "Expires At"
            );
            println!("{}", "-".repeat(90));

            let now = Utc::now();
            for server in &config.servers {
                let Some(path) = &server.leases_file else {
                    continue;
                };
                let records = match read_records(path).await {
                    Ok(records) => records,
                    Err(e) => {
                        warn!("Cannot read lease file {}: {}", path.display(), e);
                        continue;
                    }
                };

                for record in records {
                    let client = Client::from(record);
                    let end = client.lease_end_time();
                    let expires = if client.lease_duration == INFINITE_LEASE {
                        "never".to_string()
                    } else if end < now {
                        "expired".to_string()
                    } else {
                        end.format("%Y-%m-%d %H:%M:%S UTC").to_string()
                    };

                    println!(
                        "{:<12} {:<24} {:<16} {:<10} {:<24}",
                        server.name,
                        client.identifier_hex(),
                        client.ip_address,
                        client.state,
                        expires
                    );
                }
            }
            Ok(())
        }
    }
}

/// Keeps one instance alive until shutdown, rebuilding it after a fixed
/// backoff whenever it fails to bind or stops with an error.
async fn supervise(config: ServerConfig, mut shutdown: watch::Receiver<bool>) {
    loop {
        match DhcpServer::bind(config.clone()).await {
            Ok(server) => {
                let server = Arc::new(server);
                let stopper = {
                    let server = Arc::clone(&server);
                    let mut shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let _ = shutdown.wait_for(|stop| *stop).await;
                        server.stop();
                    })
                };

                let result = server.run().await;
                stopper.abort();

                if *shutdown.borrow() {
                    return;
                }
                match result {
                    Ok(()) => warn!("Server {} stopped unexpectedly", config.name),
                    Err(e) => error!("Server {} stopped: {}", config.name, e),
                }
            }
            Err(e) => error!("Cannot start server {}: {}", config.name, e),
        }

        info!(
            "Restarting server {} in {}s",
            config.name,
            RESTART_BACKOFF.as_secs()
        );
        tokio::select! {
            _ = tokio::time::sleep(RESTART_BACKOFF) => {}
            _ = shutdown.wait_for(|stop| *stop) => return,
        }
    }
}
