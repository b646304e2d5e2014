use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use leasehold::{
    ClientState, ClientStore, Config, DhcpServer, JsonClientStore, Result, UdpSocketTransport,
};

#[derive(Parser)]
#[command(name = "leasehold")]
#[command(author, version, about = "An embeddable DHCPv4 server", long_about = None)]
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
    ListClients,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("starting DHCP server with config: {:?}", cli.config);
            let transport = UdpSocketTransport::bind(&config)?;
            let store = JsonClientStore::new(&config.client_store_file);
            let server = Arc::new(DhcpServer::new(config, transport, store).await?);

            let handle = Arc::clone(&server);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("received shutdown signal, stopping server");
                    handle.stop();
                }
            });

            server.run().await
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::ListClients => {
            let store = JsonClientStore::new(&config.client_store_file);
            let records = store.read().await?;

            if records.is_empty() {
                println!("No known clients.");
            } else {
                println!(
                    "{:<24} {:<16} {:<10} {:<24}",
                    "Client ID", "IP Address", "State", "Lease End"
                );
                println!("{}", "-".repeat(76));

                for record in records {
                    let id = record
                        .identifier
                        .iter()
                        .map(|byte| format!("{:02x}", byte))
                        .collect::<Vec<_>>()
                        .join(":");
                    let state = match record.state {
                        ClientState::Released => "released",
                        ClientState::Offered => "offered",
                        ClientState::Assigned => "assigned",
                    };
                    let lease_end = match record.lease_end() {
                        Some(end) => end.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                        None => "-".to_string(),
                    };

                    println!(
                        "{:<24} {:<16} {:<10} {:<24}",
                        id, record.ip_address, state, lease_end
                    );
                }
            }

            Ok(())
        }
    }
}
