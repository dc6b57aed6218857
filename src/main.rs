use anyhow::Result;
use clap::{Parser, Subcommand};
use shotcaller::config::Config;
use shotcaller::registry::ModelRegistry;
use shotcaller::security::AesEncryptor;
use std::path::PathBuf;

/// Admission control and credential rotation gateway for AI generation.
#[derive(Parser)]
#[command(name = "shotcaller", version, about)]
struct Cli {
    /// Config file (defaults to $SHOTCALLER_CONFIG, then ~/.shotcaller/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Bind address (overrides [gateway] host)
        #[arg(long)]
        host: Option<String>,
        /// Port (overrides [gateway] port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Create the vault master key
    Keygen,
    /// Print the model catalog
    Models,
    /// Load and validate the configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("shotcaller=info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            let port = port.unwrap_or(config.gateway.port);
            shotcaller::gateway::run_gateway(&host, port, config).await
        }
        Commands::Keygen => {
            let path = config.vault_key_path();
            AesEncryptor::generate_key_file(&path)?;
            println!("Vault key written to {}", path.display());
            Ok(())
        }
        Commands::Models => {
            let registry = ModelRegistry::from_models(config.catalog())?;
            println!("{:<24} {:<10} {:<10}", "MODEL", "PROVIDER", "GROUP");
            for model in registry.list() {
                println!(
                    "{:<24} {:<10} {:<10}",
                    model.id,
                    model.provider.id(),
                    model.group.as_str()
                );
            }
            Ok(())
        }
        Commands::CheckConfig => {
            let registry = ModelRegistry::from_models(config.catalog())?;
            println!("Config OK");
            println!("  data_dir:   {}", config.data_dir.display());
            println!("  gateway:    {}:{}", config.gateway.host, config.gateway.port);
            println!("  models:     {}", registry.len());
            println!(
                "  admin API:  {}",
                if config.gateway.admin_token.is_some() { "enabled" } else { "disabled" }
            );
            for &kind in shotcaller::providers::ProviderKind::ALL {
                let provider = config.provider(kind);
                println!(
                    "  {:<10}  timeout {}s, {} seed key(s)",
                    kind.id(),
                    provider.timeout_secs,
                    provider.api_keys.len()
                );
            }
            Ok(())
        }
    }
}
