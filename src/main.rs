use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use wechat_core::agent::{self, config::Config};
use wechat_core::utils::{self, idgen::IdentifierGenerator};

#[derive(Parser)]
#[command(name = "wechat-core", version, about = "Access-token cache and secure callback server")]
struct AppCli {
    /// Config file path
    #[arg(short, long, default_value = "config.json", global = true)]
    config: String,

    /// Subcommands
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the callback server
    Serve {
        /// Overrides `webhook.port`
        #[arg(long)]
        port: Option<u16>,
    },
    /// Acquire an access token and print it
    Token,
    /// Print time-ordered identifiers
    Ids {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
}

fn load_config(path: &str) -> Result<Config> {
    let config = Config::from_file(path)?;
    utils::logging::init(&config.log_level);
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = AppCli::parse();

    match args.command {
        Some(Commands::Serve { port }) => {
            let config = load_config(&args.config)?;
            info!(path = %config.webhook.path, "starting callback server");
            agent::daemon::run(config, port).await?;
        }
        Some(Commands::Token) => {
            let config = load_config(&args.config)?;
            let cache = agent::daemon::credential_cache(&config)?;
            let credential = cache.get().await?;
            let expires_in = credential.expires_in(tokio::time::Instant::now());
            let out = json!({
                "access_token": credential.value(),
                "expires_in_secs": expires_in.as_secs(),
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Some(Commands::Ids { count }) => {
            utils::logging::init("warn");
            let ids = IdentifierGenerator::new();
            for _ in 0..count {
                println!("{}", ids.next());
            }
        }
        None => {
            // Default: run the daemon with the configured port
            let config = load_config(&args.config)?;
            agent::daemon::run(config, None).await?;
        }
    }

    Ok(())
}
