use std::path::PathBuf;

use clap::Parser;
use exchange_handshake::{
    exchange::ExchangeId,
    handshake::{FileRecoveryLog, HandshakeConfig, HandshakeError, RecoveryLog},
    utill::{get_handshake_dir, setup_logger},
};

/// handshake-cli inspects the recovery checkpoints and the configuration of a handshake node.
#[derive(Parser, Debug)]
#[clap(version = option_env ! ("CARGO_PKG_VERSION").unwrap_or("unknown"),
author = option_env ! ("CARGO_PKG_AUTHORS").unwrap_or(""))]
struct App {
    /// Optional data directory. Default value : "~/.handshake"
    #[clap(long, short = 'd')]
    data_directory: Option<PathBuf>,
    /// The command to execute
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Lists the exchange ids with a recovery checkpoint
    List,
    /// Prints the recovery checkpoint of an exchange as json
    Show {
        /// Exchange id
        exchange_id: String,
    },
    /// Prints the effective configuration
    Config,
}

fn main() -> Result<(), HandshakeError> {
    let args = App::parse();
    let data_dir = args.data_directory.unwrap_or_else(get_handshake_dir);
    setup_logger(log::LevelFilter::Warn, Some(data_dir.clone()));

    let recovery = FileRecoveryLog::new(&data_dir);

    match args.command {
        Commands::List => {
            for id in recovery.list()? {
                println!("{}", id);
            }
        }
        Commands::Show { exchange_id } => match recovery.load(&ExchangeId::new(exchange_id))? {
            Some(handshake) => {
                let json = serde_json::to_string_pretty(&handshake)
                    .map_err(|_| HandshakeError::General("cannot encode checkpoint as json"))?;
                println!("{}", json);
            }
            None => println!("No checkpoint found"),
        },
        Commands::Config => {
            let config = HandshakeConfig::new(Some(&data_dir.join("config.toml")))?;
            println!("{:#?}", config);
        }
    }

    Ok(())
}
