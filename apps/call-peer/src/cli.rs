use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(name = "call-peer", about = "Place or receive a one-to-one call through a relay")]
pub struct Cli {
    /// Relay base url; overrides CALL__RELAY_URL
    #[arg(long, env = "CALL_PEER_RELAY")]
    pub relay: Option<String>,

    /// Identity to join the relay as
    #[arg(long, env = "CALL_PEER_USER_ID")]
    pub user_id: u64,

    /// Join token minted by `call-relay mint-token`
    #[arg(long, env = "CALL_PEER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Call another user and stay on until either side hangs up
    Dial {
        #[arg(long)]
        target: u64,

        #[arg(long)]
        room: u64,

        /// Audio only; video calls are the default
        #[arg(long)]
        audio_only: bool,
    },
    /// Wait for incoming calls
    Listen {
        /// Answer every call without asking
        #[arg(long)]
        auto_answer: bool,
    },
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "CALL_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "CALL_LOG_FILE",
        help = "Write logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}
