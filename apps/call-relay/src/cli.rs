use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "call-relay")]
#[command(about = "Signaling relay for one-to-one calls")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay (default when no command is given)
    Serve {
        /// Port to listen on
        #[arg(long, env = "CALL_RELAY_PORT")]
        port: Option<u16>,
    },
    /// Print a join token for a user
    MintToken {
        #[arg(long)]
        user_id: u64,

        /// Shared secret the relay verifies tokens with
        #[arg(long, env = "CALL_RELAY_SECRET", hide_env_values = true)]
        secret: String,
    },
}
