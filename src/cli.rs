use clap::{Parser, Subcommand};

/// QueueDesk — token queue engine for service desks
#[derive(Parser)]
#[command(name = "queuedesk", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP/WebSocket server
    Serve {
        /// Port to bind (overrides QUEUEDESK_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Rebuild every counter queue from the ledger
    Resync,

    /// Show counters with their waiting queues
    Counters,

    /// Operate on tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Issue a token for a service
    Create {
        /// Service id (e.g. DEP)
        #[arg(long, conflicts_with = "service")]
        service_id: Option<String>,
        /// Service name, case-insensitive (e.g. "Deposit")
        #[arg(long)]
        service: Option<String>,
        /// Route to this counter instead of the first open one
        #[arg(long)]
        counter_id: Option<i32>,
    },
    /// Call the next token at a counter
    Next {
        #[arg(long)]
        counter_id: i32,
    },
    /// Mark a called token as served
    Serve { token_id: String },
    /// Skip a token
    Skip { token_id: String },
    /// Call a skipped token again
    Recall {
        token_id: String,
        #[arg(long)]
        counter_id: i32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_create() {
        let cli = Cli::try_parse_from(["queuedesk", "token", "create", "--service-id", "DEP"]).unwrap();
        match cli.command {
            Some(Commands::Token {
                command: TokenCommands::Create { service_id, counter_id, .. },
            }) => {
                assert_eq!(service_id.as_deref(), Some("DEP"));
                assert_eq!(counter_id, None);
            }
            _ => panic!("expected token create"),
        }
    }

    #[test]
    fn test_service_id_and_name_conflict() {
        let res = Cli::try_parse_from([
            "queuedesk", "token", "create", "--service-id", "DEP", "--service", "Deposit",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn test_recall_requires_counter() {
        assert!(Cli::try_parse_from(["queuedesk", "token", "recall", "20251220-001"]).is_err());
    }
}
