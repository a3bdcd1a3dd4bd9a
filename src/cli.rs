use clap::{Parser, Subcommand};

/// msgate: build, run and route user-submitted microservices
#[derive(Parser)]
#[command(name = "msgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind (defaults to PORT from the environment)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Inspect or remove registered services
    Services {
        #[command(subcommand)]
        command: ServiceCommands,
    },

    /// Send a test request to a service through a running gateway
    Probe {
        /// Service id
        id: String,
        /// Path inside the service, e.g. /api/suma?num1=5&num2=10
        #[arg(default_value = "/")]
        endpoint: String,
        #[arg(short, long, default_value = "GET")]
        method: String,
        /// JSON body, sent for POST, PUT and PATCH only
        #[arg(short, long)]
        body: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ServiceCommands {
    /// List services with their reconciled status
    List,
    /// Show one service
    Show { id: String },
    /// Stop and remove a service's container, image and record
    Delete { id: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_defaults() {
        let cli = Cli::parse_from(["msgate", "probe", "4b8f"]);
        match cli.command {
            Some(Commands::Probe {
                id,
                endpoint,
                method,
                body,
            }) => {
                assert_eq!(id, "4b8f");
                assert_eq!(endpoint, "/");
                assert_eq!(method, "GET");
                assert!(body.is_none());
            }
            _ => panic!("expected probe"),
        }
    }

    #[test]
    fn test_parse_services_delete() {
        let cli = Cli::parse_from(["msgate", "services", "delete", "abc"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Services {
                command: ServiceCommands::Delete { .. }
            })
        ));
    }

    #[test]
    fn test_no_subcommand_serves() {
        let cli = Cli::parse_from(["msgate"]);
        assert!(cli.command.is_none());
    }
}
