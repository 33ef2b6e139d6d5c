//! Fleet Command Line Interface
//!
//! Usage:
//!   fleet serve                 - Start the fleet server
//!   fleet env create <name>     - Create an environment
//!   fleet node list <env>       - List enrolled nodes
//!   fleet query create <env>    - Create a distributed query
//!   fleet carve archive <env>   - Reassemble a completed carve

use clap::{Parser, Subcommand};
use fleet_api::telemetry::init_logging;
use fleet_api::{run_server, FleetConfig};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "fleet")]
#[command(about = "Fleet control plane for osquery agents")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Database URL (`memory` or `sqlite:<path>`), overrides the config file
    #[arg(long)]
    db_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the fleet server
    Serve {
        /// Host to bind to
        #[arg(short = 'H', long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Manage environments
    Env {
        #[command(subcommand)]
        action: EnvCommands,
    },

    /// Inspect and remove nodes
    Node {
        #[command(subcommand)]
        action: NodeCommands,
    },

    /// Manage distributed queries
    Query {
        #[command(subcommand)]
        action: QueryCommands,
    },

    /// Manage file carves
    Carve {
        #[command(subcommand)]
        action: CarveCommands,
    },
}

#[derive(Subcommand)]
pub enum EnvCommands {
    /// Create an environment
    Create {
        name: String,
        /// Hostname agents use to reach the service
        #[arg(long)]
        hostname: String,
    },
    /// List environments
    List,
    /// Show an environment, secrets included
    Show { env: String },
    /// Generate a new enroll secret
    RotateSecret { env: String },
    /// Generate a new enroll path and extend its expiry
    RotateEnroll { env: String },
    /// Expire the enroll path now
    ExpireEnroll { env: String },
    /// Generate a new removal path and extend its expiry
    RotateRemove { env: String },
    /// Expire the removal path now
    ExpireRemove { env: String },
    /// Allow new enrollments
    AcceptEnrolls { env: String },
    /// Refuse new enrollments
    RejectEnrolls { env: String },
}

#[derive(Subcommand)]
pub enum NodeCommands {
    /// List nodes of an environment
    List { env: String },
    /// Show one node with its archived records
    Show { env: String, uuid: String },
    /// Archive and delete a node
    Remove { env: String, uuid: String },
}

#[derive(Subcommand)]
pub enum QueryCommands {
    /// Create a distributed query
    Create {
        env: String,
        /// SQL text
        #[arg(short, long)]
        query: String,
        /// Query name, generated when omitted
        #[arg(short, long)]
        name: Option<String>,
        /// Targets as `type:value` (environment, platform, uuid, localname)
        #[arg(short, long = "target")]
        targets: Vec<String>,
        /// Hide from default listings
        #[arg(long)]
        hidden: bool,
        /// Refuse deletion
        #[arg(long)]
        protected: bool,
    },
    /// List queries
    List {
        env: String,
        /// all, active, completed or deleted
        #[arg(short, long, default_value = "all")]
        status: String,
        #[arg(long)]
        include_hidden: bool,
    },
    /// Mark a query completed
    Complete { env: String, name: String },
    /// Reactivate a query
    Activate { env: String, name: String },
    /// Soft-delete a query
    Delete { env: String, name: String },
}

#[derive(Subcommand)]
pub enum CarveCommands {
    /// Create a carve query for a path
    Create {
        env: String,
        /// File path to carve on the targeted nodes
        #[arg(short, long)]
        path: String,
        /// Targets as `type:value`
        #[arg(short, long = "target")]
        targets: Vec<String>,
    },
    /// List carve sessions
    List { env: String },
    /// Reassemble a completed carve session
    Archive { env: String, session: String },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = match FleetConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(url) = cli.db_url {
        config.database.url = url;
    }
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run_command(cli.command, config).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run_command(command: Commands, mut config: FleetConfig) -> commands::CmdResult {
    match command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            println!("Starting fleet server on {}...", config.server.bind_address());
            run_server(config).await
        }
        Commands::Env { action } => commands::handle_env_command(action, &config).await,
        Commands::Node { action } => commands::handle_node_command(action, &config).await,
        Commands::Query { action } => commands::handle_query_command(action, &config).await,
        Commands::Carve { action } => commands::handle_carve_command(action, &config).await,
    }
}
