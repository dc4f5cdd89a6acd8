use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use localshare::{Config, Node};

mod commands;

#[derive(Parser)]
#[command(name = "localshare")]
#[command(about = "Share text and files with peers on the local network", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Name other peers see for this machine
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// TCP port for incoming sessions
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Directory holding the identity key and resumable jobs
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List peers announcing on the local network
    Peers {
        /// Seconds to listen for announcements
        #[arg(short, long, default_value = "3")]
        wait: u64,
    },
    /// Send text or a file to a peer
    Send {
        #[command(subcommand)]
        payload: SendPayload,
    },
    /// Wait for incoming offers
    Receive {
        /// Directory where received files are written
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Accept every offer without prompting
        #[arg(short, long)]
        yes: bool,
    },
    /// Resume a paused outgoing transfer
    Resume {
        /// Job id as printed by `jobs`
        job: String,
    },
    /// List resumable jobs
    Jobs,
    /// Forget a job and delete its partial output
    Discard {
        /// Job id as printed by `jobs`
        job: String,
    },
}

#[derive(Subcommand)]
enum SendPayload {
    /// Send a text message
    Text {
        /// Peer id, id prefix or display name
        peer: String,
        message: String,
    },
    /// Send a single file
    File {
        /// Peer id, id prefix or display name
        peer: String,
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let mut config = Config::from_env()?;
    if let Some(name) = cli.name {
        config.display_name = name;
    }
    if let Some(port) = cli.port {
        config.transfer_addr.set_port(port);
    }
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }
    if let Commands::Receive { dir: Some(dir), .. } = &cli.command {
        config.download_dir = dir.clone();
    }

    let node = Node::start(config).await?;

    let outcome = match cli.command {
        Commands::Peers { wait } => commands::peers::run(&node, wait).await,
        Commands::Send { payload } => match payload {
            SendPayload::Text { peer, message } => {
                commands::send::run(&node, &peer, commands::send::Outgoing::Text(message)).await
            }
            SendPayload::File { peer, path } => {
                commands::send::run(&node, &peer, commands::send::Outgoing::File(path)).await
            }
        },
        Commands::Receive { yes, .. } => commands::receive::run(&node, yes).await,
        Commands::Resume { job } => commands::resume::run(&node, &job).await,
        Commands::Jobs => commands::jobs::list(&node),
        Commands::Discard { job } => commands::jobs::discard(&node, &job).await,
    };

    node.shutdown();
    outcome
}
