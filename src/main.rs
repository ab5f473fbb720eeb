//! scbridge CLI - runs the authoring bridge server or submits a change set.
//!
//! See the `scbridge` library for the core functionality.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mimalloc::MiMalloc;
use scbridge::{
    ChangeSet, ChannelClient, Config, PayloadDelivery, ProcessBridge, Server, ServerMessage,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// mimalloc performs better than the system allocator with many worker tasks.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "scbridge")]
#[command(version)]
#[command(about = "Bridge between scene viewers and the native authoring executable")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the WebSocket server until Ctrl-C
    Serve(ServeArgs),
    /// Submit a change set file and print the authoring output
    Submit {
        /// Server URL
        #[arg(long, default_value = "ws://127.0.0.1:5000")]
        url: String,
        /// Change set JSON file
        #[arg(long)]
        file: PathBuf,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

/// Flags that override the loaded configuration.
#[derive(Args)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long)]
    listen: Option<String>,
    /// Authoring executable
    #[arg(long)]
    executable: Option<PathBuf>,
    /// Model cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,
    /// Model id passed to the executable
    #[arg(long)]
    model_id: Option<String>,
    /// Native library directory for the executable
    #[arg(long)]
    library_path: Option<PathBuf>,
    /// Environment variable the library directory is exported as
    #[arg(long)]
    library_path_var: Option<String>,
    /// Payload delivery: stdin or argument
    #[arg(long)]
    payload_delivery: Option<PayloadDelivery>,
    /// Processes allowed to run at once
    #[arg(long)]
    max_workers: Option<usize>,
    /// Submissions allowed to wait for a worker
    #[arg(long)]
    queue_capacity: Option<usize>,
    /// Seconds before a process is killed
    #[arg(long)]
    timeout: Option<u64>,
}

impl ServeArgs {
    fn apply(self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.listen_addr = listen;
        }
        if let Some(executable) = self.executable {
            config.executable = executable;
        }
        if let Some(cache_dir) = self.cache_dir {
            config.cache_dir = cache_dir;
        }
        if let Some(model_id) = self.model_id {
            config.model_id = model_id;
        }
        if let Some(library_path) = self.library_path {
            config.library_path = Some(library_path);
        }
        if let Some(var) = self.library_path_var {
            config.library_path_var = var;
        }
        if let Some(delivery) = self.payload_delivery {
            config.payload_delivery = delivery;
        }
        if let Some(max_workers) = self.max_workers {
            config.max_workers = max_workers;
        }
        if let Some(queue_capacity) = self.queue_capacity {
            config.queue_capacity = queue_capacity;
        }
        if let Some(timeout) = self.timeout {
            config.submission_timeout_secs = timeout;
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => {
            let mut config = Config::load()?;
            args.apply(&mut config);
            runtime()?.block_on(serve(config))
        }
        Commands::Submit { url, file } => runtime()?.block_on(submit(&url, &file)),
        Commands::Config { save } => {
            let config = Config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            if save {
                let path = config.save()?;
                log::info!("Wrote {}", path.display());
            }
            Ok(())
        }
    }
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create tokio runtime")
}

/// Run the bridge and server until Ctrl-C.
async fn serve(config: Config) -> Result<()> {
    let bridge = Arc::new(ProcessBridge::start(config.bridge_config()));
    let server = Server::bind(&config.listen_addr, Arc::clone(&bridge)).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    log::info!("Shutting down");
    server.shutdown();
    bridge.shutdown();
    Ok(())
}

/// Send one change set and stream its output to stdout.
async fn submit(url: &str, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    ChangeSet::validate_payload(&content)?;

    // Forwarded as written so values reach the process unchanged.
    let mut client = ChannelClient::connect(url).await?;
    client.submit(content)?;

    let mut submission = None;
    while let Some(message) = client.recv().await {
        match message? {
            ServerMessage::Accepted { submission: id } => {
                log::info!("Submission {id} accepted");
                submission = Some(id);
            }
            ServerMessage::Output { line, .. } => println!("{line}"),
            ServerMessage::Completed {
                submission: id,
                outcome,
            } if Some(id) == submission => {
                client.close().await;
                if outcome.is_success() {
                    return Ok(());
                }
                anyhow::bail!("Authoring failed: {outcome}");
            }
            ServerMessage::Completed { .. } => {}
            ServerMessage::Rejected { reason, .. } => {
                client.close().await;
                anyhow::bail!("Submission rejected: {reason}");
            }
        }
    }

    anyhow::bail!("Connection closed before the submission completed")
}
