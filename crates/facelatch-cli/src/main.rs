use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;

#[derive(Parser)]
#[command(name = "facelatch", about = "facelatch face authentication CLI", version)]
struct Cli {
    /// Configuration file (defaults to /etc/facelatch/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture frames from the camera and enroll a user
    Enroll {
        /// User to enroll
        #[arg(short, long)]
        user: String,
        /// Descriptors to capture
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
        /// Seconds allowed for capture
        #[arg(long, default_value_t = 15)]
        seconds: u64,
        /// Replace an existing model
        #[arg(long)]
        force: bool,
    },
    /// Train a user's model from image files or embedding JSON files
    Train {
        #[arg(short, long)]
        user: String,
        /// Replace an existing model
        #[arg(long)]
        force: bool,
        /// Grayscale images (classic methods) or JSON arrays of embeddings
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Run one authentication attempt against the camera
    Test {
        #[arg(short, long)]
        user: String,
    },
    /// Show the header of a stored model
    Info {
        #[arg(short, long, conflicts_with = "path", required_unless_present = "path")]
        user: Option<String>,
        /// Model file to inspect instead of a user's model
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = facelatch_core::AuthConfig::load(cli.config.as_deref())?;
    let out = commands::Output { json: cli.json };

    match cli.command {
        Commands::Enroll {
            user,
            count,
            seconds,
            force,
        } => commands::enroll(config, &user, count, seconds, force, out).await,
        Commands::Train { user, force, files } => commands::train(&config, &user, &files, force, out),
        Commands::Test { user } => commands::test(config, &user, out).await,
        Commands::Info { user, path } => {
            let path = match (path, user) {
                (Some(path), _) => path,
                (None, Some(user)) => config.model_path(&user)?,
                (None, None) => anyhow::bail!("either --user or --path is required"),
            };
            commands::info(&path, out)
        }
    }
}
