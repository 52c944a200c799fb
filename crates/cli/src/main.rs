//! TaskMind CLI, the main entry point.
//!
//! Commands:
//! - `chat`    : Interactive or single-message chat with hybrid memory
//! - `detect`  : Run task detection over one email
//! - `tasks`   : List, pick and close detected tasks
//! - `memory`  : Inspect, compact or erase long-term memory
//! - `config`  : Write or show the configuration

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "taskmind",
    about = "TaskMind: hybrid conversational memory and email task detection",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with the assistant
    Chat {
        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// User the conversation belongs to
        #[arg(short, long, env = "TASKMIND_USER", default_value = "local")]
        user: String,

        /// Session id (a new one is generated when omitted)
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Detect a task in an email and record it
    Detect {
        /// Read the email body from this file (stdin when omitted)
        #[arg(short, long)]
        file: Option<std::path::PathBuf>,

        /// Provider message id used for de-duplication
        #[arg(long)]
        id: String,

        /// Owner of the resulting task
        #[arg(short, long, env = "TASKMIND_USER", default_value = "local")]
        user: String,

        /// When the email was received (RFC 3339, defaults to now)
        #[arg(long)]
        received_at: Option<String>,
    },

    /// Manage detected tasks
    Tasks {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Manage long-term memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List tasks, highest priority first
    List {
        #[arg(short, long, env = "TASKMIND_USER", default_value = "local")]
        user: String,

        /// Only tasks with this status (open, in_progress, done, cancelled)
        #[arg(long)]
        status: Option<String>,
    },
    /// Show the next open task
    Next {
        #[arg(short, long, env = "TASKMIND_USER", default_value = "local")]
        user: String,
    },
    /// Mark a ticket as done
    Done {
        /// Ticket id, e.g. 000043
        ticket: String,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// Show index statistics
    Stats,
    /// Rewrite the index without erased records
    Compact,
    /// Erase everything stored for a user
    Forget {
        #[arg(short, long)]
        user: String,

        /// Required to actually erase
        #[arg(long)]
        confirm: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Chat {
            message,
            user,
            session,
        } => commands::chat::run(message, user, session).await?,
        Commands::Detect {
            file,
            id,
            user,
            received_at,
        } => commands::detect::run(file, id, user, received_at).await?,
        Commands::Tasks { action } => match action {
            TaskAction::List { user, status } => commands::tasks::list(&user, status.as_deref()).await?,
            TaskAction::Next { user } => commands::tasks::next(&user).await?,
            TaskAction::Done { ticket } => commands::tasks::done(&ticket).await?,
        },
        Commands::Memory { action } => match action {
            MemoryAction::Stats => commands::memory::stats().await?,
            MemoryAction::Compact => commands::memory::compact().await?,
            MemoryAction::Forget { user, confirm } => commands::memory::forget(&user, confirm).await?,
        },
        Commands::Config { action } => match action {
            ConfigAction::Init { force } => commands::config_cmd::init(force).await?,
            ConfigAction::Show => commands::config_cmd::show().await?,
            ConfigAction::Path => commands::config_cmd::path().await?,
        },
    }

    Ok(())
}
