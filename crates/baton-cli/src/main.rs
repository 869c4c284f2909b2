//! Baton CLI: command-line interface for the Baton workflow engine.
//!
//! Reuses the same core engine (baton-core) and server bootstrap
//! (baton-server) that agents talk to over HTTP.

use clap::{Parser, Subcommand};

use baton_cli::commands::{self, CoreArgs};

/// Baton: multi-agent workflow runs
#[derive(Parser)]
#[command(name = "baton", version, about = "Baton: multi-agent workflow runs")]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, env = "BATON_DB_PATH", default_value = "baton.db", global = true)]
    db: String,

    #[command(flatten)]
    core: CoreArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Baton HTTP server with its background sweepers
    Server {
        /// Host to bind to
        #[arg(long, env = "BATON_HOST", default_value = "127.0.0.1")]
        host: String,
        /// Port to listen on
        #[arg(long, env = "BATON_PORT", default_value_t = 3210)]
        port: u16,
        /// Serve HTTP only; do not start the sweepers
        #[arg(long)]
        no_sweepers: bool,
    },

    /// Manage workflow definitions
    Workflow {
        #[command(subcommand)]
        action: WorkflowAction,
    },

    /// Manage runs
    Run {
        #[command(subcommand)]
        action: RunAction,
    },

    /// Run one scheduler sweep now
    Sweep,

    /// Archive completed tasks and manage the archive
    Archive {
        #[command(subcommand)]
        action: ArchiveAction,
    },
}

#[derive(Subcommand)]
enum WorkflowAction {
    /// Install a workflow from a YAML file
    Install {
        /// Path to the workflow YAML file
        file: String,
    },
    /// List installed workflows
    List,
    /// Check a workflow YAML file without installing it
    Validate {
        /// Path to the workflow YAML file
        file: String,
    },
}

#[derive(Subcommand)]
enum RunAction {
    /// Create a run of a workflow for a task
    Create {
        /// Workflow ID
        #[arg(long)]
        workflow: String,
        /// Task ID the run belongs to
        #[arg(long)]
        task: String,
        /// Seed context entry, KEY=VALUE (repeatable)
        #[arg(long = "context", short = 'c')]
        context: Vec<String>,
        /// Leave the run pending instead of starting it
        #[arg(long)]
        no_start: bool,
    },
    /// List runs
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Filter by task ID
        #[arg(long)]
        task: Option<String>,
    },
    /// Show a run with its steps and stories
    Show {
        /// Run ID
        id: String,
    },
}

#[derive(Subcommand)]
enum ArchiveAction {
    /// Archive every completed task past the archive delay
    Sweep,
    /// Archive one completed task now
    Task {
        /// Task ID
        id: String,
    },
    /// Restore an archived task
    Restore {
        /// Task ID
        id: String,
    },
    /// List archived tasks
    List {
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Permanently delete an archived task
    Delete {
        /// Task ID
        id: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "baton_core=warn,baton_server=warn,baton_cli=info".into()),
        )
        .init();

    let Some(command) = cli.command else {
        // No subcommand: show help
        use clap::CommandFactory;
        let _ = Cli::command().print_help();
        println!();
        return;
    };

    if let Err(e) = dispatch(command, cli.db, cli.core).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn dispatch(command: Commands, db: String, core: CoreArgs) -> Result<(), String> {
    let state = commands::init_state(&db, core.to_config())?;
    match command {
        Commands::Server {
            host,
            port,
            no_sweepers,
        } => commands::server::run(&state, host, port, !no_sweepers).await,
        Commands::Workflow { action } => match action {
            WorkflowAction::Install { file } => {
                commands::workflow::install(&state, &file).await.map(|_| ())
            }
            WorkflowAction::List => commands::workflow::list(&state).await,
            WorkflowAction::Validate { file } => commands::workflow::validate(&file).await,
        },
        Commands::Run { action } => match action {
            RunAction::Create {
                workflow,
                task,
                context,
                no_start,
            } => commands::run::create(&state, &workflow, &task, &context, !no_start)
                .await
                .map(|_| ()),
            RunAction::List { status, task } => {
                commands::run::list(&state, status.as_deref(), task.as_deref()).await
            }
            RunAction::Show { id } => commands::run::show(&state, &id).await,
        },
        Commands::Sweep => commands::sweep::run(&state).await.map(|_| ()),
        Commands::Archive { action } => match action {
            ArchiveAction::Sweep => commands::archive::sweep(&state).await.map(|_| ()),
            ArchiveAction::Task { id } => commands::archive::archive(&state, &id).await,
            ArchiveAction::Restore { id } => commands::archive::unarchive(&state, &id).await,
            ArchiveAction::List { page, limit } => {
                commands::archive::list(&state, page, limit).await
            }
            ArchiveAction::Delete { id } => commands::archive::delete(&state, &id).await,
        },
    }
}
