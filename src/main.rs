//! taskboard - Kanban task board host
//!
//! Keeps tasks, settings and the recycle bin in a local SQLite store
//! and serves them over HTTP.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

mod api;
mod board;
mod config;
mod debounce;
mod export;
mod migration;
mod models;
mod presence;
mod query;
mod recycle_bin;
mod settings;
mod storage;
mod view_params;

use board::Board;
use config::Config;
use storage::Storage;

#[derive(Parser)]
#[command(name = "taskboard")]
#[command(about = "Kanban task board with local storage, undo and exports")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the board server
    Serve {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Print tasks matching a view query, e.g. "status=todo&sort=due_date,desc"
    List {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Query string in the same form the HTTP API accepts
        #[arg(default_value = "")]
        query: String,
    },

    /// Export every task to a file
    Export {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// csv, md or json
        #[arg(short, long, default_value = "csv")]
        format: String,

        /// Output file (defaults to a timestamped name in the current directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List storage backups, or restore one
    Backups {
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Backup key to restore
        #[arg(long)]
        restore: Option<String>,
    },

    /// Initialize a new config file
    Init {
        /// Output path for config file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("taskboard=info".parse().context("Invalid log directive")?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, bind } => {
            let mut cfg = load_config(config)?;

            // Override with CLI args
            if let Some(p) = port {
                cfg.server.port = p;
            }
            if let Some(b) = bind {
                cfg.server.bind = b;
            }

            run_server(cfg).await
        }

        Commands::List { config, query } => {
            let cfg = load_config(config)?;
            let view = view_params::ViewParams::parse(&query)?;
            let board = open_board(&cfg)?;

            let page = board.query(&view, chrono::Utc::now());
            if page.items.is_empty() {
                println!("No tasks match.");
            }
            for task in &page.items {
                println!(
                    "{:<38} {:<12} {:<7} {:<10} {}",
                    task.id,
                    task.status.label(),
                    task.priority.label(),
                    task.due_date.as_deref().unwrap_or("-"),
                    task.title
                );
            }
            println!();
            println!(
                "Page {} of {} ({} tasks)",
                page.page,
                page.total_pages.max(1),
                page.total_items
            );

            close_board(&board).await;
            Ok(())
        }

        Commands::Export {
            config,
            format,
            output,
        } => {
            let cfg = load_config(config)?;
            let format = export::Format::parse(&format)
                .with_context(|| format!("Unsupported export format '{}'", format))?;
            let board = open_board(&cfg)?;

            let now = chrono::Utc::now();
            let mut tasks = board.tasks();
            query::sort_tasks(&mut tasks, board.settings().sort());
            let content = export::render(&tasks, format, &export::ExportOptions::default(), now);
            let path =
                output.unwrap_or_else(|| PathBuf::from(export::filename("tasks", format, now)));
            std::fs::write(&path, content).context("Failed to write export file")?;
            println!("Exported {} tasks to {}", tasks.len(), path.display());

            close_board(&board).await;
            Ok(())
        }

        Commands::Backups { config, restore } => {
            let cfg = load_config(config)?;
            let store = open_storage(&cfg)?;

            if let Some(key) = restore {
                let restored = migration::restore_backup(&store, &key)?;
                println!("Restored {} keys from {}", restored.len(), key);
                return Ok(());
            }

            let backups = migration::list_backups(&store)?;
            if backups.is_empty() {
                println!("No backups stored.");
            } else {
                println!("Backups (newest first):");
                println!();
                for key in backups {
                    println!("  {}", key);
                }
            }
            Ok(())
        }

        Commands::Init { output } => {
            let path = output.unwrap_or_else(|| PathBuf::from("config.toml"));
            let cfg = Config::default();
            cfg.save_to(&path)?;

            println!("Created config file: {}", path.display());
            println!();
            println!("Next steps:");
            println!("  1. Adjust storage path and timings in config.toml");
            println!(
                "  2. Start the server: taskboard serve --config {}",
                path.display()
            );

            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(&path),
        None => Config::load(),
    }
}

fn open_storage(config: &Config) -> Result<Arc<Storage>> {
    let store = Storage::open(
        &config.storage.path,
        config.storage.quota_bytes,
        presence::new_session_id(),
    )
    .context("Failed to open storage")?;
    Ok(Arc::new(store))
}

fn open_board(config: &Config) -> Result<Arc<Board>> {
    Ok(Board::open(open_storage(config)?, config))
}

async fn close_board(board: &Board) {
    board.shutdown().await;
    if let Some(warning) = board.take_warning() {
        eprintln!("warning: {} ({})", warning.message, warning.detail);
    }
}

async fn run_server(config: Config) -> Result<()> {
    let board = open_board(&config)?;
    let sync = board.spawn_session_sync();

    let state = api::AppState::new(Arc::clone(&board));
    let app = api::create_router(state);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("taskboard listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    sync.abort();
    board.shutdown().await;

    Ok(())
}
