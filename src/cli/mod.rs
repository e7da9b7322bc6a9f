use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{AppConfig, ConfigLoader, CONFIG_ENV, DATA_ENV};
use crate::storage;

pub mod commands;
pub mod format;

use self::commands::{
    DeleteArgs, EditArgs, ListArgs, PostArgs, SearchArgs, Session, ShowArgs, ThemeArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "scrib",
    version,
    about = "Jot quick notes with link previews"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Override the config file location (takes precedence over SCRIB_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the data directory (takes precedence over SCRIB_DATA)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Minimum log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Skip fetching link previews
    #[arg(long, global = true)]
    pub offline: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the timeline, newest first (default)
    List(ListArgs),
    /// Post a new scrib (reads stdin when no text is given)
    Post(PostArgs),
    /// Replace the text of a scrib
    Edit(EditArgs),
    /// Delete a scrib
    Delete(DeleteArgs),
    /// Show one scrib with its link preview details
    Show(ShowArgs),
    /// Find scribs containing the given text (case-sensitive)
    Search(SearchArgs),
    /// Show or switch between the light and dark theme
    Theme(ThemeArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Some(path) = &cli.config {
        env::set_var(CONFIG_ENV, path);
    }
    if let Some(path) = &cli.data_dir {
        env::set_var(DATA_ENV, path);
    }

    init_tracing(&cli.log_level)
        .with_context(|| format!("initialising logging at level {}", cli.log_level))?;
    let loader = ConfigLoader::discover()?;
    let config = Arc::new(loader.load_or_init()?);

    let command = cli
        .command
        .unwrap_or(Commands::List(ListArgs::default()));
    match command {
        Commands::Theme(args) => commands::set_theme(&loader, &config, args),
        Commands::List(args) => open_session(&config, cli.offline)?.list(args),
        Commands::Post(args) => open_session(&config, cli.offline)?.post(args),
        Commands::Edit(args) => open_session(&config, cli.offline)?.edit(args),
        Commands::Delete(args) => open_session(&config, cli.offline)?.delete(args),
        Commands::Show(args) => open_session(&config, cli.offline)?.show(args),
        Commands::Search(args) => open_session(&config, cli.offline)?.search(args),
    }
}

fn open_session(config: &Arc<AppConfig>, offline: bool) -> Result<Session> {
    let storage = storage::init(&config.storage)?;
    let enrich = config.enrichment.enabled && !offline;
    Session::open(Arc::clone(config), storage, enrich)
}

fn init_tracing(level: &str) -> Result<()> {
    static INIT: OnceCell<()> = OnceCell::new();
    INIT.get_or_try_init(|| {
        let env_filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
        Ok(())
    })
    .map(|_| ())
}
