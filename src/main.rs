mod cli;
mod config;
mod pool;
mod providers;
mod proxy;
mod registry;
mod server;
mod utils;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use cli::{list::list_cmd, refresh::refresh_cmd, serve::serve_cmd, ColorMode};

#[derive(
    Parser, Default, Clone, Copy, ValueEnum, strum_macros::Display, strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub(crate) enum RequestedColorMode {
    #[default]
    Auto,
    On,
    Off,
}

#[derive(Parser)]
#[command(name = "modelgate")]
#[command(
    about = "An OpenAI-compatible gateway that discovers and routes models on demand",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Directory holding the configuration, persisted routes and weights
    #[arg(long, env = "MODELGATE_HOME")]
    storage_dir: Option<PathBuf>,
    #[arg(long, default_value_t = RequestedColorMode::default())]
    color: RequestedColorMode,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Serve(ServeArgs),
    /// List persisted routes or configured providers
    List(ListArgs),
    /// Forget the persisted route of a model so it is discovered again
    Refresh(RefreshArgs),
}

#[derive(Parser)]
pub(crate) struct ServeArgs {
    /// Address to listen on, overriding `[server].listen`
    #[arg(short, long)]
    listen: Option<String>,
    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Possible listings
#[derive(Subcommand)]
pub(crate) enum ListObject {
    /// Persisted routes
    Routes,
    /// Configured providers
    Providers,
}

/// Output formats
#[derive(
    Parser, ValueEnum, Default, Clone, Copy, strum_macros::Display, strum_macros::EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum ListingFormat {
    /// Format the output as a table
    #[default]
    Table,
    /// Format the output as JSON
    Json,
    /// Format the output as a table without a header
    HeaderlessTable,
}

#[derive(Parser)]
pub(crate) struct ListArgs {
    /// Output the listing with the specified format
    #[arg(short, long, default_value_t = ListingFormat::default())]
    format: ListingFormat,
    /// List the specified object
    #[command(subcommand)]
    object: ListObject,
}

#[derive(Parser)]
pub(crate) struct RefreshArgs {
    /// Model whose route should be forgotten
    model: String,
}

fn storage_root(requested: Option<PathBuf>) -> PathBuf {
    match requested.or_else(config::default_storage_root) {
        Some(root) => root,
        None => die!("cannot determine a storage directory, pass --storage-dir or set MODELGATE_HOME"),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let color = ColorMode::resolve_auto(cli.color);
    utils::errors::configure_color(color);

    let root = storage_root(cli.storage_dir);

    match &cli.command {
        Commands::Serve(args) => serve_cmd(&root, args).await,
        Commands::List(args) => list_cmd(&root, args).await,
        Commands::Refresh(args) => refresh_cmd(&root, args).await,
    }
}
