//! Icon repository CLI
//!
//! Command-line interface for managing icons, their iconfiles and tags.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use iconrepo_core::{Config, IconfileDescriptor, RepoCombo};

mod commands;
mod output;
mod prompt;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "iconrepo")]
#[command(about = "Icon repository - versioned icons with a searchable index")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// User recorded as the author of changes (defaults to $USER)
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Config file (defaults to ICONREPO_CONFIG or ~/.config/iconrepo/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage icons
    Icon {
        #[command(subcommand)]
        command: IconCommands,
    },
    /// Manage the iconfiles of an icon
    Iconfile {
        #[command(subcommand)]
        command: IconfileCommands,
    },
    /// Manage tags
    Tag {
        #[command(subcommand)]
        command: TagCommands,
    },
    /// Inspect the blobstore
    Blobstore {
        #[command(subcommand)]
        command: BlobstoreCommands,
    },
    /// Compare the index with the blobstore content
    Check,
    /// Show or write configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum IconCommands {
    /// List all icons
    #[command(alias = "ls")]
    List {
        /// Only icons carrying this tag
        #[arg(short, long)]
        tag: Option<String>,
    },
    /// Show icon details
    Show { name: String },
    /// Create an icon from its first iconfile
    Create {
        name: String,
        /// File holding the iconfile content
        file: PathBuf,
        /// Size label, e.g. 18px or 36dp
        #[arg(short, long)]
        size: String,
        /// Format (defaults to the file extension)
        #[arg(short, long)]
        format: Option<String>,
    },
    /// Delete an icon with all of its iconfiles
    #[command(alias = "rm")]
    Delete {
        name: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum IconfileCommands {
    /// Add an iconfile to an existing icon
    Add {
        name: String,
        file: PathBuf,
        #[arg(short, long)]
        size: String,
        #[arg(short, long)]
        format: Option<String>,
    },
    /// Fetch iconfile content
    Get {
        name: String,
        format: String,
        size: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete one iconfile (the icon goes with its last one)
    #[command(alias = "rm")]
    Delete {
        name: String,
        format: String,
        size: String,
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum TagCommands {
    /// List all tags with usage counts
    #[command(alias = "ls")]
    List,
    /// Attach a tag to an icon
    Add { name: String, tag: String },
    /// Detach a tag from an icon
    #[command(alias = "rm")]
    Remove { name: String, tag: String },
}

#[derive(Subcommand)]
enum BlobstoreCommands {
    /// Create the configured blobstore
    Init,
    /// Show the current version and whether the store is clean
    Status,
    /// Show the version that last changed an iconfile
    Version {
        name: String,
        format: String,
        size: String,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Print the config file path
    Path,
    /// Write the current configuration to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    let config_path = cli.config.clone().unwrap_or_else(Config::config_file_path);
    let config = Config::load_from_path(&config_path).context("Failed to load configuration")?;
    init_logging(&config);
    debug!("Loaded configuration from {}", config_path.display());

    // Configuration commands don't need the repositories
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), &config, &config_path, &output);
    }

    let user = current_user(cli.user.as_deref());
    let combo = RepoCombo::open(&config).await?;

    match cli.command {
        Commands::Icon { command } => handle_icon_command(command, &combo, &user, &output).await,
        Commands::Iconfile { command } => {
            handle_iconfile_command(command, &combo, &user, &output).await
        }
        Commands::Tag { command } => handle_tag_command(command, &combo, &user, &output).await,
        Commands::Blobstore { command } => {
            handle_blobstore_command(command, &combo, &output).await
        }
        Commands::Check => commands::check::run(&combo, &output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    }
}

async fn handle_icon_command(
    command: IconCommands,
    combo: &RepoCombo,
    user: &str,
    output: &Output,
) -> Result<()> {
    match command {
        IconCommands::List { tag } => commands::icon::list(combo, tag, output).await,
        IconCommands::Show { name } => commands::icon::show(combo, name, output).await,
        IconCommands::Create {
            name,
            file,
            size,
            format,
        } => commands::icon::create(combo, name, file, format, size, user, output).await,
        IconCommands::Delete { name, yes } => {
            commands::icon::delete(combo, name, yes, user, output).await
        }
    }
}

async fn handle_iconfile_command(
    command: IconfileCommands,
    combo: &RepoCombo,
    user: &str,
    output: &Output,
) -> Result<()> {
    match command {
        IconfileCommands::Add {
            name,
            file,
            size,
            format,
        } => commands::iconfile::add(combo, name, file, format, size, user, output).await,
        IconfileCommands::Get {
            name,
            format,
            size,
            output: out,
        } => {
            let descriptor = IconfileDescriptor::new(format, size);
            commands::iconfile::get(combo, name, descriptor, out, output).await
        }
        IconfileCommands::Delete {
            name,
            format,
            size,
            yes,
        } => {
            let descriptor = IconfileDescriptor::new(format, size);
            commands::iconfile::delete(combo, name, descriptor, yes, user, output).await
        }
    }
}

async fn handle_tag_command(
    command: TagCommands,
    combo: &RepoCombo,
    user: &str,
    output: &Output,
) -> Result<()> {
    match command {
        TagCommands::List => commands::tag::list(combo, output).await,
        TagCommands::Add { name, tag } => commands::tag::add(combo, name, tag, user, output).await,
        TagCommands::Remove { name, tag } => {
            commands::tag::remove(combo, name, tag, user, output).await
        }
    }
}

async fn handle_blobstore_command(
    command: BlobstoreCommands,
    combo: &RepoCombo,
    output: &Output,
) -> Result<()> {
    match command {
        BlobstoreCommands::Init => commands::blobstore::init(combo, output).await,
        BlobstoreCommands::Status => commands::blobstore::status(combo, output).await,
        BlobstoreCommands::Version { name, format, size } => {
            let descriptor = IconfileDescriptor::new(format, size);
            commands::blobstore::version(combo, name, descriptor, output).await
        }
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config: &Config,
    config_path: &PathBuf,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config, config_path, output),
        Some(ConfigCommands::Path) => commands::config::path(config_path, output),
        Some(ConfigCommands::Init { force }) => {
            commands::config::init(config, config_path, force, output)
        }
    }
}

/// Log to stderr so stdout stays clean for command output
///
/// RUST_LOG wins over the configured level; the default is `warn`.
fn init_logging(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config.log_level.as_deref().unwrap_or("warn");
        EnvFilter::new(format!("iconrepo_core={},iconrepo={}", level, level))
    });

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Name recorded as `modified_by`
fn current_user(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var("USER").ok())
        .filter(|user| !user.trim().is_empty())
        .unwrap_or_else(|| "iconrepo".to_string())
}
