//! Config command handlers

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use iconrepo_core::config::{BlobstoreConfig, IndexConfig};
use iconrepo_core::Config;

use crate::output::{Output, OutputFormat};

/// Show the effective configuration, secrets masked
pub fn show(config: &Config, config_path: &Path, output: &Output) -> Result<()> {
    let config = redacted(config);

    match output.format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to encode configuration")?
            );
        }
        OutputFormat::Quiet => {
            println!("{}", config.data_dir.display());
        }
        OutputFormat::Human => {
            println!("Configuration:");
            println!("  data_dir:   {}", config.data_dir.display());
            println!(
                "  log_level:  {}",
                config.log_level.as_deref().unwrap_or("(not set)")
            );
            match &config.index {
                IndexConfig::Sqlite { .. } => {
                    println!("  index:      sqlite {}", config.sqlite_path().display());
                }
                IndexConfig::DynamoDb {
                    endpoint_url,
                    region,
                } => {
                    println!(
                        "  index:      dynamodb {} ({})",
                        endpoint_url.as_deref().unwrap_or("default endpoint"),
                        region
                    );
                }
            }
            match &config.blobstore {
                BlobstoreConfig::Local { .. } => {
                    println!(
                        "  blobstore:  local {}",
                        config.blobstore_location().display()
                    );
                }
                BlobstoreConfig::Gitlab {
                    api_base,
                    namespace_path,
                    project_path,
                    main_branch,
                    access_token,
                } => {
                    println!(
                        "  blobstore:  gitlab {}/{} on {} ({})",
                        namespace_path, project_path, api_base, main_branch
                    );
                    println!("  token:      {}", access_token);
                }
            }
            println!(
                "  locking:    lease {}ms, heartbeat {}ms, timeout {}ms",
                config.locking.lease_ms,
                config.locking.heartbeat_ms(),
                config.locking.acquire_timeout_ms
            );
            println!();
            println!("Config file: {}", config_path.display());
        }
    }

    Ok(())
}

/// Print the config file path
pub fn path(config_path: &Path, output: &Output) -> Result<()> {
    output.print_value(
        &serde_json::json!({ "path": config_path }),
        &config_path.display().to_string(),
    );
    Ok(())
}

/// Write the effective configuration to the config file
pub fn init(config: &Config, config_path: &PathBuf, force: bool, output: &Output) -> Result<()> {
    if config_path.exists() && !force {
        bail!(
            "Config file already exists: {}\nUse --force to overwrite it",
            config_path.display()
        );
    }

    config
        .save_to_path(config_path)
        .context("Failed to save configuration")?;

    output.success(&format!("Wrote {}", config_path.display()));
    Ok(())
}

fn redacted(config: &Config) -> Config {
    let mut config = config.clone();
    if let BlobstoreConfig::Gitlab { access_token, .. } = &mut config.blobstore {
        *access_token = if access_token.is_empty() {
            "(not set)".to_string()
        } else {
            "********".to_string()
        };
    }
    config
}
