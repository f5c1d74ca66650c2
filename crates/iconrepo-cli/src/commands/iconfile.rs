//! Iconfile command handlers

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};

use iconrepo_core::{IconfileDescriptor, RepoCombo};

use super::icon::read_iconfile;
use crate::output::Output;
use crate::prompt::confirm;

/// Add a rendition to an existing icon
pub async fn add(
    combo: &RepoCombo,
    icon_name: String,
    file: PathBuf,
    format: Option<String>,
    size: String,
    user: &str,
    output: &Output,
) -> Result<()> {
    let iconfile = read_iconfile(&file, format, size)?;

    combo
        .add_iconfile(&icon_name, &iconfile, user)
        .await
        .with_context(|| format!("Failed to add iconfile to {}", icon_name))?;

    output.success(&format!(
        "Added {}@{} to {}",
        iconfile.descriptor.format, iconfile.descriptor.size, icon_name
    ));
    Ok(())
}

/// Write iconfile content to a file, or raw to stdout
pub async fn get(
    combo: &RepoCombo,
    icon_name: String,
    descriptor: IconfileDescriptor,
    out: Option<PathBuf>,
    output: &Output,
) -> Result<()> {
    let content = combo.get_iconfile(&icon_name, &descriptor).await?;

    match out {
        Some(path) => {
            std::fs::write(&path, &content)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            output.success(&format!(
                "Wrote {} bytes to {}",
                content.len(),
                path.display()
            ));
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&content)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

/// Delete one rendition; the icon goes with its last one
pub async fn delete(
    combo: &RepoCombo,
    icon_name: String,
    descriptor: IconfileDescriptor,
    yes: bool,
    user: &str,
    output: &Output,
) -> Result<()> {
    if output.should_prompt() && !yes {
        println!(
            "Delete iconfile: {} {}@{}",
            icon_name, descriptor.format, descriptor.size
        );
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    combo
        .delete_iconfile(&icon_name, &descriptor, user)
        .await
        .with_context(|| format!("Failed to delete iconfile of {}", icon_name))?;

    output.success(&format!(
        "Deleted {}@{} from {}",
        descriptor.format, descriptor.size, icon_name
    ));
    Ok(())
}
