//! Icon command handlers

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use iconrepo_core::{Iconfile, IconfileDescriptor, RepoCombo};

use crate::output::Output;
use crate::prompt::confirm;

/// List icons, optionally only those carrying a tag
pub async fn list(combo: &RepoCombo, tag: Option<String>, output: &Output) -> Result<()> {
    let mut icons = combo.describe_all_icons().await?;
    if let Some(tag) = tag {
        icons.retain(|icon| icon.tags.contains(&tag));
    }
    output.print_icons(&icons);
    Ok(())
}

/// Show one icon
pub async fn show(combo: &RepoCombo, icon_name: String, output: &Output) -> Result<()> {
    let icon = combo.describe_icon(&icon_name).await?;
    output.print_icon(&icon);
    Ok(())
}

/// Create an icon from its first iconfile
pub async fn create(
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
        .create_icon(&icon_name, &iconfile, user)
        .await
        .with_context(|| format!("Failed to create icon {}", icon_name))?;

    output.success(&format!(
        "Created icon {} ({}@{})",
        icon_name, iconfile.descriptor.format, iconfile.descriptor.size
    ));
    Ok(())
}

/// Delete an icon with all of its iconfiles
pub async fn delete(
    combo: &RepoCombo,
    icon_name: String,
    yes: bool,
    user: &str,
    output: &Output,
) -> Result<()> {
    let icon = combo.describe_icon(&icon_name).await?;

    if output.should_prompt() && !yes {
        println!(
            "Delete icon: {} ({} iconfile(s))",
            icon.name,
            icon.iconfiles.len()
        );
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    combo
        .delete_icon(&icon_name, user)
        .await
        .with_context(|| format!("Failed to delete icon {}", icon_name))?;

    output.success(&format!("Deleted icon: {}", icon_name));
    Ok(())
}

/// Load iconfile content, taking the format from the file extension when not given
pub(crate) fn read_iconfile(file: &Path, format: Option<String>, size: String) -> Result<Iconfile> {
    let format = match format {
        Some(format) => format,
        None => format_from_extension(file).with_context(|| {
            format!(
                "Cannot tell the format of {:?}; pass --format",
                file.display()
            )
        })?,
    };

    let content =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;

    Ok(Iconfile::new(IconfileDescriptor::new(format, size), content))
}

fn format_from_extension(file: &Path) -> Option<String> {
    file.extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty())
        .map(|ext| ext.to_lowercase())
}
