//! Tag command handlers

use anyhow::{Context, Result};

use iconrepo_core::RepoCombo;

use crate::output::Output;

/// List all tags with usage counts
pub async fn list(combo: &RepoCombo, output: &Output) -> Result<()> {
    let tags = combo.get_tags_with_counts().await?;
    output.print_tags(&tags);
    Ok(())
}

/// Attach a tag to an icon
pub async fn add(
    combo: &RepoCombo,
    icon_name: String,
    tag: String,
    user: &str,
    output: &Output,
) -> Result<()> {
    combo
        .add_tag(&icon_name, &tag, user)
        .await
        .with_context(|| format!("Failed to tag {}", icon_name))?;

    output.success(&format!("Tagged {} with {}", icon_name, tag));
    Ok(())
}

/// Detach a tag from an icon
pub async fn remove(
    combo: &RepoCombo,
    icon_name: String,
    tag: String,
    user: &str,
    output: &Output,
) -> Result<()> {
    combo
        .remove_tag(&icon_name, &tag, user)
        .await
        .with_context(|| format!("Failed to untag {}", icon_name))?;

    output.success(&format!("Removed tag {} from {}", tag, icon_name));
    Ok(())
}
