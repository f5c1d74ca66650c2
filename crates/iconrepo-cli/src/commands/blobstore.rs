//! Blobstore command handlers

use anyhow::{Context, Result};

use iconrepo_core::{IconfileDescriptor, RepoCombo};

use crate::output::Output;

/// Create the configured blobstore
pub async fn init(combo: &RepoCombo, output: &Output) -> Result<()> {
    let blobstore = combo.blobstore();
    blobstore
        .create()
        .await
        .with_context(|| format!("Failed to create {}", blobstore))?;

    output.success(&format!("Blobstore ready: {}", blobstore));
    Ok(())
}

/// Report whether the working state is clean, and the current version
pub async fn status(combo: &RepoCombo, output: &Output) -> Result<()> {
    let blobstore = combo.blobstore();
    let clean = blobstore.check_status().await?;
    let state_id = blobstore.get_state_id().await?;
    let location = blobstore.to_string();

    output.print_value(
        &serde_json::json!({
            "location": location,
            "clean": clean,
            "state_id": state_id,
        }),
        &format!(
            "{}\n  state: {}\n  clean: {}",
            location,
            state_id,
            if clean { "yes" } else { "no" }
        ),
    );
    Ok(())
}

/// Show the version that last touched an iconfile
pub async fn version(
    combo: &RepoCombo,
    icon_name: String,
    descriptor: IconfileDescriptor,
    output: &Output,
) -> Result<()> {
    let blobstore = combo.blobstore();
    let version = blobstore
        .get_version_for(&icon_name, &descriptor)
        .await?
        .with_context(|| format!("No version stores {} {}", icon_name, descriptor))?;

    let metadata = blobstore.get_version_metadata(&version).await?;
    output.print_version(&metadata);
    Ok(())
}
