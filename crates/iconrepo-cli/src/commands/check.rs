//! Consistency check between the index and the blobstore

use anyhow::{bail, Result};

use iconrepo_core::RepoCombo;

use crate::output::Output;

pub async fn run(combo: &RepoCombo, output: &Output) -> Result<()> {
    let report = combo.check_consistency().await?;
    output.print_report(&report);

    if !report.is_consistent() {
        bail!(
            "Index and blobstore disagree on {} iconfile(s)",
            report.missing_content.len() + report.orphaned_content.len()
        );
    }
    Ok(())
}
