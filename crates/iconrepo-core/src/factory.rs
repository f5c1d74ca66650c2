//! Builds the configured repositories

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::blobstore::{BlobstoreRepository, GitlabConfig, GitlabRepository, LocalGitRepository};
use crate::combo::RepoCombo;
use crate::config::{BlobstoreConfig, Config, IndexConfig};
use crate::indexing::{IndexRepository, SqliteIndex};

/// Open the index named in the configuration
pub async fn open_index(config: &Config) -> Result<Arc<dyn IndexRepository>> {
    match &config.index {
        IndexConfig::Sqlite { .. } => {
            let path = config.sqlite_path();
            let index = SqliteIndex::open(&path)
                .await
                .with_context(|| format!("Failed to open SQLite index at {:?}", path))?;
            Ok(Arc::new(index))
        }
        IndexConfig::DynamoDb {
            endpoint_url,
            region,
        } => open_dynamodb_index(config, endpoint_url.clone(), region.clone()).await,
    }
}

#[cfg(feature = "dynamodb")]
async fn open_dynamodb_index(
    config: &Config,
    endpoint_url: Option<String>,
    region: String,
) -> Result<Arc<dyn IndexRepository>> {
    use crate::indexing::document::{DynamoDbConfig, DynamoDbStore};
    use crate::indexing::DocumentIndex;

    config.locking.validate()?;
    let store = DynamoDbStore::connect(&DynamoDbConfig {
        endpoint_url,
        region,
    })
    .await;
    let index = DocumentIndex::open(Arc::new(store), config.locking.to_lock_manager_config())
        .await
        .context("Failed to open DynamoDB index")?;
    Ok(Arc::new(index))
}

#[cfg(not(feature = "dynamodb"))]
async fn open_dynamodb_index(
    _config: &Config,
    _endpoint_url: Option<String>,
    _region: String,
) -> Result<Arc<dyn IndexRepository>> {
    anyhow::bail!("DynamoDB index requested but this build lacks the `dynamodb` feature")
}

/// Open the blobstore named in the configuration
///
/// The local repository is created when missing; a GitLab project is not.
pub async fn open_blobstore(config: &Config) -> Result<Arc<dyn BlobstoreRepository>> {
    match &config.blobstore {
        BlobstoreConfig::Local { .. } => {
            let repo = LocalGitRepository::new(config.blobstore_location());
            repo.create()
                .await
                .with_context(|| format!("Failed to initialize {}", repo))?;
            Ok(Arc::new(repo))
        }
        BlobstoreConfig::Gitlab {
            api_base,
            namespace_path,
            project_path,
            main_branch,
            access_token,
        } => {
            let repo = GitlabRepository::new(GitlabConfig {
                api_base: api_base.clone(),
                namespace_path: namespace_path.clone(),
                project_path: project_path.clone(),
                main_branch: main_branch.clone(),
                access_token: access_token.clone(),
            })
            .context("Invalid GitLab blobstore configuration")?;
            Ok(Arc::new(repo))
        }
    }
}

impl RepoCombo {
    /// Open both configured repositories
    pub async fn open(config: &Config) -> Result<Self> {
        let index = open_index(config).await?;
        let blobstore = open_blobstore(config).await?;
        Ok(RepoCombo::new(index, blobstore))
    }
}
