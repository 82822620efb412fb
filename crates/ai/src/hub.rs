use anyhow::anyhow;
use hf_hub::{api::tokio::ApiBuilder, Repo, RepoType};
use std::{env, path::PathBuf};

const HF_TOKEN_ENV_VAR: &str = "HF_TOKEN";

/// Where a model file comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactSource {
    Local(PathBuf),
    Hub {
        repo_id: String,
        revision: String,
        filename: String,
    },
}

impl ArtifactSource {
    /// Returns a path on local disk, downloading into the hub cache when needed.
    pub async fn resolve(&self) -> anyhow::Result<PathBuf> {
        match self {
            ArtifactSource::Local(path) => {
                if !path.is_file() {
                    anyhow::bail!("model artifact not found: {}", path.display());
                }
                Ok(path.clone())
            }
            ArtifactSource::Hub {
                repo_id,
                revision,
                filename,
            } => {
                let token = env::var(HF_TOKEN_ENV_VAR).ok();
                let api = ApiBuilder::new()
                    .with_progress(false)
                    .with_token(token)
                    .build()?;
                let repo = api.repo(Repo::with_revision(
                    repo_id.clone(),
                    RepoType::Model,
                    revision.clone(),
                ));

                tracing::info!("fetching {} from {}@{}", filename, repo_id, revision);
                repo.get(filename).await.map_err(|e| {
                    anyhow!(
                        "failed to fetch '{}' from HuggingFace repo '{}@{}': {}",
                        filename,
                        repo_id,
                        revision,
                        e
                    )
                })
            }
        }
    }
}
