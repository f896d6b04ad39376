//! Resolves model artifacts named on the command line to local files.
//!
//! A name is either a local path or `hf://<owner>/<repo>/<file>`, which is
//! fetched into the Hugging Face hub cache.

use anyhow::{Context, bail};
use hf_hub::api::tokio::Api;
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::info;

const HF_SCHEME: &str = "hf://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    HuggingFace { repo: String, file: String },
}

impl FromStr for ModelSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some(location) = s.strip_prefix(HF_SCHEME) else {
            if s.is_empty() {
                bail!("Model path is empty");
            }
            return Ok(ModelSource::Local(PathBuf::from(s)));
        };

        let mut parts = location.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(repo), Some(file))
                if !owner.is_empty() && !repo.is_empty() && !file.is_empty() =>
            {
                Ok(ModelSource::HuggingFace {
                    repo: format!("{owner}/{repo}"),
                    file: file.to_string(),
                })
            }
            _ => bail!("Expected {HF_SCHEME}<owner>/<repo>/<file>, got {s}"),
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Local(path) => write!(f, "{}", path.display()),
            ModelSource::HuggingFace { repo, file } => write!(f, "{HF_SCHEME}{repo}/{file}"),
        }
    }
}

impl ModelSource {
    /// The same artifact with another extension, e.g. the dictionary next to a model.
    pub fn with_extension(&self, extension: &str) -> Self {
        match self {
            ModelSource::Local(path) => ModelSource::Local(path.with_extension(extension)),
            ModelSource::HuggingFace { repo, file } => ModelSource::HuggingFace {
                repo: repo.clone(),
                file: Path::new(file)
                    .with_extension(extension)
                    .to_string_lossy()
                    .to_string(),
            },
        }
    }

    pub async fn fetch(&self, api: &Api) -> anyhow::Result<PathBuf> {
        match self {
            ModelSource::Local(path) => {
                if !path.exists() {
                    bail!("Model file {} does not exist", path.display());
                }
                Ok(path.clone())
            }
            ModelSource::HuggingFace { repo, file } => {
                info!(%repo, %file, "Fetching model from Hugging Face");
                let path = api
                    .model(repo.clone())
                    .get(file)
                    .await
                    .with_context(|| format!("Failed to fetch {self}"))?;
                info!("Model {} ready at {}", self, path.display());
                Ok(path)
            }
        }
    }
}

/// Resolves every source to a local path, downloading as needed.
///
/// Runs its own current-thread runtime; called from the model loading thread.
pub fn resolve_models(sources: &[&ModelSource]) -> anyhow::Result<Vec<PathBuf>> {
    if sources
        .iter()
        .all(|source| matches!(source, ModelSource::Local(_)))
    {
        return sources
            .iter()
            .map(|source| match source {
                ModelSource::Local(path) if path.exists() => Ok(path.clone()),
                _ => bail!("Model file {source} does not exist"),
            })
            .collect();
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let api = Api::new().context("Failed to create Hugging Face API client")?;
        let mut paths = Vec::with_capacity(sources.len());
        for source in sources {
            paths.push(source.fetch(&api).await?);
        }
        Ok::<_, anyhow::Error>(paths)
    })
}
