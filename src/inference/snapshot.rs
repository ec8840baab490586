use anyhow::{anyhow, Context, Result};
use hf_hub::api::sync::ApiBuilder;
use hf_hub::{Repo, RepoType};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::ModelConfig;

const INDEX_FILE: &str = "model.safetensors.index.json";
const SINGLE_WEIGHTS: &str = "model.safetensors";
const GENERATION_CONFIG: &str = "generation_config.json";

#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub generation_config: Option<PathBuf>,
    pub weights: Vec<PathBuf>,
}

pub fn resolve(cfg: &ModelConfig) -> Result<ModelFiles> {
    match &cfg.model_dir {
        Some(dir) => from_dir(dir),
        None => from_hub(cfg),
    }
}

// ---------------------------------------------------------
// Local snapshot directory
// ---------------------------------------------------------
pub fn from_dir(dir: &Path) -> Result<ModelFiles> {
    let required = |name: &str| -> Result<PathBuf> {
        let path = dir.join(name);
        if path.exists() {
            Ok(path)
        } else {
            Err(anyhow!("{name} not found under {}", dir.display()))
        }
    };

    let config = required("config.json")?;
    let tokenizer = required("tokenizer.json")?;
    let generation_config = Some(dir.join(GENERATION_CONFIG)).filter(|p| p.exists());

    let index_path = dir.join(INDEX_FILE);
    let weights = if index_path.exists() {
        shard_files(&read_index(&index_path)?, &index_path)?
            .into_iter()
            .map(|file| dir.join(file))
            .collect()
    } else {
        vec![required(SINGLE_WEIGHTS)?]
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        generation_config,
        weights,
    })
}

// ---------------------------------------------------------
// Hugging Face hub (cached under the hub's usual cache dir)
// ---------------------------------------------------------
fn from_hub(cfg: &ModelConfig) -> Result<ModelFiles> {
    let mut builder = ApiBuilder::new();
    if let Some(token) = &cfg.hf_token {
        builder = builder.with_token(Some(token.clone()));
    }
    let api = builder.build().context("failed to initialize hf-hub client")?;
    let repo = api.repo(Repo::with_revision(
        cfg.model_id.clone(),
        RepoType::Model,
        cfg.revision.clone(),
    ));

    info!(model = %cfg.model_id, revision = %cfg.revision, "fetching model files from the hub");

    let listing = repo
        .info()
        .with_context(|| format!("failed to list files of {}", cfg.model_id))?;
    let names: Vec<String> = listing.siblings.into_iter().map(|s| s.rfilename).collect();
    let layout = RemoteLayout::from_listing(&names)
        .with_context(|| format!("{} is not a usable model repo", cfg.model_id))?;

    let fetch = |name: &str| -> Result<PathBuf> {
        repo.get(name)
            .with_context(|| format!("failed to fetch {name} from {}", cfg.model_id))
    };

    let config = fetch("config.json")?;
    let tokenizer = fetch("tokenizer.json")?;
    let generation_config = if layout.generation_config {
        Some(fetch(GENERATION_CONFIG)?)
    } else {
        info!("no {GENERATION_CONFIG} in repo; using greedy defaults");
        None
    };

    let weights = if layout.sharded {
        let index_path = fetch(INDEX_FILE)?;
        shard_files(&read_index(&index_path)?, &index_path)?
            .iter()
            .map(|file| fetch(file))
            .collect::<Result<Vec<_>>>()?
    } else {
        vec![fetch(SINGLE_WEIGHTS)?]
    };

    Ok(ModelFiles {
        config,
        tokenizer,
        generation_config,
        weights,
    })
}

/// Which optional files a hub repo carries, decided from its file listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RemoteLayout {
    sharded: bool,
    generation_config: bool,
}

impl RemoteLayout {
    fn from_listing(names: &[String]) -> Result<Self> {
        let has = |name: &str| names.iter().any(|n| n == name);

        for required in ["config.json", "tokenizer.json"] {
            if !has(required) {
                return Err(anyhow!("{required} is missing"));
            }
        }

        let sharded = has(INDEX_FILE);
        if !sharded && !has(SINGLE_WEIGHTS) {
            return Err(anyhow!("neither {INDEX_FILE} nor {SINGLE_WEIGHTS} is present"));
        }

        Ok(Self {
            sharded,
            generation_config: has(GENERATION_CONFIG),
        })
    }
}

fn read_index(path: &Path) -> Result<serde_json::Value> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
}

/// Distinct shard file names from an index's `weight_map`, sorted.
pub fn shard_files(index: &serde_json::Value, origin: &Path) -> Result<Vec<String>> {
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| anyhow!("{}: weight_map is not an object", origin.display()))?;

    let shards = weight_map
        .values()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("invalid shard entry in {}", origin.display()))
        })
        .collect::<Result<BTreeSet<_>>>()?;

    if shards.is_empty() {
        return Err(anyhow!("{}: weight_map lists no shards", origin.display()));
    }

    Ok(shards.into_iter().collect())
}
