use anyhow::{anyhow, Context, Result};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::llama::{Cache, Config, Llama, LlamaConfig, LlamaEosToks};
use std::{fs, path::Path, sync::Arc};
use tokenizers::Tokenizer;
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::inference::defaults::{GenerationDefaults, Sampling, SamplingOverrides, SpecialTokens};
use crate::inference::device::{build_device, select_dtype};
use crate::inference::generation::{CausalLm, GenerationParams};
use crate::inference::{snapshot, InferenceService};

// ---------------------------------------------------------
// Llama-architecture model + its KV cache
// ---------------------------------------------------------
pub struct LlamaEngine {
    model: Llama,
    cache: Cache,
    config: Config,
    dtype: DType,
    device: Device,
}

impl LlamaEngine {
    pub fn new(config: Config, vb: VarBuilder, dtype: DType, device: Device) -> Result<Self> {
        let model = Llama::load(vb, &config)?;
        let cache = Cache::new(true, dtype, &config, &device)?;
        Ok(Self {
            model,
            cache,
            config,
            dtype,
            device,
        })
    }
}

impl CausalLm for LlamaEngine {
    fn reset(&mut self) -> Result<()> {
        self.cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
        Ok(())
    }

    fn forward(&mut self, tokens: &[u32], pos: usize) -> Result<Tensor> {
        let input = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input, pos, &mut self.cache)?;
        Ok(logits.squeeze(0)?.to_dtype(DType::F32)?)
    }

    fn context_len(&self) -> Option<usize> {
        Some(self.config.max_position_embeddings)
    }
}

// ---------------------------------------------------------
// Startup: resolve files, load tokenizer + weights once
// ---------------------------------------------------------
pub fn load(cfg: &ModelConfig) -> Result<InferenceService> {
    let device = build_device(&cfg.device)?;
    let dtype = select_dtype(cfg.dtype.as_deref(), &device);
    println!("🔌 Model → {device:?} ({dtype:?})");

    let files = snapshot::resolve(cfg)?;
    println!("📁 Config: {}", files.config.display());

    let tokenizer = Tokenizer::from_file(&files.tokenizer)
        .map_err(|e| anyhow!("Tokenizer load failed ({}): {e}", files.tokenizer.display()))?;
    check_emoji_round_trip(&tokenizer);

    let config = load_config(&files.config)?;
    let defaults = GenerationDefaults::load(files.generation_config.as_deref())?;

    let config_eos = match &config.eos_token_id {
        Some(LlamaEosToks::Single(id)) => vec![*id],
        Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
        None => Vec::new(),
    };
    let special = SpecialTokens::collect(
        config.bos_token_id,
        &config_eos,
        &defaults,
        Some(&tokenizer),
    );
    if special.eos.is_empty() {
        warn!("no EOS token found; generation will always run to the token cap");
    }

    println!("📦 Found {} weight shard(s)", files.weights.len());
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, &device)? };
    let engine = LlamaEngine::new(config, vb, dtype, device)?;

    let params = GenerationParams {
        max_new_tokens: cfg.max_new_tokens,
        sampling: Sampling::resolve(
            &defaults,
            &SamplingOverrides {
                temperature: cfg.temperature,
                top_k: cfg.top_k,
                top_p: cfg.top_p,
                repetition_penalty: cfg.repetition_penalty,
            },
        ),
        seed: cfg.seed.unwrap_or_else(rand::random),
    };
    info!(
        max_new_tokens = params.max_new_tokens,
        temperature = ?params.sampling.temperature,
        top_k = ?params.sampling.top_k,
        top_p = ?params.sampling.top_p,
        repetition_penalty = ?params.sampling.repetition_penalty,
        bos = ?special.bos,
        eos = ?special.eos,
        "generation settings"
    );

    let model_id = match &cfg.model_dir {
        Some(dir) => dir.display().to_string(),
        None => cfg.model_id.clone(),
    };
    println!("🚀 {model_id} loaded");

    Ok(InferenceService::new(
        Box::new(engine),
        Arc::new(tokenizer),
        special,
        params,
        model_id,
    ))
}

fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let cfg: LlamaConfig = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {} as a Llama config", path.display()))?;
    Ok(cfg.into_config(false))
}

// Catches tokenizers whose byte-level decoding is broken.
fn check_emoji_round_trip(tokenizer: &Tokenizer) {
    let decoded = tokenizer
        .encode("😊", false)
        .and_then(|enc| tokenizer.decode(enc.get_ids(), false));
    match decoded {
        Ok(text) if !text.contains('\u{FFFD}') => info!("Tokenizer emoji test OK: {}", text),
        Ok(text) => warn!("Tokenizer emits replacement characters: {:?}", text),
        Err(e) => warn!("Tokenizer emoji round trip failed: {e}"),
    }
}
