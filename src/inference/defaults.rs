use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tokenizers::Tokenizer;

pub use candle_transformers::generation::Sampling as Strategy;

/// End-of-sequence spellings seen across common tokenizer vocabularies.
const EOS_CANDIDATES: [&str; 4] = ["</s>", "<eos>", "<|endoftext|>", "<|im_end|>"];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TokenIds {
    One(u32),
    Many(Vec<u32>),
}

impl TokenIds {
    pub fn to_vec(&self) -> Vec<u32> {
        match self {
            TokenIds::One(id) => vec![*id],
            TokenIds::Many(ids) => ids.clone(),
        }
    }
}

/// Top-k applied by default when sampling and the model sets none.
pub const DEFAULT_TOP_K: usize = 50;

/// The subset of `generation_config.json` that shapes default decoding.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct GenerationDefaults {
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub do_sample: bool,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
}

impl GenerationDefaults {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

/// Operator-supplied values that take precedence over the model's defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SamplingOverrides {
    pub temperature: Option<f64>,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub repetition_penalty: Option<f32>,
}

/// Token selection actually used by the generation loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    /// `None` means argmax.
    pub temperature: Option<f64>,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    /// Applied to every token already in the sequence, sampling or not.
    pub repetition_penalty: Option<f32>,
}

impl Sampling {
    pub const GREEDY: Sampling = Sampling {
        temperature: None,
        top_k: None,
        top_p: None,
        repetition_penalty: None,
    };

    /// Model defaults first (greedy unless `do_sample`), operator overrides on top.
    /// A temperature of zero always means greedy; a top-k of zero disables it.
    pub fn resolve(defaults: &GenerationDefaults, overrides: &SamplingOverrides) -> Self {
        let (mut temp, mut k, mut p) = if defaults.do_sample {
            (
                Some(defaults.temperature.unwrap_or(1.0)),
                Some(defaults.top_k.unwrap_or(DEFAULT_TOP_K)),
                defaults.top_p,
            )
        } else {
            (None, defaults.top_k, None)
        };
        if let Some(t) = overrides.temperature {
            temp = Some(t);
        }
        if overrides.top_k.is_some() {
            k = overrides.top_k;
        }
        if overrides.top_p.is_some() {
            p = overrides.top_p;
        }

        let repetition_penalty = overrides
            .repetition_penalty
            .or(defaults.repetition_penalty)
            .filter(|r| *r > 0.0 && (*r - 1.0).abs() > f32::EPSILON);

        match temp {
            Some(t) if t > 0.0 => Sampling {
                temperature: Some(t),
                top_k: k.or(Some(DEFAULT_TOP_K)).filter(|k| *k > 0),
                top_p: p.filter(|p| *p < 1.0),
                repetition_penalty,
            },
            _ => Sampling {
                repetition_penalty,
                ..Sampling::GREEDY
            },
        }
    }

    pub fn strategy(&self) -> Strategy {
        match (self.temperature, self.top_k, self.top_p) {
            (None, _, _) => Strategy::ArgMax,
            (Some(temperature), None, None) => Strategy::All { temperature },
            (Some(temperature), Some(k), None) => Strategy::TopK { k, temperature },
            (Some(temperature), None, Some(p)) => Strategy::TopP { p, temperature },
            (Some(temperature), Some(k), Some(p)) => Strategy::TopKThenTopP { k, p, temperature },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpecialTokens {
    pub bos: Option<u32>,
    pub eos: Vec<u32>,
}

impl SpecialTokens {
    pub fn is_eos(&self, id: u32) -> bool {
        self.eos.contains(&id)
    }

    /// Merges ids from the model config, the generation defaults and the vocabulary.
    pub fn collect(
        config_bos: Option<u32>,
        config_eos: &[u32],
        defaults: &GenerationDefaults,
        tokenizer: Option<&Tokenizer>,
    ) -> Self {
        let mut eos: Vec<u32> = config_eos.to_vec();
        if let Some(ids) = &defaults.eos_token_id {
            eos.extend(ids.to_vec());
        }
        if eos.is_empty() {
            if let Some(tok) = tokenizer {
                eos.extend(EOS_CANDIDATES.iter().filter_map(|t| tok.token_to_id(t)));
            }
        }
        eos.sort_unstable();
        eos.dedup();

        let bos = defaults.bos_token_id.or(config_bos).or_else(|| {
            tokenizer.and_then(|tok| tok.token_to_id("<s>").or_else(|| tok.token_to_id("<bos>")))
        });

        Self { bos, eos }
    }
}
