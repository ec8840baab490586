use anyhow::{anyhow, Context, Result};
use axum::http::HeaderValue;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_ALLOWED_ORIGIN: &str = "http://localhost:8080";
pub const DEFAULT_MODEL_ID: &str = "HelpingAI/HelpingAI2-9B";
pub const DEFAULT_REVISION: &str = "main";
pub const DEFAULT_MAX_NEW_TOKENS: usize = 100;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub allowed_origin: HeaderValue,
    pub model: ModelConfig,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_id: String,
    pub revision: String,
    pub model_dir: Option<PathBuf>,
    pub hf_token: Option<String>,
    pub device: String,
    pub dtype: Option<String>,
    pub max_new_tokens: usize,
    pub temperature: Option<f64>,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    pub repetition_penalty: Option<f32>,
    pub seed: Option<u64>,
}

impl ServerConfig {
    /// Reads the process environment (after `.env`, if any, has been loaded).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Blank values count as unset.
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let origin = get("CHAT_ALLOWED_ORIGIN").unwrap_or_else(|| DEFAULT_ALLOWED_ORIGIN.into());
        let allowed_origin = HeaderValue::from_str(&origin)
            .map_err(|e| anyhow!("CHAT_ALLOWED_ORIGIN is not a valid header value: {e}"))?;

        let max_new_tokens = parse_opt::<usize>("CHAT_MAX_NEW_TOKENS", get("CHAT_MAX_NEW_TOKENS"))?
            .unwrap_or(DEFAULT_MAX_NEW_TOKENS);
        if max_new_tokens == 0 {
            return Err(anyhow!("CHAT_MAX_NEW_TOKENS must be greater than zero"));
        }

        let dtype = get("CHAT_DTYPE").map(|d| d.to_ascii_lowercase());
        if let Some(d) = dtype.as_deref() {
            if !matches!(d, "f32" | "f16" | "bf16") {
                return Err(anyhow!("CHAT_DTYPE must be one of f32, f16, bf16 (got '{d}')"));
            }
        }

        let top_p = parse_opt::<f64>("CHAT_TOP_P", get("CHAT_TOP_P"))?;
        if let Some(p) = top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(anyhow!("CHAT_TOP_P must be in (0, 1] (got {p})"));
            }
        }

        let temperature = parse_opt::<f64>("CHAT_TEMPERATURE", get("CHAT_TEMPERATURE"))?;
        if let Some(t) = temperature {
            if t < 0.0 {
                return Err(anyhow!("CHAT_TEMPERATURE must not be negative (got {t})"));
            }
        }

        let repetition_penalty =
            parse_opt::<f32>("CHAT_REPETITION_PENALTY", get("CHAT_REPETITION_PENALTY"))?;
        if let Some(r) = repetition_penalty {
            if !(r > 0.0) {
                return Err(anyhow!("CHAT_REPETITION_PENALTY must be positive (got {r})"));
            }
        }

        Ok(Self {
            bind_addr: get("CHAT_BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.into()),
            allowed_origin,
            model: ModelConfig {
                model_id: get("CHAT_MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.into()),
                revision: get("CHAT_MODEL_REVISION").unwrap_or_else(|| DEFAULT_REVISION.into()),
                model_dir: get("CHAT_MODEL_DIR").map(PathBuf::from),
                hf_token: get("HF_TOKEN"),
                device: get("CHAT_DEVICE").unwrap_or_else(|| "auto".into()),
                dtype,
                max_new_tokens,
                temperature,
                top_k: parse_opt::<usize>("CHAT_TOP_K", get("CHAT_TOP_K"))?,
                top_p,
                repetition_penalty,
                seed: parse_opt::<u64>("CHAT_SEED", get("CHAT_SEED"))?,
            },
        })
    }
}

fn parse_opt<T>(key: &str, raw: Option<String>) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.map(|v| {
        v.parse::<T>()
            .with_context(|| format!("invalid value for {key}: '{v}'"))
    })
    .transpose()
}
