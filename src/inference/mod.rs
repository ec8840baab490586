pub mod defaults;
pub mod device;
pub mod generation;
pub mod llama;
pub mod snapshot;

use anyhow::{anyhow, Result};
use std::sync::Arc;
use tokio::sync::Mutex;

use defaults::SpecialTokens;
use generation::{CausalLm, Generation, GenerationParams, TokenCodec};

/// Process-lifetime owner of the tokenizer + model pair.
///
/// Generations are serialized on the model mutex and run on the blocking
/// pool; a caller that goes away does not stop one already in flight.
pub struct InferenceService {
    model: Arc<Mutex<Box<dyn CausalLm>>>,
    codec: Arc<dyn TokenCodec>,
    special: SpecialTokens,
    params: GenerationParams,
    model_id: String,
}

impl InferenceService {
    pub fn new(
        model: Box<dyn CausalLm>,
        codec: Arc<dyn TokenCodec>,
        special: SpecialTokens,
        params: GenerationParams,
        model_id: String,
    ) -> Self {
        Self {
            model: Arc::new(Mutex::new(model)),
            codec,
            special,
            params,
            model_id,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub async fn generate(&self, prompt: String) -> Result<Generation> {
        let model = self.model.clone();
        let codec = self.codec.clone();
        let special = self.special.clone();
        let params = self.params;

        tokio::task::spawn_blocking(move || {
            let mut guard = model.blocking_lock();
            generation::generate(&mut **guard, codec.as_ref(), &special, &params, &prompt)
        })
        .await
        .map_err(|e| anyhow!("generation task failed: {e}"))?
    }
}
