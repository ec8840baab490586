use anyhow::{anyhow, Result};
use candle::Tensor;
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::utils::apply_repeat_penalty;
use tokenizers::Tokenizer;

use super::defaults::{Sampling, SpecialTokens};

/// A causal language model with an internal KV cache.
pub trait CausalLm: Send {
    /// Drops cached keys/values so the next forward starts a fresh sequence.
    fn reset(&mut self) -> Result<()>;

    /// Feeds `tokens` starting at `pos` and returns 1D f32 logits for the
    /// last position.
    fn forward(&mut self, tokens: &[u32], pos: usize) -> Result<Tensor>;

    /// Longest sequence the model can attend over, if bounded.
    fn context_len(&self) -> Option<usize> {
        None
    }
}

pub trait TokenCodec: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

impl TokenCodec for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let enc = (**self).encode(text, true)
            .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
        Ok(enc.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        (**self).decode(ids, true).map_err(|e| anyhow!("Tokenizer decode error: {e}"))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub sampling: Sampling,
    pub seed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Eos,
    Length,
    Context,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Eos => "eos",
            FinishReason::Length => "length",
            FinishReason::Context => "context",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    /// Prompt and continuation, decoded together.
    pub text: String,
    pub prompt_tokens: usize,
    pub new_tokens: usize,
    pub finish: FinishReason,
}

// ---------------------------------------------------------
// Autoregressive loop: prompt at pos 0, then one token per step
// ---------------------------------------------------------
pub fn generate<M, C>(
    model: &mut M,
    codec: &C,
    special: &SpecialTokens,
    params: &GenerationParams,
    prompt: &str,
) -> Result<Generation>
where
    M: CausalLm + ?Sized,
    C: TokenCodec + ?Sized,
{
    let mut tokens = codec.encode(prompt)?;
    if tokens.is_empty() {
        let bos = special
            .bos
            .ok_or_else(|| anyhow!("prompt encoded to no tokens and the model has no BOS token"))?;
        tokens.push(bos);
    }
    let prompt_tokens = tokens.len();

    if let Some(limit) = model.context_len() {
        if prompt_tokens >= limit {
            return Err(anyhow!(
                "prompt is {prompt_tokens} tokens, model context is {limit}"
            ));
        }
    }

    model.reset()?;

    let mut lp = LogitsProcessor::from_sampling(params.seed, params.sampling.strategy());
    let mut pos = 0usize;
    let mut finish = FinishReason::Length;

    for _ in 0..params.max_new_tokens {
        if let Some(limit) = model.context_len() {
            if tokens.len() >= limit {
                finish = FinishReason::Context;
                break;
            }
        }

        let ctx: &[u32] = if pos == 0 {
            &tokens
        } else {
            &tokens[tokens.len() - 1..]
        };

        let mut logits = model.forward(ctx, pos)?;
        pos += ctx.len();

        if let Some(penalty) = params.sampling.repetition_penalty {
            logits = apply_repeat_penalty(&logits, penalty, &tokens)?;
        }

        let next_id = lp.sample(&logits)?;
        tokens.push(next_id);

        if special.is_eos(next_id) {
            finish = FinishReason::Eos;
            break;
        }
    }

    let text = codec.decode(&tokens)?;

    Ok(Generation {
        text,
        prompt_tokens,
        new_tokens: tokens.len() - prompt_tokens,
        finish,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{CharCodec, FixedLm, ScriptedLm, BOS, EOS};

    fn greedy(max_new_tokens: usize) -> GenerationParams {
        GenerationParams {
            max_new_tokens,
            sampling: Sampling::GREEDY,
            seed: 0,
        }
    }

    fn special() -> SpecialTokens {
        SpecialTokens {
            bos: Some(BOS),
            eos: vec![EOS],
        }
    }

    #[test]
    fn response_starts_with_the_prompt() {
        let mut model = ScriptedLm::from_text(" world");
        let out = generate(&mut model, &CharCodec::new(), &special(), &greedy(100), "Hello")
            .unwrap();
        assert_eq!(out.text, "Hello world");
        assert!(out.text.starts_with("Hello"));
        assert_eq!(out.prompt_tokens, 6);
        assert_eq!(out.new_tokens, 7);
        assert_eq!(out.finish, FinishReason::Eos);
    }

    #[test]
    fn new_tokens_are_capped() {
        let mut model = ScriptedLm::from_text("abcdefghijklmnopqrstuvwxyz");
        let out = generate(&mut model, &CharCodec::new(), &special(), &greedy(5), "Hi").unwrap();
        assert_eq!(out.text, "Hiabcde");
        assert_eq!(out.new_tokens, 5);
        assert_eq!(out.finish, FinishReason::Length);
    }

    #[test]
    fn total_tokens_never_exceed_prompt_plus_budget() {
        let mut model = ScriptedLm::from_text(&"z".repeat(500));
        let params = greedy(100);
        let out = generate(&mut model, &CharCodec::new(), &special(), &params, "prompt")
            .unwrap();
        assert!(out.new_tokens <= params.max_new_tokens);
        assert_eq!(model.steps(), 100);
    }

    #[test]
    fn prompt_is_fed_once_then_one_token_per_step() {
        let mut model = ScriptedLm::from_text("ok");
        generate(&mut model, &CharCodec::new(), &special(), &greedy(10), "abc").unwrap();
        // BOS + 3 chars, then "o", then "k" (EOS is sampled after "k").
        assert_eq!(model.calls(), &[(4, 0), (1, 4), (1, 5)]);
        assert_eq!(model.resets(), 1);
    }

    #[test]
    fn empty_prompt_generates_from_bos() {
        let codec = CharCodec::new();
        let mut model = ScriptedLm::from_text("fresh");
        let out = generate(&mut model, &codec, &special(), &greedy(100), "").unwrap();
        assert_eq!(out.text, "fresh");
        assert_eq!(out.prompt_tokens, 1);

        // Tokenizers that add no BOS of their own fall back to the model's.
        let mut model = ScriptedLm::from_text("fresh");
        let out = generate(&mut model, &CharCodec::without_bos(), &special(), &greedy(100), "")
            .unwrap();
        assert_eq!(out.text, "fresh");
        assert_eq!(model.calls()[0], (1, 0));
    }

    #[test]
    fn empty_encoding_without_bos_is_an_error() {
        let mut model = ScriptedLm::from_text("x");
        let codec = CharCodec::without_bos();
        let no_bos = SpecialTokens {
            bos: None,
            eos: vec![EOS],
        };
        assert!(generate(&mut model, &codec, &no_bos, &greedy(10), "").is_err());
    }

    #[test]
    fn context_window_bounds_generation() {
        let mut model = ScriptedLm::from_text("abcdefgh").with_context(6);
        let out = generate(&mut model, &CharCodec::new(), &special(), &greedy(100), "ab")
            .unwrap();
        assert_eq!(out.text, "ababc");
        assert_eq!(out.finish, FinishReason::Context);

        let mut model = ScriptedLm::from_text("a").with_context(3);
        let err = generate(&mut model, &CharCodec::new(), &special(), &greedy(10), "abc");
        assert!(err.is_err());
    }

    #[test]
    fn greedy_picks_the_highest_logit() {
        // 'x' leads, 'y' is a close runner-up, EOS never wins.
        let mut model = FixedLm::new(&[('x', 3.0), ('y', 2.5)]);
        let out = generate(&mut model, &CharCodec::new(), &special(), &greedy(3), "p").unwrap();
        assert_eq!(out.text, "pxxx");

        let mut model = FixedLm::new(&[('y', 2.5), ('x', 3.0)]);
        let params = GenerationParams {
            seed: 99,
            ..greedy(3)
        };
        let out = generate(&mut model, &CharCodec::new(), &special(), &params, "p").unwrap();
        assert_eq!(out.text, "pxxx");
    }

    #[test]
    fn repetition_penalty_lets_the_runner_up_through() {
        let mut model = FixedLm::new(&[('x', 3.0), ('y', 2.5)]);
        let params = GenerationParams {
            sampling: Sampling {
                repetition_penalty: Some(1.3),
                ..Sampling::GREEDY
            },
            ..greedy(3)
        };
        let out = generate(&mut model, &CharCodec::new(), &special(), &params, "p").unwrap();
        // 3.0 / 1.3 drops below 2.5 once 'x' is in the sequence, and vice versa.
        assert_eq!(out.text, "pxyx");
    }

    #[test]
    fn tokenizer_codec_adds_bos_and_skips_specials_on_decode() {
        let tok = crate::inference::testing::word_level_tokenizer();
        let ids = TokenCodec::encode(&tok, "hello world").unwrap();
        assert_eq!(ids, vec![1, 3, 4]);

        let text = TokenCodec::decode(&tok, &[1, 3, 4, 2]).unwrap();
        assert_eq!(text, "hello world");
    }

    #[test]
    fn greedy_selection_is_deterministic() {
        let params = GenerationParams {
            seed: 1234,
            ..greedy(20)
        };
        let first = generate(
            &mut ScriptedLm::from_text("same"),
            &CharCodec::new(),
            &special(),
            &params,
            "x",
        )
        .unwrap();
        let second = generate(
            &mut ScriptedLm::from_text("same"),
            &CharCodec::new(),
            &special(),
            &GenerationParams { seed: 99, ..params },
            "x",
        )
        .unwrap();
        assert_eq!(first.text, second.text);
    }
}
