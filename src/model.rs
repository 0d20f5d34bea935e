//! HookedModel wrapper: tokenizer, Gemma 2 backend and SAE hooks
//!
//! The backend seam (`HookedBackend`) is the only requirement for running the
//! co-occurrence pipeline, per-token feature inspection and ablation prompt
//! tests against a model.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::cache::HookCache;
use crate::forward_gemma2::Gemma2;
use crate::sae::{FeatureAblation, SparseAutoencoder};

/// An SAE spliced into the forward pass, with the features to ablate
#[derive(Clone, Copy)]
pub struct SaeHook<'a> {
    pub sae: &'a SparseAutoencoder,
    pub ablation: &'a FeatureAblation,
}

/// Output of a hooked forward pass
#[derive(Debug)]
pub struct HookedOutput {
    /// Next-token logits at the last position `[batch, vocab]` (F32), if requested
    pub last_logits: Option<Tensor>,
    /// Activations captured at hook points
    pub cache: HookCache,
}

/// Transformer backend that can splice an SAE into its residual stream.
pub trait HookedBackend {
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;

    /// Run `input_ids` (`[batch, seq_len]`, u32).
    ///
    /// With a hook, the residual at the SAE's hook layer is replaced by the SAE
    /// splice and the cache holds `{hook_name}` and `{hook_name}.hook_sae_acts_post`.
    /// When `need_logits` is false the pass may stop right after the hook layer.
    fn run(
        &self,
        input_ids: &Tensor,
        hook: Option<SaeHook<'_>>,
        need_logits: bool,
    ) -> Result<HookedOutput>;
}

/// A single token prediction
#[derive(Debug, Clone)]
pub struct TokenPrediction {
    pub token_id: u32,
    pub token: String,
    /// Probability (0.0 - 1.0)
    pub probability: f32,
}

/// How the model ranks one token of the expected answer
#[derive(Debug, Clone)]
pub struct AnswerTokenResult {
    pub token: String,
    /// 0 = the model's top prediction
    pub rank: usize,
    pub probability: f32,
    pub logit: f32,
    /// Top predictions at this answer position
    pub top_tokens: Vec<TokenPrediction>,
}

/// Result of checking a prompt against its expected answer
#[derive(Debug, Clone)]
pub struct PromptTestResult {
    pub prompt_tokens: Vec<String>,
    pub answer_tokens: Vec<String>,
    pub per_answer_token: Vec<AnswerTokenResult>,
}

impl PromptTestResult {
    /// Rank of the first answer token
    pub fn answer_rank(&self) -> Option<usize> {
        self.per_answer_token.first().map(|r| r.rank)
    }

    /// Probability of the first answer token
    pub fn answer_prob(&self) -> Option<f32> {
        self.per_answer_token.first().map(|r| r.probability)
    }

    /// Human-readable report
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Tokenized prompt: {:?}\n", self.prompt_tokens));
        out.push_str(&format!("Tokenized answer: {:?}\n", self.answer_tokens));
        for r in &self.per_answer_token {
            out.push_str(&format!(
                "Performance on answer token:\nRank: {:<8} Logit: {:5.2} Prob: {:6.2}% Token: |{}|\n",
                r.rank,
                r.logit,
                r.probability * 100.0,
                r.token
            ));
            for (i, p) in r.top_tokens.iter().enumerate() {
                out.push_str(&format!(
                    "Top {i}th token. Prob: {:6.2}% Token: |{}|\n",
                    p.probability * 100.0,
                    p.token
                ));
            }
        }
        let ranks: Vec<String> = self
            .answer_tokens
            .iter()
            .zip(&self.per_answer_token)
            .map(|(t, r)| format!("('{t}', {})", r.rank))
            .collect();
        out.push_str(&format!("Ranks of the answer tokens: [{}]\n", ranks.join(", ")));
        out
    }
}

/// Model wrapper for SAE experiments
pub struct HookedModel {
    backend: Box<dyn HookedBackend>,
    tokenizer: Tokenizer,
    device: Device,
}

impl HookedModel {
    /// Wrap an already loaded backend and tokenizer.
    pub fn new(backend: Box<dyn HookedBackend>, tokenizer: Tokenizer, device: Device) -> Self {
        Self {
            backend,
            tokenizer,
            device,
        }
    }

    /// Load a Gemma 2 model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str, force_cpu: bool) -> Result<Self> {
        let (device, dtype) = if force_cpu {
            info!("Forcing CPU mode");
            (Device::Cpu, DType::F32)
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    // Gemma 2 is trained in bfloat16
                    (dev, DType::BF16)
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    (Device::Cpu, DType::F32)
                }
            }
        };

        info!("Loading model: {} ({:?}, {:?})", model_id, device, dtype);

        let tokenizer = load_tokenizer(model_id)?;
        let backend = Gemma2::load(model_id, &device, dtype)?;
        Ok(Self::new(Box::new(backend), tokenizer, device))
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    pub fn d_model(&self) -> usize {
        self.backend.d_model()
    }

    /// Token ids of `text`
    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Token ids of `text` (with special tokens) as a `[1, seq_len]` tensor
    pub fn tokenize(&self, text: &str) -> Result<Tensor> {
        let ids = self.encode(text, true)?;
        Ok(Tensor::new(&ids[..], &self.device)?.unsqueeze(0)?)
    }

    /// Token pieces of `text`, special tokens included, one per model position
    pub fn token_strings(&self, text: &str) -> Result<Vec<String>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_tokens().to_vec())
    }

    /// Decode a token ID to string
    pub fn decode_token(&self, token_id: u32) -> String {
        self.tokenizer
            .decode(&[token_id], false)
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }

    /// Forward pass on token ids with an optional SAE hook
    pub fn run(
        &self,
        input_ids: &Tensor,
        hook: Option<SaeHook<'_>>,
        need_logits: bool,
    ) -> Result<HookedOutput> {
        let input_ids = input_ids.to_device(&self.device)?;
        self.backend.run(&input_ids, hook, need_logits)
    }

    /// SAE activations `[batch, seq_len, d_sae]` for token ids, stopping after the hook layer
    pub fn sae_activations(&self, input_ids: &Tensor, sae: &SparseAutoencoder) -> Result<Tensor> {
        let ablation = FeatureAblation::default();
        let mut out = self.run(
            input_ids,
            Some(SaeHook {
                sae,
                ablation: &ablation,
            }),
            false,
        )?;
        out.cache.take(&sae.config().acts_post_key())
    }

    /// How strongly one SAE feature fires on each token of `prompt`.
    ///
    /// Returns one value per token of `token_strings(prompt)`.
    pub fn feature_activation_per_token(
        &self,
        sae: &SparseAutoencoder,
        feature: usize,
        prompt: &str,
    ) -> Result<Vec<f32>> {
        anyhow::ensure!(
            feature < sae.config().d_sae,
            "Feature {feature} out of range (d_sae={})",
            sae.config().d_sae
        );
        let input_ids = self.tokenize(prompt)?;
        let ablation = FeatureAblation::default();
        let hook = SaeHook {
            sae,
            ablation: &ablation,
        };
        let out = self.run(&input_ids, Some(hook), false)?;
        out.cache.column(&sae.config().acts_post_key(), feature)
    }

    /// Check how the model ranks `answer` as the continuation of `prompt`.
    ///
    /// The answer is tokenized with a leading space and without special tokens.
    /// Each answer token is scored given the prompt and the preceding answer tokens.
    pub fn test_prompt(
        &self,
        prompt: &str,
        answer: &str,
        hook: Option<SaeHook<'_>>,
        top_k: usize,
    ) -> Result<PromptTestResult> {
        let prompt_ids = self.encode(prompt, true)?;
        let answer_ids = self.encode(&format!(" {answer}"), false)?;
        anyhow::ensure!(!prompt_ids.is_empty(), "Prompt tokenized to nothing");
        anyhow::ensure!(!answer_ids.is_empty(), "Answer tokenized to nothing");

        let mut per_answer_token = Vec::with_capacity(answer_ids.len());
        for (k, &target) in answer_ids.iter().enumerate() {
            let context: Vec<u32> = prompt_ids
                .iter()
                .chain(&answer_ids[..k])
                .copied()
                .collect();
            let input = Tensor::new(&context[..], &self.device)?.unsqueeze(0)?;
            let logits = self
                .run(&input, hook, true)?
                .last_logits
                .context("Backend returned no logits")?
                .squeeze(0)?
                .to_dtype(DType::F32)?;
            let logits: Vec<f32> = logits.to_vec1()?;
            per_answer_token.push(self.score_answer_token(&logits, target, top_k)?);
            debug!("Answer token {k} scored");
        }

        Ok(PromptTestResult {
            prompt_tokens: self.token_strings(prompt)?,
            answer_tokens: answer_ids.iter().map(|&id| self.decode_token(id)).collect(),
            per_answer_token,
        })
    }

    fn score_answer_token(&self, logits: &[f32], target: u32, top_k: usize) -> Result<AnswerTokenResult> {
        let target_idx = target as usize;
        anyhow::ensure!(
            target_idx < logits.len(),
            "Answer token {target} outside vocabulary of {}",
            logits.len()
        );
        let probs = softmax(logits);
        let target_logit = logits[target_idx];
        let rank = logits.iter().filter(|&&l| l > target_logit).count();

        let mut order: Vec<usize> = (0..probs.len()).collect();
        order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
        let top_tokens = order
            .into_iter()
            .take(top_k)
            .map(|i| TokenPrediction {
                token_id: i as u32,
                token: self.decode_token(i as u32),
                probability: probs[i],
            })
            .collect();

        Ok(AnswerTokenResult {
            token: self.decode_token(target),
            rank,
            probability: probs[target_idx],
            logit: target_logit,
            top_tokens,
        })
    }
}

/// Download `tokenizer.json` of a HuggingFace model
pub fn load_tokenizer(model_id: &str) -> Result<Tokenizer> {
    let api = Api::new()?;
    let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
    let tokenizer_path = repo
        .get("tokenizer.json")
        .context("Failed to download tokenizer.json")?;
    Tokenizer::from_file(&tokenizer_path).map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
