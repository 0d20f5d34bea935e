//! Gemma 2 forward pass with an SAE spliced into the residual stream
//!
//! Custom implementation for Gemma 2 (google/gemma-2-2b) that supports:
//! - Alternating sliding window / global attention per layer
//! - Attention logit soft-capping and final logit soft-capping
//! - Four-norm decoder layers (pre/post attention + pre/post MLP)
//! - GQA with explicit head_dim (not derived from hidden_size/num_heads)
//! - Replacing `blocks.{L}.hook_resid_post` by an SAE reconstruction and
//!   capturing the SAE feature activations
//! - Early exit after the hook layer when logits are not needed

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

use crate::cache::HookCache;
use crate::masks::attention_mask;
use crate::model::{HookedBackend, HookedOutput, SaeHook};

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Gemma 2 model configuration (matches HuggingFace config.json).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gemma2Config {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_attention_heads: usize,
    pub num_key_value_heads: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    pub head_dim: usize,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub attn_logit_softcapping: Option<f64>,
    #[serde(default)]
    pub final_logit_softcapping: Option<f64>,
    #[serde(default = "default_query_pre_attn_scalar")]
    pub query_pre_attn_scalar: usize,
    #[serde(default)]
    pub sliding_window: Option<usize>,
}

fn default_rope_theta() -> f64 {
    10000.0
}
fn default_rms_norm_eps() -> f64 {
    1e-6
}
fn default_max_position_embeddings() -> usize {
    8192
}
fn default_query_pre_attn_scalar() -> usize {
    256
}

/// Safetensors index for sharded checkpoints.
#[derive(serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Soft-cap: `cap * tanh(x / cap)`
fn soft_cap(x: &Tensor, cap: Option<f64>) -> Result<Tensor> {
    match cap {
        Some(c) => Ok(((x / c)?.tanh()? * c)?),
        None => Ok(x.clone()),
    }
}

// ---------------------------------------------------------------------------
// RmsNorm (Gemma-style: scale by weight + 1.0, computed in F32)
// ---------------------------------------------------------------------------

struct GemmaRmsNorm {
    weight_plus_one: Tensor,
    eps: f64,
}

impl GemmaRmsNorm {
    fn load(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get(dim, "weight")?;
        let weight_plus_one = (weight.to_dtype(DType::F32)? + 1.0)?.to_dtype(weight.dtype())?;
        Ok(Self {
            weight_plus_one,
            eps,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean_sq = x.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = x.broadcast_div(&(mean_sq + self.eps)?.sqrt()?)?;
        Ok(normed.to_dtype(dtype)?.broadcast_mul(&self.weight_plus_one)?)
    }
}

// ---------------------------------------------------------------------------
// Rotary Embedding
// ---------------------------------------------------------------------------

struct RotaryEmbedding {
    sin: Tensor,
    cos: Tensor,
}

impl RotaryEmbedding {
    fn new(config: &Gemma2Config, device: &Device, dtype: DType) -> Result<Self> {
        let head_dim = config.head_dim;
        let max_len = config.max_position_embeddings;
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| 1.0 / config.rope_theta.powf(i as f64 / head_dim as f64) as f32)
            .collect();
        let n_freq = inv_freq.len();
        let inv_freq = Tensor::from_vec(inv_freq, (1, n_freq), device)?;
        let positions = Tensor::arange(0u32, max_len as u32, device)?
            .to_dtype(DType::F32)?
            .reshape((max_len, 1))?;
        let freqs = positions.matmul(&inv_freq)?;
        Ok(Self {
            sin: freqs.sin()?.to_dtype(dtype)?,
            cos: freqs.cos()?.to_dtype(dtype)?,
        })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        let cos = self.cos.narrow(0, 0, seq_len)?;
        let sin = self.sin.narrow(0, 0, seq_len)?;
        Ok((
            candle_nn::rotary_emb::rope(&q.contiguous()?, &cos, &sin)?,
            candle_nn::rotary_emb::rope(&k.contiguous()?, &cos, &sin)?,
        ))
    }
}

// ---------------------------------------------------------------------------
// Attention
// ---------------------------------------------------------------------------

struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    softcap: Option<f64>,
    scale: f64,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gemma2Config) -> Result<Self> {
        let (h, kv, d) = (
            config.num_attention_heads,
            config.num_key_value_heads,
            config.head_dim,
        );
        anyhow::ensure!(
            h % kv == 0,
            "num_attention_heads ({h}) must be a multiple of num_key_value_heads ({kv})"
        );
        Ok(Self {
            q_proj: linear_no_bias(config.hidden_size, h * d, vb.pp("q_proj"))?,
            k_proj: linear_no_bias(config.hidden_size, kv * d, vb.pp("k_proj"))?,
            v_proj: linear_no_bias(config.hidden_size, kv * d, vb.pp("v_proj"))?,
            o_proj: linear_no_bias(h * d, config.hidden_size, vb.pp("o_proj"))?,
            num_heads: h,
            num_kv_heads: kv,
            head_dim: d,
            softcap: config.attn_logit_softcapping,
            scale: 1.0 / (config.query_pre_attn_scalar as f64).sqrt(),
        })
    }

    /// Project and split into heads: `[b, heads, seq, head_dim]`
    fn heads(&self, proj: &Linear, x: &Tensor, n_heads: usize) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;
        Ok(proj
            .forward(x)?
            .reshape((b, seq_len, n_heads, self.head_dim))?
            .transpose(1, 2)?)
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;
        let q = self.heads(&self.q_proj, x, self.num_heads)?;
        let k = self.heads(&self.k_proj, x, self.num_kv_heads)?;
        let v = self.heads(&self.v_proj, x, self.num_kv_heads)?;
        let (q, k) = rotary.apply(&q, &k)?;

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scores = (q.contiguous()?.matmul(&k.transpose(2, 3)?)? * self.scale)?;
        let scores = soft_cap(&scores, self.softcap)?.broadcast_add(mask)?;
        let probs = candle_nn::ops::softmax_last_dim(&scores)?;

        let out = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, ()))?;
        Ok(self.o_proj.forward(&out)?)
    }
}

/// Expand KV heads for GQA.
fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, n_kv, seq_len, head_dim) = x.dims4()?;
    Ok(x.unsqueeze(2)?
        .expand((b, n_kv, n_rep, seq_len, head_dim))?
        .reshape((b, n_kv * n_rep, seq_len, head_dim))?)
}

// ---------------------------------------------------------------------------
// MLP (GeGLU with gelu_pytorch_tanh)
// ---------------------------------------------------------------------------

struct Mlp {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &Gemma2Config) -> Result<Self> {
        let (d, i) = (config.hidden_size, config.intermediate_size);
        Ok(Self {
            gate_proj: linear_no_bias(d, i, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(d, i, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(i, d, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let gated = (self.gate_proj.forward(x)?.gelu()? * self.up_proj.forward(x)?)?;
        Ok(self.down_proj.forward(&gated)?)
    }
}

// ---------------------------------------------------------------------------
// Decoder Layer (4 norms: pre/post attention + pre/post MLP)
// ---------------------------------------------------------------------------

struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: GemmaRmsNorm,
    post_attention_layernorm: GemmaRmsNorm,
    pre_feedforward_layernorm: GemmaRmsNorm,
    post_feedforward_layernorm: GemmaRmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &Gemma2Config) -> Result<Self> {
        let norm = |name: &str| {
            GemmaRmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp(name))
        };
        Ok(Self {
            self_attn: Attention::load(vb.pp("self_attn"), config)?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
            input_layernorm: norm("input_layernorm")?,
            post_attention_layernorm: norm("post_attention_layernorm")?,
            pre_feedforward_layernorm: norm("pre_feedforward_layernorm")?,
            post_feedforward_layernorm: norm("post_feedforward_layernorm")?,
        })
    }

    fn forward(&self, xs: &Tensor, rotary: &RotaryEmbedding, mask: &Tensor) -> Result<Tensor> {
        let attn = self
            .self_attn
            .forward(&self.input_layernorm.forward(xs)?, rotary, mask)?;
        let xs = (self.post_attention_layernorm.forward(&attn)? + xs)?;
        let mlp = self
            .mlp
            .forward(&self.pre_feedforward_layernorm.forward(&xs)?)?;
        Ok((self.post_feedforward_layernorm.forward(&mlp)? + xs)?)
    }
}

// ---------------------------------------------------------------------------
// Gemma2 model
// ---------------------------------------------------------------------------

/// Gemma 2 decoder with SAE splicing at a residual hook point.
pub struct Gemma2 {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: GemmaRmsNorm,
    rotary: RotaryEmbedding,
    config: Gemma2Config,
}

impl Gemma2 {
    /// Load Gemma 2 weights from HuggingFace.
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading Gemma 2 from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: Gemma2Config = serde_json::from_str(&config_str)?;
        info!(
            "Gemma 2 config: {} layers, hidden={}, heads={}, kv_heads={}, head_dim={}, vocab={}",
            config.num_hidden_layers,
            config.hidden_size,
            config.num_attention_heads,
            config.num_key_value_heads,
            config.head_dim,
            config.vocab_size
        );

        let weights_paths = if let Ok(index_path) = repo.get("model.safetensors.index.json") {
            let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
            let index: SafetensorsIndex = serde_json::from_str(&index_str)?;
            let mut shards: Vec<String> = index.weight_map.into_values().collect();
            shards.sort();
            shards.dedup();
            info!("Downloading {} shard files...", shards.len());
            shards
                .iter()
                .map(|name| {
                    repo.get(name)
                        .with_context(|| format!("Failed to download {name}"))
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            vec![repo
                .get("model.safetensors")
                .context("Failed to download model.safetensors")?]
        };

        // SAFETY: the weight files are not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, device)? };
        let model = Self::new(config, vb)?;
        info!("Gemma 2 loaded: {} layers", model.config.num_hidden_layers);
        Ok(model)
    }

    /// Build the model from weights laid out as in the HF checkpoint (`model.*`).
    pub fn new(config: Gemma2Config, vb: VarBuilder) -> Result<Self> {
        let rotary = RotaryEmbedding::new(&config, vb.device(), vb.dtype())?;
        let vb = vb.pp("model");

        let embed_tokens = embedding(config.vocab_size, config.hidden_size, vb.pp("embed_tokens"))?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| DecoderLayer::load(vb.pp(format!("layers.{i}")), &config))
            .collect::<Result<Vec<_>>>()?;
        let norm = GemmaRmsNorm::load(config.hidden_size, config.rms_norm_eps, vb.pp("norm"))?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary,
            config,
        })
    }

    /// Access the model configuration.
    pub fn config(&self) -> &Gemma2Config {
        &self.config
    }

    /// Even layers use the sliding window, odd layers are global.
    fn mask_for_layer(&self, layer_idx: usize, seq_len: usize, device: &Device) -> Result<Tensor> {
        let dtype = self.embed_tokens.embeddings().dtype();
        let window = if layer_idx.is_multiple_of(2) {
            self.config.sliding_window
        } else {
            None
        };
        attention_mask(seq_len, window, device, dtype)
    }

    /// Final norm, tied unembedding and soft-capping for the last position: `[batch, vocab]`.
    fn last_token_logits(&self, hidden: &Tensor) -> Result<Tensor> {
        let seq_len = hidden.dim(1)?;
        let last = hidden.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
        let normed = self.norm.forward(&last)?;
        let logits = normed.matmul(&self.embed_tokens.embeddings().t()?)?;
        soft_cap(&logits.to_dtype(DType::F32)?, self.config.final_logit_softcapping)
    }
}

impl HookedBackend for Gemma2 {
    fn n_layers(&self) -> usize {
        self.config.num_hidden_layers
    }

    fn d_model(&self) -> usize {
        self.config.hidden_size
    }

    fn run(
        &self,
        input_ids: &Tensor,
        hook: Option<SaeHook<'_>>,
        need_logits: bool,
    ) -> Result<HookedOutput> {
        if let Some(hook) = &hook {
            let sae = hook.sae.config();
            anyhow::ensure!(
                sae.hook_layer < self.config.num_hidden_layers,
                "SAE hook layer {} out of range ({} layers)",
                sae.hook_layer,
                self.config.num_hidden_layers
            );
            anyhow::ensure!(
                sae.d_in == self.config.hidden_size,
                "SAE d_in={} doesn't match model hidden size {}",
                sae.d_in,
                self.config.hidden_size
            );
        }

        let seq_len = input_ids.dim(1)?;
        anyhow::ensure!(seq_len > 0, "Empty prompt");
        let device = input_ids.device();

        let normalizer = (self.config.hidden_size as f64).sqrt();
        let mut hidden = (self.embed_tokens.forward(input_ids)? * normalizer)?;
        let mut cache = HookCache::new();

        for (i, layer) in self.layers.iter().enumerate() {
            let mask = self.mask_for_layer(i, seq_len, device)?;
            hidden = layer.forward(&hidden, &self.rotary, &mask)?;

            let Some(hook) = hook.as_ref().filter(|h| h.sae.config().hook_layer == i) else {
                continue;
            };
            let sae_config = hook.sae.config();
            cache.insert(sae_config.hook_name.clone(), hidden.clone());
            let spliced = hook.sae.splice(&hidden, hook.ablation)?;
            cache.insert(sae_config.acts_post_key(), spliced.acts);
            hidden = spliced.output;
            if !need_logits {
                return Ok(HookedOutput {
                    last_logits: None,
                    cache,
                });
            }
        }

        Ok(HookedOutput {
            last_logits: Some(self.last_token_logits(&hidden)?),
            cache,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sae::{FeatureAblation, SparseAutoencoder};
    use std::collections::HashMap;

    const HIDDEN: usize = 8;
    const VOCAB: usize = 10;

    fn tiny_config() -> Gemma2Config {
        Gemma2Config {
            hidden_size: HIDDEN,
            intermediate_size: 16,
            num_attention_heads: 2,
            num_key_value_heads: 1,
            num_hidden_layers: 2,
            vocab_size: VOCAB,
            head_dim: 4,
            rope_theta: 10000.0,
            rms_norm_eps: 1e-6,
            max_position_embeddings: 16,
            attn_logit_softcapping: Some(50.0),
            final_logit_softcapping: Some(30.0),
            query_pre_attn_scalar: 4,
            sliding_window: Some(2),
        }
    }

    /// Deterministic small weights
    fn weight(shape: &[usize], salt: f32) -> Tensor {
        let n: usize = shape.iter().product();
        let t = Tensor::arange(0f32, n as f32, &Device::Cpu).unwrap();
        ((t * f64::from(salt)).unwrap() + f64::from(salt))
            .unwrap()
            .sin()
            .unwrap()
            .affine(0.3, 0.0)
            .unwrap()
            .reshape(shape)
            .unwrap()
    }

    fn tiny_model() -> Gemma2 {
        let c = tiny_config();
        let (h, kv, d, i) = (
            c.num_attention_heads,
            c.num_key_value_heads,
            c.head_dim,
            c.intermediate_size,
        );
        let mut ts = HashMap::new();
        ts.insert("model.embed_tokens.weight".to_string(), weight(&[VOCAB, HIDDEN], 0.7));
        ts.insert("model.norm.weight".to_string(), weight(&[HIDDEN], 0.3));
        for layer in 0..c.num_hidden_layers {
            let salt = 1.0 + layer as f32;
            let p = format!("model.layers.{layer}");
            let mut put = |name: &str, shape: &[usize], k: f32| {
                ts.insert(format!("{p}.{name}.weight"), weight(shape, salt * k));
            };
            put("self_attn.q_proj", &[h * d, HIDDEN], 0.11);
            put("self_attn.k_proj", &[kv * d, HIDDEN], 0.13);
            put("self_attn.v_proj", &[kv * d, HIDDEN], 0.17);
            put("self_attn.o_proj", &[HIDDEN, h * d], 0.19);
            put("mlp.gate_proj", &[i, HIDDEN], 0.23);
            put("mlp.up_proj", &[i, HIDDEN], 0.29);
            put("mlp.down_proj", &[HIDDEN, i], 0.31);
            put("input_layernorm", &[HIDDEN], 0.37);
            put("post_attention_layernorm", &[HIDDEN], 0.41);
            put("pre_feedforward_layernorm", &[HIDDEN], 0.43);
            put("post_feedforward_layernorm", &[HIDDEN], 0.47);
        }
        let vb = VarBuilder::from_tensors(ts, DType::F32, &Device::Cpu);
        Gemma2::new(c, vb).unwrap()
    }

    fn tiny_sae(d_in: usize, hook_layer: usize) -> SparseAutoencoder {
        let d_sae = 4;
        SparseAutoencoder::from_tensors(
            weight(&[d_in, d_sae], 0.53),
            Tensor::zeros(d_sae, DType::F32, &Device::Cpu).unwrap(),
            Tensor::zeros(d_sae, DType::F32, &Device::Cpu).unwrap(),
            weight(&[d_sae, d_in], 0.59),
            Tensor::zeros(d_in, DType::F32, &Device::Cpu).unwrap(),
            hook_layer,
            &Device::Cpu,
        )
        .unwrap()
    }

    fn prompt() -> Tensor {
        // Longer than the sliding window so even layers are windowed
        Tensor::new(&[[1u32, 4, 2, 7, 3]], &Device::Cpu).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar()
            .unwrap()
    }

    #[test]
    fn test_early_exit_caches_hook_activations() {
        let model = tiny_model();
        let sae = tiny_sae(HIDDEN, 0);
        let ablation = FeatureAblation::default();
        let hook = SaeHook {
            sae: &sae,
            ablation: &ablation,
        };
        let out = model.run(&prompt(), Some(hook), false).unwrap();

        assert!(out.last_logits.is_none());
        let mut names: Vec<&str> = out.cache.hook_names().collect();
        names.sort_unstable();
        assert_eq!(
            names,
            vec!["blocks.0.hook_resid_post", "blocks.0.hook_resid_post.hook_sae_acts_post"]
        );
        assert_eq!(
            out.cache.get("blocks.0.hook_resid_post").unwrap().dims(),
            &[1, 5, HIDDEN]
        );
        assert_eq!(
            out.cache
                .get("blocks.0.hook_resid_post.hook_sae_acts_post")
                .unwrap()
                .dims(),
            &[1, 5, 4]
        );
    }

    #[test]
    fn test_error_term_splice_matches_clean_run() {
        let model = tiny_model();
        let clean = model.run(&prompt(), None, true).unwrap();
        assert!(clean.cache.is_empty());
        let clean_logits = clean.last_logits.unwrap();
        assert_eq!(clean_logits.dims(), &[1, VOCAB]);

        let mut sae = tiny_sae(HIDDEN, 1);
        sae.use_error_term = true;
        let ablation = FeatureAblation::default();
        let hook = SaeHook {
            sae: &sae,
            ablation: &ablation,
        };
        let spliced = model.run(&prompt(), Some(hook), true).unwrap();
        assert!(spliced.cache.get("blocks.1.hook_resid_post").is_some());
        let spliced_logits = spliced.last_logits.unwrap();
        assert!(max_abs_diff(&clean_logits, &spliced_logits) < 1e-4);

        // Without the error term the reconstruction replaces the residual
        sae.use_error_term = false;
        let hook = SaeHook {
            sae: &sae,
            ablation: &ablation,
        };
        let replaced = model.run(&prompt(), Some(hook), true).unwrap();
        assert!(max_abs_diff(&clean_logits, &replaced.last_logits.unwrap()) > 1e-6);
    }

    #[test]
    fn test_rejects_mismatched_sae() {
        let model = tiny_model();
        let ablation = FeatureAblation::default();

        let narrow = tiny_sae(4, 0);
        let hook = SaeHook {
            sae: &narrow,
            ablation: &ablation,
        };
        let err = model.run(&prompt(), Some(hook), true).unwrap_err();
        assert!(err.to_string().contains("d_in=4"));

        let too_deep = tiny_sae(HIDDEN, 2);
        let hook = SaeHook {
            sae: &too_deep,
            ablation: &ablation,
        };
        let err = model.run(&prompt(), Some(hook), true).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_config_defaults() {
        let json = r#"{
            "hidden_size": 2304,
            "intermediate_size": 9216,
            "num_attention_heads": 8,
            "num_key_value_heads": 4,
            "num_hidden_layers": 26,
            "vocab_size": 256000,
            "head_dim": 256,
            "attn_logit_softcapping": 50.0,
            "final_logit_softcapping": 30.0,
            "sliding_window": 4096
        }"#;
        let config: Gemma2Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.rope_theta, 10000.0);
        assert_eq!(config.query_pre_attn_scalar, 256);
        assert_eq!(config.max_position_embeddings, 8192);
        assert_eq!(config.sliding_window, Some(4096));
        assert_eq!(config.final_logit_softcapping, Some(30.0));
    }

    #[test]
    fn test_soft_cap_bounds() {
        let x = Tensor::new(&[-1000.0f32, 0.0, 1000.0], &Device::Cpu).unwrap();
        let capped: Vec<f32> = soft_cap(&x, Some(30.0)).unwrap().to_vec1().unwrap();
        assert!((capped[0] + 30.0).abs() < 1e-3);
        assert_eq!(capped[1], 0.0);
        assert!((capped[2] - 30.0).abs() < 1e-3);

        let uncapped: Vec<f32> = soft_cap(&x, None).unwrap().to_vec1().unwrap();
        assert_eq!(uncapped[2], 1000.0);
    }

    #[test]
    fn test_repeat_kv_expands_heads() {
        let x = Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 3, 2))
            .unwrap();
        let y = repeat_kv(x.clone(), 2).unwrap();
        assert_eq!(y.dims(), &[1, 4, 3, 2]);
        // Heads 0 and 1 are copies of KV head 0
        let heads: Vec<Vec<Vec<f32>>> = y.squeeze(0).unwrap().to_vec3().unwrap();
        assert_eq!(heads[0], heads[1]);
        assert_eq!(heads[2], heads[3]);
        assert_ne!(heads[1], heads[2]);

        let same = repeat_kv(x, 1).unwrap();
        assert_eq!(same.dims(), &[1, 2, 3, 2]);
    }
}
