//! JumpReLU sparse autoencoders (Gemma Scope format)
//!
//! Gemma Scope releases ship one `params.npz` per SAE with:
//! - `W_enc`: `[d_in, d_sae]`
//! - `b_enc`: `[d_sae]`
//! - `threshold`: `[d_sae]` (JumpReLU thresholds)
//! - `W_dec`: `[d_sae, d_in]`
//! - `b_dec`: `[d_in]`
//!
//! SAE ids follow `layer_{L}/width_{W}/average_l0_{N}`. The `canonical`
//! suffix selects the variant whose average L0 is closest to 100.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::info;

/// Average L0 the canonical Gemma Scope SAEs are chosen around
const CANONICAL_TARGET_L0: usize = 100;

/// Shape and hook-point metadata of a loaded SAE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaeConfig {
    /// Residual stream width the SAE reads
    pub d_in: usize,
    /// Number of SAE features
    pub d_sae: usize,
    /// Transformer block whose output residual the SAE is attached to
    pub hook_layer: usize,
    /// TransformerLens-style hook name, e.g. `blocks.20.hook_resid_post`
    pub hook_name: String,
}

impl SaeConfig {
    /// Cache key under which post-activation SAE features are stored
    pub fn acts_post_key(&self) -> String {
        format!("{}.hook_sae_acts_post", self.hook_name)
    }
}

/// Features to zero out in the SAE latent space
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureAblation {
    /// Feature indices to ablate
    pub features: Vec<usize>,
    /// Only ablate at this token position (None = all positions)
    pub position: Option<usize>,
}

impl FeatureAblation {
    /// Ablate the given features at every position
    pub fn features(features: &[usize]) -> Self {
        Self {
            features: features.to_vec(),
            position: None,
        }
    }

    /// Restrict the ablation to a single token position
    pub fn at_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    /// Whether the ablation changes nothing
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Result of running the residual stream through the SAE
#[derive(Debug)]
pub struct SaeSplice {
    /// Post-activation SAE features (before ablation), `[.., seq_len, d_sae]`
    pub acts: Tensor,
    /// Residual to continue the forward pass with, same shape/dtype as the input
    pub output: Tensor,
}

/// JumpReLU sparse autoencoder
pub struct SparseAutoencoder {
    w_enc: Tensor,     // [d_in, d_sae]
    b_enc: Tensor,     // [d_sae]
    threshold: Tensor, // [d_sae]
    w_dec: Tensor,     // [d_sae, d_in]
    b_dec: Tensor,     // [d_in]
    config: SaeConfig,
    /// Add the reconstruction error back so that an un-ablated splice is exact
    pub use_error_term: bool,
}

impl SparseAutoencoder {
    /// Build an SAE from parameter tensors (all converted to F32 on `device`).
    pub fn from_tensors(
        w_enc: Tensor,
        b_enc: Tensor,
        threshold: Tensor,
        w_dec: Tensor,
        b_dec: Tensor,
        hook_layer: usize,
        device: &Device,
    ) -> Result<Self> {
        let (d_in, d_sae) = w_enc.dims2()?;
        anyhow::ensure!(
            w_dec.dims() == [d_sae, d_in],
            "W_dec must have shape [{d_sae}, {d_in}], got {:?}",
            w_dec.dims()
        );
        anyhow::ensure!(b_enc.dims() == [d_sae], "b_enc must have shape [{d_sae}]");
        anyhow::ensure!(
            threshold.dims() == [d_sae],
            "threshold must have shape [{d_sae}]"
        );
        anyhow::ensure!(b_dec.dims() == [d_in], "b_dec must have shape [{d_in}]");

        let prep = |t: Tensor| -> Result<Tensor> { Ok(t.to_dtype(DType::F32)?.to_device(device)?) };

        Ok(Self {
            w_enc: prep(w_enc)?,
            b_enc: prep(b_enc)?,
            threshold: prep(threshold)?,
            w_dec: prep(w_dec)?,
            b_dec: prep(b_dec)?,
            config: SaeConfig {
                d_in,
                d_sae,
                hook_layer,
                hook_name: format!("blocks.{hook_layer}.hook_resid_post"),
            },
            use_error_term: false,
        })
    }

    /// Load a Gemma Scope `params.npz` file.
    pub fn from_npz(path: impl AsRef<Path>, hook_layer: usize, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        let mut params: HashMap<String, Tensor> = Tensor::read_npz(path)
            .with_context(|| format!("Failed to read SAE params from {}", path.display()))?
            .into_iter()
            .collect();
        let mut take = |name: &str| {
            params
                .remove(name)
                .ok_or_else(|| anyhow::anyhow!("SAE params missing '{name}'"))
        };
        let w_enc = take("W_enc")?;
        let b_enc = take("b_enc")?;
        let threshold = take("threshold")?;
        let w_dec = take("W_dec")?;
        let b_dec = take("b_dec")?;
        Self::from_tensors(w_enc, b_enc, threshold, w_dec, b_dec, hook_layer, device)
    }

    /// Download (or reuse from the HuggingFace cache) and load a Gemma Scope SAE.
    ///
    /// # Arguments
    /// * `release` - e.g. `"gemma-scope-2b-pt-res-canonical"` or `"gemma-scope-2b-pt-res"`
    /// * `sae_id` - e.g. `"layer_20/width_65k/canonical"` or `"layer_20/width_16k/average_l0_71"`
    pub fn from_pretrained(release: &str, sae_id: &str, device: &Device) -> Result<Self> {
        let repo_id = release_repo(release);
        let hook_layer = parse_layer(sae_id)?;
        let api = Api::new().context("Failed to create HuggingFace API")?;
        let repo = api.repo(Repo::new(repo_id.clone(), RepoType::Model));

        let resolved = match sae_id.strip_suffix("/canonical") {
            Some(prefix) => {
                let info = repo
                    .info()
                    .with_context(|| format!("Failed to list files of {repo_id}"))?;
                let candidates: Vec<String> = info
                    .siblings
                    .iter()
                    .map(|s| s.rfilename.clone())
                    .filter(|f| f.starts_with(prefix) && f.ends_with("/params.npz"))
                    .collect();
                let dir = pick_canonical(prefix, &candidates, CANONICAL_TARGET_L0)
                    .ok_or_else(|| anyhow::anyhow!("No SAE found under {repo_id}/{prefix}"))?;
                info!("Canonical SAE {sae_id} resolved to {dir}");
                dir
            }
            None => sae_id.to_string(),
        };

        let filename = format!("{resolved}/params.npz");
        info!("Loading SAE {filename} from {repo_id}");
        let path = repo
            .get(&filename)
            .with_context(|| format!("Failed to download {filename}"))?;
        let sae = Self::from_npz(&path, hook_layer, device)?;
        info!(
            "SAE loaded: d_in={}, d_sae={}, hook={}",
            sae.config.d_in, sae.config.d_sae, sae.config.hook_name
        );
        Ok(sae)
    }

    /// Access the SAE configuration.
    pub fn config(&self) -> &SaeConfig {
        &self.config
    }

    /// Decoder matrix `[d_sae, d_in]` (F32)
    pub fn decoder(&self) -> &Tensor {
        &self.w_dec
    }

    /// Encode residual activations `[.., d_in]` into features `[.., d_sae]` (F32).
    pub fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.to_dtype(DType::F32)?.to_device(self.w_enc.device())?;
        let pre = x.broadcast_matmul(&self.w_enc)?.broadcast_add(&self.b_enc)?;
        let gate = pre.broadcast_gt(&self.threshold)?.to_dtype(DType::F32)?;
        Ok((pre.relu()? * gate)?)
    }

    /// Decode features `[.., d_sae]` back into the residual space `[.., d_in]` (F32).
    pub fn decode(&self, features: &Tensor) -> Result<Tensor> {
        let features = features.to_dtype(DType::F32)?;
        Ok(features
            .broadcast_matmul(&self.w_dec)?
            .broadcast_add(&self.b_dec)?)
    }

    /// Replace the residual `x` (`[batch, seq_len, d_in]`) with its SAE reconstruction,
    /// applying `ablation` to the latent features first.
    pub fn splice(&self, x: &Tensor, ablation: &FeatureAblation) -> Result<SaeSplice> {
        let acts = self.encode(x)?;

        if ablation.is_empty() && self.use_error_term {
            return Ok(SaeSplice {
                acts,
                output: x.clone(),
            });
        }

        let ablated = if ablation.is_empty() {
            acts.clone()
        } else {
            let seq_len = acts.dim(1)?;
            let mask = ablation_mask(ablation, seq_len, self.config.d_sae, acts.device())?;
            acts.broadcast_mul(&mask)?
        };

        let mut output = self.decode(&ablated)?;
        if self.use_error_term {
            let x_f32 = x.to_dtype(DType::F32)?.to_device(output.device())?;
            let error = (x_f32 - self.decode(&acts)?)?;
            output = (output + error)?;
        }

        Ok(SaeSplice {
            acts,
            output: output.to_device(x.device())?.to_dtype(x.dtype())?,
        })
    }
}

/// Build a `{0,1}` multiplier of shape `[seq_len, d_sae]` for a feature ablation.
fn ablation_mask(
    ablation: &FeatureAblation,
    seq_len: usize,
    d_sae: usize,
    device: &Device,
) -> Result<Tensor> {
    for &f in &ablation.features {
        anyhow::ensure!(f < d_sae, "Ablated feature {f} out of range (d_sae={d_sae})");
    }
    if let Some(pos) = ablation.position {
        anyhow::ensure!(
            pos < seq_len,
            "Ablation position {pos} out of range (seq_len={seq_len})"
        );
    }

    let mut mask = vec![1.0f32; seq_len * d_sae];
    for pos in 0..seq_len {
        if ablation.position.is_some_and(|p| p != pos) {
            continue;
        }
        for &f in &ablation.features {
            mask[pos * d_sae + f] = 0.0;
        }
    }
    Ok(Tensor::from_vec(mask, (seq_len, d_sae), device)?)
}

/// Map a release name to its HuggingFace repository.
fn release_repo(release: &str) -> String {
    if release.contains('/') {
        return release.to_string();
    }
    let base = release.strip_suffix("-canonical").unwrap_or(release);
    format!("google/{base}")
}

/// Extract `L` from an id of the form `layer_{L}/...`.
fn parse_layer(sae_id: &str) -> Result<usize> {
    let first = sae_id.split('/').next().unwrap_or_default();
    let layer = first
        .strip_prefix("layer_")
        .ok_or_else(|| anyhow::anyhow!("SAE id '{sae_id}' does not start with layer_<n>"))?;
    layer
        .parse()
        .with_context(|| format!("Invalid layer in SAE id '{sae_id}'"))
}

/// Pick the `average_l0_*` directory under `prefix` whose L0 is closest to `target`.
///
/// Ties go to the smaller L0.
fn pick_canonical(prefix: &str, files: &[String], target: usize) -> Option<String> {
    files
        .iter()
        .filter_map(|f| {
            let dir = f.strip_suffix("/params.npz")?;
            let l0: usize = dir
                .strip_prefix(prefix)?
                .trim_start_matches('/')
                .strip_prefix("average_l0_")?
                .parse()
                .ok()?;
            Some((l0.abs_diff(target), l0, dir.to_string()))
        })
        .min()
        .map(|(_, _, dir)| dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 2-d residual, 3 features: f0 reads x0, f1 reads x1, f2 reads x0 + x1
    fn toy_sae() -> SparseAutoencoder {
        let device = Device::Cpu;
        let w_enc = Tensor::new(&[[1.0f32, 0.0, 1.0], [0.0, 1.0, 1.0]], &device).unwrap();
        let b_enc = Tensor::zeros((3,), DType::F32, &device).unwrap();
        let threshold = Tensor::new(&[0.5f32, 0.5, 2.5], &device).unwrap();
        let w_dec = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0], [0.5, 0.5]], &device).unwrap();
        let b_dec = Tensor::zeros((2,), DType::F32, &device).unwrap();
        SparseAutoencoder::from_tensors(w_enc, b_enc, threshold, w_dec, b_dec, 20, &device)
            .unwrap()
    }

    #[test]
    fn test_config_and_hook_names() {
        let sae = toy_sae();
        assert_eq!(sae.config().d_in, 2);
        assert_eq!(sae.config().d_sae, 3);
        assert_eq!(sae.config().hook_name, "blocks.20.hook_resid_post");
        assert_eq!(
            sae.config().acts_post_key(),
            "blocks.20.hook_resid_post.hook_sae_acts_post"
        );
    }

    #[test]
    fn test_jumprelu_threshold() {
        let sae = toy_sae();
        let x = Tensor::new(&[[1.0f32, 2.0], [0.4, 0.2]], &Device::Cpu).unwrap();
        let acts: Vec<Vec<f32>> = sae.encode(&x).unwrap().to_vec2().unwrap();
        // Row 0: pre = [1, 2, 3], all above thresholds
        assert_eq!(acts[0], vec![1.0, 2.0, 3.0]);
        // Row 1: pre = [0.4, 0.2, 0.6], all below thresholds
        assert_eq!(acts[1], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_splice_with_error_term_is_identity() {
        let mut sae = toy_sae();
        sae.use_error_term = true;
        let x = Tensor::new(&[[[0.7f32, -3.0], [2.0, 2.0]]], &Device::Cpu).unwrap();
        let spliced = sae.splice(&x, &FeatureAblation::default()).unwrap();
        assert_eq!(spliced.acts.dims(), &[1, 2, 3]);
        let out: Vec<Vec<Vec<f32>>> = spliced.output.to_vec3().unwrap();
        assert_eq!(out, vec![vec![vec![0.7, -3.0], vec![2.0, 2.0]]]);
    }

    #[test]
    fn test_splice_ablation_removes_decoder_direction() {
        let mut sae = toy_sae();
        sae.use_error_term = true;
        let x = Tensor::new(&[[[1.0f32, 2.0], [1.0, 2.0]]], &Device::Cpu).unwrap();
        let ablation = FeatureAblation::features(&[2]).at_position(1);
        let out: Vec<Vec<Vec<f32>>> = sae.splice(&x, &ablation).unwrap().output.to_vec3().unwrap();
        // Position 0 untouched
        assert_eq!(out[0][0], vec![1.0, 2.0]);
        // Position 1 loses 3.0 * [0.5, 0.5]
        assert!((out[0][1][0] - -0.5).abs() < 1e-6);
        assert!((out[0][1][1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_ablation_out_of_range() {
        let sae = toy_sae();
        let x = Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(sae.splice(&x, &FeatureAblation::features(&[3])).is_err());
        assert!(sae
            .splice(&x, &FeatureAblation::features(&[0]).at_position(2))
            .is_err());
    }

    #[test]
    fn test_release_repo() {
        assert_eq!(
            release_repo("gemma-scope-2b-pt-res-canonical"),
            "google/gemma-scope-2b-pt-res"
        );
        assert_eq!(
            release_repo("gemma-scope-2b-pt-res"),
            "google/gemma-scope-2b-pt-res"
        );
        assert_eq!(release_repo("someone/custom-saes"), "someone/custom-saes");
    }

    #[test]
    fn test_parse_layer() {
        assert_eq!(parse_layer("layer_20/width_65k/canonical").unwrap(), 20);
        assert!(parse_layer("width_65k/canonical").is_err());
        assert!(parse_layer("layer_x/width_65k").is_err());
    }

    #[test]
    fn test_pick_canonical_closest_l0() {
        let files: Vec<String> = [
            "layer_20/width_65k/average_l0_61/params.npz",
            "layer_20/width_65k/average_l0_114/params.npz",
            "layer_20/width_65k/average_l0_221/params.npz",
            "layer_20/width_65k/average_l0_20/params.npz",
        ]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
        assert_eq!(
            pick_canonical("layer_20/width_65k", &files, 100),
            Some("layer_20/width_65k/average_l0_114".to_string())
        );
        assert_eq!(pick_canonical("layer_21/width_65k", &files, 100), None);
    }

    #[test]
    fn test_pick_canonical_tie_prefers_smaller() {
        let files = vec![
            "layer_3/width_16k/average_l0_90/params.npz".to_string(),
            "layer_3/width_16k/average_l0_110/params.npz".to_string(),
        ];
        assert_eq!(
            pick_canonical("layer_3/width_16k", &files, 100),
            Some("layer_3/width_16k/average_l0_90".to_string())
        );
    }
}
