//! Co-occurrence counting of SAE features across prompts
//!
//! A feature is *active in a prompt* if its post-activation value is positive
//! at any (non-padding) token position. Two features co-occur in a prompt when
//! both are active in it. Counts are accumulated over prompts into an
//! `[e, e]` matrix whose diagonal is the per-feature activation count.

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};

use crate::store::TensorBundle;

/// Compute the per-prompt co-occurrence matrix for one prompt.
///
/// # Arguments
/// * `acts_1se` - SAE activations of shape `[1, seq_len, e]`
/// * `token_mask` - Optional `[seq_len]` mask, non-zero for real tokens.
///   Masked (padding) positions never make a feature active.
///
/// # Returns
/// `(cooccurrences_ee, active_e)`: the `{0,1}` outer product of the
/// activity indicator with itself, and the indicator `[e]` itself (F32).
pub fn gather_cooccurrences(
    acts_1se: &Tensor,
    token_mask: Option<&Tensor>,
) -> Result<(Tensor, Tensor)> {
    let (batch, seq_len, _e) = acts_1se.dims3()?;
    anyhow::ensure!(
        batch == 1,
        "gather_cooccurrences expects a single prompt, got batch of {batch}"
    );

    let acts_se = acts_1se.squeeze(0)?.to_dtype(DType::F32)?;
    let mut fired_se = acts_se.gt(&acts_se.zeros_like()?)?.to_dtype(DType::F32)?;

    if let Some(mask) = token_mask {
        anyhow::ensure!(
            mask.dims() == [seq_len],
            "Token mask must have shape [{seq_len}], got {:?}",
            mask.dims()
        );
        let mask_s = mask.to_device(acts_se.device())?.to_dtype(DType::F32)?;
        let mask_s1 = mask_s
            .ne(&mask_s.zeros_like()?)?
            .to_dtype(DType::F32)?
            .unsqueeze(1)?;
        fired_se = fired_se.broadcast_mul(&mask_s1)?;
    }

    if seq_len == 0 {
        let e = acts_se.dim(D::Minus1)?;
        let zeros_e = Tensor::zeros((e,), DType::F32, acts_se.device())?;
        let zeros_ee = Tensor::zeros((e, e), DType::F32, acts_se.device())?;
        return Ok((zeros_ee, zeros_e));
    }

    let active_e = fired_se.max(0)?;
    let cooccurrences_ee = active_e.unsqueeze(1)?.matmul(&active_e.unsqueeze(0)?)?;
    Ok((cooccurrences_ee, active_e))
}

/// Running co-occurrence counts over many prompts
#[derive(Debug)]
pub struct CooccurrenceAccumulator {
    cooccurrences_ee: Tensor,
    how_often_activated_e: Tensor,
    n_prompts: usize,
}

impl CooccurrenceAccumulator {
    /// Zero-initialized accumulator for an SAE with `d_sae` features
    pub fn new(d_sae: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            cooccurrences_ee: Tensor::zeros((d_sae, d_sae), DType::F32, device)?,
            how_often_activated_e: Tensor::zeros((d_sae,), DType::F32, device)?,
            n_prompts: 0,
        })
    }

    /// Add one prompt's activations `[1, seq_len, e]`.
    pub fn add_prompt(&mut self, acts_1se: &Tensor, token_mask: Option<&Tensor>) -> Result<()> {
        let e = self.how_often_activated_e.dim(0)?;
        anyhow::ensure!(
            acts_1se.dim(D::Minus1)? == e,
            "Activation width {} doesn't match accumulator width {e}",
            acts_1se.dim(D::Minus1)?
        );
        let (cooc_ee, active_e) = gather_cooccurrences(acts_1se, token_mask)?;
        let device = self.cooccurrences_ee.device().clone();
        self.cooccurrences_ee = (&self.cooccurrences_ee + cooc_ee.to_device(&device)?)?;
        self.how_often_activated_e =
            (&self.how_often_activated_e + active_e.to_device(&device)?)?;
        self.n_prompts += 1;
        Ok(())
    }

    /// Number of prompts accumulated so far
    pub fn n_prompts(&self) -> usize {
        self.n_prompts
    }

    /// Number of SAE features tracked
    pub fn d_sae(&self) -> usize {
        self.how_often_activated_e.dims()[0]
    }

    /// Co-occurrence counts `[e, e]`
    pub fn cooccurrences(&self) -> &Tensor {
        &self.cooccurrences_ee
    }

    /// Per-feature activation counts `[e]`
    pub fn how_often_activated(&self) -> &Tensor {
        &self.how_often_activated_e
    }

    /// Snapshot the counts as a storable bundle
    pub fn to_bundle(&self) -> TensorBundle {
        TensorBundle::from_cooccurrences(
            self.cooccurrences_ee.clone(),
            self.how_often_activated_e.clone(),
        )
    }
}
