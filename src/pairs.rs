//! Search for ablator features with similar effects that never fire together
//!
//! Two ablator features are a candidate pair when their effect vectors (rows
//! of `effects_eE`) point in a similar direction while the features rarely
//! or never co-occur in a prompt.

use std::io::Write;

use anyhow::Result;
use candle_core::{DType, Tensor};
use tracing::info;

use crate::neuronpedia::construct_url;

/// Pair search parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PairSearchParams {
    /// Discard pairs that co-occur in more than this many prompts
    pub cooccurrence_threshold: f32,
    /// Keep pairs whose cosine similarity is at least this
    pub cosine_sim_threshold: f32,
    /// Stop before ablator row `max_steps`
    pub max_steps: Option<usize>,
    /// Skip ablator rows below this index
    pub skip_before: Option<usize>,
    /// Skip ablator rows above this index
    pub skip_after: Option<usize>,
    /// Compare raw effects instead of their signs
    pub skip_sign: bool,
}

impl Default for PairSearchParams {
    fn default() -> Self {
        Self {
            cooccurrence_threshold: 0.0,
            cosine_sim_threshold: 0.0,
            max_steps: None,
            skip_before: None,
            skip_after: None,
            skip_sign: false,
        }
    }
}

/// A candidate pair of ablator features
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarPair {
    pub ablator1: usize,
    pub ablator2: usize,
    pub cosine: f32,
}

/// Row-wise L2 normalization (rows with zero norm stay zero)
fn normalize_rows(x: &Tensor) -> Result<Tensor> {
    let norms = x.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(1e-12)?;
    Ok(x.broadcast_div(&norms)?)
}

/// Elementwise sign: -1, 0 or 1
fn sign(x: &Tensor) -> Result<Tensor> {
    let zeros = x.zeros_like()?;
    let pos = x.gt(&zeros)?.to_dtype(DType::F32)?;
    let neg = x.lt(&zeros)?.to_dtype(DType::F32)?;
    Ok((pos - neg)?)
}

/// Find pairs `(i, j)` with `cooccurrences[i, j] <= cooccurrence_threshold` and
/// cosine similarity of their (sign-normalized) effect rows `>= cosine_sim_threshold`.
///
/// Self-pairs are excluded. Results are sorted by cosine similarity, highest first.
pub fn find_similar_noncooccurring_pairs(
    effects_ee: &Tensor,
    cooccurrences_ee: &Tensor,
    params: &PairSearchParams,
) -> Result<Vec<SimilarPair>> {
    let (n_ablators, _n_readers) = effects_ee.dims2()?;
    anyhow::ensure!(
        cooccurrences_ee.dims() == [n_ablators, n_ablators],
        "Co-occurrence matrix must be [{n_ablators}, {n_ablators}], got {:?}",
        cooccurrences_ee.dims()
    );

    info!("Beginning to normalize");
    let effects = effects_ee.to_dtype(DType::F32)?;
    let effects = if params.skip_sign {
        effects
    } else {
        sign(&effects)?
    };
    let normalized = normalize_rows(&effects)?;
    let cooccurrences = cooccurrences_ee
        .to_dtype(DType::F32)?
        .to_device(normalized.device())?;
    info!("Done normalizing");

    let mut pairs = Vec::new();
    for i in 0..n_ablators {
        if params.skip_before.is_some_and(|s| i < s) {
            continue;
        }
        if params.skip_after.is_some_and(|s| i > s) {
            continue;
        }
        if params.max_steps.is_some_and(|m| i >= m) {
            info!("Reached maximum steps ({}). Stopping early.", i);
            break;
        }

        let row = normalized.get(i)?.unsqueeze(1)?;
        let sims: Vec<f32> = normalized.matmul(&row)?.squeeze(1)?.to_vec1()?;
        let cooc_row: Vec<f32> = cooccurrences.get(i)?.to_vec1()?;

        pairs.extend(
            sims.iter()
                .zip(&cooc_row)
                .enumerate()
                .filter(|&(j, (&sim, &cooc))| {
                    j != i
                        && cooc <= params.cooccurrence_threshold
                        && sim >= params.cosine_sim_threshold
                })
                .map(|(j, (&sim, _))| SimilarPair {
                    ablator1: i,
                    ablator2: j,
                    cosine: sim,
                }),
        );
    }

    pairs.sort_by(|a, b| b.cosine.total_cmp(&a.cosine));
    Ok(pairs)
}

/// One element of a count tensor, or `?` when the index is out of range
fn entry(counts: &Tensor, index: &[usize]) -> Result<String> {
    let mut t = counts.clone();
    for &i in index {
        if i >= t.dim(0)? {
            return Ok("?".to_string());
        }
        t = t.get(i)?;
    }
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?.to_string())
}

/// Write a human-readable report of `pairs`.
///
/// `explain` maps an ablator feature to its description.
pub fn write_pair_report<W: Write>(
    out: &mut W,
    pairs: &[SimilarPair],
    sae_id: &str,
    cooccurrences_ee: &Tensor,
    how_often_activated_e: &Tensor,
    explain: impl Fn(usize) -> String,
) -> Result<()> {

    writeln!(out, "Found {} similar non-co-occurring pairs", pairs.len())?;
    writeln!(out)?;
    for (n, pair) in pairs.iter().enumerate() {
        let (a, b) = (pair.ablator1, pair.ablator2);
        writeln!(out, "Pair {}: Ablator {a} and Ablator {b}", n + 1)?;
        writeln!(out, "  Cosine similarity: {:.4}", pair.cosine)?;
        writeln!(
            out,
            "  Co-occurrence count: {}",
            entry(cooccurrences_ee, &[a, b])?
        )?;
        writeln!(out, "  Ablator {a}: {}", explain(a))?;
        writeln!(out, "  Ablator {b}: {}", explain(b))?;
        writeln!(
            out,
            "  Ablator {a} activated on {} prompts",
            entry(how_often_activated_e, &[a])?
        )?;
        writeln!(
            out,
            "  Ablator {b} activated on {} prompts",
            entry(how_often_activated_e, &[b])?
        )?;
        writeln!(out, "  URLs: {}", construct_url(sae_id, a))?;
        writeln!(out, "        {}", construct_url(sae_id, b))?;
        writeln!(out)?;
    }
    Ok(())
}
