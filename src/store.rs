//! Tensor bundle persistence
//!
//! Experiment results are written as safetensors, optionally zstd-compressed
//! (`.safetensors.zst`). Two layouts exist:
//!
//! - **v2 bundle**: up to three named tensors, `effects_eE`, `cooccurrences_ee`
//!   and `how_often_activated_e`.
//! - **feature effects** (legacy): one effect vector per ablator feature keyed by
//!   its integer index, plus an optional `cooccurrences` matrix.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use tracing::info;

/// Key of the `[e, E]` ablator → reader effects matrix
pub const EFFECTS_KEY: &str = "effects_eE";
/// Key of the `[e, e]` co-occurrence count matrix
pub const COOCCURRENCES_KEY: &str = "cooccurrences_ee";
/// Key of the `[e]` per-feature activation count vector
pub const HOW_OFTEN_KEY: &str = "how_often_activated_e";

const COMPRESSED_EXT: &str = ".safetensors.zst";
const PLAIN_EXT: &str = ".safetensors";
const LEGACY_COOCCURRENCES_KEY: &str = "cooccurrences";

/// Result tensors of an ablation / co-occurrence experiment
#[derive(Debug, Clone, Default)]
pub struct TensorBundle {
    /// Effect of ablating each ablator feature on each reader feature, `[e, E]`
    pub effects_ee: Option<Tensor>,
    /// Number of prompts in which both features fired, `[e, e]`
    pub cooccurrences_ee: Option<Tensor>,
    /// Number of prompts in which each feature fired, `[e]`
    pub how_often_activated_e: Option<Tensor>,
}

impl TensorBundle {
    /// Bundle holding only a co-occurrence matrix and the activation counts
    pub fn from_cooccurrences(cooccurrences_ee: Tensor, how_often_activated_e: Tensor) -> Self {
        Self {
            effects_ee: None,
            cooccurrences_ee: Some(cooccurrences_ee),
            how_often_activated_e: Some(how_often_activated_e),
        }
    }

    /// Effects matrix, or an error naming the file it was expected in
    pub fn require_effects(&self) -> Result<&Tensor> {
        self.effects_ee
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Bundle has no '{EFFECTS_KEY}' tensor"))
    }

    /// Co-occurrence matrix, or an error
    pub fn require_cooccurrences(&self) -> Result<&Tensor> {
        self.cooccurrences_ee
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Bundle has no '{COOCCURRENCES_KEY}' tensor"))
    }

    /// Activation counts, or an error
    pub fn require_how_often(&self) -> Result<&Tensor> {
        self.how_often_activated_e
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Bundle has no '{HOW_OFTEN_KEY}' tensor"))
    }

    /// Whether the bundle holds no tensors at all
    pub fn is_empty(&self) -> bool {
        self.effects_ee.is_none()
            && self.cooccurrences_ee.is_none()
            && self.how_often_activated_e.is_none()
    }

    fn into_named(self) -> Vec<(String, Tensor)> {
        [
            (COOCCURRENCES_KEY, self.cooccurrences_ee),
            (EFFECTS_KEY, self.effects_ee),
            (HOW_OFTEN_KEY, self.how_often_activated_e),
        ]
        .into_iter()
        .filter_map(|(key, tensor)| tensor.map(|t| (key.to_string(), t)))
        .collect()
    }
}

/// Per-ablator effect vectors in the legacy integer-keyed layout
#[derive(Debug, Clone, Default)]
pub struct FeatureEffects {
    /// Effect vector `[E]` of each ablator feature, keyed by feature index
    pub effects: BTreeMap<usize, Tensor>,
    /// Optional `[e, e]` co-occurrence matrix stored alongside
    pub cooccurrences: Option<Tensor>,
}

impl FeatureEffects {
    /// Effect vectors flattened to `f32` rows, in ascending ablator order
    pub fn to_f32_rows(&self) -> Result<BTreeMap<usize, Vec<f32>>> {
        self.effects
            .iter()
            .map(|(&ablator, t)| {
                let row: Vec<f32> = t
                    .flatten_all()?
                    .to_dtype(DType::F32)?
                    .to_vec1()?;
                Ok((ablator, row))
            })
            .collect()
    }
}

/// Save a v2 bundle as zstd-compressed safetensors.
///
/// `path` must end with `.safetensors.zst`. Absent tensors are not written.
pub fn save_v2(bundle: TensorBundle, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    ensure_compressed_ext(path)?;
    write_compressed(bundle.into_named(), path)
}

/// Load a v2 bundle from `.safetensors.zst` or `.safetensors`.
///
/// Unknown tensor names are rejected so that files from other experiments
/// are not silently misread.
pub fn load_v2(path: impl AsRef<Path>) -> Result<TensorBundle> {
    let path = path.as_ref();
    info!("Starting to load {}", path.display());
    let mut tensors = read_tensors(path)?;
    info!("Have read into tensors");

    let expected: BTreeSet<&str> = [EFFECTS_KEY, COOCCURRENCES_KEY, HOW_OFTEN_KEY].into();
    let actual: BTreeSet<&str> = tensors.keys().map(String::as_str).collect();
    anyhow::ensure!(
        actual.is_subset(&expected),
        "Dictionary has unexpected keys. Expected: {expected:?}, Got: {actual:?}"
    );

    Ok(TensorBundle {
        effects_ee: tensors.remove(EFFECTS_KEY),
        cooccurrences_ee: tensors.remove(COOCCURRENCES_KEY),
        how_often_activated_e: tensors.remove(HOW_OFTEN_KEY),
    })
}

/// Save per-ablator effect vectors in the legacy layout.
pub fn save_feature_effects(effects: &FeatureEffects, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    ensure_compressed_ext(path)?;

    let mut named: Vec<(String, Tensor)> = effects
        .effects
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    if let Some(cooc) = &effects.cooccurrences {
        named.push((LEGACY_COOCCURRENCES_KEY.to_string(), cooc.clone()));
    }
    write_compressed(named, path)
}

/// Load per-ablator effect vectors written by [`save_feature_effects`].
pub fn load_feature_effects(path: impl AsRef<Path>) -> Result<FeatureEffects> {
    let path = path.as_ref();
    ensure_compressed_ext(path)?;
    let tensors = read_tensors(path)?;

    let mut result = FeatureEffects::default();
    for (key, tensor) in tensors {
        if key == LEGACY_COOCCURRENCES_KEY {
            result.cooccurrences = Some(tensor);
            continue;
        }
        let ablator: usize = key
            .parse()
            .with_context(|| format!("Tensor key '{key}' is not a feature index"))?;
        result.effects.insert(ablator, tensor);
    }
    Ok(result)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ensure_compressed_ext(path: &Path) -> Result<()> {
    anyhow::ensure!(
        path.to_string_lossy().ends_with(COMPRESSED_EXT),
        "Expected a path ending with {COMPRESSED_EXT}, got {}",
        path.display()
    );
    Ok(())
}

/// Raw little-endian bytes of a tensor in a safetensors-compatible dtype.
///
/// Half-precision tensors are widened to F32.
fn tensor_bytes(tensor: &Tensor) -> Result<(Dtype, Vec<usize>, Vec<u8>)> {
    let shape = tensor.dims().to_vec();
    let flat = tensor.flatten_all()?;
    let (dtype, bytes) = match tensor.dtype() {
        DType::U8 => (Dtype::U8, flat.to_vec1::<u8>()?),
        DType::U32 => (Dtype::U32, le_bytes(flat.to_vec1::<u32>()?, u32::to_le_bytes)),
        DType::I64 => (Dtype::I64, le_bytes(flat.to_vec1::<i64>()?, i64::to_le_bytes)),
        DType::F64 => (Dtype::F64, le_bytes(flat.to_vec1::<f64>()?, f64::to_le_bytes)),
        _ => (
            Dtype::F32,
            le_bytes(flat.to_dtype(DType::F32)?.to_vec1::<f32>()?, f32::to_le_bytes),
        ),
    };
    Ok((dtype, shape, bytes))
}

fn le_bytes<T, const N: usize>(values: Vec<T>, to_le: fn(T) -> [u8; N]) -> Vec<u8> {
    values.into_iter().flat_map(to_le).collect()
}

/// Serialize named tensors into an in-memory safetensors file.
fn serialize_named(named: Vec<(String, Tensor)>) -> Result<Vec<u8>> {
    let raw = named
        .iter()
        .map(|(name, t)| Ok((name.as_str(), tensor_bytes(t)?)))
        .collect::<Result<Vec<_>>>()?;
    let views = raw
        .iter()
        .map(|(name, (dtype, shape, bytes))| {
            let view = TensorView::new(*dtype, shape.clone(), bytes)
                .with_context(|| format!("Invalid tensor '{name}'"))?;
            Ok((*name, view))
        })
        .collect::<Result<Vec<_>>>()?;
    safetensors::tensor::serialize(views, &None).context("Failed to serialize tensors")
}

fn write_compressed(named: Vec<(String, Tensor)>, path: &Path) -> Result<()> {
    let uncompressed = serialize_named(named)?;
    let compressed =
        zstd::stream::encode_all(uncompressed.as_slice(), 0).context("zstd compression failed")?;
    std::fs::write(path, compressed)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn read_tensors(path: &Path) -> Result<HashMap<String, Tensor>> {
    let name = path.to_string_lossy();
    let data = std::fs::read(path).with_context(|| format!("Failed to read {name}"))?;
    info!("Have read the file ({} MB)", data.len() / (1024 * 1024));

    let uncompressed = if name.ends_with(COMPRESSED_EXT) {
        let raw = zstd::stream::decode_all(data.as_slice())
            .with_context(|| format!("Failed to decompress {name}"))?;
        info!("Have decompressed the file");
        raw
    } else if name.ends_with(PLAIN_EXT) {
        data
    } else {
        anyhow::bail!(
            "Unsupported file extension for {name}. Expected {PLAIN_EXT} or {COMPRESSED_EXT}"
        );
    };

    candle_core::safetensors::load_buffer(&uncompressed, &Device::Cpu)
        .with_context(|| format!("Failed to parse safetensors in {name}"))
}
