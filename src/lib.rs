// Pedantic clippy configuration for ML/math codebase
#![allow(clippy::cast_precision_loss)] // usize→f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 token ids, f32→u8 colours
#![allow(clippy::cast_sign_loss)] // f32→u8 when value is clamped positive
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // e/E style tensor suffixes
#![allow(clippy::module_name_repetitions)] // SaeConfig in sae.rs is fine
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! sae-hacking: experiments on sparse autoencoder features of Gemma 2
//!
//! Finds SAE features that fire together, features with similar downstream
//! effects that never fire together, and signed effect patterns between them.
//!
//! ## Architecture
//!
//! - `model`: HookedModel wrapper and the `HookedBackend` seam
//! - `forward_gemma2`: Gemma 2 forward pass with an SAE spliced into the residual stream
//! - `sae`: JumpReLU sparse autoencoders in the Gemma Scope format
//! - `cache`: HookCache for activations captured at named hook points
//! - `masks`: Cached sliding-window / global attention masks
//! - `prompts`: Streaming jsonl datasets and padded prompt batches
//! - `cooccurrence`: Per-prompt feature co-occurrence counting
//! - `run`: Co-occurrence experiment runner with periodic saving
//! - `store`: safetensors (+ zstd) persistence of result tensors
//! - `pairs`: Similar, non-co-occurring ablator pairs and their report
//! - `patterns`: Signed 4-tuple search in the effect graph
//! - `cluster`: Complete-linkage clustering of decoder vectors
//! - `highlight`: Per-token activation HTML
//! - `neuronpedia`: Feature URLs and explanations
//! - `toy_dataset`: Synthetic hierarchical features

pub mod cache;
pub mod cluster;
pub mod cooccurrence;
pub mod forward_gemma2;
pub mod highlight;
pub mod masks;
pub mod model;
pub mod neuronpedia;
pub mod pairs;
pub mod patterns;
pub mod prompts;
pub mod run;
pub mod sae;
pub mod store;
pub mod toy_dataset;

pub use cache::HookCache;
pub use cluster::{complete_linkage, cut_tree, truncate_levels, LinkageMerge, Metric};
pub use cooccurrence::{gather_cooccurrences, CooccurrenceAccumulator};
pub use forward_gemma2::{Gemma2, Gemma2Config};
pub use highlight::{create_html, highlight_tokens_with_intensity};
pub use masks::{attention_mask, clear_mask_cache};
pub use model::{
    HookedBackend, HookedModel, HookedOutput, PromptTestResult, SaeHook, TokenPrediction,
};
pub use neuronpedia::{construct_url, fetch_feature_description, ExplanationLoader};
pub use pairs::{find_similar_noncooccurring_pairs, write_pair_report, PairSearchParams, SimilarPair};
pub use patterns::{find_4tuples, FourTuple};
pub use prompts::{DatasetSource, PromptBatch, PromptBatcher};
pub use run::{run_cooccurrences, CooccurrenceConfig, CooccurrenceSummary};
pub use sae::{FeatureAblation, SaeConfig, SparseAutoencoder};
pub use store::{
    load_feature_effects, load_v2, save_feature_effects, save_v2, FeatureEffects, TensorBundle,
};
pub use toy_dataset::ToyDataset;
