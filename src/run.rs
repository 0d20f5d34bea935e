//! Co-occurrence experiment runner
//!
//! Streams prompts through Gemma 2 with an SAE attached, accumulates which SAE
//! features co-occur within a prompt and periodically saves the counts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use crate::cooccurrence::CooccurrenceAccumulator;
use crate::model::HookedModel;
use crate::prompts::{DatasetSource, PromptBatch, PromptBatcher};
use crate::sae::SparseAutoencoder;
use crate::store::save_v2;

const SLUG_ADJECTIVES: [&str; 24] = [
    "amber", "ancient", "brave", "calm", "clever", "crimson", "dapper", "eager", "fancy",
    "gentle", "golden", "hidden", "jolly", "lucky", "mellow", "nimble", "proud", "quiet",
    "rapid", "silver", "stellar", "tidy", "vivid", "witty",
];

const SLUG_NOUNS: [&str; 24] = [
    "badger", "beacon", "canyon", "comet", "falcon", "fern", "galaxy", "harbor", "heron",
    "island", "lantern", "meadow", "otter", "panda", "pebble", "quasar", "raven", "river",
    "sparrow", "summit", "tiger", "walrus", "willow", "zephyr",
];

/// Configuration for a co-occurrence run
#[derive(Debug, Clone)]
pub struct CooccurrenceConfig {
    /// HuggingFace model id
    pub model: String,
    /// SAE release, e.g. `gemma-scope-2b-pt-res-canonical`
    pub ablator_sae_release: String,
    /// SAE id within the release
    pub ablator_sae_id: String,
    /// HuggingFace dataset id or local shard path
    pub dataset_id: String,
    /// Prompts are truncated and padded to exactly this many tokens
    pub max_tokens_in_prompt: usize,
    /// Total prompts to process (None = whole dataset)
    pub n_prompts: Option<usize>,
    /// Save every this many batches
    pub save_frequency: usize,
    pub never_save: bool,
    pub batch_size: usize,
    /// Directory under which the run directory is created
    pub results_root: PathBuf,
    pub force_cpu: bool,
}

impl Default for CooccurrenceConfig {
    fn default() -> Self {
        Self {
            model: "google/gemma-2-2b".to_string(),
            ablator_sae_release: "gemma-scope-2b-pt-res-canonical".to_string(),
            ablator_sae_id: "layer_20/width_65k/canonical".to_string(),
            dataset_id: String::new(),
            max_tokens_in_prompt: 125,
            n_prompts: Some(1),
            save_frequency: 240,
            never_save: false,
            batch_size: 1,
            results_root: PathBuf::from("/results"),
            force_cpu: false,
        }
    }
}

/// Outcome of a run
#[derive(Debug)]
pub struct CooccurrenceSummary {
    pub n_batches: usize,
    pub n_prompts: usize,
    /// Files written, in order
    pub saved: Vec<PathBuf>,
    pub accumulator: CooccurrenceAccumulator,
}

/// Random hyphenated word pair, e.g. `quiet-otter`
pub fn random_slug<R: Rng>(rng: &mut R) -> String {
    let adjective = SLUG_ADJECTIVES.choose(rng).copied().unwrap_or("plain");
    let noun = SLUG_NOUNS.choose(rng).copied().unwrap_or("run");
    format!("{adjective}-{noun}")
}

/// Create `{root}/{YYYYmmdd-HHMMSS}{slug}`; the directory must not exist yet.
pub fn create_output_dir(root: &Path, now: DateTime<Local>, slug: &str) -> Result<PathBuf> {
    let dir = root.join(format!("{}{}", now.format("%Y%m%d-%H%M%S"), slug));
    std::fs::create_dir(&dir)
        .with_context(|| format!("Failed to create output directory {}", dir.display()))?;
    Ok(dir)
}

/// Whether to save after batch `i`
pub fn should_save(i: usize, is_last: bool, save_frequency: usize, never_save: bool) -> bool {
    !never_save && (is_last || i.is_multiple_of(save_frequency))
}

/// File for the counts saved after batch `batch`; unique per batch within a run.
pub fn intermediate_path(output_dir: &Path, now: DateTime<Local>, batch: usize) -> PathBuf {
    output_dir.join(format!(
        "{}_batch{batch}_intermediate.safetensors.zst",
        now.format("%Y%m%d-%H%M%S")
    ))
}

/// Accumulate co-occurrences over `batches`, saving into `output_dir`.
///
/// Each prompt of a batch is run separately; padding positions are ignored.
pub fn accumulate_cooccurrences<I>(
    model: &HookedModel,
    sae: &SparseAutoencoder,
    batches: I,
    save_frequency: usize,
    never_save: bool,
    output_dir: &Path,
) -> Result<CooccurrenceSummary>
where
    I: Iterator<Item = Result<PromptBatch>>,
{
    anyhow::ensure!(
        never_save || save_frequency > 0,
        "save_frequency must be positive"
    );

    let mut accumulator = CooccurrenceAccumulator::new(sae.config().d_sae, model.device())?;
    let mut saved = Vec::new();
    let mut n_batches = 0;
    let mut batches = batches.peekable();

    while let Some(batch) = batches.next() {
        let batch = batch?;
        let i = n_batches;
        for p in 0..batch.len() {
            let (input_ids, mask) = batch.prompt(p)?;
            let acts = model.sae_activations(&input_ids, sae)?;
            accumulator.add_prompt(&acts, Some(&mask))?;
        }
        n_batches += 1;
        debug!(
            "Batch {} done ({} prompts so far)",
            i,
            accumulator.n_prompts()
        );

        let is_last = batches.peek().is_none();
        if should_save(i, is_last, save_frequency, never_save) {
            let path = intermediate_path(output_dir, Local::now(), i);
            info!("Saving after batch {} to {}", i, path.display());
            save_v2(accumulator.to_bundle(), &path)?;
            info!("Done saving");
            saved.push(path);
        }
    }

    info!(
        "Processed {} prompts in {} batches",
        accumulator.n_prompts(),
        n_batches
    );
    Ok(CooccurrenceSummary {
        n_batches,
        n_prompts: accumulator.n_prompts(),
        saved,
        accumulator,
    })
}

/// Load model, SAE and dataset from `config` and run the experiment.
pub fn run_cooccurrences(config: &CooccurrenceConfig) -> Result<CooccurrenceSummary> {
    anyhow::ensure!(!config.dataset_id.is_empty(), "A dataset id is required");

    let slug = random_slug(&mut rand::thread_rng());
    let output_dir = create_output_dir(&config.results_root, Local::now(), &slug)?;
    info!("Writing to {}", output_dir.display());

    let model = HookedModel::from_pretrained(&config.model, config.force_cpu)?;
    let mut sae = SparseAutoencoder::from_pretrained(
        &config.ablator_sae_release,
        &config.ablator_sae_id,
        model.device(),
    )?;
    sae.use_error_term = true;
    info!("SAE has {} features", sae.config().d_sae);

    let source = DatasetSource::parse(&config.dataset_id)?;
    let batcher = PromptBatcher::new(
        model.tokenizer().clone(),
        config.max_tokens_in_prompt,
        config.batch_size,
        model.device().clone(),
    )?;
    let batches = batcher.batches(source.texts()?, config.n_prompts);

    accumulate_cooccurrences(
        &model,
        &sae,
        batches,
        config.save_frequency,
        config.never_save,
        &output_dir,
    )
}
