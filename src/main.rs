//! sae-hacking CLI: SAE feature co-occurrence, pairing and ablation experiments

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hf_hub::{api::sync::Api, Repo, RepoType};
use sae_hacking::cluster::{
    cluster_decoder, load_decoder, multi_member_clusters, truncate_levels, Metric,
};
use sae_hacking::model::SaeHook;
use sae_hacking::neuronpedia::fetch_feature_descriptions;
use sae_hacking::{
    create_html, find_4tuples, find_similar_noncooccurring_pairs, load_feature_effects, load_v2,
    run_cooccurrences, write_pair_report, CooccurrenceConfig, ExplanationLoader, FeatureAblation,
    HookedModel, PairSearchParams, SparseAutoencoder, ToyDataset,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sae-hacking")]
#[command(about = "Sparse autoencoder feature experiments on Gemma 2")]
#[command(version)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Count SAE feature co-occurrences over a prompt dataset
    Cooccurrences(CooccurrencesArgs),
    /// Find ablators with similar effects that never fire together
    FindPairs(FindPairsArgs),
    /// Find signed (A, B, C, D) patterns in per-ablator effects
    Find4tuples(Find4tuplesArgs),
    /// Render how strongly one feature fires on each token of a prompt
    RunOnPrompt(RunOnPromptArgs),
    /// Compare next-token predictions with and without ablated features
    Ablate(AblateArgs),
    /// Cluster SAE decoder vectors
    Cluster(ClusterArgs),
    /// Sample the synthetic hierarchical-feature dataset
    Toy(ToyArgs),
}

#[derive(Args)]
struct CooccurrencesArgs {
    #[arg(long, default_value = "google/gemma-2-2b")]
    model: String,
    #[arg(long, default_value = "gemma-scope-2b-pt-res-canonical")]
    ablator_sae_release: String,
    #[arg(long, default_value = "layer_20/width_65k/canonical")]
    ablator_sae_id: String,
    /// HuggingFace dataset id, or a local .jsonl / .jsonl.zst file or directory
    #[arg(long)]
    dataset_id: String,
    #[arg(long, default_value_t = 125)]
    max_tokens_in_prompt: usize,
    #[arg(long, default_value_t = 1)]
    n_prompts: usize,
    #[arg(long, default_value_t = 240)]
    save_frequency: usize,
    #[arg(long)]
    never_save: bool,
    /// Batch size for processing
    #[arg(long, default_value_t = 1)]
    batch_size: usize,
    #[arg(long, default_value = "/results")]
    results_root: PathBuf,
    /// Force CPU mode
    #[arg(long)]
    cpu: bool,
}

#[derive(Args)]
struct FindPairsArgs {
    #[arg(long)]
    input_path: PathBuf,
    /// If provided, load only the co-occurrence matrix from this path
    #[arg(long)]
    cooccurrence_path: Option<PathBuf>,
    /// Throw away any pairs that co-occur more than this
    #[arg(long, default_value_t = 0.0)]
    cooccurrence_threshold: f32,
    /// Only keep pairs with cosine similarity above this threshold
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    cosine_sim_threshold: f32,
    /// Neuronpedia id of the ablator SAE, e.g. gemma-2-2b/20-gemmascope-res-65k
    #[arg(long)]
    ablator_sae_neuronpedia_id: String,
    #[arg(long)]
    skip_before: Option<usize>,
    #[arg(long)]
    skip_after: Option<usize>,
    /// Compare raw effects instead of their signs
    #[arg(long)]
    skip_sign: bool,
    /// Maximum number of ablator rows to scan
    #[arg(long)]
    max_steps: Option<usize>,
    /// Report path (default: /results/<timestamp>.txt)
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct Find4tuplesArgs {
    #[arg(long)]
    input_path: PathBuf,
}

#[derive(Args)]
struct RunOnPromptArgs {
    #[arg(long, default_value = "google/gemma-2-2b")]
    model: String,
    #[arg(long)]
    sae_release: String,
    #[arg(long)]
    sae_id: String,
    #[arg(long)]
    feature_idx: usize,
    #[arg(long)]
    prompt: String,
    /// Write the HTML here instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    cpu: bool,
}

#[derive(Args)]
struct AblateArgs {
    #[arg(long, default_value = "google/gemma-2-2b")]
    model: String,
    #[arg(long, default_value = "gemma-scope-2b-pt-res-canonical")]
    sae_release: String,
    #[arg(long, default_value = "layer_20/width_65k/canonical")]
    sae_id: String,
    #[arg(long, default_value = "In the beginning, God created the heavens and the")]
    prompt: String,
    #[arg(long, default_value = "earth")]
    answer: String,
    /// Features to ablate
    #[arg(long, value_delimiter = ',', default_value = "16873")]
    features: Vec<usize>,
    /// Only ablate at this token position
    #[arg(long)]
    position: Option<usize>,
    #[arg(long, default_value_t = 10)]
    top_k: usize,
    #[arg(long)]
    cpu: bool,
}

#[derive(Args)]
struct ClusterArgs {
    /// Only cluster the first N decoder vectors
    #[arg(long)]
    abridge: Option<usize>,
    #[arg(long, default_value = "google/gemma-scope-2b-pt-res")]
    repo: String,
    #[arg(long, default_value = "layer_20/width_16k/average_l0_71/params.npz")]
    params: String,
    #[arg(long, value_enum, default_value_t = Metric::Cosine)]
    metric: Metric,
    #[arg(long, default_value_t = 500)]
    n_clusters: usize,
    /// Dendrogram levels kept in the truncated summary
    #[arg(long, default_value_t = 4)]
    levels: usize,
    /// Neuronpedia id used to describe clustered features
    #[arg(long, default_value = "gemma-2-2b/20-gemmascope-res-16k")]
    neuronpedia_id: String,
    /// Fetch feature descriptions from Neuronpedia
    #[arg(long)]
    describe: bool,
    #[arg(long, default_value = "/results")]
    output_dir: PathBuf,
}

#[derive(Args)]
struct ToyArgs {
    #[arg(long, default_value_t = 100)]
    num_features: usize,
    #[arg(long, default_value_t = 0.1)]
    perturbation_size: f32,
    #[arg(long, default_value_t = 64)]
    model_dim: usize,
    #[arg(long, default_value_t = 5)]
    k: usize,
    #[arg(long, default_value_t = 32)]
    batch_size: usize,
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Cooccurrences(args) => cooccurrences(args),
        Command::FindPairs(args) => find_pairs(args),
        Command::Find4tuples(args) => find_4tuples_cmd(args),
        Command::RunOnPrompt(args) => run_on_prompt(args),
        Command::Ablate(args) => ablate(args),
        Command::Cluster(args) => cluster(args),
        Command::Toy(args) => toy(args),
    }
}

fn cooccurrences(args: CooccurrencesArgs) -> Result<()> {
    let config = CooccurrenceConfig {
        model: args.model,
        ablator_sae_release: args.ablator_sae_release,
        ablator_sae_id: args.ablator_sae_id,
        dataset_id: args.dataset_id,
        max_tokens_in_prompt: args.max_tokens_in_prompt,
        n_prompts: Some(args.n_prompts),
        save_frequency: args.save_frequency,
        never_save: args.never_save,
        batch_size: args.batch_size,
        results_root: args.results_root,
        force_cpu: args.cpu,
    };
    let summary = run_cooccurrences(&config)?;
    println!(
        "Processed {} prompts in {} batches",
        summary.n_prompts, summary.n_batches
    );
    for path in &summary.saved {
        println!("Saved {}", path.display());
    }
    Ok(())
}

fn find_pairs(args: FindPairsArgs) -> Result<()> {
    let output = match args.output {
        Some(path) => path,
        None => {
            std::fs::create_dir_all("/results")?;
            PathBuf::from(format!(
                "/results/{}.txt",
                chrono::Local::now().format("%Y%m%d_%H%M")
            ))
        }
    };
    println!("Output will be saved to: {}", output.display());

    info!("Loading file");
    let data = load_v2(&args.input_path)?;
    let effects = data.require_effects()?;
    let how_often = data.require_how_often()?;
    let cooccurrences = match &args.cooccurrence_path {
        Some(path) => {
            info!("Loading co-occurrence matrix from {}", path.display());
            load_v2(path)?
                .cooccurrences_ee
                .context("Co-occurrence file has no cooccurrences_ee")?
        }
        None => data.require_cooccurrences()?.clone(),
    };

    info!("Finding similar non-co-occurring pairs...");
    let params = PairSearchParams {
        cooccurrence_threshold: args.cooccurrence_threshold,
        cosine_sim_threshold: args.cosine_sim_threshold,
        max_steps: args.max_steps,
        skip_before: args.skip_before,
        skip_after: args.skip_after,
        skip_sign: args.skip_sign,
    };
    let pairs = find_similar_noncooccurring_pairs(effects, &cooccurrences, &params)?;

    let explanations = ExplanationLoader::new(&args.ablator_sae_neuronpedia_id)?;
    let mut out = BufWriter::new(
        File::create(&output).with_context(|| format!("Failed to create {}", output.display()))?,
    );
    write_pair_report(
        &mut out,
        &pairs,
        &args.ablator_sae_neuronpedia_id,
        &cooccurrences,
        how_often,
        |i| explanations.get_explanation(i),
    )?;
    out.flush()?;
    info!("Results saved to {}", output.display());
    Ok(())
}

fn find_4tuples_cmd(args: Find4tuplesArgs) -> Result<()> {
    let effects = load_feature_effects(&args.input_path)?;
    let rows = effects.to_f32_rows()?;
    info!("Searching {} ablators for 4-tuples", rows.len());
    let tuples = find_4tuples(&rows);
    println!("Found {} 4-tuples", tuples.len());
    for (a, b, c, d) in &tuples {
        println!("{a} {b} {c} {d}");
    }
    Ok(())
}

fn run_on_prompt(args: RunOnPromptArgs) -> Result<()> {
    info!("Starting");
    let model = HookedModel::from_pretrained(&args.model, args.cpu)?;
    info!("Loaded model");
    let mut sae = SparseAutoencoder::from_pretrained(&args.sae_release, &args.sae_id, model.device())?;
    sae.use_error_term = true;
    info!("Loaded SAE");

    let activations = model.feature_activation_per_token(&sae, args.feature_idx, &args.prompt)?;
    info!("Got activations");
    let tokens = model.token_strings(&args.prompt)?;
    info!("{} tokens, {} activations", tokens.len(), activations.len());

    let description = format!(
        "model={}, sae_release={}, sae_id={}, feature_idx={}, prompt={:?}",
        args.model, args.sae_release, args.sae_id, args.feature_idx, args.prompt
    );
    let html = create_html(&tokens, &activations, &description)?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, html)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Wrote {}", path.display());
        }
        None => println!("{html}"),
    }
    Ok(())
}

fn ablate(args: AblateArgs) -> Result<()> {
    let model = HookedModel::from_pretrained(&args.model, args.cpu)?;
    let mut sae = SparseAutoencoder::from_pretrained(&args.sae_release, &args.sae_id, model.device())?;

    let clean = model.test_prompt(&args.prompt, &args.answer, None, args.top_k)?;
    print!("{}", clean.summary());

    let mut ablation = FeatureAblation::features(&args.features);
    if let Some(position) = args.position {
        ablation = ablation.at_position(position);
    }

    for use_error_term in [false, true] {
        let label = if use_error_term { "error term" } else { "no error term" };
        println!("Test Prompt with feature ablation and {label}");
        sae.use_error_term = use_error_term;
        let hook = SaeHook {
            sae: &sae,
            ablation: &ablation,
        };
        let result = model.test_prompt(&args.prompt, &args.answer, Some(hook), args.top_k)?;
        print!("{}", result.summary());
    }
    Ok(())
}

fn cluster(args: ClusterArgs) -> Result<()> {
    let api = Api::new()?;
    let repo = api.repo(Repo::new(args.repo.clone(), RepoType::Model));
    let params_path = repo
        .get(&args.params)
        .with_context(|| format!("Failed to download {}", args.params))?;

    let points = load_decoder(&params_path, args.abridge)?;
    let n = points.nrows();
    let (merges, labels) = cluster_decoder(&points, args.metric, args.n_clusters)?;

    std::fs::create_dir_all(&args.output_dir)?;
    let linkage_path = args.output_dir.join("linkage.json");
    std::fs::write(&linkage_path, serde_json::to_string_pretty(&merges)?)?;
    info!("Linkage saved to {}", linkage_path.display());

    let leaves = truncate_levels(&merges, n, args.levels);
    println!("Dendrogram leaves ({} levels): {:?}", args.levels, leaves);

    let clusters = multi_member_clusters(&labels);
    let descriptions: HashMap<usize, String> = if args.describe {
        info!("Getting descriptions from Neuronpedia...");
        let wanted: Vec<usize> = clusters.iter().flat_map(|(_, m)| m.iter().copied()).collect();
        let fetched = fetch_feature_descriptions(&args.neuronpedia_id, &wanted)?;
        wanted.into_iter().zip(fetched).collect()
    } else {
        HashMap::new()
    };

    let clusters_path = args.output_dir.join("clusters.txt");
    let mut out = BufWriter::new(File::create(&clusters_path)?);
    for (label, members) in &clusters {
        writeln!(out, "Cluster {label} size: {}", members.len())?;
        for idx in members {
            match descriptions.get(idx) {
                Some(d) => writeln!(out, "{idx}: {d}")?,
                None => writeln!(out, "{idx}")?,
            }
        }
        writeln!(out)?;
    }
    out.flush()?;
    info!(
        "{} clusters with more than one member saved to {}",
        clusters.len(),
        clusters_path.display()
    );
    Ok(())
}

fn toy(args: ToyArgs) -> Result<()> {
    let mut dataset = ToyDataset::new(
        args.num_features,
        args.perturbation_size,
        args.model_dim,
        args.k,
        args.seed,
    )?;
    let (batch, n_active) = dataset.generate(args.batch_size)?;
    println!(
        "Generated batch {:?} with {} active features",
        batch.dim(),
        n_active
    );
    Ok(())
}
