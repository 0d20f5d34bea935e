//! Integration tests for sae-hacking
//!
//! Note: Tests marked with #[ignore] download models or query Neuronpedia.
//! Run them explicitly with: cargo test --ignored

use std::collections::BTreeMap;
use std::io::Write;
use std::str::FromStr;

use candle_core::{Device, Tensor};
use sae_hacking::{
    find_4tuples, find_similar_noncooccurring_pairs, load_feature_effects, load_v2,
    save_feature_effects, save_v2, write_pair_report, CooccurrenceAccumulator, DatasetSource,
    FeatureEffects, PairSearchParams, PromptBatcher, TensorBundle,
};
use tempfile::tempdir;
use tokenizers::Tokenizer;

fn prompt_acts(rows: &[[f32; 3]]) -> Tensor {
    Tensor::from_vec(rows.concat(), (1, rows.len(), 3), &Device::Cpu).unwrap()
}

/// Co-occurrence counting, saving, reloading and pair search end to end
#[test]
fn test_cooccurrence_to_pairs_pipeline() {
    let mut acc = CooccurrenceAccumulator::new(3, &Device::Cpu).unwrap();
    // Features 0 and 2 fire in the same prompt, feature 1 alone
    acc.add_prompt(&prompt_acts(&[[1.0, 0.0, 0.0], [0.0, 0.0, 2.0]]), None)
        .unwrap();
    acc.add_prompt(&prompt_acts(&[[0.0, 3.0, 0.0]]), None).unwrap();
    assert_eq!(acc.n_prompts(), 2);

    let mut bundle = acc.to_bundle();
    bundle.effects_ee = Some(
        Tensor::new(
            &[[1.0f32, -1.0, 0.0], [2.0, -3.0, 0.0], [1.0, -1.0, 0.0]],
            &Device::Cpu,
        )
        .unwrap(),
    );

    let dir = tempdir().unwrap();
    let path = dir.path().join("result.safetensors.zst");
    save_v2(bundle, &path).unwrap();
    let loaded = load_v2(&path).unwrap();

    let how_often: Vec<f32> = loaded.require_how_often().unwrap().to_vec1().unwrap();
    assert_eq!(how_often, vec![1.0, 1.0, 1.0]);
    let cooc: Vec<Vec<f32>> = loaded.require_cooccurrences().unwrap().to_vec2().unwrap();
    assert_eq!(cooc[0][2], 1.0);
    assert_eq!(cooc[0][1], 0.0);

    let pairs = find_similar_noncooccurring_pairs(
        loaded.require_effects().unwrap(),
        loaded.require_cooccurrences().unwrap(),
        &PairSearchParams::default(),
    )
    .unwrap();
    // Identical sign patterns everywhere, but 0 and 2 co-occurred
    assert_eq!(pairs.len(), 4);
    assert!(pairs
        .iter()
        .all(|p| !matches!((p.ablator1, p.ablator2), (0, 2) | (2, 0))));
    assert!(pairs.iter().all(|p| (p.cosine - 1.0).abs() < 1e-5));

    let mut report = Vec::new();
    write_pair_report(
        &mut report,
        &pairs,
        "gemma-2-2b/20-gemmascope-res-65k",
        loaded.require_cooccurrences().unwrap(),
        loaded.require_how_often().unwrap(),
        |i| format!("feature {i}"),
    )
    .unwrap();
    let report = String::from_utf8(report).unwrap();
    assert!(report.starts_with("Found 4 similar non-co-occurring pairs"));
    assert!(report.contains("https://www.neuronpedia.org/gemma-2-2b/20-gemmascope-res-65k/1"));
    assert!(report.contains("Ablator 1: feature 1"));
}

/// Pair search against a separately stored co-occurrence matrix
#[test]
fn test_pairs_with_external_cooccurrences() {
    let dir = tempdir().unwrap();
    let cooc_path = dir.path().join("cooc.safetensors.zst");
    let cooc = Tensor::new(&[[5.0f32, 9.0], [9.0, 7.0]], &Device::Cpu).unwrap();
    let counts = Tensor::new(&[5.0f32, 7.0], &Device::Cpu).unwrap();
    save_v2(TensorBundle::from_cooccurrences(cooc, counts), &cooc_path).unwrap();

    let effects = Tensor::new(&[[1.0f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
    let cooc = load_v2(&cooc_path).unwrap().cooccurrences_ee.unwrap();

    let strict = PairSearchParams::default();
    assert!(find_similar_noncooccurring_pairs(&effects, &cooc, &strict)
        .unwrap()
        .is_empty());

    let loose = PairSearchParams {
        cooccurrence_threshold: 10.0,
        ..PairSearchParams::default()
    };
    assert_eq!(
        find_similar_noncooccurring_pairs(&effects, &cooc, &loose)
            .unwrap()
            .len(),
        2
    );
}

/// 4-tuple search over effects stored in the per-ablator layout
#[test]
fn test_4tuples_from_saved_effects() {
    let mut effects = BTreeMap::new();
    effects.insert(
        0,
        Tensor::new(&[1.0f32, 1.0, 1.0], &Device::Cpu).unwrap(),
    );
    effects.insert(
        1,
        Tensor::new(&[0.0f32, 1.0, -1.0], &Device::Cpu).unwrap(),
    );
    let dir = tempdir().unwrap();
    let path = dir.path().join("effects.safetensors.zst");
    save_feature_effects(
        &FeatureEffects {
            effects,
            cooccurrences: None,
        },
        &path,
    )
    .unwrap();

    let rows = load_feature_effects(&path).unwrap().to_f32_rows().unwrap();
    assert_eq!(find_4tuples(&rows), vec![(0, 1, 1, 2)]);
}

fn word_tokenizer() -> Tokenizer {
    let json = r#"{"version":"1.0","truncation":null,"padding":null,"added_tokens":[],
        "normalizer":null,"pre_tokenizer":{"type":"Whitespace"},"post_processor":null,
        "decoder":null,"model":{"type":"WordLevel",
        "vocab":{"<pad>":0,"<unk>":1,"the":2,"heavens":3,"and":4,"earth":5},
        "unk_token":"<unk>"}}"#;
    Tokenizer::from_str(json).unwrap()
}

/// Local jsonl shards stream into padded prompt batches
#[test]
fn test_local_dataset_batches() {
    let dir = tempdir().unwrap();
    let mut shard = std::fs::File::create(dir.path().join("00.jsonl")).unwrap();
    writeln!(shard, r#"{{"text": "the heavens"}}"#).unwrap();
    writeln!(shard, r#"{{"meta": "no text"}}"#).unwrap();
    writeln!(shard, r#"{{"text": "the heavens and the earth"}}"#).unwrap();
    writeln!(shard, r#"{{"text": "earth"}}"#).unwrap();
    drop(shard);

    let source = DatasetSource::parse(dir.path().to_str().unwrap()).unwrap();
    assert!(matches!(source, DatasetSource::Files(ref f) if f.len() == 1));

    let batcher = PromptBatcher::new(word_tokenizer(), 4, 2, Device::Cpu).unwrap();
    let batches: Vec<_> = batcher
        .batches(source.texts().unwrap(), Some(3))
        .collect::<anyhow::Result<_>>()
        .unwrap();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].len(), 2);
    assert_eq!(batches[1].len(), 1);

    let ids: Vec<Vec<u32>> = batches[0].input_ids.to_vec2().unwrap();
    assert_eq!(ids, vec![vec![2, 3, 0, 0], vec![2, 3, 4, 2]]);
    let mask: Vec<Vec<u32>> = batches[0].attention_mask.to_vec2().unwrap();
    assert_eq!(mask, vec![vec![1, 1, 0, 0], vec![1, 1, 1, 1]]);
}

/// Model-dependent test: Gemma 2 loading
#[test]
#[ignore = "requires model download"]
fn test_model_loading() {
    use sae_hacking::HookedModel;

    let model = HookedModel::from_pretrained("google/gemma-2-2b", true).unwrap();
    assert_eq!(model.n_layers(), 26);
    assert_eq!(model.d_model(), 2304);
}

/// Model-dependent test: prompt batches from the hub tokenizer
#[test]
#[ignore = "requires model download"]
fn test_generate_prompts_shape() {
    use sae_hacking::model::load_tokenizer;

    let tokenizer = load_tokenizer("google/gemma-2-2b").unwrap();
    let batcher = PromptBatcher::new(tokenizer, 100, 2, Device::Cpu).unwrap();
    let texts = vec!["Hello world".to_string(), "In the beginning".to_string()];
    let batch = batcher.batch(&texts).unwrap();
    assert_eq!(batch.input_ids.dims(), &[2, 100]);
}

/// Model-dependent test: "earth" is the top continuation of the Genesis prompt
#[test]
#[ignore = "requires model download"]
fn test_prompt_ranks_answer() {
    use sae_hacking::HookedModel;

    let model = HookedModel::from_pretrained("google/gemma-2-2b", true).unwrap();
    let result = model
        .test_prompt(
            "In the beginning, God created the heavens and the",
            "earth",
            None,
            10,
        )
        .unwrap();
    assert_eq!(result.answer_rank(), Some(0));
}

/// Network-dependent test: Neuronpedia explanations
#[test]
#[ignore = "requires network access"]
fn test_neuronpedia_description() {
    let description =
        sae_hacking::fetch_feature_description("gemma-2-2b/20-gemmascope-res-16k", 0).unwrap();
    assert!(!description.is_empty());
}
