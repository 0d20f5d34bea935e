//! Prompt datasets: streaming text shards and batching them into token tensors
//!
//! A dataset is either a HuggingFace dataset repository, whose `train/` split
//! is stored as `.jsonl` or `.jsonl.zst` shards, or a list of local shard files.
//! Every line is a JSON object whose `text` field is one prompt.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use hf_hub::api::sync::{Api, ApiRepo};
use hf_hub::{Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::{debug, info};

const SHARD_EXTENSIONS: [&str; 2] = [".jsonl.zst", ".jsonl"];

/// Where prompts come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetSource {
    /// HuggingFace dataset repo, e.g. `monology/pile-uncopyrighted`
    Hub { repo_id: String, split: String },
    /// Local `.jsonl` / `.jsonl.zst` files, read in order
    Files(Vec<PathBuf>),
}

impl DatasetSource {
    /// Interpret `source` as a local file or directory if it exists, else as a hub repo id.
    pub fn parse(source: &str) -> Result<Self> {
        let path = Path::new(source);
        if path.is_file() {
            return Ok(Self::Files(vec![path.to_path_buf()]));
        }
        if path.is_dir() {
            let mut files: Vec<PathBuf> = std::fs::read_dir(path)
                .with_context(|| format!("Failed to list {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.to_str().is_some_and(is_shard_name))
                .collect();
            files.sort();
            anyhow::ensure!(!files.is_empty(), "No .jsonl shards in {}", path.display());
            return Ok(Self::Files(files));
        }
        Ok(Self::Hub {
            repo_id: source.to_string(),
            split: "train".to_string(),
        })
    }

    /// Stream the `text` field of every record.
    pub fn texts(&self) -> Result<TextStream> {
        match self {
            Self::Files(files) => Ok(TextStream {
                repo: None,
                pending: files.iter().cloned().map(Shard::Local).collect(),
                current: None,
            }),
            Self::Hub { repo_id, split } => {
                let api = Api::new().context("Failed to create HuggingFace API")?;
                let repo = api.repo(Repo::new(repo_id.clone(), RepoType::Dataset));
                let info = repo
                    .info()
                    .with_context(|| format!("Failed to list files of dataset {repo_id}"))?;
                let prefix = format!("{split}/");
                let mut shards: Vec<String> = info
                    .siblings
                    .into_iter()
                    .map(|s| s.rfilename)
                    .filter(|f| f.starts_with(&prefix) && is_shard_name(f))
                    .collect();
                shards.sort();
                anyhow::ensure!(
                    !shards.is_empty(),
                    "Dataset {repo_id} has no .jsonl shards under {prefix}"
                );
                info!("Dataset {} has {} shards in {}", repo_id, shards.len(), split);
                Ok(TextStream {
                    repo: Some(repo),
                    pending: shards.into_iter().map(Shard::Remote).collect(),
                    current: None,
                })
            }
        }
    }
}

fn is_shard_name(name: &str) -> bool {
    SHARD_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}

enum Shard {
    Local(PathBuf),
    Remote(String),
}

/// Lazily opened sequence of shards yielding prompt texts
pub struct TextStream {
    repo: Option<ApiRepo>,
    pending: VecDeque<Shard>,
    current: Option<Lines<Box<dyn BufRead>>>,
}

impl TextStream {
    fn open_next_shard(&mut self) -> Result<bool> {
        let Some(shard) = self.pending.pop_front() else {
            return Ok(false);
        };
        let path = match shard {
            Shard::Local(path) => path,
            Shard::Remote(name) => {
                let repo = self
                    .repo
                    .as_ref()
                    .context("Remote shard without a dataset repo")?;
                info!("Downloading shard {}", name);
                repo.get(&name)
                    .with_context(|| format!("Failed to download {name}"))?
            }
        };
        self.current = Some(open_shard(&path)?.lines());
        Ok(true)
    }
}

impl Iterator for TextStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                match self.open_next_shard() {
                    Ok(true) => {}
                    Ok(false) => return None,
                    Err(e) => return Some(Err(e)),
                }
            }
            let lines = self.current.as_mut()?;
            match lines.next() {
                None => self.current = None,
                Some(Err(e)) => return Some(Err(e.into())),
                Some(Ok(line)) => {
                    if let Some(text) = parse_text_line(&line) {
                        return Some(Ok(text));
                    }
                }
            }
        }
    }
}

fn open_shard(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let is_zst = path.extension().is_some_and(|ext| ext == "zst");
    if is_zst {
        let decoder = zstd::stream::read::Decoder::new(file)
            .with_context(|| format!("Failed to start zstd decoding of {}", path.display()))?;
        Ok(Box::new(BufReader::new(decoder)))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// The `text` field of a JSON line, if any
fn parse_text_line(line: &str) -> Option<String> {
    if line.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(line) {
        Ok(value) => match value.get("text").and_then(|t| t.as_str()) {
            Some(text) => Some(text.to_string()),
            None => {
                debug!("Skipping record without a text field");
                None
            }
        },
        Err(e) => {
            debug!("Skipping malformed record: {}", e);
            None
        }
    }
}

/// Fixed-length token batch
#[derive(Debug, Clone)]
pub struct PromptBatch {
    /// `[batch, max_tokens]` (u32)
    pub input_ids: Tensor,
    /// `[batch, max_tokens]` (u32), 1 for real tokens and 0 for padding
    pub attention_mask: Tensor,
}

impl PromptBatch {
    /// Number of prompts in the batch
    pub fn len(&self) -> usize {
        self.input_ids.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Prompt `i` as `([1, T] ids, [T] mask)`
    pub fn prompt(&self, i: usize) -> Result<(Tensor, Tensor)> {
        anyhow::ensure!(i < self.len(), "Prompt {i} out of range ({})", self.len());
        Ok((
            self.input_ids.narrow(0, i, 1)?,
            self.attention_mask.get(i)?,
        ))
    }
}

/// Tokenizes texts into padded, truncated batches
pub struct PromptBatcher {
    tokenizer: Tokenizer,
    max_tokens: usize,
    batch_size: usize,
    pad_id: u32,
    device: Device,
}

impl PromptBatcher {
    pub fn new(
        tokenizer: Tokenizer,
        max_tokens: usize,
        batch_size: usize,
        device: Device,
    ) -> Result<Self> {
        anyhow::ensure!(max_tokens > 0, "max_tokens must be positive");
        anyhow::ensure!(batch_size > 0, "batch_size must be positive");
        let pad_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| tokenizer.token_to_id("<pad>"))
            .context("Tokenizer has no padding token")?;
        Ok(Self {
            tokenizer,
            max_tokens,
            batch_size,
            pad_id,
            device,
        })
    }

    /// Tokenize `texts` with special tokens, truncating and right-padding to `max_tokens`.
    pub fn batch(&self, texts: &[String]) -> Result<PromptBatch> {
        anyhow::ensure!(!texts.is_empty(), "Cannot batch zero prompts");
        let t = self.max_tokens;
        let mut ids = Vec::with_capacity(texts.len() * t);
        let mut mask = Vec::with_capacity(texts.len() * t);
        for text in texts {
            let encoding = self
                .tokenizer
                .encode(text.as_str(), true)
                .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
            let tokens = encoding.get_ids();
            let kept = tokens.len().min(t);
            ids.extend_from_slice(&tokens[..kept]);
            ids.extend(std::iter::repeat_n(self.pad_id, t - kept));
            mask.extend(std::iter::repeat_n(1u32, kept));
            mask.extend(std::iter::repeat_n(0u32, t - kept));
        }
        let shape = (texts.len(), t);
        Ok(PromptBatch {
            input_ids: Tensor::from_vec(ids, shape, &self.device)?,
            attention_mask: Tensor::from_vec(mask, shape, &self.device)?,
        })
    }

    /// Group a text stream into batches, stopping after `n_prompts` prompts.
    pub fn batches<I>(&self, texts: I, n_prompts: Option<usize>) -> PromptBatches<'_, I>
    where
        I: Iterator<Item = Result<String>>,
    {
        PromptBatches {
            batcher: self,
            texts,
            remaining: n_prompts,
        }
    }
}

/// Iterator returned by [`PromptBatcher::batches`]
pub struct PromptBatches<'a, I> {
    batcher: &'a PromptBatcher,
    texts: I,
    remaining: Option<usize>,
}

impl<I> Iterator for PromptBatches<'_, I>
where
    I: Iterator<Item = Result<String>>,
{
    type Item = Result<PromptBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let want = match self.remaining {
            Some(0) => return None,
            Some(n) => n.min(self.batcher.batch_size),
            None => self.batcher.batch_size,
        };
        let mut texts = Vec::with_capacity(want);
        while texts.len() < want {
            match self.texts.next() {
                Some(Ok(text)) => texts.push(text),
                Some(Err(e)) => return Some(Err(e)),
                None => break,
            }
        }
        if texts.is_empty() {
            return None;
        }
        if let Some(n) = self.remaining.as_mut() {
            *n -= texts.len();
        }
        Some(self.batcher.batch(&texts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::word_tokenizer;
    use std::io::Write;

    fn texts(items: &[&str]) -> impl Iterator<Item = Result<String>> {
        items
            .iter()
            .map(|s| Ok((*s).to_string()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_parse_text_line() {
        assert_eq!(
            parse_text_line(r#"{"text": "the earth", "meta": {}}"#),
            Some("the earth".to_string())
        );
        assert_eq!(parse_text_line(r#"{"content": "x"}"#), None);
        assert_eq!(parse_text_line(r#"{"text": 3}"#), None);
        assert_eq!(parse_text_line("not json"), None);
        assert_eq!(parse_text_line("   "), None);
    }

    #[test]
    fn test_batch_pads_and_truncates() {
        let batcher = PromptBatcher::new(word_tokenizer(), 3, 2, Device::Cpu).unwrap();
        let batch = batcher
            .batch(&["the earth".to_string(), "the heavens and the earth".to_string()])
            .unwrap();
        assert_eq!(batch.input_ids.dims(), &[2, 3]);
        let ids: Vec<Vec<u32>> = batch.input_ids.to_vec2().unwrap();
        assert_eq!(ids[0], vec![2, 5, 0]);
        assert_eq!(ids[1], vec![2, 3, 4]);
        let mask: Vec<Vec<u32>> = batch.attention_mask.to_vec2().unwrap();
        assert_eq!(mask[0], vec![1, 1, 0]);
        assert_eq!(mask[1], vec![1, 1, 1]);

        let (one, one_mask) = batch.prompt(0).unwrap();
        assert_eq!(one.dims(), &[1, 3]);
        assert_eq!(one_mask.dims(), &[3]);
        assert!(batch.prompt(2).is_err());
    }

    #[test]
    fn test_batches_cap_prompt_count() {
        let batcher = PromptBatcher::new(word_tokenizer(), 4, 2, Device::Cpu).unwrap();
        let items = ["the", "earth", "and", "water", "God"];

        let sizes: Vec<usize> = batcher
            .batches(texts(&items), Some(3))
            .map(|b| b.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![2, 1]);

        let sizes: Vec<usize> = batcher
            .batches(texts(&items), None)
            .map(|b| b.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        assert_eq!(batcher.batches(texts(&items), Some(0)).count(), 0);
    }

    #[test]
    fn test_local_shards_plain_and_zstd() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("a.jsonl");
        let mut f = File::create(&plain).unwrap();
        writeln!(f, r#"{{"text": "first"}}"#).unwrap();
        writeln!(f, r#"{{"meta": 1}}"#).unwrap();
        writeln!(f, r#"{{"text": "second"}}"#).unwrap();

        let compressed = dir.path().join("b.jsonl.zst");
        let body = "{\"text\": \"third\"}\n";
        std::fs::write(&compressed, zstd::encode_all(body.as_bytes(), 0).unwrap()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = DatasetSource::parse(dir.path().to_str().unwrap()).unwrap();
        assert_eq!(source, DatasetSource::Files(vec![plain, compressed]));
        let all: Vec<String> = source.texts().unwrap().map(|t| t.unwrap()).collect();
        assert_eq!(all, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_parse_hub_source() {
        assert_eq!(
            DatasetSource::parse("monology/pile-uncopyrighted").unwrap(),
            DatasetSource::Hub {
                repo_id: "monology/pile-uncopyrighted".to_string(),
                split: "train".to_string()
            }
        );
    }
}
