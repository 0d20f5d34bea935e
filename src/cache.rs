//! Hook-point cache for intermediate activations
//!
//! Tensors are keyed by TransformerLens-style hook names, e.g.
//! `blocks.20.hook_resid_post` or
//! `blocks.20.hook_resid_post.hook_sae_acts_post`.

use std::collections::BTreeMap;

use anyhow::Result;
use candle_core::{DType, Tensor};

/// Activations captured during a hooked forward pass
#[derive(Debug, Default)]
pub struct HookCache {
    entries: BTreeMap<String, Tensor>,
}

impl HookCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a tensor under a hook name, replacing any previous value
    pub fn insert(&mut self, hook_name: impl Into<String>, tensor: Tensor) {
        self.entries.insert(hook_name.into(), tensor);
    }

    /// Get the tensor captured at a hook
    pub fn get(&self, hook_name: &str) -> Option<&Tensor> {
        self.entries.get(hook_name)
    }

    /// Get the tensor captured at a hook, or fail listing what was captured
    pub fn require(&self, hook_name: &str) -> Result<&Tensor> {
        self.entries.get(hook_name).ok_or_else(|| {
            anyhow::anyhow!(
                "Hook '{hook_name}' not in cache (have: {:?})",
                self.entries.keys().collect::<Vec<_>>()
            )
        })
    }

    /// Remove and return the tensor captured at a hook
    pub fn take(&mut self, hook_name: &str) -> Result<Tensor> {
        let tensor = self.require(hook_name)?.clone();
        self.entries.remove(hook_name);
        Ok(tensor)
    }

    /// Hook names in sorted order
    pub fn hook_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of captured hooks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Values of one feature across positions of a `[1, seq_len, d]` hook tensor
    pub fn column(&self, hook_name: &str, index: usize) -> Result<Vec<f32>> {
        let tensor = self.require(hook_name)?;
        let (batch, _seq_len, width) = tensor.dims3()?;
        anyhow::ensure!(batch == 1, "Expected batch size 1 at '{hook_name}', got {batch}");
        anyhow::ensure!(
            index < width,
            "Index {index} out of range for '{hook_name}' (width={width})"
        );
        let column = tensor.squeeze(0)?.narrow(1, index, 1)?.squeeze(1)?;
        Ok(column.to_dtype(DType::F32)?.to_vec1()?)
    }
}
