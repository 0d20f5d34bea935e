//! Cached additive attention masks for the Gemma 2 forward pass
//!
//! Gemma 2 alternates sliding-window and global causal attention. Both mask
//! kinds are cached by `(seq_len, window, device_id, dtype)` because the same
//! prompt length is reused for every prompt of a padded dataset run. The cache
//! returns shallow clones (Arc bump, no data copy).

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

/// `(seq_len, window, device_id, dtype)`; `window == None` is the global mask
type MaskKey = (usize, Option<usize>, usize, DType);

static MASK_CACHE: LazyLock<Mutex<HashMap<MaskKey, Tensor>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Additive causal mask of shape `[1, 1, seq_len, seq_len]`.
///
/// Entry `(i, j)` is `0.0` when query `i` may attend to key `j` and `-inf`
/// otherwise. With `window = Some(w)` each query sees itself and the `w - 1`
/// keys before it, so key `j` is masked once `i - j >= w`.
///
/// For seq_len=4, window=Some(2):
/// ```text
/// [[   0, -inf, -inf, -inf],
///  [   0,    0, -inf, -inf],
///  [-inf,    0,    0, -inf],
///  [-inf, -inf,    0,    0]]
/// ```
pub fn attention_mask(
    seq_len: usize,
    window: Option<usize>,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let key = (seq_len, window, device_id(device), dtype);

    if let Some(cached) = lock_cache()?.get(&key) {
        return Ok(cached.clone());
    }

    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..seq_len).map(move |j| {
                let future = j > i;
                let too_far = window.is_some_and(|w| i.saturating_sub(j) >= w);
                if future || too_far {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;

    lock_cache()?.insert(key, mask.clone());
    Ok(mask)
}

/// Drop all cached masks.
pub fn clear_mask_cache() -> Result<()> {
    lock_cache()?.clear();
    Ok(())
}

/// Number of cached masks.
pub fn mask_cache_size() -> Result<usize> {
    Ok(lock_cache()?.len())
}

fn lock_cache() -> Result<std::sync::MutexGuard<'static, HashMap<MaskKey, Tensor>>> {
    MASK_CACHE
        .lock()
        .map_err(|_| anyhow::anyhow!("Attention mask cache poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn is_neg_inf(v: f32) -> bool {
        v.is_infinite() && v < 0.0
    }

    #[test]
    #[serial]
    fn test_global_mask_values() {
        let mask = attention_mask(3, None, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let data: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();

        assert_eq!(data[0], 0.0);
        assert!(is_neg_inf(data[1]) && is_neg_inf(data[2]));
        assert_eq!(&data[3..5], &[0.0, 0.0]);
        assert!(is_neg_inf(data[5]));
        assert_eq!(&data[6..9], &[0.0, 0.0, 0.0]);
    }

    #[test]
    #[serial]
    fn test_sliding_window_masks_distant_keys() {
        let mask = attention_mask(4, Some(2), &Device::Cpu, DType::F32).unwrap();
        let rows: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();

        // Each query sees exactly `window` keys once the prompt is long enough
        assert!(is_neg_inf(rows[3][0]) && is_neg_inf(rows[3][1]));
        assert_eq!(&rows[3][2..], &[0.0, 0.0]);
        assert!(is_neg_inf(rows[2][0]));
        assert_eq!(&rows[2][1..3], &[0.0, 0.0]);
        assert!(is_neg_inf(rows[2][3]));
        assert_eq!(&rows[1][..2], &[0.0, 0.0]);

        let visible: Vec<usize> = rows
            .iter()
            .map(|row| row.iter().filter(|v| **v == 0.0).count())
            .collect();
        assert_eq!(visible, vec![1, 2, 2, 2]);
    }

    #[test]
    #[serial]
    fn test_window_of_one_is_diagonal() {
        let mask = attention_mask(3, Some(1), &Device::Cpu, DType::F32).unwrap();
        let rows: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        for (i, row) in rows.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                assert_eq!(v == 0.0, i == j, "entry ({i}, {j})");
            }
        }
    }

    #[test]
    #[serial]
    fn test_mask_caching() {
        clear_mask_cache().unwrap();
        assert_eq!(mask_cache_size().unwrap(), 0);

        attention_mask(4, None, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size().unwrap(), 1);

        attention_mask(4, None, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size().unwrap(), 1);

        // Same length, different window: separate entry
        attention_mask(4, Some(2), &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask_cache_size().unwrap(), 2);
    }
}
