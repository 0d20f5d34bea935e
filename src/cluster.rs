//! Agglomerative clustering of SAE decoder vectors
//!
//! Complete linkage is computed with the nearest-neighbor chain algorithm on a
//! dense distance matrix. Merges are reported like a scipy linkage matrix:
//! sorted by distance, new clusters numbered `n, n + 1, ...`, and each row
//! `(a, b, distance, size)` with `a < b`.

use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use ndarray::{Array2, ArrayView2};
use serde::Serialize;
use tracing::info;

/// Distance between points
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Metric {
    Euclidean,
    /// `1 - cos(a, b)`
    Cosine,
}

/// One row of a linkage matrix
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkageMerge {
    pub a: usize,
    pub b: usize,
    pub distance: f32,
    /// Number of original points in the new cluster
    pub size: usize,
}

/// Pairwise distances `[n, n]`
pub fn distance_matrix(points: ArrayView2<f32>, metric: Metric) -> Array2<f32> {
    let n = points.nrows();
    let sq_norms: Vec<f32> = points.rows().into_iter().map(|r| r.dot(&r)).collect();
    let gram = points.dot(&points.t());
    let mut d = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            d[[i, j]] = match metric {
                Metric::Euclidean => (sq_norms[i] + sq_norms[j] - 2.0 * gram[[i, j]])
                    .max(0.0)
                    .sqrt(),
                Metric::Cosine => {
                    let denom = (sq_norms[i] * sq_norms[j]).sqrt();
                    if denom > 0.0 {
                        (1.0 - gram[[i, j]] / denom).max(0.0)
                    } else {
                        1.0
                    }
                }
            };
        }
    }
    d
}

/// Complete-linkage clustering of the rows of `points`.
pub fn complete_linkage(points: ArrayView2<f32>, metric: Metric) -> Result<Vec<LinkageMerge>> {
    let n = points.nrows();
    anyhow::ensure!(n > 0, "Cannot cluster zero points");
    let mut d = distance_matrix(points, metric);
    anyhow::ensure!(
        d.iter().all(|v| v.is_finite()),
        "Distance matrix has non-finite entries"
    );

    let mut active = vec![true; n];
    let mut raw: Vec<(usize, usize, f32)> = Vec::with_capacity(n.saturating_sub(1));
    let mut chain: Vec<usize> = Vec::new();

    for _ in 1..n {
        if chain.is_empty() {
            let start = active
                .iter()
                .position(|&a| a)
                .context("No active cluster left")?;
            chain.push(start);
        }
        let (x, y, dist) = loop {
            let x = chain[chain.len() - 1];
            let prev = (chain.len() >= 2).then(|| chain[chain.len() - 2]);
            // Prefer the previous chain element on ties so the chain terminates
            let mut best = prev;
            let mut best_d = prev.map_or(f32::INFINITY, |p| d[[x, p]]);
            for k in 0..n {
                if active[k] && k != x && d[[x, k]] < best_d {
                    best = Some(k);
                    best_d = d[[x, k]];
                }
            }
            let y = best.context("Nearest-neighbor chain has no candidate")?;
            if Some(y) == prev {
                chain.truncate(chain.len() - 2);
                break (x, y, best_d);
            }
            chain.push(y);
        };

        // Merge x into y: complete linkage keeps the farther distance
        for k in 0..n {
            if active[k] && k != x && k != y {
                let merged = d[[x, k]].max(d[[y, k]]);
                d[[y, k]] = merged;
                d[[k, y]] = merged;
            }
        }
        active[x] = false;
        raw.push((x, y, dist));
    }

    raw.sort_by(|p, q| p.2.total_cmp(&q.2));
    Ok(relabel(&raw, n))
}

/// Turn merges of representative points into scipy-style cluster ids.
fn relabel(raw: &[(usize, usize, f32)], n: usize) -> Vec<LinkageMerge> {
    let mut parent: Vec<usize> = (0..2 * n).collect();
    let mut size = vec![1usize; 2 * n];
    let find = |parent: &mut Vec<usize>, mut i: usize| {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    };

    raw.iter()
        .enumerate()
        .map(|(step, &(x, y, distance))| {
            let a = find(&mut parent, x);
            let b = find(&mut parent, y);
            let new_id = n + step;
            parent[a] = new_id;
            parent[b] = new_id;
            size[new_id] = size[a] + size[b];
            LinkageMerge {
                a: a.min(b),
                b: a.max(b),
                distance,
                size: size[new_id],
            }
        })
        .collect()
}

/// Flat cluster labels after applying merges until `n_clusters` remain.
///
/// Labels are numbered by the smallest point index in each cluster.
pub fn cut_tree(merges: &[LinkageMerge], n: usize, n_clusters: usize) -> Result<Vec<usize>> {
    anyhow::ensure!(
        (1..=n).contains(&n_clusters),
        "n_clusters must be in 1..={n}, got {n_clusters}"
    );
    anyhow::ensure!(
        merges.len() + 1 >= n,
        "Linkage has {} merges, expected {}",
        merges.len(),
        n.saturating_sub(1)
    );

    // cluster id -> member points
    let mut members: Vec<Vec<usize>> = (0..n).map(|i| vec![i]).collect();
    members.resize(2 * n, Vec::new());
    let mut alive = vec![true; n];
    alive.resize(2 * n, false);

    for (step, m) in merges.iter().take(n - n_clusters).enumerate() {
        let new_id = n + step;
        let mut merged = std::mem::take(&mut members[m.a]);
        merged.append(&mut members[m.b]);
        members[new_id] = merged;
        alive[m.a] = false;
        alive[m.b] = false;
        alive[new_id] = true;
    }

    let mut clusters: Vec<&Vec<usize>> = members
        .iter()
        .zip(&alive)
        .filter(|(_, &a)| a)
        .map(|(m, _)| m)
        .collect();
    clusters.sort_by_key(|m| m.iter().min().copied());

    let mut labels = vec![0; n];
    for (label, cluster) in clusters.iter().enumerate() {
        for &p in cluster.iter() {
            labels[p] = label;
        }
    }
    Ok(labels)
}

/// Leaves of the dendrogram truncated to `p` levels below the root.
///
/// Cluster ids `>= n` are subtrees that were cut off.
pub fn truncate_levels(merges: &[LinkageMerge], n: usize, p: usize) -> Vec<usize> {
    if n == 0 {
        return Vec::new();
    }
    if merges.is_empty() {
        return (0..n).collect();
    }
    let root = n + merges.len() - 1;
    let mut leaves = Vec::new();
    let mut stack = vec![(root, 0usize)];
    while let Some((node, level)) = stack.pop() {
        if node < n || level > p {
            leaves.push(node);
            continue;
        }
        let m = &merges[node - n];
        stack.push((m.b, level + 1));
        stack.push((m.a, level + 1));
    }
    leaves
}

/// Decoder matrix `W_dec` `[d_sae, d_in]` of a Gemma Scope `params.npz`, optionally
/// cut to its first `abridge` rows.
pub fn load_decoder(params_path: &Path, abridge: Option<usize>) -> Result<Array2<f32>> {
    let tensors = Tensor::read_npz_by_name(params_path, &["W_dec"])
        .with_context(|| format!("Failed to read W_dec from {}", params_path.display()))?;
    let w_dec = tensors
        .into_iter()
        .next()
        .context("params.npz has no W_dec")?
        .to_dtype(DType::F32)?;
    let (rows, cols) = w_dec.dims2()?;
    let keep = abridge.map_or(rows, |a| a.min(rows));
    let data: Vec<f32> = w_dec.narrow(0, 0, keep)?.flatten_all()?.to_vec1()?;
    info!("Decoder vectors: [{}, {}]", keep, cols);
    Ok(Array2::from_shape_vec((keep, cols), data)?)
}

/// Indices of each cluster with more than one member, in label order.
pub fn multi_member_clusters(labels: &[usize]) -> Vec<(usize, Vec<usize>)> {
    let n_clusters = labels.iter().max().map_or(0, |m| m + 1);
    let mut clusters = vec![Vec::new(); n_clusters];
    for (i, &l) in labels.iter().enumerate() {
        clusters[l].push(i);
    }
    clusters
        .into_iter()
        .enumerate()
        .filter(|(_, members)| members.len() > 1)
        .collect()
}

/// Mean cluster size, useful for a quick sanity check in logs
pub fn mean_cluster_size(labels: &[usize]) -> f32 {
    let n_clusters = labels.iter().max().map_or(0, |m| m + 1);
    if n_clusters == 0 {
        return 0.0;
    }
    labels.len() as f32 / n_clusters as f32
}

/// Cluster decoder vectors and return `(linkage, labels)`.
pub fn cluster_decoder(
    points: &Array2<f32>,
    metric: Metric,
    n_clusters: usize,
) -> Result<(Vec<LinkageMerge>, Vec<usize>)> {
    let n = points.nrows();
    info!("Clustering {} vectors ({:?} distance)", n, metric);
    let merges = complete_linkage(points.view(), metric)?;
    let labels = cut_tree(&merges, n, n_clusters.min(n))?;
    info!(
        "Number of clusters: {} (mean size {:.2})",
        n_clusters.min(n),
        mean_cluster_size(&labels)
    );
    Ok((merges, labels))
}
