//! IVF_FLAT: an inverted-file index with exhaustive scan inside each partition.
//!
//! Vectors are grouped into `nlist` partitions around k-means centroids when
//! the index is trained. A query ranks the centroids, probes the `nprobe`
//! closest partitions and compares against every vector in them. Partitions
//! only hold row offsets; the vectors stay with the segment that owns them.


use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

const KMEANS_MAX_ITERATIONS: usize = 10;
/// Training uses at most this many samples per partition.
const TRAINING_SAMPLES_PER_LIST: usize = 64;

/// Squared Euclidean distance.
#[inline]
pub fn l2_squared(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// A candidate with its distance to the query, ordered by distance then key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scored<K> {
    pub distance: f32,
    pub key: K,
}

impl<K: Ord> Eq for Scored<K> {}

impl<K: Ord> PartialOrd for Scored<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord> Ord for Scored<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Bounded collector keeping the `limit` smallest candidates.
#[derive(Debug)]
pub struct TopK<K> {
    limit: usize,
    heap: BinaryHeap<Scored<K>>,
}

impl<K: Ord> TopK<K> {
    #[inline]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            heap: BinaryHeap::with_capacity(limit.saturating_add(1)),
        }
    }

    #[inline]
    pub fn push(&mut self, distance: f32, key: K) {
        if self.limit == 0 {
            return;
        }

        let candidate = Scored { distance, key };
        if self.heap.len() < self.limit {
            self.heap.push(candidate);
        } else if self.heap.peek().is_some_and(|worst| candidate < *worst) {
            self.heap.pop();
            self.heap.push(candidate);
        }
    }

    /// Candidates in ascending order.
    #[inline]
    pub fn into_sorted_vec(self) -> Vec<Scored<K>> {
        self.heap.into_sorted_vec()
    }
}

/// Exhaustive scan, used for growing segments and unindexed sealed segments.
pub fn brute_force<'a, I>(query: &[f32], limit: usize, vectors: I) -> Vec<Scored<u32>>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut top = TopK::new(limit);
    for (offset, vector) in (0u32..).zip(vectors) {
        top.push(l2_squared(query, vector), offset);
    }
    top.into_sorted_vec()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvfFlatIndex {
    centroids: Vec<Vec<f32>>,
    /// Row offsets assigned to each centroid
    lists: Vec<Vec<u32>>,
}

impl IvfFlatIndex {
    /// Train centroids over `vectors` and assign every vector to a partition.
    ///
    /// Uses `min(nlist, vectors.len())` partitions. Training is deterministic:
    /// centroids start from evenly spaced samples.
    pub fn train(vectors: &[&[f32]], nlist: usize) -> Self {
        let k = nlist.min(vectors.len()).max(1);
        if vectors.is_empty() {
            return Self {
                centroids: Vec::new(),
                lists: Vec::new(),
            };
        }

        let sample = training_sample(vectors, k * TRAINING_SAMPLES_PER_LIST);
        let centroids = kmeans(&sample, k);

        let mut lists = vec![Vec::new(); centroids.len()];
        for (offset, vector) in (0u32..).zip(vectors) {
            lists[nearest_centroid(&centroids, vector)].push(offset);
        }

        Self { centroids, lists }
    }

    #[inline]
    pub fn nlist(&self) -> usize {
        self.centroids.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lists.iter().all(Vec::is_empty)
    }

    /// Partition indexes of the `nprobe` closest centroids, closest first.
    pub fn probe(&self, query: &[f32], nprobe: usize) -> Vec<usize> {
        let mut top = TopK::new(nprobe.min(self.centroids.len()));
        for (list, centroid) in self.centroids.iter().enumerate() {
            top.push(l2_squared(query, centroid), list);
        }
        top.into_sorted_vec().into_iter().map(|s| s.key).collect()
    }

    /// Scan the probed partitions and return the closest `limit` row offsets.
    pub fn search<'a, F>(
        &self,
        query: &[f32],
        nprobe: usize,
        limit: usize,
        vector_at: F,
    ) -> Vec<Scored<u32>>
    where
        F: Fn(u32) -> &'a [f32],
    {
        let mut top = TopK::new(limit);
        for list in self.probe(query, nprobe) {
            for &offset in &self.lists[list] {
                top.push(l2_squared(query, vector_at(offset)), offset);
            }
        }
        top.into_sorted_vec()
    }
}

fn training_sample<'a>(vectors: &[&'a [f32]], max_samples: usize) -> Vec<&'a [f32]> {
    if vectors.len() <= max_samples {
        return vectors.to_vec();
    }

    let step = vectors.len() / max_samples;
    vectors
        .iter()
        .step_by(step.max(1))
        .take(max_samples)
        .copied()
        .collect()
}

fn nearest_centroid(centroids: &[Vec<f32>], vector: &[f32]) -> usize {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, l2_squared(vector, c)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(i, _)| i)
}

/// Lloyd's k-means. Empty clusters keep their previous centroid.
fn kmeans(samples: &[&[f32]], k: usize) -> Vec<Vec<f32>> {
    let dim = samples[0].len();
    let step = samples.len() / k;
    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|i| samples[(i * step).min(samples.len() - 1)].to_vec())
        .collect();

    let mut assignments = vec![usize::MAX; samples.len()];

    for _ in 0..KMEANS_MAX_ITERATIONS {
        let mut changed = false;
        for (assignment, sample) in assignments.iter_mut().zip(samples) {
            let best = nearest_centroid(&centroids, sample);
            if *assignment != best {
                *assignment = best;
                changed = true;
            }
        }

        if !changed {
            break;
        }

        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (&cluster, sample) in assignments.iter().zip(samples) {
            counts[cluster] += 1;
            for (sum, value) in sums[cluster].iter_mut().zip(sample.iter()) {
                *sum += value;
            }
        }

        for ((centroid, sum), count) in centroids.iter_mut().zip(sums).zip(counts) {
            if count > 0 {
                for (c, s) in centroid.iter_mut().zip(sum) {
                    *c = s / count as f32;
                }
            }
        }
    }

    centroids
}
