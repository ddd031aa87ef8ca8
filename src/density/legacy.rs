//! The legacy grid/weight-threshold density estimator (spec.md §9's
//! alternative mode), grounded in
//! `original_source/include/muse_armcl/density/cluster_distribution.hpp`.
//!
//! Particles are bucketed into a uniform 3-D grid of cell size `radius`;
//! grid cells merge with their 26-neighbourhood the same way
//! [`super::mesh::MeshDensity`] merges mesh-adjacent vertices, but only
//! particles whose weight clears `threshold * max_weight_seen` contribute
//! to a cluster's distribution or score.

use std::collections::HashSet;

use rustc_hash::FxHashMap;

use crate::density::{ContactEstimate, Density, WeightedDistribution3};
use crate::mesh::MeshMapTree;
use crate::samples::Sample;

type CellKey = (i64, i64, i64);

struct Cell {
    distribution: WeightedDistribution3,
    samples: Vec<Sample>,
}

struct Cluster {
    cell_ids: HashSet<CellKey>,
    samples: Vec<Sample>,
    distribution: WeightedDistribution3,
}

/// Grid/weight-threshold clustering (legacy mode).
pub struct WeightThresholdDensity {
    n_contacts: usize,
    cell_size: f64,
    threshold_percentage: f64,
    max_weight_seen: f64,
    cells: FxHashMap<CellKey, Cell>,
    labels: FxHashMap<CellKey, u32>,
    clusters: FxHashMap<u32, Cluster>,
    next_cluster_id: u32,
}

impl WeightThresholdDensity {
    /// `radius` sizes the grid cell (spec.md §6); `threshold_percentage`
    /// is the fraction of the run's peak particle weight a particle must
    /// clear to count towards a cluster (default 0.1 in the original).
    pub fn new(n_contacts: usize, radius: f64, threshold_percentage: f64) -> Self {
        assert!(radius > 0.0, "radius must be positive");
        WeightThresholdDensity {
            n_contacts,
            cell_size: radius,
            threshold_percentage,
            max_weight_seen: 0.0,
            cells: FxHashMap::default(),
            labels: FxHashMap::default(),
            clusters: FxHashMap::default(),
            next_cluster_id: 0,
        }
    }

    fn cell_key(&self, pos: nalgebra::Vector3<f64>) -> CellKey {
        (
            (pos.x / self.cell_size).floor() as i64,
            (pos.y / self.cell_size).floor() as i64,
            (pos.z / self.cell_size).floor() as i64,
        )
    }

    fn cell_neighbours(key: CellKey) -> Vec<CellKey> {
        let mut out = Vec::with_capacity(26);
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    if dx == 0 && dy == 0 && dz == 0 {
                        continue;
                    }
                    out.push((key.0 + dx, key.1 + dy, key.2 + dz));
                }
            }
        }
        out
    }
}

impl Density for WeightThresholdDensity {
    fn clear(&mut self) {
        self.cells.clear();
        self.labels.clear();
        self.clusters.clear();
        self.next_cluster_id = 0;
        self.max_weight_seen = 0.0;
    }

    fn insert(&mut self, sample: &Sample, tree: &MeshMapTree) {
        if sample.weight > self.max_weight_seen {
            self.max_weight_seen = sample.weight;
        }
        let pos = sample.state.position(tree);
        let key = self.cell_key(pos);
        let cell = self.cells.entry(key).or_insert_with(|| Cell {
            distribution: WeightedDistribution3::default(),
            samples: Vec::new(),
        });
        cell.distribution.add(pos, sample.weight);
        cell.samples.push(*sample);
    }

    fn histogram_size(&self) -> usize {
        self.cells.len()
    }

    fn estimate(&mut self, tree: &MeshMapTree) {
        self.labels.clear();
        self.clusters.clear();
        self.next_cluster_id = 0;

        let threshold = self.threshold_percentage * self.max_weight_seen;

        let mut keys: Vec<CellKey> = self.cells.keys().copied().collect();
        keys.sort_unstable();

        for key in keys {
            if self.labels.get(&key).copied().unwrap_or(0) != 0 {
                continue;
            }
            let neighbour_keys = Self::cell_neighbours(key);
            let mut found_labels: Vec<u32> = neighbour_keys
                .iter()
                .filter_map(|nk| self.labels.get(nk).copied())
                .filter(|&l| l != 0)
                .collect();
            found_labels.sort_unstable();
            found_labels.dedup();

            let cell_samples: Vec<Sample> = self.cells[&key]
                .samples
                .iter()
                .filter(|s| s.weight >= threshold)
                .copied()
                .collect();
            let mut cell_distribution = WeightedDistribution3::default();
            for s in &cell_samples {
                cell_distribution.add(s.state.position(tree), s.weight);
            }

            if found_labels.is_empty() {
                self.next_cluster_id += 1;
                let cluster_id = self.next_cluster_id;
                let mut cluster = Cluster {
                    cell_ids: HashSet::new(),
                    samples: Vec::new(),
                    distribution: WeightedDistribution3::default(),
                };
                cluster.cell_ids.insert(key);
                cluster.samples.extend(cell_samples);
                cluster.distribution.merge(&cell_distribution);
                self.labels.insert(key, cluster_id);
                self.clusters.insert(cluster_id, cluster);
            } else if found_labels.len() == 1 {
                let label = found_labels[0];
                let cluster = self
                    .clusters
                    .get_mut(&label)
                    .expect("label points to a live cluster");
                cluster.cell_ids.insert(key);
                cluster.samples.extend(cell_samples);
                cluster.distribution.merge(&cell_distribution);
                self.labels.insert(key, label);
            } else {
                let mut survivor = found_labels[0];
                let mut survivor_size = self.clusters[&survivor].cell_ids.len();
                for &l in &found_labels[1..] {
                    let size = self.clusters[&l].cell_ids.len();
                    if size > survivor_size || (size == survivor_size && l < survivor) {
                        survivor = l;
                        survivor_size = size;
                    }
                }
                for &l in &found_labels {
                    if l == survivor {
                        continue;
                    }
                    let other = self
                        .clusters
                        .remove(&l)
                        .expect("label points to a live cluster");
                    for &c in &other.cell_ids {
                        self.labels.insert(c, survivor);
                    }
                    let survivor_cluster = self
                        .clusters
                        .get_mut(&survivor)
                        .expect("survivor cluster exists");
                    survivor_cluster.cell_ids.extend(other.cell_ids);
                    survivor_cluster.samples.extend(other.samples);
                    survivor_cluster.distribution.merge(&other.distribution);
                }
                let survivor_cluster = self
                    .clusters
                    .get_mut(&survivor)
                    .expect("survivor cluster exists");
                survivor_cluster.cell_ids.insert(key);
                survivor_cluster.samples.extend(cell_samples);
                survivor_cluster.distribution.merge(&cell_distribution);
                self.labels.insert(key, survivor);
            }
        }
    }

    fn contacts(&self, k: usize, tree: &MeshMapTree) -> Vec<ContactEstimate> {
        let threshold = self.threshold_percentage * self.max_weight_seen;
        let mut cluster_ids: Vec<&u32> = self.clusters.keys().collect();
        cluster_ids.sort_unstable();

        let mut scored: Vec<(f64, u32, ContactEstimate)> = Vec::new();
        for &cid in &cluster_ids {
            let cluster = &self.clusters[cid];
            if cluster.samples.is_empty() {
                continue;
            }
            let mean = cluster.distribution.mean();
            let mut best: Option<(f64, &Sample)> = None;
            let mut score = 0.0;
            for sample in &cluster.samples {
                let pos = sample.state.position(tree);
                let d2 = (pos - mean).norm_squared();
                score += sample.weight;
                if best.map(|(bd, _)| d2 < bd).unwrap_or(true) {
                    best = Some((d2, sample));
                }
            }
            if score <= threshold {
                continue;
            }
            if let Some((_, representative)) = best {
                let frame_id = tree.node(representative.state.map_id).frame_id.clone();
                scored.push((
                    score,
                    *cid,
                    ContactEstimate {
                        position: representative.state.position(tree),
                        normal: representative.state.normal(tree),
                        frame_id,
                        score,
                    },
                ));
            }
        }

        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap().then(a.1.cmp(&b.1)));
        let limit = k.min(self.n_contacts).min(scored.len());
        scored.into_iter().take(limit).map(|(_, _, c)| c).collect()
    }
}
