//! The mesh-vertex adjacency clustering density estimator (spec.md §4.5) --
//! the "true design" per spec.md §9, grounded in
//! `original_source/src/density/nearest_neighbor_density.cpp`.

use std::collections::HashSet;

use rustc_hash::FxHashMap;

use crate::density::{ContactEstimate, Density, WeightedDistribution3};
use crate::mesh::MeshMapTree;
use crate::samples::Sample;

type VertexKey = (usize, usize);

struct VertexBucket {
    distribution: WeightedDistribution3,
    samples: Vec<Sample>,
}

struct Cluster {
    vertex_ids: HashSet<VertexKey>,
    samples: Vec<Sample>,
    distribution: WeightedDistribution3,
}

/// Union-find-by-adjacency clustering over mesh vertices (spec.md §4.5).
///
/// `labels` and `joined` are deliberately separate: `labels` records, for
/// *any* vertex (occupied or merely a neighbour of a seed), which cluster
/// id its 1-ring neighbours should see -- this is what `found_labels`
/// below reads. `joined` records which *occupied* vertices have actually
/// had their own bucket's distribution and samples merged into a cluster.
/// A vertex can be labelled (as someone else's neighbour) long before it
/// is itself visited and joined; conflating the two would make the
/// second visit a no-op and silently drop that vertex's particle mass
/// from its cluster.
pub struct MeshDensity {
    n_contacts: usize,
    ignore_weight: bool,
    buckets: FxHashMap<VertexKey, VertexBucket>,
    labels: FxHashMap<VertexKey, u32>,
    joined: HashSet<VertexKey>,
    clusters: FxHashMap<u32, Cluster>,
    next_cluster_id: u32,
}

impl MeshDensity {
    /// `n_contacts` caps the `contacts()` result length; `radius` (squared
    /// metres, spec.md §6) is accepted for config-surface parity but
    /// unused here -- this variant's neighbourhoods come from mesh edge
    /// adjacency, not a metric radius (that's `legacy::WeightThresholdDensity`'s
    /// concern).
    pub fn new(n_contacts: usize, _radius: f64, ignore_weight: bool) -> Self {
        MeshDensity {
            n_contacts,
            ignore_weight,
            buckets: FxHashMap::default(),
            labels: FxHashMap::default(),
            joined: HashSet::new(),
            clusters: FxHashMap::default(),
            next_cluster_id: 0,
        }
    }
}

impl Density for MeshDensity {
    fn clear(&mut self) {
        self.buckets.clear();
        self.labels.clear();
        self.joined.clear();
        self.clusters.clear();
        self.next_cluster_id = 0;
    }

    fn insert(&mut self, sample: &Sample, tree: &MeshMapTree) {
        let vertex = if sample.state.s < 0.5 {
            sample.state.active_vertex
        } else {
            sample.state.goal_vertex
        };
        let key = (sample.state.map_id, vertex);
        let pos = sample.state.position(tree);
        let weight = if self.ignore_weight { 1.0 } else { sample.weight };

        let bucket = self.buckets.entry(key).or_insert_with(|| VertexBucket {
            distribution: WeightedDistribution3::default(),
            samples: Vec::new(),
        });
        bucket.distribution.add(pos, weight);
        bucket.samples.push(*sample);
    }

    fn histogram_size(&self) -> usize {
        self.buckets.len()
    }

    fn estimate(&mut self, tree: &MeshMapTree) {
        self.labels.clear();
        self.joined.clear();
        self.clusters.clear();
        self.next_cluster_id = 0;

        let mut keys: Vec<VertexKey> = self.buckets.keys().copied().collect();
        keys.sort_unstable();

        for key in keys {
            // Skip only vertices whose own bucket has already been merged
            // into a cluster. A vertex can carry a non-zero `labels` entry
            // purely because an earlier seed labelled it as a neighbour --
            // that must NOT skip its own visit, or its distribution and
            // samples never make it into any cluster.
            if self.joined.contains(&key) {
                continue;
            }
            let (map_id, vertex) = key;
            let neighbour_vertices = tree.neighbours(map_id, vertex).to_vec();

            let mut found_labels: Vec<u32> = neighbour_vertices
                .iter()
                .filter_map(|&nv| self.labels.get(&(map_id, nv)).copied())
                .filter(|&l| l != 0)
                .collect();
            found_labels.sort_unstable();
            found_labels.dedup();

            let bucket_distribution = self.buckets[&key].distribution;
            let bucket_samples = self.buckets[&key].samples.clone();

            if found_labels.is_empty() {
                self.next_cluster_id += 1;
                let cluster_id = self.next_cluster_id;
                let mut cluster = Cluster {
                    vertex_ids: HashSet::new(),
                    samples: Vec::new(),
                    distribution: WeightedDistribution3::default(),
                };
                cluster.vertex_ids.insert(key);
                cluster.samples.extend(bucket_samples);
                cluster.distribution.merge(&bucket_distribution);
                self.labels.insert(key, cluster_id);
                self.joined.insert(key);
                for &nv in &neighbour_vertices {
                    self.labels.insert((map_id, nv), cluster_id);
                    cluster.vertex_ids.insert((map_id, nv));
                }
                self.clusters.insert(cluster_id, cluster);
            } else if found_labels.len() == 1 {
                let label = found_labels[0];
                let cluster = self.clusters.get_mut(&label).expect("label points to a live cluster");
                cluster.vertex_ids.insert(key);
                cluster.samples.extend(bucket_samples);
                cluster.distribution.merge(&bucket_distribution);
                self.labels.insert(key, label);
                self.joined.insert(key);
            } else {
                // Merge: the survivor is the largest vertex set, ties
                // broken by smallest label (spec.md §4.5).
                let mut survivor = found_labels[0];
                let mut survivor_size = self.clusters[&survivor].vertex_ids.len();
                for &l in &found_labels[1..] {
                    let size = self.clusters[&l].vertex_ids.len();
                    if size > survivor_size || (size == survivor_size && l < survivor) {
                        survivor = l;
                        survivor_size = size;
                    }
                }
                for &l in &found_labels {
                    if l == survivor {
                        continue;
                    }
                    let other = self.clusters.remove(&l).expect("label points to a live cluster");
                    for &v in &other.vertex_ids {
                        self.labels.insert(v, survivor);
                    }
                    let survivor_cluster = self
                        .clusters
                        .get_mut(&survivor)
                        .expect("survivor cluster exists");
                    survivor_cluster.vertex_ids.extend(other.vertex_ids);
                    survivor_cluster.samples.extend(other.samples);
                    survivor_cluster.distribution.merge(&other.distribution);
                }
                let survivor_cluster = self
                    .clusters
                    .get_mut(&survivor)
                    .expect("survivor cluster exists");
                survivor_cluster.vertex_ids.insert(key);
                survivor_cluster.samples.extend(bucket_samples);
                survivor_cluster.distribution.merge(&bucket_distribution);
                self.labels.insert(key, survivor);
                self.joined.insert(key);
                for &nv in &neighbour_vertices {
                    self.labels.insert((map_id, nv), survivor);
                    survivor_cluster.vertex_ids.insert((map_id, nv));
                }
            }
        }
    }

    fn contacts(&self, k: usize, tree: &MeshMapTree) -> Vec<ContactEstimate> {
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
