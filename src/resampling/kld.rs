//! The KLD-bounded randomised draw (spec.md §4.6), grounded in
//! `original_source/src/resampling/kld_random.cpp`'s `doApply`/
//! `doApplyRecovery`.

use rand::Rng;

use crate::density::Density;
use crate::mesh::MeshMapTree;
use crate::resampling::{kld_bound, top_up_uniform, Resampler};
use crate::samples::{Sample, SampleSet};
use crate::state::{seeded_rng, UniformSampler};

/// Independent per-draw `u ~ U[0,1)` against the cumulative weight array
/// (the "randomised rather than stratified" draw of spec.md §4.6).
pub struct KldRandom {
    epsilon: f64,
    z: f64,
    uniform_percent: f64,
    min_weight_ratio: f64,
    recovery_probability: f64,
    rng: rand::rngs::StdRng,
}

impl KldRandom {
    pub fn new(
        epsilon: f64,
        z: f64,
        uniform_percent: f64,
        min_weight_ratio: f64,
        recovery_probability: f64,
        seed: i64,
    ) -> Self {
        KldRandom {
            epsilon,
            z,
            uniform_percent,
            min_weight_ratio,
            recovery_probability,
            rng: seeded_rng(seed),
        }
    }

    fn cumulative(samples: &[Sample]) -> (Vec<f64>, f64) {
        let mut cumsum = Vec::with_capacity(samples.len() + 1);
        cumsum.push(0.0);
        let mut acc = 0.0;
        for s in samples {
            acc += s.weight;
            cumsum.push(acc);
        }
        (cumsum, acc)
    }

    fn draw_from_cumsum<'a>(cumsum: &[f64], samples: &'a [Sample], u: f64) -> &'a Sample {
        for j in 0..samples.len() {
            if cumsum[j] <= u && u < cumsum[j + 1] {
                return &samples[j];
            }
        }
        samples.last().expect("sample set is non-empty")
    }
}

impl Resampler for KldRandom {
    fn apply(
        &mut self,
        set: &mut SampleSet,
        density: &dyn Density,
        tree: &MeshMapTree,
        sampler: &mut UniformSampler,
        recovery: bool,
    ) {
        let previous: Vec<Sample> = set.samples().to_vec();
        if previous.is_empty() {
            return;
        }
        let n_min = set.n_min().max(2);
        let n_max = set.n_max();
        let (cumsum, total_weight) = Self::cumulative(&previous);

        let mut drawn = Vec::with_capacity(n_max);
        let mut w_min = f64::MAX;

        for i in 0..n_max {
            if recovery {
                let recovery_draw: f64 = self.rng.gen();
                if recovery_draw < self.recovery_probability {
                    if let Some(state) = sampler.sample_all_links(tree, 1).pop() {
                        w_min = w_min.min(recovery_draw);
                        drawn.push(Sample {
                            state,
                            weight: recovery_draw,
                        });
                    }
                    if i > n_min && kld_bound(density.histogram_size(), self.epsilon, self.z, n_max) < i {
                        break;
                    }
                    continue;
                }
            }

            let u: f64 = self.rng.gen::<f64>() * total_weight;
            let sample = Self::draw_from_cumsum(&cumsum, &previous, u);
            w_min = w_min.min(sample.weight);
            drawn.push(*sample);

            if i > n_min && kld_bound(density.histogram_size(), self.epsilon, self.z, n_max) < i {
                break;
            }
        }

        if w_min == f64::MAX {
            w_min = 0.0;
        }
        top_up_uniform(
            &mut drawn,
            n_max,
            self.uniform_percent,
            self.min_weight_ratio,
            w_min,
            tree,
            sampler,
        );

        set.replace(drawn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::mesh::MeshDensity;
    use crate::mesh::{Mesh, Vertex};
    use crate::state::SurfaceState;
    use nalgebra::{Isometry3, Vector3};

    fn tiny_tree() -> MeshMapTree {
        let mesh = Mesh::new(
            vec![
                Vertex {
                    position: Vector3::new(0.0, 0.0, 0.0),
                    normal: Vector3::new(0.0, 1.0, 0.0),
                },
                Vertex {
                    position: Vector3::new(1.0, 0.0, 0.0),
                    normal: Vector3::new(0.0, 1.0, 0.0),
                },
            ],
            vec![(0, 1)],
        )
        .unwrap();
        MeshMapTree::load(
            vec!["link".into()],
            vec![None],
            vec![Isometry3::identity()],
            vec![mesh],
        )
        .unwrap()
    }

    #[test]
    fn resample_respects_nmax() {
        let tree = tiny_tree();
        let mut set = SampleSet::new(2, 20);
        let samples: Vec<Sample> = (0..10)
            .map(|i| Sample {
                state: SurfaceState::new(0, 0, i as f64 / 10.0, 0, 1),
                weight: 1.0 / 10.0,
            })
            .collect();
        set.replace(samples);
        let density = MeshDensity::new(10, 1.0, false);
        let mut sampler = UniformSampler::new(5);
        let mut resampler = KldRandom::new(0.01, 0.99, 1.0, 1.0, 0.0, 3);
        resampler.apply(&mut set, &density, &tree, &mut sampler, false);
        assert!(set.len() <= 20);
        assert!(set.len() >= 2);
    }

    #[test]
    fn recovery_draws_can_use_low_weight() {
        let tree = tiny_tree();
        let mut set = SampleSet::new(2, 20);
        let samples: Vec<Sample> = (0..10)
            .map(|i| Sample {
                state: SurfaceState::new(0, 0, i as f64 / 10.0, 0, 1),
                weight: 1.0 / 10.0,
            })
            .collect();
        set.replace(samples);
        let density = MeshDensity::new(10, 1.0, false);
        let mut sampler = UniformSampler::new(5);
        let mut resampler = KldRandom::new(0.01, 0.99, 1.0, 1.0, 1.0, 3);
        resampler.apply(&mut set, &density, &tree, &mut sampler, true);
        // with recovery_probability = 1.0 every draw is a recovery draw,
        // whose weight is the recovery random number itself.
        assert!(set.samples().iter().all(|s| s.weight >= 0.0 && s.weight < 1.0));
    }
}
