//! The stratified "wheel of fortune" draw (spec.md §4.6), grounded in
//! `original_source/src/resampling/wheel.cpp` (a thin wrapper over
//! `muse_smc::impl::WheelOfFortune`, whose stratified-draw mechanics spec.md
//! §4.6 spells out directly) and the teacher's
//! `resampling_stratified`/`resampling_systematic` free functions.

use rand::Rng;

use crate::density::Density;
use crate::mesh::MeshMapTree;
use crate::resampling::{kld_bound, top_up_uniform, Resampler};
use crate::samples::{Sample, SampleSet};
use crate::state::{seeded_rng, UniformSampler};

/// A single draw `u0 ~ U[0,1)`, then `u_i = (u0 + i/N) mod 1` against the
/// cumulative weight array -- one shared offset across all draws rather
/// than an independent draw per particle.
pub struct WheelOfFortune {
    epsilon: f64,
    z: f64,
    uniform_percent: f64,
    min_weight_ratio: f64,
    recovery_probability: f64,
    rng: rand::rngs::StdRng,
}

impl WheelOfFortune {
    pub fn new(
        epsilon: f64,
        z: f64,
        uniform_percent: f64,
        min_weight_ratio: f64,
        recovery_probability: f64,
        seed: i64,
    ) -> Self {
        WheelOfFortune {
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

impl Resampler for WheelOfFortune {
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
        let n_out = kld_bound(density.histogram_size(), self.epsilon, self.z, n_max).max(n_min);
        let (cumsum, total_weight) = Self::cumulative(&previous);

        let u0: f64 = self.rng.gen();
        let mut drawn = Vec::with_capacity(n_out);
        let mut w_min = f64::MAX;

        for i in 0..n_out {
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
                    continue;
                }
            }

            let u = ((u0 + (i as f64) / (n_out as f64)) % 1.0) * total_weight;
            let sample = Self::draw_from_cumsum(&cumsum, &previous, u);
            w_min = w_min.min(sample.weight);
            drawn.push(*sample);
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
