//! The fixed-capacity particle container.

use crate::density::Density;
use crate::mesh::MeshMapTree;
use crate::state::SurfaceState;

/// One particle: a surface state and its (unnormalised, before
/// [`SampleSet::normalise`]) weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub state: SurfaceState,
    pub weight: f64,
}

/// A fixed-capacity particle container with weight bookkeeping and an
/// insertion guard.
#[derive(Debug, Clone)]
pub struct SampleSet {
    samples: Vec<Sample>,
    n_min: usize,
    n_max: usize,
    total_weight: f64,
    degenerate: bool,
}

impl SampleSet {
    /// Panics if `n_min < 2`: this is a construction-time contract, not a
    /// recoverable runtime condition.
    pub fn new(n_min: usize, n_max: usize) -> Self {
        assert!(n_min >= 2, "Nmin must be >= 2");
        assert!(n_max >= n_min, "Nmax must be >= Nmin");
        SampleSet {
            samples: Vec::with_capacity(n_max.min(4096)),
            n_min,
            n_max,
            total_weight: 0.0,
            degenerate: false,
        }
    }

    pub fn n_min(&self) -> usize {
        self.n_min
    }

    pub fn n_max(&self) -> usize {
        self.n_max
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    /// Direct mutable access for in-place per-step mutation (prediction,
    /// reweighting) that changes neither the sample count nor requires a
    /// density notification -- unlike [`Insertion::insert`], which does.
    pub fn samples_mut_unchecked(&mut self) -> &mut [Sample] {
        &mut self.samples
    }

    pub fn total_weight(&self) -> f64 {
        self.total_weight
    }

    pub fn is_degenerate(&self) -> bool {
        self.degenerate
    }

    /// Clears the set and the density collaborator together, at the start
    /// of an observation step.
    pub fn clear(&mut self, density: &mut dyn Density) {
        self.samples.clear();
        self.total_weight = 0.0;
        self.degenerate = false;
        density.clear();
    }

    /// A stateful handle that refuses insertions once `Nmax` is reached.
    pub fn insertion(&mut self) -> Insertion<'_> {
        Insertion { set: self }
    }

    /// Scales weights to sum to 1. Leaves weights unchanged and raises the
    /// degeneracy flag if the total weight is zero.
    pub fn normalise(&mut self) {
        let total: f64 = self.samples.iter().map(|s| s.weight).sum();
        if total <= 0.0 {
            self.degenerate = true;
            return;
        }
        for s in &mut self.samples {
            s.weight /= total;
        }
        self.total_weight = 1.0;
        self.degenerate = false;
    }

    /// `N_eff = 1 / Sum(w_i^2)`, used by C7 to decide whether to resample.
    pub fn effective_sample_size(&self) -> f64 {
        let sum_sq: f64 = self.samples.iter().map(|s| s.weight * s.weight).sum();
        if sum_sq <= 0.0 {
            0.0
        } else {
            1.0 / sum_sq
        }
    }

    /// Wholesale replacement by the resampler (C6).
    pub fn replace(&mut self, new_samples: Vec<Sample>) {
        debug_assert!(new_samples.len() <= self.n_max);
        self.total_weight = new_samples.iter().map(|s| s.weight).sum();
        self.samples = new_samples;
        self.degenerate = false;
    }
}

/// Insertion handle bound to one [`SampleSet`]'s remaining capacity.
pub struct Insertion<'a> {
    set: &'a mut SampleSet,
}

impl<'a> Insertion<'a> {
    pub fn can_insert(&self) -> bool {
        self.set.samples.len() < self.set.n_max
    }

    pub fn len(&self) -> usize {
        self.set.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.samples.is_empty()
    }

    /// Inserts `sample`, notifying the density collaborator (spec.md
    /// §4.4). Returns `false` (a no-op) once capacity is reached (P3).
    pub fn insert(&mut self, sample: Sample, tree: &MeshMapTree, density: &mut dyn Density) -> bool {
        if !self.can_insert() {
            return false;
        }
        density.insert(&sample, tree);
        self.set.total_weight += sample.weight;
        self.set.samples.push(sample);
        true
    }
}
