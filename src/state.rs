//! The surface state, its uniform sampler, and the random-walk
//! prediction kernel.

use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::mesh::MeshMapTree;

/// A particle's state: a point on one edge of one link's mesh, plus the
/// scalars the observation model writes back.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SurfaceState {
    pub map_id: usize,
    pub edge: usize,
    /// Parametric position along the edge, from `active_vertex` (0) to
    /// `goal_vertex` (1).
    pub s: f64,
    pub active_vertex: usize,
    pub goal_vertex: usize,
    pub force: f64,
    pub last_update: f64,
}

impl SurfaceState {
    pub fn new(map_id: usize, edge: usize, s: f64, active_vertex: usize, goal_vertex: usize) -> Self {
        SurfaceState {
            map_id,
            edge,
            s,
            active_vertex,
            goal_vertex,
            force: 0.0,
            last_update: 0.0,
        }
    }

    /// World-frame position: `(1-s)*P(active) + s*P(goal)` under the
    /// link's accumulated transform.
    pub fn position(&self, tree: &MeshMapTree) -> Vector3<f64> {
        let node = tree.node(self.map_id);
        let pa = node.mesh.vertices[self.active_vertex].position;
        let pg = node.mesh.vertices[self.goal_vertex].position;
        let local = pa * (1.0 - self.s) + pg * self.s;
        node.world_transform().transform_point(&local.into()).coords
    }

    /// World-frame normal: a linear blend of the two vertex normals,
    /// renormalised, then rotated into world frame.
    pub fn normal(&self, tree: &MeshMapTree) -> Vector3<f64> {
        let node = tree.node(self.map_id);
        let na = node.mesh.vertices[self.active_vertex].normal;
        let ng = node.mesh.vertices[self.goal_vertex].normal;
        let blended = na * (1.0 - self.s) + ng * self.s;
        let local_normal = if blended.norm() > 1e-12 {
            blended.normalize()
        } else {
            na
        };
        node.world_transform().rotation.transform_vector(&local_normal)
    }
}

pub(crate) fn seeded_rng(seed: i64) -> StdRng {
    if seed >= 0 {
        StdRng::seed_from_u64(seed as u64)
    } else {
        StdRng::from_entropy()
    }
}

/// Draws particles uniformly across a mesh (or across every link of a
/// tree, weighted by total edge length).
pub struct UniformSampler {
    rng: StdRng,
}

impl UniformSampler {
    pub fn new(seed: i64) -> Self {
        UniformSampler {
            rng: seeded_rng(seed),
        }
    }

    /// One sample on a single link: an edge chosen with probability
    /// proportional to its length, `s ~ U[0,1]`, `active = edge.v0`.
    ///
    /// Returns `None` if `map_id`'s mesh has no edges -- there is nothing
    /// to sample a surface point on.
    pub fn sample_on_link(&mut self, tree: &MeshMapTree, map_id: usize) -> Option<SurfaceState> {
        let mesh = &tree.node(map_id).mesh;
        if mesh.edges.is_empty() {
            return None;
        }
        let total = mesh.sum_edge_length();
        let edge = if total <= 0.0 {
            0
        } else {
            let mut u = self.rng.gen::<f64>() * total;
            let mut chosen = mesh.edges.len() - 1;
            for (i, e) in mesh.edges.iter().enumerate() {
                if u < e.length {
                    chosen = i;
                    break;
                }
                u -= e.length;
            }
            chosen
        };
        let s = self.rng.gen::<f64>();
        let e = mesh.edges[edge];
        Some(SurfaceState::new(map_id, edge, s, e.v0, e.v1))
    }

    /// Uniform sampling across all links: `N_link = round(N * L_link /
    /// L_total)` particles per link, topped up (or trimmed) from the link
    /// with the largest fractional residual so the total is exactly `n`.
    /// Emits nothing if `n == 0` or the tree has no edges.
    pub fn sample_all_links(&mut self, tree: &MeshMapTree, n: usize) -> Vec<SurfaceState> {
        if n == 0 || tree.is_empty() {
            return Vec::new();
        }
        let totals: Vec<f64> = (0..tree.len()).map(|i| tree.sum_edge_length(i)).collect();
        let grand_total: f64 = totals.iter().sum();
        if grand_total <= 0.0 {
            return Vec::new();
        }

        let mut counts = vec![0usize; tree.len()];
        let mut residuals = vec![0.0f64; tree.len()];
        let mut assigned = 0usize;
        for (i, &t) in totals.iter().enumerate() {
            let exact = n as f64 * t / grand_total;
            let rounded = exact.round() as usize;
            counts[i] = rounded;
            residuals[i] = exact - rounded as f64;
            assigned += rounded;
        }

        if assigned < n {
            let mut order: Vec<usize> = (0..counts.len()).collect();
            order.sort_by(|&a, &b| residuals[b].partial_cmp(&residuals[a]).unwrap());
            let mut shortfall = n - assigned;
            for &i in order.iter().cycle() {
                if shortfall == 0 {
                    break;
                }
                counts[i] += 1;
                shortfall -= 1;
            }
        } else if assigned > n {
            let mut order: Vec<usize> = (0..counts.len()).collect();
            order.sort_by(|&a, &b| residuals[a].partial_cmp(&residuals[b]).unwrap());
            let mut excess = assigned - n;
            for &i in order.iter().cycle() {
                if excess == 0 {
                    break;
                }
                if counts[i] > 0 {
                    counts[i] -= 1;
                    excess -= 1;
                }
            }
        }

        let mut out = Vec::with_capacity(n);
        for (map_id, &c) in counts.iter().enumerate() {
            for _ in 0..c {
                if let Some(state) = self.sample_on_link(tree, map_id) {
                    out.push(state);
                }
            }
        }
        out
    }
}

/// The random-walk prediction kernel: link-local diffusion along mesh
/// edges with strict no-immediate-reverse and leaf reflection.
pub struct RandomWalk {
    sigma: f64,
    rng: StdRng,
}

impl RandomWalk {
    pub fn new(sigma: f64, seed: i64) -> Self {
        RandomWalk {
            sigma,
            rng: seeded_rng(seed),
        }
    }

    /// Diffuses `state` by `dt` seconds in place. `s` stays in `[0,1]` on
    /// return; crossing into another link is never attempted.
    pub fn predict(&mut self, tree: &MeshMapTree, state: &mut SurfaceState, dt: f64) {
        if dt <= 0.0 || self.sigma <= 0.0 {
            return;
        }
        let std_dev = self.sigma * dt.sqrt();
        let normal = Normal::new(0.0, std_dev).expect("positive std dev");
        let mut remaining: f64 = normal.sample(&mut self.rng).abs();

        let mesh = &tree.node(state.map_id).mesh;
        let mut current_edge = state.edge;
        let mut active = state.active_vertex;
        let mut goal = state.goal_vertex;
        let mut s = state.s;

        loop {
            let edge_len = mesh.edges[current_edge].length;
            let remaining_on_edge = (1.0 - s) * edge_len;
            if remaining < remaining_on_edge {
                if edge_len > 0.0 {
                    s += remaining / edge_len;
                }
                break;
            }
            remaining -= remaining_on_edge;

            let neighbours = mesh.neighbours(goal);
            if neighbours.len() <= 1 {
                // Leaf vertex: reflect by swapping direction, staying on
                // the same edge.
                std::mem::swap(&mut active, &mut goal);
                s = 0.0;
                continue;
            }

            let mut candidates: Vec<usize> =
                neighbours.iter().copied().filter(|&v| v != active).collect();
            if candidates.is_empty() {
                candidates = neighbours.to_vec();
            }
            let next_vertex = candidates[self.rng.gen_range(0..candidates.len())];
            let next_edge = mesh
                .edge_between(goal, next_vertex)
                .expect("adjacency implies a matching edge exists");

            active = goal;
            goal = next_vertex;
            current_edge = next_edge;
            s = 0.0;
        }

        state.edge = current_edge;
        state.s = s.clamp(0.0, 1.0);
        state.active_vertex = active;
        state.goal_vertex = goal;
    }
}
