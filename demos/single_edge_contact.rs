//! Single-edge, perfect-observation convergence (spec.md §8 scenario 1).
//! A two-vertex mesh at `(0,0,0)`-`(1,0,0)`, a synthetic torque consistent
//! with a contact at `s = 0.3`, and an identity Jacobian/information
//! matrix. Prints the top-1 contact estimate after each of 5 steps.

use nalgebra::{DMatrix, DVector, Isometry3, Vector3};
use rustc_hash::FxHashMap;

use armcl::config::FilterConfig;
use armcl::filter::{Filter, Observation};
use armcl::mesh::{Mesh, MeshMapTree, TransformProvider, Vertex};

struct StaticJoints;

impl TransformProvider for StaticJoints {
    fn local_transform(&self, _frame_id: &str) -> Option<Isometry3<f64>> {
        None
    }
}

fn build_tree() -> MeshMapTree {
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
    .expect("two-vertex, one-edge mesh is always valid");
    MeshMapTree::load(
        vec!["link".into()],
        vec![None],
        vec![Isometry3::identity()],
        vec![mesh],
    )
    .expect("single-node tree is always valid")
}

fn identity_jacobian() -> DMatrix<f64> {
    let mut j = DMatrix::zeros(3, 6);
    j[(0, 0)] = 1.0;
    j[(1, 1)] = 1.0;
    j[(2, 2)] = 1.0;
    j
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut config = FilterConfig::default();
    config.sample_size = 500;
    config.n_min = 50;
    config.n_max = 500;
    config.random_seed = 42;
    config.info_matrix = vec![
        vec![1.0, 0.0, 0.0],
        vec![0.0, 1.0, 0.0],
        vec![0.0, 0.0, 1.0],
    ];

    let mut filter = Filter::new(build_tree(), config).expect("valid configuration");

    let mut jacobians = FxHashMap::default();
    jacobians.insert(0, identity_jacobian());

    // Ground-truth contact at s = 0.3 => p = (0.3, 0, 0), n = (0, 1, 0),
    // moment = p x n = (0, 0, 0.3).
    let tau_ext = DVector::from_vec(vec![0.0, 0.0, 0.3]);

    for step in 1..=5 {
        let observation = Observation {
            timestamp: step as f64,
            tau_ext: tau_ext.clone(),
            jacobians: jacobians.clone(),
            wrench_transforms: FxHashMap::default(),
        };
        let contacts = filter
            .step(&StaticJoints, observation)
            .expect("step never fails in this scenario")
            .unwrap_or_default();

        match contacts.first() {
            Some(top) => println!(
                "step {step}: top contact at {:?}, score {:.4}",
                top.position, top.score
            ),
            None => println!("step {step}: no contact candidates yet"),
        }
    }
}
