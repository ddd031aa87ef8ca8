use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nalgebra::{Isometry3, Vector3};

use armcl::density::mesh::MeshDensity;
use armcl::density::Density;
use armcl::mesh::{Mesh, MeshMapTree, Vertex};
use armcl::resampling::kld::KldRandom;
use armcl::resampling::wheel::WheelOfFortune;
use armcl::resampling::Resampler;
use armcl::samples::{Sample, SampleSet};
use armcl::state::{SurfaceState, UniformSampler};

fn chain_tree(n: usize) -> MeshMapTree {
    let vertices = (0..n)
        .map(|i| Vertex {
            position: Vector3::new(i as f64, 0.0, 0.0),
            normal: Vector3::new(0.0, 1.0, 0.0),
        })
        .collect();
    let edges = (0..n - 1).map(|i| (i, i + 1)).collect();
    let mesh = Mesh::new(vertices, edges).unwrap();
    MeshMapTree::load(
        vec!["link".into()],
        vec![None],
        vec![Isometry3::identity()],
        vec![mesh],
    )
    .unwrap()
}

fn filled_set(tree: &MeshMapTree, n: usize) -> (SampleSet, MeshDensity) {
    let mut set = SampleSet::new(2, n);
    let mut density = MeshDensity::new(10, 1.0, false);
    let mut ins = set.insertion();
    for i in 0..n {
        let s = (i as f64) / (n as f64);
        let sample = Sample {
            state: SurfaceState::new(0, 0, s, 0, 1),
            weight: 1.0 / n as f64,
        };
        ins.insert(sample, tree, &mut density);
    }
    drop(ins);
    density.estimate(tree);
    (set, density)
}

fn bench_kld(c: &mut Criterion) {
    let tree = chain_tree(50);
    let mut sampler = UniformSampler::new(1);
    c.bench_function("kld_random_resample_2000", |b| {
        b.iter(|| {
            let (mut set, density) = filled_set(&tree, 2000);
            let mut resampler = KldRandom::new(0.01, 0.99, 1.0, 1.0, 0.0, 1);
            resampler.apply(
                black_box(&mut set),
                &density,
                &tree,
                &mut sampler,
                false,
            );
        });
    });
}

fn bench_wheel(c: &mut Criterion) {
    let tree = chain_tree(50);
    let mut sampler = UniformSampler::new(1);
    c.bench_function("wheel_of_fortune_resample_2000", |b| {
        b.iter(|| {
            let (mut set, density) = filled_set(&tree, 2000);
            let mut resampler = WheelOfFortune::new(0.01, 0.99, 1.0, 1.0, 0.0, 1);
            resampler.apply(
                black_box(&mut set),
                &density,
                &tree,
                &mut sampler,
                false,
            );
        });
    });
}

criterion_group!(benches, bench_kld, bench_wheel);
criterion_main!(benches);
