use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fmm_core::domain::Domain;
use fmm_core::engine::sequential::SequentialEngine;
use fmm_core::engine::task::TaskParallelEngine;
use fmm_core::octree::grouped::GroupedOctree;
use fmm_core::octree::pointer::PointerOctree;
use fmm_core::particle_source::InMemoryParticleSource;
use fmm_kernels_reference::{random_point_cloud, PointMassKernel};

fn benchmark_sequential_fmm_pass(c: &mut Criterion) {
    let centre = [0.0, 0.0, 0.0];
    let width = 2.0;
    let domain = Domain::from_centre_width(centre, width);
    let particles = random_point_cloud(20_000, centre, width, 0);

    c.bench_function("sequential fmm pass, 20k particles", |b| {
        b.iter(|| {
            let mut tree = PointerOctree::new(6, domain.clone()).unwrap();
            for particle in &particles {
                tree.insert(*particle);
            }
            let mut engine = SequentialEngine::new(PointMassKernel::new());
            engine.run(&mut tree).unwrap();
            black_box(&tree);
        })
    });
}

fn benchmark_task_parallel_fmm_pass(c: &mut Criterion) {
    let centre = [0.0, 0.0, 0.0];
    let width = 2.0;
    let particles = random_point_cloud(20_000, centre, width, 0);

    c.bench_function("task-parallel fmm pass, 20k particles", |b| {
        b.iter(|| {
            let source = InMemoryParticleSource::new(centre, width, particles.clone());
            let tree = GroupedOctree::from_particle_source(&source, 6, 64).unwrap();
            let mut engine = TaskParallelEngine::new(PointMassKernel::new());
            black_box(engine.run(&tree).unwrap());
        })
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(10).measurement_time(std::time::Duration::from_secs(20));
    targets = benchmark_sequential_fmm_pass,
              benchmark_task_parallel_fmm_pass,
}
criterion_main!(benches);
