use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fmm_core::domain::Domain;
use fmm_core::morton::MortonKey;
use fmm_kernels_reference::random_point_cloud;

fn benchmark_morton_from_point(c: &mut Criterion) {
    let domain = Domain::from_centre_width([0.0, 0.0, 0.0], 2.2);
    let particles = random_point_cloud(1_000_000, [0.0, 0.0, 0.0], 2.0, 0);

    c.bench_function("morton key from point", |b| {
        b.iter(|| {
            for particle in &particles {
                black_box(MortonKey::from_point(&particle.position, &domain));
            }
        })
    });
}

fn benchmark_morton_neighbors(c: &mut Criterion) {
    let domain = Domain::from_centre_width([0.0, 0.0, 0.0], 2.2);
    let key = MortonKey::from_point(&[0.1, 0.2, 0.3], &domain);
    let key = {
        let mut k = key;
        while k.level() < 10 {
            k = k.first_child();
        }
        k
    };

    c.bench_function("morton neighbors at level 10", |b| {
        b.iter(|| black_box(key.neighbors()))
    });
}

fn benchmark_morton_interaction_list(c: &mut Criterion) {
    let domain = Domain::from_centre_width([0.0, 0.0, 0.0], 2.2);
    let key = MortonKey::from_point(&[0.1, 0.2, 0.3], &domain);
    let key = {
        let mut k = key;
        while k.level() < 6 {
            k = k.first_child();
        }
        k
    };

    c.bench_function("morton interaction list at level 6", |b| {
        b.iter(|| black_box(key.interaction_list()))
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().sample_size(30).measurement_time(std::time::Duration::from_secs(10));
    targets = benchmark_morton_from_point,
              benchmark_morton_neighbors,
              benchmark_morton_interaction_list,
}
criterion_main!(benches);
