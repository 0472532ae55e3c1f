//! Benchmark for the shortest-path engine
//!
//! Measures route computation over topologies of various sizes and shapes,
//! and the cost of applying one link-state advertisement to a full graph.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mixnode::packet::{LinkEntry, LinkStateAdvertisement};
use mixnode::sim::TopologySpec;
use mixnode::topology::TopologyGraph;
use mixnode::{shortest_paths, Address};
use std::collections::BTreeMap;

/// Edge lists as every node would advertise them
fn advertised_edges(spec: &TopologySpec) -> BTreeMap<Address, Vec<LinkEntry>> {
    spec.ports()
        .into_iter()
        .map(|(address, links)| {
            let entries = links
                .iter()
                .map(|l| LinkEntry {
                    neighbor: l.neighbor,
                    cost: l.cost,
                })
                .collect();
            (address, entries)
        })
        .collect()
}

/// Benchmark a full recomputation for different network sizes
fn bench_shortest_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("shortest_paths");

    for size in [50, 100, 200, 500].iter() {
        let n = *size;
        let edges = advertised_edges(&TopologySpec::random(n, 4.0 / n as f64, 7));

        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("random_network", n), &n, |b, _| {
            b.iter(|| black_box(shortest_paths(Address(1), &edges)));
        });
    }

    group.finish();
}

/// Benchmark route computation for different topologies of 100 nodes
fn bench_topologies(c: &mut Criterion) {
    let mut group = c.benchmark_group("topologies");

    let shapes = [
        ("line", TopologySpec::line(100)),
        ("ring", TopologySpec::ring(100)),
        ("star", TopologySpec::star(100)),
        ("grid", TopologySpec::grid(10, 10)),
    ];
    for (name, spec) in shapes {
        let edges = advertised_edges(&spec);
        group.bench_function(name, |b| {
            b.iter(|| black_box(shortest_paths(Address(1), &edges)));
        });
    }

    group.finish();
}

/// Benchmark applying one advertisement and recomputing
fn bench_advertisement_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("advertisement_update");
    let n = 200;
    let edges = advertised_edges(&TopologySpec::random(n, 0.02, 11));

    let mut graph = TopologyGraph::new(Address(1));
    for (&origin, links) in &edges {
        if origin == Address(1) {
            graph.set_local_edges(links.clone());
        } else {
            graph.apply_advertisement(&LinkStateAdvertisement {
                origin,
                links: links.clone(),
            });
        }
    }
    graph.recompute();

    let update = LinkStateAdvertisement {
        origin: Address(n as u16),
        links: edges.get(&Address(n as u16)).cloned().unwrap_or_default(),
    };
    group.bench_function("apply_and_recompute", |b| {
        b.iter(|| {
            graph.apply_advertisement(black_box(&update));
            graph.recompute();
            black_box(graph.reachable_count())
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_shortest_paths,
    bench_topologies,
    bench_advertisement_update
);
criterion_main!(benches);
