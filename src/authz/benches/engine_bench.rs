//! Permission engine benchmarks
//!
//! Targets: cached check well under 1ms, policy compilation scaling linearly
//! with policy count.

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tms_authz::{
    ActionSet, BatchCheckRequest, BloomFilter, CheckRequest, Collaborators, DataScope, EngineConfig,
    InMemoryDirectory, InMemoryPolicyStore, OrganizationMembership, PermissionEngine, Policy, PolicyCompiler,
    ResourceCheck, ResourceRegistry, StandardOp, SubjectContext, SystemClock, User,
};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

const RESOURCES: [&str; 6] = ["shipment", "role", "invoice", "customer", "trailer", "tractor"];

fn create_test_policies(count: usize) -> Vec<Policy> {
    (0..count)
        .map(|i| {
            let id = format!("policy-{}", i);
            let base = if i % 5 == 4 {
                Policy::deny(id.as_str(), "generated", "bu-1")
            } else {
                Policy::allow(id.as_str(), "generated", "bu-1")
            };
            base.with_priority(i as i32).on(
                RESOURCES[i % RESOURCES.len()],
                ActionSet::standard(&[StandardOp::ALL[i % 15], StandardOp::Read]),
                DataScope::Organization,
            )
        })
        .collect()
}

async fn engine_with(count: usize) -> PermissionEngine {
    let directory = Arc::new(InMemoryDirectory::new(Arc::new(SystemClock)));
    directory.add_organization("org-1", "bu-1");
    directory.put_user(User::new("alice", "bu-1"));
    directory
        .grant_membership(OrganizationMembership::new("alice", "org-1", "bu-1", &[]))
        .unwrap();

    let policies = Arc::new(InMemoryPolicyStore::new());
    for policy in create_test_policies(count) {
        policies.put(policy).await;
    }

    let config = EngineConfig {
        enable_metrics: false,
        ..Default::default()
    };
    PermissionEngine::new(
        config,
        Arc::new(ResourceRegistry::standard().unwrap()),
        Collaborators::new(policies, directory.clone(), directory),
    )
    .await
    .unwrap()
}

fn bench_cached_check(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("cached_check");

    for policy_count in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::new("policies", policy_count), policy_count, |b, &count| {
            let engine = rt.block_on(engine_with(count));
            let cancel = CancellationToken::new();
            let request = CheckRequest::new("alice", "org-1", "shipment", "read");
            rt.block_on(engine.check(&request, &cancel)).unwrap();

            b.to_async(&rt).iter(|| async {
                let result = engine.check(black_box(&request), &cancel).await.unwrap();
                black_box(result);
            });
        });
    }

    group.finish();
}

fn bench_batch_check(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let engine = rt.block_on(engine_with(100));
    let cancel = CancellationToken::new();

    let checks = RESOURCES
        .iter()
        .flat_map(|r| ["read", "update", "delete"].map(|a| ResourceCheck::new(*r, a)))
        .collect();
    let request = BatchCheckRequest::new("alice", "org-1", checks);

    c.bench_function("batch_check_18", |b| {
        b.to_async(&rt).iter(|| async {
            let result = engine.check_batch(black_box(&request), &cancel).await.unwrap();
            black_box(result);
        });
    });
}

fn bench_compile(c: &mut Criterion) {
    let compiler = PolicyCompiler::new(Arc::new(ResourceRegistry::standard().unwrap()));
    let subject = SubjectContext::new("alice", "org-1", "bu-1");
    let mut group = c.benchmark_group("compile");

    for policy_count in [10, 100, 1000].iter() {
        let policies = create_test_policies(*policy_count);
        group.bench_with_input(BenchmarkId::new("policies", policy_count), &policies, |b, policies| {
            b.iter(|| {
                let compiled = compiler.compile(black_box(&subject), black_box(policies), Utc::now());
                black_box(compiled);
            });
        });
    }

    group.finish();
}

fn bench_bloom(c: &mut Criterion) {
    let compiler = PolicyCompiler::new(Arc::new(ResourceRegistry::standard().unwrap()));
    let subject = SubjectContext::new("alice", "org-1", "bu-1");
    let compiled = compiler.compile(&subject, &create_test_policies(100), Utc::now());
    let bloom = BloomFilter::build(&compiled);

    c.bench_function("bloom_build", |b| {
        b.iter(|| black_box(BloomFilter::build(black_box(&compiled))));
    });

    c.bench_function("bloom_test_miss", |b| {
        b.iter(|| black_box(bloom.test(black_box("spaceship:launch"))));
    });
}

criterion_group!(
    benches,
    bench_cached_check,
    bench_batch_check,
    bench_compile,
    bench_bloom
);
criterion_main!(benches);
