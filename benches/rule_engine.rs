//! Firewall rule engine benchmarks: evaluation must stay cheap enough to
//! sit on the per-connection path.

use aegis_mesh::firewall::engine::FirewallRuleEngine;
use aegis_mesh::store::entities::FirewallRuleRecord;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn rule(id: usize, rule_type: &str, target: String) -> FirewallRuleRecord {
    FirewallRuleRecord {
        id: format!("rule-{id}"),
        rule_type: rule_type.to_string(),
        target,
        direction: "both".to_string(),
        protocol: "any".to_string(),
        source: "user".to_string(),
        reason: String::new(),
        is_active: true,
        created_at: "2026-01-01T00:00:00+00:00".to_string(),
        expires_at: None,
        hit_count: 0,
    }
}

fn loaded_engine(rule_count: usize) -> FirewallRuleEngine {
    let mut rules = Vec::with_capacity(rule_count);
    for i in 0..rule_count {
        rules.push(rule(
            i,
            "block_ip",
            format!("10.{}.{}.{}", i / 65536, (i / 256) % 256, i % 256),
        ));
    }
    rules.push(rule(rule_count, "allow_ip", "10.0.0.50".to_string()));
    rules.push(rule(rule_count + 1, "block_port", "3389".to_string()));

    let mut engine = FirewallRuleEngine::new();
    engine.load_rules(rules);
    engine
}

fn bench_evaluate(c: &mut Criterion) {
    let engine = loaded_engine(10_000);

    c.bench_function("evaluate_miss", |b| {
        b.iter(|| {
            engine.evaluate(
                black_box("192.168.50.50"),
                black_box(443),
                "tcp",
                None,
                "outbound",
            )
        })
    });

    c.bench_function("evaluate_blocked_ip", |b| {
        b.iter(|| {
            engine.evaluate(
                black_box("10.0.0.99"),
                black_box(443),
                "tcp",
                None,
                "outbound",
            )
        })
    });

    c.bench_function("evaluate_allowlisted", |b| {
        b.iter(|| {
            engine.evaluate(
                black_box("10.0.0.50"),
                black_box(3389),
                "tcp",
                None,
                "inbound",
            )
        })
    });

    c.bench_function("evaluate_domain", |b| {
        b.iter(|| {
            engine.evaluate(
                black_box("192.168.50.50"),
                black_box(443),
                "tcp",
                Some(black_box("cdn.example.com")),
                "outbound",
            )
        })
    });
}

fn bench_load_rules(c: &mut Criterion) {
    c.bench_function("load_10k_rules", |b| {
        b.iter(|| black_box(loaded_engine(10_000)))
    });
}

criterion_group!(benches, bench_evaluate, bench_load_rules);
criterion_main!(benches);
