use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use revvault_core::backup::checkpoint::plan;
use revvault_core::backup::{CheckpointPolicy, CopyOutcome, EntryResult};
use revvault_core::storage::ChangeEntry;
use revvault_core::SeqToken;

fn batch(size: u64, fail_at: Option<u64>) -> Vec<EntryResult> {
    (1..=size)
        .map(|seq| EntryResult {
            entry: ChangeEntry::new(format!("doc{}", seq), seq, format!("1-{:x}", seq)),
            outcome: if Some(seq) == fail_at {
                CopyOutcome::Failed {
                    retryable: true,
                    reason: "unavailable".to_string(),
                }
            } else {
                CopyOutcome::Copied { revisions: 1 }
            },
        })
        .collect()
}

fn bench_checkpoint_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkpoint_plan");
    let since = SeqToken::initial();

    for size in [100u64, 1_000, 10_000] {
        let clean = batch(size, None);
        let broken = batch(size, Some(size / 2));

        group.bench_with_input(BenchmarkId::new("successful_prefix", size), &clean, |b, results| {
            b.iter(|| plan(CheckpointPolicy::SuccessfulPrefix, black_box(&since), black_box(results)))
        });
        group.bench_with_input(
            BenchmarkId::new("successful_prefix_with_failure", size),
            &broken,
            |b, results| {
                b.iter(|| plan(CheckpointPolicy::SuccessfulPrefix, black_box(&since), black_box(results)))
            },
        );
    }

    group.finish();
}

fn bench_seq_ordering(c: &mut Criterion) {
    let tokens: Vec<SeqToken> = (0..1_000u64)
        .map(|n| SeqToken::new(format!("{}-g1AAAAAbeJzLYWBgYMpgTmHgz8tPSTV0MDQy", n)))
        .collect();

    c.bench_function("seq_token_max", |b| {
        b.iter(|| black_box(&tokens).iter().max().cloned())
    });
}

criterion_group!(benches, bench_checkpoint_plan, bench_seq_ordering);
criterion_main!(benches);
