//! ベンチマークツール
//!
//! 合成コメントを `LiveBrain` に直接流し込み、判定スループットと判定の内訳を測る。
//! 時刻は合成ストリームの時計で進めるので、結果は実時間に依存しない。

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use livebrain::{BrainConfig, CommentEvent, Intent, LiveBrain, Reason};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "run_benchmarks", about = "Measure decision throughput")]
struct Args {
    /// 1 ラウンドあたりのコメント数
    #[arg(short = 'n', long, default_value_t = 100_000)]
    events: usize,

    /// ラウンド数
    #[arg(short, long, default_value_t = 3)]
    rounds: usize,

    /// ストリーム上のコメント間隔（ミリ秒）
    #[arg(long, default_value_t = 200)]
    gap_ms: i64,

    #[arg(long, default_value_t = 42)]
    seed: u64,
}

/// tick を挟む間隔（ストリーム上の時間）
const TICK_EVERY_MS: i64 = 250;

struct RoundResult {
    elapsed: std::time::Duration,
    reasons: BTreeMap<Reason, u64>,
    speak: u64,
    skip: u64,
    queued: u64,
}

fn synthetic_stream(rng: &mut StdRng, count: usize, start: DateTime<Utc>, gap_ms: i64) -> Vec<CommentEvent> {
    let intents: Vec<Intent> = Intent::ALL.to_vec();
    let mut clock = start;
    (0..count)
        .map(|i| {
            clock += Duration::milliseconds(rng.gen_range(0..=gap_ms.max(1) * 2));
            let intent = intents.choose(rng).copied().unwrap_or(Intent::Unknown);
            let user = format!("viewer_{}", rng.gen_range(0..500));
            // 一定割合で同一文面を混ぜて重複フィルタを通す
            let text = if rng.gen_bool(0.05) {
                format!("{} again", intent)
            } else {
                format!("{} comment {}", intent, i)
            };
            CommentEvent::new(user, text, intent, clock)
                .with_follower(rng.gen_bool(0.3))
                .with_subscriber(rng.gen_bool(0.05))
        })
        .collect()
}

fn run_round(events: Vec<CommentEvent>, start: DateTime<Utc>) -> RoundResult {
    let mut brain = LiveBrain::new(BrainConfig::default(), start);
    let mut reasons = BTreeMap::new();
    let mut next_tick = start;
    let mut last = start;

    let started = Instant::now();
    for event in events {
        let now = event.arrival_time;
        while next_tick <= now {
            brain.tick(next_tick);
            next_tick += Duration::milliseconds(TICK_EVERY_MS);
        }
        brain.decide(event, now);
        last = now;

        for engine_event in brain.take_events() {
            if let livebrain::EngineEvent::Decided { decision, .. } = engine_event {
                *reasons.entry(decision.reason).or_insert(0) += 1;
            }
        }
    }
    brain.shutdown(last);
    for engine_event in brain.take_events() {
        if let livebrain::EngineEvent::Decided { decision, .. } = engine_event {
            *reasons.entry(decision.reason).or_insert(0) += 1;
        }
    }
    let elapsed = started.elapsed();

    let counters = brain.counters();
    RoundResult {
        elapsed,
        reasons,
        speak: counters.speak,
        skip: counters.skip,
        queued: counters.queued,
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    println!("🏁 livebrain ベンチマーク");
    println!("=========================================");
    println!("events/round: {}, rounds: {}", args.events, args.rounds);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let start = Utc::now();
    let mut throughputs = Vec::with_capacity(args.rounds);

    for round in 1..=args.rounds.max(1) {
        let events = synthetic_stream(&mut rng, args.events, start, args.gap_ms);
        let result = run_round(events, start);

        let secs = result.elapsed.as_secs_f64().max(f64::EPSILON);
        let per_minute = args.events as f64 / secs * 60.0;
        throughputs.push(per_minute);

        println!("\n📊 Round {} ({:.3} s)", round, secs);
        println!("  throughput: {:.0} events/min", per_minute);
        println!(
            "  SPEAK {} / SKIP {} / QUEUE {}",
            result.speak, result.skip, result.queued
        );
        for (reason, count) in &result.reasons {
            println!("    {:<18} {}", reason.to_string(), count);
        }
    }

    let mean = throughputs.iter().sum::<f64>() / throughputs.len().max(1) as f64;
    let best = throughputs.iter().copied().fold(0.0, f64::max);
    println!("\n=========================================");
    println!("mean: {:.0} events/min, best: {:.0} events/min", mean, best);
    println!("🎉 ベンチマーク完了");
    Ok(())
}
