//! 判定エンジンのシナリオテスト
//!
//! 時刻はすべて手動で進める。

use chrono::{DateTime, Duration, Utc};
use livebrain::brain::{EngineEvent, RawCommentEvent};
use livebrain::{Action, BrainConfig, CommentEvent, Decision, Intent, LiveBrain, Phase, Reason};

fn t0() -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
}

fn at(secs: f64) -> DateTime<Utc> {
    t0() + Duration::milliseconds((secs * 1000.0) as i64)
}

fn event(user: &str, text: &str, intent: Intent, secs: f64) -> CommentEvent {
    CommentEvent::new(user, text, intent, at(secs))
}

fn transitions(brain: &mut LiveBrain) -> Vec<(Phase, Phase)> {
    brain
        .take_events()
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::Transitioned(t) => Some((t.from, t.to)),
            _ => None,
        })
        .collect()
}

/// IDLE → WARM_UP → INTEREST まで進める（どちらも SPEAK になる）
///
/// WARM_UP の最短滞在（既定 30 秒）を待ってから次へ進む。
fn warm_up_to_interest(brain: &mut LiveBrain) {
    let greet = brain.decide(event("alice", "chào shop", Intent::Greeting, 0.0), at(0.0));
    assert_eq!(greet.action, Action::Speak);
    assert_eq!(brain.phase(), Phase::WarmUp);

    let product = brain.decide(event("bob", "chất liệu là gì", Intent::ProductQuestion, 30.0), at(30.0));
    assert_eq!(product.action, Action::Speak);
    assert_eq!(brain.phase(), Phase::Interest);
}

#[test]
fn price_question_in_price_phase_moves_to_cta() {
    let mut brain = LiveBrain::new(BrainConfig::default(), t0());
    warm_up_to_interest(&mut brain);

    let price = brain.decide(event("carol", "giá bao nhiêu", Intent::PriceQuestion, 75.0), at(75.0));
    assert_eq!(price.action, Action::Speak);
    assert_eq!(brain.phase(), Phase::Price);
    brain.take_events();

    let follower = event("dave", "còn giảm giá không", Intent::PriceQuestion, 100.0).with_follower(true);
    let decision = brain.decide(follower, at(100.0));

    assert!(decision.priority.value() >= 9);
    assert_eq!(decision.action, Action::Speak);
    assert!(matches!(decision.reason, Reason::PriceQuestion | Reason::AutoPriority));
    assert_eq!(decision.phase, Phase::Cta);
    assert_eq!(transitions(&mut brain), vec![(Phase::Price, Phase::Cta)]);
}

#[test]
fn complaint_interrupts_into_crisis_then_cools_down() {
    let mut brain = LiveBrain::new(BrainConfig::default(), t0());
    warm_up_to_interest(&mut brain);
    brain.take_events();

    let complaint = brain.decide(event("erin", "hàng giao thiếu", Intent::Complaint, 40.0), at(40.0));
    assert_eq!(complaint.action, Action::Speak);
    assert_eq!(complaint.phase, Phase::Crisis);
    assert_eq!(transitions(&mut brain), vec![(Phase::Interest, Phase::Crisis)]);

    brain.tick(at(41.0));
    assert_eq!(brain.phase(), Phase::Cooldown);
    assert_eq!(transitions(&mut brain), vec![(Phase::Crisis, Phase::Cooldown)]);
}

#[test]
fn burst_is_queued_and_promoted_in_priority_order() {
    let config = BrainConfig {
        min_speak_interval: 3.0,
        max_speak_interval: 3.0,
        ..BrainConfig::default()
    };
    let mut brain = LiveBrain::new(config, t0());

    // IDLE では product_question = 8, question = 7（どちらも自動発話の閾値未満）
    let burst = [
        ("u1", "màu đỏ còn không", Intent::ProductQuestion, 0.0),
        ("u2", "mua ở đâu vậy", Intent::Question, 0.2),
        ("u3", "có size L không", Intent::ProductQuestion, 0.4),
        ("u4", "khi nào live tiếp", Intent::Question, 0.6),
        ("u5", "vải có dày không", Intent::ProductQuestion, 0.8),
    ];

    let decisions: Vec<Decision> = burst
        .iter()
        .map(|(user, text, intent, secs)| brain.decide(event(user, text, *intent, *secs), at(*secs)))
        .collect();

    assert_eq!(decisions[0].action, Action::Speak);
    for decision in &decisions[1..] {
        assert_eq!(decision.action, Action::Queue);
        assert_eq!(decision.reason, Reason::Queued);
    }
    assert_eq!(brain.queue_len(), 4);

    // クールダウン中は昇格しない
    assert!(brain.tick(at(2.0)).is_empty());

    let mut promoted = Vec::new();
    let mut last_speak = at(0.0);
    for step in 1..=4 {
        let now = at(3.0 * step as f64);
        let out = brain.tick(now);
        assert_eq!(out.len(), 1, "one promotion per open window");
        assert_eq!(out[0].action, Action::Speak);
        assert_eq!(out[0].reason, Reason::Promoted);
        assert!(now - last_speak >= Duration::seconds(3));
        last_speak = now;
        promoted.push(out[0].event.user_id.clone());
    }

    assert_eq!(promoted, vec!["u3", "u5", "u2", "u4"]);
    assert_eq!(brain.queue_len(), 0);
}

#[test]
fn same_text_twice_from_same_user_is_duplicate() {
    let mut brain = LiveBrain::new(BrainConfig::default(), t0());

    let first = brain.decide(event("frank", "Giá bao nhiêu?", Intent::PriceQuestion, 0.0), at(0.0));
    assert_ne!(first.reason, Reason::Duplicate);

    let second = brain.decide(event("frank", "giá  bao nhiêu", Intent::PriceQuestion, 5.0), at(5.0));
    assert_eq!(second.action, Action::Skip);
    assert_eq!(second.reason, Reason::Duplicate);
}

#[test]
fn every_intent_in_every_phase_yields_one_bounded_decision() {
    for phase_path in [
        vec![],
        vec![Intent::Greeting],
        vec![Intent::Greeting, Intent::ProductQuestion],
        vec![Intent::Complaint],
        vec![Intent::Question],
    ] {
        for (i, intent) in Intent::ALL.iter().enumerate() {
            let mut brain = LiveBrain::new(BrainConfig::default(), t0());
            for (step, setup) in phase_path.iter().enumerate() {
                let secs = 40.0 * step as f64;
                brain.decide(event(&format!("setup_{}", step), &format!("setup step {}", step), *setup, secs), at(secs));
            }

            let decision = brain.decide(event("viewer", &format!("comment {}", i), *intent, 100.0), at(100.0));
            assert!((1..=10).contains(&decision.priority.value()));
            assert!(matches!(decision.action, Action::Speak | Action::Skip | Action::Queue));
        }
    }
}

#[test]
fn speaks_respect_cooldown_and_queue_stays_bounded() {
    let config = BrainConfig {
        max_queue_size: 4,
        ..BrainConfig::default()
    };
    let (min, max) = (config.min_speak_interval, config.max_speak_interval);
    let capacity = config.max_queue_size;
    let mut brain = LiveBrain::new(config, t0());

    let mut speaks: Vec<Decision> = Vec::new();
    for i in 0..400usize {
        let secs = i as f64 * 0.4;
        let intent = Intent::ALL[(i * 7) % Intent::ALL.len()];
        // ユーザーを分けて近似重複に引っかからないようにする
        let user = format!("viewer_{}", i);
        let mut out = vec![brain.decide(event(&user, &format!("message number {}", i), intent, secs), at(secs))];
        out.extend(brain.tick(at(secs + 0.2)));

        assert!(brain.queue_len() <= capacity);
        speaks.extend(out.into_iter().filter(Decision::is_speak));
    }

    assert!(speaks.len() > 10);
    assert!(speaks.iter().any(|d| d.priority.value() < 9), "needs SPEAKs with a longer cooldown");

    for speak in &speaks {
        // 発話直後の残りクールダウン = 優先度で補間した長さ
        let p = f64::from(speak.priority.value());
        let expected = max - (max - min) * (p - 1.0) / 9.0;
        assert!(
            (speak.cooldown_applied - expected).abs() < 1e-3,
            "priority {} applied {} expected {}",
            p,
            speak.cooldown_applied,
            expected
        );
    }

    for pair in speaks.windows(2) {
        let (previous, current) = (&pair[0], &pair[1]);
        if current.reason == Reason::AutoPriority {
            continue;
        }
        let gap = current.decided_at - previous.decided_at;
        let required = Duration::milliseconds((previous.cooldown_applied * 1000.0).round() as i64);
        assert!(
            gap >= required,
            "{:?} SPEAK only {:?} after a priority {} SPEAK that set {:?}",
            current.reason,
            gap,
            previous.priority.value(),
            required
        );
    }
}

#[test]
fn malformed_input_does_not_stop_the_engine() {
    let mut brain = LiveBrain::new(BrainConfig::default(), t0());

    let broken: RawCommentEvent = serde_json::from_str(r#"{"text":"no user here","intent":"greeting"}"#).unwrap();
    let rejected = brain.decide_raw(broken, at(0.0));
    assert_eq!(rejected.action, Action::Skip);
    assert_eq!(rejected.reason, Reason::DecisionError);

    let ok = brain.decide(event("gina", "chốt đơn", Intent::PurchaseIntent, 1.0), at(1.0));
    assert_eq!(ok.action, Action::Speak);
    assert_eq!(brain.counters().malformed, 1);
}
