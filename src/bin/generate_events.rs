//! 合成コメントストリーム生成ツール
//!
//! リプレイ・負荷試験用に、分類済みコメントの NDJSON を生成する。
//! 通常の流れに加えて、同一ユーザーの連投（重複）、購入意図の集中（バースト）、
//! 苦情の連続を混ぜる。

use anyhow::Result;
use clap::Parser;
use livebrain::RawCommentEvent;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "generate_events", about = "Generate a synthetic comment stream")]
struct Args {
    /// 生成するコメント数
    #[arg(short = 'n', long, default_value_t = 500)]
    count: usize,

    /// 出力先（省略時は標準出力）
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// 乱数シード
    #[arg(long)]
    seed: Option<u64>,

    /// コメント間隔の平均（秒）
    #[arg(long, default_value_t = 1.5)]
    mean_gap: f64,

    /// 開始時刻（エポック秒）
    #[arg(long, default_value_t = 1_700_000_000.0)]
    start: f64,
}

const TEMPLATES: &[(&str, &[&str])] = &[
    ("greeting", &["chào shop", "hello mọi người", "xin chào", "hi shop ơi"]),
    ("chitchat", &["hôm nay trời đẹp quá", "shop live vui ghê", "mình mới vào"]),
    ("thanks", &["cảm ơn shop", "thanks shop nhiều", "cảm ơn đã tư vấn"]),
    ("compliment", &["sản phẩm đẹp quá", "shop nói hay ghê", "màu này xinh"]),
    ("product_question", &["chất liệu là gì vậy", "có size L không", "màu đỏ còn không"]),
    ("price_question", &["giá bao nhiêu vậy", "bao nhiêu tiền shop", "có giảm giá không"]),
    ("shipping_question", &["ship về Hà Nội mất mấy ngày", "có freeship không"]),
    ("question", &["mua ở đâu vậy", "khi nào live tiếp", "dùng thế nào vậy"]),
    ("purchase_intent", &["chốt đơn", "mình lấy 1 cái", "đặt 2 cái nha shop"]),
    ("request", &["cho xem màu xanh", "thử size M giúp mình"]),
    ("complaint", &["hàng giao thiếu", "chất lượng tệ quá", "shop trả lời chậm"]),
    ("spam", &["follow mình nha", "xem link bio", "kiếm tiền online tại nhà"]),
];

/// 通常時の意図の重み
const WEIGHTS: &[u32] = &[12, 15, 6, 8, 12, 10, 5, 8, 6, 5, 3, 10];

fn templates_for(intent: &str) -> &'static [&'static str] {
    TEMPLATES
        .iter()
        .find(|(name, _)| *name == intent)
        .map(|(_, texts)| *texts)
        .unwrap_or(&["..."])
}

struct Generator {
    rng: StdRng,
    clock: f64,
    mean_gap: f64,
    next_id: u64,
    viewers: u64,
}

impl Generator {
    fn event(&mut self, user: &str, intent: &str, text: String) -> RawCommentEvent {
        self.next_id += 1;
        self.viewers = self.viewers.saturating_add_signed(self.rng.gen_range(-3..=6));

        RawCommentEvent {
            comment_id: Some(format!("c{:06}", self.next_id)),
            user_id: Some(user.to_string()),
            username: Some(user.to_string()),
            text: Some(text),
            intent: Some(intent.to_string()),
            confidence: Some(self.rng.gen_range(0.6..1.0)),
            is_follower: Some(self.rng.gen_bool(0.3)),
            is_subscriber: Some(self.rng.gen_bool(0.1)),
            timestamp: Some(self.clock),
            gift_value: self.rng.gen_bool(0.03).then(|| self.rng.gen_range(10.0..500.0)),
            viewer_count: Some(self.viewers),
            ..RawCommentEvent::default()
        }
    }

    fn advance(&mut self, mean: f64) {
        self.clock += self.rng.gen_range(0.0..mean * 2.0);
    }

    fn user(&mut self) -> String {
        format!("viewer_{}", self.rng.gen_range(1..=200))
    }

    fn text(&mut self, intent: &str) -> String {
        let base = templates_for(intent).choose(&mut self.rng).copied().unwrap_or("...");
        // 同じ定型文でも完全一致にならないよう語尾を揺らす
        match self.rng.gen_range(0..4) {
            0 => base.to_string(),
            1 => format!("{} ạ", base),
            2 => format!("{}!!", base),
            _ => format!("{} {}", base, self.rng.gen_range(1..100)),
        }
    }

    fn normal(&mut self) -> RawCommentEvent {
        let index = weighted_index(&mut self.rng, WEIGHTS);
        let intent = TEMPLATES[index].0;
        let user = self.user();
        let text = self.text(intent);
        self.advance(self.mean_gap);
        self.event(&user, intent, text)
    }

    /// 同一ユーザーが同じ内容を連投する
    fn duplicates(&mut self) -> Vec<RawCommentEvent> {
        let user = self.user();
        let text = self.text("price_question");
        let repeats = self.rng.gen_range(2..=4);
        (0..repeats)
            .map(|_| {
                self.advance(0.5);
                self.event(&user, "price_question", text.clone())
            })
            .collect()
    }

    /// 購入意図が短時間に集中する
    fn burst(&mut self) -> Vec<RawCommentEvent> {
        let size = self.rng.gen_range(5..=12);
        (0..size)
            .map(|_| {
                let intent = if self.rng.gen_bool(0.6) { "purchase_intent" } else { "price_question" };
                let user = self.user();
                let text = self.text(intent);
                self.advance(0.2);
                self.event(&user, intent, text)
            })
            .collect()
    }

    /// 苦情が続く
    fn complaints(&mut self) -> Vec<RawCommentEvent> {
        let size = self.rng.gen_range(3..=5);
        (0..size)
            .map(|_| {
                let user = self.user();
                let text = self.text("complaint");
                self.advance(0.8);
                self.event(&user, "complaint", text)
            })
            .collect()
    }
}

fn weighted_index(rng: &mut StdRng, weights: &[u32]) -> usize {
    let total: u32 = weights.iter().sum();
    let mut pick = rng.gen_range(0..total.max(1));
    for (index, weight) in weights.iter().enumerate() {
        if pick < *weight {
            return index;
        }
        pick -= weight;
    }
    weights.len().saturating_sub(1)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut generator = Generator {
        rng,
        clock: args.start,
        mean_gap: args.mean_gap.max(0.01),
        next_id: 0,
        viewers: 120,
    };

    let mut events = Vec::with_capacity(args.count);
    while events.len() < args.count {
        let roll: f64 = generator.rng.gen();
        let batch = if roll < 0.04 {
            generator.burst()
        } else if roll < 0.08 {
            generator.duplicates()
        } else if roll < 0.10 {
            generator.complaints()
        } else {
            vec![generator.normal()]
        };
        events.extend(batch);
    }
    events.truncate(args.count);

    let mut writer: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    };
    for event in &events {
        writeln!(writer, "{}", serde_json::to_string(event)?)?;
    }
    writer.flush()?;

    if let Some(path) = &args.output {
        eprintln!("✅ {} 件のコメントを生成しました: {}", events.len(), path.display());
    }
    Ok(())
}
