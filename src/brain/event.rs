//! 入力コメントイベント
//!
//! 上流の分類器から届く 1 コメント = 1 メッセージのレコード。
//! `RawCommentEvent` がワイヤ形式、`CommentEvent` が検証済みの不変イベント。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::timing;
use crate::error::{LiveBrainError, LiveBrainResult};

/// コメントの意図（分類器の固定語彙）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Greeting,
    Chitchat,
    Thanks,
    Compliment,
    ProductQuestion,
    PriceQuestion,
    ShippingQuestion,
    Question,
    PurchaseIntent,
    Request,
    Complaint,
    Spam,
    Unknown,
}

impl Intent {
    /// 全意図（全域性テスト用）
    pub const ALL: [Intent; 13] = [
        Intent::Greeting,
        Intent::Chitchat,
        Intent::Thanks,
        Intent::Compliment,
        Intent::ProductQuestion,
        Intent::PriceQuestion,
        Intent::ShippingQuestion,
        Intent::Question,
        Intent::PurchaseIntent,
        Intent::Request,
        Intent::Complaint,
        Intent::Spam,
        Intent::Unknown,
    ];

    /// タグ文字列から意図を解決する。語彙外は `Unknown`。
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "greeting" => Intent::Greeting,
            "chitchat" => Intent::Chitchat,
            "thanks" => Intent::Thanks,
            "compliment" => Intent::Compliment,
            "product_question" | "product" => Intent::ProductQuestion,
            "price_question" | "price" => Intent::PriceQuestion,
            "shipping_question" | "shipping" => Intent::ShippingQuestion,
            "question" => Intent::Question,
            "purchase_intent" | "order" => Intent::PurchaseIntent,
            "request" => Intent::Request,
            "complaint" => Intent::Complaint,
            "spam" => Intent::Spam,
            "unknown" => Intent::Unknown,
            other => {
                tracing::debug!(tag = other, "Unrecognized intent tag, treating as unknown");
                Intent::Unknown
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Greeting => "greeting",
            Intent::Chitchat => "chitchat",
            Intent::Thanks => "thanks",
            Intent::Compliment => "compliment",
            Intent::ProductQuestion => "product_question",
            Intent::PriceQuestion => "price_question",
            Intent::ShippingQuestion => "shipping_question",
            Intent::Question => "question",
            Intent::PurchaseIntent => "purchase_intent",
            Intent::Request => "request",
            Intent::Complaint => "complaint",
            Intent::Spam => "spam",
            Intent::Unknown => "unknown",
        }
    }

    /// エンゲージメント系（視聴者増加時に優先度を上げる対象）
    pub fn is_engagement(&self) -> bool {
        matches!(
            self,
            Intent::Greeting | Intent::Chitchat | Intent::Thanks | Intent::Compliment
        )
    }

    /// 質問系（HANDLING_QUESTION への割り込み対象）
    pub fn is_question_class(&self) -> bool {
        matches!(
            self,
            Intent::Question | Intent::ShippingQuestion | Intent::Request
        )
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ワイヤ形式のコメントイベント
///
/// 既知フィールドは型が合うものだけを取り出す。型が合わない値と未知のフィールドは
/// `extra` に残し、出力時にそのまま返す。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawCommentEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// 上流の参考優先度（再計算される）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_follower: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_subscriber: Option<bool>,
    /// エポック秒
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gift_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer_count_delta: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RawCommentEvent {
    /// JSON オブジェクトからレコードを組み立てる。失敗しない。
    pub fn from_map(mut map: Map<String, Value>) -> Self {
        Self {
            comment_id: take(&mut map, &["comment_id", "id"], as_id),
            user_id: take(&mut map, &["user_id"], as_id),
            username: take(&mut map, &["username"], as_string),
            nickname: take(&mut map, &["nickname"], as_string),
            text: take(&mut map, &["text", "original_comment"], as_string),
            intent: take(&mut map, &["intent"], as_string),
            entities: take(&mut map, &["entities"], |v| v.as_array().cloned()),
            confidence: take(&mut map, &["confidence"], Value::as_f64),
            priority: take(&mut map, &["priority"], Value::as_i64),
            is_follower: take(&mut map, &["is_follower"], Value::as_bool),
            is_subscriber: take(&mut map, &["is_subscriber"], Value::as_bool),
            timestamp: take(&mut map, &["timestamp"], Value::as_f64),
            gift_value: take(&mut map, &["gift_value"], Value::as_f64),
            viewer_count: take(&mut map, &["viewer_count"], Value::as_u64),
            viewer_count_delta: take(&mut map, &["viewer_count_delta"], Value::as_i64),
            extra: map,
        }
    }
}

impl<'de> Deserialize<'de> for RawCommentEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Map::<String, Value>::deserialize(deserializer).map(Self::from_map)
    }
}

/// 最初に型が合ったキーの値を取り出す。合わなければ map に残す。
fn take<T>(map: &mut Map<String, Value>, keys: &[&str], convert: impl Fn(&Value) -> Option<T>) -> Option<T> {
    for key in keys {
        if let Some(value) = map.get(*key).and_then(&convert) {
            map.remove(*key);
            return Some(value);
        }
    }
    None
}

fn as_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

/// ID は数値でも受け付ける
fn as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 検証済みのコメントイベント（不変）
#[derive(Debug, Clone, PartialEq)]
pub struct CommentEvent {
    pub id: String,
    pub user_id: String,
    pub text: String,
    pub intent: Intent,
    pub confidence: f64,
    pub is_follower: bool,
    pub is_subscriber: bool,
    pub viewer_count_delta: i64,
    pub gift_value: f64,
    pub arrival_time: DateTime<Utc>,
    /// 受信時のワイヤレコード（パススルー用）
    pub source: RawCommentEvent,
}

impl CommentEvent {
    /// ワイヤレコードを検証してイベントを作成
    ///
    /// `timestamp` が無い（null を含む）場合は受信時刻 `now` を使う。
    pub fn try_from_raw(raw: RawCommentEvent, now: DateTime<Utc>) -> LiveBrainResult<Self> {
        let user_id = match raw.user_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            Some(_) => return Err(LiveBrainError::malformed("user_id", "is empty")),
            None => return Err(LiveBrainError::malformed("user_id", "is missing")),
        };

        let text = raw
            .text
            .clone()
            .ok_or_else(|| LiveBrainError::malformed("text", "is missing"))?;

        let intent = raw
            .intent
            .as_deref()
            .map(Intent::from_tag)
            .ok_or_else(|| LiveBrainError::malformed("intent", "is missing"))?;

        let confidence = match raw.confidence {
            None => 1.0,
            Some(c) if c.is_finite() && (0.0..=1.0).contains(&c) => c,
            Some(c) => {
                return Err(LiveBrainError::malformed(
                    "confidence",
                    format!("must be within [0, 1], got {}", c),
                ))
            }
        };

        let arrival_time = match raw.timestamp {
            None => now,
            Some(timestamp) => timing::from_epoch_secs(timestamp).ok_or_else(|| {
                LiveBrainError::malformed("timestamp", format!("is not a valid epoch time: {}", timestamp))
            })?,
        };

        let gift_value = match raw.gift_value {
            Some(v) if v.is_finite() && v > 0.0 => v,
            _ => 0.0,
        };

        let id = raw
            .comment_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(Self {
            id,
            user_id,
            text,
            intent,
            confidence,
            is_follower: raw.is_follower.unwrap_or(false),
            is_subscriber: raw.is_subscriber.unwrap_or(false),
            viewer_count_delta: raw.viewer_count_delta.unwrap_or(0),
            gift_value,
            arrival_time,
            source: raw,
        })
    }

    /// 検証に失敗したレコードから、拒否 Decision 用のイベントを組み立てる
    pub fn salvage(raw: RawCommentEvent, now: DateTime<Utc>) -> Self {
        Self {
            id: raw
                .comment_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            user_id: raw.user_id.clone().unwrap_or_default(),
            text: raw.text.clone().unwrap_or_default(),
            intent: raw
                .intent
                .as_deref()
                .map(Intent::from_tag)
                .unwrap_or(Intent::Unknown),
            confidence: 0.0,
            is_follower: raw.is_follower.unwrap_or(false),
            is_subscriber: raw.is_subscriber.unwrap_or(false),
            viewer_count_delta: 0,
            gift_value: 0.0,
            arrival_time: raw
                .timestamp
                .and_then(timing::from_epoch_secs)
                .unwrap_or(now),
            source: raw,
        }
    }

    /// プログラムから直接イベントを作成（テスト・ベンチマーク用）
    pub fn new(
        user_id: impl Into<String>,
        text: impl Into<String>,
        intent: Intent,
        arrival_time: DateTime<Utc>,
    ) -> Self {
        let user_id = user_id.into();
        let text = text.into();
        let id = uuid::Uuid::new_v4().to_string();
        let source = RawCommentEvent {
            comment_id: Some(id.clone()),
            user_id: Some(user_id.clone()),
            username: Some(user_id.clone()),
            text: Some(text.clone()),
            intent: Some(intent.as_str().to_string()),
            timestamp: Some(timing::to_epoch_secs(arrival_time)),
            ..RawCommentEvent::default()
        };

        Self {
            id,
            user_id,
            text,
            intent,
            confidence: 1.0,
            is_follower: false,
            is_subscriber: false,
            viewer_count_delta: 0,
            gift_value: 0.0,
            arrival_time,
            source,
        }
    }

    pub fn with_follower(mut self, is_follower: bool) -> Self {
        self.is_follower = is_follower;
        self.source.is_follower = Some(is_follower);
        self
    }

    pub fn with_subscriber(mut self, is_subscriber: bool) -> Self {
        self.is_subscriber = is_subscriber;
        self.source.is_subscriber = Some(is_subscriber);
        self
    }

    pub fn with_gift(mut self, gift_value: f64) -> Self {
        self.gift_value = gift_value.max(0.0);
        self.source.gift_value = Some(self.gift_value);
        self
    }

    pub fn with_viewer_delta(mut self, delta: i64) -> Self {
        self.viewer_count_delta = delta;
        self
    }

    /// ワイヤレコードに視聴者数の増減が明示されているか
    pub fn has_explicit_viewer_delta(&self) -> bool {
        self.source.viewer_count_delta.is_some()
    }
}
