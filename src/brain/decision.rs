//! 判定結果（Decision）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::event::{CommentEvent, Intent};
use super::scorer::Priority;
use crate::sale_flow::{Phase, ResponseStyle};

/// 判定アクション
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    #[display("SPEAK")]
    Speak,
    #[display("SKIP")]
    Skip,
    #[display("QUEUE")]
    Queue,
}

/// 判定理由コード
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    #[display("GREETING")]
    Greeting,
    #[display("PRICE_QUESTION")]
    PriceQuestion,
    #[display("PRODUCT_QUESTION")]
    ProductQuestion,
    #[display("SALE_CTA")]
    SaleCta,
    #[display("ENGAGEMENT")]
    Engagement,
    #[display("HIGH_PRIORITY")]
    HighPriority,
    #[display("AUTO_PRIORITY")]
    AutoPriority,
    #[display("QUEUED")]
    Queued,
    #[display("PROMOTED")]
    Promoted,
    #[display("DUPLICATE")]
    Duplicate,
    #[display("SPAM")]
    Spam,
    #[display("LOW_PRIORITY")]
    LowPriority,
    #[display("QUEUE_FULL")]
    QueueFull,
    #[display("EXPIRED")]
    Expired,
    #[display("EVICTED")]
    Evicted,
    #[display("DECISION_ERROR")]
    DecisionError,
    #[display("FORWARD_FAILED")]
    ForwardFailed,
    #[display("SHUTDOWN")]
    Shutdown,
}

impl Reason {
    /// 入力だけで決まる SKIP（判定の確信度が最大）
    pub fn is_deterministic(&self) -> bool {
        matches!(self, Reason::Duplicate | Reason::Spam | Reason::DecisionError)
    }
}

/// 判定の発生元
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOrigin {
    /// 入力イベントに対する直接の判定
    Direct,
    /// キューに入っていたイベントの後続判定（昇格・期限切れ・追い出し・終了）
    Queue,
}

/// SPEAK 時の理由を意図から決める
pub fn speak_reason(intent: Intent) -> Reason {
    match intent {
        Intent::Greeting => Reason::Greeting,
        Intent::PriceQuestion => Reason::PriceQuestion,
        Intent::ProductQuestion => Reason::ProductQuestion,
        Intent::PurchaseIntent => Reason::SaleCta,
        Intent::Thanks | Intent::Chitchat | Intent::Compliment => Reason::Engagement,
        _ => Reason::HighPriority,
    }
}

/// エンジン自身の判定確信度
pub fn decision_confidence(action: Action, reason: Reason, priority: Priority) -> f64 {
    match action {
        Action::Speak | Action::Queue => (0.8 + f64::from(priority.value()) / 50.0).min(1.0),
        Action::Skip if reason.is_deterministic() => 1.0,
        Action::Skip if reason == Reason::LowPriority => 0.9,
        Action::Skip => 0.7,
    }
}

/// 1 イベントにつき 1 回だけ作られる判定結果
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub event: Arc<CommentEvent>,
    pub action: Action,
    pub reason: Reason,
    pub priority: Priority,
    /// 次の SPEAK が可能になるまでの秒数
    pub cooldown_applied: f64,
    pub confidence: f64,
    /// 判定後のフェーズ
    pub phase: Phase,
    pub response_style: ResponseStyle,
    pub decided_at: DateTime<Utc>,
    pub origin: DecisionOrigin,
}

impl Decision {
    pub fn is_speak(&self) -> bool {
        self.action == Action::Speak
    }

    pub fn is_skip(&self) -> bool {
        self.action == Action::Skip
    }

    pub fn is_queue(&self) -> bool {
        self.action == Action::Queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speak_reasons() {
        assert_eq!(speak_reason(Intent::PurchaseIntent), Reason::SaleCta);
        assert_eq!(speak_reason(Intent::Compliment), Reason::Engagement);
        assert_eq!(speak_reason(Intent::Complaint), Reason::HighPriority);
    }

    #[test]
    fn test_confidence_table() {
        let p = Priority::new(5);
        assert!((decision_confidence(Action::Speak, Reason::Greeting, p) - 0.9).abs() < 1e-9);
        let max = decision_confidence(Action::Speak, Reason::AutoPriority, Priority::MAX);
        assert!(max <= 1.0 && max > 0.999);
        assert_eq!(decision_confidence(Action::Skip, Reason::Duplicate, p), 1.0);
        assert_eq!(decision_confidence(Action::Skip, Reason::LowPriority, p), 0.9);
        assert_eq!(decision_confidence(Action::Skip, Reason::QueueFull, p), 0.7);
    }

    #[test]
    fn test_wire_names() {
        assert_eq!(serde_json::to_value(Reason::QueueFull).unwrap(), "QUEUE_FULL");
        assert_eq!(serde_json::to_value(Action::Speak).unwrap(), "SPEAK");
        assert_eq!(Reason::DecisionError.to_string(), "DECISION_ERROR");
    }
}
