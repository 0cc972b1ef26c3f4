//! セールファネルのフェーズ定義
//!
//! 基本フロー: IDLE → WARM_UP → INTEREST → PRICE → CTA → COOLDOWN → IDLE
//! 割り込み: HANDLING_QUESTION（直前のフェーズへ戻る）, CRISIS（必ず COOLDOWN へ）

use serde::{Deserialize, Serialize};

/// ファネルのフェーズ
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[display("IDLE")]
    Idle,
    #[display("WARM_UP")]
    WarmUp,
    #[display("INTEREST")]
    Interest,
    #[display("PRICE")]
    Price,
    #[display("CTA")]
    Cta,
    #[display("HANDLING_QUESTION")]
    HandlingQuestion,
    #[display("CRISIS")]
    Crisis,
    #[display("COOLDOWN")]
    Cooldown,
}

impl Phase {
    pub const ALL: [Phase; 8] = [
        Phase::Idle,
        Phase::WarmUp,
        Phase::Interest,
        Phase::Price,
        Phase::Cta,
        Phase::HandlingQuestion,
        Phase::Crisis,
        Phase::Cooldown,
    ];

    /// 割り込みフェーズかどうか
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Phase::HandlingQuestion | Phase::Crisis)
    }

    /// フェーズごとの振る舞い
    ///
    /// 滞在時間は `idle_timeout` に対する倍率。既定の 60 秒で
    /// IDLE 60 / WARM_UP 30〜120 / INTEREST 45〜180 / PRICE 20〜90 / CTA 15〜45 秒になる。
    pub fn profile(&self) -> PhaseProfile {
        match self {
            Phase::Idle => PhaseProfile {
                response_style: ResponseStyle::Friendly,
                decay_target: None,
                min_dwell: 0.0,
                max_dwell: 1.0,
            },
            Phase::WarmUp => PhaseProfile {
                response_style: ResponseStyle::Enthusiastic,
                decay_target: Some(Phase::Idle),
                min_dwell: 0.5,
                max_dwell: 2.0,
            },
            Phase::Interest => PhaseProfile {
                response_style: ResponseStyle::Informative,
                decay_target: Some(Phase::WarmUp),
                min_dwell: 0.75,
                max_dwell: 3.0,
            },
            Phase::Price => PhaseProfile {
                response_style: ResponseStyle::ValueFocused,
                decay_target: Some(Phase::Interest),
                min_dwell: 1.0 / 3.0,
                max_dwell: 1.5,
            },
            Phase::Cta => PhaseProfile {
                response_style: ResponseStyle::Urgent,
                decay_target: Some(Phase::Cooldown),
                min_dwell: 0.25,
                max_dwell: 0.75,
            },
            Phase::Cooldown => PhaseProfile {
                response_style: ResponseStyle::Calm,
                decay_target: Some(Phase::Idle),
                min_dwell: 1.0,
                max_dwell: 2.0,
            },
            // 戻り先は退避フェーズで決まる
            Phase::HandlingQuestion => PhaseProfile {
                response_style: ResponseStyle::Helpful,
                decay_target: None,
                min_dwell: 0.0,
                max_dwell: 1.0,
            },
            // 次の tick で必ず抜ける
            Phase::Crisis => PhaseProfile {
                response_style: ResponseStyle::Empathetic,
                decay_target: Some(Phase::Cooldown),
                min_dwell: 0.0,
                max_dwell: 0.0,
            },
        }
    }

    pub fn response_style(&self) -> ResponseStyle {
        self.profile().response_style
    }
}

/// 応答スタイル（応答生成側へのヒント）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStyle {
    #[display("friendly")]
    Friendly,
    #[display("enthusiastic")]
    Enthusiastic,
    #[display("informative")]
    Informative,
    #[display("value_focused")]
    ValueFocused,
    #[display("urgent")]
    Urgent,
    #[display("calm")]
    Calm,
    #[display("helpful")]
    Helpful,
    #[display("empathetic")]
    Empathetic,
}

/// フェーズ設定
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseProfile {
    pub response_style: ResponseStyle,
    /// 無遷移タイムアウト時の減衰先（None なら減衰しない）
    pub decay_target: Option<Phase>,
    /// 前進遷移を受け付けるまでの最短滞在
    pub min_dwell: f64,
    /// 減衰するまでの最長滞在
    pub max_dwell: f64,
}
