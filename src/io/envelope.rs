//! Output record sent to the response generator.
//!
//! The original input fields are passed through unchanged and the engine's
//! verdict is attached as a `decision` block together with the current sale
//! phase and the response style derived from it.

use serde::{Deserialize, Serialize};

use crate::brain::decision::{Action, Decision, DecisionOrigin, Reason};
use crate::brain::event::RawCommentEvent;
use crate::brain::timing;
use crate::sale_flow::{Phase, ResponseStyle};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionBlock {
    pub action: Action,
    pub reason: Reason,
    pub priority: u8,
    /// Seconds until the next SPEAK is eligible.
    pub cooldown: f64,
    pub confidence: f64,
    pub origin: DecisionOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionEnvelope {
    #[serde(flatten)]
    pub input: RawCommentEvent,
    pub decision: DecisionBlock,
    pub sale_state: Phase,
    pub response_style: ResponseStyle,
    /// Epoch seconds.
    pub decided_at: f64,
}

impl From<&Decision> for DecisionEnvelope {
    fn from(decision: &Decision) -> Self {
        let mut input = decision.event.source.clone();
        if input.comment_id.is_none() {
            input.comment_id = Some(decision.event.id.clone());
        }

        Self {
            input,
            decision: DecisionBlock {
                action: decision.action,
                reason: decision.reason,
                priority: decision.priority.value(),
                cooldown: decision.cooldown_applied,
                confidence: decision.confidence,
                origin: decision.origin,
            },
            sale_state: decision.phase,
            response_style: decision.response_style,
            decided_at: timing::to_epoch_secs(decision.decided_at),
        }
    }
}
