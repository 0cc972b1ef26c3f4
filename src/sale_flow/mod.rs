//! セールファネル（販売会話の段階管理）

pub mod machine;
pub mod states;

pub use machine::{FunnelState, FunnelStats, SaleStateMachine, Transition, Trigger};
pub use states::{Phase, PhaseProfile, ResponseStyle};
