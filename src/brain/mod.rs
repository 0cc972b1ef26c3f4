//! コメント判定エンジン

pub mod cooldown;
pub mod decision;
pub mod duplicate_filter;
pub mod event;
pub mod live_brain;
pub mod queue;
pub mod scorer;
pub mod timing;

pub use cooldown::CooldownWindow;
pub use decision::{Action, Decision, DecisionOrigin, Reason};
pub use duplicate_filter::{DuplicateFilter, DuplicatePolicy};
pub use event::{CommentEvent, Intent, RawCommentEvent};
pub use live_brain::{BrainSnapshot, EngineCounters, EngineEvent, LiveBrain};
pub use queue::{BoundedPriorityQueue, PendingEntry, QueueError};
pub use scorer::Priority;
