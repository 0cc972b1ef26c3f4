pub mod brain;
pub mod config;
pub mod error;
pub mod io;
pub mod observability;
pub mod sale_flow;
pub mod service;
pub mod transport;

// Re-export the main engine types for convenience
pub use brain::{
    Action, BrainSnapshot, CommentEvent, Decision, EngineEvent, Intent, LiveBrain, Priority, RawCommentEvent,
    Reason,
};

pub use config::{AppConfig, BrainConfig, ConfigManager};
pub use error::{LiveBrainError, LiveBrainResult};

// Re-export I/O utilities for convenience
pub use io::{parse_event_line, read_events_file, DecisionEnvelope, EventLineReader};

pub use sale_flow::{Phase, ResponseStyle, SaleStateMachine};
pub use service::{BrainService, Downstream, Incoming, ServiceHandle, ServiceReport};
pub use transport::DecisionFeed;
