//! 外部配信トランスポート

pub mod websocket;

pub use websocket::{DecisionFeed, FeedFrame, FeedRequest};
