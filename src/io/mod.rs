//! I/O utilities for the comment stream and decision output.
//!
//! Input is NDJSON from the upstream classifier, output is one
//! [`DecisionEnvelope`] per forwarded decision.

pub mod envelope;
pub mod ndjson;

// Re-export commonly used types and functions
pub use envelope::{DecisionBlock, DecisionEnvelope};
pub use ndjson::{parse_event_line, read_events_file, write_ndjson_line, EventLineReader};
