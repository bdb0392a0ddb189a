use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope published on the bus. `body` is the domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord<B> {
    pub id: String,
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub session_id: Option<String>,
    pub body: B,
}
