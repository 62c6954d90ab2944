use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::SessionId;

/// Server-side generation session as seen by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self::with_created_at(id, Utc::now())
    }

    pub fn with_created_at(id: SessionId, created_at: DateTime<Utc>) -> Self {
        Self { id, created_at }
    }

    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.created_at >= ttl
    }
}
