use std::fmt;

use serde::{Deserialize, Serialize};

/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Callers are identified by their row id in the `callers` table.
pub type CallerId = DbId;

/// The unit of pool isolation. Each partition owns its own worker pool.
///
/// Partitions are derived from the caller id so that repeated calls from the
/// same caller land on the same warm pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn for_caller(caller_id: CallerId) -> Self {
        Self(format!("caller-{caller_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_for_caller_is_stable() {
        assert_eq!(PartitionKey::for_caller(42), PartitionKey::for_caller(42));
        assert_eq!(PartitionKey::for_caller(42).as_str(), "caller-42");
    }

    #[test]
    fn partition_serializes_as_plain_string() {
        let json = serde_json::to_string(&PartitionKey::new("tenant-a")).unwrap();
        assert_eq!(json, "\"tenant-a\"");
    }
}
