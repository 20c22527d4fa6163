use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Failure of a single repository call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("repository call timed out after {0:?}")]
    Timeout(Duration),
}

impl RepositoryError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        RepositoryError::Unavailable(msg.into())
    }
}

impl From<anyhow::Error> for RepositoryError {
    fn from(e: anyhow::Error) -> Self {
        RepositoryError::Unavailable(format!("{:#}", e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Fixture,
    Score,
    OfficialResult,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Fixture => f.write_str("fixture"),
            RecordKind::Score => f.write_str("score"),
            RecordKind::OfficialResult => f.write_str("official result"),
        }
    }
}

/// A stored document that could not be parsed into the data model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {kind} record '{id}': {reason}")]
pub struct MalformedRecord {
    pub kind: RecordKind,
    pub id: String,
    pub reason: String,
}

impl MalformedRecord {
    pub fn new(kind: RecordKind, id: impl Into<String>, reason: impl Into<String>) -> Self {
        MalformedRecord {
            kind,
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// One subtree of the region → competition → fixture traversal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "level", rename_all = "snake_case")]
pub enum BranchId {
    Region {
        region_id: String,
    },
    Competition {
        region_id: String,
        competition_id: String,
    },
    Fixture {
        region_id: String,
        competition_id: String,
        fixture_id: String,
    },
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchId::Region { region_id } => write!(f, "{}", region_id),
            BranchId::Competition {
                region_id,
                competition_id,
            } => write!(f, "{}/{}", region_id, competition_id),
            BranchId::Fixture {
                region_id,
                competition_id,
                fixture_id,
            } => write!(f, "{}/{}/{}", region_id, competition_id, fixture_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchFailure {
    pub branch: BranchId,
    #[serde(serialize_with = "serialize_display")]
    pub error: RepositoryError,
}

/// Summary of the branches excluded from a best-effort aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
pub struct PartialFailure {
    pub failures: Vec<BranchFailure>,
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} branch(es) failed:", self.failures.len())?;
        for failure in &self.failures {
            write!(f, " [{}: {}]", failure.branch, failure.error)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    /// Listing the top-level regions failed; there is nothing to assemble.
    #[error("total failure: could not list regions: {0}")]
    TotalFailure(#[source] RepositoryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("subscription attempt {attempt} failed, retrying in {retry_in:?}: {reason}")]
    Transient {
        attempt: u32,
        retry_in: Duration,
        reason: String,
    },
    #[error("subscription gave up after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },
    #[error("subscription is no longer running")]
    Closed,
}

fn serialize_display<T: fmt::Display, S: serde::Serializer>(
    value: &T,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}
