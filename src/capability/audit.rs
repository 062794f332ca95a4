//! Audit records for capability checks

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// One `(principal, action, resource, success)` entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub principal_id: String,
    pub action: String,
    pub resource: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(principal_id: &str, action: &str, resource: &str, success: bool) -> Self {
        Self {
            principal_id: principal_id.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            success,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for audit records
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Writes audit records to the `audit` log target
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, record: AuditRecord) {
        info!(
            target: "audit",
            "principal={} action={} resource={} success={} at={}",
            record.principal_id,
            record.action,
            record.resource,
            record.success,
            record.timestamp.to_rfc3339()
        );
    }
}

/// Keeps records in memory, in arrival order
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: AuditRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}
