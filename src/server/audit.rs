//! Audit events for every operation that changes or exposes CA state.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::{error, info};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::commons::CaResult;
use crate::constants::{AUDIT_LOG_TARGET, CERTA_AUDIT_APP};

//------------ AuditStatus ---------------------------------------------------

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditStatus {
    Successful,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditLevel {
    Info,
    Error,
}

//------------ AuditRecord ---------------------------------------------------

/// A closed audit event.
#[derive(Clone, Debug, Serialize)]
pub struct AuditRecord {
    pub application: &'static str,
    pub name: String,
    pub ca: String,
    pub msg_id: String,
    pub started: DateTime<Utc>,
    pub duration_ms: u64,
    pub level: AuditLevel,
    pub status: AuditStatus,
    pub data: Map<String, Value>,
}

impl AuditRecord {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

//------------ AuditSink -----------------------------------------------------

pub trait AuditSink: Send + Sync {
    fn log(&self, record: &AuditRecord);
}

/// Writes audit records as JSON to the audit log target.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn log(&self, record: &AuditRecord) {
        let json = match serde_json::to_string(record) {
            Ok(json) => json,
            Err(e) => {
                error!("Cannot serialize audit event '{}': {e}", record.name);
                return;
            }
        };
        match record.level {
            AuditLevel::Info => info!(target: AUDIT_LOG_TARGET, "{json}"),
            AuditLevel::Error => error!(target: AUDIT_LOG_TARGET, "{json}"),
        }
    }
}

/// Keeps audit records in memory, used in tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().expect("poisoned lock").clone()
    }

    pub fn records_named(&self, name: &str) -> Vec<AuditRecord> {
        self.records().into_iter().filter(|r| r.name == name).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn log(&self, record: &AuditRecord) {
        self.records.lock().expect("poisoned lock").push(record.clone());
    }
}

//------------ AuditEvent ----------------------------------------------------

/// An audit event in progress.
///
/// The event is written to its sink exactly once: when it is finished, or
/// as failed when it is dropped without being finished.
pub struct AuditEvent {
    sink: Arc<dyn AuditSink>,
    record: Option<AuditRecord>,
    timer: Instant,
}

impl AuditEvent {
    /// Starts an event. The message id is generated if not given.
    pub fn new(
        sink: Arc<dyn AuditSink>,
        started: DateTime<Utc>,
        name: &str,
        ca: &str,
        msg_id: Option<&str>,
    ) -> Self {
        let msg_id = msg_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        AuditEvent {
            sink,
            record: Some(AuditRecord {
                application: CERTA_AUDIT_APP,
                name: name.to_string(),
                ca: ca.to_string(),
                msg_id,
                started,
                duration_ms: 0,
                level: AuditLevel::Info,
                status: AuditStatus::Failed,
                data: Map::new(),
            }),
            timer: Instant::now(),
        }
    }

    pub fn msg_id(&self) -> &str {
        self.record.as_ref().map(|r| r.msg_id.as_str()).unwrap_or_default()
    }

    pub fn add(&mut self, key: &str, value: impl Serialize) {
        if let Some(record) = self.record.as_mut() {
            let value = serde_json::to_value(value).unwrap_or(Value::Null);
            record.data.insert(key.to_string(), value);
        }
    }

    pub fn finish(mut self, status: AuditStatus) {
        self.close(status);
    }

    /// Finishes the event according to the outcome of the operation.
    pub fn finish_with<T>(mut self, result: &CaResult<T>) {
        match result {
            Ok(_) => self.close(AuditStatus::Successful),
            Err(e) => {
                self.add("code", e.code().as_str());
                self.add("message", e.to_string());
                self.close(AuditStatus::Failed);
            }
        }
    }

    fn close(&mut self, status: AuditStatus) {
        if let Some(mut record) = self.record.take() {
            record.duration_ms = self.timer.elapsed().as_millis() as u64;
            record.status = status;
            record.level = match status {
                AuditStatus::Successful => AuditLevel::Info,
                AuditStatus::Failed => AuditLevel::Error,
            };
            self.sink.log(&record);
        }
    }
}

impl Drop for AuditEvent {
    fn drop(&mut self) {
        self.close(AuditStatus::Failed);
    }
}

//------------ Tests ---------------------------------------------------------
