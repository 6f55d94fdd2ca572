use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::oracle::MalwareOracle;

/// A dependency change a resolver predicts the child command will make.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageChange {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Change,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisallowedChange {
    pub change: PackageChange,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct AuditResult {
    pub allowed: Vec<PackageChange>,
    pub disallowed: Vec<DisallowedChange>,
}

impl AuditResult {
    pub fn is_allowed(&self) -> bool {
        self.disallowed.is_empty()
    }
}

static AUDITED_TOTAL: AtomicU64 = AtomicU64::new(0);
static AUDITED_SAFE: AtomicU64 = AtomicU64::new(0);
static AUDITED_MALWARE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditCounters {
    pub total: u64,
    pub safe: u64,
    pub malware: u64,
}

pub fn counters_snapshot() -> AuditCounters {
    AuditCounters {
        total: AUDITED_TOTAL.load(Ordering::Relaxed),
        safe: AUDITED_SAFE.load(Ordering::Relaxed),
        malware: AUDITED_MALWARE.load(Ordering::Relaxed),
    }
}

#[inline]
fn record_safe() {
    AUDITED_TOTAL.fetch_add(1, Ordering::Relaxed);
    AUDITED_SAFE.fetch_add(1, Ordering::Relaxed);
}

#[inline]
fn record_malware() {
    AUDITED_TOTAL.fetch_add(1, Ordering::Relaxed);
    AUDITED_MALWARE.fetch_add(1, Ordering::Relaxed);
}

/// Check predicted changes against the oracle. Removals never consult it:
/// taking a package out cannot install malware, and they stay out of the
/// counters.
pub fn audit_changes(oracle: &dyn MalwareOracle, changes: &[PackageChange]) -> AuditResult {
    let mut result = AuditResult::default();
    for change in changes {
        if change.kind == ChangeKind::Remove {
            result.allowed.push(change.clone());
            continue;
        }
        if oracle.is_malware(&change.name, &change.version) {
            record_malware();
            result.disallowed.push(DisallowedChange {
                change: change.clone(),
                reason: "known malicious version".to_string(),
            });
        } else {
            record_safe();
            result.allowed.push(change.clone());
        }
    }
    result
}

/// Serializes tests that assert on the process-wide counters.
#[cfg(test)]
pub(crate) static COUNTER_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
