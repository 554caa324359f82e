// =============================================================================
// Audit Log — append-only, hash-chained governance & decision history
// =============================================================================
//
// Records mode transitions, overrides, rollbacks and served decisions keyed
// by symbol + RFC 3339 timestamp. Every record carries
// `hash = sha256(prev_hash | seq | symbol | at | event_json)` so any edit or
// deletion in the middle of the file breaks the chain.
//
// The most recent records are kept in memory, with governance events in a
// ring of their own so decision traffic cannot evict them. The JSON-lines
// file sink is optional and stays open for the life of the log. Reopening an
// existing file resumes the chain from its last line.
// =============================================================================

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::decision_envelope::ServedFrom;
use crate::error::AuditChainError;
use crate::governance::{DegenerationReason, GovernanceMode};
use crate::types::{Action, Horizon};

/// Maximum number of records kept in memory.
const MAX_RECENT_RECORDS: usize = 500;
/// Maximum number of non-decision records kept in memory.
const MAX_RECENT_GOVERNANCE: usize = 500;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    ModeTransition {
        from: GovernanceMode,
        to: GovernanceMode,
        score: f64,
        reasons: Vec<DegenerationReason>,
    },
    Rollback {
        mode: GovernanceMode,
    },
    OverrideSet {
        requested: GovernanceMode,
        effective: GovernanceMode,
        reason: String,
        actor: String,
    },
    OverrideConflict {
        requested: Option<GovernanceMode>,
        effective: GovernanceMode,
    },
    OverrideCleared,
    Decision {
        decision_id: String,
        horizon: Horizon,
        served_from: ServedFrom,
        action: Action,
        confidence: f64,
        position_size: f64,
        #[serde(default)]
        blocking_layer: Option<String>,
    },
}

impl AuditEvent {
    pub fn is_decision(&self) -> bool {
        matches!(self, Self::Decision { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub seq: u64,
    pub symbol: String,
    pub at: String,
    pub event: AuditEvent,
    pub prev_hash: String,
    pub hash: String,
}

fn record_hash(prev_hash: &str, seq: u64, symbol: &str, at: &str, event: &AuditEvent) -> String {
    let event_json = serde_json::to_string(event).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(b"|");
    hasher.update(seq.to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(symbol.as_bytes());
    hasher.update(b"|");
    hasher.update(at.as_bytes());
    hasher.update(b"|");
    hasher.update(event_json.as_bytes());
    hex::encode(hasher.finalize())
}

/// Re-validate a contiguous run of records. The first record may link to any
/// predecessor; everything after it must chain.
pub fn verify_chain(records: &[AuditRecord]) -> Result<(), AuditChainError> {
    let mut prev: Option<&AuditRecord> = None;
    for rec in records {
        if record_hash(&rec.prev_hash, rec.seq, &rec.symbol, &rec.at, &rec.event) != rec.hash {
            return Err(AuditChainError::HashMismatch { seq: rec.seq });
        }
        if let Some(p) = prev {
            if rec.seq != p.seq + 1 {
                return Err(AuditChainError::SequenceGap {
                    prev: p.seq,
                    seq: rec.seq,
                });
            }
            if rec.prev_hash != p.hash {
                return Err(AuditChainError::BrokenLink { seq: rec.seq });
            }
        }
        prev = Some(rec);
    }
    Ok(())
}

/// Load every record from a JSON-lines audit file.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open audit log {}", path.display()))?;
    let mut out = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read audit log {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(&line)
            .with_context(|| format!("malformed audit record at line {}", idx + 1))?;
        out.push(rec);
    }
    Ok(out)
}

struct Inner {
    next_seq: u64,
    last_hash: String,
    recent: VecDeque<AuditRecord>,
    governance: VecDeque<AuditRecord>,
    sink: Option<BufWriter<File>>,
}

fn push_capped(ring: &mut VecDeque<AuditRecord>, record: AuditRecord, cap: usize) {
    ring.push_back(record);
    while ring.len() > cap {
        ring.pop_front();
    }
}

pub struct AuditLog {
    inner: Mutex<Inner>,
    path: Option<PathBuf>,
}

impl AuditLog {
    /// Memory-only log.
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_seq: 1,
                last_hash: GENESIS_HASH.to_string(),
                recent: VecDeque::new(),
                governance: VecDeque::new(),
                sink: None,
            }),
            path: None,
        }
    }

    /// Log backed by a JSON-lines file. An existing file is validated and the
    /// chain continues from its last record.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let log = Self {
            path: Some(path.clone()),
            ..Self::in_memory()
        };

        {
            let mut inner = log.inner.lock();
            if path.exists() {
                let records = read_records(&path)?;
                verify_chain(&records)
                    .with_context(|| format!("audit log {} failed verification", path.display()))?;
                if let Some(last) = records.last() {
                    inner.next_seq = last.seq + 1;
                    inner.last_hash = last.hash.clone();
                }
                for rec in records {
                    if !rec.event.is_decision() {
                        push_capped(&mut inner.governance, rec.clone(), MAX_RECENT_GOVERNANCE);
                    }
                    push_capped(&mut inner.recent, rec, MAX_RECENT_RECORDS);
                }
                info!(path = %path.display(), records = inner.next_seq - 1, "audit log resumed");
            } else {
                info!(path = %path.display(), "audit log created");
            }

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open audit log {}", path.display()))?;
            inner.sink = Some(BufWriter::new(file));
        }

        Ok(log)
    }

    /// Append an event. The record is written to the file sink (if any)
    /// before it becomes visible in memory.
    pub fn append(&self, symbol: &str, event: AuditEvent) -> Result<AuditRecord> {
        let mut inner = self.inner.lock();

        let seq = inner.next_seq;
        let at = Utc::now().to_rfc3339();
        let hash = record_hash(&inner.last_hash, seq, symbol, &at, &event);
        let record = AuditRecord {
            seq,
            symbol: symbol.to_string(),
            at,
            event,
            prev_hash: inner.last_hash.clone(),
            hash,
        };

        if let Some(sink) = inner.sink.as_mut() {
            let line = serde_json::to_string(&record).context("failed to serialise audit record")?;
            let display = self.path.as_deref().unwrap_or(Path::new("<audit>")).display();
            writeln!(sink, "{line}")
                .and_then(|_| sink.flush())
                .with_context(|| format!("failed to append to audit log {display}"))?;
        }

        inner.next_seq += 1;
        inner.last_hash = record.hash.clone();
        if !record.event.is_decision() {
            push_capped(&mut inner.governance, record.clone(), MAX_RECENT_GOVERNANCE);
        }
        push_capped(&mut inner.recent, record.clone(), MAX_RECENT_RECORDS);

        debug!(seq, symbol, "audit record appended");
        Ok(record)
    }

    /// Most recent records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        let inner = self.inner.lock();
        let skip = inner.recent.len().saturating_sub(limit);
        inner.recent.iter().skip(skip).cloned().collect()
    }

    /// Most recent non-decision records (transitions, overrides, rollbacks),
    /// oldest first.
    pub fn recent_governance(&self, limit: usize) -> Vec<AuditRecord> {
        let inner = self.inner.lock();
        let skip = inner.governance.len().saturating_sub(limit);
        inner.governance.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> u64 {
        self.inner.lock().next_seq - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition() -> AuditEvent {
        AuditEvent::ModeTransition {
            from: GovernanceMode::Normal,
            to: GovernanceMode::ProtectionMode,
            score: 0.52,
            reasons: vec![DegenerationReason::DriftCritical],
        }
    }

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("aurora-audit-{}.jsonl", uuid::Uuid::new_v4()))
    }

    #[test]
    fn records_chain_in_memory() {
        let log = AuditLog::in_memory();
        let a = log.append("BTCUSDT", transition()).unwrap();
        let b = log.append("BTCUSDT", AuditEvent::OverrideCleared).unwrap();
        assert_eq!(a.prev_hash, GENESIS_HASH);
        assert_eq!(b.prev_hash, a.hash);
        assert_eq!(b.seq, 2);
        assert!(verify_chain(&log.recent(10)).is_ok());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn tampering_is_detected() {
        let log = AuditLog::in_memory();
        log.append("BTCUSDT", transition()).unwrap();
        log.append("ETHUSDT", AuditEvent::OverrideCleared).unwrap();
        log.append("ETHUSDT", AuditEvent::Rollback {
            mode: GovernanceMode::ProtectionMode,
        })
        .unwrap();

        let mut records = log.recent(10);
        records[1].symbol = "SOLUSDT".into();
        assert_eq!(
            verify_chain(&records),
            Err(AuditChainError::HashMismatch { seq: 2 })
        );

        let mut records = log.recent(10);
        records.remove(1);
        assert!(verify_chain(&records).is_err());
    }

    #[test]
    fn file_sink_resumes_chain() {
        let path = temp_path();
        {
            let log = AuditLog::open(&path).unwrap();
            log.append("BTCUSDT", transition()).unwrap();
            log.append("BTCUSDT", AuditEvent::OverrideCleared).unwrap();
        }
        let log = AuditLog::open(&path).unwrap();
        assert_eq!(log.len(), 2);
        let next = log.append("BTCUSDT", AuditEvent::OverrideCleared).unwrap();
        assert_eq!(next.seq, 3);

        let on_disk = read_records(&path).unwrap();
        assert_eq!(on_disk.len(), 3);
        assert!(verify_chain(&on_disk).is_ok());
        let _ = std::fs::remove_file(&path);
    }

    fn decision(n: usize) -> AuditEvent {
        AuditEvent::Decision {
            decision_id: format!("d-{n}"),
            horizon: Horizon::Short,
            served_from: ServedFrom::Fresh,
            action: Action::Buy,
            confidence: 0.6,
            position_size: 0.5,
            blocking_layer: None,
        }
    }

    #[test]
    fn governance_records_survive_decision_churn() {
        let log = AuditLog::in_memory();
        log.append("BTCUSDT", transition()).unwrap();
        for n in 0..MAX_RECENT_RECORDS + 100 {
            log.append("BTCUSDT", decision(n)).unwrap();
        }

        assert!(log
            .recent(MAX_RECENT_RECORDS)
            .iter()
            .all(|r| r.event.is_decision()));
        let governance = log.recent_governance(10);
        assert_eq!(governance.len(), 1);
        assert_eq!(governance[0].seq, 1);
        assert_eq!(governance[0].event, transition());
    }

    #[test]
    fn reopened_log_restores_governance_ring() {
        let path = temp_path();
        {
            let log = AuditLog::open(&path).unwrap();
            log.append("ETHUSDT", AuditEvent::OverrideCleared).unwrap();
            log.append("ETHUSDT", decision(1)).unwrap();
        }
        let log = AuditLog::open(&path).unwrap();
        let governance = log.recent_governance(10);
        assert_eq!(governance.len(), 1);
        assert_eq!(governance[0].event, AuditEvent::OverrideCleared);
        assert_eq!(log.recent(10).len(), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn recent_is_bounded_and_ordered() {
        let log = AuditLog::in_memory();
        for _ in 0..5 {
            log.append("BTCUSDT", AuditEvent::OverrideCleared).unwrap();
        }
        let last_two = log.recent(2);
        assert_eq!(last_two.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![4, 5]);
    }
}
