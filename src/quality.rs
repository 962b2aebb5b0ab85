//! Output quality gate.
//!
//! Scores a finished session on four dimensions and passes only when
//! every dimension clears the threshold strictly. The verdict is itself
//! an event, so downstream consumers can audit why a session failed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::CoordinationConfig;
use crate::consensus::ConsensusRecord;
use crate::error::CoordinationResult;
use crate::events::{
    AgentId, EventDraft, EventFilter, EventType, Performative, SharedEventLog,
};

/// Source agent id used for gate-authored events.
const GATE_AGENT: &str = "quality_gate";

/// Verdict of one gate evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReport {
    pub session_id: String,
    /// True only when every dimension strictly exceeds the threshold.
    pub passed: bool,
    /// Mean confidence of surviving contributions.
    pub contribution_quality: f32,
    /// Fraction of consensus processes that reached a usable outcome.
    pub consensus_integrity: f32,
    /// Inverse variance of per-agent task counts.
    pub participation_fairness: f32,
    /// Fraction of contributions not superseded by corrections.
    pub context_coherence: f32,
    /// One entry per failing dimension.
    pub issues: Vec<String>,
}

/// Validates a session's output before synthesis is released.
pub struct QualityGate {
    log: SharedEventLog,
    config: CoordinationConfig,
}

impl QualityGate {
    pub fn new(log: SharedEventLog, config: CoordinationConfig) -> Self {
        Self { log, config }
    }

    /// Evaluate a session and append the verdict to its log.
    pub fn validate(
        &self,
        session_id: &str,
        consensus_records: &[ConsensusRecord],
        assignments: &BTreeMap<String, AgentId>,
    ) -> CoordinationResult<QualityReport> {
        let contributions = self.log.query(
            session_id,
            &EventFilter::new().types(vec![EventType::Contribution]),
            0,
        )?;
        let all_events = self.log.query(session_id, &EventFilter::new(), 0)?;

        // An event is superseded once any later event names it as parent.
        let superseded: Vec<&str> = all_events
            .iter()
            .filter_map(|e| e.parent_event_id.as_deref())
            .collect();
        let surviving: Vec<_> = contributions
            .iter()
            .filter(|e| !superseded.contains(&e.id.as_str()))
            .collect();

        let contribution_quality = {
            let confidences: Vec<f32> = surviving
                .iter()
                .filter_map(|e| e.payload_f64("confidence"))
                .map(|c| c as f32)
                .collect();
            if confidences.is_empty() {
                1.0
            } else {
                confidences.iter().sum::<f32>() / confidences.len() as f32
            }
        };

        let consensus_integrity = if consensus_records.is_empty() {
            1.0
        } else {
            let usable = consensus_records
                .iter()
                .filter(|r| r.status.is_success())
                .count();
            usable as f32 / consensus_records.len() as f32
        };

        let participation_fairness = if assignments.is_empty() {
            1.0
        } else {
            let mut per_agent: BTreeMap<&str, u32> = BTreeMap::new();
            for agent_id in assignments.values() {
                *per_agent.entry(agent_id.as_str()).or_default() += 1;
            }
            let counts: Vec<f32> = per_agent.values().map(|c| *c as f32).collect();
            let mean = counts.iter().sum::<f32>() / counts.len() as f32;
            let variance =
                counts.iter().map(|c| (c - mean).powi(2)).sum::<f32>() / counts.len() as f32;
            1.0 / (1.0 + variance)
        };

        let context_coherence = if contributions.is_empty() {
            1.0
        } else {
            surviving.len() as f32 / contributions.len() as f32
        };

        let threshold = self.config.quality_threshold;
        let mut issues = Vec::new();
        for (name, score) in [
            ("contribution_quality", contribution_quality),
            ("consensus_integrity", consensus_integrity),
            ("participation_fairness", participation_fairness),
            ("context_coherence", context_coherence),
        ] {
            if score <= threshold {
                issues.push(format!("{name} {score:.2} at or below threshold {threshold}"));
            }
        }
        let passed = issues.is_empty();

        let report = QualityReport {
            session_id: session_id.to_string(),
            passed,
            contribution_quality,
            consensus_integrity,
            participation_fairness,
            context_coherence,
            issues,
        };

        if passed {
            info!(session_id, "Quality gate passed");
        } else {
            warn!(session_id, issues = ?report.issues, "Quality gate failed");
        }

        self.log.append(
            EventDraft::new(
                session_id,
                EventType::ValidationResult,
                Performative::Assert,
                GATE_AGENT,
            )
            .payload(serde_json::to_value(&report).unwrap_or_default()),
        )?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusStatus;
    use crate::events::EventLog;

    fn gate() -> (QualityGate, SharedEventLog) {
        let log = EventLog::new().shared();
        log.open_session("s-1");
        (
            QualityGate::new(log.clone(), CoordinationConfig::default()),
            log,
        )
    }

    fn contribution(log: &SharedEventLog, agent: &str, confidence: f64) -> String {
        log.append(
            EventDraft::new(
                "s-1",
                EventType::Contribution,
                Performative::Inform,
                agent,
            )
            .payload(serde_json::json!({ "content": "x", "confidence": confidence })),
        )
        .unwrap()
        .event_id
    }

    fn record(status: ConsensusStatus) -> ConsensusRecord {
        let mut r = ConsensusRecord::new("s-1", "t", &["a-1".to_string()]);
        if status.is_terminal() {
            r.finalize(status, Some("x".to_string())).unwrap();
        }
        r
    }

    #[test]
    fn test_clean_session_passes() {
        let (gate, log) = gate();
        contribution(&log, "a-1", 0.9);
        contribution(&log, "a-2", 0.8);

        let mut assignments = BTreeMap::new();
        assignments.insert("t-1".to_string(), "a-1".to_string());
        assignments.insert("t-2".to_string(), "a-2".to_string());

        let report = gate
            .validate("s-1", &[record(ConsensusStatus::Converged)], &assignments)
            .unwrap();

        assert!(report.passed);
        assert!(report.issues.is_empty());
        assert!(report.contribution_quality > 0.8);
        assert_eq!(report.participation_fairness, 1.0);
    }

    #[test]
    fn test_empty_session_trivially_passes() {
        let (gate, _log) = gate();
        let report = gate.validate("s-1", &[], &BTreeMap::new()).unwrap();
        assert!(report.passed);
        assert_eq!(report.contribution_quality, 1.0);
        assert_eq!(report.context_coherence, 1.0);
    }

    #[test]
    fn test_failed_consensus_breaks_integrity() {
        let (gate, _log) = gate();
        let records = vec![
            record(ConsensusStatus::Failed),
            record(ConsensusStatus::Failed),
            record(ConsensusStatus::Converged),
        ];

        let report = gate.validate("s-1", &records, &BTreeMap::new()).unwrap();
        assert!(!report.passed);
        assert!(report.consensus_integrity < 0.4);
        assert!(report
            .issues
            .iter()
            .any(|i| i.contains("consensus_integrity")));
    }

    #[test]
    fn test_arbitrated_counts_as_usable() {
        let (gate, _log) = gate();
        let report = gate
            .validate("s-1", &[record(ConsensusStatus::Arbitrated)], &BTreeMap::new())
            .unwrap();
        assert_eq!(report.consensus_integrity, 1.0);
    }

    #[test]
    fn test_superseded_contributions_hurt_coherence() {
        let (gate, log) = gate();
        let first = contribution(&log, "a-1", 0.9);
        // A correction superseding the first contribution.
        log.append(
            EventDraft::new(
                "s-1",
                EventType::Contribution,
                Performative::Inform,
                "a-1",
            )
            .parent(&first)
            .payload(serde_json::json!({ "content": "corrected", "confidence": 0.9 })),
        )
        .unwrap();

        let report = gate.validate("s-1", &[], &BTreeMap::new()).unwrap();
        assert!((report.context_coherence - 0.5).abs() < 1e-6);
        assert!(!report.passed);
    }

    #[test]
    fn test_skewed_assignments_hurt_fairness() {
        let (gate, _log) = gate();
        let mut assignments = BTreeMap::new();
        for i in 0..6 {
            assignments.insert(format!("t-{i}"), "a-1".to_string());
        }
        assignments.insert("t-9".to_string(), "a-2".to_string());

        let report = gate.validate("s-1", &[], &assignments).unwrap();
        assert!(report.participation_fairness < 0.6);
        assert!(report
            .issues
            .iter()
            .any(|i| i.contains("participation_fairness")));
    }

    #[test]
    fn test_verdict_is_logged() {
        let (gate, log) = gate();
        gate.validate("s-1", &[], &BTreeMap::new()).unwrap();

        let verdicts = log
            .query(
                "s-1",
                &EventFilter::new().types(vec![EventType::ValidationResult]),
                0,
            )
            .unwrap();
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].payload["passed"], serde_json::json!(true));
    }
}
