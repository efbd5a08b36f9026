use std::collections::BTreeMap;

use crate::core::job::{DegradedProbe, Finding, Severity};
use crate::error::ProbeError;

/// What one probe produced for one job.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    /// Registration index of the probe; the aggregation sort key.
    pub index: usize,
    pub probe: String,
    pub outcome: Result<Vec<Finding>, ProbeError>,
    pub elapsed_ms: u128,
}

/// Combines probe reports into one ordered finding sequence.
///
/// Order is registration index first, then each probe's own emission order.
/// Nothing is de-duplicated: the same-looking finding from two probes has
/// different provenance and is kept twice. Reports may arrive in any order.
#[derive(Debug, Default)]
pub struct FindingAggregator {
    reports: Vec<ProbeReport>,
}

impl FindingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, report: ProbeReport) {
        self.reports.push(report);
    }

    /// Findings in aggregation order plus a marker per degraded probe.
    pub fn finish(mut self) -> (Vec<Finding>, Vec<DegradedProbe>) {
        self.reports.sort_by_key(|r| r.index);

        let mut findings = Vec::new();
        let mut degraded = Vec::new();
        for report in self.reports {
            match report.outcome {
                Ok(found) => findings.extend(found),
                Err(e) => degraded.push(DegradedProbe {
                    probe: report.probe,
                    reason: e.to_string(),
                }),
            }
        }
        (findings, degraded)
    }
}

/// Finding counts per severity, highest first.
pub fn severity_summary(findings: &[Finding]) -> Vec<(Severity, usize)> {
    let mut counts: BTreeMap<Severity, usize> = BTreeMap::new();
    for f in findings {
        *counts.entry(f.severity).or_default() += 1;
    }
    counts.into_iter().rev().collect()
}
