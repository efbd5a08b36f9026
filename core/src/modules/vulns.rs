use std::collections::HashSet;

use async_trait::async_trait;
use url::Url;

use super::{require_host, Probe};
use crate::core::job::{Finding, Severity};
use crate::error::ProbeError;
use crate::ScanConfig;

struct Signature {
    kind: &'static str,
    params: &'static [&'static str],
    severity: Severity,
    remediation: &'static str,
}

const SIGNATURES: &[Signature] = &[
    Signature {
        kind: "XSS",
        params: &["search", "q", "query", "message", "comment"],
        severity: Severity::Medium,
        remediation: "Sanitize and escape user input before rendering it in pages.",
    },
    Signature {
        kind: "SQLi",
        params: &["id", "uid", "user_id", "order", "sort"],
        severity: Severity::High,
        remediation: "Use parameterized queries or an ORM instead of string-built SQL.",
    },
    Signature {
        kind: "Open Redirect",
        params: &["redirect", "url", "next", "return", "returnto"],
        severity: Severity::Medium,
        remediation: "Only redirect to relative paths or an allow-list of hosts.",
    },
    Signature {
        kind: "Path Traversal",
        params: &["file", "path", "page", "template"],
        severity: Severity::High,
        remediation: "Resolve user-supplied paths against a fixed base directory and reject '..' segments.",
    },
    Signature {
        kind: "Command Injection",
        params: &["cmd", "exec", "command", "host"],
        severity: Severity::Critical,
        remediation: "Never pass request data to a shell; call binaries with an argument vector.",
    },
];

/// Parameters every scan checks regardless of what the target URL carries.
const BASELINE_PARAMS: &[&str] = &["search", "id"];

fn signature_for(param: &str) -> Option<&'static Signature> {
    let lower = param.to_ascii_lowercase();
    SIGNATURES.iter().find(|s| s.params.contains(&lower.as_str()))
}

/// Signature checks against well-known injectable parameters.
pub struct VulnerabilityChecks;

#[async_trait]
impl Probe for VulnerabilityChecks {
    fn name(&self) -> &'static str {
        "vulns"
    }

    async fn probe(&self, target: &Url, _config: &ScanConfig) -> Result<Vec<Finding>, ProbeError> {
        require_host(target, self.name())?;

        let query_params = target.query_pairs().map(|(k, _)| k.into_owned());
        let candidates = BASELINE_PARAMS.iter().map(|p| p.to_string()).chain(query_params);

        let mut seen = HashSet::new();
        let mut findings = Vec::new();
        for param in candidates {
            let Some(sig) = signature_for(&param) else { continue };
            if !seen.insert((sig.kind, param.to_ascii_lowercase())) {
                continue;
            }
            findings.push(Finding::new(
                sig.kind,
                param.clone(),
                sig.severity,
                format!("{} vulnerability detected in {} parameter.", sig.kind, param),
                sig.remediation,
            ));
        }
        Ok(findings)
    }
}
