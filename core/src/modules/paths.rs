use async_trait::async_trait;
use url::Url;

use super::{require_host, Probe};
use crate::core::job::{Finding, Severity};
use crate::error::ProbeError;
use crate::ScanConfig;

struct PathSignature {
    path: &'static str,
    severity: Severity,
    description: &'static str,
    remediation: &'static str,
}

/// Known sensitive locations. Depth of a path is its segment count.
const SIGNATURES: &[PathSignature] = &[
    PathSignature {
        path: ".env",
        severity: Severity::Critical,
        description: "Environment file with secrets is served to clients.",
        remediation: "Move environment files outside the web root and rotate any exposed credentials.",
    },
    PathSignature {
        path: ".git/",
        severity: Severity::High,
        description: "Git metadata directory is exposed, allowing source reconstruction.",
        remediation: "Block access to VCS directories at the web server and deploy build artifacts only.",
    },
    PathSignature {
        path: "admin/",
        severity: Severity::Low,
        description: "Administrative interface is reachable from the public network.",
        remediation: "Restrict the admin panel by network policy or an additional authentication layer.",
    },
    PathSignature {
        path: "backup/",
        severity: Severity::Medium,
        description: "Backup directory is exposed.",
        remediation: "Store backups outside the web root and disable directory listing.",
    },
    PathSignature {
        path: ".git/config",
        severity: Severity::High,
        description: "Git configuration is readable and may leak remote URLs or credentials.",
        remediation: "Block access to VCS directories at the web server.",
    },
    PathSignature {
        path: "backup/db.sql",
        severity: Severity::Critical,
        description: "Database dump is downloadable.",
        remediation: "Remove the dump, store backups offline and rotate database credentials.",
    },
    PathSignature {
        path: "admin/config/settings.php",
        severity: Severity::High,
        description: "Application settings file is reachable under the admin tree.",
        remediation: "Deny direct requests to configuration files.",
    },
];

fn path_depth(path: &str) -> u32 {
    path.trim_end_matches('/').split('/').count() as u32
}

/// Directory and file discovery relative to the target path, `depth` levels deep.
pub struct PathDiscovery;

#[async_trait]
impl Probe for PathDiscovery {
    fn name(&self) -> &'static str {
        "paths"
    }

    async fn probe(&self, target: &Url, config: &ScanConfig) -> Result<Vec<Finding>, ProbeError> {
        require_host(target, self.name())?;

        // Resolve candidates against the target's directory, not its last segment.
        let mut base = target.clone();
        base.set_query(None);
        base.set_fragment(None);
        if !base.path().ends_with('/') {
            let dir = format!("{}/", base.path());
            base.set_path(&dir);
        }

        let mut findings = Vec::new();
        for sig in SIGNATURES.iter().filter(|s| path_depth(s.path) <= config.depth) {
            let url = base
                .join(sig.path)
                .map_err(|e| ProbeError::MalformedTarget(format!("paths: {e}")))?;
            findings.push(Finding::new(
                "Sensitive Path",
                url.to_string(),
                sig.severity,
                sig.description,
                sig.remediation,
            ));
        }
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(url: &str, depth: u32) -> Vec<Finding> {
        let config = ScanConfig { depth, ..ScanConfig::default() };
        PathDiscovery.probe(&Url::parse(url).unwrap(), &config).await.unwrap()
    }

    #[test]
    fn test_path_depth() {
        assert_eq!(path_depth(".env"), 1);
        assert_eq!(path_depth(".git/"), 1);
        assert_eq!(path_depth("backup/db.sql"), 2);
    }

    #[tokio::test]
    async fn test_depth_limits_candidates() {
        assert_eq!(run("https://example.com", 1).await.len(), 4);
        assert_eq!(run("https://example.com", 2).await.len(), 6);
        assert_eq!(run("https://example.com", 3).await.len(), 7);
    }

    #[tokio::test]
    async fn test_paths_resolve_under_target_directory() {
        let findings = run("https://example.com/app?x=1", 1).await;
        assert_eq!(findings[0].parameter, "https://example.com/app/.env");
    }
}
