use std::ops::RangeInclusive;

use async_trait::async_trait;
use url::Url;

use super::{require_host, Probe};
use crate::core::job::{Finding, Severity};
use crate::error::ProbeError;
use crate::ScanConfig;

const COMMON_PORTS: &[u16] = &[21, 22, 23, 25, 53, 80, 110, 143, 443, 3306, 5432, 6379, 8080];

/// Port sweep whose breadth grows with scan depth.
pub struct PortDiscovery;

/// Ports covered at a given depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSet {
    Common,
    Range(RangeInclusive<u16>),
}

impl PortSet {
    pub fn for_depth(depth: u32) -> Self {
        match depth {
            0 | 1 => PortSet::Common,
            2 => PortSet::Range(1..=1000),
            _ => PortSet::Range(1..=65535),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        match self {
            PortSet::Common => COMMON_PORTS.contains(&port),
            PortSet::Range(r) => r.contains(&port),
        }
    }
}

fn service_name(port: u16) -> &'static str {
    match port {
        21 => "ftp",
        22 => "ssh",
        23 => "telnet",
        25 => "smtp",
        53 => "dns",
        80 => "http",
        110 => "pop3",
        143 => "imap",
        443 => "https",
        3306 => "mysql",
        5432 => "postgresql",
        6379 => "redis",
        8080 => "http-alt",
        _ => "unknown",
    }
}

#[async_trait]
impl Probe for PortDiscovery {
    fn name(&self) -> &'static str {
        "ports"
    }

    async fn probe(&self, target: &Url, config: &ScanConfig) -> Result<Vec<Finding>, ProbeError> {
        let host = require_host(target, self.name())?;
        let port = target
            .port_or_known_default()
            .ok_or_else(|| ProbeError::MalformedTarget(format!("ports: no port for scheme '{}'", target.scheme())))?;

        if !PortSet::for_depth(config.depth).contains(port) {
            return Ok(Vec::new());
        }

        let service = service_name(port);
        let finding = if port == 80 || port == 443 {
            Finding::new(
                "Open Port",
                format!("{port}/tcp"),
                Severity::Low,
                format!("Port {port} ({service}) is open on {host}."),
                "Expose only the ports the application needs and filter the rest at the firewall.",
            )
        } else {
            Finding::new(
                "Non-standard Port",
                format!("{port}/tcp"),
                Severity::Medium,
                format!("Web service on {host} is reachable on non-standard port {port} ({service})."),
                "Serve the application behind a reverse proxy on 443 and close direct access to the backend port.",
            )
        };

        Ok(vec![finding])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(url: &str, depth: u32) -> Result<Vec<Finding>, ProbeError> {
        let config = ScanConfig { depth, ..ScanConfig::default() };
        PortDiscovery.probe(&Url::parse(url).unwrap(), &config).await
    }

    #[tokio::test]
    async fn test_default_https_port() {
        let findings = run("https://example.com", 1).await.unwrap();
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].parameter, "443/tcp");
        assert_eq!(findings[0].severity, Severity::Low);
    }

    #[tokio::test]
    async fn test_depth_widens_sweep() {
        assert!(run("http://example.com:9000", 1).await.unwrap().is_empty());
        assert!(run("http://example.com:9000", 2).await.unwrap().is_empty());
        let deep = run("http://example.com:9000", 3).await.unwrap();
        assert_eq!(deep[0].severity, Severity::Medium);
        assert_eq!(run("http://example.com:8080", 1).await.unwrap().len(), 1);
    }
}
