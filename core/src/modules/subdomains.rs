use std::net::IpAddr;

use async_trait::async_trait;
use url::Url;

use super::{require_host, Probe};
use crate::core::job::{Finding, Severity};
use crate::error::ProbeError;
use crate::ScanConfig;

/// Wordlist tiers, widened one tier per depth level.
const WORDLIST: &[&[&str]] = &[
    &["dev", "test"],
    &["staging", "admin", "api"],
    &["beta", "internal", "old", "vpn"],
];

pub struct SubdomainEnumeration;

/// Apex domain the wordlist is applied to. Strips a leading `www.`.
fn base_domain(host: &str) -> Result<&str, ProbeError> {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    if trimmed.parse::<IpAddr>().is_ok() {
        return Err(ProbeError::MalformedTarget(format!(
            "subdomains: {host} is an IP address, not a domain"
        )));
    }
    let domain = host.strip_prefix("www.").unwrap_or(host);
    if !domain.contains('.') {
        return Err(ProbeError::MalformedTarget(format!(
            "subdomains: {host} has no parent domain"
        )));
    }
    Ok(domain)
}

#[async_trait]
impl Probe for SubdomainEnumeration {
    fn name(&self) -> &'static str {
        "subdomains"
    }

    async fn probe(&self, target: &Url, config: &ScanConfig) -> Result<Vec<Finding>, ProbeError> {
        let host = require_host(target, self.name())?;
        let domain = base_domain(host)?;

        let tiers = (config.depth.max(1) as usize).min(WORDLIST.len());
        let findings = WORDLIST[..tiers]
            .iter()
            .flat_map(|tier| tier.iter())
            .map(|prefix| {
                let sub = format!("{prefix}.{domain}");
                Finding::new(
                    "Subdomain",
                    sub.clone(),
                    Severity::Low,
                    format!("Wordlist candidate {sub} enumerated for {domain}."),
                    "Confirm the host is meant to be public; decommission stale environments and remove dangling DNS records.",
                )
            })
            .collect();

        Ok(findings)
    }
}
