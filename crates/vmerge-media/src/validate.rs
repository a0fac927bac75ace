//! Request admission and aggregate duration checks.
//!
//! Checks run fail-fast in a fixed order: clip count, URL format, then total
//! duration. Count and URL format are checked before any network traffic;
//! the duration ceiling is checked only once every clip has been probed so
//! the reported total is complete.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

use regex::Regex;
use url::{Host, Url};

use vmerge_models::{
    ClipMetadata, ClipRequest, MAX_CLIPS, MAX_TOTAL_DURATION_SECS, MAX_TRANSITION_SECS, MIN_CLIPS,
    MIN_TRANSITION_SECS,
};

use crate::error::{ValidationConstraint, ValidationError};

/// Maximum accepted URL length.
pub const MAX_URL_LENGTH: usize = 2048;

/// Host names that resolve to internal services.
static BLOCKED_HOST_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"^localhost$").unwrap(),
        Regex::new(r"\.localhost$").unwrap(),
        Regex::new(r"^metadata\.").unwrap(),
        Regex::new(r"^metadata\.google\.internal$").unwrap(),
        Regex::new(r"\.internal$").unwrap(),
    ]
});

fn is_internal_ipv4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_broadcast()
        // 0.0.0.0/8 "this network"
        || a == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (a == 100 && (b & 0xc0) == 64)
        // 198.18.0.0/15 benchmarking
        || (a == 198 && (b & 0xfe) == 18)
}

fn is_internal_ipv6(ip: &Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_internal_ipv4(&v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // fc00::/7 unique local
        || (first & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (first & 0xffc0) == 0xfe80
}

/// Whether `ip` belongs to a loopback, private or otherwise non-public range.
pub(crate) fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_internal_ipv4(v4),
        IpAddr::V6(v6) => is_internal_ipv6(v6),
    }
}

/// Literal host check. Names are not resolved here; the fetcher screens
/// resolved addresses separately.
pub(crate) fn is_internal_host(host: &Host<&str>) -> bool {
    match host {
        Host::Ipv4(ip) => is_internal_ipv4(ip),
        Host::Ipv6(ip) => is_internal_ipv6(ip),
        Host::Domain(name) => {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            if let Ok(ip) = name.parse::<IpAddr>() {
                return is_internal_ip(&ip);
            }
            BLOCKED_HOST_PATTERNS.iter().any(|p| p.is_match(&name))
        }
    }
}

/// Enforces clip-count, URL and duration constraints.
#[derive(Debug, Clone)]
pub struct DurationValidator {
    min_clips: usize,
    max_clips: usize,
    max_total_seconds: f64,
    allow_private_hosts: bool,
}

impl Default for DurationValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl DurationValidator {
    pub fn new() -> Self {
        Self {
            min_clips: MIN_CLIPS,
            max_clips: MAX_CLIPS,
            max_total_seconds: MAX_TOTAL_DURATION_SECS,
            allow_private_hosts: false,
        }
    }

    /// Permit loopback and private-network hosts (local development only).
    pub fn allow_private_hosts(mut self, allow: bool) -> Self {
        self.allow_private_hosts = allow;
        self
    }

    pub fn max_total_seconds(&self) -> f64 {
        self.max_total_seconds
    }

    pub fn check_count(&self, count: usize) -> Result<(), ValidationError> {
        if count < self.min_clips || count > self.max_clips {
            return Err(ValidationError::new(
                ValidationConstraint::ClipCount,
                format!(
                    "video_urls must contain between {} and {} URLs (got {})",
                    self.min_clips, self.max_clips, count
                ),
            ));
        }
        Ok(())
    }

    pub fn check_url(&self, request: &ClipRequest) -> Result<(), ValidationError> {
        let invalid = |msg: String| {
            ValidationError::new(
                ValidationConstraint::UrlFormat,
                format!("Clip {}: {}", request.position, msg),
            )
            .at(request.position)
        };

        let raw = request.url.trim();
        if raw.is_empty() {
            return Err(invalid("URL cannot be empty".to_string()));
        }
        if raw.len() > MAX_URL_LENGTH {
            return Err(invalid(format!(
                "URL exceeds maximum length of {} characters",
                MAX_URL_LENGTH
            )));
        }

        let url = Url::parse(raw).map_err(|e| invalid(format!("invalid URL: {}", e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "unsupported protocol '{}', only http and https are allowed",
                url.scheme()
            )));
        }

        let host = url
            .host()
            .ok_or_else(|| invalid("URL has no host".to_string()))?;
        if !self.allow_private_hosts && is_internal_host(&host) {
            return Err(invalid("URL targets an internal address".to_string()));
        }

        Ok(())
    }

    /// Admission checks that run before any fetch: count, then each URL in
    /// position order.
    pub fn check_requests(&self, requests: &[ClipRequest]) -> Result<(), ValidationError> {
        self.check_count(requests.len())?;

        let mut ordered: Vec<&ClipRequest> = requests.iter().collect();
        ordered.sort_by_key(|r| r.position);
        for request in ordered {
            self.check_url(request)?;
        }
        Ok(())
    }

    /// Aggregate checks over every probed clip. Returns the measured total.
    pub fn validate(&self, clips: &[ClipMetadata]) -> Result<f64, ValidationError> {
        self.check_count(clips.len())?;

        let total: f64 = clips.iter().map(|c| c.duration_seconds).sum();
        if !total.is_finite() || total > self.max_total_seconds {
            return Err(ValidationError::new(
                ValidationConstraint::TotalDuration,
                format!(
                    "Total duration {:.1}s exceeds the limit of {:.0}s",
                    total, self.max_total_seconds
                ),
            )
            .with_total(total));
        }

        Ok(total)
    }

    pub fn check_transition(&self, seconds: f64) -> Result<(), ValidationError> {
        if !(MIN_TRANSITION_SECS..=MAX_TRANSITION_SECS).contains(&seconds) {
            return Err(ValidationError::new(
                ValidationConstraint::TransitionRange,
                format!(
                    "transition_duration must be between {} and {} seconds (got {})",
                    MIN_TRANSITION_SECS, MAX_TRANSITION_SECS, seconds
                ),
            ));
        }
        Ok(())
    }
}
