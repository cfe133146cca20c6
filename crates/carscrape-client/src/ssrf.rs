//! Target address checks shared by every fetcher.

use std::net::IpAddr;

use carscrape_core::error::AppError;
use url::{Host, Url};

/// Reject URLs a scrape must not reach.
///
/// Only `http`/`https` are accepted, and every address the host resolves to
/// must be public. A rejection is [`AppError::InvalidTarget`] so the job
/// fails without retrying; a failed lookup stays a transient network error.
pub(crate) async fn check_target(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url)
        .map_err(|e| AppError::InvalidTarget(format!("Invalid URL {url}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AppError::InvalidTarget(format!(
            "Unsupported scheme '{}' in {url}",
            parsed.scheme()
        )));
    }

    let addrs: Vec<IpAddr> = match parsed.host() {
        Some(Host::Ipv4(ip)) => vec![IpAddr::V4(ip)],
        Some(Host::Ipv6(ip)) => vec![IpAddr::V6(ip)],
        Some(Host::Domain(domain)) => {
            let port = parsed.port_or_known_default().unwrap_or(80);
            tokio::net::lookup_host((domain, port))
                .await
                .map_err(|e| AppError::NetworkError(format!("DNS lookup failed for {domain}: {e}")))?
                .map(|addr| addr.ip())
                .collect()
        }
        None => return Err(AppError::InvalidTarget(format!("{url} has no host"))),
    };

    if let Some(ip) = addrs.iter().copied().find(|ip| is_internal(*ip)) {
        return Err(AppError::InvalidTarget(format!(
            "{url} points at internal address {ip}"
        )));
    }
    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!("No addresses found for {url}")));
    }
    Ok(())
}

/// Loopback, private, link-local (cloud metadata), carrier-grade NAT and
/// other non-routable ranges. IPv4-mapped IPv6 is judged by its IPv4 part.
fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_documentation()
                || (a == 100 && (64..128).contains(&b))
        }
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_internal(IpAddr::V4(v4)),
            None => {
                v6.is_loopback()
                    || v6.is_unspecified()
                    || v6.is_unicast_link_local()
                    || v6.is_unique_local()
            }
        },
    }
}
