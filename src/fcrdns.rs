// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! FCrDNS Verifier (C7). Forward-confirmed reverse-DNS: a PTR lookup of the
//! IP followed by a forward lookup of the returned name, matched against
//! the original IP, plus the fixed search-engine suffix allowlist.

use std::{net::IpAddr, time::Duration};

use hickory_resolver::{
    Resolver,
    config::{NameServerConfigGroup, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use once_cell::sync::Lazy;

use crate::error::FcrdnsError;

/// Suffixes (with trailing dot, matching the FQDN form DNS resolvers
/// return) that exempt a verified crawler from blocking. No other
/// suffixes exempt, per spec §4.7.
static SEARCH_ENGINE_SUFFIXES: Lazy<[&'static str; 6]> = Lazy::new(|| {
    [
        ".googlebot.com.",
        ".google.com.",
        ".yandex.com.",
        ".yandex.net.",
        ".yandex.ru.",
        ".search.msn.com.",
    ]
});

pub type AsyncResolver = Resolver<TokioConnectionProvider>;

/// Builds a resolver against a single operator-configured nameserver
/// (default: loopback, per spec §9).
pub fn build_resolver(nameserver: std::net::SocketAddr, timeout: Duration) -> AsyncResolver {
    let group = NameServerConfigGroup::from_ips_clear(&[nameserver.ip()], nameserver.port(), true);
    let config = ResolverConfig::from_parts(None, vec![], group);

    let mut opts = ResolverOpts::default();
    opts.timeout = timeout;

    let mut builder = Resolver::builder_with_config(config, TokioConnectionProvider::default());
    *builder.options_mut() = opts;
    builder.build()
}

/// Performs the PTR -> forward A/AAAA -> compare dance for `ip`.
/// Returns the confirmed domain (with trailing dot) on success, or an
/// error describing why FCrDNS failed (timeout, NXDOMAIN, no answer, or
/// an outright address mismatch).
pub async fn verify(resolver: &AsyncResolver, ip: IpAddr) -> Result<String, FcrdnsError> {
    let reverse = resolver
        .reverse_lookup(ip)
        .await
        .map_err(|source| FcrdnsError::Reverse { ip, source })?;

    let name = reverse
        .iter()
        .next()
        .ok_or(FcrdnsError::NoPtrRecord(ip))?
        .to_string();

    let resolved: IpAddr = match ip {
        IpAddr::V6(_) => resolver
            .ipv6_lookup(name.clone())
            .await
            .map_err(|source| FcrdnsError::Forward {
                name: name.clone(),
                source,
            })?
            .iter()
            .next()
            .map(|a| IpAddr::V6(a.0))
            .ok_or_else(|| FcrdnsError::Mismatch {
                ip,
                name: name.clone(),
                resolved: ip,
            })?,
        IpAddr::V4(_) => resolver
            .ipv4_lookup(name.clone())
            .await
            .map_err(|source| FcrdnsError::Forward {
                name: name.clone(),
                source,
            })?
            .iter()
            .next()
            .map(|a| IpAddr::V4(a.0))
            .ok_or_else(|| FcrdnsError::Mismatch {
                ip,
                name: name.clone(),
                resolved: ip,
            })?,
    };

    if resolved == ip {
        Ok(name)
    } else {
        Err(FcrdnsError::Mismatch {
            ip,
            name,
            resolved,
        })
    }
}

/// Checks a confirmed FCrDNS domain against the fixed search-engine
/// suffix allowlist.
pub fn is_whitelisted(domain: &str) -> bool {
    SEARCH_ENGINE_SUFFIXES.iter().any(|suffix| domain.ends_with(suffix))
}
