// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Config Loader (C1) and Threshold Resolver (C6).
//!
//! Parses the text policy file (`autofilter.conf`) into the limit and
//! block-duration tables, and resolves per-request thresholds by cascading
//! lookup (per-IP -> per-CIDR -> per-country -> default).

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, SocketAddr},
    path::Path,
    time::Duration,
};

use ipnet::IpNet;

use crate::error::ConfigError;

/// A very large ceiling used to represent the `none` ("effectively
/// unlimited") value without giving every call site an `Option`.
pub const UNLIMITED: u64 = u64::MAX / 2;

pub const MIN_CEILING: u64 = 60;

const DEFAULT_ALL_LIMIT: u64 = 600;
const DEFAULT_ALL_BLOCK: Duration = Duration::from_secs(24 * 3600);
const DEFAULT_RESOLVER: &str = "127.0.0.1:53";

/// An entity key accepted in the `limit`/`block` tables: a literal IP, a
/// CIDR block, an uppercase ISO country code, or the `ALL` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Entity {
    Ip(IpAddr),
    Cidr(IpNet),
    Country(String),
    All,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Ip(ip) => write!(f, "{ip}"),
            Entity::Cidr(net) => write!(f, "{net}"),
            Entity::Country(c) => write!(f, "{c}"),
            Entity::All => write!(f, "ALL"),
        }
    }
}

impl Entity {
    /// Normalises and classifies a raw entity token. The caller is
    /// expected to have already lowercased the surrounding directive line;
    /// per spec, keys containing `:` are left as-is (case-sensitive v6
    /// literals/CIDRs), everything else is uppercased.
    fn parse(raw: &str) -> Entity {
        let normalized = if raw.contains(':') {
            raw.to_string()
        } else {
            raw.to_ascii_uppercase()
        };

        if normalized.eq_ignore_ascii_case("all") {
            return Entity::All;
        }
        if let Ok(net) = normalized.parse::<IpNet>() {
            return Entity::Cidr(net);
        }
        if let Ok(ip) = normalized.parse::<IpAddr>() {
            return Entity::Ip(ip);
        }
        Entity::Country(normalized)
    }
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub limit: HashMap<Entity, u64>,
    pub block: HashMap<Entity, Duration>,
    /// `limit`'s CIDR keys, pre-sorted by descending prefix length so the
    /// first containing match in the threshold cascade wins.
    pub limit_cidr: Vec<(IpNet, u64)>,
    /// Resolver address for the FCrDNS verifier (C7). Not part of the
    /// original fixed `limit`/`block` grammar; an ambient extension per
    /// §9's "make this a policy option, preserve the default" note.
    pub resolver: SocketAddr,
}

impl Policy {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Policy, ConfigError> {
        let path_display = path.as_ref().display().to_string();
        let contents =
            std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
                path: path_display,
                source,
            })?;

        let mut limit: HashMap<Entity, u64> = HashMap::new();
        let mut block: HashMap<Entity, Duration> = HashMap::new();
        let mut seen_limit: HashMap<String, ()> = HashMap::new();
        let mut seen_block: HashMap<String, ()> = HashMap::new();
        let mut resolver: SocketAddr = DEFAULT_RESOLVER.parse().expect("valid default");

        for (idx, raw_line) in contents.lines().enumerate() {
            let line_no = idx + 1;

            let stripped = match raw_line.find('#') {
                Some(pos) => &raw_line[..pos],
                None => raw_line,
            };
            let collapsed = stripped.replace('\t', " ");
            let lowered = collapsed.to_ascii_lowercase();
            let trimmed = lowered.trim();
            if trimmed.is_empty() {
                continue;
            }

            let tokens: Vec<&str> = trimmed.split_whitespace().collect();

            match tokens.as_slice() {
                ["resolver", addr] => {
                    resolver = addr.parse().map_err(|_| ConfigError::Malformed {
                        line: line_no,
                    })?;
                },
                [directive @ ("limit" | "block"), entity_raw, value_raw] => {
                    let entity = Entity::parse(entity_raw);
                    let key_str = entity.to_string();

                    if *directive == "limit" {
                        if seen_limit.insert(key_str.clone(), ()).is_some() {
                            return Err(ConfigError::DuplicateEntity {
                                directive: "limit".to_string(),
                                entity: key_str,
                                line: line_no,
                            });
                        }
                        let ceiling = parse_ceiling(value_raw, line_no)?;
                        limit.insert(entity, ceiling);
                    } else {
                        if seen_block.insert(key_str.clone(), ()).is_some() {
                            return Err(ConfigError::DuplicateEntity {
                                directive: "block".to_string(),
                                entity: key_str,
                                line: line_no,
                            });
                        }
                        let dur = parse_duration(value_raw, line_no)?;
                        block.insert(entity, dur);
                    }
                },
                [other, ..] => {
                    return Err(ConfigError::UnknownDirective(
                        (*other).to_string(),
                        line_no,
                    ));
                },
                [] => unreachable!("blank lines filtered above"),
            }
        }

        limit.entry(Entity::All).or_insert(DEFAULT_ALL_LIMIT);
        block.entry(Entity::All).or_insert(DEFAULT_ALL_BLOCK);

        let mut limit_cidr: Vec<(IpNet, u64)> = limit
            .iter()
            .filter_map(|(entity, ceiling)| match entity {
                Entity::Cidr(net) => Some((*net, *ceiling)),
                _ => None,
            })
            .collect();
        limit_cidr.sort_by(|a, b| b.0.prefix_len().cmp(&a.0.prefix_len()));

        Ok(Policy {
            limit,
            block,
            limit_cidr,
            resolver,
        })
    }

    /// Threshold Resolver (C6), requests-per-minute ceiling cascade:
    /// exact IP -> longest-prefix CIDR -> country -> `ALL`.
    pub fn resolve_limit(&self, ip: IpAddr, country: &str) -> u64 {
        if let Some(&ceiling) = self.limit.get(&Entity::Ip(ip)) {
            return ceiling;
        }
        for (net, ceiling) in &self.limit_cidr {
            if net.contains(&ip) {
                return *ceiling;
            }
        }
        if !country.is_empty() {
            if let Some(&ceiling) =
                self.limit.get(&Entity::Country(country.to_ascii_uppercase()))
            {
                return ceiling;
            }
        }
        *self.limit.get(&Entity::All).unwrap_or(&DEFAULT_ALL_LIMIT)
    }

    /// Block-duration cascade. Per spec §4.6/§9 this deliberately omits
    /// the CIDR step (exact-IP -> country -> `ALL` only); preserved as
    /// observed rather than "fixed".
    pub fn resolve_block_duration(&self, ip: IpAddr, country: &str) -> Duration {
        if let Some(&dur) = self.block.get(&Entity::Ip(ip)) {
            return dur;
        }
        if !country.is_empty() {
            if let Some(&dur) =
                self.block.get(&Entity::Country(country.to_ascii_uppercase()))
            {
                return dur;
            }
        }
        *self.block.get(&Entity::All).unwrap_or(&DEFAULT_ALL_BLOCK)
    }
}

fn parse_ceiling(raw: &str, line: usize) -> Result<u64, ConfigError> {
    if raw == "none" {
        return Ok(UNLIMITED);
    }
    let value: u64 = raw.parse().map_err(|_| ConfigError::Malformed { line })?;
    if value < MIN_CEILING {
        return Err(ConfigError::CeilingTooLow { value, line });
    }
    Ok(value)
}

fn parse_duration(raw: &str, line: usize) -> Result<Duration, ConfigError> {
    let (digits, suffix) = raw.split_at(raw.len().saturating_sub(1));
    let n: u64 = digits.parse().map_err(|_| ConfigError::BadDuration {
        value: raw.to_string(),
        line,
    })?;
    if n < 1 {
        return Err(ConfigError::BadDuration {
            value: raw.to_string(),
            line,
        });
    }
    let secs = match suffix {
        "h" => n.checked_mul(3600),
        "d" => n.checked_mul(24 * 3600),
        _ => None,
    }
    .ok_or_else(|| ConfigError::BadDuration {
        value: raw.to_string(),
        line,
    })?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_policy(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults_when_absent() {
        let f = write_policy("# empty policy\n");
        let policy = Policy::load(f.path()).unwrap();
        assert_eq!(policy.limit[&Entity::All], DEFAULT_ALL_LIMIT);
        assert_eq!(policy.block[&Entity::All], DEFAULT_ALL_BLOCK);
        assert_eq!(policy.resolver, DEFAULT_RESOLVER.parse().unwrap());
    }

    #[test]
    fn none_is_unlimited() {
        let f = write_policy("limit ALL none\n");
        let policy = Policy::load(f.path()).unwrap();
        assert_eq!(policy.limit[&Entity::All], UNLIMITED);
    }

    #[test]
    fn ceiling_below_minimum_rejected() {
        let f = write_policy("limit ALL 10\n");
        let err = Policy::load(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::CeilingTooLow { value: 10, .. }));
    }

    #[test]
    fn duplicate_entity_rejected() {
        let f = write_policy("limit ALL 600\nlimit all 700\n");
        let err = Policy::load(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateEntity { .. }));
    }

    #[test]
    fn unknown_directive_rejected() {
        let f = write_policy("allow ALL 600\n");
        let err = Policy::load(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDirective(..)));
    }

    #[test]
    fn block_duration_parses_hours_and_days() {
        let f = write_policy("block ALL 2h\nblock CN 1d\n");
        let policy = Policy::load(f.path()).unwrap();
        assert_eq!(policy.block[&Entity::All], Duration::from_secs(2 * 3600));
        assert_eq!(
            policy.block[&Entity::Country("CN".into())],
            Duration::from_secs(24 * 3600)
        );
    }

    #[test]
    fn cascade_scenario_1_cidr_over_country() {
        // Policy `limit 10.0.0.0/8 100; limit CN 200; limit ALL 600`.
        let f = write_policy("limit 10.0.0.0/8 100\nlimit CN 200\nlimit ALL 600\n");
        let policy = Policy::load(f.path()).unwrap();

        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(policy.resolve_limit(ip, "CN"), 100);

        let other: IpAddr = "8.8.8.8".parse().unwrap();
        assert_eq!(policy.resolve_limit(other, "CN"), 200);
    }

    #[test]
    fn block_duration_cascade_skips_cidr() {
        let f = write_policy("block 10.0.0.0/8 1h\nblock CN 2h\nblock ALL 1d\n");
        let policy = Policy::load(f.path()).unwrap();
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        // CIDR entry exists but the cascade must skip straight to country.
        assert_eq!(policy.resolve_block_duration(ip, "CN"), Duration::from_secs(2 * 3600));
    }

    #[test]
    fn resolver_directive_overrides_default() {
        let f = write_policy("resolver 9.9.9.9:53\nlimit ALL 600\n");
        let policy = Policy::load(f.path()).unwrap();
        assert_eq!(policy.resolver, "9.9.9.9:53".parse().unwrap());
    }
}
