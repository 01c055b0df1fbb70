use crate::config::{FilterKind, IpFilterRule};
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// A filter pattern that could not be compiled at startup.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid ip filter pattern '{0}'")]
pub struct PatternError(pub String);

#[derive(Debug, Clone)]
enum Pattern {
    /// Exact address match (IPv4 or IPv6).
    Literal(IpAddr),
    /// IPv4 network containment.
    Cidr { network: u32, bits: u8 },
}

/// Compiled whitelist/blacklist evaluator.
///
/// When any whitelist entry exists, an address must match at least one of
/// them; any blacklist match denies; otherwise the address is allowed.
#[derive(Debug, Default)]
pub struct IpFilter {
    whitelist: Vec<Pattern>,
    blacklist: Vec<Pattern>,
}

/// Collapse IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to IPv4 so CIDR
/// matching operates on the 32-bit space.
#[must_use]
pub fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 => v4,
    }
}

impl IpFilter {
    /// Compile the ordered rule list.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] for a pattern that is neither a literal
    /// address nor an IPv4 `network/bits` CIDR.
    pub fn from_rules(rules: &[IpFilterRule]) -> Result<Self, PatternError> {
        let mut filter = Self::default();
        for rule in rules {
            let pattern = parse_pattern(&rule.pattern)?;
            match rule.kind {
                FilterKind::Whitelist => filter.whitelist.push(pattern),
                FilterKind::Blacklist => filter.blacklist.push(pattern),
            }
        }
        Ok(filter)
    }

    /// Evaluate an address against the configured patterns.
    #[must_use]
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        let ip = normalize(ip);
        if !self.whitelist.is_empty() && !self.whitelist.iter().any(|p| matches(p, ip)) {
            return false;
        }
        !self.blacklist.iter().any(|p| matches(p, ip))
    }
}

fn parse_pattern(raw: &str) -> Result<Pattern, PatternError> {
    if let Some((network, bits)) = raw.split_once('/') {
        let network: Ipv4Addr = network
            .parse()
            .map_err(|_| PatternError(raw.to_string()))?;
        let bits: u8 = bits.parse().map_err(|_| PatternError(raw.to_string()))?;
        if bits > 32 {
            return Err(PatternError(raw.to_string()));
        }
        return Ok(Pattern::Cidr {
            network: u32::from(network),
            bits,
        });
    }
    raw.parse::<IpAddr>()
        .map(|ip| Pattern::Literal(normalize(ip)))
        .map_err(|_| PatternError(raw.to_string()))
}

fn matches(pattern: &Pattern, ip: IpAddr) -> bool {
    match pattern {
        Pattern::Literal(literal) => *literal == ip,
        Pattern::Cidr { network, bits } => match ip {
            IpAddr::V4(v4) => {
                let mask = if *bits == 0 {
                    0
                } else {
                    u32::MAX << (32 - bits)
                };
                (u32::from(v4) & mask) == (network & mask)
            }
            // IPv6 addresses never fall inside an IPv4 CIDR.
            IpAddr::V6(_) => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, kind: FilterKind) -> IpFilterRule {
        IpFilterRule {
            pattern: pattern.to_string(),
            kind,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn empty_filter_allows_everything() {
        let filter = IpFilter::from_rules(&[]).unwrap();
        assert!(filter.is_allowed(ip("1.2.3.4")));
        assert!(filter.is_allowed(ip("::1")));
    }

    #[test]
    fn blacklist_literal_denies() {
        let filter = IpFilter::from_rules(&[rule("10.1.2.3", FilterKind::Blacklist)]).unwrap();
        assert!(!filter.is_allowed(ip("10.1.2.3")));
        assert!(filter.is_allowed(ip("10.1.2.4")));
    }

    #[test]
    fn whitelist_presence_requires_match() {
        let filter = IpFilter::from_rules(&[rule("192.168.1.0/24", FilterKind::Whitelist)]).unwrap();
        assert!(filter.is_allowed(ip("192.168.1.200")));
        assert!(!filter.is_allowed(ip("192.168.2.1")));
        assert!(!filter.is_allowed(ip("8.8.8.8")));
    }

    #[test]
    fn blacklist_wins_inside_whitelist() {
        let filter = IpFilter::from_rules(&[
            rule("192.168.0.0/16", FilterKind::Whitelist),
            rule("192.168.1.66", FilterKind::Blacklist),
        ])
        .unwrap();
        assert!(filter.is_allowed(ip("192.168.1.65")));
        assert!(!filter.is_allowed(ip("192.168.1.66")));
    }

    #[test]
    fn mapped_ipv6_matches_ipv4_cidr() {
        let filter = IpFilter::from_rules(&[rule("192.168.1.0/24", FilterKind::Blacklist)]).unwrap();
        assert!(!filter.is_allowed(ip("::ffff:192.168.1.10")));
        assert!(filter.is_allowed(ip("::ffff:192.168.2.10")));
    }

    #[test]
    fn mapped_ipv6_matches_ipv4_literal() {
        let filter = IpFilter::from_rules(&[rule("1.2.3.4", FilterKind::Blacklist)]).unwrap();
        assert!(!filter.is_allowed(ip("::ffff:1.2.3.4")));
    }

    #[test]
    fn ipv6_literal_matches_by_equality_only() {
        let filter =
            IpFilter::from_rules(&[rule("2001:db8::1", FilterKind::Blacklist)]).unwrap();
        assert!(!filter.is_allowed(ip("2001:db8::1")));
        assert!(filter.is_allowed(ip("2001:db8::2")));
    }

    #[test]
    fn zero_bit_cidr_matches_all_ipv4() {
        let filter = IpFilter::from_rules(&[rule("0.0.0.0/0", FilterKind::Blacklist)]).unwrap();
        assert!(!filter.is_allowed(ip("8.8.8.8")));
        // But not IPv6.
        assert!(filter.is_allowed(ip("2001:db8::1")));
    }

    #[test]
    fn slash_32_is_exact() {
        let filter = IpFilter::from_rules(&[rule("9.9.9.9/32", FilterKind::Blacklist)]).unwrap();
        assert!(!filter.is_allowed(ip("9.9.9.9")));
        assert!(filter.is_allowed(ip("9.9.9.8")));
    }

    #[test]
    fn cidr_boundary_addresses() {
        let filter = IpFilter::from_rules(&[rule("10.0.0.0/8", FilterKind::Whitelist)]).unwrap();
        assert!(filter.is_allowed(ip("10.0.0.0")));
        assert!(filter.is_allowed(ip("10.255.255.255")));
        assert!(!filter.is_allowed(ip("11.0.0.0")));
        assert!(!filter.is_allowed(ip("9.255.255.255")));
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(IpFilter::from_rules(&[rule("not-an-ip", FilterKind::Whitelist)]).is_err());
        assert!(IpFilter::from_rules(&[rule("10.0.0.0/33", FilterKind::Whitelist)]).is_err());
        assert!(IpFilter::from_rules(&[rule("10.0.0/8", FilterKind::Whitelist)]).is_err());
    }

    #[test]
    fn normalize_strips_mapped_prefix() {
        assert_eq!(normalize(ip("::ffff:1.2.3.4")), ip("1.2.3.4"));
        assert_eq!(normalize(ip("1.2.3.4")), ip("1.2.3.4"));
        assert_eq!(normalize(ip("2001:db8::1")), ip("2001:db8::1"));
    }
}
