//! Parsing for `ZI_NET_ALLOW` / `ZI_NET_LISTEN_ALLOW` allowlist strings.
//!
//! Syntax: a comma-separated list of `any`, `loopback`, or `host:port`
//! entries, where either side of the colon may be `*`. Bracketed IPv6
//! literals (`[::1]:9000`) are unwrapped before comparison. An empty or
//! absent allowlist permits loopback only.

fn strip_brackets(host: &str) -> &str {
    if host.len() >= 2 && host.starts_with('[') && host.ends_with(']') {
        &host[1..host.len() - 1]
    } else {
        host
    }
}

fn is_loopback(host: &str) -> bool {
    let h = strip_brackets(host);
    h.eq_ignore_ascii_case("localhost") || h == "127.0.0.1" || h == "::1"
}

/// Whether `allow` permits connecting/listening on `host:port`.
///
/// `port == 0` (ephemeral bind) matches any port-specific entry, per the
/// reference semantics for listener wildcard binds.
#[must_use]
pub fn allows(allow: &str, host: &str, port: u32) -> bool {
    let allow = allow.trim();
    if allow.is_empty() {
        return is_loopback(host);
    }
    if allow.eq_ignore_ascii_case("any") {
        return true;
    }

    let want_any_port = port == 0;
    for token in allow.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if token.eq_ignore_ascii_case("loopback") {
            if is_loopback(host) {
                return true;
            }
            continue;
        }

        let Some((entry_host, entry_port)) = token.rsplit_once(':') else {
            continue;
        };

        let host_ok = entry_host == "*" || strip_brackets(host).eq_ignore_ascii_case(strip_brackets(entry_host));
        if !host_ok {
            continue;
        }

        if entry_port == "*" {
            return true;
        }
        if want_any_port {
            continue;
        }
        if let Ok(p) = entry_port.parse::<u32>() {
            if p > 0 && p <= 65535 && p == port {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_allowlist_permits_loopback_only() {
        assert!(allows("", "127.0.0.1", 80));
        assert!(allows("", "localhost", 80));
        assert!(!allows("", "example.com", 80));
    }

    #[test]
    fn any_permits_everything() {
        assert!(allows("any", "example.com", 443));
    }

    #[test]
    fn host_wildcard_port_matches_any_port() {
        assert!(allows("example.com:*", "example.com", 8080));
    }

    #[test]
    fn exact_host_and_port_must_both_match() {
        assert!(allows("example.com:80", "example.com", 80));
        assert!(!allows("example.com:80", "example.com", 81));
        assert!(!allows("example.com:80", "other.com", 80));
    }

    #[test]
    fn bracketed_ipv6_literal_is_normalized() {
        assert!(allows("[::1]:9000", "::1", 9000));
    }

    #[test]
    fn ephemeral_port_matches_any_port_specific_entry() {
        assert!(allows("example.com:9000", "example.com", 0));
    }
}
