use crate::error::RelayError;
use std::net::{Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Validate that a proxy target is safe to fetch (SSRF protection).
///
/// Accepts only `http://` and `https://` URLs with a host. Unless
/// `allow_private` is set, IP literals in private/reserved ranges are
/// rejected.
///
/// **Hostnames** are accepted without DNS resolution; a name that resolves
/// to a private address is not caught here.
///
/// # Errors
/// Returns [`RelayError::InvalidInput`] for:
/// - Non-HTTP(S) schemes
/// - URLs without a host
/// - IPv4 addresses in private/reserved ranges
/// - IPv6 loopback, link-local, unique-local or IPv4-mapped private addresses
pub fn validate_target(url: &Url, allow_private: bool) -> Result<(), RelayError> {
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(RelayError::InvalidInput(format!(
                "scheme '{scheme}' not allowed, only http/https permitted"
            )));
        }
    }

    let host = url
        .host()
        .ok_or_else(|| RelayError::InvalidInput(format!("no host in {url}")))?;

    if allow_private {
        return Ok(());
    }

    match host {
        Host::Ipv4(ip) if is_blocked_ipv4(ip) => Err(RelayError::InvalidInput(format!(
            "private or reserved IPv4 address not allowed: {ip}"
        ))),
        Host::Ipv6(ip) if is_blocked_ipv6(ip) => Err(RelayError::InvalidInput(format!(
            "private or reserved IPv6 address not allowed: {ip}"
        ))),
        Host::Domain(name) if name.eq_ignore_ascii_case("localhost") => Err(
            RelayError::InvalidInput("localhost not allowed".to_string()),
        ),
        _ => Ok(()),
    }
}

/// Returns `true` for IPv4 addresses in private or reserved ranges.
///
/// Blocked ranges:
/// - `0.0.0.0/8`     : "this" network (RFC 1122)
/// - `10.0.0.0/8`    : RFC 1918 private
/// - `100.64.0.0/10` : carrier-grade NAT (RFC 6598)
/// - `127.0.0.0/8`   : loopback
/// - `169.254.0.0/16`: link-local / cloud-metadata
/// - `172.16.0.0/12` : RFC 1918 private
/// - `192.168.0.0/16`: RFC 1918 private
fn is_blocked_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    let (a, b) = (octets[0], octets[1]);

    a == 0                               // 0.0.0.0/8
        || a == 10                       // 10.0.0.0/8
        || (a == 100 && (64..=127).contains(&b)) // 100.64.0.0/10
        || a == 127                      // 127.0.0.0/8 loopback
        || (a == 169 && b == 254)        // 169.254.0.0/16 link-local
        || (a == 172 && (16..=31).contains(&b)) // 172.16.0.0/12
        || (a == 192 && b == 168) // 192.168.0.0/16
}

/// Returns `true` for IPv6 addresses in private or reserved ranges.
///
/// Blocked ranges:
/// - `::1/128`         : loopback
/// - `::/128`          : unspecified
/// - `fe80::/10`       : link-local
/// - `fc00::/7`        : unique-local (ULA)
/// - `::ffff:0:0/96`   : IPv4-mapped, checked against the IPv4 list
fn is_blocked_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_blocked_ipv4(v4);
    }
    let s = ip.segments();

    ip.is_loopback()                     // ::1
        || ip.is_unspecified()           // ::
        || (s[0] & 0xffc0) == 0xfe80    // fe80::/10 link-local
        || (s[0] & 0xfe00) == 0xfc00 // fc00::/7 unique-local
}
