//! Address-string parsing (spec §6 "Address handling").
//!
//! Recognises two schemes: the plain `"ip:port"` form, and a UPnP-style
//! `"ip1,ip2:port"` pair used when advertising a local address alongside
//! a router's external address. Parsing is pure string splitting — no
//! DNS resolution, no socket I/O.

use crate::error::{NetError, Result};

/// The parsed form of a `parse_address` input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub ip1: String,
    pub ip2: Option<String>,
    pub port: u16,
}

/// Parses `"ip:port"` or `"ip1,ip2:port"` into its components.
///
/// A comma before the last colon selects the UPnP pair scheme; otherwise
/// the whole prefix before the colon is `ip1` and `ip2` is `None`. Per
/// spec §7, argument errors (a zero port, an empty hostname) are
/// detected here, before any I/O is attempted.
pub fn parse_address(address: &str) -> Result<ParsedAddress> {
    let colon = address
        .rfind(':')
        .ok_or_else(|| NetError::Protocol(format!("no port separator in address {address:?}")))?;
    let (host_part, port_part) = (&address[..colon], &address[colon + 1..]);
    let port: u16 = port_part
        .parse()
        .map_err(|_| NetError::Protocol(format!("invalid port in address {address:?}")))?;
    if port == 0 {
        return Err(NetError::Argument(format!("port cannot be 0 in address {address:?}")));
    }

    let (ip1, ip2) = match host_part.find(',') {
        Some(comma) => (
            host_part[..comma].to_string(),
            Some(host_part[comma + 1..].to_string()),
        ),
        None => (host_part.to_string(), None),
    };

    if ip1.is_empty() || ip2.as_deref() == Some("") {
        return Err(NetError::Argument(format!("empty hostname in address {address:?}")));
    }

    Ok(ParsedAddress { ip1, ip2, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_ip_port() {
        let parsed = parse_address("192.168.1.1:22").unwrap();
        assert_eq!(parsed.ip1, "192.168.1.1");
        assert_eq!(parsed.ip2, None);
        assert_eq!(parsed.port, 22);
    }

    #[test]
    fn parses_upnp_pair() {
        let parsed = parse_address("10.0.0.1,203.0.113.5:2121").unwrap();
        assert_eq!(parsed.ip1, "10.0.0.1");
        assert_eq!(parsed.ip2.as_deref(), Some("203.0.113.5"));
        assert_eq!(parsed.port, 2121);
    }

    #[test]
    fn rejects_missing_port() {
        assert!(parse_address("10.0.0.1").is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!(parse_address("10.0.0.1:http").is_err());
    }

    #[test]
    fn rejects_zero_port() {
        assert!(matches!(
            parse_address("10.0.0.1:0"),
            Err(NetError::Argument(_))
        ));
    }

    #[test]
    fn rejects_empty_hostname() {
        assert!(matches!(parse_address(":22"), Err(NetError::Argument(_))));
        assert!(matches!(
            parse_address("10.0.0.1,:22"),
            Err(NetError::Argument(_))
        ));
    }
}
