// Local input validation for shell commands. Failures leave the shell
// state untouched; the caller prints the diagnostic.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

/// Uplink types an onsite device may announce.
pub const UPLINK_TYPES: &[&str] = &["lan", "wlan", "3g"];

/// Parse a LAN address in CIDR form, e.g. `192.168.1.2/24`.
pub fn parse_lan_cidr(input: &str) -> Option<Ipv4Network> {
    if !input.contains('/') {
        return None;
    }
    input.parse().ok()
}

/// Parse a whitespace-separated list of IPv4 literals. Returns the first
/// offending token on failure.
pub fn parse_dns_list(input: &str) -> Result<Vec<Ipv4Addr>, String> {
    let mut servers = Vec::new();
    for token in input.split_whitespace() {
        match token.parse::<Ipv4Addr>() {
            Ok(addr) => servers.push(addr),
            Err(_) => return Err(token.to_string()),
        }
    }
    Ok(servers)
}

/// Strip optional surrounding single quotes from a hostname, honouring
/// backslash escapes inside the quotes. `'plant\'s-gw'` becomes
/// `plant's-gw`; an unterminated quote is an error.
pub fn unquote_hostname(input: &str) -> Result<String, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(input.to_string());
    }
    if !trimmed.starts_with('\'') {
        return Ok(trimmed.to_string());
    }

    let mut chars = trimmed[1..].chars();
    let mut out = String::new();
    loop {
        match chars.next() {
            Some('\\') => match chars.next() {
                Some(escaped) => out.push(escaped),
                None => return Err(input.to_string()),
            },
            Some('\'') => {
                // Closing quote must end the input
                return if chars.next().is_none() {
                    Ok(out)
                } else {
                    Err(input.to_string())
                };
            }
            Some(c) => out.push(c),
            None => return Err(input.to_string()),
        }
    }
}

/// Validate an uplink type announcement.
pub fn parse_uplink(input: &str) -> Option<&str> {
    UPLINK_TYPES.iter().copied().find(|t| *t == input)
}
