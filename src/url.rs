//! Server address parsing for cloud:// URLs

use std::fmt;

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Accepts `cloud://host[:port][/]`, `host:port` or a bare `host`.
pub fn parse_server_addr(s: &str) -> Option<ServerAddr> {
    let s_trim = s.trim();
    let mut rest = s_trim;
    if let Some(scheme_end) = s_trim.find("://") {
        if !s_trim[..scheme_end].eq_ignore_ascii_case("cloud") {
            return None;
        }
        rest = &s_trim[scheme_end + 3..];
    }
    let hp = rest.split('/').next().unwrap_or(rest);
    if hp.is_empty() {
        return None;
    }
    let (host, port) = match hp.rsplit_once(':') {
        Some((h, pr)) => (h.to_string(), pr.parse().ok()?),
        None => (hp.to_string(), DEFAULT_PORT),
    };
    if host.is_empty() {
        return None;
    }
    Some(ServerAddr { host, port })
}
