//! Node address normalization.

use crate::DEFAULT_DAEMON_PORT;

/// Normalizes a management address into a dialable `host:port`:
/// a CIDR suffix is stripped and the default daemon port appended when
/// none is present.
pub fn normalize_node_addr(addr: &str) -> String {
    let host = addr.split('/').next().unwrap_or(addr);
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, DEFAULT_DAEMON_PORT)
    }
}

/// HTTP base URL for a node's streaming endpoints.
pub fn http_base_url(addr: &str) -> String {
    format!("http://{}", normalize_node_addr(addr))
}
