use cache_lib::{CacheError, CacheResult};
use std::net::{IpAddr, UdpSocket};

/// The site-local IPv4 address this node publishes in the ownership map.
/// Resolved from the interface a connected UDP socket would use; no packet
/// is sent.
pub fn current_node_ip() -> CacheResult<String> {
    let socket = UdpSocket::bind(("0.0.0.0", 0))
        .map_err(|e| CacheError::Io(format!("bind for node ip discovery failed: {}", e)))?;
    socket
        .connect(("10.254.254.254", 1))
        .map_err(|e| CacheError::Io(format!("connect for node ip discovery failed: {}", e)))?;
    let addr = socket
        .local_addr()
        .map_err(|e| CacheError::Io(format!("local addr for node ip discovery failed: {}", e)))?;

    match addr.ip() {
        IpAddr::V4(ip) if ip.is_private() => Ok(ip.to_string()),
        _ => Err(CacheError::InvalidState("node IP not found".to_string())),
    }
}
