use anyhow::Result;
use get_if_addrs::get_if_addrs;
use std::net::IpAddr;

pub fn get_first_non_loopback_interface() -> Result<IpAddr> {
    get_if_addrs()?
        .iter()
        .find(|i| !i.is_loopback() && matches!(i.addr, get_if_addrs::IfAddr::V4(_)))
        .map(|i| i.ip())
        .ok_or_else(|| anyhow::anyhow!("No IPv4 interface found"))
}

/// Host written into Via, Record-Route and Contact headers.
///
/// An explicit `external_ip` wins, then a concrete bind address; a wildcard
/// bind falls back to the first non-loopback IPv4 interface.
pub fn advertised_host(external_ip: Option<&str>, bind_addr: &str) -> Result<String> {
    if let Some(ip) = external_ip.map(str::trim).filter(|ip| !ip.is_empty()) {
        return Ok(ip.to_string());
    }
    match bind_addr.parse::<IpAddr>() {
        Ok(ip) if !ip.is_unspecified() => Ok(ip.to_string()),
        Ok(_) => Ok(get_first_non_loopback_interface()?.to_string()),
        Err(_) if !bind_addr.is_empty() => Ok(bind_addr.to_string()),
        Err(_) => Ok(get_first_non_loopback_interface()?.to_string()),
    }
}
