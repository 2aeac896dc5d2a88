//! Address resolution for client connects and server binds.
//!
//! Host and service names go through `getaddrinfo(3)`, so they are answered
//! by the system name service with the endpoint's family, socket type and
//! protocol as hints.

// `getaddrinfo` is only reachable through raw libc bindings.
#![allow(unsafe_code)]

use crate::config::{AddressFamily, EndpointConfig, SocketType};
use crate::{GatewayError, Result};
use std::ffi::{CStr, CString};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;
use tracing::debug;

/// Turns a configured `host:service` into an ordered list of candidates.
pub trait AddressResolver {
    fn resolve(&self, config: &EndpointConfig) -> Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system name service.
#[derive(Debug, Clone, Default)]
pub struct SystemResolver;

impl AddressResolver for SystemResolver {
    fn resolve(&self, config: &EndpointConfig) -> Result<Vec<SocketAddr>> {
        let cannot_resolve = |message: String| GatewayError::CannotResolve {
            host: config.host.clone(),
            service: config.service.clone(),
            message,
        };

        let candidates: Vec<SocketAddr> =
            getaddrinfo(Some(&config.host), config.service.trim(), config, false)
                .map_err(cannot_resolve)?
                .into_iter()
                .filter(|addr| config.family.admits(addr))
                .collect();

        if candidates.is_empty() {
            return Err(cannot_resolve(format!(
                "no {:?} addresses found",
                config.family
            )));
        }
        debug!(
            "Resolved {} to {} candidate address(es)",
            config.target(),
            candidates.len()
        );
        Ok(candidates)
    }
}

/// Resolver returning a fixed candidate list regardless of configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    addresses: Vec<SocketAddr>,
}

impl StaticResolver {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self { addresses }
    }
}

impl AddressResolver for StaticResolver {
    fn resolve(&self, config: &EndpointConfig) -> Result<Vec<SocketAddr>> {
        if self.addresses.is_empty() {
            return Err(GatewayError::CannotResolve {
                host: config.host.clone(),
                service: config.service.clone(),
                message: "no addresses configured".to_string(),
            });
        }
        Ok(self.addresses.clone())
    }
}

/// Resolve a port number or named service for `socket_type`.
pub fn resolve_service(service: &str, socket_type: SocketType) -> Result<u16> {
    let service = service.trim();
    if let Ok(port) = service.parse::<u16>() {
        return Ok(port);
    }

    let unknown = |message: String| GatewayError::CannotResolve {
        host: String::new(),
        service: service.to_string(),
        message,
    };
    if service.is_empty() {
        return Err(unknown("empty service".to_string()));
    }

    let hints = EndpointConfig::server(service).with_socket_type(socket_type);
    getaddrinfo(None, service, &hints, true)
        .map_err(unknown)?
        .first()
        .map(SocketAddr::port)
        .ok_or_else(|| unknown("Unknown service/port name".to_string()))
}

/// Local address a server binds to.
///
/// Loopback unless non-local connections are allowed; IPv6 only when the
/// family asks for it.
pub fn bind_address(config: &EndpointConfig) -> Result<SocketAddr> {
    let port = resolve_service(&config.service, config.socket_type)?;
    let ip = match (config.family, config.allow_non_local) {
        (AddressFamily::Ipv6, false) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        (AddressFamily::Ipv6, true) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        (_, false) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        (_, true) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    Ok(SocketAddr::new(ip, port))
}

/// Ask the system for the addresses of `host:service`, in the order it
/// returns them and without duplicates.
///
/// `host` of `None` looks up the service alone; `passive` selects wildcard
/// addresses for it.
fn getaddrinfo(
    host: Option<&str>,
    service: &str,
    config: &EndpointConfig,
    passive: bool,
) -> std::result::Result<Vec<SocketAddr>, String> {
    let host = host
        .map(CString::new)
        .transpose()
        .map_err(|_| "host name contains a NUL byte".to_string())?;
    let service =
        CString::new(service).map_err(|_| "service name contains a NUL byte".to_string())?;

    // SAFETY: `addrinfo` is plain data and all-zero is an empty hint.
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_flags = if passive { libc::AI_PASSIVE } else { 0 };
    hints.ai_family = config.family.raw();
    hints.ai_socktype = config.socket_type.raw();
    hints.ai_protocol = config.effective_protocol();

    let mut list: *mut libc::addrinfo = ptr::null_mut();
    // SAFETY: both strings are NUL-terminated and outlive the call, and
    // `list` is only read after a successful return.
    let rc = unsafe {
        libc::getaddrinfo(
            host.as_ref().map_or(ptr::null(), |h| h.as_ptr()),
            service.as_ptr(),
            &hints,
            &mut list,
        )
    };
    if rc != 0 {
        return Err(lookup_error(rc));
    }

    let mut addrs = Vec::new();
    let mut cursor = list;
    while !cursor.is_null() {
        // SAFETY: `cursor` walks the list returned above, which stays valid
        // until `freeaddrinfo`.
        let info = unsafe { &*cursor };
        // SAFETY: entries from `getaddrinfo` carry a matching address buffer.
        if let Some(addr) = unsafe { to_socket_addr(info) } {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
        cursor = info.ai_next;
    }
    // SAFETY: `list` came from a successful `getaddrinfo` and is freed once.
    unsafe { libc::freeaddrinfo(list) };
    Ok(addrs)
}

/// Convert one `getaddrinfo` entry; other families are skipped.
///
/// # Safety
///
/// `info.ai_addr` must be null or point to `info.ai_addrlen` readable bytes
/// holding an address of family `info.ai_family`.
unsafe fn to_socket_addr(info: &libc::addrinfo) -> Option<SocketAddr> {
    if info.ai_addr.is_null() {
        return None;
    }
    let len = info.ai_addrlen as usize;
    match info.ai_family {
        libc::AF_INET if len >= std::mem::size_of::<libc::sockaddr_in>() => {
            // SAFETY: family and length checked above.
            let sin = unsafe { &*(info.ai_addr as *const libc::sockaddr_in) };
            Some(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 if len >= std::mem::size_of::<libc::sockaddr_in6>() => {
            // SAFETY: family and length checked above.
            let sin6 = unsafe { &*(info.ai_addr as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

fn lookup_error(code: libc::c_int) -> String {
    if code == libc::EAI_SYSTEM {
        return std::io::Error::last_os_error().to_string();
    }
    // SAFETY: `gai_strerror` returns a static NUL-terminated message.
    let text = unsafe { CStr::from_ptr(libc::gai_strerror(code)) };
    format!("getaddrinfo error {}: {}", code, text.to_string_lossy())
}
