//! SOCKS5 CONNECT through Tor
//!
//! Only the subset Tor's SOCKS port needs: no authentication and domain-name
//! addressing, so `.onion` names are resolved by Tor rather than locally.

use crate::error::{CommError, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Default Tor SOCKS port
pub const DEFAULT_SOCKS_PORT: u16 = 9050;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Human-readable SOCKS5 reply code
pub fn reply_message(code: u8) -> &'static str {
    match code {
        0x00 => "succeeded",
        0x01 => "general SOCKS server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown failure",
    }
}

/// Build the CONNECT request for `host:port`
pub fn connect_request(host: &str, port: u16) -> Result<Vec<u8>> {
    let host = host.as_bytes();
    if host.is_empty() || host.len() > 255 {
        return Err(CommError::Proxy(format!(
            "Host name of {} bytes cannot be sent over SOCKS5",
            host.len()
        )));
    }

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN, host.len() as u8]);
    request.extend_from_slice(host);
    request.extend_from_slice(&port.to_be_bytes());
    Ok(request)
}

/// Open a TCP stream to `host:port` via the SOCKS5 proxy at `proxy`
pub fn connect(proxy: &str, host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let proxy_addr: SocketAddr = proxy
        .to_socket_addrs()
        .map_err(|e| CommError::Proxy(format!("{}: {}", proxy, e)))?
        .next()
        .ok_or_else(|| CommError::Proxy(format!("{} did not resolve", proxy)))?;

    let mut stream = TcpStream::connect_timeout(&proxy_addr, timeout)
        .map_err(|e| CommError::Proxy(format!("{}: {}", proxy_addr, e)))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    negotiate(&mut stream, host, port)?;

    stream.set_read_timeout(None)?;
    stream.set_write_timeout(None)?;
    log::info!("🧅 SOCKS5 tunnel to {}:{} established via {}", host, port, proxy_addr);
    Ok(stream)
}

/// Run the greeting and CONNECT exchange on an open stream
pub fn negotiate<S: Read + Write>(stream: &mut S, host: &str, port: u16) -> Result<()> {
    stream.write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice)?;
    if choice != [SOCKS_VERSION, METHOD_NO_AUTH] {
        return Err(CommError::Proxy(format!(
            "Proxy refused unauthenticated access (reply {:02X?})",
            choice
        )));
    }

    stream.write_all(&connect_request(host, port)?)?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply)?;
    if reply[0] != SOCKS_VERSION {
        return Err(CommError::Proxy(format!("Unexpected SOCKS version {}", reply[0])));
    }
    if reply[1] != 0x00 {
        return Err(CommError::Proxy(format!(
            "CONNECT to {}:{} failed: {}",
            host,
            port,
            reply_message(reply[1])
        )));
    }

    // Discard the bound address
    let remaining = match reply[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len)?;
            len[0] as usize + 2
        }
        other => {
            return Err(CommError::Proxy(format!("Unknown address type {}", other)));
        }
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound)?;
    Ok(())
}
