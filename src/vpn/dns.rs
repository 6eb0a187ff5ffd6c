//! Direct A-record lookups against the VPN-side resolver
//!
//! Queries go straight to one resolver over UDP so that a local proxy's DNS
//! interception cannot answer for VPN-only names. Only the minimum of the
//! wire format is handled: one question, and the first answer must be an
//! IN A record. Compression pointers are skipped, never followed.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const HEADER_LEN: usize = 12;
const TYPE_A: u16 = 1;
const CLASS_IN: u16 = 1;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DnsError {
    #[error("Invalid hostname: {0}")]
    InvalidName(String),
    #[error("DNS query failed: {0}")]
    QueryFailed(String),
    #[error("Response too short")]
    Truncated,
    #[error("Response id {got:#06x} does not match query id {expected:#06x}")]
    IdMismatch { expected: u16, got: u16 },
    #[error("DNS error code: {0}")]
    Rcode(u8),
    #[error("No answers in response")]
    NoAnswer,
    #[error("Unexpected answer type: {rtype} length: {rdlength}")]
    UnexpectedAnswer { rtype: u16, rdlength: u16 },
}

/// Build a minimal DNS A record query packet
pub fn build_query(id: u16, hostname: &str) -> Result<Vec<u8>, DnsError> {
    let mut packet = Vec::with_capacity(512);

    // Header (12 bytes)
    packet.extend_from_slice(&id.to_be_bytes());
    // Flags: standard query, recursion desired
    packet.extend_from_slice(&[0x01, 0x00]);
    // QDCOUNT = 1
    packet.extend_from_slice(&[0x00, 0x01]);
    // ANCOUNT, NSCOUNT, ARCOUNT = 0
    packet.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);

    // Question section
    for label in hostname.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(DnsError::InvalidName(hostname.to_string()));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0x00);

    packet.extend_from_slice(&TYPE_A.to_be_bytes());
    packet.extend_from_slice(&CLASS_IN.to_be_bytes());

    Ok(packet)
}

/// Advance past an encoded name starting at `pos`
///
/// A compression pointer ends the name; its target is not visited.
fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize, DnsError> {
    loop {
        let len = *packet.get(pos).ok_or(DnsError::Truncated)?;
        match len {
            0 => return Ok(pos + 1),
            l if l & 0xC0 == 0xC0 => {
                if pos + 2 > packet.len() {
                    return Err(DnsError::Truncated);
                }
                return Ok(pos + 2);
            }
            l => pos += 1 + l as usize,
        }
    }
}

fn read_u16(packet: &[u8], pos: usize) -> Result<u16, DnsError> {
    match packet.get(pos..pos + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(DnsError::Truncated),
    }
}

/// Extract the address from the first answer of a response to query `id`
pub fn parse_first_a_record(id: u16, response: &[u8]) -> Result<Ipv4Addr, DnsError> {
    if response.len() < HEADER_LEN {
        return Err(DnsError::Truncated);
    }

    let got = read_u16(response, 0)?;
    if got != id {
        return Err(DnsError::IdMismatch { expected: id, got });
    }

    // RCODE in lower 4 bits of byte 3
    let rcode = response[3] & 0x0F;
    if rcode != 0 {
        return Err(DnsError::Rcode(rcode));
    }

    let qdcount = read_u16(response, 4)?;
    let ancount = read_u16(response, 6)?;
    if ancount == 0 {
        return Err(DnsError::NoAnswer);
    }

    let mut pos = HEADER_LEN;
    for _ in 0..qdcount {
        pos = skip_name(response, pos)?;
        pos += 4; // QTYPE, QCLASS
    }

    pos = skip_name(response, pos)?;
    let rtype = read_u16(response, pos)?;
    let rclass = read_u16(response, pos + 2)?;
    // TTL occupies pos + 4 .. pos + 8
    let rdlength = read_u16(response, pos + 8)?;
    pos += 10;

    if rtype != TYPE_A || rclass != CLASS_IN || rdlength != 4 {
        return Err(DnsError::UnexpectedAnswer { rtype, rdlength });
    }

    match response.get(pos..pos + 4) {
        Some(b) => Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3])),
        None => Err(DnsError::Truncated),
    }
}

/// Resolver bound to a single server address
#[derive(Debug, Clone)]
pub struct DnsResolver {
    server: SocketAddr,
    timeout: Duration,
}

impl DnsResolver {
    pub fn new(server: SocketAddr, timeout: Duration) -> Self {
        Self { server, timeout }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn resolve(&self, hostname: &str) -> Result<Ipv4Addr, DnsError> {
        let id = query_id();
        let query = build_query(id, hostname)?;

        let failed = |what: &str, e: std::io::Error| DnsError::QueryFailed(format!("{}: {}", what, e));

        let bind_addr: SocketAddr = if self.server.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr).map_err(|e| failed("bind failed", e))?;
        socket
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| failed("set timeout failed", e))?;
        socket
            .send_to(&query, self.server)
            .map_err(|e| failed("send failed", e))?;

        let mut response = [0u8; 512];
        let (len, _) = socket
            .recv_from(&mut response)
            .map_err(|e| failed("recv failed", e))?;

        let ip = parse_first_a_record(id, &response[..len])?;
        debug!("{} resolved {} -> {}", self.server, hostname, ip);
        Ok(ip)
    }
}

fn query_id() -> u16 {
    (std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos()
        & 0xFFFF) as u16
}
