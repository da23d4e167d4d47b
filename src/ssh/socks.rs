// ABOUTME: SOCKS5 and SOCKS4/4a server-side handshake for the local proxy listener.
// ABOUTME: Only CONNECT without authentication is supported; failures stay per connection.

use crate::error::Error;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const SOCKS4: u8 = 0x04;
const SOCKS5: u8 = 0x05;

const CMD_CONNECT: u8 = 0x01;
const AUTH_NONE: u8 = 0x00;
const AUTH_UNACCEPTABLE: u8 = 0xFF;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

const SOCKS4_GRANTED: u8 = 0x5A;
const SOCKS4_REJECTED: u8 = 0x5B;

/// Longest null-terminated field accepted in a SOCKS4 request.
const MAX_SOCKS4_FIELD: usize = 255;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("unsupported SOCKS version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("client offered no acceptable authentication method")]
    NoAcceptableAuth,

    #[error("unsupported SOCKS command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("invalid destination domain")]
    InvalidDomain,

    #[error("SOCKS4 field exceeds {MAX_SOCKS4_FIELD} bytes")]
    FieldTooLong,

    #[error("handshake I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SocksError> for Error {
    fn from(err: SocksError) -> Self {
        Error::Protocol(format!("SOCKS handshake: {err}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksVersion {
    V4,
    V5,
}

/// Where the client asked to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Addr(SocketAddr),
    Domain(String, u16),
}

impl Destination {
    pub fn host(&self) -> String {
        match self {
            Destination::Addr(addr) => addr.ip().to_string(),
            Destination::Domain(host, _) => host.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Destination::Addr(addr) => addr.port(),
            Destination::Domain(_, port) => *port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub version: SocksVersion,
    pub destination: Destination,
}

/// Read a client's greeting and CONNECT request.
///
/// When the version is known and the request is unacceptable, the matching
/// failure reply is written before the error is returned.
pub async fn negotiate<S>(stream: &mut S) -> Result<Handshake, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match stream.read_u8().await? {
        SOCKS5 => negotiate_v5(stream).await,
        SOCKS4 => negotiate_v4(stream).await,
        other => Err(SocksError::UnsupportedVersion(other)),
    }
}

/// Tell the client its CONNECT succeeded.
pub async fn grant<S>(stream: &mut S, version: SocksVersion) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V5 => reply_v5(stream, REP_SUCCEEDED).await,
        SocksVersion::V4 => reply_v4(stream, SOCKS4_GRANTED).await,
    }
}

/// Tell the client its CONNECT failed.
pub async fn refuse<S>(stream: &mut S, version: SocksVersion) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match version {
        SocksVersion::V5 => reply_v5(stream, REP_GENERAL_FAILURE).await,
        SocksVersion::V4 => reply_v4(stream, SOCKS4_REJECTED).await,
    }
}

async fn negotiate_v5<S>(stream: &mut S) -> Result<Handshake, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method_count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; method_count];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[SOCKS5, AUTH_UNACCEPTABLE]).await?;
        return Err(SocksError::NoAcceptableAuth);
    }
    stream.write_all(&[SOCKS5, AUTH_NONE]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, address_type] = header;

    if version != SOCKS5 {
        return Err(SocksError::UnsupportedVersion(version));
    }
    if command != CMD_CONNECT {
        reply_v5(stream, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(SocksError::UnsupportedCommand(command));
    }

    let destination = match address_type {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Destination::Addr(SocketAddr::from((Ipv4Addr::from(octets), port)))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Destination::Addr(SocketAddr::from((Ipv6Addr::from(octets), port)))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            match valid_domain(name) {
                Some(domain) => Destination::Domain(domain, port),
                None => {
                    reply_v5(stream, REP_ADDRESS_NOT_SUPPORTED).await?;
                    return Err(SocksError::InvalidDomain);
                }
            }
        }
        other => {
            reply_v5(stream, REP_ADDRESS_NOT_SUPPORTED).await?;
            return Err(SocksError::UnsupportedAddressType(other));
        }
    };

    Ok(Handshake {
        version: SocksVersion::V5,
        destination,
    })
}

async fn negotiate_v4<S>(stream: &mut S) -> Result<Handshake, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let command = stream.read_u8().await?;
    let port = stream.read_u16().await?;
    let mut octets = [0u8; 4];
    stream.read_exact(&mut octets).await?;
    // User id is ignored.
    read_null_terminated(stream).await?;

    if command != CMD_CONNECT {
        reply_v4(stream, SOCKS4_REJECTED).await?;
        return Err(SocksError::UnsupportedCommand(command));
    }

    // SOCKS4a: 0.0.0.x with x != 0 means a domain follows the user id.
    let destination = if octets[..3] == [0, 0, 0] && octets[3] != 0 {
        let name = read_null_terminated(stream).await?;
        match valid_domain(name) {
            Some(domain) => Destination::Domain(domain, port),
            None => {
                reply_v4(stream, SOCKS4_REJECTED).await?;
                return Err(SocksError::InvalidDomain);
            }
        }
    } else {
        Destination::Addr(SocketAddr::from((Ipv4Addr::from(octets), port)))
    };

    Ok(Handshake {
        version: SocksVersion::V4,
        destination,
    })
}

async fn read_null_terminated<S>(stream: &mut S) -> Result<Vec<u8>, SocksError>
where
    S: AsyncRead + Unpin,
{
    let mut field = Vec::new();
    loop {
        let byte = stream.read_u8().await?;
        if byte == 0 {
            return Ok(field);
        }
        if field.len() == MAX_SOCKS4_FIELD {
            return Err(SocksError::FieldTooLong);
        }
        field.push(byte);
    }
}

fn valid_domain(name: Vec<u8>) -> Option<String> {
    let domain = String::from_utf8(name).ok()?;
    let ok = !domain.is_empty()
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_');
    ok.then_some(domain)
}

async fn reply_v5<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS5, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    stream.flush().await
}

async fn reply_v4<S>(stream: &mut S, code: u8) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&[0x00, code, 0, 0, 0, 0, 0, 0]).await?;
    stream.flush().await
}
