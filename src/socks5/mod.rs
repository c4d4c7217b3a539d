pub mod client;
pub mod ingress;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

pub const SOCKS_VERSION: u8 = 0x05;
pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(20);
pub const VALIDATION_TIMEOUT: Duration = Duration::from_secs(10);

/// The subset of RFC 1928 REP codes this gateway produces or forwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Success = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => ReplyCode::Success,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            _ => ReplyCode::GeneralFailure,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub host: String,
    pub port: u16,
}

/// Reads the method-negotiation message and replies. On success the socket
/// is left ready for the request phase. Per spec §4.4 step 2, if `0x00` (NO
/// AUTH) is not among the offered methods the client is told `05 FF` and the
/// caller should close without attempting a request phase; if the version
/// byte itself is wrong, nothing is written and the caller should just close.
pub async fn negotiate_no_auth<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut header))
        .await
        .context("timed out reading method-negotiation header")??;
    let (version, nmethods) = (header[0], header[1]);
    if version != SOCKS_VERSION {
        bail!("unsupported SOCKS version {version} in handshake");
    }

    let mut methods = vec![0u8; nmethods as usize];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut methods))
        .await
        .context("timed out reading offered methods")??;

    if !methods.contains(&METHOD_NO_AUTH) {
        timeout(
            HANDSHAKE_TIMEOUT,
            stream.write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE]),
        )
        .await
        .context("timed out writing no-acceptable-method reply")??;
        bail!("client did not offer the NO AUTH method");
    }

    timeout(
        HANDSHAKE_TIMEOUT,
        stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]),
    )
    .await
    .context("timed out writing method-negotiation reply")??;

    Ok(())
}

/// Reads the CONNECT request. On an unsupported command or address type, the
/// matching REP-coded reply (§4.4 steps 4-5) is written before returning an
/// error so the caller only needs to close the socket. On a version mismatch
/// nothing is written, matching scenario S3.
pub async fn read_connect_request<S>(stream: &mut S) -> Result<ConnectRequest>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut header))
        .await
        .context("timed out reading request header")??;
    let (version, cmd, _rsv, atyp) = (header[0], header[1], header[2], header[3]);

    if version != SOCKS_VERSION {
        bail!("unsupported SOCKS version {version} in request");
    }

    if cmd != CMD_CONNECT {
        write_reply(stream, ReplyCode::CommandNotSupported).await?;
        bail!("unsupported command 0x{cmd:02x}, only CONNECT is supported");
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut octets))
                .await
                .context("timed out reading IPv4 address")??;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut len))
                .await
                .context("timed out reading domain length")??;
            let mut domain = vec![0u8; len[0] as usize];
            timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut domain))
                .await
                .context("timed out reading domain name")??;
            String::from_utf8(domain).context("domain name is not valid UTF-8")?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut octets))
                .await
                .context("timed out reading IPv6 address")??;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            write_reply(stream, ReplyCode::AddressTypeNotSupported).await?;
            bail!("unsupported address type 0x{other:02x}");
        }
    };

    let mut port_bytes = [0u8; 2];
    timeout(HANDSHAKE_TIMEOUT, stream.read_exact(&mut port_bytes))
        .await
        .context("timed out reading target port")??;
    let port = u16::from_be_bytes(port_bytes);

    Ok(ConnectRequest { host, port })
}

/// Writes a CONNECT reply with BND.ADDR=0.0.0.0, BND.PORT=0, as permitted by
/// spec §4.4 step 9 (most clients ignore BND in CONNECT responses).
pub async fn write_reply<S>(stream: &mut S, code: ReplyCode) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        SOCKS_VERSION,
        code as u8,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream
        .write_all(&reply)
        .await
        .context("failed to write SOCKS5 reply")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_negotiate_no_auth_success() -> Result<()> {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH]).await?;

        negotiate_no_auth(&mut server).await?;

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await?;
        assert_eq!(reply, [SOCKS_VERSION, METHOD_NO_AUTH]);
        Ok(())
    }

    #[tokio::test]
    async fn test_negotiate_rejects_userpass_only() -> Result<()> {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[SOCKS_VERSION, 1, 0x02]).await?;

        let result = negotiate_no_auth(&mut server).await;
        assert!(result.is_err());

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await?;
        assert_eq!(reply, [SOCKS_VERSION, METHOD_NO_ACCEPTABLE]);
        Ok(())
    }

    #[tokio::test]
    async fn test_version_mismatch_gets_no_reply() -> Result<()> {
        let (mut client, mut server) = duplex(64);
        client.write_all(&[0x04, 0x01, 0x00]).await?;

        let result = negotiate_no_auth(&mut server).await;
        assert!(result.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_read_connect_request_domain() -> Result<()> {
        let (mut client, mut server) = duplex(128);
        let domain = b"example.com";
        let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN];
        request.push(domain.len() as u8);
        request.extend_from_slice(domain);
        request.extend_from_slice(&80u16.to_be_bytes());
        client.write_all(&request).await?;

        let parsed = read_connect_request(&mut server).await?;
        assert_eq!(parsed.host, "example.com");
        assert_eq!(parsed.port, 80);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_connect_request_ipv4() -> Result<()> {
        let (mut client, mut server) = duplex(64);
        client
            .write_all(&[SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4, 93, 184, 216, 34, 0, 80])
            .await?;

        let parsed = read_connect_request(&mut server).await?;
        assert_eq!(parsed.host, "93.184.216.34");
        assert_eq!(parsed.port, 80);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_connect_request_ipv6() -> Result<()> {
        let (mut client, mut server) = duplex(64);
        let addr: Ipv6Addr = "2001:db8::1".parse()?;
        let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV6];
        request.extend_from_slice(&addr.octets());
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await?;

        let parsed = read_connect_request(&mut server).await?;
        assert_eq!(parsed.host, "2001:db8::1");
        assert_eq!(parsed.port, 443);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_connect_request_rejects_bind() -> Result<()> {
        let (mut client, mut server) = duplex(128);
        client
            .write_all(&[SOCKS_VERSION, 0x02, 0x00, ATYP_IPV4, 1, 2, 3, 4, 0, 80])
            .await?;

        let result = read_connect_request(&mut server).await;
        assert!(result.is_err());

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await?;
        assert_eq!(reply[1], ReplyCode::CommandNotSupported as u8);
        Ok(())
    }
}
