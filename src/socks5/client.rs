use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::anyhow;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{
    ReplyCode, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, CMD_CONNECT, DIAL_TIMEOUT, METHOD_NO_AUTH,
    SOCKS_VERSION,
};

/// A dial failure, carrying the REP code that should be sent back to the
/// original ingress client per the mapping table in spec §4.4 step 8.
#[derive(Debug)]
pub struct DialError {
    pub reply_code: ReplyCode,
    pub source: anyhow::Error,
}

impl std::fmt::Display for DialError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl std::error::Error for DialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.source()
    }
}

/// Opens a SOCKS5 CONNECT tunnel through the backend daemon listening on
/// `127.0.0.1:<backend_port>` (the loopback address is a fixed invariant of
/// this gateway, not a configurable one) and returns the established stream
/// once the backend has replied success.
pub async fn dial_via_backend(
    backend_port: u16,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream, DialError> {
    match timeout(
        DIAL_TIMEOUT,
        dial_via_backend_inner(backend_port, target_host, target_port),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(DialError {
            reply_code: ReplyCode::TtlExpired,
            source: anyhow!("dial through backend 127.0.0.1:{backend_port} timed out"),
        }),
    }
}

async fn dial_via_backend_inner(
    backend_port: u16,
    target_host: &str,
    target_port: u16,
) -> Result<TcpStream, DialError> {
    let mut stream = TcpStream::connect(("127.0.0.1", backend_port))
        .await
        .map_err(|e| DialError {
            reply_code: map_connect_io_error(&e),
            source: anyhow::Error::from(e)
                .context(format!("failed to connect to backend 127.0.0.1:{backend_port}")),
        })?;

    stream
        .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
        .await
        .map_err(io_dial_error)?;

    let mut method_reply = [0u8; 2];
    stream
        .read_exact(&mut method_reply)
        .await
        .map_err(io_dial_error)?;
    if method_reply[0] != SOCKS_VERSION || method_reply[1] != METHOD_NO_AUTH {
        return Err(DialError {
            reply_code: ReplyCode::GeneralFailure,
            source: anyhow!("backend refused NO AUTH handshake"),
        });
    }

    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match target_host.parse::<Ipv4Addr>() {
        Ok(ip) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => match target_host.parse::<Ipv6Addr>() {
            Ok(ip) => {
                request.push(ATYP_IPV6);
                request.extend_from_slice(&ip.octets());
            }
            Err(_) => {
                if target_host.len() > u8::MAX as usize {
                    return Err(DialError {
                        reply_code: ReplyCode::GeneralFailure,
                        source: anyhow!(
                            "domain name {target_host:?} is too long to encode in a SOCKS5 request ({} bytes)",
                            target_host.len()
                        ),
                    });
                }
                request.push(ATYP_DOMAIN);
                request.push(target_host.len() as u8);
                request.extend_from_slice(target_host.as_bytes());
            }
        },
    }
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await.map_err(io_dial_error)?;

    let mut reply_header = [0u8; 4];
    stream
        .read_exact(&mut reply_header)
        .await
        .map_err(io_dial_error)?;

    let rep = reply_header[1];
    if rep != ReplyCode::Success as u8 {
        return Err(DialError {
            reply_code: ReplyCode::from_byte(rep),
            source: anyhow!("backend rejected CONNECT with REP=0x{rep:02x}"),
        });
    }

    // Drain BND.ADDR/BND.PORT; the bound address is not used.
    let to_discard = match reply_header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(io_dial_error)?;
            len[0] as usize
        }
        _ => 0,
    };
    let mut discard = vec![0u8; to_discard + 2];
    stream.read_exact(&mut discard).await.map_err(io_dial_error)?;

    Ok(stream)
}

fn io_dial_error(e: std::io::Error) -> DialError {
    DialError {
        reply_code: ReplyCode::GeneralFailure,
        source: e.into(),
    }
}

fn map_connect_io_error(e: &std::io::Error) -> ReplyCode {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
        std::io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
        std::io::ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
        std::io::ErrorKind::TimedOut => ReplyCode::TtlExpired,
        _ => ReplyCode::HostUnreachable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_via_backend_refused() {
        let port = portpicker::pick_unused_port().expect("no free port");
        let err = dial_via_backend(port, "example.com", 80).await.unwrap_err();
        assert_eq!(err.reply_code, ReplyCode::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_dial_via_backend_rejects_oversized_domain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut method_req = [0u8; 3];
            stream.read_exact(&mut method_req).await.unwrap();
            stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await.unwrap();
        });

        let oversized_host = "a".repeat(300);
        let err = dial_via_backend(port, &oversized_host, 443)
            .await
            .unwrap_err();
        assert_eq!(err.reply_code, ReplyCode::GeneralFailure);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_via_backend_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut method_req = [0u8; 3];
            stream.read_exact(&mut method_req).await.unwrap();
            stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await.unwrap();

            let mut header = [0u8; 4];
            stream.read_exact(&mut header).await.unwrap();
            let domain_len = {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await.unwrap();
                len[0] as usize
            };
            let mut domain = vec![0u8; domain_len + 2];
            stream.read_exact(&mut domain).await.unwrap();

            stream
                .write_all(&[SOCKS_VERSION, 0x00, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let stream = dial_via_backend(port, "example.com", 443).await.unwrap();
        drop(stream);
        server.await.unwrap();
    }
}
