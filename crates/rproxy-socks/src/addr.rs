//! SOCKS5 address representation and RFC 1928 ATYP wire encoding.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

/// A destination address as carried in a SOCKS5 request: either a literal IP or a domain name
/// to be resolved by whoever dials it (the client process, never the SOCKS5 front end itself).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl std::fmt::Display for DestAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DestAddr::Ip(addr) => write!(f, "{addr}"),
            DestAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Reads `DST.ADDR`/`DST.PORT` (or `BND.ADDR`/`BND.PORT`) per RFC 1928 §5, given the ATYP byte
/// has already been consumed by the caller.
pub(crate) async fn read_addr_with_atyp(
    stream: &mut (dyn AsyncRwUnpin + Send + Unpin),
    atyp: u8,
) -> io::Result<DestAddr> {
    match atyp {
        0x01 => {
            let ip = Ipv4Addr::from(stream.read_u32().await?);
            let port = stream.read_u16().await?;
            Ok(DestAddr::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port))))
        }
        0x03 => {
            let len = stream.read_u8().await?;
            let mut domain = vec![0; usize::from(len)];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let port = stream.read_u16().await?;
            Ok(DestAddr::Domain(domain, port))
        }
        0x04 => {
            let mut ip = [0; 16];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            Ok(DestAddr::Ip(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(ip), port, 0, 0))))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported address type 0x{other:02x}"),
        )),
    }
}

/// Writes the fixed `0.0.0.0:0` bound address the spec mandates for every CONNECT reply: the
/// real outbound socket lives on the client, not on this SOCKS5 front end, so there is no bound
/// address to truthfully report (RFC 1928 permits this).
pub(crate) async fn write_dummy_bound_addr(stream: &mut (dyn AsyncRwUnpin + Send + Unpin)) -> io::Result<()> {
    // ATYP=IPv4, 0.0.0.0, port 0
    stream.write_all(&[0x01, 0, 0, 0, 0, 0, 0]).await
}

/// Object-safe shorthand for `AsyncRead + AsyncWrite` so the address helpers above can take
/// `&mut dyn` rather than being generic (kept private to this crate).
pub(crate) trait AsyncRwUnpin: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite + ?Sized> AsyncRwUnpin for T {}
