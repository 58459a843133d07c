//! Server-side SOCKS5 front end for the reverse SOCKS5 proxy's user channels.
//!
//! Implements the RFC 1928 + RFC 1929 subset the protocol needs: method
//! negotiation restricted to USERNAME/PASSWORD, the SOCKS5 username doubling
//! as the target client's registry key, CONNECT as the only supported
//! command, and IPv4/domain/IPv6 addresses.

mod addr;

pub use addr::DestAddr;

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

const SOCKS_VERSION: u8 = 0x05;
const PASSWORD_NEGOTIATION_VERSION: u8 = 0x01;
const NO_AUTH_REQUIRED: u8 = 0x00;
const USERNAME_PASSWORD: u8 = 0x02;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

/// RFC 1928 `REP` failure codes.
#[derive(Clone, Copy, Debug)]
#[repr(u8)]
pub enum Socks5FailureCode {
    GeneralSocksServerFailure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Socks5FailureCode {
    fn as_u8(self) -> u8 {
        self as u8
    }
}

impl From<&io::Error> for Socks5FailureCode {
    fn from(_: &io::Error) -> Self {
        Socks5FailureCode::GeneralSocksServerFailure
    }
}

/// Why acceptance of a user channel stopped short of the READY/connected state.
///
/// In every variant except [`AcceptError::Io`] the appropriate SOCKS5 reply has already been
/// written to the socket; the caller only needs to close it.
#[derive(Debug)]
pub enum AcceptError {
    Io(io::Error),
    /// Handshake offered no method this server accepts (i.e. no USERNAME_PASSWORD). `05 FF` sent.
    NoAcceptableAuthMethod,
    /// Username/password authentication failed. `01 01` sent.
    AuthFailed,
    /// BIND or UDP ASSOCIATE requested. `05 07 ...` sent.
    UnsupportedCommand,
    /// Unknown ATYP. `05 08 ...` sent.
    UnsupportedAddressType,
}

impl std::error::Error for AcceptError {}

impl std::fmt::Display for AcceptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcceptError::Io(e) => write!(f, "io error: {e}"),
            AcceptError::NoAcceptableAuthMethod => write!(f, "no acceptable authentication method"),
            AcceptError::AuthFailed => write!(f, "username/password authentication failed"),
            AcceptError::UnsupportedCommand => write!(f, "unsupported SOCKS5 command"),
            AcceptError::UnsupportedAddressType => write!(f, "unsupported address type"),
        }
    }
}

impl From<io::Error> for AcceptError {
    fn from(e: io::Error) -> Self {
        AcceptError::Io(e)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

/// A user channel accepted through method negotiation, password auth, and CONNECT parsing.
///
/// The caller is expected to, in order: look up or reject `client_key`, mint a `userId`, insert
/// it into the control channel's user map, and only then call [`Socks5Acceptor::connected`] —
/// this ordering is what guarantees a TRANSFER can never race the registration (see spec §5).
pub struct Socks5Acceptor<S> {
    inner: S,
    client_key: String,
    dest: DestAddr,
}

impl<S> Socks5Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Runs the handshake through CONNECT parsing. `verify_password` receives `(client_key,
    /// password)` and returns whether the pair is accepted (the password is a single server-wide
    /// shared secret; `client_key` is only looked up by the caller, not verified here).
    pub async fn accept(mut stream: S, verify_password: impl Fn(&str, &str) -> bool) -> Result<Self, AcceptError> {
        negotiate_method(&mut stream).await?;
        let client_key = password_auth(&mut stream, verify_password).await?;
        let (command, dest) = read_request(&mut stream).await?;

        if command != Command::Connect {
            write_reply(&mut stream, Socks5FailureCode::CommandNotSupported.as_u8()).await?;
            return Err(AcceptError::UnsupportedCommand);
        }

        Ok(Self { inner: stream, client_key, dest })
    }

    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    pub fn dest_addr(&self) -> &DestAddr {
        &self.dest
    }

    /// Writes the CONNECT success reply (always `0.0.0.0:0`, per spec §4.2) and hands back the
    /// raw stream for relay.
    pub async fn connected(mut self) -> io::Result<S> {
        write_reply(&mut self.inner, 0x00).await?;
        Ok(self.inner)
    }

    /// Writes a failure reply and consumes the stream.
    pub async fn failed(mut self, code: Socks5FailureCode) -> io::Result<()> {
        write_reply(&mut self.inner, code.as_u8()).await
    }
}

async fn negotiate_method<S: AsyncRead + AsyncWrite + Unpin>(stream: &mut S) -> Result<(), AcceptError> {
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        stream.write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS]).await?;
        return Err(AcceptError::NoAcceptableAuthMethod);
    }

    let nmethods = stream.read_u8().await?;
    let mut methods = vec![0u8; usize::from(nmethods)];
    stream.read_exact(&mut methods).await?;

    if methods.contains(&USERNAME_PASSWORD) {
        stream.write_all(&[SOCKS_VERSION, USERNAME_PASSWORD]).await?;
        Ok(())
    } else {
        stream.write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS]).await?;
        Err(AcceptError::NoAcceptableAuthMethod)
    }
}

async fn password_auth<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    verify_password: impl Fn(&str, &str) -> bool,
) -> Result<String, AcceptError> {
    let version = stream.read_u8().await?;
    if version != PASSWORD_NEGOTIATION_VERSION {
        stream.write_all(&[PASSWORD_NEGOTIATION_VERSION, 0xFF]).await?;
        return Err(AcceptError::AuthFailed);
    }

    let username_len = usize::from(stream.read_u8().await?);
    let mut username = vec![0u8; username_len];
    stream.read_exact(&mut username).await?;
    let username = String::from_utf8_lossy(&username).into_owned();

    let password_len = usize::from(stream.read_u8().await?);
    let mut password = vec![0u8; password_len];
    stream.read_exact(&mut password).await?;
    let password = String::from_utf8_lossy(&password).into_owned();

    if verify_password(&username, &password) {
        stream.write_all(&[PASSWORD_NEGOTIATION_VERSION, 0x00]).await?;
        Ok(username)
    } else {
        stream.write_all(&[PASSWORD_NEGOTIATION_VERSION, 0x01]).await?;
        Err(AcceptError::AuthFailed)
    }
}

async fn read_request<S: AsyncRead + AsyncWrite + Unpin + Send>(
    stream: &mut S,
) -> Result<(Command, DestAddr), AcceptError> {
    let version = stream.read_u8().await?;
    if version != SOCKS_VERSION {
        write_reply(stream, Socks5FailureCode::GeneralSocksServerFailure.as_u8()).await?;
        return Err(AcceptError::Io(io::Error::new(io::ErrorKind::InvalidData, "bad request version")));
    }

    let cmd_byte = stream.read_u8().await?;
    let command = match cmd_byte {
        0x01 => Command::Connect,
        0x02 => Command::Bind,
        0x03 => Command::UdpAssociate,
        _ => {
            write_reply(stream, Socks5FailureCode::CommandNotSupported.as_u8()).await?;
            return Err(AcceptError::UnsupportedCommand);
        }
    };

    let _reserved = stream.read_u8().await?;
    let atyp = stream.read_u8().await?;

    let dest = match addr::read_addr_with_atyp(stream, atyp).await {
        Ok(dest) => dest,
        Err(_) => {
            write_reply(stream, Socks5FailureCode::AddressTypeNotSupported.as_u8()).await?;
            return Err(AcceptError::UnsupportedAddressType);
        }
    };

    Ok((command, dest))
}

async fn write_reply<S: AsyncRead + AsyncWrite + Unpin + Send>(stream: &mut S, rep: u8) -> io::Result<()> {
    stream.write_all(&[SOCKS_VERSION, rep, 0x00]).await?;
    addr::write_dummy_bound_addr(stream).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_ok(_user: &str, _pass: &str) -> bool {
        true
    }

    #[tokio::test]
    async fn handshake_rejected_when_only_no_auth_offered() {
        let mut server = tokio_test::io::Builder::new()
            .read(&[0x05, 0x01, 0x00])
            .write(&[0x05, 0xFF])
            .build();

        let err = Socks5Acceptor::accept(&mut server, always_ok).await.unwrap_err();
        assert!(matches!(err, AcceptError::NoAcceptableAuthMethod));
    }

    #[tokio::test]
    async fn happy_path_connect() {
        let mut request = vec![0x05, 0x01, 0x02]; // method negotiation
        let mut auth = vec![0x01, 6];
        auth.extend_from_slice(b"ZC-ABC");
        auth.push(5);
        auth.extend_from_slice(b"11111");
        request.extend(auth);
        request.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, 0, 80]);

        let mut server = tokio_test::io::Builder::new()
            .read(&request)
            .write(&[0x05, 0x02])
            .write(&[0x01, 0x00])
            .build();

        let acceptor = Socks5Acceptor::accept(&mut server, always_ok).await.unwrap();
        assert_eq!(acceptor.client_key(), "ZC-ABC");
        assert_eq!(acceptor.dest_addr(), &DestAddr::Ip("127.0.0.1:80".parse().unwrap()));
    }

    #[tokio::test]
    async fn bad_password_is_rejected() {
        let mut request = vec![0x05, 0x01, 0x02];
        let mut auth = vec![0x01, 6];
        auth.extend_from_slice(b"ZC-ABC");
        auth.push(5);
        auth.extend_from_slice(b"wrong");
        request.extend(auth);

        let mut server = tokio_test::io::Builder::new()
            .read(&request)
            .write(&[0x05, 0x02])
            .write(&[0x01, 0x01])
            .build();

        let err = Socks5Acceptor::accept(&mut server, |_, pass| pass == "11111")
            .await
            .unwrap_err();
        assert!(matches!(err, AcceptError::AuthFailed));
    }

    #[tokio::test]
    async fn bind_command_is_rejected() {
        let mut request = vec![0x05, 0x01, 0x02];
        let mut auth = vec![0x01, 6];
        auth.extend_from_slice(b"ZC-ABC");
        auth.push(5);
        auth.extend_from_slice(b"11111");
        request.extend(auth);
        request.extend_from_slice(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80]);

        let mut server = tokio_test::io::Builder::new()
            .read(&request)
            .write(&[0x05, 0x02])
            .write(&[0x01, 0x00])
            .write(&[0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .build();

        let err = Socks5Acceptor::accept(&mut server, always_ok).await.unwrap_err();
        assert!(matches!(err, AcceptError::UnsupportedCommand));
    }
}
