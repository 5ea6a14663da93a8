//! Opening transports for a WebSocket URL.

use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
};

use log::*;
use url::Url;

use crate::{
    error::{Error, Result, UrlError},
    stream::{MaybeTlsStream, Mode, NoDelay},
};

/// Produces the transport a [`WebSocket`](crate::WebSocket) runs over.
///
/// The returned stream must be in non-blocking mode: `WouldBlock` means "nothing right
/// now" and the host calls back on the next readiness event.
pub trait Connector {
    /// The transport type.
    type Stream: Read + Write;

    /// Open a transport to `host:port`, wrapped in TLS for [`Mode::Tls`].
    fn connect(&mut self, host: &str, port: u16, mode: Mode) -> Result<Self::Stream>;
}

#[cfg(feature = "native-tls")]
mod encryption {
    use native_tls_crate::{HandshakeError as TlsHandshakeError, TlsConnector};
    use std::net::TcpStream;

    use crate::{
        error::Result,
        stream::{MaybeTlsStream, Mode},
        Error,
    };

    pub fn wrap_stream(
        socket: TcpStream,
        domain: &str,
        mode: Mode,
        tls_connector: Option<&TlsConnector>,
    ) -> Result<MaybeTlsStream<TcpStream>> {
        match mode {
            Mode::Plain => Ok(MaybeTlsStream::Plain(socket)),
            Mode::Tls => {
                let connector = match tls_connector {
                    Some(connector) => connector.clone(),
                    None => TlsConnector::new()?,
                };
                // The socket is still blocking here, so the handshake runs to completion.
                match connector.connect(domain, socket) {
                    Ok(s) => Ok(MaybeTlsStream::NativeTls(s)),
                    Err(TlsHandshakeError::Failure(f)) => Err(Error::Tls(f)),
                    Err(TlsHandshakeError::WouldBlock(_)) => Err(Error::Io(
                        std::io::Error::new(std::io::ErrorKind::WouldBlock, "TLS handshake"),
                    )),
                }
            }
        }
    }

    pub fn set_nonblocking(stream: &MaybeTlsStream<TcpStream>) -> std::io::Result<()> {
        match stream {
            MaybeTlsStream::Plain(s) => s.set_nonblocking(true),
            MaybeTlsStream::NativeTls(s) => s.get_ref().set_nonblocking(true),
        }
    }
}

#[cfg(not(feature = "native-tls"))]
mod encryption {
    use std::net::TcpStream;

    use crate::{
        error::{Error, Result, UrlError},
        stream::{MaybeTlsStream, Mode},
    };

    pub fn wrap_stream(
        socket: TcpStream,
        _domain: &str,
        mode: Mode,
    ) -> Result<MaybeTlsStream<TcpStream>> {
        match mode {
            Mode::Plain => Ok(MaybeTlsStream::Plain(socket)),
            Mode::Tls => Err(Error::Url(UrlError::TlsFeatureNotEnabled)),
        }
    }

    pub fn set_nonblocking(stream: &MaybeTlsStream<TcpStream>) -> std::io::Result<()> {
        match stream {
            MaybeTlsStream::Plain(s) => s.set_nonblocking(true),
        }
    }
}

/// Connects over TCP, with TLS when the `native-tls` feature is enabled.
#[derive(Default)]
#[allow(missing_debug_implementations, missing_copy_implementations)]
pub struct TcpConnector {
    #[cfg(feature = "native-tls")]
    tls: Option<native_tls_crate::TlsConnector>,
}

impl TcpConnector {
    /// A connector with the platform's default TLS settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// A connector using `connector` for `wss://` URLs.
    #[cfg(feature = "native-tls")]
    pub fn with_tls(connector: native_tls_crate::TlsConnector) -> Self {
        TcpConnector { tls: Some(connector) }
    }

    fn wrap(&self, socket: TcpStream, domain: &str, mode: Mode) -> Result<MaybeTlsStream<TcpStream>> {
        #[cfg(feature = "native-tls")]
        return encryption::wrap_stream(socket, domain, mode, self.tls.as_ref());
        #[cfg(not(feature = "native-tls"))]
        return encryption::wrap_stream(socket, domain, mode);
    }
}

impl Connector for TcpConnector {
    type Stream = MaybeTlsStream<TcpStream>;

    fn connect(&mut self, host: &str, port: u16, mode: Mode) -> Result<Self::Stream> {
        // Without TLS support there is no point in resolving anything.
        #[cfg(not(feature = "native-tls"))]
        if mode == Mode::Tls {
            return Err(Error::Url(UrlError::TlsFeatureNotEnabled));
        }

        for addr in (host, port).to_socket_addrs()? {
            debug!("Trying to contact {}:{} at {}...", host, port, addr);
            let Ok(raw_stream) = TcpStream::connect(addr) else {
                continue;
            };
            let mut stream = self.wrap(raw_stream, host, mode)?;
            NoDelay::set_nodelay(&mut stream, true)?;
            encryption::set_nonblocking(&stream)?;
            return Ok(stream);
        }
        Err(Error::Url(UrlError::UnableToConnect(format!("{host}:{port}"))))
    }
}

/// Get the mode of the given URL.
pub fn url_mode(url: &Url) -> Result<Mode> {
    match url.scheme() {
        "ws" => Ok(Mode::Plain),
        "wss" => Ok(Mode::Tls),
        _ => Err(Error::Url(UrlError::UnsupportedUrlScheme)),
    }
}

/// Validate a WebSocket URL and work out where to connect.
///
/// Returns the host, the port (the scheme's default when none is given) and the mode.
pub fn target(url: &Url) -> Result<(String, u16, Mode)> {
    let mode = url_mode(url)?;
    let host = match url.host_str() {
        None => return Err(Error::Url(UrlError::NoHostName)),
        Some("") => return Err(Error::Url(UrlError::EmptyHostName)),
        // `Url` keeps IPv6 addresses in brackets; sockets want them bare.
        Some(host) => host.trim_start_matches('[').trim_end_matches(']').to_owned(),
    };
    let port = url.port().unwrap_or_else(|| mode.default_port());
    Ok((host, port, mode))
}
