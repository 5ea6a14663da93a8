//! Client handshake machine.

use std::io::{ErrorKind, Read, Write};

use http::{header, HeaderMap, HeaderName, StatusCode};
use httparse::Status;
use log::*;
use url::Url;

use super::{derive_accept_key, generate_key, MAX_HANDSHAKE_SIZE, MAX_HEADERS};
use crate::error::{CapacityError, Error, ProtocolError, Result, UrlError};

/// Server response.
pub type Response = http::Response<()>;

/// Headers the handshake writes itself; callers may not supply them.
pub(crate) const RESERVED_HEADERS: [HeaderName; 5] = [
    header::HOST,
    header::UPGRADE,
    header::CONNECTION,
    header::SEC_WEBSOCKET_VERSION,
    header::SEC_WEBSOCKET_KEY,
];

/// Client side of the opening handshake.
///
/// The request is built once. It is written out over as many writable events as the
/// transport needs and never re-sent; the response is accumulated until its head is
/// complete.
#[derive(Debug)]
pub struct ClientHandshake {
    request: Vec<u8>,
    written: usize,
    response: Vec<u8>,
    /// Expected `Sec-WebSocket-Accept`, when it is checked.
    accept_key: Option<String>,
}

impl ClientHandshake {
    /// Prepare the upgrade request for `url`.
    pub fn new(url: &Url, extra_headers: &HeaderMap, verify_accept_key: bool) -> Result<Self> {
        let key = generate_key();
        let request = build_request(url, &key, extra_headers)?;
        let accept_key = verify_accept_key.then(|| derive_accept_key(key.as_bytes()));
        Ok(ClientHandshake { request, written: 0, response: Vec::new(), accept_key })
    }

    /// The raw request bytes.
    pub fn request(&self) -> &[u8] {
        &self.request
    }

    /// Whether the whole request reached the transport.
    pub fn is_request_sent(&self) -> bool {
        self.written == self.request.len()
    }

    /// Write as much of the pending request as the transport accepts.
    pub fn write_request<S: Write>(&mut self, stream: &mut S) -> Result<()> {
        while !self.is_request_sent() {
            match stream.write(&self.request[self.written..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => self.written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        if self.is_request_sent() {
            debug!("Upgrade request sent ({} bytes)", self.request.len());
            stream.flush().or_else(|e| match e.kind() {
                ErrorKind::WouldBlock => Ok(()),
                _ => Err(e),
            })?;
        }
        Ok(())
    }

    /// Read what the transport has and try to complete the response.
    ///
    /// Returns the verified response and any bytes the server sent after it, or `None`
    /// while the response head is incomplete.
    pub fn read_response<S: Read>(
        &mut self,
        stream: &mut S,
    ) -> Result<Option<(Response, Vec<u8>)>> {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return Err(Error::Protocol(ProtocolError::HandshakeIncomplete)),
                Ok(n) => {
                    self.response.extend_from_slice(&chunk[..n]);
                    if let Some(done) = self.try_parse()? {
                        return Ok(Some(done));
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn try_parse(&mut self) -> Result<Option<(Response, Vec<u8>)>> {
        match parse_response(&self.response)? {
            Some((size, response)) => {
                self.verify(&response)?;
                let rest = self.response.split_off(size);
                debug!("Client handshake done.");
                Ok(Some((response, rest)))
            }
            None if self.response.len() > MAX_HANDSHAKE_SIZE => {
                Err(Error::Capacity(CapacityError::HeaderTooLong))
            }
            None => {
                trace!("Handshake response incomplete ({} bytes)", self.response.len());
                Ok(None)
            }
        }
    }

    fn verify(&self, response: &Response) -> Result<()> {
        // 1. If the status code received from the server is not 101, the
        // client handles the response per HTTP [RFC2616] procedures. (RFC 6455)
        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            return Err(Error::Http(response.status()));
        }
        // 4. If the response lacks a |Sec-WebSocket-Accept| header field or
        // the |Sec-WebSocket-Accept| contains a value other than the
        // base64-encoded SHA-1 of ... the client MUST _Fail the WebSocket
        // Connection_. (RFC 6455)
        if let Some(accept_key) = &self.accept_key {
            if !response
                .headers()
                .get(header::SEC_WEBSOCKET_ACCEPT)
                .map_or(false, |h| h == accept_key.as_str())
            {
                return Err(Error::Protocol(ProtocolError::SecWebSocketAcceptKeyMismatch));
            }
        }
        Ok(())
    }
}

fn build_request(url: &Url, key: &str, extra_headers: &HeaderMap) -> Result<Vec<u8>> {
    let host = url.host_str().ok_or(Error::Url(UrlError::NoHostName))?;
    if host.is_empty() {
        return Err(Error::Url(UrlError::EmptyHostName));
    }
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    };
    let path = match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_owned(),
    };
    let path = if path.is_empty() { "/".to_owned() } else { path };

    if let Some(name) = RESERVED_HEADERS.iter().find(|name| extra_headers.contains_key(*name)) {
        return Err(Error::Protocol(ProtocolError::ReservedHeader(name.clone())));
    }

    let mut req = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n",
    )
    .into_bytes();
    if !extra_headers.contains_key(header::ORIGIN) {
        req.extend_from_slice(format!("Origin: {}://{}\r\n", url.scheme(), host).as_bytes());
    }
    req.extend_from_slice(
        format!("Sec-WebSocket-Version: 13\r\nSec-WebSocket-Key: {key}\r\n").as_bytes(),
    );
    for (name, value) in extra_headers {
        req.extend_from_slice(name.as_str().as_bytes());
        req.extend_from_slice(b": ");
        req.extend_from_slice(value.as_bytes());
        req.extend_from_slice(b"\r\n");
    }
    req.extend_from_slice(b"\r\n");
    trace!("Request: {:?}", String::from_utf8_lossy(&req));
    Ok(req)
}

/// Parse a response head, returning its size and the response.
fn parse_response(buf: &[u8]) -> Result<Option<(usize, Response)>> {
    let mut hbuffer = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut raw = httparse::Response::new(&mut hbuffer);
    let size = match raw.parse(buf)? {
        Status::Partial => return Ok(None),
        Status::Complete(size) => size,
    };

    let code = raw.code.ok_or(Error::Protocol(ProtocolError::HandshakeIncomplete))?;
    let mut response = Response::new(());
    *response.status_mut() = StatusCode::from_u16(code)?;
    let headers = response.headers_mut();
    for h in raw.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())?;
        headers.append(name, header::HeaderValue::from_bytes(h.value)?);
    }
    Ok(Some((size, response)))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{self, Cursor};

    use http::HeaderValue;

    const RESPONSE: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn request_text(url_str: &str, extra: &HeaderMap) -> String {
        let hs = ClientHandshake::new(&url(url_str), extra, false).unwrap();
        String::from_utf8(hs.request().to_vec()).unwrap()
    }

    /// Hands out its data in steps, then reports `WouldBlock`.
    struct Chunked(Vec<Vec<u8>>);

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let chunk = self.0.remove(0);
            buf[..chunk.len()].copy_from_slice(&chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn request_formatting() {
        let text = request_text("ws://localhost/getCaseCount", &HeaderMap::new());
        assert!(text.starts_with("GET /getCaseCount HTTP/1.1\r\nHost: localhost\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains("Origin: ws://localhost\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn request_layout() {
        let req = build_request(&url("ws://localhost:8080/chat"), "dGhlIHNhbXBsZSBub25jZQ==", &HeaderMap::new())
            .unwrap();
        assert_eq!(
            String::from_utf8(req).unwrap(),
            "GET /chat HTTP/1.1\r\n\
             Host: localhost:8080\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Origin: ws://localhost:8080\r\n\
             Sec-WebSocket-Version: 13\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             \r\n"
        );
    }

    #[test]
    fn request_formatting_with_port_and_query() {
        let text = request_text("ws://localhost:9001/runCase?case=1&agent=ripple", &HeaderMap::new());
        assert!(text.starts_with("GET /runCase?case=1&agent=ripple HTTP/1.1\r\n"));
        assert!(text.contains("Host: localhost:9001\r\n"));
    }

    #[test]
    fn request_formatting_root_path() {
        let text = request_text("wss://echo.websocket.org", &HeaderMap::new());
        assert!(text.starts_with("GET / HTTP/1.1\r\nHost: echo.websocket.org\r\n"));
        assert!(text.contains("Origin: wss://echo.websocket.org\r\n"));
    }

    #[test]
    fn extra_headers() {
        let mut extra = HeaderMap::new();
        extra.insert("sec-websocket-protocol", HeaderValue::from_static("chat"));
        extra.insert(header::ORIGIN, HeaderValue::from_static("https://example.com"));
        let text = request_text("ws://localhost/", &extra);
        assert!(text.contains("sec-websocket-protocol: chat\r\n"));
        assert!(text.contains("origin: https://example.com\r\n"));
        assert!(!text.contains("Origin: ws://localhost"));
    }

    #[test]
    fn reserved_header_is_rejected() {
        let mut extra = HeaderMap::new();
        extra.insert(header::HOST, HeaderValue::from_static("elsewhere"));
        let err = ClientHandshake::new(&url("ws://localhost/"), &extra, false).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::ReservedHeader(ref h)) if *h == header::HOST));
    }

    #[test]
    fn response_parsing() {
        let (size, resp) = parse_response(RESPONSE).unwrap().unwrap();
        assert_eq!(size, RESPONSE.len());
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(resp.headers().get("upgrade").unwrap(), "websocket");
    }

    #[test]
    fn response_split_across_reads_keeps_trailing_bytes() {
        let mut hs = ClientHandshake::new(&url("ws://localhost/"), &HeaderMap::new(), false).unwrap();
        let mut tail = RESPONSE[20..].to_vec();
        tail.extend_from_slice(&[0x81, 0x00]);
        let mut stream = Chunked(vec![RESPONSE[..20].to_vec(), tail]);

        let (resp, rest) = hs.read_response(&mut stream).unwrap().unwrap();
        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(rest, vec![0x81, 0x00]);
    }

    #[test]
    fn partial_response_waits() {
        let mut hs = ClientHandshake::new(&url("ws://localhost/"), &HeaderMap::new(), false).unwrap();
        let mut stream = Chunked(vec![RESPONSE[..30].to_vec()]);
        assert!(hs.read_response(&mut stream).unwrap().is_none());
    }

    #[test]
    fn eof_before_response_is_complete() {
        let mut hs = ClientHandshake::new(&url("ws://localhost/"), &HeaderMap::new(), false).unwrap();
        let mut stream = Cursor::new(RESPONSE[..30].to_vec());
        let err = hs.read_response(&mut stream).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::HandshakeIncomplete)));
    }

    #[test]
    fn non_101_status() {
        let mut hs = ClientHandshake::new(&url("ws://localhost/"), &HeaderMap::new(), false).unwrap();
        let mut stream = Chunked(vec![b"HTTP/1.1 404 Not Found\r\n\r\n".to_vec()]);
        let err = hs.read_response(&mut stream).unwrap_err();
        assert!(matches!(err, Error::Http(StatusCode::NOT_FOUND)));
    }

    #[test]
    fn accept_key_mismatch() {
        let mut hs = ClientHandshake::new(&url("ws://localhost/"), &HeaderMap::new(), true).unwrap();
        let mut stream = Chunked(vec![RESPONSE.to_vec()]);
        let err = hs.read_response(&mut stream).unwrap_err();
        assert!(matches!(err, Error::Protocol(ProtocolError::SecWebSocketAcceptKeyMismatch)));
    }

    #[test]
    fn oversized_response_head() {
        let mut hs = ClientHandshake::new(&url("ws://localhost/"), &HeaderMap::new(), false).unwrap();
        let mut head = b"HTTP/1.1 101 Switching Protocols\r\nX-Filler: ".to_vec();
        head.extend(std::iter::repeat(b'a').take(MAX_HANDSHAKE_SIZE));
        let chunks = head.chunks(4096).map(<[u8]>::to_vec).collect();
        let err = hs.read_response(&mut Chunked(chunks)).unwrap_err();
        assert!(matches!(err, Error::Capacity(CapacityError::HeaderTooLong)));
    }

    #[test]
    fn request_written_over_several_events() {
        struct Trickle(Vec<u8>, usize);
        impl Write for Trickle {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if self.1 == 0 {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                self.1 -= 1;
                let n = buf.len().min(10);
                self.0.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut hs = ClientHandshake::new(&url("ws://localhost/"), &HeaderMap::new(), false).unwrap();
        let mut stream = Trickle(Vec::new(), 3);
        hs.write_request(&mut stream).unwrap();
        assert!(!hs.is_request_sent());
        assert_eq!(stream.0.len(), 30);

        stream.1 = usize::MAX;
        hs.write_request(&mut stream).unwrap();
        assert!(hs.is_request_sent());
        assert_eq!(stream.0, hs.request());
    }
}
