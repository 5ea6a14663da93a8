#![cfg(not(feature = "native-tls"))]

use std::sync::mpsc::channel;

use ripple_ws::{error::UrlError, ConnectionState, Error, Event, TcpConnector, WebSocket};

#[test]
fn wss_url_fails_when_no_tls_support() {
    let (tx, rx) = channel();
    let mut ws = WebSocket::new(tx);
    let res = ws.open("wss://127.0.0.1/ws", &mut TcpConnector::new());
    eprintln!("{:?}", res);
    assert!(matches!(res, Err(Error::Url(UrlError::TlsFeatureNotEnabled))));
    assert_eq!(ws.state(), ConnectionState::Idle);
    assert!(matches!(rx.try_recv(), Ok(Event::Error(_))));
}
