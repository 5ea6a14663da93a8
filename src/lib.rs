//! Event-driven, non-blocking client-side WebSockets for Rust.
//!
//! The host owns the transport and the event loop. A [`WebSocket`] is told when the
//! transport is readable or writable, performs the upgrade, decodes frames out of a fixed
//! ring buffer and reports what happened to a [`Handler`].
#![deny(
    missing_docs,
    missing_copy_implementations,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_must_use,
    unused_mut,
    unused_imports,
    unused_import_braces
)]

pub use http;

pub mod buffer;
pub mod client;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod stream;

pub use crate::{
    buffer::RingBuffer,
    client::{Connector, TcpConnector},
    error::{Error, Result},
    protocol::{
        ConnectionState, Event, Handler, InputStream, Message, OutputStream, StreamSink,
        WebSocket, WebSocketConfig,
    },
};
