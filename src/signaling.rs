use crate::copy_paste_signaling::CopyPasteSignaling;
use crate::protocol::{Role, SignalingMessage};
use crate::socket_signaling::SocketSignaling;
use async_trait::async_trait;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    CodecError(#[from] tokio_util::codec::LinesCodecError),

    #[error("Cannot decode signaling message: {}", .0)]
    DecodeError(String),

    #[error(transparent)]
    EncodeError(#[from] serde_json::Error),

    #[error("Signaling channel is not connected")]
    NotConnectedError,

    #[error("Signaling channel was closed")]
    ClosedError,

    #[error("Unknown signaling method {:?}", .0)]
    UnknownMethodError(String),
}

impl Error {
    /// Transport errors end the session; anything else only costs the
    /// message at hand.
    pub fn is_transport(&self) -> bool {
        !matches!(self, Error::DecodeError(_) | Error::UnknownMethodError(_))
    }
}

/// An ordered, bidirectional channel of signaling messages.
///
/// `recv` is raced against other work with `select!`, so it must be cancel
/// safe: dropping its future must not lose a message. A channel that the
/// remote end closed yields `SignalingMessage::Bye`.
#[async_trait]
pub trait Signaling: Send {
    async fn connect(&mut self) -> Result<(), Error>;
    async fn send(&mut self, message: &SignalingMessage) -> Result<(), Error>;
    async fn recv(&mut self) -> Result<SignalingMessage, Error>;
    /// Sends a best-effort `Bye` and releases the channel. Calling it again
    /// does nothing.
    async fn close(&mut self) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    CopyAndPaste,
    TcpSocket,
    UnixSocket,
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "copy-and-paste" => Ok(Method::CopyAndPaste),
            "tcp-socket" => Ok(Method::TcpSocket),
            "unix-socket" => Ok(Method::UnixSocket),
            other => Err(Error::UnknownMethodError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingConfig {
    pub method: Method,
    pub host: String,
    pub port: u16,
    pub path: PathBuf,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        SignalingConfig {
            method: Method::CopyAndPaste,
            host: "127.0.0.1".to_string(),
            port: 1234,
            path: PathBuf::from("rtcsession.socket"),
        }
    }
}

/// Socket transports need one listening end: the offerer listens, the
/// answerer dials.
pub fn create_signaling(config: &SignalingConfig, role: Role) -> Box<dyn Signaling> {
    let listen = role == Role::Offerer;
    match config.method {
        Method::CopyAndPaste => Box::new(CopyPasteSignaling::new()),
        Method::TcpSocket => Box::new(SocketSignaling::tcp(&config.host, config.port, listen)),
        Method::UnixSocket => Box::new(SocketSignaling::unix(&config.path, listen)),
    }
}
