use crate::protocol::SignalingMessage;
use crate::signaling::{Error, Signaling};
use crate::utils::escape_abbrev;
use async_trait::async_trait;
use futures::stream::StreamExt;
use futures::SinkExt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

#[allow(unused_imports)]
use log::{debug, error, info, warn};

const MAX_LINE_LENGTH: usize = 1 << 20;
const DIAL_ATTEMPTS: usize = 10;
const DIAL_INTERVAL: Duration = Duration::from_secs(1);

pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

#[derive(Debug, Clone)]
enum Endpoint {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
    Connected,
}

/// Newline-delimited JSON over a TCP or Unix stream socket.
pub struct SocketSignaling {
    endpoint: Endpoint,
    listen: bool,
    framed: Option<Framed<Box<dyn Stream>, LinesCodec>>,
    closed: bool,
}

fn framed(stream: Box<dyn Stream>) -> Framed<Box<dyn Stream>, LinesCodec> {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
}

fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
    )
}

impl SocketSignaling {
    pub fn tcp(host: &str, port: u16, listen: bool) -> Self {
        SocketSignaling {
            endpoint: Endpoint::Tcp {
                host: host.to_string(),
                port,
            },
            listen,
            framed: None,
            closed: false,
        }
    }

    pub fn unix(path: &Path, listen: bool) -> Self {
        SocketSignaling {
            endpoint: Endpoint::Unix(path.to_path_buf()),
            listen,
            framed: None,
            closed: false,
        }
    }

    /// Wraps a stream that is already connected; `connect` is then a no-op.
    pub fn from_stream(stream: impl Stream + 'static) -> Self {
        SocketSignaling {
            endpoint: Endpoint::Connected,
            listen: false,
            framed: Some(framed(Box::new(stream))),
            closed: false,
        }
    }

    async fn accept_tcp(host: &str, port: u16) -> Result<Box<dyn Stream>, Error> {
        let listener = TcpListener::bind((host, port)).await?;
        info!("Waiting for signaling peer on {host}:{port}");
        let (stream, peer) = listener.accept().await?;
        info!("Signaling peer connected from {peer}");
        Ok(Box::new(stream))
    }

    async fn dial_tcp(host: &str, port: u16) -> Result<Box<dyn Stream>, Error> {
        let mut attempt = 1;
        loop {
            match TcpStream::connect((host, port)).await {
                Ok(stream) => {
                    info!("Connected to signaling peer at {host}:{port}");
                    return Ok(Box::new(stream));
                }
                Err(err) if is_retryable(&err) && attempt < DIAL_ATTEMPTS => {
                    debug!("Signaling peer at {host}:{port} not there yet ({err}), retrying");
                    attempt += 1;
                    tokio::time::sleep(DIAL_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    #[cfg(unix)]
    async fn accept_unix(path: &Path) -> Result<Box<dyn Stream>, Error> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => (),
            Err(err) => return Err(err.into()),
        }
        let listener = tokio::net::UnixListener::bind(path)?;
        info!("Waiting for signaling peer on {}", path.display());
        let (stream, _) = listener.accept().await?;
        info!("Signaling peer connected");
        Ok(Box::new(stream))
    }

    #[cfg(unix)]
    async fn dial_unix(path: &Path) -> Result<Box<dyn Stream>, Error> {
        let mut attempt = 1;
        loop {
            match tokio::net::UnixStream::connect(path).await {
                Ok(stream) => return Ok(Box::new(stream)),
                Err(err) if is_retryable(&err) && attempt < DIAL_ATTEMPTS => {
                    debug!("Socket {} not there yet ({err}), retrying", path.display());
                    attempt += 1;
                    tokio::time::sleep(DIAL_INTERVAL).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    #[cfg(not(unix))]
    async fn accept_unix(_path: &Path) -> Result<Box<dyn Stream>, Error> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "Unix sockets are not available").into())
    }

    #[cfg(not(unix))]
    async fn dial_unix(path: &Path) -> Result<Box<dyn Stream>, Error> {
        Self::accept_unix(path).await
    }
}

#[async_trait]
impl Signaling for SocketSignaling {
    async fn connect(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::ClosedError);
        }
        if self.framed.is_some() {
            return Ok(());
        }
        let stream = match (&self.endpoint, self.listen) {
            (Endpoint::Tcp { host, port }, true) => Self::accept_tcp(host, *port).await?,
            (Endpoint::Tcp { host, port }, false) => Self::dial_tcp(host, *port).await?,
            (Endpoint::Unix(path), true) => Self::accept_unix(path).await?,
            (Endpoint::Unix(path), false) => Self::dial_unix(path).await?,
            (Endpoint::Connected, _) => return Err(Error::ClosedError),
        };
        self.framed = Some(framed(stream));
        Ok(())
    }

    async fn send(&mut self, message: &SignalingMessage) -> Result<(), Error> {
        let framed = self.framed.as_mut().ok_or(Error::NotConnectedError)?;
        framed.send(message.to_json()?).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<SignalingMessage, Error> {
        let framed = self.framed.as_mut().ok_or(Error::NotConnectedError)?;
        loop {
            match framed.next().await {
                None => {
                    info!("Signaling peer hung up");
                    return Ok(SignalingMessage::Bye);
                }
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(line)) if line.trim().is_empty() => continue,
                Some(Ok(line)) => {
                    return SignalingMessage::from_json(&line).map_err(|err| {
                        Error::DecodeError(format!("{err} in {}", escape_abbrev(&line, 120)))
                    });
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(mut framed) = self.framed.take() {
            // the peer may have hung up already
            if let Err(err) = framed.send(SignalingMessage::Bye.to_json()?).await {
                debug!("Could not say bye: {err}");
            }
            if let Err(err) = SinkExt::<String>::close(&mut framed).await {
                debug!("Could not shut down signaling socket: {err}");
            }
        }
        if let (Endpoint::Unix(path), true) = (&self.endpoint, self.listen) {
            if let Err(err) = std::fs::remove_file(path) {
                debug!("Could not remove {}: {err}", path.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{IceCandidate, SessionDescription};

    async fn pair() -> (SocketSignaling, SocketSignaling) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            SocketSignaling::from_stream(dialed.unwrap()),
            SocketSignaling::from_stream(accepted.unwrap().0),
        )
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (mut here, mut there) = pair().await;
        here.connect().await.unwrap();
        let offer = SignalingMessage::Description(SessionDescription::offer("v=0\r\n"));
        let candidate = SignalingMessage::Candidate(IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        });
        here.send(&offer).await.unwrap();
        here.send(&candidate).await.unwrap();
        assert_eq!(there.recv().await.unwrap(), offer);
        assert_eq!(there.recv().await.unwrap(), candidate);
    }

    #[tokio::test]
    async fn test_close_says_bye_then_eof_is_bye() {
        let (mut here, mut there) = pair().await;
        here.close().await.unwrap();
        here.close().await.unwrap();
        assert_eq!(there.recv().await.unwrap(), SignalingMessage::Bye);
        // the socket is shut down after the explicit bye
        assert_eq!(there.recv().await.unwrap(), SignalingMessage::Bye);
        assert!(matches!(
            here.send(&SignalingMessage::Bye).await,
            Err(Error::NotConnectedError)
        ));
    }

    #[tokio::test]
    async fn test_garbage_line_is_a_decode_error() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut raw = framed(Box::new(dialed.unwrap()));
        let mut there = SocketSignaling::from_stream(accepted.unwrap().0);
        raw.send("this is not json".to_string()).await.unwrap();
        raw.send(r#"{"type":"bye"}"#.to_string()).await.unwrap();
        let err = there.recv().await.unwrap_err();
        assert!(!err.is_transport());
        assert_eq!(there.recv().await.unwrap(), SignalingMessage::Bye);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_listen_and_dial() {
        let dir = tempdir::TempDir::new("rtcsession-signaling").unwrap();
        let path = dir.path().join("signaling.socket");
        let mut listener = SocketSignaling::unix(&path, true);
        let mut dialer = SocketSignaling::unix(&path, false);
        let (listened, dialed) = tokio::join!(listener.connect(), dialer.connect());
        listened.unwrap();
        dialed.unwrap();
        dialer.send(&SignalingMessage::Bye).await.unwrap();
        assert_eq!(listener.recv().await.unwrap(), SignalingMessage::Bye);
        listener.close().await.unwrap();
        assert!(!path.exists());
    }
}
