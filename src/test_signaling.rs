use crate::protocol::SignalingMessage;
use crate::signaling::{Error, Signaling};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::StreamExt;
use futures::SinkExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, warn};

/// One end of an in-memory signaling channel. Messages travel as JSON
/// strings so that the wire format is exercised too.
pub struct TestSignaling {
    label: &'static str,
    rx: mpsc::Receiver<String>,
    tx: Option<mpsc::Sender<String>>,
    connected: bool,
    closes: Arc<AtomicUsize>,
}

/// Counts what happened to a `TestSignaling` after it was moved away.
#[derive(Clone)]
pub struct TestSignalingProbe {
    closes: Arc<AtomicUsize>,
}

impl TestSignalingProbe {
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl TestSignaling {
    pub fn new(label: &'static str, rx: mpsc::Receiver<String>, tx: mpsc::Sender<String>) -> Self {
        TestSignaling {
            label,
            rx,
            tx: Some(tx),
            connected: false,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn probe(&self) -> TestSignalingProbe {
        TestSignalingProbe {
            closes: self.closes.clone(),
        }
    }

    /// Two connected ends, labelled for the log.
    pub fn pair(here: &'static str, there: &'static str) -> (TestSignaling, TestSignaling) {
        let (here_tx, here_rx) = mpsc::channel::<String>(32);
        let (there_tx, there_rx) = mpsc::channel::<String>(32);
        (
            TestSignaling::new(here, here_rx, there_tx),
            TestSignaling::new(there, there_rx, here_tx),
        )
    }

    /// Pushes a raw line to the other end, bypassing encoding.
    pub async fn send_raw(&mut self, line: &str) -> Result<(), Error> {
        let tx = self.tx.as_mut().ok_or(Error::ClosedError)?;
        tx.send(line.to_string())
            .await
            .map_err(|_| Error::ClosedError)
    }
}

#[async_trait]
impl Signaling for TestSignaling {
    async fn connect(&mut self) -> Result<(), Error> {
        if self.tx.is_none() {
            return Err(Error::ClosedError);
        }
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, message: &SignalingMessage) -> Result<(), Error> {
        if !self.connected {
            return Err(Error::NotConnectedError);
        }
        debug!("{} sends {}", self.label, message.kind());
        let line = message.to_json()?;
        self.send_raw(&line).await
    }

    async fn recv(&mut self) -> Result<SignalingMessage, Error> {
        if !self.connected {
            return Err(Error::NotConnectedError);
        }
        match self.rx.next().await {
            Some(line) => {
                let message = SignalingMessage::from_json(&line)
                    .map_err(|err| Error::DecodeError(err.to_string()))?;
                debug!("{} received {}", self.label, message.kind());
                Ok(message)
            }
            None => Ok(SignalingMessage::Bye),
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        if self.tx.is_none() {
            return Ok(());
        }
        self.closes.fetch_add(1, Ordering::SeqCst);
        let result = if self.connected {
            self.send(&SignalingMessage::Bye).await
        } else {
            Ok(())
        };
        self.tx = None;
        self.connected = false;
        // the other end may already be gone; bye is best effort
        if let Err(err) = &result {
            debug!("{} could not say bye: {err}", self.label);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_delivers_and_closes() {
        let (mut here, mut there) = TestSignaling::pair("here", "there");
        let probe = here.probe();
        here.connect().await.unwrap();
        there.connect().await.unwrap();
        here.send_raw("garbage").await.unwrap();
        assert!(!there.recv().await.unwrap_err().is_transport());

        here.close().await.unwrap();
        here.close().await.unwrap();
        assert_eq!(probe.close_count(), 1);
        assert_eq!(there.recv().await.unwrap(), SignalingMessage::Bye);
        // sender dropped: a closed channel also reads as bye
        assert_eq!(there.recv().await.unwrap(), SignalingMessage::Bye);
    }
}
