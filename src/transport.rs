use crate::protocol::SignalingMessage;
use crate::signaling::{self, Signaling};
use futures::channel::{mpsc, oneshot};
use futures::stream::StreamExt;
use futures::SinkExt;
use thiserror::Error;
use tokio::{self, select};

#[allow(unused_imports)]
use log::{debug, error, info, warn};

const INBOUND_QUEUE: usize = 32;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    SignalingError(#[from] signaling::Error),

    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),

    #[error("Signaling worker has stopped")]
    StoppedError,
}

pub type Inbound = Result<SignalingMessage, signaling::Error>;

/// Owns a connected signaling channel on a worker task. Outbound messages
/// are queued without blocking and leave in the order they were queued;
/// inbound messages, and the errors met while receiving them, come out of
/// `recv` in arrival order.
pub struct Transport {
    tx_outbound: mpsc::UnboundedSender<SignalingMessage>,
    rx_inbound: mpsc::Receiver<Inbound>,
    worker: Option<tokio::task::JoinHandle<Result<(), signaling::Error>>>,
    stop_tx: Option<oneshot::Sender<()>>,
}

#[rustfmt::skip::macros(select)]
async fn handle_signaling(
    mut rx_outbound: mpsc::UnboundedReceiver<SignalingMessage>,
    mut tx_inbound: mpsc::Sender<Inbound>,
    mut signaling: Box<dyn Signaling>,
    mut rx_stop: oneshot::Receiver<()>,
) -> Result<(), signaling::Error> {
    // cleared after a bye or a transport error: nothing more will arrive
    let mut receiving = true;
    let mut sending = true;
    loop {
        select! {
            message = rx_outbound.next(), if sending => {
		match message {
		    Some(message) => {
			debug!("handle_signaling: Sending {}", message.kind());
			if let Err(err) = signaling.send(&message).await {
			    error!("handle_signaling: Failed to send {}: {err}", message.kind());
			    sending = false;
			    if receiving {
				receiving = false;
				let _ = tx_inbound.send(Err(err)).await;
			    }
			}
		    }
		    None => {
			debug!("handle_signaling: Outbound queue is closed");
			sending = false;
		    }
		}
            }
            received = signaling.recv(), if receiving => {
		let fatal = match &received {
		    Ok(SignalingMessage::Bye) => true,
		    Ok(_) => false,
		    Err(err) => err.is_transport(),
		};
		if fatal {
		    receiving = false;
		}
		if tx_inbound.send(received).await.is_err() {
		    debug!("handle_signaling: Inbound queue is closed");
		    receiving = false;
		}
            }
	    _ = &mut rx_stop => {
		debug!("handle_signaling: Stopping");
		break;
	    }
        }
    }
    if sending {
        while let Ok(Some(message)) = rx_outbound.try_next() {
            if let Err(err) = signaling.send(&message).await {
                warn!("handle_signaling: Dropping queued {}: {err}", message.kind());
                break;
            }
        }
    }
    signaling.close().await
}

impl Transport {
    /// Takes over a connected channel. Must be called within a tokio runtime.
    pub fn new(signaling: Box<dyn Signaling>) -> Self {
        let (tx_outbound, rx_outbound) = mpsc::unbounded();
        let (tx_inbound, rx_inbound) = mpsc::channel(INBOUND_QUEUE);
        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = tokio::spawn(handle_signaling(
            rx_outbound,
            tx_inbound,
            signaling,
            stop_rx,
        ));
        Transport {
            tx_outbound,
            rx_inbound,
            worker: Some(worker),
            stop_tx: Some(stop_tx),
        }
    }

    pub fn send(&self, message: SignalingMessage) -> Result<(), Error> {
        self.tx_outbound
            .unbounded_send(message)
            .map_err(|_| Error::StoppedError)
    }

    /// Next inbound item; `None` once the worker has stopped receiving and
    /// everything it received has been taken. Cancel safe.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx_inbound.next().await
    }

    /// Flushes queued outbound messages, then closes the signaling channel,
    /// which says bye. Calling it again does nothing.
    pub async fn stop(&mut self) -> Result<(), Error> {
        let stop_tx = match self.stop_tx.take() {
            Some(stop_tx) => stop_tx,
            None => return Ok(()),
        };
        // unblocks a worker waiting for room in the inbound queue
        self.rx_inbound.close();
        if stop_tx.send(()).is_err() {
            debug!("Signaling worker already gone");
        }
        if let Some(worker) = self.worker.take() {
            worker.await??;
        }
        Ok(())
    }
}
