use crate::console;
use crate::protocol::{SessionDescription, SignalingMessage};
use crate::qr;
use crate::signaling::{Error, Signaling};
use crate::utils::escape_abbrev;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

#[allow(unused_imports)]
use log::{debug, error, info, warn};

/// A human relays each message: outgoing ones are printed to stdout, incoming
/// ones are pasted into stdin, one JSON object per line. What a QR scanner
/// yields is accepted too: a bare offer body (ending with an empty line) or
/// the compressed fallback payload (base64url zlib).
#[derive(Default)]
pub struct CopyPasteSignaling {
    lines: Option<Lines<BufReader<Stdin>>>,
    prompted: bool,
    closed: bool,
}

impl CopyPasteSignaling {
    pub fn new() -> Self {
        Self::default()
    }
}

fn is_sdp(text: &str) -> bool {
    text.starts_with("v=")
}

// Scanners and terminals mangle line endings; SDP wants CRLF.
fn offer_from_sdp(text: &str) -> SignalingMessage {
    let mut sdp = String::new();
    for line in text.lines().map(str::trim_end).filter(|line| !line.is_empty()) {
        sdp.push_str(line);
        sdp.push_str("\r\n");
    }
    SignalingMessage::Description(SessionDescription::offer(sdp))
}

pub fn decode_line(line: &str) -> Result<SignalingMessage, Error> {
    let line = line.trim();
    let text = if line.starts_with('{') || is_sdp(line) {
        line.to_string()
    } else {
        qr::inflate(line).map_err(|err| {
            Error::DecodeError(format!("{err} while inflating {}", escape_abbrev(line, 120)))
        })?
    };
    if is_sdp(&text) {
        return Ok(offer_from_sdp(&text));
    }
    SignalingMessage::from_json(&text)
        .map_err(|err| Error::DecodeError(format!("{err} in {}", escape_abbrev(&text, 120))))
}

#[async_trait]
impl Signaling for CopyPasteSignaling {
    async fn connect(&mut self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::ClosedError);
        }
        if self.lines.is_none() {
            self.lines = Some(BufReader::new(tokio::io::stdin()).lines());
        }
        Ok(())
    }

    async fn send(&mut self, message: &SignalingMessage) -> Result<(), Error> {
        if self.lines.is_none() {
            return Err(Error::NotConnectedError);
        }
        console::print(&format!(
            "-- Please send this message to the remote party --\n{}\n\n",
            message.to_json()?
        ))
        .await
        .map_err(std::io::Error::from)?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<SignalingMessage, Error> {
        if !self.prompted {
            console::print("-- Please enter a message from remote party --\n")
                .await
                .map_err(std::io::Error::from)?;
            self.prompted = true;
        }
        let lines = self.lines.as_mut().ok_or(Error::NotConnectedError)?;
        loop {
            match lines.next_line().await? {
                None => {
                    info!("Standard input closed");
                    return Ok(SignalingMessage::Bye);
                }
                Some(line) if line.trim().is_empty() => continue,
                Some(line) if is_sdp(line.trim_start()) => {
                    let mut sdp = vec![line];
                    while let Some(line) = lines.next_line().await? {
                        if line.trim().is_empty() {
                            break;
                        }
                        sdp.push(line);
                    }
                    self.prompted = false;
                    return decode_line(&sdp.join("\n"));
                }
                Some(line) => {
                    self.prompted = false;
                    return decode_line(&line);
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let result = if self.lines.is_some() {
            self.send(&SignalingMessage::Bye).await
        } else {
            Ok(())
        };
        self.lines = None;
        result
    }
}
