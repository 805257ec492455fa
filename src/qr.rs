//! QR codes for handing the offer over by hand. Text that does not fit a
//! version 40 code is zlib-compressed and base64url-encoded first.

use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use qrcode::render::unicode;
use qrcode::{EcLevel, QrCode};
use serde_derive::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

#[allow(unused_imports)]
use log::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum Error {
    #[error(
        "Payload does not fit a QR code: {} bytes raw, {} bytes compressed, capacity {}",
        .raw, .compressed, .capacity
    )]
    CapacityError {
        raw: usize,
        compressed: usize,
        capacity: usize,
    },

    #[error(transparent)]
    QrError(#[from] qrcode::types::QrError),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    Base64Error(#[from] base64::DecodeError),
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorCorrection {
    #[default]
    L,
    M,
    Q,
    H,
}

impl From<ErrorCorrection> for EcLevel {
    fn from(level: ErrorCorrection) -> Self {
        match level {
            ErrorCorrection::L => EcLevel::L,
            ErrorCorrection::M => EcLevel::M,
            ErrorCorrection::Q => EcLevel::Q,
            ErrorCorrection::H => EcLevel::H,
        }
    }
}

/// What actually goes into the code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Raw(String),
    Compressed(String),
}

impl Payload {
    pub fn as_str(&self) -> &str {
        match self {
            Payload::Raw(text) | Payload::Compressed(text) => text,
        }
    }
}

pub fn deflate(text: &str) -> Result<String, Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(text.as_bytes())?;
    Ok(URL_SAFE.encode(encoder.finish()?))
}

pub fn inflate(payload: &str) -> Result<String, Error> {
    let compressed = URL_SAFE.decode(payload.trim())?;
    let mut text = String::new();
    ZlibDecoder::new(compressed.as_slice()).read_to_string(&mut text)?;
    Ok(text)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QrEncoder {
    level: ErrorCorrection,
}

impl QrEncoder {
    pub fn new(level: ErrorCorrection) -> Self {
        QrEncoder { level }
    }

    /// Byte-mode capacity of the largest (version 40) code at this level.
    pub fn capacity(&self) -> usize {
        match self.level {
            ErrorCorrection::L => 2953,
            ErrorCorrection::M => 2331,
            ErrorCorrection::Q => 1663,
            ErrorCorrection::H => 1273,
        }
    }

    pub fn fits(&self, data: &str) -> bool {
        data.len() <= self.capacity()
    }

    pub fn plan(&self, text: &str) -> Result<Payload, Error> {
        if self.fits(text) {
            return Ok(Payload::Raw(text.to_string()));
        }
        let compressed = deflate(text)?;
        if self.fits(&compressed) {
            debug!(
                "Compressed QR payload from {} to {} bytes",
                text.len(),
                compressed.len()
            );
            Ok(Payload::Compressed(compressed))
        } else {
            Err(Error::CapacityError {
                raw: text.len(),
                compressed: compressed.len(),
                capacity: self.capacity(),
            })
        }
    }

    pub fn encode(&self, payload: &Payload) -> Result<QrCode, Error> {
        Ok(QrCode::with_error_correction_level(
            payload.as_str().as_bytes(),
            self.level.into(),
        )?)
    }

    /// Light modules are drawn dark and vice versa, which is what scanners
    /// expect from a terminal with a dark background.
    pub fn render(&self, code: &QrCode) -> String {
        code.render::<unicode::Dense1x2>()
            .dark_color(unicode::Dense1x2::Light)
            .light_color(unicode::Dense1x2::Dark)
            .build()
    }

    /// Plans, encodes and writes the code. Nothing is written unless the
    /// whole code could be built.
    pub fn show(&self, text: &str, out: &mut impl Write) -> Result<Payload, Error> {
        let payload = self.plan(text)?;
        let code = self.encode(&payload)?;
        let rendered = self.render(&code);
        writeln!(out, "{rendered}")?;
        out.flush()?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_raw_when_it_fits() {
        let encoder = QrEncoder::default();
        let text = "v=0\r\n".repeat(10);
        assert_eq!(encoder.plan(&text).unwrap(), Payload::Raw(text));
    }

    #[test]
    fn test_plan_compresses_when_too_long() {
        let encoder = QrEncoder::new(ErrorCorrection::H);
        let text = "a=candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host\r\n".repeat(60);
        assert!(!encoder.fits(&text));
        match encoder.plan(&text).unwrap() {
            Payload::Compressed(payload) => {
                assert!(encoder.fits(&payload));
                assert!(payload
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '='));
                assert_eq!(inflate(&payload).unwrap(), text);
            }
            other => panic!("expected a compressed payload, got {other:?}"),
        }
    }

    #[test]
    fn test_capacity_error_writes_nothing() {
        let encoder = QrEncoder::default();
        // incompressible: every byte distinct in a long pseudo-random run
        let mut state = 0x2545f491u32;
        let text: String = (0..8000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                char::from(b'!' + (state % 94) as u8)
            })
            .collect();
        let mut out = Vec::new();
        let err = encoder.show(&text, &mut out).unwrap_err();
        assert!(matches!(err, Error::CapacityError { raw: 8000, .. }));
        assert!(out.is_empty());
    }

    #[test]
    fn test_render_is_inverted() {
        let encoder = QrEncoder::default();
        let code = encoder.encode(&Payload::Raw("hello".to_string())).unwrap();
        let rendered = encoder.render(&code);
        // quiet zone is light, so it is drawn with full blocks
        assert!(rendered.lines().next().unwrap().chars().all(|c| c == '█'));
    }
}
