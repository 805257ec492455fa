use crate::peer::{MediaKind, RemoteTrack};
use async_trait::async_trait;
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{self, select};
use tokio_util::sync::CancellationToken;
use webrtc::media::io::h264_writer::H264Writer;
use webrtc::media::io::ivf_reader::IVFFileHeader;
use webrtc::media::io::ivf_writer::IVFWriter;
use webrtc::media::io::ogg_writer::OggWriter;
use webrtc::media::io::Writer;

#[allow(unused_imports)]
use log::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error("Media writer failed: {}", .0)]
    MediaError(String),

    #[error("Sink has not been started")]
    NotStartedError,

    #[error(transparent)]
    JoinError(#[from] tokio::task::JoinError),
}

/// Where inbound tracks end up. Tracks are only handed over after `start`.
#[async_trait]
pub trait MediaSink: Send {
    async fn start(&mut self) -> Result<(), Error>;
    async fn add_track(&mut self, track: RemoteTrack) -> Result<(), Error>;
    /// Stops consuming all tracks. Safe to call more than once.
    async fn stop(&mut self) -> Result<(), Error>;
}

/// Consumes and discards everything.
#[derive(Default)]
pub struct Blackhole {
    started: bool,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Blackhole {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaSink for Blackhole {
    async fn start(&mut self) -> Result<(), Error> {
        self.started = true;
        Ok(())
    }

    async fn add_track(&mut self, track: RemoteTrack) -> Result<(), Error> {
        if !self.started {
            return Err(Error::NotStartedError);
        }
        debug!("Discarding {} track {}", track.kind, track.id);
        let mut packets = track.packets;
        self.tasks.push(tokio::spawn(async move {
            while packets.next().await.is_some() {}
        }));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        self.started = false;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        Ok(())
    }
}

fn media_error(err: impl std::fmt::Display) -> Error {
    Error::MediaError(err.to_string())
}

enum Container {
    Ogg,
    Ivf([u8; 4]),
    H264,
}

impl Container {
    fn for_mime_type(mime_type: &str) -> Option<Self> {
        match mime_type.to_lowercase().as_str() {
            "audio/opus" => Some(Container::Ogg),
            "video/vp8" => Some(Container::Ivf(*b"VP80")),
            "video/vp9" => Some(Container::Ivf(*b"VP90")),
            "video/h264" => Some(Container::H264),
            _ => None,
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Container::Ogg => "ogg",
            Container::Ivf(_) => "ivf",
            Container::H264 => "h264",
        }
    }

    fn writer(&self, file: File) -> Result<Box<dyn Writer + Send>, Error> {
        Ok(match self {
            Container::Ogg => Box::new(OggWriter::new(file, 48000, 2).map_err(media_error)?),
            Container::Ivf(four_cc) => Box::new(
                IVFWriter::new(
                    file,
                    &IVFFileHeader {
                        signature: *b"DKIF",
                        version: 0,
                        header_size: 32,
                        four_cc: *four_cc,
                        width: 640,
                        height: 480,
                        timebase_denominator: 30,
                        timebase_numerator: 1,
                        num_frames: 900,
                        unused: 0,
                    },
                )
                .map_err(media_error)?,
            ),
            Container::H264 => Box::new(H264Writer::new(file)),
        })
    }
}

/// Writes each inbound track into its own file next to the configured path:
/// Opus to Ogg, VP8/VP9 to IVF, H.264 as an Annex B stream. Tracks with any
/// other codec are drained and dropped.
pub struct Recorder {
    path: PathBuf,
    started: bool,
    stop: CancellationToken,
    files: HashMap<&'static str, usize>,
    tasks: Vec<tokio::task::JoinHandle<Result<PathBuf, Error>>>,
    discards: Vec<tokio::task::JoinHandle<()>>,
}

impl Recorder {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Recorder {
            path: path.as_ref().to_path_buf(),
            started: false,
            stop: CancellationToken::new(),
            files: HashMap::new(),
            tasks: Vec::new(),
            discards: Vec::new(),
        }
    }

    fn next_path(&mut self, extension: &'static str) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "recording".to_string());
        let count = self.files.entry(extension).or_insert(0);
        let name = if *count == 0 {
            format!("{stem}.{extension}")
        } else {
            format!("{stem}-{count}.{extension}")
        };
        *count += 1;
        self.path.with_file_name(name)
    }
}

#[rustfmt::skip::macros(select)]
async fn record(
    mut track: RemoteTrack,
    mut writer: Box<dyn Writer + Send>,
    path: PathBuf,
    stop: CancellationToken,
) -> Result<PathBuf, Error> {
    let mut written = 0usize;
    loop {
        select! {
            packet = track.packets.next() => {
		match packet {
		    Some(packet) => {
			writer.write_rtp(&packet).map_err(media_error)?;
			written += 1;
		    }
		    None => break,
		}
	    }
	    _ = stop.cancelled() => break,
        }
    }
    writer.close().map_err(media_error)?;
    debug!(
        "Recorded {written} packets of {} track {} to {}",
        track.kind,
        track.id,
        path.display()
    );
    Ok(path)
}

#[async_trait]
impl MediaSink for Recorder {
    async fn start(&mut self) -> Result<(), Error> {
        self.started = true;
        info!("Recording to {}", self.path.display());
        Ok(())
    }

    async fn add_track(&mut self, track: RemoteTrack) -> Result<(), Error> {
        if !self.started {
            return Err(Error::NotStartedError);
        }
        let container = match Container::for_mime_type(&track.mime_type) {
            Some(container) => container,
            None => {
                warn!(
                    "Cannot record {} track {} with codec {}, discarding",
                    track.kind, track.id, track.mime_type
                );
                let mut packets = track.packets;
                self.discards.push(tokio::spawn(async move {
                    while packets.next().await.is_some() {}
                }));
                return Ok(());
            }
        };
        let path = self.next_path(container.extension());
        let writer = container.writer(File::create(&path)?)?;
        let kind = match track.kind {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        };
        info!("Recording {kind} track {} to {}", track.id, path.display());
        self.tasks
            .push(tokio::spawn(record(track, writer, path, self.stop.clone())));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        self.started = false;
        self.stop.cancel();
        for task in self.discards.drain(..) {
            task.abort();
        }
        // every writer gets joined; the first failure is reported
        let mut result = Ok(());
        for task in self.tasks.drain(..) {
            let failure = match task.await {
                Ok(Ok(path)) => {
                    debug!("Finished {}", path.display());
                    continue;
                }
                Ok(Err(err)) => err,
                Err(err) => Error::from(err),
            };
            error!("Recording failed: {failure}");
            if result.is_ok() {
                result = Err(failure);
            }
        }
        result
    }
}
