//! In-memory stand-ins for the media engine and the media sink.

use crate::peer::{
    self, MediaKind, PeerConnection, PeerEvent, PeerEvents, RemoteTrack, Transceiver,
};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};
use crate::sink::{self, MediaSink};
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use std::sync::{Arc, Mutex};
use webrtc::rtp::packet::Packet;

#[derive(Default)]
struct PeerState {
    kinds: Vec<MediaKind>,
    data_channel: bool,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<IceCandidate>,
    tracks_emitted: bool,
    reject_remote: Option<String>,
    stall_close: bool,
    closed: usize,
}

/// A peer that fabricates minimal SDP, announces one host candidate per
/// media line of its local description, and produces one short track per
/// remote audio/video line once both descriptions are set.
pub struct TestPeer {
    label: String,
    state: Arc<Mutex<PeerState>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

#[derive(Clone)]
pub struct TestPeerProbe {
    state: Arc<Mutex<PeerState>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

fn test_track(id: String, kind: MediaKind) -> RemoteTrack {
    let mime_type = match kind {
        MediaKind::Audio => "audio/opus",
        MediaKind::Video => "video/VP8",
    };
    let (mut tx, rx) = mpsc::channel(4);
    for n in 0..2u8 {
        let mut packet = Packet {
            payload: Bytes::from(vec![n; 8]),
            ..Default::default()
        };
        packet.header.sequence_number = n as u16;
        packet.header.timestamp = n as u32 * 960;
        let _ = tx.try_send(packet);
    }
    RemoteTrack::new(id, kind, mime_type, rx)
}

impl TestPeer {
    pub fn new(label: &str) -> (Self, PeerEvents, TestPeerProbe) {
        let (events, events_rx) = mpsc::unbounded();
        let state = Arc::new(Mutex::new(PeerState::default()));
        let probe = TestPeerProbe {
            state: state.clone(),
            events: events.clone(),
        };
        let peer = TestPeer {
            label: label.to_string(),
            state,
            events,
        };
        (peer, events_rx, probe)
    }

    pub fn sdp(label: &str, kinds: &[MediaKind]) -> String {
        let kinds: Vec<String> = kinds.iter().map(|kind| kind.to_string()).collect();
        Self::render(label, &kinds)
    }

    fn render(label: &str, kinds: &[String]) -> String {
        let mut sdp = format!("v=0\r\no={label} 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n");
        for (index, kind) in kinds.iter().enumerate() {
            sdp.push_str(&format!("m={kind} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{index}\r\n"));
        }
        sdp
    }

    fn media_kinds(description: &SessionDescription) -> Vec<String> {
        description
            .media_lines()
            .into_iter()
            .map(|line| line.kind)
            .collect()
    }

    fn check_open(state: &PeerState) -> Result<(), peer::Error> {
        if state.closed > 0 {
            Err(peer::Error::ClosedError)
        } else {
            Ok(())
        }
    }

    fn maybe_emit_tracks(&self, state: &mut PeerState) {
        if state.tracks_emitted || state.local.is_none() {
            return;
        }
        let remote = match &state.remote {
            Some(remote) => remote,
            None => return,
        };
        state.tracks_emitted = true;
        for line in remote.media_lines() {
            let kind = match line.kind.as_str() {
                "audio" => MediaKind::Audio,
                "video" => MediaKind::Video,
                _ => continue,
            };
            let id = format!("{}-{}", kind, line.index);
            let _ = self
                .events
                .unbounded_send(PeerEvent::Track(test_track(id, kind)));
        }
    }
}

#[async_trait]
impl PeerConnection for TestPeer {
    async fn add_transceiver(&self, transceiver: Transceiver) -> Result<(), peer::Error> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        state.kinds.push(transceiver.kind);
        Ok(())
    }

    async fn create_data_channel(&self, _label: &str) -> Result<(), peer::Error> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        state.data_channel = true;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, peer::Error> {
        let state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        let mut kinds: Vec<String> = state.kinds.iter().map(|kind| kind.to_string()).collect();
        if state.data_channel {
            kinds.push("application".to_string());
        }
        Ok(SessionDescription::offer(Self::render(&self.label, &kinds)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, peer::Error> {
        let state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        match &state.remote {
            Some(remote) if remote.sdp_type == SdpType::Offer => Ok(SessionDescription::answer(
                Self::render(&self.label, &Self::media_kinds(remote)),
            )),
            _ => Err(peer::Error::RejectedError(
                "no remote offer to answer".to_string(),
            )),
        }
    }

    async fn set_local_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), peer::Error> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        for line in description.media_lines() {
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                    line.index + 1,
                    50000 + line.index
                ),
                sdp_mid: line.mid.clone(),
                sdp_mline_index: Some(line.index),
            };
            let _ = self
                .events
                .unbounded_send(PeerEvent::LocalCandidate(candidate));
        }
        let _ = self
            .events
            .unbounded_send(PeerEvent::LocalCandidate(IceCandidate::end_of_candidates(
                None, None,
            )));
        state.local = Some(description.clone());
        self.maybe_emit_tracks(&mut state);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> Result<(), peer::Error> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        if let Some(reason) = state.reject_remote.take() {
            return Err(peer::Error::RejectedError(reason));
        }
        state.remote = Some(description.clone());
        self.maybe_emit_tracks(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), peer::Error> {
        let mut state = self.state.lock().unwrap();
        Self::check_open(&state)?;
        state.applied.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), peer::Error> {
        let stall = {
            let mut state = self.state.lock().unwrap();
            state.closed += 1;
            state.stall_close
        };
        if stall {
            futures::future::pending::<()>().await;
        }
        Ok(())
    }
}

impl TestPeerProbe {
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn close_count(&self) -> usize {
        self.state.lock().unwrap().closed
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().unwrap().remote.clone()
    }

    /// The next remote description is refused by the engine.
    pub fn reject_next_remote(&self, reason: &str) {
        self.state.lock().unwrap().reject_remote = Some(reason.to_string());
    }

    /// Makes `close` never complete.
    pub fn stall_close(&self) {
        self.state.lock().unwrap().stall_close = true;
    }

    /// Injects a track event as if media had arrived right now.
    pub fn emit_track(&self, id: &str, kind: MediaKind) {
        let _ = self
            .events
            .unbounded_send(PeerEvent::Track(test_track(id.to_string(), kind)));
    }
}

#[derive(Default)]
struct SinkState {
    log: Vec<String>,
    started: bool,
    fail_stop: Option<String>,
    stops: usize,
}

/// A sink that only records what was done to it, for ordering checks.
pub struct TestSink {
    state: Arc<Mutex<SinkState>>,
}

#[derive(Clone)]
pub struct TestSinkProbe {
    state: Arc<Mutex<SinkState>>,
}

impl TestSink {
    pub fn new() -> (Self, TestSinkProbe) {
        let state = Arc::new(Mutex::new(SinkState::default()));
        (
            TestSink {
                state: state.clone(),
            },
            TestSinkProbe { state },
        )
    }
}

#[async_trait]
impl MediaSink for TestSink {
    async fn start(&mut self) -> Result<(), sink::Error> {
        let mut state = self.state.lock().unwrap();
        state.started = true;
        state.log.push("start".to_string());
        Ok(())
    }

    async fn add_track(&mut self, track: RemoteTrack) -> Result<(), sink::Error> {
        let mut state = self.state.lock().unwrap();
        if !state.started {
            return Err(sink::Error::NotStartedError);
        }
        state.log.push(format!("track:{}", track.id));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), sink::Error> {
        let mut state = self.state.lock().unwrap();
        state.stops += 1;
        state.log.push("stop".to_string());
        match &state.fail_stop {
            Some(reason) => Err(sink::Error::MediaError(reason.clone())),
            None => Ok(()),
        }
    }
}

impl TestSinkProbe {
    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().unwrap().stops
    }

    pub fn fail_stop(&self, reason: &str) {
        self.state.lock().unwrap().fail_stop = Some(reason.to_string());
    }
}
