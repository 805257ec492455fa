//! The connection lifecycle: connect the signaling channel, run the
//! offer/answer round, trade candidates, hand inbound media to the sink and
//! tear everything down exactly once.

use crate::connection::{self, Connection};
use crate::negotiation;
use crate::peer::{PeerEvent, PeerEvents, RemoteTrack};
use crate::protocol::{IceCandidate, Role, SignalingMessage};
use crate::qr::QrEncoder;
use crate::signaling::{self, Signaling};
use crate::sink::{self, MediaSink};
use crate::transport::{self, Inbound, Transport};
use futures::stream::StreamExt;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::{self, select};
use tokio_util::sync::CancellationToken;

#[allow(unused_imports)]
use log::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    SignalingError(#[from] signaling::Error),

    #[error(transparent)]
    TransportError(#[from] transport::Error),

    #[error(transparent)]
    ConnectionError(#[from] connection::Error),

    #[error(transparent)]
    SinkError(#[from] sink::Error),

    #[error("Signaling channel ended without a bye")]
    SignalingLostError,

    #[error("Session has already run")]
    AlreadyRunError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle(Role),
    SignalingConnected(Role),
    Negotiating(Role),
    Connected,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle(role) => write!(f, "idle ({role})"),
            SessionState::SignalingConnected(role) => write!(f, "signaling connected ({role})"),
            SessionState::Negotiating(role) => write!(f, "negotiating ({role})"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// How a session that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Bye,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Label of a data channel the offerer declares before its offer.
    pub data_channel: Option<String>,
    /// Shows the offer as a QR code when set.
    pub qr: Option<QrEncoder>,
    /// Upper bound for each teardown step.
    pub teardown_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            data_channel: None,
            qr: None,
            teardown_timeout: Duration::from_secs(5),
        }
    }
}

/// Which teardown steps failed, and why. `None` means the step succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub sink: Option<String>,
    pub signaling: Option<String>,
    pub connection: Option<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.sink.is_none() && self.signaling.is_none() && self.connection.is_none()
    }
}

pub struct Session {
    role: Role,
    state: SessionState,
    connection: Connection,
    events: PeerEvents,
    events_done: bool,
    sink: Box<dyn MediaSink>,
    sink_started: bool,
    pending_tracks: Vec<RemoteTrack>,
    pending_local: Vec<IceCandidate>,
    signaling: Option<Box<dyn Signaling>>,
    transport: Option<Transport>,
    options: SessionOptions,
    teardown: Option<TeardownReport>,
}

async fn recv_inbound(transport: &mut Option<Transport>) -> Option<Inbound> {
    match transport {
        Some(transport) => transport.recv().await,
        None => None,
    }
}

async fn guarded<E: fmt::Display>(
    step: &str,
    limit: Duration,
    future: impl Future<Output = Result<(), E>>,
) -> Option<String> {
    match tokio::time::timeout(limit, future).await {
        Ok(Ok(())) => {
            debug!("Teardown: {step} done");
            None
        }
        Ok(Err(err)) => {
            warn!("Teardown: failed to {step}: {err}");
            Some(err.to_string())
        }
        Err(_) => {
            warn!("Teardown: {step} did not finish within {limit:?}");
            Some(format!("timed out after {limit:?}"))
        }
    }
}

impl Session {
    pub fn new(
        role: Role,
        connection: Connection,
        events: PeerEvents,
        signaling: Box<dyn Signaling>,
        sink: Box<dyn MediaSink>,
        options: SessionOptions,
    ) -> Self {
        Session {
            role,
            state: SessionState::Idle(role),
            connection,
            events,
            events_done: false,
            sink,
            sink_started: false,
            pending_tracks: Vec::new(),
            pending_local: Vec::new(),
            signaling: Some(signaling),
            transport: None,
            options,
            teardown: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Runs the session until the remote says bye, `shutdown` is cancelled
    /// or the signaling channel fails. Teardown always runs before this
    /// returns.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<Exit, Error> {
        if !matches!(self.state, SessionState::Idle(_)) {
            return Err(Error::AlreadyRunError);
        }
        let result = self.negotiate(&shutdown).await;
        match &result {
            Ok(exit) => info!("Session ends: {exit:?}"),
            Err(err) => error!("Session failed in state {}: {err}", self.state),
        }
        let report = self.teardown().await;
        if !report.is_clean() {
            warn!("Teardown was not clean: {report:?}");
        }
        result
    }

    #[rustfmt::skip::macros(select)]
    async fn negotiate(&mut self, shutdown: &CancellationToken) -> Result<Exit, Error> {
        let connected = match self.signaling.as_mut() {
            Some(signaling) => {
                select! {
		    _ = shutdown.cancelled() => None,
		    result = signaling.connect() => Some(result),
                }
            }
            None => return Err(Error::AlreadyRunError),
        };
        match connected {
            None => {
                info!("Interrupted while connecting signaling");
                return Ok(Exit::Interrupted);
            }
            Some(result) => result?,
        }
        self.state = SessionState::SignalingConnected(self.role);
        info!("Signaling connected as {}", self.role);
        if let Some(signaling) = self.signaling.take() {
            self.transport = Some(Transport::new(signaling));
        }

        if self.role == Role::Offerer {
            self.send_offer().await?;
        }
        self.state = SessionState::Negotiating(self.role);

        loop {
            select! {
		biased;
		_ = shutdown.cancelled() => {
		    info!("Interrupted");
		    return Ok(Exit::Interrupted);
		}
		event = self.events.next(), if !self.events_done => {
		    match event {
			Some(event) => self.handle_event(event).await,
			None => {
			    debug!("Engine event queue closed");
			    self.events_done = true;
			}
		    }
		}
		inbound = recv_inbound(&mut self.transport) => {
		    match inbound {
			Some(Ok(SignalingMessage::Bye)) => {
			    info!("Remote party said bye");
			    return Ok(Exit::Bye);
			}
			Some(Ok(message)) => self.dispatch(message).await?,
			Some(Err(err)) if err.is_transport() => return Err(err.into()),
			Some(Err(err)) => warn!("Dropping signaling message in state {}: {err}", self.state),
			None => return Err(Error::SignalingLostError),
		    }
		}
            }
        }
    }

    async fn send_offer(&mut self) -> Result<(), Error> {
        let offer = negotiation::create_offer(
            &mut self.connection,
            self.options.data_channel.as_deref(),
        )
        .await?;
        let body = offer.sdp.clone();
        self.send(SignalingMessage::Description(offer))?;
        if let Some(qr) = &self.options.qr {
            let mut stdout = std::io::stdout();
            match qr.show(&body, &mut stdout) {
                Ok(payload) => debug!(
                    "Showed offer as a QR code ({} bytes)",
                    payload.as_str().len()
                ),
                Err(err) => warn!("Cannot show the offer as a QR code: {err}"),
            }
        }
        Ok(())
    }

    fn send(&self, message: SignalingMessage) -> Result<(), Error> {
        match &self.transport {
            Some(transport) => Ok(transport.send(message)?),
            None => Err(Error::SignalingLostError),
        }
    }

    async fn dispatch(&mut self, message: SignalingMessage) -> Result<(), Error> {
        match message {
            SignalingMessage::Description(description) => {
                let sdp_type = description.sdp_type;
                // only the signaling channel failing may end the session
                let applied =
                    match negotiation::apply_remote_description(&mut self.connection, description)
                        .await
                    {
                        Ok(applied) => applied,
                        Err(err) if err.is_protocol_violation() => {
                            warn!("Ignoring remote {sdp_type} in state {}: {err}", self.state);
                            return Ok(());
                        }
                        Err(err) => {
                            error!("Cannot apply remote {sdp_type} in state {}: {err}", self.state);
                            return Ok(());
                        }
                    };
                if applied.flushed > 0 {
                    debug!("{} early candidates applied", applied.flushed);
                }
                if applied.first_remote {
                    if let Err(err) = self.start_sink().await {
                        error!("Cannot start media sink, holding tracks: {err}");
                    }
                    self.state = SessionState::Connected;
                }
                if let Some(reply) = applied.reply {
                    self.send(SignalingMessage::Description(reply))?;
                }
                self.flush_local_candidates()?;
            }
            SignalingMessage::Candidate(candidate) => {
                match self.connection.add_ice_candidate(candidate).await {
                    Ok(disposition) => debug!("Remote candidate: {disposition:?}"),
                    Err(err) => warn!("Ignoring remote candidate in state {}: {err}", self.state),
                }
            }
            SignalingMessage::Bye => (),
        }
        Ok(())
    }

    async fn start_sink(&mut self) -> Result<(), Error> {
        self.sink.start().await?;
        self.sink_started = true;
        let pending: Vec<RemoteTrack> = self.pending_tracks.drain(..).collect();
        for track in pending {
            self.forward_track(track).await;
        }
        Ok(())
    }

    async fn forward_track(&mut self, track: RemoteTrack) {
        let id = track.id.clone();
        if let Err(err) = self.sink.add_track(track).await {
            warn!("Media sink refused track {id}: {err}");
        }
    }

    fn flush_local_candidates(&mut self) -> Result<(), Error> {
        for candidate in std::mem::take(&mut self.pending_local) {
            self.send(SignalingMessage::Candidate(candidate))?;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                // nothing goes out before our own description did
                if self.connection.local_description().is_none() {
                    self.pending_local.push(candidate);
                } else if let Err(err) = self.send(SignalingMessage::Candidate(candidate)) {
                    warn!("Cannot send local candidate: {err}");
                }
            }
            PeerEvent::Track(track) => {
                info!("Receiving {} track {}", track.kind, track.id);
                self.connection.attach_track(&track);
                if self.sink_started {
                    self.forward_track(track).await;
                } else {
                    self.pending_tracks.push(track);
                }
            }
        }
    }

    /// Stops the sink, closes signaling (saying bye) and closes the
    /// connection. Each step is attempted regardless of the others and is
    /// bounded by the teardown timeout. Later calls return the first report.
    pub async fn teardown(&mut self) -> TeardownReport {
        if let Some(report) = &self.teardown {
            return report.clone();
        }
        self.state = SessionState::Closing;
        let limit = self.options.teardown_timeout;
        let mut report = TeardownReport {
            sink: guarded("stop media sink", limit, self.sink.stop()).await,
            ..Default::default()
        };
        self.sink_started = false;
        self.pending_tracks.clear();
        if let Some(mut transport) = self.transport.take() {
            report.signaling = guarded("close signaling", limit, transport.stop()).await;
        } else if let Some(mut signaling) = self.signaling.take() {
            report.signaling = guarded("close signaling", limit, signaling.close()).await;
        }
        report.connection = guarded("close connection", limit, self.connection.close()).await;
        self.state = SessionState::Closed;
        info!("Session closed");
        self.teardown = Some(report.clone());
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{Direction, MediaKind, Transceiver};
    use crate::protocol::{SdpType, SessionDescription};
    use crate::test_peer::{TestPeer, TestPeerProbe, TestSink, TestSinkProbe};
    use crate::test_signaling::{TestSignaling, TestSignalingProbe};

    struct Fixture {
        session: Session,
        remote: TestSignaling,
        peer: TestPeerProbe,
        sink: TestSinkProbe,
        signaling: TestSignalingProbe,
    }

    async fn fixture(role: Role) -> Fixture {
        let (peer, events, peer_probe) = TestPeer::new("local");
        let mut connection = Connection::new(Box::new(peer));
        for kind in [MediaKind::Audio, MediaKind::Video] {
            connection
                .add_transceiver(Transceiver {
                    kind,
                    direction: Direction::RecvOnly,
                })
                .await
                .unwrap();
        }
        let (local, mut remote) = TestSignaling::pair("local", "remote");
        remote.connect().await.unwrap();
        let signaling = local.probe();
        let (sink, sink_probe) = TestSink::new();
        let session = Session::new(
            role,
            connection,
            events,
            Box::new(local),
            Box::new(sink),
            SessionOptions::default(),
        );
        Fixture {
            session,
            remote,
            peer: peer_probe,
            sink: sink_probe,
            signaling,
        }
    }

    #[tokio::test]
    async fn test_bye_closes_everything_once() {
        let mut fixture = fixture(Role::Answerer).await;
        fixture.remote.send(&SignalingMessage::Bye).await.unwrap();
        let exit = fixture.session.run(CancellationToken::new()).await.unwrap();
        assert_eq!(exit, Exit::Bye);
        assert_eq!(fixture.session.state(), SessionState::Closed);
        assert_eq!(fixture.sink.stop_count(), 1);
        assert_eq!(fixture.signaling.close_count(), 1);
        assert_eq!(fixture.peer.close_count(), 1);
        // the answerer never heard an offer, so the only thing it sent is bye
        assert_eq!(fixture.remote.recv().await.unwrap(), SignalingMessage::Bye);

        let report = fixture.session.teardown().await;
        assert!(report.is_clean());
        assert_eq!(fixture.sink.stop_count(), 1);
        assert_eq!(fixture.signaling.close_count(), 1);
        assert_eq!(fixture.peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_interrupt_tears_down() {
        let mut fixture = fixture(Role::Answerer).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let exit = fixture.session.run(shutdown).await.unwrap();
        assert_eq!(exit, Exit::Interrupted);
        assert_eq!(fixture.session.state(), SessionState::Closed);
        assert_eq!(fixture.peer.close_count(), 1);
        assert_eq!(fixture.sink.stop_count(), 1);
        assert!(matches!(
            fixture.session.run(CancellationToken::new()).await,
            Err(Error::AlreadyRunError)
        ));
    }

    #[tokio::test]
    async fn test_answerer_starts_sink_before_tracks() {
        let Fixture {
            mut session,
            mut remote,
            peer,
            sink,
            ..
        } = fixture(Role::Answerer).await;
        // media that shows up before negotiation finished is held back
        peer.emit_track("early", MediaKind::Audio);
        let offer = SessionDescription::offer(TestPeer::sdp(
            "remote",
            &[MediaKind::Audio, MediaKind::Video],
        ));
        remote
            .send(&SignalingMessage::Description(offer))
            .await
            .unwrap();

        let session = tokio::spawn(async move {
            let exit = session.run(CancellationToken::new()).await;
            (exit, session)
        });

        match remote.recv().await.unwrap() {
            SignalingMessage::Description(answer) => {
                assert_eq!(answer.sdp_type, SdpType::Answer)
            }
            other => panic!("expected an answer, got {other:?}"),
        }
        // two media lines, then the end-of-candidates marker
        for _ in 0..2 {
            assert!(matches!(
                remote.recv().await.unwrap(),
                SignalingMessage::Candidate(_)
            ));
        }
        match remote.recv().await.unwrap() {
            SignalingMessage::Candidate(candidate) => assert!(candidate.is_end_of_candidates()),
            other => panic!("expected end of candidates, got {other:?}"),
        }
        remote.send(&SignalingMessage::Bye).await.unwrap();
        let (exit, session) = session.await.unwrap();
        assert_eq!(exit.unwrap(), Exit::Bye);
        assert_eq!(session.state(), SessionState::Closed);

        let log = sink.log();
        assert_eq!(log.first().map(String::as_str), Some("start"));
        assert_eq!(log.last().map(String::as_str), Some("stop"));
        for track in ["track:early", "track:audio-0", "track:video-1"] {
            assert!(log.iter().any(|entry| entry == track), "{track} missing in {log:?}");
        }
    }

    #[tokio::test]
    async fn test_offerer_sends_offer_before_candidates() {
        let Fixture {
            mut session,
            mut remote,
            peer,
            ..
        } = fixture(Role::Offerer).await;
        let session = tokio::spawn(async move {
            let exit = session.run(CancellationToken::new()).await;
            (exit, session)
        });
        match remote.recv().await.unwrap() {
            SignalingMessage::Description(offer) => {
                assert_eq!(offer.sdp_type, SdpType::Offer);
                assert_eq!(peer.local_description(), Some(offer));
            }
            other => panic!("expected the offer first, got {other:?}"),
        }
        assert!(matches!(
            remote.recv().await.unwrap(),
            SignalingMessage::Candidate(_)
        ));
        remote.send(&SignalingMessage::Bye).await.unwrap();
        let (exit, session) = session.await.unwrap();
        assert_eq!(exit.unwrap(), Exit::Bye);
        // no answer arrived, so the sink never started
        assert_eq!(session.connection().remote_description(), None);
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_bad_messages_do_not_end_the_session() {
        let Fixture {
            mut session,
            mut remote,
            peer,
            ..
        } = fixture(Role::Answerer).await;
        remote.send_raw("not json").await.unwrap();
        let answer = SessionDescription::answer(TestPeer::sdp("remote", &[MediaKind::Audio]));
        remote
            .send(&SignalingMessage::Description(answer))
            .await
            .unwrap();
        remote
            .send(&SignalingMessage::Candidate(IceCandidate {
                candidate: "candidate:what".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: None,
            }))
            .await
            .unwrap();
        remote.send(&SignalingMessage::Bye).await.unwrap();
        let exit = session.run(CancellationToken::new()).await.unwrap();
        assert_eq!(exit, Exit::Bye);
        assert!(session.connection().remote_description().is_none());
        assert!(peer.applied_candidates().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_offer_does_not_end_the_session() {
        let Fixture {
            mut session,
            mut remote,
            peer,
            sink,
            ..
        } = fixture(Role::Answerer).await;
        peer.reject_next_remote("malformed sdp");
        let offer = SessionDescription::offer(TestPeer::sdp("remote", &[MediaKind::Audio]));
        for _ in 0..2 {
            remote
                .send(&SignalingMessage::Description(offer.clone()))
                .await
                .unwrap();
        }

        let session = tokio::spawn(async move {
            let exit = session.run(CancellationToken::new()).await;
            (exit, session)
        });
        // the engine refused the first offer, the second one is answered
        match remote.recv().await.unwrap() {
            SignalingMessage::Description(answer) => {
                assert_eq!(answer.sdp_type, SdpType::Answer)
            }
            other => panic!("expected an answer, got {other:?}"),
        }
        remote.send(&SignalingMessage::Bye).await.unwrap();
        let (exit, session) = session.await.unwrap();
        assert_eq!(exit.unwrap(), Exit::Bye);
        assert_eq!(session.connection().remote_description(), Some(&offer));
        assert_eq!(peer.remote_description(), Some(offer));
        assert_eq!(sink.log().first().map(String::as_str), Some("start"));
    }

    #[tokio::test]
    async fn test_teardown_attempts_every_step() {
        let Fixture {
            mut session,
            peer,
            sink,
            signaling,
            ..
        } = fixture(Role::Offerer).await;
        session.options.teardown_timeout = Duration::from_millis(50);
        sink.fail_stop("disk full");
        peer.stall_close();

        let report = session.teardown().await;
        assert_eq!(report.sink.as_deref(), Some("Media writer failed: disk full"));
        assert_eq!(report.signaling, None);
        assert!(
            matches!(&report.connection, Some(reason) if reason.starts_with("timed out")),
            "{report:?}"
        );
        assert!(!report.is_clean());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(sink.stop_count(), 1);
        assert_eq!(signaling.close_count(), 1);
        assert_eq!(peer.close_count(), 1);

        assert_eq!(session.teardown().await, report);
        assert_eq!(sink.stop_count(), 1);
        assert_eq!(peer.close_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_sink_stop_still_ends_with_bye() {
        let Fixture {
            mut session,
            mut remote,
            peer,
            sink,
            signaling,
        } = fixture(Role::Answerer).await;
        sink.fail_stop("disk full");
        remote.send(&SignalingMessage::Bye).await.unwrap();
        let exit = session.run(CancellationToken::new()).await.unwrap();
        assert_eq!(exit, Exit::Bye);
        assert_eq!(signaling.close_count(), 1);
        assert_eq!(peer.close_count(), 1);
        // signaling was still closed politely after the sink failed
        assert_eq!(remote.recv().await.unwrap(), SignalingMessage::Bye);
    }
}
