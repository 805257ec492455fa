use rtcsession::connection::Connection;
use rtcsession::peer::{Direction, MediaKind, Transceiver};
use rtcsession::protocol::{IceCandidate, Role, SessionDescription, SignalingMessage};
use rtcsession::session::{Exit, Session, SessionOptions, SessionState};
use rtcsession::signaling::Signaling;
use rtcsession::test_peer::{TestPeer, TestPeerProbe, TestSink, TestSinkProbe};
use rtcsession::test_signaling::{TestSignaling, TestSignalingProbe};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Side {
    session: Session,
    peer: TestPeerProbe,
    sink: TestSinkProbe,
    signaling: TestSignalingProbe,
}

async fn side(role: Role, label: &str, signaling: TestSignaling) -> Side {
    let (peer, events, peer_probe) = TestPeer::new(label);
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
    let (sink, sink_probe) = TestSink::new();
    let signaling_probe = signaling.probe();
    let session = Session::new(
        role,
        connection,
        events,
        Box::new(signaling),
        Box::new(sink),
        SessionOptions::default(),
    );
    Side {
        session,
        peer: peer_probe,
        sink: sink_probe,
        signaling: signaling_probe,
    }
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn host_candidate(port: u16, mid: &str) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:1 1 udp 2130706431 192.168.1.2 {port} typ host"),
        sdp_mid: Some(mid.to_string()),
        sdp_mline_index: None,
    }
}

#[tokio::test]
async fn offer_answer_between_two_sessions() {
    let (offer_signaling, answer_signaling) = TestSignaling::pair("offerer", "answerer");
    let Side {
        session: mut offerer,
        peer: offerer_peer,
        sink: offerer_sink,
        signaling: offerer_signaling,
    } = side(Role::Offerer, "offerer", offer_signaling).await;
    let Side {
        session: mut answerer,
        peer: answerer_peer,
        sink: answerer_sink,
        signaling: answerer_signaling,
    } = side(Role::Answerer, "answerer", answer_signaling).await;

    let shutdown = CancellationToken::new();
    let offerer_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let exit = offerer.run(shutdown).await;
            (exit, offerer)
        }
    });
    let answerer_task = tokio::spawn(async move {
        let exit = answerer.run(CancellationToken::new()).await;
        (exit, answerer)
    });

    // each side announces one candidate per media line
    wait_for("candidates both ways", || {
        offerer_peer.applied_candidates().len() == 2
            && answerer_peer.applied_candidates().len() == 2
    })
    .await;
    wait_for("tracks on both sides", || {
        offerer_sink.log().len() == 3 && answerer_sink.log().len() == 3
    })
    .await;
    assert_eq!(
        offerer_peer.remote_description(),
        answerer_peer.local_description()
    );
    assert_eq!(
        answerer_peer.remote_description(),
        offerer_peer.local_description()
    );
    assert_eq!(offerer_sink.log()[0], "start");
    assert_eq!(answerer_sink.log()[0], "start");

    // the offerer hangs up, its bye ends the answerer
    shutdown.cancel();
    let (exit, offerer) = offerer_task.await.unwrap();
    assert_eq!(exit.unwrap(), Exit::Interrupted);
    let (exit, answerer) = answerer_task.await.unwrap();
    assert_eq!(exit.unwrap(), Exit::Bye);

    assert_eq!(offerer.state(), SessionState::Closed);
    assert_eq!(answerer.state(), SessionState::Closed);
    for (peer, sink, signaling) in [
        (&offerer_peer, &offerer_sink, &offerer_signaling),
        (&answerer_peer, &answerer_sink, &answerer_signaling),
    ] {
        assert_eq!(peer.close_count(), 1);
        assert_eq!(sink.stop_count(), 1);
        assert_eq!(signaling.close_count(), 1);
    }
}

#[tokio::test]
async fn early_candidates_are_applied_in_arrival_order() {
    let (local, mut remote) = TestSignaling::pair("answerer", "remote");
    remote.connect().await.unwrap();
    let Side {
        mut session,
        peer,
        ..
    } = side(Role::Answerer, "answerer", local).await;

    for (port, mid) in [(6001, "0"), (6002, "1"), (6003, "0")] {
        remote
            .send(&SignalingMessage::Candidate(host_candidate(port, mid)))
            .await
            .unwrap();
    }
    // the end-of-candidates marker is accepted and ignored
    remote
        .send(&SignalingMessage::Candidate(IceCandidate::end_of_candidates(
            None, None,
        )))
        .await
        .unwrap();
    let offer = SessionDescription::offer(TestPeer::sdp(
        "remote",
        &[MediaKind::Audio, MediaKind::Video],
    ));
    remote
        .send(&SignalingMessage::Description(offer))
        .await
        .unwrap();
    remote
        .send(&SignalingMessage::Candidate(host_candidate(6004, "1")))
        .await
        .unwrap();
    remote.send(&SignalingMessage::Bye).await.unwrap();

    let exit = session.run(CancellationToken::new()).await.unwrap();
    assert_eq!(exit, Exit::Bye);
    let ports: Vec<u16> = peer
        .applied_candidates()
        .iter()
        .map(|candidate| candidate.parse().unwrap().unwrap().port)
        .collect();
    assert_eq!(ports, vec![6001, 6002, 6003, 6004]);
}

#[tokio::test]
async fn teardown_twice_is_harmless() {
    let (local, _remote) = TestSignaling::pair("offerer", "remote");
    let Side {
        mut session,
        peer,
        sink,
        signaling,
    } = side(Role::Offerer, "offerer", local).await;
    let first = session.teardown().await;
    let second = session.teardown().await;
    assert!(first.is_clean());
    assert_eq!(first, second);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(peer.close_count(), 1);
    assert_eq!(sink.stop_count(), 1);
    // never connected, so closing had nothing to say
    assert_eq!(signaling.close_count(), 1);
}
