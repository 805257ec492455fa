use serde_derive::{Deserialize, Serialize};
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("Unknown role {0:?}, expected \"offer\" or \"answer\"")]
pub struct RoleParseError(String);

/// Which side initiates the negotiation. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

impl FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "offer" => Ok(Role::Offerer),
            "answer" => Ok(Role::Answerer),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => write!(f, "offer"),
            Role::Answerer => write!(f, "answer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => write!(f, "offer"),
            SdpType::Answer => write!(f, "answer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

/// One `m=` section of a session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLine {
    pub index: u16,
    pub kind: String,
    pub mid: Option<String>,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn media_lines(&self) -> Vec<MediaLine> {
        let mut lines: Vec<MediaLine> = Vec::new();
        for line in self.sdp.lines() {
            let line = line.trim_end();
            if let Some(media) = line.strip_prefix("m=") {
                lines.push(MediaLine {
                    index: lines.len() as u16,
                    kind: media.split(' ').next().unwrap_or_default().to_string(),
                    mid: None,
                });
            } else if let Some(mid) = line.strip_prefix("a=mid:") {
                if let Some(current) = lines.last_mut() {
                    current.mid = Some(mid.to_string());
                }
            }
        }
        lines
    }
}

/// A reachability candidate as carried over signaling. `candidate` holds the
/// SDP `candidate:` attribute; an empty string marks the end of candidates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn end_of_candidates(sdp_mid: Option<String>, sdp_mline_index: Option<u16>) -> Self {
        IceCandidate {
            candidate: String::new(),
            sdp_mid,
            sdp_mline_index,
        }
    }

    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireMessage", try_from = "WireMessage")]
pub enum SignalingMessage {
    Description(SessionDescription),
    Candidate(IceCandidate),
    Bye,
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Description(SessionDescription {
                sdp_type: SdpType::Offer,
                ..
            }) => "offer",
            SignalingMessage::Description(SessionDescription {
                sdp_type: SdpType::Answer,
                ..
            }) => "answer",
            SignalingMessage::Candidate(_) => "candidate",
            SignalingMessage::Bye => "bye",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

// One JSON object per message, discriminated by "type"; a candidate carries
// its media line as "id" (mid) and "label" (m-line index).
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        #[serde(default)]
        candidate: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        label: Option<u16>,
    },
    Bye,
}

impl From<SignalingMessage> for WireMessage {
    fn from(message: SignalingMessage) -> Self {
        match message {
            SignalingMessage::Description(SessionDescription {
                sdp_type: SdpType::Offer,
                sdp,
            }) => WireMessage::Offer { sdp },
            SignalingMessage::Description(SessionDescription {
                sdp_type: SdpType::Answer,
                sdp,
            }) => WireMessage::Answer { sdp },
            SignalingMessage::Candidate(candidate) => WireMessage::Candidate {
                candidate: candidate.candidate,
                id: candidate.sdp_mid,
                label: candidate.sdp_mline_index,
            },
            SignalingMessage::Bye => WireMessage::Bye,
        }
    }
}

impl TryFrom<WireMessage> for SignalingMessage {
    type Error = String;

    fn try_from(message: WireMessage) -> Result<Self, Self::Error> {
        Ok(match message {
            WireMessage::Offer { sdp } => {
                SignalingMessage::Description(SessionDescription::offer(sdp))
            }
            WireMessage::Answer { sdp } => {
                SignalingMessage::Description(SessionDescription::answer(sdp))
            }
            WireMessage::Candidate {
                candidate,
                id,
                label,
            } => {
                if id.is_none() && label.is_none() && !candidate.trim().is_empty() {
                    return Err("candidate has neither a mid nor an m-line index".to_string());
                }
                SignalingMessage::Candidate(IceCandidate {
                    candidate,
                    sdp_mid: id,
                    sdp_mline_index: label,
                })
            }
            WireMessage::Bye => SignalingMessage::Bye,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SDP: &str = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n\
                       m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\n\
                       m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\n";

    #[test]
    fn test_role_from_str() {
        assert_eq!("offer".parse::<Role>().unwrap(), Role::Offerer);
        assert_eq!("answer".parse::<Role>().unwrap(), Role::Answerer);
        assert!("both".parse::<Role>().is_err());
    }

    #[test]
    fn test_wire_format() {
        let bye = SignalingMessage::Bye.to_json().unwrap();
        assert_eq!(bye, r#"{"type":"bye"}"#);

        let offer = SignalingMessage::Description(SessionDescription::offer("v=0\r\n"));
        let json: serde_json::Value = serde_json::from_str(&offer.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "offer");
        assert_eq!(json["sdp"], "v=0\r\n");

        let candidate = SignalingMessage::from_json(
            r#"{"type":"candidate","candidate":"candidate:1 1 udp 2130706431 10.0.0.1 5000 typ host","id":"0","label":0}"#,
        )
        .unwrap();
        match candidate {
            SignalingMessage::Candidate(candidate) => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert!(!candidate.is_end_of_candidates());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_end_of_candidates_on_the_wire() {
        let message =
            SignalingMessage::from_json(r#"{"type":"candidate","candidate":""}"#).unwrap();
        match message {
            SignalingMessage::Candidate(candidate) => assert!(candidate.is_end_of_candidates()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_type() {
        assert!(SignalingMessage::from_json(r#"{"type":"pranswer","sdp":""}"#).is_err());
        assert!(SignalingMessage::from_json(
            r#"{"type":"candidate","candidate":"candidate:1 1 udp 1 10.0.0.1 5000 typ host"}"#
        )
        .is_err());
    }

    #[test]
    fn test_media_lines() {
        let lines = SessionDescription::offer(SDP).media_lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].kind, "audio");
        assert_eq!(lines[0].mid.as_deref(), Some("0"));
        assert_eq!(lines[1].index, 1);
        assert_eq!(lines[1].mid.as_deref(), Some("1"));
    }
}
