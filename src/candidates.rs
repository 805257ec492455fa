use crate::protocol::IceCandidate;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("Candidate is missing the {} field", .0)]
    MissingField(&'static str),

    #[error("Candidate has an invalid {} field: {:?}", .0, .1)]
    InvalidField(&'static str, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
}

impl FromStr for CandidateType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateType::Host),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "relay" => Ok(CandidateType::Relay),
            other => Err(ParseError::InvalidField("typ", other.to_string())),
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relay => "relay",
        })
    }
}

/// The structured form of an SDP `candidate:` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u32,
    pub address: String,
    pub port: u16,
    pub kind: CandidateType,
    pub related_address: Option<String>,
    pub related_port: Option<u16>,
    pub tcp_type: Option<String>,
}

fn parse_number<T: FromStr>(name: &'static str, value: Option<&str>) -> Result<T, ParseError> {
    let value = value.ok_or(ParseError::MissingField(name))?;
    value
        .parse()
        .map_err(|_| ParseError::InvalidField(name, value.to_string()))
}

impl FromStr for Candidate {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("a=").unwrap_or(s);
        let s = s.strip_prefix("candidate:").unwrap_or(s);
        let mut fields = s.split_whitespace();
        let foundation = fields
            .next()
            .ok_or(ParseError::MissingField("foundation"))?
            .to_string();
        let component = parse_number("component", fields.next())?;
        let protocol = fields
            .next()
            .ok_or(ParseError::MissingField("protocol"))?
            .to_lowercase();
        if protocol != "udp" && protocol != "tcp" {
            return Err(ParseError::InvalidField("protocol", protocol));
        }
        let priority = parse_number("priority", fields.next())?;
        let address = fields
            .next()
            .ok_or(ParseError::MissingField("address"))?
            .to_string();
        let port = parse_number("port", fields.next())?;
        match fields.next() {
            Some("typ") => (),
            Some(other) => return Err(ParseError::InvalidField("typ", other.to_string())),
            None => return Err(ParseError::MissingField("typ")),
        }
        let kind = fields
            .next()
            .ok_or(ParseError::MissingField("typ"))?
            .parse()?;

        let mut candidate = Candidate {
            foundation,
            component,
            protocol,
            priority,
            address,
            port,
            kind,
            related_address: None,
            related_port: None,
            tcp_type: None,
        };
        // Remaining fields are name/value pairs; unknown extensions are skipped.
        while let Some(name) = fields.next() {
            let value = fields.next();
            match name {
                "raddr" => {
                    candidate.related_address = Some(
                        value
                            .ok_or(ParseError::MissingField("raddr"))?
                            .to_string(),
                    )
                }
                "rport" => candidate.related_port = Some(parse_number("rport", value)?),
                "tcptype" => {
                    candidate.tcp_type = Some(
                        value
                            .ok_or(ParseError::MissingField("tcptype"))?
                            .to_string(),
                    )
                }
                _ => (),
            }
        }
        Ok(candidate)
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.address,
            self.port,
            self.kind
        )?;
        if let Some(address) = &self.related_address {
            write!(f, " raddr {address}")?;
        }
        if let Some(port) = self.related_port {
            write!(f, " rport {port}")?;
        }
        if let Some(tcp_type) = &self.tcp_type {
            write!(f, " tcptype {tcp_type}")?;
        }
        Ok(())
    }
}

impl IceCandidate {
    /// Parses the attribute; `Ok(None)` for the end-of-candidates marker.
    pub fn parse(&self) -> Result<Option<Candidate>, ParseError> {
        if self.is_end_of_candidates() {
            Ok(None)
        } else {
            self.candidate.parse().map(Some)
        }
    }
}

/// Remote candidates that arrived before any remote description, kept in
/// arrival order.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn drain(&mut self) -> impl Iterator<Item = IceCandidate> + '_ {
        self.queue.drain(..)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host() {
        let candidate: Candidate =
            "candidate:842163049 1 udp 1677729535 192.168.1.5 54321 typ host generation 0"
                .parse()
                .unwrap();
        assert_eq!(candidate.foundation, "842163049");
        assert_eq!(candidate.component, 1);
        assert_eq!(candidate.protocol, "udp");
        assert_eq!(candidate.priority, 1677729535);
        assert_eq!(candidate.address, "192.168.1.5");
        assert_eq!(candidate.port, 54321);
        assert_eq!(candidate.kind, CandidateType::Host);
        assert_eq!(candidate.related_address, None);
    }

    #[test]
    fn test_parse_srflx_with_related() {
        let candidate: Candidate =
            "candidate:1 1 UDP 1686052607 203.0.113.7 61000 typ srflx raddr 10.0.0.2 rport 5000"
                .parse()
                .unwrap();
        assert_eq!(candidate.kind, CandidateType::ServerReflexive);
        assert_eq!(candidate.related_address.as_deref(), Some("10.0.0.2"));
        assert_eq!(candidate.related_port, Some(5000));
        assert_eq!(
            candidate.to_string(),
            "candidate:1 1 udp 1686052607 203.0.113.7 61000 typ srflx raddr 10.0.0.2 rport 5000"
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "candidate:1 1 udp".parse::<Candidate>(),
            Err(ParseError::MissingField("priority"))
        );
        assert_eq!(
            "candidate:1 1 udp 100 10.0.0.1 99999 typ host".parse::<Candidate>(),
            Err(ParseError::InvalidField("port", "99999".to_string()))
        );
        assert!("candidate:1 1 sctp 100 10.0.0.1 5000 typ host"
            .parse::<Candidate>()
            .is_err());
        assert!("candidate:1 1 udp 100 10.0.0.1 5000 typ wormhole"
            .parse::<Candidate>()
            .is_err());
    }

    #[test]
    fn test_end_of_candidates_parses_to_none() {
        let candidate = IceCandidate::end_of_candidates(Some("0".to_string()), Some(0));
        assert_eq!(candidate.parse(), Ok(None));
    }

    #[test]
    fn test_buffer_keeps_order() {
        let mut buffer = CandidateBuffer::new();
        for port in 5000..5005 {
            buffer.push(IceCandidate {
                candidate: format!("candidate:1 1 udp 100 10.0.0.1 {port} typ host"),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            });
        }
        assert_eq!(buffer.len(), 5);
        let ports: Vec<u16> = buffer
            .drain()
            .map(|c| c.parse().unwrap().unwrap().port)
            .collect();
        assert_eq!(ports, vec![5000, 5001, 5002, 5003, 5004]);
        assert!(buffer.is_empty());
    }
}
