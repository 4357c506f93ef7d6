pub mod client;
pub mod socket;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// One line of the relay text protocol.
///
/// Anything that is not a relay command is a `Payload`. The relay forwards
/// payloads verbatim between paired peers; only endpoints interpret them as
/// [`PeerMessage`]s.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayMessage {
    /// `HELLO <id>` registers, bare `HELLO` acknowledges.
    Hello(Option<String>),
    /// `SESSION <peer-id>`: a pairing request towards the relay, a pairing
    /// notification towards the passive endpoint.
    Session(String),
    SessionOk,
    SessionEnd,
    SessionClosed,
    OfferRequest,
    Error(String),
    Payload(String),
}

impl RelayMessage {
    pub fn parse(text: &str) -> Self {
        match text {
            "HELLO" => return Self::Hello(None),
            "SESSION_OK" => return Self::SessionOk,
            "SESSION_END" => return Self::SessionEnd,
            "SESSION_CLOSED" => return Self::SessionClosed,
            "OFFER_REQUEST" => return Self::OfferRequest,
            "ERROR" => return Self::Error(String::new()),
            _ => {}
        }
        if let Some(id) = text.strip_prefix("HELLO ") {
            return Self::Hello(Some(id.to_owned()));
        }
        if let Some(peer_id) = text.strip_prefix("SESSION ") {
            return Self::Session(peer_id.to_owned());
        }
        if let Some(reason) = text.strip_prefix("ERROR ") {
            return Self::Error(reason.to_owned());
        }
        Self::Payload(text.to_owned())
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "HELLO",
            Self::Session(_) => "SESSION",
            Self::SessionOk => "SESSION_OK",
            Self::SessionEnd => "SESSION_END",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::OfferRequest => "OFFER_REQUEST",
            Self::Error(_) => "ERROR",
            Self::Payload(_) => "payload",
        }
    }
}

impl fmt::Display for RelayMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hello(None) => write!(f, "HELLO"),
            Self::Hello(Some(id)) => write!(f, "HELLO {}", id),
            Self::Session(peer_id) => write!(f, "SESSION {}", peer_id),
            Self::SessionOk => write!(f, "SESSION_OK"),
            Self::SessionEnd => write!(f, "SESSION_END"),
            Self::SessionClosed => write!(f, "SESSION_CLOSED"),
            Self::OfferRequest => write!(f, "OFFER_REQUEST"),
            Self::Error(reason) => write!(f, "ERROR {}", reason),
            Self::Payload(text) => write!(f, "{}", text),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Offer => write!(f, "offer"),
            Self::Answer => write!(f, "answer"),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: u16,
}

/// JSON payload exchanged between paired endpoints.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerMessage {
    Sdp(SessionDescription),
    Ice(IceCandidate),
}

impl PeerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| ProtocolError::InvalidJson(err.to_string()))?;
        let Value::Object(object) = &value else {
            return Err(ProtocolError::UnknownMessage(text.to_owned()));
        };
        if let Some(sdp) = object.get("sdp") {
            match sdp.get("type").and_then(Value::as_str) {
                None => return Err(ProtocolError::MissingSdpType),
                Some("offer" | "answer") => {}
                Some(other) => return Err(ProtocolError::UnsupportedSdpType(other.to_owned())),
            }
        } else if !object.contains_key("ice") {
            return Err(ProtocolError::UnknownMessage(text.to_owned()));
        }
        serde_json::from_value(value).map_err(|err| ProtocolError::InvalidJson(err.to_string()))
    }
}

impl fmt::Display for PeerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
        f.write_str(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_commands() {
        assert_eq!(RelayMessage::parse("HELLO"), RelayMessage::Hello(None));
        assert_eq!(
            RelayMessage::parse("HELLO 1234"),
            RelayMessage::Hello(Some("1234".to_owned()))
        );
        assert_eq!(
            RelayMessage::parse("SESSION peer"),
            RelayMessage::Session("peer".to_owned())
        );
        assert_eq!(RelayMessage::parse("SESSION_OK"), RelayMessage::SessionOk);
        assert_eq!(RelayMessage::parse("OFFER_REQUEST"), RelayMessage::OfferRequest);
        assert_eq!(
            RelayMessage::parse("ERROR peer x is busy"),
            RelayMessage::Error("peer x is busy".to_owned())
        );
        assert_eq!(RelayMessage::Session("b".to_owned()).to_string(), "SESSION b");
        assert_eq!(RelayMessage::Hello(None).to_string(), "HELLO");
    }

    #[test]
    fn test_unknown_text_is_payload() {
        let json = r#"{"ice":{"candidate":"c","sdpMLineIndex":0}}"#;
        assert_eq!(
            RelayMessage::parse(json),
            RelayMessage::Payload(json.to_owned())
        );
        // Commands are matched on the whole token.
        assert_eq!(
            RelayMessage::parse("SESSION_OKAY"),
            RelayMessage::Payload("SESSION_OKAY".to_owned())
        );
    }

    #[test]
    fn test_sdp_message_round_trip() {
        let msg = PeerMessage::Sdp(SessionDescription::offer(
            "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n".to_owned(),
        ));
        let text = msg.to_string();
        assert!(text.starts_with(r#"{"sdp":{"type":"offer","sdp":"v=0"#));
        assert_eq!(PeerMessage::parse(&text).unwrap(), msg);
    }

    #[test]
    fn test_ice_message_round_trip() {
        let msg = PeerMessage::Ice(IceCandidate {
            candidate: "candidate:1 1 UDP 2130706431 192.168.1.1 54321 typ host".to_owned(),
            sdp_mline_index: 1,
        });
        let text = msg.to_string();
        assert!(text.contains(r#""sdpMLineIndex":1"#));
        assert_eq!(PeerMessage::parse(&text).unwrap(), msg);
    }

    #[test]
    fn test_browser_candidate_extra_fields_are_ignored() {
        let text = r#"{"ice":{"candidate":"candidate:0","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abc"}}"#;
        let PeerMessage::Ice(candidate) = PeerMessage::parse(text).unwrap() else {
            panic!("expected candidate");
        };
        assert_eq!(candidate.candidate, "candidate:0");
        assert_eq!(candidate.sdp_mline_index, 0);
    }

    #[test]
    fn test_malformed_peer_messages() {
        assert!(matches!(
            PeerMessage::parse("not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert_eq!(
            PeerMessage::parse(r#"{"sdp":{"sdp":"v=0"}}"#),
            Err(ProtocolError::MissingSdpType)
        );
        assert_eq!(
            PeerMessage::parse(r#"{"sdp":{"type":"pranswer","sdp":"v=0"}}"#),
            Err(ProtocolError::UnsupportedSdpType("pranswer".to_owned()))
        );
        assert!(matches!(
            PeerMessage::parse(r#"{"foo":1}"#),
            Err(ProtocolError::UnknownMessage(_))
        ));
        assert!(matches!(
            PeerMessage::parse(r#"{"ice":{"candidate":"c"}}"#),
            Err(ProtocolError::InvalidJson(_))
        ));
    }
}
