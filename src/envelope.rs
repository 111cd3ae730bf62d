//! Envelope encoding and decoding for the broadcast channel.
//!
//! Every message on the channel is a UTF-8 JSON object:
//!
//! ```json
//! {"action": "handshakeRequest", "fromUserId": "User-1234567", "toUserId": null, "data": {...}}
//! ```
//!
//! The transport delivers every envelope to every participant; `toUserId` is an
//! addressing convention that receivers enforce with [`Envelope::is_addressed_to`].

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

use crate::keys::{decode_public_key, Identity};
use crate::types::{ChannelBoxError, Result, KEY_SIZE};

/// The action tag of an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Action {
    HandshakeRequest,
    HandshakeAnswer,
    SetMasterKey,
    Transmit,
    Stop,
    /// Any tag this implementation does not understand. Ignored on receipt.
    Unknown(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Action::HandshakeRequest => "handshakeRequest",
            Action::HandshakeAnswer => "handshakeAnswer",
            Action::SetMasterKey => "setMasterKey",
            Action::Transmit => "transmit",
            Action::Stop => "stop",
            Action::Unknown(raw) => raw,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "handshakeRequest" => Action::HandshakeRequest,
            "handshakeAnswer" => Action::HandshakeAnswer,
            "setMasterKey" => Action::SetMasterKey,
            "transmit" => Action::Transmit,
            "stop" => Action::Stop,
            other => Action::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Action::parse(&raw))
    }
}

/// Payload of `handshakeRequest`, `handshakeAnswer`, `setMasterKey` and `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyAnnouncement {
    /// Base64 of the 32 raw public key bytes.
    pub public_key: String,
}

impl KeyAnnouncement {
    pub fn from_identity(identity: &Identity) -> Self {
        Self {
            public_key: identity.public_key_base64(),
        }
    }

    /// Decode the announced key, enforcing its length.
    pub fn decode(&self) -> Result<[u8; KEY_SIZE]> {
        decode_public_key(&self.public_key)
    }
}

/// A channel message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub action: Action,
    pub from_user_id: String,
    /// `None` means broadcast to all.
    pub to_user_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    pub fn new(
        action: Action,
        from_user_id: impl Into<String>,
        to_user_id: Option<String>,
        data: Value,
    ) -> Self {
        Self {
            action,
            from_user_id: from_user_id.into(),
            to_user_id,
            data,
        }
    }

    fn key_announcement(action: Action, identity: &Identity, to_user_id: Option<String>) -> Self {
        let data = json!({ "publicKey": identity.public_key_base64() });
        Self::new(action, identity.user_id(), to_user_id, data)
    }

    /// Broadcast discovery request carrying our public key.
    pub fn handshake_request(identity: &Identity) -> Self {
        Self::key_announcement(Action::HandshakeRequest, identity, None)
    }

    /// Unicast reply to a discovery request.
    pub fn handshake_answer(identity: &Identity, to_user_id: impl Into<String>) -> Self {
        Self::key_announcement(Action::HandshakeAnswer, identity, Some(to_user_id.into()))
    }

    /// Broadcast claim to be the master peer.
    pub fn set_master_key(identity: &Identity) -> Self {
        Self::key_announcement(Action::SetMasterKey, identity, None)
    }

    /// Broadcast departure notice sent on clean shutdown.
    pub fn stop(identity: &Identity) -> Self {
        Self::key_announcement(Action::Stop, identity, None)
    }

    /// Encrypted application payload. Always broadcast; only the holder of the
    /// matching key can open it.
    pub fn transmit(identity: &Identity, ciphertext: String) -> Self {
        Self::new(
            Action::Transmit,
            identity.user_id(),
            None,
            Value::String(ciphertext),
        )
    }

    /// Parse an incoming text message.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| ChannelBoxError::ProtocolParseError(format!("Invalid envelope: {e}")))
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| ChannelBoxError::ProtocolParseError(format!("Envelope encode failed: {e}")))
    }

    /// Receiver-side addressing filter, applied before any action handling.
    ///
    /// Rejects our own echoes and unicasts meant for someone else.
    pub fn is_addressed_to(&self, user_id: &str) -> bool {
        if self.from_user_id == user_id {
            return false;
        }
        match &self.to_user_id {
            Some(to) => to == user_id,
            None => true,
        }
    }

    /// Decode `data` as a [`KeyAnnouncement`] and return the announced key.
    pub fn announced_key(&self) -> Result<[u8; KEY_SIZE]> {
        let announcement: KeyAnnouncement = serde_json::from_value(self.data.clone())
            .map_err(|e| {
                ChannelBoxError::ProtocolParseError(format!("{} without publicKey: {e}", self.action))
            })?;
        announcement.decode()
    }

    /// The ciphertext string of a `transmit` envelope.
    pub fn ciphertext(&self) -> Result<&str> {
        self.data.as_str().ok_or_else(|| {
            ChannelBoxError::ProtocolParseError("transmit data is not a string".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_shape() {
        let identity = Identity::from_secret_bytes("User-1500000", [3u8; 32]);
        let envelope = Envelope::handshake_request(&identity);
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({
                "action": "handshakeRequest",
                "fromUserId": "User-1500000",
                "toUserId": null,
                "data": {"publicKey": identity.public_key_base64()},
            })
        );
    }

    #[test]
    fn test_parse_all_actions() {
        for (raw, action) in [
            ("handshakeRequest", Action::HandshakeRequest),
            ("handshakeAnswer", Action::HandshakeAnswer),
            ("setMasterKey", Action::SetMasterKey),
            ("transmit", Action::Transmit),
            ("stop", Action::Stop),
            ("dance", Action::Unknown("dance".to_string())),
        ] {
            let text = format!(
                r#"{{"action":"{raw}","fromUserId":"User-1000000","toUserId":null,"data":null}}"#
            );
            let envelope = Envelope::parse(&text).unwrap();
            assert_eq!(envelope.action, action);
            assert_eq!(envelope.action.as_str(), raw);
        }
    }

    #[test]
    fn test_parse_missing_optional_fields() {
        let envelope = Envelope::parse(r#"{"action":"stop","fromUserId":"User-1"}"#).unwrap();
        assert_eq!(envelope.to_user_id, None);
        assert_eq!(envelope.data, Value::Null);
    }

    #[test]
    fn test_parse_malformed() {
        for text in ["not json", "[1,2]", r#"{"action":"stop"}"#, r#"{"fromUserId":"a"}"#] {
            assert!(matches!(
                Envelope::parse(text),
                Err(ChannelBoxError::ProtocolParseError(_))
            ));
        }
    }

    #[test]
    fn test_addressing_filter() {
        let me = "User-1111111";
        let broadcast = Envelope::new(Action::Stop, "User-2222222", None, Value::Null);
        let to_me = Envelope::new(Action::Stop, "User-2222222", Some(me.to_string()), Value::Null);
        let to_other = Envelope::new(
            Action::Stop,
            "User-2222222",
            Some("User-3333333".to_string()),
            Value::Null,
        );
        let from_me = Envelope::new(Action::Stop, me, None, Value::Null);

        assert!(broadcast.is_addressed_to(me));
        assert!(to_me.is_addressed_to(me));
        assert!(!to_other.is_addressed_to(me));
        assert!(!from_me.is_addressed_to(me));
    }

    #[test]
    fn test_announced_key() {
        let identity = Identity::generate();
        let answer = Envelope::handshake_answer(&identity, "User-1234567");
        assert_eq!(answer.to_user_id.as_deref(), Some("User-1234567"));
        assert_eq!(answer.announced_key().unwrap(), identity.public_key());

        let missing = Envelope::new(Action::SetMasterKey, "User-1", None, json!({}));
        assert!(matches!(
            missing.announced_key(),
            Err(ChannelBoxError::ProtocolParseError(_))
        ));

        let short = Envelope::new(
            Action::SetMasterKey,
            "User-1",
            None,
            json!({"publicKey": "AAAA"}),
        );
        assert!(matches!(
            short.announced_key(),
            Err(ChannelBoxError::InvalidPublicKey(_))
        ));
    }

    #[test]
    fn test_transmit_ciphertext() {
        let identity = Identity::generate();
        let envelope = Envelope::transmit(&identity, "abc=".to_string());
        assert_eq!(envelope.ciphertext().unwrap(), "abc=");
        assert_eq!(envelope.to_user_id, None);

        let bad = Envelope::new(Action::Transmit, "User-1", None, json!({"x": 1}));
        assert!(bad.ciphertext().is_err());
    }

    #[test]
    fn test_key_announcing_envelopes_carry_public_key() {
        let identity = Identity::from_secret_bytes("User-1500000", [9u8; 32]);
        for envelope in [
            Envelope::handshake_request(&identity),
            Envelope::handshake_answer(&identity, "User-1999999"),
            Envelope::set_master_key(&identity),
            Envelope::stop(&identity),
        ] {
            assert!(!envelope.data.is_null(), "{} carried null data", envelope.action);
            let announcement: KeyAnnouncement =
                serde_json::from_value(envelope.data.clone()).unwrap();
            assert_eq!(announcement, KeyAnnouncement::from_identity(&identity));
            assert_eq!(envelope.announced_key().unwrap(), identity.public_key());
        }
    }
}
