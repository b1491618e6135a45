use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// AES-256-GCM output with the authentication tag split from the ciphertext.
///
/// All three fields travel as standard base64 strings:
/// `{"ciphertext": "...", "iv": "...", "authTag": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    /// 96-bit nonce, random per encryption.
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    /// 128-bit GCM tag.
    #[serde(with = "b64")]
    pub auth_tag: Vec<u8>,
}

/// Result of opportunistic encryption toward a peer.
///
/// Serialized with an explicit `encrypted` flag:
/// - `{"encrypted": true, "ciphertext": .., "iv": .., "authTag": ..}`
/// - `{"encrypted": false, "data": "<plaintext>"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SealedWire", into = "SealedWire")]
pub enum SealedPayload {
    Encrypted(EncryptedEnvelope),
    Clear(String),
}

impl SealedPayload {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SealedWire {
    encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ciphertext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    auth_tag: Option<String>,
}

impl From<SealedPayload> for SealedWire {
    fn from(payload: SealedPayload) -> Self {
        match payload {
            SealedPayload::Encrypted(env) => Self {
                encrypted: true,
                data: None,
                ciphertext: Some(STANDARD.encode(&env.ciphertext)),
                iv: Some(STANDARD.encode(&env.iv)),
                auth_tag: Some(STANDARD.encode(&env.auth_tag)),
            },
            SealedPayload::Clear(data) => Self {
                encrypted: false,
                data: Some(data),
                ciphertext: None,
                iv: None,
                auth_tag: None,
            },
        }
    }
}

impl TryFrom<SealedWire> for SealedPayload {
    type Error = String;

    fn try_from(wire: SealedWire) -> Result<Self, Self::Error> {
        if !wire.encrypted {
            return wire
                .data
                .map(SealedPayload::Clear)
                .ok_or_else(|| "clear payload without data".to_string());
        }

        let decode = |field: Option<String>, name: &str| -> Result<Vec<u8>, String> {
            let value = field.ok_or_else(|| format!("encrypted payload missing {name}"))?;
            STANDARD
                .decode(value.as_bytes())
                .map_err(|e| format!("invalid base64 in {name}: {e}"))
        };

        Ok(SealedPayload::Encrypted(EncryptedEnvelope {
            ciphertext: decode(wire.ciphertext, "ciphertext")?,
            iv: decode(wire.iv, "iv")?,
            auth_tag: decode(wire.auth_tag, "authTag")?,
        }))
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> EncryptedEnvelope {
        EncryptedEnvelope {
            ciphertext: vec![1, 2, 3, 4],
            iv: vec![9; 12],
            auth_tag: vec![7; 16],
        }
    }

    #[test]
    fn envelope_uses_camel_case_base64_fields() {
        let json = serde_json::to_value(sample_envelope()).unwrap();
        assert_eq!(json["ciphertext"], "AQIDBA==");
        assert!(json.get("authTag").is_some());
        assert!(json.get("auth_tag").is_none());
    }

    #[test]
    fn sealed_clear_shape() {
        let json = serde_json::to_value(SealedPayload::Clear("hi".into())).unwrap();
        assert_eq!(json, serde_json::json!({"encrypted": false, "data": "hi"}));

        let back: SealedPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, SealedPayload::Clear("hi".into()));
    }

    #[test]
    fn sealed_encrypted_shape_flattens_envelope() {
        let sealed = SealedPayload::Encrypted(sample_envelope());
        let json = serde_json::to_value(&sealed).unwrap();
        assert_eq!(json["encrypted"], true);
        assert_eq!(json["iv"], STANDARD.encode([9u8; 12]));
        assert!(json.get("data").is_none());

        let back: SealedPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, sealed);
    }

    #[test]
    fn sealed_rejects_incomplete_shapes() {
        let missing_tag = serde_json::json!({"encrypted": true, "ciphertext": "AA==", "iv": "AA=="});
        assert!(serde_json::from_value::<SealedPayload>(missing_tag).is_err());

        let missing_data = serde_json::json!({"encrypted": false});
        assert!(serde_json::from_value::<SealedPayload>(missing_data).is_err());
    }
}
