//! Macaroon value type, HMAC-SHA256 signature chain and the V2 JSON wire format.
//!
//! The signature chain and JSON layout are compatible with libmacaroons/jmacaroons so
//! that previously issued tokens keep verifying.

use super::error::{BakeryError, Result};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE_NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_BYTES: usize = 32;
const KEY_GENERATOR: &[u8] = b"macaroons-key-generator";

/// Accepts both padded and unpadded URL-safe base64.
pub(crate) const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaveatPacket {
    pub id: Vec<u8>,
    pub location: Option<String>,
    pub verification_id: Option<Vec<u8>>,
}

impl CaveatPacket {
    pub fn is_first_party(&self) -> bool {
        self.verification_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Macaroon {
    location: String,
    identifier: String,
    caveats: Vec<CaveatPacket>,
    signature: [u8; SIGNATURE_BYTES],
}

fn new_mac(key: &[u8]) -> HmacSha256 {
    HmacSha256::new_from_slice(key).expect("HMAC can take key of any size")
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; SIGNATURE_BYTES] {
    let mut mac = new_mac(key);
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Root keys are never used directly, they are first stretched with a fixed generator key.
fn derive_key(root_key: &[u8]) -> [u8; SIGNATURE_BYTES] {
    let mut generator = [0u8; SIGNATURE_BYTES];
    generator[..KEY_GENERATOR.len()].copy_from_slice(KEY_GENERATOR);
    hmac(&generator, root_key)
}

impl Macaroon {
    pub fn new(location: impl Into<String>, root_key: &[u8], identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        let signature = hmac(&derive_key(root_key), identifier.as_bytes());
        Self {
            location: location.into(),
            identifier,
            caveats: Vec::new(),
            signature,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn caveat_packets(&self) -> &[CaveatPacket] {
        &self.caveats
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Returns a copy of this macaroon with one more first-party caveat; `self` is unchanged.
    pub fn with_first_party_caveat(&self, caveat_id: &str) -> Macaroon {
        let mut next = self.clone();
        next.signature = hmac(&self.signature, caveat_id.as_bytes());
        next.caveats.push(CaveatPacket {
            id: caveat_id.as_bytes().to_vec(),
            location: None,
            verification_id: None,
        });
        next
    }

    /// Recomputes the signature chain from `root_key` and compares it in constant time.
    pub fn verify_signature(&self, root_key: &[u8]) -> Result<()> {
        let mut mac = new_mac(&derive_key(root_key));
        mac.update(self.identifier.as_bytes());

        for packet in &self.caveats {
            if !packet.is_first_party() {
                return Err(BakeryError::UnsupportedThirdParty(
                    packet.location.clone().unwrap_or_default(),
                ));
            }
            let signature: [u8; SIGNATURE_BYTES] = mac.finalize().into_bytes().into();
            mac = new_mac(&signature);
            mac.update(&packet.id);
        }

        mac.verify_slice(&self.signature)
            .map_err(|_| BakeryError::InvalidSignature)
    }

    pub(crate) fn to_json(&self) -> V2JsonMacaroon {
        V2JsonMacaroon {
            v: 2,
            l: Some(self.location.clone()).filter(|l| !l.is_empty()),
            i: Some(self.identifier.clone()),
            i64: None,
            c: self.caveats.iter().map(V2JsonCaveat::from).collect(),
            s: None,
            s64: Some(URL_SAFE_NO_PAD.encode(self.signature)),
        }
    }

    pub(crate) fn from_json(json: V2JsonMacaroon) -> Result<Self> {
        if json.v != 2 {
            return Err(BakeryError::Malformed(format!(
                "Unsupported macaroon version: {}",
                json.v
            )));
        }

        let identifier = match (json.i, json.i64) {
            (Some(i), _) => i,
            (None, Some(i64)) => String::from_utf8(decode_field("i64", &i64)?)
                .map_err(|_| BakeryError::Malformed("Identifier is not valid UTF-8".into()))?,
            (None, None) => return Err(BakeryError::Malformed("Missing identifier".into())),
        };

        let signature_bytes = match (json.s, json.s64) {
            (_, Some(s64)) => decode_field("s64", &s64)?,
            (Some(s), None) => s.into_bytes(),
            (None, None) => return Err(BakeryError::Malformed("Missing signature".into())),
        };
        let signature: [u8; SIGNATURE_BYTES] = signature_bytes.try_into().map_err(|_| {
            BakeryError::Malformed(format!("Signature must be {} bytes", SIGNATURE_BYTES))
        })?;

        let caveats = json
            .c
            .into_iter()
            .map(CaveatPacket::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            location: json.l.unwrap_or_default(),
            identifier,
            caveats,
            signature,
        })
    }
}

fn decode_field(field: &str, value: &str) -> Result<Vec<u8>> {
    URL_SAFE_LENIENT
        .decode(value)
        .map_err(|e| BakeryError::Malformed(format!("Field {} is not base64: {}", field, e)))
}

/// On-the-wire V2 JSON representation of a macaroon.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct V2JsonMacaroon {
    v: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    l: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    i: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    i64: Option<String>,
    #[serde(default)]
    c: Vec<V2JsonCaveat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    s: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    s64: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct V2JsonCaveat {
    #[serde(skip_serializing_if = "Option::is_none")]
    i: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    i64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    l: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    v: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    v64: Option<String>,
}

impl From<&CaveatPacket> for V2JsonCaveat {
    fn from(packet: &CaveatPacket) -> Self {
        let (i, i64) = match std::str::from_utf8(&packet.id) {
            Ok(text) => (Some(text.to_string()), None),
            Err(_) => (None, Some(URL_SAFE_NO_PAD.encode(&packet.id))),
        };
        Self {
            i,
            i64,
            l: packet.location.clone(),
            v: None,
            v64: packet
                .verification_id
                .as_ref()
                .map(|vid| URL_SAFE_NO_PAD.encode(vid)),
        }
    }
}

impl TryFrom<V2JsonCaveat> for CaveatPacket {
    type Error = BakeryError;

    fn try_from(json: V2JsonCaveat) -> Result<Self> {
        let id = match (json.i, json.i64) {
            (Some(i), _) => i.into_bytes(),
            (None, Some(i64)) => decode_field("i64", &i64)?,
            (None, None) => return Err(BakeryError::Malformed("Caveat is missing its id".into())),
        };
        let verification_id = match (json.v, json.v64) {
            (_, Some(v64)) => Some(decode_field("v64", &v64)?),
            (Some(v), None) => Some(v.into_bytes()),
            (None, None) => None,
        };
        Ok(Self {
            id,
            location: json.l,
            verification_id,
        })
    }
}
