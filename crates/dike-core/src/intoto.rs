//! DSSE envelope and in-toto statement types.
//!
//! Signatures and attestations travel as DSSE envelopes: a base64 payload,
//! a payload type, and one or more signatures over the pre-authentication
//! encoding (PAE) of both.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The in-toto statement type URI.
pub const STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v1";

/// A DSSE signing envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Base64-encoded payload.
    pub payload: String,

    /// Payload media type (e.g. `application/vnd.in-toto+json`).
    pub payload_type: String,

    /// Signatures over the PAE of `payload_type` and the decoded payload.
    pub signatures: Vec<EnvelopeSignature>,
}

impl Envelope {
    /// Decodes the envelope payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEnvelope`] if the payload is not valid base64.
    pub fn decode_payload(&self) -> Result<Vec<u8>> {
        BASE64.decode(&self.payload).map_err(|e| Error::InvalidEnvelope {
            reason: format!("payload is not valid base64: {e}"),
        })
    }

    /// Returns the PAE bytes that the envelope signatures cover.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be decoded.
    pub fn pae(&self) -> Result<Vec<u8>> {
        Ok(pae(&self.payload_type, &self.decode_payload()?))
    }

    /// Decodes the payload as an in-toto [`Statement`].
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not base64 or not a statement.
    pub fn statement(&self) -> Result<Statement> {
        let payload = self.decode_payload()?;
        serde_json::from_slice(&payload).map_err(|e| Error::InvalidEnvelope {
            reason: format!("payload is not an in-toto statement: {e}"),
        })
    }
}

/// One signature inside a DSSE envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EnvelopeSignature {
    /// Identifier of the key that produced the signature.
    #[serde(default)]
    pub keyid: String,

    /// Base64-encoded signature bytes.
    pub sig: String,

    /// PEM certificate (chain) identifying the signer, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<String>,

    /// Transparency-log bundle proving the signature was logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle: Option<LogBundle>,
}

impl EnvelopeSignature {
    /// Decodes the signature bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEnvelope`] if the signature is not base64.
    pub fn decode(&self) -> Result<Vec<u8>> {
        BASE64.decode(&self.sig).map_err(|e| Error::InvalidEnvelope {
            reason: format!("signature is not valid base64: {e}"),
        })
    }
}

/// A transparency-log inclusion bundle attached to a signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBundle {
    /// Base64 signature by the log over the canonicalized payload.
    #[serde(rename = "SignedEntryTimestamp")]
    pub signed_entry_timestamp: String,

    /// The logged entry.
    #[serde(rename = "Payload")]
    pub payload: LogPayload,
}

/// The logged-entry body covered by the signed entry timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPayload {
    /// Base64 entry body.
    pub body: String,

    /// Unix time the entry was integrated into the log.
    pub integrated_time: i64,

    /// Index of the entry in the log.
    pub log_index: i64,

    /// Identifier of the log shard.
    #[serde(rename = "logID")]
    pub log_id: String,
}

impl LogBundle {
    /// Returns the canonical JSON bytes the signed entry timestamp covers.
    ///
    /// Keys are emitted in sorted order, matching the log's RFC 8785 style
    /// canonicalization of this flat payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn canonical_payload(&self) -> Result<Vec<u8>> {
        // serde_json maps are sorted by key, which is exactly the canonical
        // form for this flat object.
        let value = serde_json::json!({
            "body": self.payload.body,
            "integratedTime": self.payload.integrated_time,
            "logID": self.payload.log_id,
            "logIndex": self.payload.log_index,
        });
        Ok(serde_json::to_vec(&value)?)
    }

    /// Decodes the signed entry timestamp bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidEnvelope`] if it is not valid base64.
    pub fn decode_set(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.signed_entry_timestamp)
            .map_err(|e| Error::InvalidEnvelope {
                reason: format!("signed entry timestamp is not valid base64: {e}"),
            })
    }
}

/// Computes the DSSE pre-authentication encoding:
/// `DSSEv1 SP len(type) SP type SP len(payload) SP payload`.
#[must_use]
pub fn pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + payload_type.len() + 32);
    out.extend_from_slice(b"DSSEv1 ");
    out.extend_from_slice(payload_type.len().to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(payload_type.as_bytes());
    out.push(b' ');
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(payload);
    out
}

/// An in-toto statement: a claim (`predicate`) about one or more subjects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// Statement type URI.
    #[serde(rename = "_type")]
    pub statement_type: String,

    /// Artifacts the claim is about.
    pub subject: Vec<Subject>,

    /// Predicate type URI (e.g. `https://slsa.dev/provenance/v1`).
    #[serde(rename = "predicateType")]
    pub predicate_type: String,

    /// The claim body.
    #[serde(default)]
    pub predicate: Value,
}

impl Statement {
    /// Returns whether any subject digest matches the given
    /// `algorithm:hex` digest.
    #[must_use]
    pub fn matches_digest(&self, digest: &str) -> bool {
        let Some((algorithm, hex)) = digest.split_once(':') else {
            return false;
        };
        self.subject
            .iter()
            .any(|s| s.digest.get(algorithm).is_some_and(|d| d == hex))
    }
}

/// A statement subject: a named artifact with its digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Subject name, typically the image name.
    #[serde(default)]
    pub name: String,

    /// Digests keyed by algorithm (`sha256` → hex).
    pub digest: BTreeMap<String, String>,
}
