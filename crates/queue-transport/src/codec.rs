//! Envelope wire codec.
//!
//! Envelopes travel as a versioned JSON document that is opaque to the broker:
//!
//! ```json
//! {"version":1,"id":"…","correlation_id":"…","reply_to":null,"headers":{"CorrelationId":"…"},"body":"aGVsbG8="}
//! ```
//!
//! Encoding stamps the [`CORRELATION_ID_HEADER`] so the correlation survives
//! the fresh id every send attempt receives. Decoding restores the id from the
//! [`ORIGINAL_ID_HEADER`] of a redelivered copy and then the correlation id
//! from the header, falling back to the id.

use crate::error::CodecError;
use crate::message::{Envelope, MessageId, CORRELATION_ID_HEADER, ORIGINAL_ID_HEADER};
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;

/// Current envelope schema version
pub const WIRE_VERSION: u32 = 1;

#[derive(Serialize)]
struct WireEnvelopeRef<'a> {
    version: u32,
    id: &'a str,
    correlation_id: Option<&'a str>,
    reply_to: Option<&'a str>,
    headers: BTreeMap<&'a str, &'a str>,
    body: String,
}

#[derive(Deserialize)]
struct WireEnvelope {
    id: String,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    reply_to: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    body: String,
}

#[derive(Deserialize)]
struct WireVersion {
    version: u32,
}

/// Stamp correlation metadata onto the envelope and encode it
pub fn encode(envelope: &mut Envelope) -> Result<Bytes, CodecError> {
    stamp_correlation(envelope);

    let wire = WireEnvelopeRef {
        version: WIRE_VERSION,
        id: envelope.id.as_str(),
        correlation_id: envelope.correlation_id.as_deref(),
        reply_to: envelope.reply_to.as_deref(),
        headers: envelope
            .headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect(),
        body: general_purpose::STANDARD.encode(&envelope.body),
    };

    Ok(Bytes::from(serde_json::to_vec(&wire)?))
}

/// Decode an envelope and restore its identity and correlation
pub fn decode(raw: &[u8]) -> Result<Envelope, CodecError> {
    let versioned: WireVersion = serde_json::from_slice(raw)?;
    if versioned.version != WIRE_VERSION {
        return Err(CodecError::UnsupportedVersion {
            found: versioned.version,
            expected: WIRE_VERSION,
        });
    }

    let wire: WireEnvelope = serde_json::from_slice(raw)?;
    let body = general_purpose::STANDARD.decode(wire.body.as_bytes())?;
    let id = wire
        .id
        .parse::<MessageId>()
        .map_err(|e| CodecError::InvalidField {
            field: "id".to_string(),
            message: e.to_string(),
        })?;

    let mut envelope = Envelope {
        id,
        correlation_id: wire.correlation_id,
        reply_to: wire.reply_to,
        headers: wire.headers,
        body: Bytes::from(body),
    };
    restore_identity(&mut envelope);

    Ok(envelope)
}

/// Ensure the correlation header is present and non-empty
fn stamp_correlation(envelope: &mut Envelope) {
    if envelope.header(CORRELATION_ID_HEADER).is_some() {
        return;
    }

    let correlation = envelope
        .correlation()
        .map(str::to_string)
        .unwrap_or_else(|| envelope.id.as_str().to_string());
    envelope
        .headers
        .insert(CORRELATION_ID_HEADER.to_string(), correlation);
}

/// Apply the original-id override, then the correlation override
fn restore_identity(envelope: &mut Envelope) {
    if let Some(original) = envelope.header(ORIGINAL_ID_HEADER) {
        if let Ok(id) = original.parse::<MessageId>() {
            envelope.id = id;
        }
    }

    let correlation = envelope
        .header(CORRELATION_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| envelope.id.as_str().to_string());
    envelope.correlation_id = Some(correlation);
}
