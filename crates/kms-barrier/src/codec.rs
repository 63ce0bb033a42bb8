//! Codec layer (C2): PEM framing, minimal DER octet-string framing for raw
//! key material, and JWK/JWKS serialization for symmetric and OKP
//! (X25519/Ed25519-shaped) keys — the key kinds this crate actually
//! produces. Structured ASN.1 for RSA/EC SubjectPublicKeyInfo is out of
//! scope here; callers needing interop with those formats should encode
//! at the algorithm-family layer in `kms-core`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub enum CodecError {
    InvalidPem(String),
    InvalidDer(String),
    InvalidJwk(String),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPem(msg) => write!(f, "invalid PEM: {msg}"),
            Self::InvalidDer(msg) => write!(f, "invalid DER: {msg}"),
            Self::InvalidJwk(msg) => write!(f, "invalid JWK: {msg}"),
        }
    }
}

impl std::error::Error for CodecError {}

// ---------------------------------------------------------------------------
// PEM
// ---------------------------------------------------------------------------

pub fn encode_pem(label: &str, der: &[u8]) -> String {
    let p = pem::Pem::new(label, der);
    pem::encode(&p)
}

pub fn decode_pem(input: &str) -> Result<(String, Vec<u8>), CodecError> {
    let p = pem::parse(input).map_err(|e| CodecError::InvalidPem(e.to_string()))?;
    Ok((p.tag().to_string(), p.contents().to_vec()))
}

// ---------------------------------------------------------------------------
// DER: minimal OCTET STRING framing for raw key material
// ---------------------------------------------------------------------------

/// Wraps `bytes` in a single DER OCTET STRING TLV (tag 0x04). Lengths
/// above 127 use the short/long-form length encoding per X.690.
pub fn encode_der_octet_string(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() + 4);
    out.push(0x04);
    encode_der_length(bytes.len(), &mut out);
    out.extend_from_slice(bytes);
    out
}

pub fn decode_der_octet_string(der: &[u8]) -> Result<Vec<u8>, CodecError> {
    if der.first() != Some(&0x04) {
        return Err(CodecError::InvalidDer("expected OCTET STRING tag 0x04".into()));
    }
    let (len, header_len) = decode_der_length(&der[1..])
        .ok_or_else(|| CodecError::InvalidDer("truncated length".into()))?;
    let start = 1 + header_len;
    let end = start
        .checked_add(len)
        .ok_or_else(|| CodecError::InvalidDer("length overflow".into()))?;
    der.get(start..end)
        .map(|s| s.to_vec())
        .ok_or_else(|| CodecError::InvalidDer("truncated value".into()))
}

fn encode_der_length(len: usize, out: &mut Vec<u8>) {
    if len < 0x80 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let significant: Vec<u8> = bytes.into_iter().skip_while(|&b| b == 0).collect();
    out.push(0x80 | significant.len() as u8);
    out.extend_from_slice(&significant);
}

fn decode_der_length(buf: &[u8]) -> Option<(usize, usize)> {
    let first = *buf.first()?;
    if first & 0x80 == 0 {
        return Some((first as usize, 1));
    }
    let n = (first & 0x7f) as usize;
    if n == 0 || n > 8 {
        return None;
    }
    let bytes = buf.get(1..1 + n)?;
    let mut len = 0usize;
    for b in bytes {
        len = (len << 8) | *b as usize;
    }
    Some((len, 1 + n))
}

// ---------------------------------------------------------------------------
// JWK / JWKS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    /// Symmetric key material (AES content/intermediate/root keys).
    #[serde(rename = "oct")]
    Oct {
        k: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        kid: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        alg: Option<String>,
    },
    /// Octet-string key pairs: X25519 (ECDH) and Ed25519 (EdDSA).
    #[serde(rename = "OKP")]
    Okp {
        crv: String,
        x: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        d: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        kid: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

pub fn symmetric_key_to_jwk(key: &[u8], kid: Option<String>, alg: Option<String>) -> Jwk {
    Jwk::Oct {
        k: URL_SAFE_NO_PAD.encode(key),
        kid,
        alg,
    }
}

pub fn jwk_to_symmetric_key(jwk: &Jwk) -> Result<Vec<u8>, CodecError> {
    match jwk {
        Jwk::Oct { k, .. } => URL_SAFE_NO_PAD
            .decode(k)
            .map_err(|e| CodecError::InvalidJwk(e.to_string())),
        _ => Err(CodecError::InvalidJwk("expected kty=oct".into())),
    }
}

pub fn okp_keypair_to_jwk(crv: &str, public: &[u8], secret: Option<&[u8]>, kid: Option<String>) -> Jwk {
    Jwk::Okp {
        crv: crv.to_string(),
        x: URL_SAFE_NO_PAD.encode(public),
        d: secret.map(|s| URL_SAFE_NO_PAD.encode(s)),
        kid,
    }
}

pub fn jwk_to_okp_public(jwk: &Jwk) -> Result<Vec<u8>, CodecError> {
    match jwk {
        Jwk::Okp { x, .. } => URL_SAFE_NO_PAD
            .decode(x)
            .map_err(|e| CodecError::InvalidJwk(e.to_string())),
        _ => Err(CodecError::InvalidJwk("expected kty=OKP".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn der_octet_string_round_trips() {
        for len in [0usize, 1, 32, 127, 128, 300] {
            let data = vec![0xABu8; len];
            let der = encode_der_octet_string(&data);
            let decoded = decode_der_octet_string(&der).unwrap();
            assert_eq!(decoded, data);
        }
    }

    #[test]
    fn pem_round_trips() {
        let der = encode_der_octet_string(b"content-key-bytes");
        let pem = encode_pem("KMS CONTENT KEY", &der);
        let (label, decoded) = decode_pem(&pem).unwrap();
        assert_eq!(label, "KMS CONTENT KEY");
        assert_eq!(decoded, der);
    }

    #[test]
    fn symmetric_jwk_round_trips() {
        let key = [0x42u8; 32];
        let jwk = symmetric_key_to_jwk(&key, Some("ck1".into()), Some("A256GCM".into()));
        let recovered = jwk_to_symmetric_key(&jwk).unwrap();
        assert_eq!(recovered, key);
    }

    #[test]
    fn jwks_serializes_as_array() {
        let jwks = Jwks {
            keys: vec![symmetric_key_to_jwk(&[1; 32], None, None)],
        };
        let json = serde_json::to_string(&jwks).unwrap();
        assert!(json.contains("\"keys\""));
        let back: Jwks = serde_json::from_str(&json).unwrap();
        assert_eq!(back.keys.len(), 1);
    }
}
