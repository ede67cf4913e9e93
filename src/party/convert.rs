//! Key and Signature Encodings
//!
//! Converts raw party outputs into the wire formats the rest of the cluster
//! agrees on: compressed SEC1 public keys, packed Ed25519 points, DER ECDSA
//! signatures and 64-byte Schnorr signatures.

use k256::ecdsa::signature::Verifier as _;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::traits::{PublicKeyPoint, SigningOutput};
use crate::types::key::Curve;

/// Conversion errors
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("invalid public key: {0}")]
    InvalidKey(String),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
}

/// A finished threshold signature in its canonical form
#[derive(Debug, Clone, serde::Serialize)]
pub struct ThresholdSignature {
    /// r scalar, left-padded to 32 bytes, hex
    pub r: String,
    /// s scalar, left-padded to 32 bytes, hex
    pub s: String,
    /// Canonical encoding: DER for ECDSA, `r || s` for Schnorr/Ed25519
    pub bytes: Vec<u8>,
    /// Hex of `bytes`
    pub hex: String,
}

/// Compressed SEC1 form: 0x02/0x03 prefix by Y parity, then padded X
pub fn compress_secp256k1(x: &[u8; 32], y: &[u8; 32]) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0] = if y[31] & 1 == 0 { 0x02 } else { 0x03 };
    out[1..].copy_from_slice(x);
    out
}

/// Canonical Ed25519 encoding: Y little-endian with the X sign bit in the
/// high bit of byte 31
pub fn pack_ed25519(y: &[u8; 32], x_is_odd: bool) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (i, b) in y.iter().rev().enumerate() {
        out[i] = *b;
    }
    if x_is_odd {
        out[31] |= 0x80;
    }
    out
}

/// Hex encoding of a public key point in its canonical compressed form
pub fn public_key_hex(point: &PublicKeyPoint) -> String {
    match point {
        PublicKeyPoint::Secp256k1 { x, y } => hex::encode(compress_secp256k1(x, y)),
        PublicKeyPoint::Ed25519 { y, x_is_odd } => hex::encode(pack_ed25519(y, *x_is_odd)),
    }
}

/// Minimal DER `SEQUENCE { INTEGER r, INTEGER s }`
///
/// Leading zeros are stripped and a zero byte is prepended when the high bit
/// is set, so the encoding is accepted by standards-compliant parsers for
/// any scalar value.
pub fn encode_der(r: &[u8; 32], s: &[u8; 32]) -> Vec<u8> {
    fn push_integer(buf: &mut Vec<u8>, scalar: &[u8; 32]) {
        let mut v: &[u8] = scalar;
        while v.len() > 1 && v[0] == 0 {
            v = &v[1..];
        }
        let pad = v[0] & 0x80 != 0;
        buf.push(0x02);
        buf.push((v.len() + pad as usize) as u8);
        if pad {
            buf.push(0x00);
        }
        buf.extend_from_slice(v);
    }

    let mut body = Vec::with_capacity(72);
    push_integer(&mut body, r);
    push_integer(&mut body, s);

    let mut der = Vec::with_capacity(body.len() + 2);
    der.push(0x30);
    der.push(body.len() as u8);
    der.extend_from_slice(&body);
    der
}

/// 64-byte Schnorr/Ed25519 form: `r || s`, each left-padded to 32 bytes
pub fn schnorr_bytes(r: &[u8; 32], s: &[u8; 32]) -> [u8; 64] {
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(r);
    out[32..].copy_from_slice(s);
    out
}

/// Canonical signature for the curve the session ran on
pub fn signature_for(curve: Curve, output: &SigningOutput) -> ThresholdSignature {
    let bytes = match curve {
        Curve::Secp256k1 => encode_der(&output.r, &output.s),
        Curve::Ed25519 => schnorr_bytes(&output.r, &output.s).to_vec(),
    };
    ThresholdSignature {
        r: hex::encode(output.r),
        s: hex::encode(output.s),
        hex: hex::encode(&bytes),
        bytes,
    }
}

/// Verify a DER ECDSA signature over SHA-256(message) against a compressed
/// secp256k1 public key
pub fn verify_ecdsa(der: &[u8], message: &[u8], public_key: &[u8]) -> Result<bool, ConvertError> {
    if message.is_empty() {
        return Err(ConvertError::InvalidSignature("message is empty".to_string()));
    }
    let signature = k256::ecdsa::Signature::from_der(der)
        .map_err(|e| ConvertError::InvalidSignature(e.to_string()))?;
    let verifying_key = k256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|e| ConvertError::InvalidKey(e.to_string()))?;
    Ok(verifying_key.verify(message, &signature).is_ok())
}

/// Verify a 64-byte Ed25519 signature against a packed public key
pub fn verify_ed25519(
    signature: &[u8],
    message: &[u8],
    public_key: &[u8],
) -> Result<bool, ConvertError> {
    let signature: [u8; 64] = signature
        .try_into()
        .map_err(|_| ConvertError::InvalidSignature("signature must be 64 bytes".to_string()))?;
    let public_key: [u8; 32] = public_key
        .try_into()
        .map_err(|_| ConvertError::InvalidKey("public key must be 32 bytes".to_string()))?;

    let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&public_key)
        .map_err(|e| ConvertError::InvalidKey(e.to_string()))?;
    let signature = ed25519_dalek::Signature::from_bytes(&signature);
    Ok(verifying_key.verify(message, &signature).is_ok())
}

/// Left-pad arbitrary scalar bytes to 32
pub fn pad_scalar(src: &[u8]) -> [u8; 32] {
    let mut out = [0u8; 32];
    if src.len() >= 32 {
        out.copy_from_slice(&src[src.len() - 32..]);
    } else {
        out[32 - src.len()..].copy_from_slice(src);
    }
    out
}

/// SHA-256 digest of a message, the prehash every variant signs over
pub fn message_digest(message: &[u8]) -> [u8; 32] {
    Sha256::digest(message).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::signature::Signer;
    use k256::elliptic_curve::sec1::ToEncodedPoint;

    fn secp_test_point() -> ([u8; 32], [u8; 32], Vec<u8>) {
        // deterministic test key
        let sk = k256::ecdsa::SigningKey::from_bytes(&[0x42u8; 32].into()).unwrap();
        let point = sk.verifying_key().to_encoded_point(false);
        let x: [u8; 32] = point.x().unwrap().as_slice().try_into().unwrap();
        let y: [u8; 32] = point.y().unwrap().as_slice().try_into().unwrap();
        let compressed = sk.verifying_key().to_encoded_point(true).as_bytes().to_vec();
        (x, y, compressed)
    }

    #[test]
    fn test_compress_secp256k1_round_trip() {
        let (x, y, expected) = secp_test_point();
        let compressed = compress_secp256k1(&x, &y);
        assert_eq!(compressed.to_vec(), expected);

        // decodes to the same point under a standards-compliant parser
        let parsed = k256::ecdsa::VerifyingKey::from_sec1_bytes(&compressed).unwrap();
        let uncompressed = parsed.to_encoded_point(false);
        assert_eq!(uncompressed.x().unwrap().as_slice(), &x);
        assert_eq!(uncompressed.y().unwrap().as_slice(), &y);
    }

    #[test]
    fn test_pack_ed25519_round_trip() {
        let sk = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let canonical = sk.verifying_key().to_bytes();

        // unpack the dalek encoding into (y, sign) and repack with ours
        let x_is_odd = canonical[31] & 0x80 != 0;
        let mut y_le = canonical;
        y_le[31] &= 0x7f;
        let mut y_be = y_le;
        y_be.reverse();

        let packed = pack_ed25519(&y_be, x_is_odd);
        assert_eq!(packed, canonical);
        assert!(ed25519_dalek::VerifyingKey::from_bytes(&packed).is_ok());
    }

    #[test]
    fn test_der_accepted_by_compliant_verifier() {
        let sk = k256::ecdsa::SigningKey::from_bytes(&[0x42u8; 32].into()).unwrap();
        let message = b"threshold signing test vector";
        let signature: k256::ecdsa::Signature = sk.sign(message);
        let (r, s) = signature.split_bytes();

        let der = encode_der(
            &r.as_slice().try_into().unwrap(),
            &s.as_slice().try_into().unwrap(),
        );
        let compressed = sk.verifying_key().to_encoded_point(true);
        assert!(verify_ecdsa(&der, message, compressed.as_bytes()).unwrap());
    }

    #[test]
    fn test_der_high_bit_scalar_gets_sign_byte() {
        let mut r = [0u8; 32];
        r[0] = 0x80; // high bit set: INTEGER needs a leading zero byte
        let s = [0x01u8; 32];

        let der = encode_der(&r, &s);
        assert_eq!(der[0], 0x30);
        // first INTEGER is 33 bytes: 0x00 then the 32-byte scalar
        assert_eq!(der[2], 0x02);
        assert_eq!(der[3], 33);
        assert_eq!(der[4], 0x00);
        assert_eq!(der[5], 0x80);
        // parses under the strict DER parser
        assert!(k256::ecdsa::Signature::from_der(&der).is_ok());
    }

    #[test]
    fn test_der_strips_leading_zeros() {
        let mut r = [0u8; 32];
        r[31] = 0x05; // tiny scalar encodes as a single byte
        let mut s = [0u8; 32];
        s[31] = 0x07;

        let der = encode_der(&r, &s);
        assert_eq!(der, vec![0x30, 0x06, 0x02, 0x01, 0x05, 0x02, 0x01, 0x07]);
    }

    #[test]
    fn test_schnorr_round_trip() {
        let r = [0xAAu8; 32];
        let s = [0xBBu8; 32];
        let sig = schnorr_bytes(&r, &s);
        assert_eq!(&sig[..32], &r);
        assert_eq!(&sig[32..], &s);
    }

    #[test]
    fn test_ed25519_signature_verifies() {
        let sk = ed25519_dalek::SigningKey::from_bytes(&[9u8; 32]);
        let message = b"frost signing test vector";
        let signature = ed25519_dalek::Signer::sign(&sk, message).to_bytes();

        let output = SigningOutput {
            r: signature[..32].try_into().unwrap(),
            s: signature[32..].try_into().unwrap(),
        };
        let converted = signature_for(Curve::Ed25519, &output);
        assert_eq!(converted.bytes.len(), 64);
        assert!(verify_ed25519(
            &converted.bytes,
            message,
            &sk.verifying_key().to_bytes()
        )
        .unwrap());
    }

    #[test]
    fn test_pad_scalar() {
        assert_eq!(pad_scalar(&[1, 2])[30..], [1, 2]);
        assert_eq!(pad_scalar(&[0u8; 40])[..], [0u8; 32]);
    }
}
