//! ES256 key fixtures for testing
//!
//! Provides P-256 signing keys and the key set documents the IAP public key
//! endpoints serve: a `kid -> PEM` map (`public_key`) and a JWK Set
//! (`public_key-jwk`).

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING};
use serde::Serialize;

/// DER prefix of a P-256 SubjectPublicKeyInfo, followed by the 65-byte
/// uncompressed point:
/// SEQUENCE { SEQUENCE { OID ecPublicKey, OID prime256v1 }, BIT STRING }
const P256_SPKI_PREFIX: [u8; 26] = [
    0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x08,
    0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
];

/// An ES256 signing key with its key id.
pub struct TestSigningKey {
    kid: String,
    private_key_pkcs8: Vec<u8>,
    public_point: Vec<u8>,
}

impl TestSigningKey {
    /// Generate a fresh P-256 key pair.
    ///
    /// Two keys generated with the same `kid` are different keys, which is
    /// how tests model a forged assertion carrying a legitimate key id.
    pub fn generate(kid: &str) -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .expect("Failed to generate P-256 key");
        let key_pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .expect("Failed to parse generated P-256 key");

        Self {
            kid: kid.to_string(),
            private_key_pkcs8: pkcs8.as_ref().to_vec(),
            public_point: key_pair.public_key().as_ref().to_vec(),
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Public key as a PEM `PUBLIC KEY` (SubjectPublicKeyInfo) block.
    pub fn public_key_pem(&self) -> String {
        let mut der = P256_SPKI_PREFIX.to_vec();
        der.extend_from_slice(&self.public_point);

        let b64 = STANDARD.encode(der);
        let body: Vec<&str> = b64
            .as_bytes()
            .chunks(64)
            .map(|chunk| std::str::from_utf8(chunk).expect("base64 is ASCII"))
            .collect();

        format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            body.join("\n")
        )
    }

    /// Public key as an EC JWK.
    pub fn public_jwk(&self) -> serde_json::Value {
        serde_json::json!({
            "kty": "EC",
            "crv": "P-256",
            "alg": "ES256",
            "use": "sig",
            "kid": self.kid,
            "x": URL_SAFE_NO_PAD.encode(&self.public_point[1..33]),
            "y": URL_SAFE_NO_PAD.encode(&self.public_point[33..65]),
        })
    }

    /// Sign `claims` as an ES256 compact JWS with this key's `kid`.
    pub fn sign<T: Serialize>(&self, claims: &T) -> String {
        self.sign_with_header(claims, self.header())
    }

    /// Sign `claims` with a caller-supplied header.
    pub fn sign_with_header<T: Serialize>(&self, claims: &T, header: Header) -> String {
        let encoding_key = EncodingKey::from_ec_der(&self.private_key_pkcs8);
        encode(&header, claims, &encoding_key).expect("Failed to sign test assertion")
    }

    /// The header `sign` uses: ES256, JWT, this key's `kid`.
    pub fn header(&self) -> Header {
        let mut header = Header::new(Algorithm::ES256);
        header.typ = Some("JWT".to_string());
        header.kid = Some(self.kid.clone());
        header
    }
}

/// Key set in the `public_key` format: `{kid: PEM}`.
pub fn pem_key_set(keys: &[&TestSigningKey]) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = keys
        .iter()
        .map(|k| (k.kid().to_string(), serde_json::Value::String(k.public_key_pem())))
        .collect();
    serde_json::Value::Object(map)
}

/// Key set in the `public_key-jwk` format: `{"keys": [...]}`.
pub fn jwk_key_set(keys: &[&TestSigningKey]) -> serde_json::Value {
    serde_json::json!({
        "keys": keys.iter().map(|k| k.public_jwk()).collect::<Vec<_>>()
    })
}
