//! ES256 signing key used by the fixture identity provider.
//!
//! Tokens are assembled by hand (`base64url(header).base64url(payload).base64url(sig)`)
//! so the fixture does not share a JWT implementation with the code under test.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use p256::ecdsa::{signature::Signer as _, Signature};
use serde::Serialize;
use serde_json::{json, Value};

pub struct SigningKey {
    kid: String,
    key: p256::ecdsa::SigningKey,
}

impl SigningKey {
    /// Generate a fresh P-256 key with the given key id
    pub fn generate(kid: impl Into<String>) -> Self {
        Self {
            kid: kid.into(),
            key: p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// The public half of the key as a JWK
    pub fn jwk(&self) -> Value {
        let point = self.key.verifying_key().to_encoded_point(false);
        let x = point.x().map(|x| URL_SAFE_NO_PAD.encode(x)).unwrap_or_default();
        let y = point.y().map(|y| URL_SAFE_NO_PAD.encode(y)).unwrap_or_default();

        json!({
            "kty": "EC",
            "crv": "P-256",
            "x": x,
            "y": y,
            "kid": self.kid,
            "alg": "ES256",
            "use": "sig"
        })
    }

    /// A JWKS document containing only this key
    pub fn jwks(&self) -> Value {
        json!({ "keys": [self.jwk()] })
    }

    /// Sign `claims` as a compact JWS using this key's id
    pub fn sign<T: Serialize>(&self, claims: &T) -> anyhow::Result<String> {
        self.sign_with_kid(claims, &self.kid)
    }

    /// Sign `claims` but advertise an arbitrary `kid` in the header
    pub fn sign_with_kid<T: Serialize>(&self, claims: &T, kid: &str) -> anyhow::Result<String> {
        let header = json!({ "alg": "ES256", "typ": "JWT", "kid": kid });

        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let message = format!("{}.{}", header_b64, payload_b64);

        let signature: Signature = self.key.sign(message.as_bytes());
        let signature_b64 = URL_SAFE_NO_PAD.encode(signature.to_bytes());

        Ok(format!("{}.{}", message, signature_b64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jwk_has_p256_coordinates() {
        let key = SigningKey::generate("test-key");
        let jwk = key.jwk();

        assert_eq!(jwk["kty"], "EC");
        assert_eq!(jwk["crv"], "P-256");
        assert_eq!(jwk["kid"], "test-key");
        // 32-byte coordinates encode to 43 base64url characters
        assert_eq!(jwk["x"].as_str().unwrap().len(), 43);
        assert_eq!(jwk["y"].as_str().unwrap().len(), 43);
    }

    #[test]
    fn test_sign_produces_three_segments() {
        let key = SigningKey::generate("test-key");
        let token = key.sign(&json!({ "sub": "someone" })).unwrap();

        let parts: Vec<&str> = token.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header: Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "ES256");
        assert_eq!(header["kid"], "test-key");

        // Raw r||s signature
        assert_eq!(URL_SAFE_NO_PAD.decode(parts[2]).unwrap().len(), 64);
    }
}
