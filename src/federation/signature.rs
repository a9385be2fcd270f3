//! Envelope and request signatures
//!
//! The envelope is serialized to canonical JSON (sorted keys, no
//! whitespace) and signed with RSA-PSS over SHA-256, MGF1(SHA-256) and the
//! maximum salt length. The signature travels in the envelope as an
//! `RsaSignature2017` block. The exact bytes that were signed are the bytes
//! sent, minus that block.
//!
//! Requests can additionally carry a draft-cavage HTTP Signature:
//! https://docs.joinmastodon.org/spec/security/

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, SecondsFormat, Utc};
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pss, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::keys::SigningKey;
use crate::error::AppError;

pub const SIGNATURE_TYPE: &str = "RsaSignature2017";

const SHA256_LEN: usize = 32;

/// Headers signed when a recipient does not ask for a specific list
pub const DEFAULT_SIGNED_HEADERS: &str = "(request-target) host date digest";

/// Serialize `value` with object keys in lexicographic order and no whitespace.
pub fn canonical_json(value: &Value) -> Result<Vec<u8>, AppError> {
    let mut out = Vec::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), AppError> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push(b'{');
            for (index, (key, item)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(item, out)?;
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

/// `signature` block attached to a signed envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBlock {
    #[serde(rename = "type")]
    pub kind: String,
    /// Public key URL of the signing actor
    pub creator: String,
    pub created: String,
    #[serde(rename = "signatureValue")]
    pub signature_value: String,
}

/// An envelope ready to send
#[derive(Debug, Clone)]
pub struct SignedEnvelope {
    /// Canonical bytes of the envelope without its signature block
    pub signed_bytes: Vec<u8>,
    /// Canonical bytes of the envelope with its signature block; the request body
    pub body: Vec<u8>,
    pub signature: SignatureBlock,
}

/// Headers to add for a signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Signature header value
    pub signature: String,
    /// Date header value (RFC 2616)
    pub date: String,
    /// Digest header value
    pub digest: String,
}

/// Signs envelopes and requests for one actor
///
/// Holds the resolved key for the duration of a single publish.
#[derive(Debug)]
pub struct Signer {
    key_id: String,
    key: SigningKey,
}

impl Signer {
    /// # Arguments
    /// * `key_id` - Full URL to the public key (actor#main-key)
    /// * `key` - Resolved private key
    pub fn new(key_id: impl Into<String>, key: SigningKey) -> Self {
        Self {
            key_id: key_id.into(),
            key,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Sign an envelope.
    ///
    /// Any existing `signature` member is replaced.
    ///
    /// # Errors
    /// - `Serialization` if the envelope is not a JSON object
    /// - `Configuration` if the key cannot produce a signature
    pub fn sign(&self, envelope: &Value, created: DateTime<Utc>) -> Result<SignedEnvelope, AppError> {
        let mut document = envelope
            .as_object()
            .cloned()
            .ok_or_else(|| AppError::Serialization("Envelope must be a JSON object".to_string()))?;
        document.remove("signature");

        let signed_bytes = canonical_json(&Value::Object(document.clone()))?;
        let signature_value = self.sign_bytes(&signed_bytes)?;

        let signature = SignatureBlock {
            kind: SIGNATURE_TYPE.to_string(),
            creator: self.key_id.clone(),
            created: created.to_rfc3339_opts(SecondsFormat::Secs, true),
            signature_value,
        };
        document.insert("signature".to_string(), serde_json::to_value(&signature)?);
        let body = canonical_json(&Value::Object(document))?;

        tracing::debug!(
            key_id = %self.key_id,
            signed_len = signed_bytes.len(),
            "Signed envelope"
        );

        Ok(SignedEnvelope {
            signed_bytes,
            body,
            signature,
        })
    }

    /// Base64 RSA-PSS signature over `bytes`
    fn sign_bytes(&self, bytes: &[u8]) -> Result<String, AppError> {
        let private_key = self.key.private_key();
        let salt_len = max_pss_salt_len(private_key.n().bits() as usize)?;
        let hashed = Sha256::digest(bytes);

        let mut rng = rand::thread_rng();
        let signature = private_key
            .sign_with_rng(&mut rng, Pss::new_with_salt::<Sha256>(salt_len), &hashed)
            .map_err(|e| AppError::Configuration(format!("Signing failed: {}", e)))?;
        Ok(BASE64.encode(signature))
    }

    /// Build HTTP Signature headers for a POST of `body` to `url`.
    ///
    /// # Arguments
    /// * `url` - Full inbox URL
    /// * `body` - Request body (for digest)
    /// * `signed_headers` - Space separated header names; unknown names are skipped
    pub fn sign_request(
        &self,
        url: &str,
        body: &[u8],
        signed_headers: &str,
    ) -> Result<SignatureHeaders, AppError> {
        let parsed_url = url::Url::parse(url)
            .map_err(|e| AppError::Configuration(format!("Invalid inbox URL {}: {}", url, e)))?;
        let host = match (parsed_url.host_str(), parsed_url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(AppError::Configuration(format!(
                    "Missing host in inbox URL {}",
                    url
                )));
            }
        };
        let path_and_query = match parsed_url.query() {
            Some(q) => format!("{}?{}", parsed_url.path(), q),
            None => parsed_url.path().to_string(),
        };

        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        let digest = generate_digest(body);

        let mut signing_parts = Vec::new();
        let mut headers_list = Vec::new();
        for name in signed_headers.split_whitespace() {
            let name = name.trim_end_matches(')').to_ascii_lowercase();
            let name = if name == "(request-target" {
                "(request-target)".to_string()
            } else {
                name
            };
            let value = match name.as_str() {
                "(request-target)" => format!("post {}", path_and_query),
                "host" => host.clone(),
                "date" => date.clone(),
                "digest" => digest.clone(),
                "content-type" => super::delivery::ACTIVITY_CONTENT_TYPE.to_string(),
                "content-length" => body.len().to_string(),
                _ => continue,
            };
            if headers_list.contains(&name) {
                continue;
            }
            signing_parts.push(format!("{}: {}", name, value));
            headers_list.push(name);
        }

        if headers_list.is_empty() {
            return Err(AppError::Configuration(format!(
                "No signable headers in {:?}",
                signed_headers
            )));
        }

        use rsa::signature::{RandomizedSigner, SignatureEncoding};

        let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(self.key.private_key().clone());
        let mut rng = rand::thread_rng();
        let signature = signing_key.sign_with_rng(&mut rng, signing_parts.join("\n").as_bytes());

        let signature_header = format!(
            "keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            self.key_id,
            headers_list.join(" "),
            BASE64.encode(signature.to_bytes())
        );

        Ok(SignatureHeaders {
            signature: signature_header,
            date,
            digest,
        })
    }
}

/// Largest PSS salt for a modulus of `modulus_bits` with SHA-256
fn max_pss_salt_len(modulus_bits: usize) -> Result<usize, AppError> {
    let em_len = (modulus_bits.saturating_sub(1)).div_ceil(8);
    em_len
        .checked_sub(SHA256_LEN + 2)
        .filter(|len| *len > 0)
        .ok_or_else(|| AppError::Configuration("Signing key is too small".to_string()))
}

/// Verify a base64 signature over exactly `signed_bytes`.
pub fn verify_signed_bytes(
    signed_bytes: &[u8],
    signature_value: &str,
    public_key: &RsaPublicKey,
) -> Result<(), AppError> {
    let signature = BASE64
        .decode(signature_value)
        .map_err(|_| AppError::InvalidSignature)?;
    let salt_len = max_pss_salt_len(public_key.n().bits() as usize)?;
    let hashed = Sha256::digest(signed_bytes);

    public_key
        .verify(Pss::new_with_salt::<Sha256>(salt_len), &hashed, &signature)
        .map_err(|_| AppError::InvalidSignature)
}

/// Verify a received envelope body against the actor's public key.
///
/// The signature block is removed and the rest re-serialized canonically,
/// which reproduces the signed bytes for any envelope built here.
pub fn verify_envelope(body: &[u8], public_key_pem: &str) -> Result<(), AppError> {
    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::Configuration(format!("Invalid public key: {}", e)))?;

    let mut document: serde_json::Map<String, Value> =
        serde_json::from_slice(body).map_err(|_| AppError::InvalidSignature)?;
    let signature: SignatureBlock = document
        .remove("signature")
        .map(serde_json::from_value)
        .transpose()
        .map_err(|_| AppError::InvalidSignature)?
        .ok_or(AppError::InvalidSignature)?;

    if signature.kind != SIGNATURE_TYPE {
        return Err(AppError::InvalidSignature);
    }

    let signed_bytes = canonical_json(&Value::Object(document))?;
    verify_signed_bytes(&signed_bytes, &signature.signature_value, &public_key)
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let hash = Sha256::digest(body);
    format!("SHA-256={}", BASE64.encode(hash))
}
