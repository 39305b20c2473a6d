//! SCRAM-SHA-256 client exchange (RFC 5802, RFC 7677).
//!
//! Channel binding is not offered, so the GS2 header is always `n,,`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::error::PgError;

type HmacSha256 = Hmac<Sha256>;

/// Mechanism name sent in SASLInitialResponse.
pub const MECHANISM: &str = "SCRAM-SHA-256";

/// Failures of the SCRAM exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("invalid server message")]
    InvalidServerMessage,
    #[error("invalid salt encoding")]
    InvalidSalt,
    #[error("invalid iteration count")]
    InvalidIterations,
    #[error("missing {0} in server message")]
    MissingAttribute(&'static str),
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("invalid server signature")]
    InvalidServerSignature,
    #[error("server signature verification failed")]
    ServerSignatureMismatch,
    #[error("server final message arrived before the challenge")]
    OutOfOrder,
    #[error("key derivation failed")]
    KeyDerivation,
}

impl From<ScramError> for PgError {
    fn from(e: ScramError) -> Self {
        PgError::Auth(format!("SCRAM: {}", e))
    }
}

/// Client side of one SCRAM-SHA-256 authentication.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    /// Known after the server challenge was answered.
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        // 18 random bytes encode to 24 base64 characters
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(username: &str, password: &str, client_nonce: String) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            auth_message: None,
            salted_password: None,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", self.username, self.client_nonce)
    }

    /// `n,,n=<user>,r=<client-nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Answer the server challenge `r=<nonce>,s=<salt>,i=<iterations>` with the
    /// client final message carrying the proof.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                let n = value
                    .parse::<u32>()
                    .map_err(|_| ScramError::InvalidIterations)?;
                if n == 0 {
                    return Err(ScramError::InvalidIterations);
                }
                iterations = Some(n);
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::MissingAttribute("nonce"))?;
        let salt = salt.ok_or(ScramError::MissingAttribute("salt"))?;
        let iterations = iterations.ok_or(ScramError::MissingAttribute("iteration count"))?;

        if !combined_nonce.starts_with(&self.client_nonce) || combined_nonce == self.client_nonce {
            return Err(ScramError::NonceMismatch);
        }

        let salted_password = hi(&self.password, &salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let client_final_without_proof = format!("c=biws,r={}", combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
            *p ^= s;
        }

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);

        Ok(format!("{},p={}", client_final_without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the server final message `v=<signature>`.
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_final =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let verifier = server_final
            .strip_prefix("v=")
            .ok_or(ScramError::InvalidServerSignature)?;
        let server_signature = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let salted_password = self.salted_password.ok_or(ScramError::OutOfOrder)?;
        let auth_message = self.auth_message.as_ref().ok_or(ScramError::OutOfOrder)?;

        let server_key = hmac_sha256(&salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if server_signature != expected {
            return Err(ScramError::ServerSignatureMismatch);
        }
        Ok(())
    }
}

impl std::fmt::Debug for ScramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScramClient")
            .field("username", &self.username)
            .field("client_nonce", &self.client_nonce)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi(): PBKDF2 with HMAC-SHA-256.
fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::KeyDerivation)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::KeyDerivation)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}
