//! Proxy authentication.
//!
//! Two mechanisms are offered: a plain password exchange and SCRAM-SHA-256
//! (RFC 5802 / RFC 7677) carried in relay frames. With SCRAM the proxy
//! answers `Authenticate` with a challenge carrying the combined nonce, salt
//! and iteration count as separate fields; the client proves knowledge of the
//! password with `AuthProof` and checks the proxy's signature in `AuthOk`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::error::RelayError;

type HmacSha256 = Hmac<Sha256>;

/// Lowest iteration count accepted from a proxy.
const MIN_ITERATIONS: u32 = 1024;

/// SCRAM exchange failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("proxy nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("iteration count {0} is below the minimum")]
    WeakIterations(u32),
    #[error("empty salt")]
    EmptySalt,
    #[error("proxy signature verification failed")]
    BadServerSignature,
    #[error("challenge processed out of order")]
    InvalidState,
}

impl From<ScramError> for RelayError {
    fn from(e: ScramError) -> Self {
        RelayError::AuthFailed(e.to_string())
    }
}

/// Client half of one SCRAM-SHA-256 exchange.
pub struct ScramClient {
    user: String,
    password: String,
    client_nonce: String,
    /// Set once the challenge has been answered
    verifier: Option<ServerVerifier>,
}

struct ServerVerifier {
    salted_password: [u8; 32],
    auth_message: String,
}

impl ScramClient {
    pub fn new(user: &str, password: &str) -> Self {
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(user, password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(user: &str, password: &str, client_nonce: String) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
            client_nonce,
            verifier: None,
        }
    }

    /// `n,,n=<user>,r=<client-nonce>`
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", escape_name(&self.user), self.client_nonce)
    }

    /// Answer the challenge with the client-final message.
    pub fn respond(&mut self, nonce: &str, salt: &[u8], iterations: u32) -> Result<Vec<u8>, ScramError> {
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::NonceMismatch);
        }
        if iterations < MIN_ITERATIONS {
            return Err(ScramError::WeakIterations(iterations));
        }
        if salt.is_empty() {
            return Err(ScramError::EmptySalt);
        }

        let salted_password = hi(&self.password, salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);

        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first(nonce, salt, iterations),
            without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let proof = xor(&client_key, &client_signature);

        self.verifier = Some(ServerVerifier {
            salted_password,
            auth_message,
        });
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the raw server signature carried by `AuthOk`.
    pub fn verify(&self, server_signature: &[u8]) -> Result<(), ScramError> {
        let verifier = self.verifier.as_ref().ok_or(ScramError::InvalidState)?;
        let server_key = hmac_sha256(&verifier.salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, verifier.auth_message.as_bytes())?;
        if server_signature != expected.as_slice() {
            return Err(ScramError::BadServerSignature);
        }
        Ok(())
    }
}

/// The server-first message as it enters the auth message.
fn server_first(nonce: &str, salt: &[u8], iterations: u32) -> String {
    format!("r={},s={},i={}", nonce, BASE64.encode(salt), iterations)
}

/// RFC 5802 saslname escaping.
fn escape_name(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::InvalidState)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::InvalidState)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn xor(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}
