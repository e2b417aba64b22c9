//! SCRAM-SHA-256 authentication (RFC 5802, RFC 7677).
//!
//! PostgreSQL ignores the SASL username (it authenticates the startup user)
//! and never offers channel binding to a plain TCP client, so the GS2 header
//! is always `n,,`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const MECHANISM: &str = "SCRAM-SHA-256";

/// GS2 header for "no channel binding", base64 encoded as sent in `c=`.
const GS2_HEADER: &str = "n,,";
const GS2_HEADER_B64: &str = "biws";

/// SCRAM authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScramError {
    #[error("server message is not valid UTF-8")]
    InvalidServerMessage,
    #[error("server-first-message is missing {0}")]
    MissingAttribute(&'static str),
    #[error("invalid salt encoding")]
    InvalidSalt,
    #[error("invalid iteration count")]
    InvalidIterations,
    #[error("server nonce does not extend the client nonce")]
    NonceMismatch,
    #[error("server-final-message carries error: {0}")]
    ServerRejected(String),
    #[error("invalid server signature")]
    InvalidServerSignature,
    #[error("server signature verification failed")]
    SignatureMismatch,
    #[error("message received out of order")]
    InvalidState,
}

enum State {
    /// client-first-message sent, waiting for server-first-message
    AwaitingServerFirst,
    /// client-final-message sent, waiting for server-final-message
    AwaitingServerFinal {
        salted_password: [u8; 32],
        auth_message: String,
    },
    Done,
}

/// SCRAM-SHA-256 client exchange.
pub struct ScramClient {
    password: String,
    client_first_bare: String,
    client_nonce: String,
    state: State,
}

impl ScramClient {
    pub fn new(username: &str, password: &str) -> Self {
        // 18 random bytes encode to a 24 character nonce
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, &BASE64.encode(nonce_bytes))
    }

    /// Start an exchange with a fixed client nonce.
    pub fn with_nonce(username: &str, password: &str, nonce: &str) -> Self {
        Self {
            password: password.to_string(),
            client_first_bare: format!("n={},r={}", escape_saslname(username), nonce),
            client_nonce: nonce.to_string(),
            state: State::AwaitingServerFirst,
        }
    }

    /// `n,,n=<user>,r=<client-nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        format!("{}{}", GS2_HEADER, self.client_first_bare).into_bytes()
    }

    /// Consume `r=<nonce>,s=<salt>,i=<iterations>` and produce the
    /// client-final-message carrying the proof.
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        if !matches!(self.state, State::AwaitingServerFirst) {
            return Err(ScramError::InvalidState);
        }
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in server_first.split(',') {
            if let Some(v) = part.strip_prefix("r=") {
                nonce = Some(v);
            } else if let Some(v) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(v).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(v) = part.strip_prefix("i=") {
                let n = v.parse::<u32>().map_err(|_| ScramError::InvalidIterations)?;
                if n == 0 {
                    return Err(ScramError::InvalidIterations);
                }
                iterations = Some(n);
            }
        }
        let nonce = nonce.ok_or(ScramError::MissingAttribute("nonce"))?;
        let salt = salt.ok_or(ScramError::MissingAttribute("salt"))?;
        let iterations = iterations.ok_or(ScramError::MissingAttribute("iteration count"))?;

        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(ScramError::NonceMismatch);
        }

        let salted_password = hi(self.password.as_bytes(), &salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let client_final_without_proof = format!("c={},r={}", GS2_HEADER_B64, nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(client_signature) {
            *p ^= s;
        }

        self.state = State::AwaitingServerFinal {
            salted_password,
            auth_message,
        };
        Ok(format!("{},p={}", client_final_without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check `v=<server-signature>`.
    pub fn verify_server_final(&mut self, server_msg: &[u8]) -> Result<(), ScramError> {
        let State::AwaitingServerFinal {
            salted_password,
            auth_message,
        } = &self.state
        else {
            return Err(ScramError::InvalidState);
        };
        let server_final =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(ScramError::ServerRejected(err.to_string()));
        }
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or(ScramError::InvalidServerSignature)?;
        let signature = BASE64
            .decode(verifier)
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;
        if signature != expected {
            return Err(ScramError::SignatureMismatch);
        }

        self.state = State::Done;
        Ok(())
    }
}

/// Hi() from RFC 5802: PBKDF2 with HMAC-SHA-256.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password, salt, iterations, &mut output)
        .map_err(|_| ScramError::InvalidState)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::InvalidState)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// `,` and `=` must be escaped in a saslname.
fn escape_saslname(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 7677 section 3
    const NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
    const CLIENT_FINAL: &str = "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=";
    const SERVER_FINAL: &str = "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=";

    #[test]
    fn test_rfc7677_exchange() {
        let mut client = ScramClient::with_nonce("user", "pencil", NONCE);
        assert_eq!(
            client.client_first_message(),
            b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO".to_vec()
        );

        let client_final = client.process_server_first(SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(String::from_utf8(client_final).unwrap(), CLIENT_FINAL);

        client.verify_server_final(SERVER_FINAL.as_bytes()).unwrap();
    }

    #[test]
    fn test_wrong_server_signature() {
        let mut client = ScramClient::with_nonce("user", "pencil", NONCE);
        client.process_server_first(SERVER_FIRST.as_bytes()).unwrap();
        let err = client
            .verify_server_final(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap_err();
        assert_eq!(err, ScramError::SignatureMismatch);
    }

    #[test]
    fn test_foreign_nonce_rejected() {
        let mut client = ScramClient::with_nonce("user", "pencil", NONCE);
        let err = client
            .process_server_first(b"r=somebodyelse,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
            .unwrap_err();
        assert_eq!(err, ScramError::NonceMismatch);
    }

    #[test]
    fn test_final_before_first_is_out_of_order() {
        let mut client = ScramClient::new("user", "pencil");
        assert_eq!(
            client.verify_server_final(SERVER_FINAL.as_bytes()),
            Err(ScramError::InvalidState)
        );
    }

    #[test]
    fn test_random_nonce_shape() {
        let client = ScramClient::new("user", "pencil");
        let first = String::from_utf8(client.client_first_message()).unwrap();
        let nonce = first.strip_prefix("n,,n=user,r=").unwrap();
        assert_eq!(nonce.len(), 24);
    }
}
