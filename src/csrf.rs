//! Anti-forgery tokens.
//!
//! A secret lives in an HttpOnly cookie; the paired token is handed to the
//! page and echoed back in the `x-csrf-token` header. Tokens are
//! `<salt>-<base64url(sha256(salt "-" secret))>`, so any number of tokens can
//! be minted from one secret and verified without server-side storage.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

pub const SECRET_COOKIE: &str = "csrfSecret";
pub const TOKEN_HEADER: &str = "x-csrf-token";

const SECRET_BYTES: usize = 18;
const SALT_BYTES: usize = 4;

#[derive(Debug, thiserror::Error)]
#[error("failed to gather randomness: {0}")]
pub struct EntropyError(String);

/// A freshly issued secret and a token bound to it.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub secret: String,
    pub token: String,
}

#[derive(Debug, Clone, Default)]
pub struct CsrfTokens;

impl CsrfTokens {
    pub fn new() -> Self {
        Self
    }

    pub fn issue(&self) -> Result<TokenPair, EntropyError> {
        let secret = self.secret()?;
        let token = self.create(&secret)?;
        Ok(TokenPair { secret, token })
    }

    pub fn secret(&self) -> Result<String, EntropyError> {
        let mut bytes = [0u8; SECRET_BYTES];
        getrandom::getrandom(&mut bytes).map_err(|e| EntropyError(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }

    pub fn create(&self, secret: &str) -> Result<String, EntropyError> {
        let mut bytes = [0u8; SALT_BYTES];
        getrandom::getrandom(&mut bytes).map_err(|e| EntropyError(e.to_string()))?;
        let salt = hex::encode(bytes);
        Ok(tokenize(&salt, secret))
    }

    pub fn verify(&self, secret: &str, token: &str) -> bool {
        if secret.is_empty() {
            return false;
        }
        let Some((salt, _)) = token.split_once('-') else {
            return false;
        };
        if salt.is_empty() {
            return false;
        }
        constant_time_eq(tokenize(salt, secret).as_bytes(), token.as_bytes())
    }
}

fn tokenize(salt: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b"-");
    hasher.update(secret.as_bytes());
    format!("{}-{}", salt, URL_SAFE_NO_PAD.encode(hasher.finalize()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Serialize the secret cookie.
pub fn secret_cookie(secret: &str, max_age_secs: u64, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
        SECRET_COOKIE, secret, max_age_secs
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Pull a named value out of a `Cookie` header.
pub fn parse_cookie(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key.trim() == name).then(|| value.trim().trim_matches('"').to_string())
    })
}
