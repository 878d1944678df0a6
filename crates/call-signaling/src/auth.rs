//! Join tokens: `base64url(HMAC-SHA256(secret, userId))`.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use thiserror::Error;

use crate::envelope::UserId;

type HmacSha256 = Hmac<sha2::Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("join token missing")]
    Missing,
    #[error("join token is not valid base64")]
    Malformed,
    #[error("join token mac mismatch")]
    MacMismatch,
    #[error("invalid token secret")]
    InvalidSecret,
}

fn keyed(secret: &[u8], user: UserId) -> Result<HmacSha256, TokenError> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| TokenError::InvalidSecret)?;
    mac.update(user.to_string().as_bytes());
    Ok(mac)
}

pub fn mint_token(secret: &[u8], user: UserId) -> Result<String, TokenError> {
    let mac = keyed(secret, user)?;
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

/// Checks that `token` was minted for `user` with `secret`.
pub fn verify_token(secret: &[u8], user: UserId, token: Option<&str>) -> Result<(), TokenError> {
    let token = token.ok_or(TokenError::Missing)?;
    let raw = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|_| TokenError::Malformed)?;
    keyed(secret, user)?
        .verify_slice(&raw)
        .map_err(|_| TokenError::MacMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_token_verifies_for_same_user_only() {
        let token = mint_token(b"relay-secret", UserId(7)).expect("mint");
        assert!(verify_token(b"relay-secret", UserId(7), Some(&token)).is_ok());
        assert_eq!(
            verify_token(b"relay-secret", UserId(8), Some(&token)),
            Err(TokenError::MacMismatch)
        );
        assert_eq!(
            verify_token(b"other-secret", UserId(7), Some(&token)),
            Err(TokenError::MacMismatch)
        );
    }

    #[test]
    fn missing_or_garbled_tokens_fail() {
        assert_eq!(
            verify_token(b"s", UserId(1), None),
            Err(TokenError::Missing)
        );
        assert_eq!(
            verify_token(b"s", UserId(1), Some("not base64!")),
            Err(TokenError::Malformed)
        );
    }
}
