//! Share-link tokens.
//!
//! A token is the JSON message list encoded as URL-safe base64 without
//! padding, so it can be placed in a query parameter as-is.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use thiserror::Error;

use crate::models::Message;

/// Longest token that will be handed out. Longer links break in browsers
/// and chat apps, so sharing is refused instead.
pub const MAX_TOKEN_LEN: usize = 20_000;

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("Conversation is too long to share ({size} characters, limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Share link is malformed: {0}")]
    Malformed(String),

    #[error("Could not encode conversation: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Encodes `messages` into a share token.
pub fn encode(messages: &[Message]) -> Result<String, ShareError> {
    let json = serde_json::to_vec(messages).map_err(ShareError::Encode)?;
    let token = URL_SAFE_NO_PAD.encode(json);
    if token.len() > MAX_TOKEN_LEN {
        return Err(ShareError::TooLarge { size: token.len(), limit: MAX_TOKEN_LEN });
    }
    Ok(token)
}

/// Decodes a share token back into the message list it was built from.
pub fn decode(token: &str) -> Result<Vec<Message>, ShareError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token.trim())
        .map_err(|e| ShareError::Malformed(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| ShareError::Malformed(e.to_string()))
}
