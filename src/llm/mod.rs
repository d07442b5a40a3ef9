//! Boundary to the text-generation collaborator.
//!
//! The core treats the response side as an opaque producer of text
//! fragments: open a stream for a composed prompt, pull fragments until
//! the end marker, optionally cancel. Fragments are never parsed, only
//! appended to the screen.

pub mod openai;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::prompt::ComposedPrompt;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("text-generation service unavailable: {0}")]
    Unavailable(String),

    #[error("text-generation service rate limited")]
    RateLimited,

    #[error("malformed response stream: {0}")]
    Malformed(String),
}

/// Cooperative cancellation flag shared between the coordinator and an
/// open stream. The stream observes it at its next natural suspension
/// point; a read already blocked on the network finishes first.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// A lazy, finite sequence of response fragments.
pub trait TokenStream: Send {
    /// Pull the next fragment. `Ok(None)` is the explicit end-of-sequence
    /// marker; after cancellation the stream also reports `Ok(None)`.
    fn next_fragment(&mut self) -> Result<Option<String>, StreamError>;
}

/// The text-generation client the coordinator talks to.
pub trait LlmClient: Send + Sync {
    fn open_stream(
        &self,
        prompt: &ComposedPrompt,
        cancel: CancelToken,
    ) -> Result<Box<dyn TokenStream>, StreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_roundtrip() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        let shared = token.clone();
        shared.cancel();
        assert!(token.is_cancelled());
    }
}
