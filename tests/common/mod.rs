//! Shared stubs for integration tests: an in-memory byte channel that
//! misbehaves like a real serial link (short writes, scripted keystrokes,
//! hangups) and a scriptable LLM client.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ttychat::channel::{ByteChannel, ChannelError};
use ttychat::llm::{CancelToken, LlmClient, StreamError, TokenStream};
use ttychat::prompt::ComposedPrompt;

/// A keystroke chunk delivered after an optional delay.
pub struct Keys {
    pub delay: Duration,
    pub bytes: Vec<u8>,
}

impl Keys {
    pub fn now(bytes: &[u8]) -> Keys {
        Keys {
            delay: Duration::ZERO,
            bytes: bytes.to_vec(),
        }
    }

    pub fn after_ms(ms: u64, bytes: &[u8]) -> Keys {
        Keys {
            delay: Duration::from_millis(ms),
            bytes: bytes.to_vec(),
        }
    }
}

/// In-memory channel: captures everything written, optionally in short
/// uneven chunks, and plays back scripted keystrokes.
pub struct WireChannel {
    written: Mutex<Vec<u8>>,
    write_sizes: Mutex<Option<std::iter::Cycle<std::vec::IntoIter<usize>>>>,
    keystrokes: Mutex<Vec<Keys>>,
}

impl WireChannel {
    pub fn new(keystrokes: Vec<Keys>) -> Arc<Self> {
        Arc::new(WireChannel {
            written: Mutex::new(Vec::new()),
            write_sizes: Mutex::new(None),
            keystrokes: Mutex::new(keystrokes),
        })
    }

    /// Accept writes only in the given cycling chunk sizes, like a link
    /// with flow control asserted.
    pub fn short_writes(keystrokes: Vec<Keys>, sizes: Vec<usize>) -> Arc<Self> {
        Arc::new(WireChannel {
            written: Mutex::new(Vec::new()),
            write_sizes: Mutex::new(Some(sizes.into_iter().cycle())),
            keystrokes: Mutex::new(keystrokes),
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
    }
}

impl ByteChannel for WireChannel {
    fn write(&self, buf: &[u8]) -> Result<usize, ChannelError> {
        let take = match self.write_sizes.lock().unwrap().as_mut() {
            Some(sizes) => sizes.next().unwrap_or(buf.len()).min(buf.len()),
            None => buf.len(),
        };
        self.written.lock().unwrap().extend_from_slice(&buf[..take]);
        Ok(take)
    }

    fn read_available(&self, timeout: Duration) -> Result<Vec<u8>, ChannelError> {
        let mut keystrokes = self.keystrokes.lock().unwrap();
        if keystrokes.is_empty() {
            drop(keystrokes);
            thread::sleep(timeout.min(Duration::from_millis(5)));
            return Ok(Vec::new());
        }
        let next = keystrokes.remove(0);
        drop(keystrokes);
        thread::sleep(next.delay);
        Ok(next.bytes)
    }

    fn close(&self) {}
}

/// LLM stub: each `open_stream` call consumes the next scripted turn.
/// A cheap `Clone` handle over shared state, so a clone can be boxed as
/// the client while the original is kept for post-run inspection.
#[derive(Clone)]
pub struct ScriptedLlm {
    turns: Arc<Mutex<Vec<Result<Vec<String>, StreamError>>>>,
    pub prompts_seen: Arc<Mutex<Vec<ComposedPrompt>>>,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<Result<Vec<String>, StreamError>>) -> ScriptedLlm {
        ScriptedLlm {
            turns: Arc::new(Mutex::new(turns)),
            prompts_seen: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

struct ScriptedStream {
    fragments: Vec<String>,
    cancel: CancelToken,
}

impl TokenStream for ScriptedStream {
    fn next_fragment(&mut self) -> Result<Option<String>, StreamError> {
        if self.cancel.is_cancelled() || self.fragments.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.fragments.remove(0)))
    }
}

impl LlmClient for ScriptedLlm {
    fn open_stream(
        &self,
        prompt: &ComposedPrompt,
        cancel: CancelToken,
    ) -> Result<Box<dyn TokenStream>, StreamError> {
        self.prompts_seen.lock().unwrap().push(prompt.clone());
        let mut turns = self.turns.lock().unwrap();
        if turns.is_empty() {
            return Ok(Box::new(ScriptedStream {
                fragments: Vec::new(),
                cancel,
            }));
        }
        match turns.remove(0) {
            Ok(fragments) => Ok(Box::new(ScriptedStream { fragments, cancel })),
            Err(e) => Err(e),
        }
    }
}
