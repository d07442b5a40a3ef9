//! ttychat - LLM chat over a raw serial link to a real terminal.
//!
//! The crate drives a character-mode chat UI on a dumb 80x24 terminal
//! attached over a genuine serial line (or a PTY substitute). There is no
//! read-back channel to the device, so an in-memory screen model is the
//! single source of truth for what the terminal displays:
//!
//! - `channel`: raw byte channel to the device (the only syscall layer)
//! - `screen`: screen/cursor model and minimal-redraw diffing
//! - `pump`: single-writer output serializer with pacing and chunking
//! - `input`: keystroke reassembly running concurrently with the pump
//! - `coordinator`: per-turn state machine merging keystrokes and tokens
//! - `llm`, `prompt`, `retrieval`: the response-generation side
//! - `app`, `config`: session loop and startup configuration

pub mod ansi;
pub mod app;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod input;
pub mod llm;
pub mod prompt;
pub mod pump;
pub mod retrieval;
pub mod screen;

pub use channel::{ByteChannel, ChannelError, SerialChannel};
pub use config::Config;
pub use coordinator::{StreamCoordinator, TurnState};
pub use input::{ControlKey, InputEvent, InputReader};
pub use llm::{CancelToken, LlmClient, StreamError, TokenStream};
pub use pump::{OutputPump, PumpHandle, RenderRequest};
pub use screen::ScreenModel;
