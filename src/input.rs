//! Input reader: keystroke reassembly from the raw byte channel.
//!
//! Runs on its own thread, concurrently with the output pump, polling the
//! channel on a short interval so a shutdown request is always observed
//! within one poll. Raw bytes become logical events: printables echo-able
//! as-is, control bytes tagged, and escape sequences reassembled even when
//! the link delivers them split across reads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};

use crate::channel::{ByteChannel, ChannelError};

/// Poll interval; also the bound on shutdown latency and on how long a
/// lone ESC waits before being reported as a bare escape.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A recognized control keystroke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    /// CR (or LF) - submit the composed line.
    Enter,
    /// BS or DEL - erase the last composed character.
    Backspace,
    /// Ctrl-U - discard the composed line.
    KillLine,
    /// Ctrl-C - interrupt; also raises `CancelRequested`.
    Interrupt,
    /// Ctrl-L - repaint the screen.
    Refresh,
    /// A bare ESC with no sequence behind it.
    Escape,
    /// Cursor-key sequence (ESC [ A..D). Recognized but unused by the
    /// composing line.
    Arrow(ArrowKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrowKey {
    Up,
    Down,
    Right,
    Left,
}

/// One logical input event. Produced here, consumed by the coordinator;
/// ownership transfers on delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    /// Printable 7-bit byte in `0x20..=0x7E`.
    Printable(u8),
    Control(ControlKey),
    /// Raised by Ctrl-C; only meaningful while a response stream is open.
    CancelRequested,
}

/// Incremental byte-to-event decoder.
///
/// Escape sequences may arrive split across reads on a slow link, so the
/// decoder keeps partial sequence state between `push` calls. A lone ESC
/// is only reported once `flush_pending` says no continuation arrived.
#[derive(Debug, Default)]
pub struct Decoder {
    esc_buf: Vec<u8>,
    last_was_cr: bool,
}

impl Decoder {
    pub fn new() -> Self {
        Decoder::default()
    }

    /// Decode one raw byte into zero or more events.
    pub fn push(&mut self, byte: u8) -> Vec<InputEvent> {
        if !self.esc_buf.is_empty() {
            return self.push_escape(byte);
        }

        let was_cr = std::mem::replace(&mut self.last_was_cr, false);
        match byte {
            0x0d => {
                self.last_was_cr = true;
                vec![InputEvent::Control(ControlKey::Enter)]
            }
            // LF directly after CR is the tail of a CRLF pair.
            0x0a if was_cr => Vec::new(),
            0x0a => vec![InputEvent::Control(ControlKey::Enter)],
            0x08 | 0x7f => vec![InputEvent::Control(ControlKey::Backspace)],
            0x15 => vec![InputEvent::Control(ControlKey::KillLine)],
            0x03 => vec![
                InputEvent::Control(ControlKey::Interrupt),
                InputEvent::CancelRequested,
            ],
            0x0c => vec![InputEvent::Control(ControlKey::Refresh)],
            0x1b => {
                self.esc_buf.push(byte);
                Vec::new()
            }
            0x20..=0x7e => vec![InputEvent::Printable(byte)],
            other => {
                debug!("ignoring unrecognized input byte {other:#04x}");
                Vec::new()
            }
        }
    }

    /// Report a pending lone ESC once the link has gone quiet.
    pub fn flush_pending(&mut self) -> Option<InputEvent> {
        if self.esc_buf == [0x1b] {
            self.esc_buf.clear();
            return Some(InputEvent::Control(ControlKey::Escape));
        }
        None
    }

    fn push_escape(&mut self, byte: u8) -> Vec<InputEvent> {
        self.esc_buf.push(byte);
        match self.esc_buf.as_slice() {
            [0x1b, b'['] => Vec::new(),
            [0x1b, b'[', rest @ ..] => {
                let final_byte = *rest.last().unwrap_or(&0);
                // CSI parameters run until a final byte in 0x40..=0x7E.
                if (0x40..=0x7e).contains(&final_byte) {
                    let events = match final_byte {
                        b'A' => vec![InputEvent::Control(ControlKey::Arrow(ArrowKey::Up))],
                        b'B' => vec![InputEvent::Control(ControlKey::Arrow(ArrowKey::Down))],
                        b'C' => vec![InputEvent::Control(ControlKey::Arrow(ArrowKey::Right))],
                        b'D' => vec![InputEvent::Control(ControlKey::Arrow(ArrowKey::Left))],
                        other => {
                            debug!("ignoring unsupported escape sequence final {other:#04x}");
                            Vec::new()
                        }
                    };
                    self.esc_buf.clear();
                    events
                } else if self.esc_buf.len() > 16 {
                    debug!("discarding overlong escape sequence");
                    self.esc_buf.clear();
                    Vec::new()
                } else {
                    Vec::new()
                }
            }
            // ESC followed by anything but '[' is not a sequence we
            // recognize; report the escape and reconsider the byte.
            _ => {
                self.esc_buf.clear();
                let mut events = vec![InputEvent::Control(ControlKey::Escape)];
                events.extend(self.push(byte));
                events
            }
        }
    }
}

/// Owner of the reader thread.
pub struct InputReader {
    thread: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl InputReader {
    /// Start polling `channel` and delivering events to `tx`.
    pub fn spawn(channel: Arc<dyn ByteChannel>, tx: Sender<InputEvent>) -> InputReader {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let thread = thread::Builder::new()
            .name("input-reader".to_string())
            .spawn(move || read_loop(channel, tx, flag))
            .unwrap_or_else(|e| panic!("failed to spawn input reader: {e}"));
        InputReader { thread, shutdown }
    }

    /// Request the reader to stop and wait for it; returns within one
    /// poll interval.
    pub fn stop(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if self.thread.join().is_err() {
            error!("input reader thread panicked");
        }
    }
}

fn read_loop(channel: Arc<dyn ByteChannel>, tx: Sender<InputEvent>, shutdown: Arc<AtomicBool>) {
    let mut decoder = Decoder::new();
    while !shutdown.load(Ordering::SeqCst) {
        let bytes = match channel.read_available(POLL_INTERVAL) {
            Ok(bytes) => bytes,
            Err(ChannelError::Disconnected) | Err(ChannelError::Closed) => {
                info!("input channel closed, reader exiting");
                return;
            }
            Err(e) => {
                error!("input read failed: {e}");
                return;
            }
        };

        if bytes.is_empty() {
            // Quiet link: a buffered lone ESC was a real escape press.
            if let Some(event) = decoder.flush_pending() {
                if tx.send(event).is_err() {
                    return;
                }
            }
            continue;
        }

        for byte in bytes {
            for event in decoder.push(byte) {
                if tx.send(event).is_err() {
                    return;
                }
            }
        }
    }
}
