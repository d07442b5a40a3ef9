//! Output pump: the sole writer to the byte channel.
//!
//! Concurrent producers (keystroke echo, token streaming, session chrome)
//! submit render requests over a bounded queue. A single worker thread
//! applies them to the screen model strictly in submission order, then
//! synchronizes the device with the model: append requests emit verbatim
//! character-stream bytes, everything else is flushed as minimal diff
//! runs. Because every request goes through the model before any byte is
//! chosen, concurrent producers can never interleave partial writes on
//! the wire.
//!
//! Pacing: flushes are spaced at least one refresh interval apart, and a
//! large burst is chunked into fixed-size writes with the interval applied
//! between chunks, so a full redraw cannot saturate the link or flicker
//! the display. Short writes (flow control) retry the remainder with
//! backoff; no byte that entered a flush is ever dropped.

use std::sync::mpsc::{Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use thiserror::Error;

use crate::ansi;
use crate::channel::{ByteChannel, ChannelError};
use crate::screen::{Run, ScreenModel};

/// Bytes per paced write chunk.
const WRITE_CHUNK: usize = 512;

/// Pending-request bound; producers block when the pump falls this far
/// behind, which is the backpressure the link budget requires.
const QUEUE_DEPTH: usize = 64;

/// Backoff bounds for short-write retries.
const BACKOFF_MIN: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_millis(100);

/// Bytes sent after the final drain so the terminal is left on a fresh
/// line rather than mid-sequence.
const DISCONNECT: &[u8] = b"\r\n";

/// A unit of render work. Consumed exactly once, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderRequest {
    /// Blank the screen and home the cursor.
    FullClear,
    /// Write text at an absolute position, truncated at end of row.
    WriteAt {
        row: usize,
        col: usize,
        text: String,
    },
    /// Character-stream text at the cursor: wraps, scrolls, CR+LF
    /// discipline on every line advance.
    AppendAtCursor(String),
    /// Reposition the cursor, clamped to the grid.
    MoveCursor { row: usize, col: usize },
}

enum Command {
    Render(RenderRequest),
    /// Repaint the whole screen from the model, resynchronizing a device
    /// suspected of corruption or cleared by the operator's terminal.
    Repaint,
    Shutdown,
}

/// The pump worker exited (device error or shutdown); the session is over.
#[derive(Debug, Error)]
#[error("output pump is gone")]
pub struct PumpGone;

/// Cloneable submission side of the pump queue.
#[derive(Clone)]
pub struct PumpHandle {
    tx: SyncSender<Command>,
}

impl PumpHandle {
    /// Queue a render request, blocking if the pump is saturated.
    pub fn submit(&self, request: RenderRequest) -> Result<(), PumpGone> {
        self.tx
            .send(Command::Render(request))
            .map_err(|_| PumpGone)
    }

    /// Queue a full-screen repaint from the model.
    pub fn repaint(&self) -> Result<(), PumpGone> {
        self.tx.send(Command::Repaint).map_err(|_| PumpGone)
    }
}

/// Owner of the writer thread.
pub struct OutputPump {
    handle: PumpHandle,
    worker: JoinHandle<()>,
}

impl OutputPump {
    /// Start the writer thread over `channel` with the given refresh
    /// pacing interval.
    pub fn spawn(
        model: ScreenModel,
        channel: Arc<dyn ByteChannel>,
        refresh: Duration,
    ) -> OutputPump {
        let (tx, rx) = std::sync::mpsc::sync_channel(QUEUE_DEPTH);
        let worker = Worker {
            model,
            channel,
            rx,
            refresh,
            last_flush: None,
        };
        let thread = thread::Builder::new()
            .name("output-pump".to_string())
            .spawn(move || worker.run())
            .unwrap_or_else(|e| panic!("failed to spawn output pump: {e}"));
        OutputPump {
            handle: PumpHandle { tx },
            worker: thread,
        }
    }

    pub fn handle(&self) -> PumpHandle {
        self.handle.clone()
    }

    /// Drain pending requests, write the disconnect sequence and stop.
    pub fn shutdown(self) {
        let _ = self.handle.tx.send(Command::Shutdown);
        if self.worker.join().is_err() {
            error!("output pump worker panicked");
        }
    }
}

struct Worker {
    model: ScreenModel,
    channel: Arc<dyn ByteChannel>,
    rx: Receiver<Command>,
    refresh: Duration,
    last_flush: Option<Instant>,
}

impl Worker {
    fn run(mut self) {
        loop {
            let mut out = Vec::new();
            let mut shutdown = match self.rx.recv() {
                Ok(cmd) => self.handle(cmd, &mut out),
                Err(_) => break,
            };

            // Coalesce whatever has queued up behind the first command;
            // it all lands in the same model application and flush.
            while !shutdown {
                match self.rx.try_recv() {
                    Ok(cmd) => shutdown = self.handle(cmd, &mut out),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }

            self.flush_runs(&mut out);
            if self.transmit(&out).is_err() {
                return;
            }
            if shutdown {
                break;
            }
        }

        self.drain_and_disconnect();
    }

    /// Process one command; returns true when it asks for shutdown.
    fn handle(&mut self, command: Command, out: &mut Vec<u8>) -> bool {
        match command {
            Command::Render(req) => {
                self.apply(req, out);
                false
            }
            Command::Repaint => {
                out.extend(self.model.full_redraw());
                false
            }
            Command::Shutdown => true,
        }
    }

    /// Apply one request to the model, collecting any wire bytes the
    /// request emits directly.
    fn apply(&mut self, request: RenderRequest, out: &mut Vec<u8>) {
        match request {
            RenderRequest::FullClear => {
                self.model.clear();
                out.extend(self.model.full_redraw());
            }
            RenderRequest::WriteAt { row, col, text } => {
                self.model.write_at(row, col, &text);
            }
            RenderRequest::AppendAtCursor(text) => {
                out.extend(self.model.append_stream(&text));
            }
            RenderRequest::MoveCursor { row, col } => {
                // The closing cursor sync emits the actual move.
                let _ = self.model.move_cursor(row, col);
            }
        }
    }

    /// Emit the model's dirty runs and re-address the cursor.
    fn flush_runs(&mut self, out: &mut Vec<u8>) {
        for run in self.model.diff() {
            out.extend(ansi::cup(run.row, run.col));
            if self.erases_to_row_end(&run) {
                out.extend(ansi::clear_line());
            } else {
                out.extend(run.text.as_bytes());
            }
        }
        out.extend(self.model.sync_cursor());
    }

    /// True when a run is all blanks and nothing but blanks follows it on
    /// its row, so a clear-to-end-of-line replaces the span.
    fn erases_to_row_end(&self, run: &Run) -> bool {
        run.text.bytes().all(|b| b == b' ')
            && self.model.grid().line(run.row).trailing_blank_start() <= run.col
    }

    /// Paced, chunked, loss-free write of a whole flush.
    fn transmit(&mut self, bytes: &[u8]) -> Result<(), ChannelError> {
        if bytes.is_empty() {
            return Ok(());
        }
        for chunk in bytes.chunks(WRITE_CHUNK) {
            if let Some(last) = self.last_flush {
                let since = last.elapsed();
                if since < self.refresh {
                    thread::sleep(self.refresh - since);
                }
            }
            self.write_all(chunk)?;
            self.last_flush = Some(Instant::now());
        }
        Ok(())
    }

    /// Write every byte of `buf`, retrying short writes with backoff.
    fn write_all(&self, mut buf: &[u8]) -> Result<(), ChannelError> {
        let mut backoff = BACKOFF_MIN;
        while !buf.is_empty() {
            match self.channel.write(buf) {
                Ok(0) => {
                    trace!("flow control asserted, retrying in {:?}", backoff);
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
                Ok(n) => {
                    buf = &buf[n..];
                    backoff = BACKOFF_MIN;
                }
                Err(e) => {
                    error!("device write failed: {e}");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Final drain: apply whatever is still queued, flush it, and leave
    /// the terminal on a fresh line. Never stops mid-escape because every
    /// flush is written out whole.
    fn drain_and_disconnect(&mut self) {
        let mut out = Vec::new();
        while let Ok(cmd) = self.rx.try_recv() {
            let _ = self.handle(cmd, &mut out);
        }
        self.flush_runs(&mut out);
        out.extend_from_slice(DISCONNECT);
        if self.transmit(&out).is_ok() {
            debug!("output pump drained and disconnected");
        }
    }
}
