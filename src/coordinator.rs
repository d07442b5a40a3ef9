//! Stream coordinator: the per-turn state machine.
//!
//! One chat turn walks `Idle -> ComposingInput -> AwaitingResponse ->
//! StreamingResponse -> {Completed, Cancelled, Failed} -> Idle`. The
//! coordinator owns the composing buffer (the target devices have no
//! cooked input mode, so line editing is modeled explicitly here) and is
//! the single consumer of input events. While a response stream is open
//! it watches for a cancel keystroke between fragment arrivals; the one
//! unbounded wait in the system is the network read, which a dedicated
//! thread per turn keeps off the event path.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::input::{ControlKey, InputEvent};
use crate::llm::{CancelToken, LlmClient, StreamError, TokenStream};
use crate::prompt::ComposedPrompt;
use crate::pump::{PumpGone, PumpHandle, RenderRequest};

/// Prompt shown at the start of every composed line.
const PROMPT: &str = "> ";
/// Prefix written when the first response fragment arrives.
const RESPONSE_PREFIX: &str = "AI: ";
/// Marker appended when the operator cancels mid-response.
const CANCEL_MARKER: &str = " [cancelled]";
/// Composing-buffer cap; far beyond it the echo has wrapped several rows.
const MAX_LINE: usize = 512;
/// How long the turn loop waits on the fragment channel before checking
/// the keyboard again; bounds cancellation latency.
const FRAGMENT_POLL: Duration = Duration::from_millis(15);

/// States of one chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    ComposingInput,
    AwaitingResponse,
    StreamingResponse,
    Completed,
    Cancelled,
    Failed,
}

/// Result of collecting one line from the operator.
#[derive(Debug, PartialEq, Eq)]
pub enum ComposeOutcome {
    /// A non-empty line was submitted with Enter.
    Line(String),
    /// The input side went away; the session is over.
    InputClosed,
}

enum StreamMsg {
    Fragment(String),
    End,
    Failed(StreamError),
}

pub struct StreamCoordinator {
    pump: PumpHandle,
    events: Receiver<InputEvent>,
    state: TurnState,
    buffer: String,
    /// Type-ahead collected while a stream was open; replayed (and only
    /// then echoed) once composing resumes.
    pending: VecDeque<InputEvent>,
}

impl StreamCoordinator {
    pub fn new(pump: PumpHandle, events: Receiver<InputEvent>) -> Self {
        StreamCoordinator {
            pump,
            events,
            state: TurnState::Idle,
            buffer: String::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    fn append(&self, text: impl Into<String>) -> Result<(), PumpGone> {
        self.pump
            .submit(RenderRequest::AppendAtCursor(text.into()))
    }

    /// Show the prompt and collect one line, echoing and line-editing as
    /// bytes arrive. Blocks until Enter on a non-empty line or until the
    /// input side disappears.
    pub fn compose_line(&mut self) -> Result<ComposeOutcome, PumpGone> {
        self.state = TurnState::Idle;
        self.buffer.clear();
        self.append(PROMPT)?;

        loop {
            let event = match self.pending.pop_front() {
                Some(event) => event,
                None => match self.events.recv() {
                    Ok(event) => event,
                    Err(_) => return Ok(ComposeOutcome::InputClosed),
                },
            };
            match event {
                InputEvent::Printable(byte) => {
                    if self.buffer.len() >= MAX_LINE {
                        debug!("composing buffer full, dropping input");
                        continue;
                    }
                    self.buffer.push(byte as char);
                    self.append((byte as char).to_string())?;
                    self.state = TurnState::ComposingInput;
                }
                InputEvent::Control(ControlKey::Enter) => {
                    self.append("\r\n")?;
                    let line = self.buffer.trim().to_string();
                    self.buffer.clear();
                    if line.is_empty() {
                        self.state = TurnState::Idle;
                        self.append(PROMPT)?;
                    } else {
                        return Ok(ComposeOutcome::Line(line));
                    }
                }
                InputEvent::Control(ControlKey::Backspace) => {
                    if self.buffer.pop().is_some() {
                        self.append("\x08 \x08")?;
                    }
                }
                InputEvent::Control(ControlKey::KillLine) => {
                    let erased = self.buffer.len();
                    self.buffer.clear();
                    self.append("\x08 \x08".repeat(erased))?;
                }
                InputEvent::Control(ControlKey::Refresh) => {
                    self.pump.repaint()?;
                }
                // Cancellation only has effect while a stream is open; a
                // cancel queued behind a completed turn lands here and is
                // a no-op.
                InputEvent::CancelRequested => {
                    debug!("cancel with no open stream, ignoring");
                }
                InputEvent::Control(key) => {
                    debug!("ignoring {key:?} while composing");
                }
            }
        }
    }

    /// Run the response side of a turn for an already-composed prompt.
    /// Returns the terminal state the turn reached.
    pub fn run_turn(
        &mut self,
        client: &dyn LlmClient,
        prompt: &ComposedPrompt,
    ) -> Result<TurnState, PumpGone> {
        self.state = TurnState::AwaitingResponse;
        let started = Instant::now();
        let cancel = CancelToken::new();

        let stream = match client.open_stream(prompt, cancel.clone()) {
            Ok(stream) => stream,
            Err(e) => return self.fail_turn(e),
        };

        let fragments = spawn_stream_reader(stream);
        let mut prefix_written = false;

        loop {
            // Keyboard first: cancellation must win over a pending
            // fragment.
            match self.drain_input() {
                InputAction::Cancel => {
                    cancel.cancel();
                    return self.finish_cancelled(prefix_written);
                }
                InputAction::Closed => {
                    cancel.cancel();
                    self.state = TurnState::Cancelled;
                    return Ok(TurnState::Cancelled);
                }
                InputAction::None => {}
            }

            match fragments.recv_timeout(FRAGMENT_POLL) {
                Ok(StreamMsg::Fragment(text)) => {
                    if !prefix_written {
                        self.append(RESPONSE_PREFIX)?;
                        prefix_written = true;
                        self.state = TurnState::StreamingResponse;
                    }
                    self.append(text)?;
                }
                Ok(StreamMsg::End) => {
                    if !prefix_written {
                        self.append(RESPONSE_PREFIX)?;
                    }
                    self.append("\r\n\r\n")?;
                    self.state = TurnState::Completed;
                    info!("turn completed in {} ms", started.elapsed().as_millis());
                    return Ok(TurnState::Completed);
                }
                Ok(StreamMsg::Failed(e)) => return self.fail_turn(e),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return self.fail_turn(StreamError::Malformed(
                        "stream worker vanished".to_string(),
                    ));
                }
            }
        }
    }

    fn drain_input(&mut self) -> InputAction {
        loop {
            match self.events.try_recv() {
                Ok(InputEvent::CancelRequested) => return InputAction::Cancel,
                Ok(event) => {
                    // Echoing mid-response would corrupt the display;
                    // hold the keystroke until composing resumes.
                    debug!("buffering {event:?} until the stream closes");
                    self.pending.push_back(event);
                }
                Err(TryRecvError::Empty) => return InputAction::None,
                Err(TryRecvError::Disconnected) => return InputAction::Closed,
            }
        }
    }

    /// Leave whatever partial fragment is on screen, mark the
    /// cancellation and end the turn. Late fragments die with the
    /// dropped receiver.
    fn finish_cancelled(&mut self, prefix_written: bool) -> Result<TurnState, PumpGone> {
        info!("turn cancelled by operator");
        if prefix_written {
            self.append(format!("{CANCEL_MARKER}\r\n\r\n"))?;
        } else {
            self.append(format!("{}{}\r\n\r\n", RESPONSE_PREFIX, CANCEL_MARKER.trim()))?;
        }
        self.state = TurnState::Cancelled;
        Ok(TurnState::Cancelled)
    }

    fn fail_turn(&mut self, error: StreamError) -> Result<TurnState, PumpGone> {
        error!("turn failed: {error}");
        let lead = if self.state == TurnState::StreamingResponse {
            "\r\n"
        } else {
            ""
        };
        self.append(format!("{lead}ERR: {error}\r\n\r\n"))?;
        self.state = TurnState::Failed;
        Ok(TurnState::Failed)
    }
}

enum InputAction {
    None,
    Cancel,
    Closed,
}

/// Move the blocking fragment pulls onto their own thread; the turn loop
/// stays responsive to the keyboard. The thread exits as soon as a send
/// fails (receiver dropped on cancel) or the stream ends either way.
fn spawn_stream_reader(mut stream: Box<dyn TokenStream>) -> Receiver<StreamMsg> {
    let (tx, rx): (Sender<StreamMsg>, Receiver<StreamMsg>) = std::sync::mpsc::channel();
    let spawned = thread::Builder::new()
        .name("stream-reader".to_string())
        .spawn(move || loop {
            match stream.next_fragment() {
                Ok(Some(text)) => {
                    if tx.send(StreamMsg::Fragment(text)).is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    let _ = tx.send(StreamMsg::End);
                    return;
                }
                Err(e) => {
                    let _ = tx.send(StreamMsg::Failed(e));
                    return;
                }
            }
        });
    if let Err(e) = spawned {
        warn!("failed to spawn stream reader: {e}");
    }
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ByteChannel, ChannelError};
    use crate::pump::OutputPump;
    use crate::screen::ScreenModel;
    use std::sync::mpsc;
    use std::sync::{Arc, Mutex};

    /// Captures everything the pump writes.
    struct CaptureChannel {
        written: Mutex<Vec<u8>>,
    }

    impl CaptureChannel {
        fn new() -> Arc<Self> {
            Arc::new(CaptureChannel {
                written: Mutex::new(Vec::new()),
            })
        }

        fn text(&self) -> String {
            String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
        }
    }

    impl ByteChannel for CaptureChannel {
        fn write(&self, buf: &[u8]) -> Result<usize, ChannelError> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn read_available(&self, _timeout: Duration) -> Result<Vec<u8>, ChannelError> {
            Ok(Vec::new())
        }

        fn close(&self) {}
    }

    /// LLM stub replaying a script of results.
    struct ScriptedClient {
        script: Mutex<Vec<Result<Option<String>, StreamError>>>,
    }

    impl ScriptedClient {
        fn with(script: Vec<Result<Option<String>, StreamError>>) -> Self {
            ScriptedClient {
                script: Mutex::new(script),
            }
        }
    }

    struct ScriptedStream {
        script: Vec<Result<Option<String>, StreamError>>,
        cancel: CancelToken,
    }

    impl TokenStream for ScriptedStream {
        fn next_fragment(&mut self) -> Result<Option<String>, StreamError> {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            if self.script.is_empty() {
                // Block like a network read until cancelled.
                while !self.cancel.is_cancelled() {
                    thread::sleep(Duration::from_millis(2));
                }
                return Ok(None);
            }
            self.script.remove(0)
        }
    }

    impl LlmClient for ScriptedClient {
        fn open_stream(
            &self,
            _prompt: &ComposedPrompt,
            cancel: CancelToken,
        ) -> Result<Box<dyn TokenStream>, StreamError> {
            Ok(Box::new(ScriptedStream {
                script: std::mem::take(&mut *self.script.lock().unwrap()),
                cancel,
            }))
        }
    }

    struct Fixture {
        channel: Arc<CaptureChannel>,
        pump: OutputPump,
        coordinator: StreamCoordinator,
        events: mpsc::Sender<InputEvent>,
    }

    fn fixture() -> Fixture {
        let channel = CaptureChannel::new();
        let pump = OutputPump::spawn(
            ScreenModel::new(24, 80),
            channel.clone(),
            Duration::from_millis(1),
        );
        let (events, rx) = mpsc::channel();
        let coordinator = StreamCoordinator::new(pump.handle(), rx);
        Fixture {
            channel,
            pump,
            coordinator,
            events,
        }
    }

    fn type_line(events: &mpsc::Sender<InputEvent>, line: &str) {
        for b in line.bytes() {
            events.send(InputEvent::Printable(b)).unwrap();
        }
        events
            .send(InputEvent::Control(ControlKey::Enter))
            .unwrap();
    }

    fn prompt() -> ComposedPrompt {
        ComposedPrompt {
            system: String::new(),
            user: "hi".to_string(),
        }
    }

    #[test]
    fn test_compose_line_echoes_and_returns() {
        let mut fx = fixture();
        type_line(&fx.events, "hello");

        let outcome = fx.coordinator.compose_line().unwrap();
        assert_eq!(outcome, ComposeOutcome::Line("hello".to_string()));
        assert_eq!(fx.coordinator.state(), TurnState::ComposingInput);

        drop(fx.coordinator);
        fx.pump.shutdown();
        assert!(fx.channel.text().contains("> hello\r\n"));
    }

    #[test]
    fn test_compose_line_backspace_edits() {
        let mut fx = fixture();
        for b in b"hix" {
            fx.events.send(InputEvent::Printable(*b)).unwrap();
        }
        fx.events
            .send(InputEvent::Control(ControlKey::Backspace))
            .unwrap();
        fx.events
            .send(InputEvent::Control(ControlKey::Enter))
            .unwrap();

        let outcome = fx.coordinator.compose_line().unwrap();
        assert_eq!(outcome, ComposeOutcome::Line("hi".to_string()));

        drop(fx.coordinator);
        fx.pump.shutdown();
        assert!(fx.channel.text().contains("\x08 \x08"));
    }

    #[test]
    fn test_compose_line_kill_line() {
        let mut fx = fixture();
        for b in b"abc" {
            fx.events.send(InputEvent::Printable(*b)).unwrap();
        }
        fx.events
            .send(InputEvent::Control(ControlKey::KillLine))
            .unwrap();
        type_line(&fx.events, "ok");

        let outcome = fx.coordinator.compose_line().unwrap();
        assert_eq!(outcome, ComposeOutcome::Line("ok".to_string()));
    }

    #[test]
    fn test_compose_line_skips_empty_lines() {
        let mut fx = fixture();
        fx.events
            .send(InputEvent::Control(ControlKey::Enter))
            .unwrap();
        type_line(&fx.events, "real");

        let outcome = fx.coordinator.compose_line().unwrap();
        assert_eq!(outcome, ComposeOutcome::Line("real".to_string()));

        drop(fx.coordinator);
        fx.pump.shutdown();
        // Prompt reprinted after the empty submission.
        assert_eq!(fx.channel.text().matches("> ").count(), 2);
    }

    #[test]
    fn test_compose_line_input_closed() {
        let mut fx = fixture();
        drop(fx.events);
        assert_eq!(
            fx.coordinator.compose_line().unwrap(),
            ComposeOutcome::InputClosed
        );
    }

    #[test]
    fn test_turn_streams_fragments_to_completion() {
        let mut fx = fixture();
        let client = ScriptedClient::with(vec![
            Ok(Some("Hel".to_string())),
            Ok(Some("lo".to_string())),
            Ok(None),
        ]);

        let state = fx.coordinator.run_turn(&client, &prompt()).unwrap();
        assert_eq!(state, TurnState::Completed);

        drop(fx.coordinator);
        fx.pump.shutdown();
        assert!(fx.channel.text().contains("AI: Hello\r\n"));
    }

    #[test]
    fn test_turn_failure_is_visible_and_nonfatal() {
        let mut fx = fixture();
        let client = ScriptedClient::with(vec![Err(StreamError::Unavailable(
            "connection refused".to_string(),
        ))]);

        let state = fx.coordinator.run_turn(&client, &prompt()).unwrap();
        assert_eq!(state, TurnState::Failed);

        drop(fx.coordinator);
        fx.pump.shutdown();
        assert!(fx.channel.text().contains("ERR: "));
    }

    #[test]
    fn test_cancel_mid_stream_leaves_partial_and_marks() {
        let mut fx = fixture();
        // One fragment, then the stream blocks until cancelled.
        let client = ScriptedClient::with(vec![Ok(Some("partial wo".to_string()))]);

        let events = fx.events.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(60));
            let _ = events.send(InputEvent::CancelRequested);
        });

        let state = fx.coordinator.run_turn(&client, &prompt()).unwrap();
        canceller.join().unwrap();
        assert_eq!(state, TurnState::Cancelled);

        drop(fx.coordinator);
        fx.pump.shutdown();
        let text = fx.channel.text();
        assert!(text.contains("partial wo"));
        assert!(text.contains("[cancelled]"));
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let mut fx = fixture();
        let client =
            ScriptedClient::with(vec![Ok(Some("done".to_string())), Ok(None)]);

        let state = fx.coordinator.run_turn(&client, &prompt()).unwrap();
        assert_eq!(state, TurnState::Completed);

        // The cancel was queued behind the completed turn; composing the
        // next line swallows it without output or state damage.
        fx.events.send(InputEvent::CancelRequested).unwrap();
        type_line(&fx.events, "next");
        let outcome = fx.coordinator.compose_line().unwrap();
        assert_eq!(outcome, ComposeOutcome::Line("next".to_string()));

        drop(fx.coordinator);
        fx.pump.shutdown();
        assert!(!fx.channel.text().contains("[cancelled]"));
    }

    #[test]
    fn test_type_ahead_survives_an_open_stream() {
        let mut fx = fixture();
        let client =
            ScriptedClient::with(vec![Ok(Some("reply".to_string())), Ok(None)]);

        // The next line is typed while the stream is still open; it must
        // not echo mid-response, but it must not be lost either.
        type_line(&fx.events, "follow-up");
        let state = fx.coordinator.run_turn(&client, &prompt()).unwrap();
        assert_eq!(state, TurnState::Completed);

        let outcome = fx.coordinator.compose_line().unwrap();
        assert_eq!(outcome, ComposeOutcome::Line("follow-up".to_string()));

        drop(fx.coordinator);
        fx.pump.shutdown();
        // The buffered keystrokes echoed after the response, not inside it.
        let text = fx.channel.text();
        assert!(text.contains("AI: reply\r\n\r\n> follow-up"));
    }

    #[test]
    fn test_cancel_before_first_fragment() {
        let mut fx = fixture();
        // Stream never yields; blocks until cancelled.
        let client = ScriptedClient::with(vec![]);
        fx.events.send(InputEvent::CancelRequested).unwrap();

        let state = fx.coordinator.run_turn(&client, &prompt()).unwrap();
        assert_eq!(state, TurnState::Cancelled);

        drop(fx.coordinator);
        fx.pump.shutdown();
        assert!(fx.channel.text().contains("[cancelled]"));
    }
}
