//! Chat session: wiring and the command loop.
//!
//! Owns the pump, the input reader and the coordinator, and drives the
//! line-oriented session on top of them: greeting banner, slash commands,
//! and one response turn per submitted line. Stream failures end the turn
//! visibly and the loop continues; only a dead device or closed input
//! ends the session.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::channel::ByteChannel;
use crate::config::Config;
use crate::coordinator::{ComposeOutcome, StreamCoordinator};
use crate::input::InputReader;
use crate::llm::LlmClient;
use crate::prompt::PromptAssembler;
use crate::pump::{OutputPump, PumpGone, PumpHandle, RenderRequest};
use crate::retrieval::KnowledgeBase;
use crate::screen::ScreenModel;

pub struct ChatSession {
    channel: Arc<dyn ByteChannel>,
    pump: OutputPump,
    handle: PumpHandle,
    reader: InputReader,
    coordinator: StreamCoordinator,
    assembler: PromptAssembler,
    kb: KnowledgeBase,
    client: Box<dyn LlmClient>,
    model_name: String,
    show_context: bool,
}

impl ChatSession {
    pub fn new(
        config: &Config,
        channel: Arc<dyn ByteChannel>,
        client: Box<dyn LlmClient>,
    ) -> Self {
        let model = ScreenModel::new(config.rows, config.cols);
        let pump = OutputPump::spawn(
            model,
            channel.clone(),
            Duration::from_millis(config.refresh_ms),
        );
        let handle = pump.handle();

        let (events_tx, events_rx) = mpsc::channel();
        let reader = InputReader::spawn(channel.clone(), events_tx);
        let coordinator = StreamCoordinator::new(pump.handle(), events_rx);

        let assembler = PromptAssembler::load(&config.data_dir, config.preset.as_deref());
        let kb = KnowledgeBase::load(&config.data_dir);

        ChatSession {
            channel,
            pump,
            handle,
            reader,
            coordinator,
            assembler,
            kb,
            client,
            model_name: config.model.clone(),
            show_context: true,
        }
    }

    fn say(&self, text: impl Into<String>) -> Result<(), PumpGone> {
        self.handle
            .submit(RenderRequest::AppendAtCursor(text.into()))
    }

    fn sys(&self, line: &str) -> Result<(), PumpGone> {
        self.say(format!("SYS: {line}\r\n\r\n"))
    }

    fn banner(&self) -> Result<(), PumpGone> {
        self.handle.submit(RenderRequest::FullClear)?;
        let preset = self.assembler.active_preset().unwrap_or("(none)");
        self.say(format!(
            "SYS: ready | model: {} | preset: {preset}\r\n",
            self.model_name
        ))?;
        self.sys("type /help for commands")
    }

    /// Run the session until /quit, closed input or a dead device, then
    /// shut everything down in order.
    pub fn run(mut self) {
        if self.banner().is_err() {
            self.shutdown();
            return;
        }

        loop {
            match self.coordinator.compose_line() {
                Ok(ComposeOutcome::Line(line)) => {
                    let keep_going = if line.starts_with('/') {
                        self.handle_command(&line)
                    } else {
                        self.run_chat_turn(&line)
                    };
                    match keep_going {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(PumpGone) => break,
                    }
                }
                Ok(ComposeOutcome::InputClosed) => {
                    info!("input closed, ending session");
                    break;
                }
                Err(PumpGone) => break,
            }
        }

        self.shutdown();
    }

    /// Handle a slash command; returns false when the session should end.
    fn handle_command(&mut self, line: &str) -> Result<bool, PumpGone> {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default();
        let argument = parts.next();

        match command {
            "/q" | "/quit" => {
                self.sys("bye")?;
                return Ok(false);
            }
            "/clear" => {
                self.handle.submit(RenderRequest::FullClear)?;
                self.sys("cleared")?;
            }
            "/help" => {
                self.sys("commands: /help /clear /quit /preset [name] /ctx")?;
            }
            "/preset" => match argument {
                None => {
                    let names = self.assembler.preset_names();
                    if names.is_empty() {
                        self.sys("presets: (none)")?;
                    } else {
                        self.sys(&format!("presets: {}", names.join(", ")))?;
                    }
                }
                Some(name) => {
                    if self.assembler.set_preset(name) {
                        self.sys(&format!("preset set to {name}"))?;
                    } else {
                        self.sys(&format!("unknown preset: {name}"))?;
                    }
                }
            },
            "/ctx" => {
                self.show_context = !self.show_context;
                let state = if self.show_context { "on" } else { "off" };
                self.sys(&format!("retrieval context {state}"))?;
            }
            other => {
                self.sys(&format!("unknown command: {other}"))?;
            }
        }
        Ok(true)
    }

    /// One full chat turn for a submitted line.
    fn run_chat_turn(&mut self, line: &str) -> Result<bool, PumpGone> {
        let matches = self.kb.find_matches(line);
        if !matches.is_empty() {
            debug!(
                "retrieval matched: {}",
                matches
                    .iter()
                    .map(|(key, _)| *key)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        let context = if self.show_context {
            KnowledgeBase::format_context(&matches)
        } else {
            String::new()
        };

        let prompt = self.assembler.compose(&context, line);
        let state = self.coordinator.run_turn(self.client.as_ref(), &prompt)?;
        debug!("turn ended in state {state:?}");
        Ok(true)
    }

    fn shutdown(self) {
        // Reader first so no more events arrive, then drain the pump,
        // then release the device.
        self.reader.stop();
        drop(self.coordinator);
        self.pump.shutdown();
        self.channel.close();
        info!("session closed");
    }
}
