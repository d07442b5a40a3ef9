//! Prompt assembly.
//!
//! Pure data composition: the system instruction text, the selected
//! persona preset and any retrieval context are joined into one system
//! block, the user line rides alongside. The core supplies only the user
//! line; everything else is loaded from the data directory at startup.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::Deserialize;

const SYSTEM_PROMPT_FILE: &str = "system_prompt.txt";
const PRESETS_FILE: &str = "presets.toml";

/// The single composed prompt handed to the LLM client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    pub system: String,
    pub user: String,
}

#[derive(Debug, Deserialize)]
struct PresetEntry {
    prompt: String,
}

/// Loads and composes the non-user parts of a prompt.
#[derive(Debug, Default)]
pub struct PromptAssembler {
    system_prompt: String,
    presets: BTreeMap<String, String>,
    active: Option<String>,
}

impl PromptAssembler {
    /// Load the system prompt and presets from `data_dir`. Missing files
    /// are tolerated (empty prompt, no presets); unreadable ones are
    /// logged and skipped.
    pub fn load(data_dir: &Path, preferred_preset: Option<&str>) -> Self {
        let system_prompt = match fs::read_to_string(data_dir.join(SYSTEM_PROMPT_FILE)) {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                info!("no system prompt loaded: {e}");
                String::new()
            }
        };

        let presets = load_presets(&data_dir.join(PRESETS_FILE));
        let mut assembler = PromptAssembler {
            system_prompt,
            presets,
            active: None,
        };
        assembler.active = assembler.pick_preset(preferred_preset);
        assembler
    }

    /// Preset fallback order: requested name, then `default`, then the
    /// first preset alphabetically.
    fn pick_preset(&self, preferred: Option<&str>) -> Option<String> {
        if self.presets.is_empty() {
            return None;
        }
        if let Some(name) = preferred {
            if self.presets.contains_key(name) {
                return Some(name.to_string());
            }
            warn!("unknown preset {name:?}, falling back");
        }
        if self.presets.contains_key("default") {
            return Some("default".to_string());
        }
        self.presets.keys().next().cloned()
    }

    pub fn active_preset(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn preset_names(&self) -> Vec<&str> {
        self.presets.keys().map(String::as_str).collect()
    }

    /// Switch presets; returns false when the name is unknown.
    pub fn set_preset(&mut self, name: &str) -> bool {
        if self.presets.contains_key(name) {
            self.active = Some(name.to_string());
            true
        } else {
            false
        }
    }

    /// Compose the final prompt: system instruction, preset and
    /// retrieval context joined by blank lines, empty parts skipped.
    pub fn compose(&self, retrieval_context: &str, user_line: &str) -> ComposedPrompt {
        let preset_text = self
            .active
            .as_ref()
            .and_then(|name| self.presets.get(name))
            .map(String::as_str)
            .unwrap_or("");

        let system = [self.system_prompt.as_str(), preset_text, retrieval_context]
            .iter()
            .filter(|part| !part.is_empty())
            .copied()
            .collect::<Vec<_>>()
            .join("\n\n")
            .trim()
            .to_string();

        ComposedPrompt {
            system,
            user: user_line.to_string(),
        }
    }
}

fn load_presets(path: &Path) -> BTreeMap<String, String> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(_) => return BTreeMap::new(),
    };
    match toml::from_str::<BTreeMap<String, PresetEntry>>(&content) {
        Ok(entries) => entries
            .into_iter()
            .map(|(name, entry)| (name, entry.prompt.trim().to_string()))
            .collect(),
        Err(e) => {
            warn!("failed to parse {}: {e}", path.display());
            BTreeMap::new()
        }
    }
}
