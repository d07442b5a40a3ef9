//! Keyword knowledge base lookup.
//!
//! A flat TOML file maps keywords to short blurbs. Any keyword appearing
//! (case-insensitively) inside the user line contributes its blurb to the
//! retrieval context, longest keyword first so the most specific match
//! leads, with deterministic alphabetical tie-breaking.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use log::{info, warn};
use serde::Deserialize;

const KB_FILE: &str = "kb.toml";

/// Most blurbs carried into one prompt.
const MAX_MATCHES: usize = 3;
/// Budget for the formatted context block.
const MAX_CONTEXT_CHARS: usize = 800;

#[derive(Debug, Deserialize)]
struct KbEntry {
    blurb: String,
}

#[derive(Debug, Default)]
pub struct KnowledgeBase {
    entries: BTreeMap<String, String>,
}

impl KnowledgeBase {
    /// Load `kb.toml` from `data_dir`; missing or unparseable files leave
    /// the base empty.
    pub fn load(data_dir: &Path) -> Self {
        let path = data_dir.join(KB_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                info!("no knowledge base loaded: {e}");
                return KnowledgeBase::default();
            }
        };
        match toml::from_str::<BTreeMap<String, KbEntry>>(&content) {
            Ok(raw) => KnowledgeBase {
                entries: raw
                    .into_iter()
                    .map(|(key, entry)| (key, entry.blurb.trim().to_string()))
                    .collect(),
            },
            Err(e) => {
                warn!("failed to parse {}: {e}", path.display());
                KnowledgeBase::default()
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keywords found in `text`, longest first then alphabetical, capped.
    pub fn find_matches(&self, text: &str) -> Vec<(&str, &str)> {
        if self.entries.is_empty() || text.is_empty() {
            return Vec::new();
        }
        let lowered = text.to_lowercase();
        let mut matches: Vec<(&str, &str)> = self
            .entries
            .iter()
            .filter(|(key, _)| lowered.contains(&key.to_lowercase()))
            .map(|(key, blurb)| (key.as_str(), blurb.as_str()))
            .collect();
        matches.sort_by(|a, b| {
            b.0.len()
                .cmp(&a.0.len())
                .then_with(|| a.0.to_lowercase().cmp(&b.0.to_lowercase()))
        });
        matches.truncate(MAX_MATCHES);
        matches
    }

    /// Render matches as the context block appended to the system prompt.
    /// Entries that would blow the character budget are dropped.
    pub fn format_context(matches: &[(&str, &str)]) -> String {
        if matches.is_empty() {
            return String::new();
        }
        let mut lines = vec!["[Retrieved context]".to_string()];
        let mut total = 0;
        for (key, blurb) in matches {
            let entry = format!("- {key}: {blurb}");
            total += entry.len();
            if total > MAX_CONTEXT_CHARS {
                break;
            }
            lines.push(entry);
        }
        lines.join("\n")
    }
}
