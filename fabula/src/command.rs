//! Danmaku command parsing.
//!
//! Viewers steer the story by prefixing chat messages with `/`. A
//! message is classified as exactly one of: a vote (`/vote 2`), an
//! action (`/attack dragon weapon=sword`) or plain chatter.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::live::Danmaku;

static ACTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/(\w+)(?:\s+(.+))?$").unwrap());
static VOTE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^/vote\s+(\d+)$").unwrap());

/// Result of classifying one chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    /// Plain chatter, kept verbatim.
    None { raw: String },
    /// A free-form action with positional and named parameters.
    /// Positional parameters are keyed by their insert index, so
    /// `/attack dragon weapon=sword` yields `{"0": "dragon",
    /// "weapon": "sword"}`.
    Action {
        verb: String,
        params: BTreeMap<String, String>,
    },
    /// A vote for one of the presented options.
    Vote { option_id: String },
}

/// Stateless parser over the command grammar.
#[derive(Debug, Clone, Default)]
pub struct DanmakuParser;

impl DanmakuParser {
    pub fn new() -> Self {
        Self
    }

    /// Classify a message. Votes win over generic actions.
    pub fn parse(&self, danmaku: &Danmaku) -> ParsedCommand {
        self.parse_text(&danmaku.content)
    }

    pub fn parse_text(&self, content: &str) -> ParsedCommand {
        let trimmed = content.trim();
        if let Some(caps) = VOTE_RE.captures(trimmed) {
            return ParsedCommand::Vote {
                option_id: caps[1].to_string(),
            };
        }
        if let Some(caps) = ACTION_RE.captures(trimmed) {
            let params = caps
                .get(2)
                .map(|m| parse_params(m.as_str()))
                .unwrap_or_default();
            return ParsedCommand::Action {
                verb: caps[1].to_string(),
                params,
            };
        }
        ParsedCommand::None {
            raw: trimmed.to_string(),
        }
    }

    pub fn is_action(&self, text: &str) -> bool {
        ACTION_RE.is_match(text.trim())
    }

    pub fn is_vote(&self, text: &str) -> bool {
        VOTE_RE.is_match(text.trim())
    }
}

fn parse_params(raw: &str) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    for part in raw.split_whitespace() {
        match part.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                params.insert(key.to_string(), value.to_string());
            }
            _ => {
                params.insert(params.len().to_string(), part.to_string());
            }
        }
    }
    params
}
