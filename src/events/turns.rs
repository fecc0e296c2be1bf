use super::types::Role;
use crate::backend::ModerationLabel;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub id: String,
    pub role: Role,
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub finalized: bool,
    pub moderation_label: Option<ModerationLabel>,
    /// Guardrail-scrubbed text shown instead of `text`, when available.
    pub display_text: Option<String>,
}

impl ConversationTurn {
    fn open(role: Role) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            text: String::new(),
            started_at: Utc::now(),
            ended_at: None,
            finalized: false,
            moderation_label: None,
            display_text: None,
        }
    }

    pub fn shown_text(&self) -> &str {
        self.display_text.as_deref().unwrap_or(&self.text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnAnnotation {
    pub turn_id: String,
    pub display_text: Option<String>,
    pub moderation_label: Option<ModerationLabel>,
}

/// Ordered turns with at most one open turn per role.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    turns: Vec<ConversationTurn>,
    open_user: Option<usize>,
    open_assistant: Option<usize>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn open_turn(&self, role: Role) -> Option<&ConversationTurn> {
        self.open_slot(role).and_then(|idx| self.turns.get(idx))
    }

    /// Returns the open turn for `role`, creating it if needed.
    pub fn ensure_open(&mut self, role: Role) -> &ConversationTurn {
        let idx = self.ensure_open_index(role);
        &self.turns[idx]
    }

    pub fn append_delta(&mut self, role: Role, delta: &str) -> &ConversationTurn {
        let idx = self.ensure_open_index(role);
        self.turns[idx].text.push_str(delta);
        &self.turns[idx]
    }

    /// Closes the open turn for `role`.
    ///
    /// `final_text` replaces the accumulated deltas when present. A turn
    /// that would end up empty is discarded and `None` is returned.
    pub fn finalize(&mut self, role: Role, final_text: Option<&str>) -> Option<ConversationTurn> {
        let final_text = final_text.map(clean_text).filter(|t| !t.is_empty());

        let idx = match self.take_open_slot(role) {
            Some(idx) => idx,
            None => {
                final_text.as_ref()?;
                self.turns.push(ConversationTurn::open(role));
                self.turns.len() - 1
            }
        };

        let text = final_text.unwrap_or_else(|| clean_text(&self.turns[idx].text));
        if text.is_empty() {
            self.turns.remove(idx);
            for slot in [&mut self.open_user, &mut self.open_assistant] {
                if let Some(open) = slot.as_mut() {
                    if *open > idx {
                        *open -= 1;
                    }
                }
            }
            return None;
        }

        let turn = &mut self.turns[idx];
        turn.text = text;
        turn.finalized = true;
        turn.ended_at = Some(Utc::now());
        Some(turn.clone())
    }

    /// Applies side-effect results to a finalized turn; the raw text never changes.
    pub fn annotate(&mut self, annotation: TurnAnnotation) -> Option<&ConversationTurn> {
        let turn = self
            .turns
            .iter_mut()
            .find(|t| t.id == annotation.turn_id && t.finalized)?;
        if annotation.display_text.is_some() {
            turn.display_text = annotation.display_text;
        }
        if annotation.moderation_label.is_some() {
            turn.moderation_label = annotation.moderation_label;
        }
        Some(turn)
    }

    fn open_slot(&self, role: Role) -> Option<usize> {
        match role {
            Role::User => self.open_user,
            Role::Assistant => self.open_assistant,
        }
    }

    fn take_open_slot(&mut self, role: Role) -> Option<usize> {
        match role {
            Role::User => self.open_user.take(),
            Role::Assistant => self.open_assistant.take(),
        }
    }

    fn ensure_open_index(&mut self, role: Role) -> usize {
        if let Some(idx) = self.open_slot(role) {
            return idx;
        }
        self.turns.push(ConversationTurn::open(role));
        let idx = self.turns.len() - 1;
        match role {
            Role::User => self.open_user = Some(idx),
            Role::Assistant => self.open_assistant = Some(idx),
        }
        idx
    }
}

fn clean_text(text: &str) -> String {
    static WS_RE: OnceLock<Regex> = OnceLock::new();
    let re = WS_RE.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"));
    re.replace_all(text.trim(), " ").into_owned()
}
