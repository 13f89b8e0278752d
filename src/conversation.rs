//! conversation history in the `generateContent` wire shape.

use serde::{Deserialize, Serialize};

use crate::attachment::Attachment;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: Attachment,
    },
}

/// one entry of the history. fields are private: a turn never changes after
/// it is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    role: Role,
    parts: Vec<Part>,
}

impl ConversationTurn {
    pub fn new(role: Role, text: impl Into<String>, attachment: Option<Attachment>) -> Self {
        let mut parts = vec![Part::Text { text: text.into() }];
        if let Some(inline_data) = attachment {
            parts.push(Part::InlineData { inline_data });
        }
        Self { role, parts }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// first text part.
    pub fn text(&self) -> Option<&str> {
        self.parts.iter().find_map(|p| match p {
            Part::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.parts.iter().find_map(|p| match p {
            Part::InlineData { inline_data } => Some(inline_data),
            _ => None,
        })
    }
}

/// ordered, append-only. there is no truncation or token budgeting; the
/// whole history is sent with every request.
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    turns: Vec<ConversationTurn>,
}

/// request body borrowed from a history.
#[derive(Debug, Serialize)]
pub struct GenerateContentRequest<'a> {
    pub contents: &'a [ConversationTurn],
}

impl ConversationHistory {
    pub fn append_turn(
        &mut self,
        role: Role,
        text: impl Into<String>,
        attachment: Option<Attachment>,
    ) -> &ConversationTurn {
        self.turns.push(ConversationTurn::new(role, text, attachment));
        &self.turns[self.turns.len() - 1]
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn to_request_payload(&self) -> GenerateContentRequest<'_> {
        GenerateContentRequest { contents: &self.turns }
    }
}
