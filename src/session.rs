//! the chat session: history, the attachment buffer, and the submission
//! state machine (`stage` -> `begin` -> `finish`).
//!
//! the plugin drives the three steps across frames; `submit` runs them
//! back to back for callers outside of bevy.

use crate::attachment::{Attachment, AttachmentBuffer};
use crate::client::{CompletionClient, CompletionError};
use crate::conversation::{ConversationHistory, Role};

/// what the model-role history entry records after a successful reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ModelTurnContent {
    /// the model's (cleaned) reply.
    #[default]
    Reply,
    /// the user's text again. matches widgets that stored the prompt in the
    /// model slot; the model then sees its own turns as echoes.
    EchoUserText,
}

/// a message ready to go out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTurn {
    pub text: String,
    pub attachment: Option<Attachment>,
}

/// final text for the placeholder bubble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyOutcome {
    pub text: String,
    pub is_error: bool,
}

#[derive(Debug, Default)]
pub struct ChatSession {
    history: ConversationHistory,
    attachment: AttachmentBuffer,
    model_turn: ModelTurnContent,
    // user text of the request in flight
    in_flight: Option<String>,
}

impl ChatSession {
    pub fn new(model_turn: ModelTurnContent) -> Self {
        Self { model_turn, ..Default::default() }
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn attachment(&self) -> &AttachmentBuffer {
        &self.attachment
    }

    pub fn attachment_mut(&mut self) -> &mut AttachmentBuffer {
        &mut self.attachment
    }

    pub fn set_model_turn(&mut self, model_turn: ModelTurnContent) {
        self.model_turn = model_turn;
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// trims `input` and pairs it with the buffered attachment. returns
    /// `None` (and leaves the buffer alone) for blank input.
    pub fn stage(&mut self, input: &str) -> Option<PendingTurn> {
        let text = input.trim();
        if text.is_empty() {
            return None;
        }
        Some(PendingTurn {
            text: text.to_string(),
            attachment: self.attachment.take(),
        })
    }

    /// appends the user turn and returns the serialized request body.
    pub fn begin(&mut self, turn: PendingTurn) -> Result<String, CompletionError> {
        let PendingTurn { text, attachment } = turn;
        self.history.append_turn(Role::User, text.clone(), attachment);
        self.in_flight = Some(text);
        serde_json::to_string(&self.history.to_request_payload())
            .map_err(|e| CompletionError::Encode(e.to_string()))
    }

    /// records the model turn on success and produces the bubble text.
    pub fn finish(&mut self, result: Result<String, CompletionError>) -> ReplyOutcome {
        let user_text = self.in_flight.take().unwrap_or_default();
        // a stale image must never ride along with the next message
        self.attachment.clear();
        match result {
            Ok(reply) => {
                let recorded = match self.model_turn {
                    ModelTurnContent::Reply => reply.clone(),
                    ModelTurnContent::EchoUserText => user_text,
                };
                self.history.append_turn(Role::Model, recorded, None);
                ReplyOutcome { text: reply, is_error: false }
            }
            Err(err) => ReplyOutcome { text: err.to_string(), is_error: true },
        }
    }

    /// full exchange: append, send, record.
    pub async fn submit(&mut self, client: &CompletionClient, turn: PendingTurn) -> ReplyOutcome {
        let result = match self.begin(turn) {
            Ok(body) => client.send(body).await,
            Err(err) => Err(err),
        };
        self.finish(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::AttachmentSource;
    use crate::client::testing::{CannedTransport, reply};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn client(transport: std::sync::Arc<CannedTransport>) -> CompletionClient {
        CompletionClient::new("http://localhost/gen", transport)
    }

    #[test]
    fn blank_input_stages_nothing() {
        let mut session = ChatSession::default();
        session
            .attachment_mut()
            .set(Attachment::from_bytes(b"img", "image/png"), AttachmentSource::File);
        assert_eq!(session.stage("   \n\t"), None);
        assert!(!session.attachment().is_empty());
    }

    #[test]
    fn stage_trims_and_takes_attachment() {
        let mut session = ChatSession::default();
        let img = Attachment::from_bytes(b"img", "image/png");
        session.attachment_mut().set(img.clone(), AttachmentSource::Camera);

        let turn = session.stage("  hello  ").unwrap();
        assert_eq!(turn, PendingTurn { text: "hello".into(), attachment: Some(img) });
        assert!(session.attachment().is_empty());
    }

    #[test]
    fn hello_scenario() {
        let transport = CannedTransport::ok(reply("**Hello!**"));
        let mut session = ChatSession::default();

        let turn = session.stage("hello").unwrap();
        let outcome = pollster::block_on(session.submit(&client(transport.clone()), turn));

        assert_eq!(outcome, ReplyOutcome { text: "Hello!".into(), is_error: false });
        assert!(!session.is_busy());
        assert!(session.attachment().is_empty());

        let turns = session.history().turns();
        assert_eq!(turns.len(), 2);
        assert_eq!((turns[0].role(), turns[0].text()), (Role::User, Some("hello")));
        assert_eq!((turns[1].role(), turns[1].text()), (Role::Model, Some("Hello!")));

        let body = &transport.bodies()[0];
        assert_eq!(body, &json!({ "contents": [{ "role": "user", "parts": [{ "text": "hello" }] }] }));
    }

    #[test]
    fn echo_mode_records_user_text_in_model_turn() {
        let transport = CannedTransport::ok(reply("sure"));
        let mut session = ChatSession::new(ModelTurnContent::EchoUserText);
        let turn = session.stage("tell me").unwrap();
        let outcome = pollster::block_on(session.submit(&client(transport), turn));

        assert_eq!(outcome.text, "sure");
        let last = session.history().last().unwrap();
        assert_eq!((last.role(), last.text()), (Role::Model, Some("tell me")));
    }

    #[test]
    fn remote_error_is_flagged_and_buffer_cleared() {
        let transport = CannedTransport::status(400, json!({ "error": { "message": "X" } }));
        let mut session = ChatSession::default();
        session
            .attachment_mut()
            .set(Attachment::from_bytes(b"img", "image/png"), AttachmentSource::File);

        let turn = session.stage("describe").unwrap();
        let outcome = pollster::block_on(session.submit(&client(transport.clone()), turn));

        assert_eq!(outcome, ReplyOutcome { text: "X".into(), is_error: true });
        assert!(session.attachment().is_empty());
        // the failed prompt stays in history; no model turn is added
        assert_eq!(session.history().len(), 1);
        assert!(session.history().turns()[0].attachment().is_some());

        let body = &transport.bodies()[0];
        assert_eq!(body["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/png");
    }

    #[test]
    fn transport_error_is_flagged() {
        let mut session = ChatSession::default();
        let turn = session.stage("ping").unwrap();
        let outcome =
            pollster::block_on(session.submit(&client(CannedTransport::failing("offline")), turn));
        assert_eq!(outcome, ReplyOutcome { text: "offline".into(), is_error: true });
        assert!(!session.is_busy());
    }

    #[test]
    fn second_turn_sends_whole_history_without_inline_data() {
        let transport = CannedTransport::ok(reply("ok"));
        let c = client(transport.clone());
        let mut session = ChatSession::default();

        for text in ["one", "two"] {
            let turn = session.stage(text).unwrap();
            pollster::block_on(session.submit(&c, turn));
        }

        let bodies = transport.bodies();
        let contents = bodies[1]["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        let last = contents.last().unwrap();
        assert_eq!(last["role"], "user");
        assert!(last["parts"].as_array().unwrap().iter().all(|p| p.get("inlineData").is_none()));
    }
}
