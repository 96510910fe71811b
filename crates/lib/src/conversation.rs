//! Chat history as shown to the user, including the in-progress assistant reply.
//!
//! Each send opens a fresh [`Accumulator`]; streamed tokens are appended to it until it is
//! finished or failed. Only one accumulator is open at a time: opening a new one freezes
//! the previous reply as interrupted. A failed send adds one error message and keeps
//! everything already shown.

use crate::api;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    fn from_wire(role: &str) -> Self {
        match role {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            _ => Role::System,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageState {
    Complete,
    /// Still receiving tokens.
    Streaming,
    /// Stream ended early; text is what arrived before the failure.
    Interrupted,
    /// Synthetic message describing a failed send.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayMessage {
    pub role: Role,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    pub state: MessageState,
}

impl DisplayMessage {
    pub fn is_error(&self) -> bool {
        self.state == MessageState::Error
    }
}

/// Handle to the open assistant reply of one send. Stale handles are ignored.
#[derive(Debug)]
pub struct Accumulator {
    id: u64,
}

#[derive(Debug, Clone, Copy)]
struct OpenReply {
    id: u64,
    index: usize,
}

#[derive(Debug, Default)]
pub struct Conversation {
    messages: Vec<DisplayMessage>,
    open: Option<OpenReply>,
    next_id: u64,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Conversation seeded with stored messages (GET /messages), all complete.
    pub fn from_history(history: Vec<api::Message>) -> Self {
        let messages = history
            .into_iter()
            .map(|m| DisplayMessage {
                role: Role::from_wire(&m.role),
                text: m.text,
                media_url: m.media_url,
                state: MessageState::Complete,
            })
            .collect();
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> &[DisplayMessage] {
        &self.messages
    }

    pub fn is_streaming(&self) -> bool {
        self.open.is_some()
    }

    pub fn push_user(&mut self, text: impl Into<String>, media_url: Option<String>) {
        self.messages.push(DisplayMessage {
            role: Role::User,
            text: text.into(),
            media_url,
            state: MessageState::Complete,
        });
    }

    /// Start a new assistant reply. A reply still open from an earlier send is frozen first.
    pub fn open_assistant(&mut self) -> Accumulator {
        if let Some(prev) = self.open.take() {
            log::debug!("new send while a reply was streaming; freezing previous reply");
            self.messages[prev.index].state = MessageState::Interrupted;
        }
        let id = self.next_id;
        self.next_id += 1;
        self.messages.push(DisplayMessage {
            role: Role::Assistant,
            text: String::new(),
            media_url: None,
            state: MessageState::Streaming,
        });
        self.open = Some(OpenReply {
            id,
            index: self.messages.len() - 1,
        });
        Accumulator { id }
    }

    fn open_index(&self, acc: &Accumulator) -> Option<usize> {
        self.open.filter(|o| o.id == acc.id).map(|o| o.index)
    }

    /// Append a streamed token. Returns false if `acc` is no longer open.
    pub fn append(&mut self, acc: &Accumulator, token: &str) -> bool {
        match self.open_index(acc) {
            Some(i) => {
                self.messages[i].text.push_str(token);
                true
            }
            None => false,
        }
    }

    /// Text received so far for `acc`.
    pub fn text(&self, acc: &Accumulator) -> Option<&str> {
        self.open_index(acc).map(|i| self.messages[i].text.as_str())
    }

    /// Stream completed: freeze the reply.
    pub fn finish(&mut self, acc: Accumulator) {
        if let Some(i) = self.open_index(&acc) {
            self.messages[i].state = MessageState::Complete;
            self.open = None;
        }
    }

    /// Stream failed: keep any partial text (as interrupted, or drop the reply if nothing
    /// arrived) and add a single error message with `detail`.
    pub fn fail(&mut self, acc: Accumulator, detail: impl Into<String>) {
        if let Some(i) = self.open_index(&acc) {
            self.open = None;
            if self.messages[i].text.is_empty() {
                self.messages.remove(i);
            } else {
                self.messages[i].state = MessageState::Interrupted;
            }
        }
        self.push_error(detail);
    }

    /// Synthetic assistant message flagged as an error (e.g. an upload failed before streaming).
    pub fn push_error(&mut self, detail: impl Into<String>) {
        self.messages.push(DisplayMessage {
            role: Role::Assistant,
            text: detail.into(),
            media_url: None,
            state: MessageState::Error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_append_to_open_reply() {
        let mut c = Conversation::new();
        c.push_user("hi", None);
        let acc = c.open_assistant();
        assert!(c.is_streaming());
        assert!(c.append(&acc, "Hel"));
        assert!(c.append(&acc, "lo"));
        assert_eq!(c.text(&acc), Some("Hello"));
        c.finish(acc);
        assert!(!c.is_streaming());
        let last = c.messages().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.text, "Hello");
        assert_eq!(last.state, MessageState::Complete);
    }

    #[test]
    fn new_send_starts_new_reply_and_freezes_previous() {
        let mut c = Conversation::new();
        let first = c.open_assistant();
        c.append(&first, "part");
        let second = c.open_assistant();
        assert!(!c.append(&first, "late"));
        assert!(c.append(&second, "new"));
        assert_eq!(c.messages().len(), 2);
        assert_eq!(c.messages()[0].text, "part");
        assert_eq!(c.messages()[0].state, MessageState::Interrupted);
        assert_eq!(c.messages()[1].text, "new");
        c.finish(first);
        assert!(c.is_streaming());
    }

    #[test]
    fn failure_keeps_partial_text_and_history() {
        let mut c = Conversation::from_history(vec![api::Message {
            id: Some("m1".into()),
            role: "user".into(),
            text: "earlier".into(),
            media_url: None,
            media_type: None,
            file_name: None,
            created_at: None,
        }]);
        c.push_user("question", None);
        let acc = c.open_assistant();
        c.append(&acc, "partial");
        c.fail(acc, "stream read failed: connection reset");
        let msgs = c.messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0].text, "earlier");
        assert_eq!(msgs[2].text, "partial");
        assert_eq!(msgs[2].state, MessageState::Interrupted);
        assert!(msgs[3].is_error());
        assert_eq!(msgs.iter().filter(|m| m.is_error()).count(), 1);
    }

    #[test]
    fn failure_before_any_token_leaves_only_error_message() {
        let mut c = Conversation::new();
        c.push_user("question", None);
        let acc = c.open_assistant();
        c.fail(acc, "401 Invalid token");
        let msgs = c.messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[1].role, Role::Assistant);
        assert!(msgs[1].is_error());
        assert!(!c.is_streaming());
    }

    #[test]
    fn history_roles_map_from_wire() {
        let c = Conversation::from_history(vec![
            api::Message {
                id: None,
                role: "assistant".into(),
                text: "a".into(),
                media_url: None,
                media_type: None,
                file_name: None,
                created_at: None,
            },
            api::Message {
                id: None,
                role: "system".into(),
                text: "s".into(),
                media_url: None,
                media_type: None,
                file_name: None,
                created_at: None,
            },
        ]);
        assert_eq!(c.messages()[0].role, Role::Assistant);
        assert_eq!(c.messages()[1].role, Role::System);
    }
}
