//! One "send" in a chat: optional upload, user message, streamed assistant reply.

use crate::api::{ApiClient, ApiError};
use crate::conversation::Conversation;
use crate::session::SessionState;
use crate::stream::{self, StreamError, StreamRequest};

/// File attached to a message (uploaded before the prompt is streamed).
#[derive(Debug, Clone)]
pub struct Attachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Sends chat messages on behalf of the signed-in doctor.
#[derive(Clone)]
pub struct ChatSession {
    client: ApiClient,
    session: SessionState,
}

impl ChatSession {
    pub fn new(client: ApiClient, session: SessionState) -> Self {
        Self { client, session }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Load the stored history of a chat (GET /messages).
    pub async fn load(&self, chat_id: &str) -> Result<Conversation, ChatError> {
        let credential = self.session.credential()?;
        let history = self.client.list_messages(&credential, chat_id).await?;
        Ok(Conversation::from_history(history))
    }

    /// Send `prompt` (and optional attachment) to `chat_id`, streaming the reply into
    /// `conversation`. `on_token` sees every token as it is appended.
    ///
    /// An empty prompt without attachment is ignored and returns `Ok(0)`. Without a
    /// credential the call fails before anything is sent or shown. Any later failure is
    /// recorded in the conversation as an error message and also returned.
    pub async fn send(
        &self,
        conversation: &mut Conversation,
        chat_id: &str,
        prompt: &str,
        attachment: Option<Attachment>,
        on_token: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<usize, ChatError> {
        if prompt.trim().is_empty() && attachment.is_none() {
            return Ok(0);
        }
        let credential = self.session.credential()?;

        let image_url = match attachment {
            Some(a) => match self.client.upload(&credential, &a.file_name, a.bytes).await {
                Ok(info) => Some(self.client.resolve_media_url(&info.url)),
                Err(e) => {
                    log::warn!("upload of {} failed: {}", a.file_name, e);
                    conversation.push_error(format!("Upload failed: {}", e));
                    return Err(e.into());
                }
            },
            None => None,
        };

        conversation.push_user(prompt, image_url.clone());
        let acc = conversation.open_assistant();
        let request = StreamRequest {
            image_url,
            ..StreamRequest::new(chat_id, prompt)
        };

        let result = {
            let mut deliver = |token: &str| {
                conversation.append(&acc, token);
                on_token(token);
            };
            stream::send_message(&self.client, &credential, &request, &mut deliver).await
        };

        match result {
            Ok(frames) => {
                conversation.finish(acc);
                Ok(frames)
            }
            Err(e) => {
                log::warn!("chat {} send failed: {}", chat_id, e);
                conversation.fail(acc, e.to_string());
                Err(e.into())
            }
        }
    }
}
