//! Line-oriented rendering of conversation snapshots.

use std::io::Write;
use std::sync::Mutex;

use hilo_chat::{ConversationSnapshot, Message, Role};

#[derive(Debug, Default)]
struct RenderState {
    /// Bytes of the streaming message already written.
    streamed: usize,
    streaming: bool,
}

/// Writes history once and streaming replies as they grow.
pub struct TranscriptRenderer<W> {
    out: Mutex<W>,
    state: Mutex<RenderState>,
}

impl<W: Write> TranscriptRenderer<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            state: Mutex::new(RenderState::default()),
        }
    }

    pub fn print_history(&self, snapshot: &ConversationSnapshot) -> std::io::Result<()> {
        let Ok(mut out) = self.out.lock() else {
            return Ok(());
        };
        for message in snapshot.durable_messages() {
            writeln!(out, "{}{}", speaker(message), message.content)?;
        }
        out.flush()
    }

    pub fn render(&self, snapshot: &ConversationSnapshot) -> std::io::Result<()> {
        let (Ok(mut out), Ok(mut state)) = (self.out.lock(), self.state.lock()) else {
            return Ok(());
        };

        match snapshot.streaming_message() {
            Some(message) => {
                let content = message.content.as_str();
                if !state.streaming {
                    write!(out, "{}", speaker(message))?;
                    state.streaming = true;
                    state.streamed = 0;
                }
                match content.get(state.streamed..) {
                    Some(unseen) => write!(out, "{unseen}")?,
                    None => {
                        writeln!(out)?;
                        write!(out, "{}{content}", speaker(message))?;
                    }
                }
                state.streamed = content.len();
            }
            None if state.streaming => {
                writeln!(out)?;
                *state = RenderState::default();
            }
            None => {}
        }
        out.flush()
    }

    pub fn into_inner(self) -> W {
        match self.out.into_inner() {
            Ok(out) => out,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn speaker(message: &Message) -> String {
    match (message.role, message.origin_label.as_deref()) {
        (Role::User, _) => "you: ".to_string(),
        (Role::Assistant, Some(label)) => format!("assistant ({label}): "),
        (Role::Assistant, None) => "assistant: ".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hilo_chat::MessageKey;

    fn message(role: Role, content: &str, is_streaming: bool, label: Option<&str>) -> Message {
        Message {
            key: MessageKey::Streaming,
            role,
            content: content.to_string(),
            origin_tag: None,
            origin_label: label.map(str::to_string),
            created_at_unix_ms: 0,
            is_streaming,
        }
    }

    fn snapshot(messages: Vec<Message>) -> ConversationSnapshot {
        ConversationSnapshot {
            messages,
            is_loading: true,
        }
    }

    #[test]
    fn streaming_reply_is_written_incrementally() {
        let renderer = TranscriptRenderer::new(Vec::new());
        let user = message(Role::User, "Hola", false, None);

        for partial in ["H", "Hola", "Hola que tal"] {
            renderer
                .render(&snapshot(vec![
                    user.clone(),
                    message(Role::Assistant, partial, true, Some("Model B")),
                ]))
                .unwrap();
        }
        renderer.render(&snapshot(vec![user])).unwrap();

        let written = String::from_utf8(renderer.into_inner()).unwrap();
        assert_eq!(written, "assistant (Model B): Hola que tal\n");
    }

    #[test]
    fn history_lists_durable_messages() {
        let renderer = TranscriptRenderer::new(Vec::new());
        renderer
            .print_history(&snapshot(vec![
                message(Role::User, "hi", false, None),
                message(Role::Assistant, "hello", false, None),
                message(Role::Assistant, "partial", true, None),
            ]))
            .unwrap();

        let written = String::from_utf8(renderer.into_inner()).unwrap();
        assert_eq!(written, "you: hi\nassistant: hello\n");
    }
}
