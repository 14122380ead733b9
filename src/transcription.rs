use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, trace};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Model,
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::User => f.write_str("user"),
            Speaker::Model => f.write_str("model"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: u64,
    pub role: Speaker,
    pub content: String,
    pub is_streaming: bool,
}

#[derive(Debug, Default)]
struct PendingTurn {
    text: String,
    message_id: Option<u64>,
}

impl PendingTurn {
    fn clear(&mut self) {
        self.text.clear();
        self.message_id = None;
    }
}

/// Folds transcription fragments into a live view and a completed history.
///
/// Each speaker has its own accumulator, so user and model fragments may
/// interleave freely. A turn-complete signal flushes both accumulators,
/// user first.
#[derive(Debug, Default)]
pub struct TranscriptionReconciler {
    next_id: u64,
    user: PendingTurn,
    model: PendingTurn,
    live: Vec<ChatMessage>,
    history: Vec<ChatMessage>,
}

impl TranscriptionReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending_mut(&mut self, role: Speaker) -> &mut PendingTurn {
        match role {
            Speaker::User => &mut self.user,
            Speaker::Model => &mut self.model,
        }
    }

    pub fn in_progress(&self, role: Speaker) -> &str {
        match role {
            Speaker::User => &self.user.text,
            Speaker::Model => &self.model.text,
        }
    }

    pub fn live_messages(&self) -> &[ChatMessage] {
        &self.live
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    fn live_message_mut(&mut self, id: u64) -> Option<&mut ChatMessage> {
        self.live.iter_mut().rev().find(|message| message.id == id)
    }

    /// Appends `text` to `role`'s turn and returns the updated live message,
    /// if the turn has any visible text yet.
    pub fn on_fragment(&mut self, role: Speaker, text: &str) -> Option<&ChatMessage> {
        let pending = self.pending_mut(role);
        pending.text.push_str(text);
        let content = pending.text.clone();
        let existing = pending.message_id;
        trace!("[Transcripts] {} fragment {:?}.", role, text);

        let id = match existing {
            Some(id) => {
                if let Some(message) = self.live_message_mut(id) {
                    message.content = content;
                }
                id
            }
            None => {
                if content.trim().is_empty() {
                    return None;
                }
                let id = self.next_id;
                self.next_id += 1;
                self.pending_mut(role).message_id = Some(id);
                self.live.push(ChatMessage {
                    id,
                    role,
                    content,
                    is_streaming: true,
                });
                id
            }
        };
        self.live.iter().rev().find(|message| message.id == id)
    }

    /// Moves every non-empty turn into the history and returns the new
    /// entries. Does nothing when both accumulators are empty.
    pub fn on_turn_complete(&mut self) -> Vec<ChatMessage> {
        let mut completed = Vec::new();
        for role in [Speaker::User, Speaker::Model] {
            let pending = std::mem::take(self.pending_mut(role));
            if pending.text.trim().is_empty() {
                continue;
            }
            let id = match pending.message_id {
                Some(id) => id,
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    id
                }
            };
            if let Some(message) = self.live_message_mut(id) {
                message.content = pending.text.clone();
                message.is_streaming = false;
            }
            let entry = ChatMessage {
                id,
                role,
                content: pending.text,
                is_streaming: false,
            };
            debug!("[Transcripts] {} turn complete: {:?}", role, entry.content);
            self.history.push(entry.clone());
            completed.push(entry);
        }
        completed
    }

    /// Drops everything, including the history.
    pub fn reset(&mut self) {
        self.user.clear();
        self.model.clear();
        self.live.clear();
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragments_fold_into_history_on_turn_complete() {
        let mut reconciler = TranscriptionReconciler::new();
        reconciler.on_fragment(Speaker::User, "Hel");
        reconciler.on_fragment(Speaker::User, "lo");
        reconciler.on_fragment(Speaker::Model, "Hi");

        let completed = reconciler.on_turn_complete();
        assert_eq!(completed.len(), 2);

        let history: Vec<_> = reconciler
            .history()
            .iter()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(history, vec![(Speaker::User, "Hello"), (Speaker::Model, "Hi")]);
        assert_eq!(reconciler.in_progress(Speaker::User), "");
        assert_eq!(reconciler.in_progress(Speaker::Model), "");
    }

    #[test]
    fn test_live_view_streams_then_finalizes() {
        let mut reconciler = TranscriptionReconciler::new();
        let first = reconciler.on_fragment(Speaker::Model, "Good").cloned().unwrap();
        assert!(first.is_streaming);
        let second = reconciler.on_fragment(Speaker::Model, " day").cloned().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.content, "Good day");
        assert_eq!(reconciler.live_messages().len(), 1);

        reconciler.on_turn_complete();
        let live = &reconciler.live_messages()[0];
        assert!(!live.is_streaming);
        assert_eq!(live.content, "Good day");
    }

    #[test]
    fn test_turn_complete_with_nothing_pending_is_a_no_op() {
        let mut reconciler = TranscriptionReconciler::new();
        assert!(reconciler.on_turn_complete().is_empty());
        reconciler.on_fragment(Speaker::User, "   ");
        assert!(reconciler.live_messages().is_empty());
        assert!(reconciler.on_turn_complete().is_empty());
        assert!(reconciler.history().is_empty());
    }

    #[test]
    fn test_interleaved_speakers_keep_separate_accumulators() {
        let mut reconciler = TranscriptionReconciler::new();
        reconciler.on_fragment(Speaker::User, "What's the ");
        reconciler.on_fragment(Speaker::Model, "Let me ");
        reconciler.on_fragment(Speaker::User, "weather?");
        reconciler.on_fragment(Speaker::Model, "check.");
        assert_eq!(reconciler.in_progress(Speaker::User), "What's the weather?");
        assert_eq!(reconciler.in_progress(Speaker::Model), "Let me check.");

        reconciler.on_turn_complete();
        reconciler.on_fragment(Speaker::Model, "Sunny.");
        reconciler.on_turn_complete();
        assert_eq!(reconciler.history().len(), 3);
        assert_eq!(reconciler.history()[2].content, "Sunny.");
        assert_eq!(reconciler.live_messages().len(), 3);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut reconciler = TranscriptionReconciler::new();
        reconciler.on_fragment(Speaker::User, "Hi");
        reconciler.on_turn_complete();
        reconciler.on_fragment(Speaker::Model, "Hey");
        reconciler.reset();
        assert!(reconciler.history().is_empty());
        assert!(reconciler.live_messages().is_empty());
        assert_eq!(reconciler.in_progress(Speaker::Model), "");
    }
}
