//! The bounded conversation window kept per client session.

use crate::llm_client::user_message;
use async_openai::{
    error::OpenAIError,
    types::{ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage},
};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn to_request_message(&self) -> Result<ChatCompletionRequestMessage, OpenAIError> {
        match self.role {
            Role::User => user_message(self.content.clone()),
            Role::Assistant => Ok(ChatCompletionRequestAssistantMessageArgs::default()
                .content(self.content.clone())
                .build()?
                .into()),
        }
    }
}

/// Converts a slice of turns into chat request messages, oldest first.
pub fn to_request_messages(turns: &[Turn]) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
    turns.iter().map(Turn::to_request_message).collect()
}

/// An ordered history holding at most `max_pairs` user/assistant exchanges.
///
/// Eviction always drops whole exchanges from the front, so the window never
/// starts with an assistant turn whose question has been forgotten.
#[derive(Debug, Clone)]
pub struct ConversationWindow {
    turns: VecDeque<Turn>,
    max_pairs: usize,
}

impl ConversationWindow {
    pub const DEFAULT_PAIRS: usize = 5;

    pub fn new(max_pairs: usize) -> Self {
        let max_pairs = max_pairs.max(1);
        Self {
            turns: VecDeque::with_capacity(max_pairs * 2 + 1),
            max_pairs,
        }
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Role::User, content.into());
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(Role::Assistant, content.into());
    }

    /// A snapshot of the window, oldest turn first.
    pub fn recent(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    fn push(&mut self, role: Role, content: String) {
        self.turns.push_back(Turn {
            role,
            content: content.trim().to_string(),
        });
        while self.turns.len() > self.max_pairs * 2 {
            self.turns.pop_front();
        }
        // An orphaned answer at the front loses its question.
        if self.turns.len() > 1 && self.turns.front().is_some_and(|t| t.role == Role::Assistant) {
            self.turns.pop_front();
        }
    }
}

impl Default for ConversationWindow {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PAIRS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contents(window: &ConversationWindow) -> Vec<String> {
        window.recent().into_iter().map(|t| t.content).collect()
    }

    #[test]
    fn test_window_keeps_insertion_order() {
        let mut window = ConversationWindow::new(5);
        window.push_user("北京今天天气");
        window.push_assistant("晴，25度");
        window.push_user("明天呢");

        assert_eq!(contents(&window), vec!["北京今天天气", "晴，25度", "明天呢"]);
        assert_eq!(window.last().unwrap().role, Role::User);
    }

    #[test]
    fn test_window_evicts_oldest_pairs() {
        let mut window = ConversationWindow::new(2);
        for i in 0..4 {
            window.push_user(format!("q{i}"));
            window.push_assistant(format!("a{i}"));
        }

        assert_eq!(window.len(), 4);
        assert_eq!(contents(&window), vec!["q2", "a2", "q3", "a3"]);
    }

    #[test]
    fn test_window_never_starts_with_assistant() {
        let mut window = ConversationWindow::new(2);
        window.push_user("q0");
        window.push_assistant("a0");
        window.push_user("q1");
        window.push_assistant("a1");
        window.push_user("q2");

        assert!(window.len() <= 4);
        assert_eq!(window.recent()[0].role, Role::User);
        assert_eq!(contents(&window), vec!["q1", "a1", "q2"]);
    }

    #[test]
    fn test_assistant_content_is_trimmed() {
        let mut window = ConversationWindow::default();
        window.push_user("hi");
        window.push_assistant("  hello there \n");
        assert_eq!(window.last().unwrap().content, "hello there");
    }

    #[test]
    fn test_turns_convert_to_request_messages() {
        let mut window = ConversationWindow::default();
        window.push_user("hi");
        window.push_assistant("hello");
        let messages = to_request_messages(&window.recent()).unwrap();
        assert!(matches!(messages[0], ChatCompletionRequestMessage::User(_)));
        assert!(matches!(messages[1], ChatCompletionRequestMessage::Assistant(_)));
    }
}
