//! Token span location
//!
//! Finds where a semantically meaningful piece of text (a question, or the
//! final assistant turn) starts inside a fully tokenized conversation.
//!
//! ## Strategies
//!
//! - **Subsequence search**: tokenize the target text on its own and look for
//!   the first exact occurrence of its ids in the full sequence. Tokenizer
//!   boundary effects can prevent a match; that is reported as `None` and
//!   the caller skips the example.
//! - **Prefix length**: render all turns but the last with the generation
//!   marker; its token count is where the final turn's content starts.

use anyhow::Result;

use crate::chat::{ChatEncoder, ChatMessage};

/// Marker preceding the question in context-augmented prompts
pub const QUESTION_MARKER: &str = "Question:";

/// Half-open token interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenSpan {
    pub start: usize,
    pub end: usize,
}

impl TokenSpan {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    /// Number of tokens covered
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Cap the span to at most `budget` tokens from its own start
    pub fn truncate(&self, budget: usize) -> Self {
        Self {
            start: self.start,
            end: self.end.min(self.start + budget),
        }
    }
}

/// First index `i` such that `target` occurs contiguously at `sequence[i..]`.
///
/// Returns `None` when absent or when `target` is empty.
pub fn find_subsequence(sequence: &[u32], target: &[u32]) -> Option<usize> {
    if target.is_empty() || target.len() > sequence.len() {
        return None;
    }
    sequence
        .windows(target.len())
        .position(|window| window == target)
}

/// Span of the first occurrence of `target` in `sequence`
pub fn locate_subsequence(sequence: &[u32], target: &[u32]) -> Option<TokenSpan> {
    find_subsequence(sequence, target).map(|start| TokenSpan::new(start, start + target.len()))
}

/// Span of the final turn's content, from the rendered prefix length to the end.
///
/// `full_ids` must be the encoding of `messages` without a generation
/// marker. Returns `None` when there is no earlier turn to form a prefix,
/// when the rendered prefix is not a token prefix of `full_ids` (a non
/// prefix-stable template or tokenizer merge across the boundary), or when
/// it leaves nothing after it.
pub fn locate_final_turn(
    encoder: &dyn ChatEncoder,
    messages: &[ChatMessage],
    full_ids: &[u32],
) -> Result<Option<TokenSpan>> {
    if messages.len() < 2 {
        return Ok(None);
    }

    let prefix_ids = encoder.encode_chat(&messages[..messages.len() - 1], true)?;
    let start = prefix_ids.len();

    if start >= full_ids.len() || full_ids[..start] != prefix_ids[..] {
        return Ok(None);
    }

    Ok(Some(TokenSpan::new(start, full_ids.len())))
}

/// Question text of a conversation.
///
/// Takes the first `user` turn; if it contains [`QUESTION_MARKER`], the text
/// after the last marker, otherwise the whole turn. Trimmed.
pub fn extract_question(messages: &[ChatMessage]) -> Result<String> {
    let user = messages
        .iter()
        .find(|m| m.role == "user")
        .ok_or_else(|| anyhow::anyhow!("No user message found"))?;

    let question = match user.content.rsplit_once(QUESTION_MARKER) {
        Some((_, tail)) => tail,
        None => user.content.as_str(),
    };

    Ok(question.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatTemplate;

    /// One token per byte of the rendered template
    struct ByteEncoder(ChatTemplate);

    impl ChatEncoder for ByteEncoder {
        fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }

        fn encode_chat(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<Vec<u32>> {
            self.encode_text(&self.0.render(messages, add_generation_prompt))
        }
    }

    /// Re-tokenizes the generation marker differently from a full render
    struct UnstableEncoder;

    impl ChatEncoder for UnstableEncoder {
        fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }

        fn encode_chat(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<Vec<u32>> {
            let mut ids = self.encode_text(&ChatTemplate::ChatMl.render(messages, false))?;
            if add_generation_prompt {
                ids.push(9999);
            }
            Ok(ids)
        }
    }

    #[test]
    fn test_find_subsequence() {
        let seq = [5, 6, 7, 8, 9];
        assert_eq!(find_subsequence(&seq, &[7, 8]), Some(2));
        assert_eq!(find_subsequence(&seq, &[8, 7]), None);
        assert_eq!(find_subsequence(&seq, &[5]), Some(0));
        assert_eq!(find_subsequence(&seq, &[9]), Some(4));
        assert_eq!(find_subsequence(&seq, &[]), None);
        assert_eq!(find_subsequence(&[1, 2], &[1, 2, 3]), None);
    }

    #[test]
    fn test_find_returns_first_match() {
        let seq = [1, 2, 1, 2, 1, 2];
        assert_eq!(find_subsequence(&seq, &[1, 2]), Some(0));
        assert_eq!(find_subsequence(&seq, &[2, 1, 2]), Some(1));
    }

    #[test]
    fn test_locate_subsequence_span() {
        let span = locate_subsequence(&[5, 6, 7, 8, 9], &[7, 8]).unwrap();
        assert_eq!(span, TokenSpan::new(2, 4));
        assert_eq!(span.len(), 2);
    }

    #[test]
    fn test_truncate() {
        let span = TokenSpan::new(10, 20);
        assert_eq!(span.truncate(7), TokenSpan::new(10, 17));
        assert_eq!(span.truncate(50), span);
        assert!(span.truncate(0).is_empty());
    }

    #[test]
    fn test_locate_final_turn() {
        let encoder = ByteEncoder(ChatTemplate::ChatMl);
        let messages = vec![ChatMessage::user("Hi"), ChatMessage::assistant("Hello there")];
        let full = encoder.encode_chat(&messages, false).unwrap();

        let span = locate_final_turn(&encoder, &messages, &full).unwrap().unwrap();
        assert_eq!(span.end, full.len());

        let response: Vec<u8> = full[span.start..].iter().map(|&b| b as u8).collect();
        assert_eq!(String::from_utf8(response).unwrap(), "Hello there<|im_end|>\n");
    }

    #[test]
    fn test_locate_final_turn_rejects_unstable_prefix() {
        let messages = vec![ChatMessage::user("Hi"), ChatMessage::assistant("Hello")];
        let full = UnstableEncoder.encode_chat(&messages, false).unwrap();
        assert_eq!(locate_final_turn(&UnstableEncoder, &messages, &full).unwrap(), None);
    }

    #[test]
    fn test_locate_final_turn_needs_two_turns() {
        let encoder = ByteEncoder(ChatTemplate::ChatMl);
        let messages = vec![ChatMessage::user("Hi")];
        assert_eq!(locate_final_turn(&encoder, &messages, &[1, 2, 3]).unwrap(), None);
        assert_eq!(locate_final_turn(&encoder, &[], &[1, 2, 3]).unwrap(), None);
    }

    #[test]
    fn test_extract_question() {
        let messages = vec![
            ChatMessage::system("Answer the question."),
            ChatMessage::user("Context:\nParis is in France.\n\nQuestion:\nWhere is Paris?  "),
        ];
        assert_eq!(extract_question(&messages).unwrap(), "Where is Paris?");

        let plain = vec![ChatMessage::user("  What is 2+2? ")];
        assert_eq!(extract_question(&plain).unwrap(), "What is 2+2?");

        let none = vec![ChatMessage::system("nothing")];
        assert!(extract_question(&none).is_err());
    }
}
