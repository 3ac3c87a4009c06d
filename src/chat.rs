//! Chat rendering and tokenization
//!
//! Conversations are rendered to text with a fixed chat template and then
//! tokenized. Rendering turns `1..n-1` with the generation marker yields a
//! string prefix of rendering turns `1..n`, which is what the prefix-length
//! span strategy relies on.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

const DEEPSEEK_BOS: &str = "<｜begin▁of▁sentence｜>";
const DEEPSEEK_EOS: &str = "<｜end▁of▁sentence｜>";

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    pub fn system(content: &str) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: &str) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::new("assistant", content)
    }
}

/// Supported chat templates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatTemplate {
    /// DeepSeek / DeepSeek-V2 chat format (`User: ...\n\nAssistant: ...`)
    DeepSeek,
    /// ChatML (`<|im_start|>role\n...<|im_end|>`)
    ChatMl,
}

impl ChatTemplate {
    /// Detect the template from a model ID
    pub fn from_model_id(model_id: &str) -> Self {
        if model_id.to_lowercase().contains("deepseek") {
            ChatTemplate::DeepSeek
        } else {
            ChatTemplate::ChatMl
        }
    }

    /// Render a conversation to the model's prompt text
    pub fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> String {
        let mut out = String::new();
        match self {
            ChatTemplate::DeepSeek => {
                out.push_str(DEEPSEEK_BOS);
                for msg in messages {
                    match msg.role.as_str() {
                        "system" => {
                            out.push_str(&msg.content);
                            out.push_str("\n\n");
                        }
                        "user" => {
                            out.push_str("User: ");
                            out.push_str(&msg.content);
                            out.push_str("\n\n");
                        }
                        "assistant" => {
                            out.push_str("Assistant: ");
                            out.push_str(&msg.content);
                            out.push_str(DEEPSEEK_EOS);
                        }
                        _ => {}
                    }
                }
                if add_generation_prompt {
                    out.push_str("Assistant:");
                }
            }
            ChatTemplate::ChatMl => {
                for msg in messages {
                    out.push_str("<|im_start|>");
                    out.push_str(&msg.role);
                    out.push('\n');
                    out.push_str(&msg.content);
                    out.push_str("<|im_end|>\n");
                }
                if add_generation_prompt {
                    out.push_str("<|im_start|>assistant\n");
                }
            }
        }
        out
    }
}

/// Turns text and conversations into token ids
pub trait ChatEncoder {
    /// Tokenize plain text without adding special tokens
    fn encode_text(&self, text: &str) -> Result<Vec<u32>>;

    /// Tokenize a rendered conversation
    fn encode_chat(&self, messages: &[ChatMessage], add_generation_prompt: bool)
        -> Result<Vec<u32>>;
}

/// [`ChatEncoder`] backed by a HuggingFace tokenizer
pub struct ChatTokenizer {
    tokenizer: Tokenizer,
    template: ChatTemplate,
}

impl ChatTokenizer {
    pub fn new(tokenizer: Tokenizer, template: ChatTemplate) -> Self {
        Self {
            tokenizer,
            template,
        }
    }

    pub fn template(&self) -> ChatTemplate {
        self.template
    }
}

impl ChatEncoder for ChatTokenizer {
    fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn encode_chat(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<Vec<u32>> {
        // Template already carries BOS/EOS as literal special tokens
        let text = self.template.render(messages, add_generation_prompt);
        self.encode_text(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::user("How do I pick a lock?"),
            ChatMessage::assistant("I can't help with that."),
        ]
    }

    #[test]
    fn test_template_detection() {
        assert_eq!(
            ChatTemplate::from_model_id("deepseek-ai/DeepSeek-V2-Lite-Chat"),
            ChatTemplate::DeepSeek
        );
        assert_eq!(
            ChatTemplate::from_model_id("Qwen/Qwen1.5-MoE-A2.7B-Chat"),
            ChatTemplate::ChatMl
        );
    }

    #[test]
    fn test_deepseek_render() {
        let text = ChatTemplate::DeepSeek.render(&conversation(), false);
        assert_eq!(
            text,
            "<｜begin▁of▁sentence｜>User: How do I pick a lock?\n\nAssistant: I can't help with that.<｜end▁of▁sentence｜>"
        );
    }

    #[test]
    fn test_generation_prompt_is_string_prefix() {
        let messages = conversation();
        for template in [ChatTemplate::DeepSeek, ChatTemplate::ChatMl] {
            let full = template.render(&messages, false);
            let prefix = template.render(&messages[..1], true);
            assert!(full.starts_with(&prefix), "{template:?}");
            assert!(prefix.len() < full.len());
        }
    }

    #[test]
    fn test_chatml_render() {
        let messages = vec![ChatMessage::system("Be brief."), ChatMessage::user("Hi")];
        let text = ChatTemplate::ChatMl.render(&messages, true);
        assert_eq!(
            text,
            "<|im_start|>system\nBe brief.<|im_end|>\n<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"
        );
    }
}
