//! Uniform Request/Response Shapes
//!
//! Both execution paths, task distribution to a full-model worker node and
//! model sharding through a coordinator, accept the same request shape and
//! return the same response shape. The router treats everything above this
//! boundary uniformly.

use serde::{Deserialize, Serialize};

/// A single chat message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message role ("system", "user", "assistant")
    pub role: String,
    /// Message content
    pub content: String,
}

impl ChatMessage {
    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

/// An inference request routed through the cluster
///
/// Carries either a raw prompt or a chat message list; worker nodes and
/// coordinators both accept `{model, prompt|messages, stream}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Model name/tag (e.g., "llama3.1:70b")
    pub model: String,
    /// Raw prompt (mutually exclusive with `messages` in practice)
    pub prompt: Option<String>,
    /// Chat messages (preferred for conversational payloads)
    pub messages: Vec<ChatMessage>,
    /// Whether to stream the response
    pub stream: bool,
    /// Maximum tokens to generate (0 = backend default)
    pub max_tokens: u32,
    /// Sampling temperature
    pub temperature: f32,
}

impl InferenceRequest {
    /// Create a prompt-style request
    pub fn prompt(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: Some(prompt.into()),
            messages: Vec::new(),
            stream: false,
            max_tokens: 0,
            temperature: 0.7,
        }
    }

    /// Create a chat-style request
    pub fn chat(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            prompt: None,
            messages,
            stream: false,
            max_tokens: 0,
            temperature: 0.7,
        }
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// The text content used for request analysis
    ///
    /// Prompt if present, otherwise all message contents joined.
    #[must_use]
    pub fn text(&self) -> String {
        if let Some(ref prompt) = self.prompt {
            return prompt.clone();
        }
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Response from either execution path
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InferenceResponse {
    /// Generated text
    pub content: String,
    /// Model that produced it
    pub model: String,
    /// Tokens generated (if reported by the backend)
    pub tokens_used: Option<u32>,
    /// Wall-clock generation time in milliseconds
    pub duration_ms: u64,
}

/// Which execution path handled (or attempted) a request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoutePath {
    /// Complete-model request on a single worker node
    TaskDistribution,
    /// Layer-sharded execution through a coordinator
    ModelSharding,
}

impl RoutePath {
    /// The opposite path, used for fallback
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::TaskDistribution => Self::ModelSharding,
            Self::ModelSharding => Self::TaskDistribution,
        }
    }

    /// Human-readable label
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::TaskDistribution => "task-distribution",
            Self::ModelSharding => "model-sharding",
        }
    }
}

impl std::fmt::Display for RoutePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}
