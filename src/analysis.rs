//! Request Analysis
//!
//! Pure, deterministic classification of incoming requests and model-size
//! estimation from model names. No I/O happens here; everything is
//! unit-testable without a network.
//!
//! # Classification Flow
//!
//! ```text
//! 1. Inspect payload shape (prompt vs. messages vs. embedding input)
//! 2. Classify task type and complexity from content length/markers
//! 3. Estimate token count, GPU need, and a baseline duration
//! ```

use serde::{Deserialize, Serialize};

use crate::api::InferenceRequest;

// ============================================================================
// Task Classification
// ============================================================================

/// What kind of work a request represents
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    /// Free-form text generation (chat, completion)
    Generation,
    /// Embedding/vectorization
    Embedding,
    /// Short-answer classification or labeling
    Classification,
    /// Anything that doesn't fit the above
    Other,
}

impl TaskType {
    /// Stable label used in metrics and reasoning strings
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Embedding => "embedding",
            Self::Classification => "classification",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// How demanding a request is expected to be
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Complexity {
    /// Short prompt, short expected output
    Simple,
    /// Typical conversational request
    Medium,
    /// Long context or long expected output
    Complex,
}

impl Complexity {
    /// Stable label used in metrics and reasoning strings
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Medium => "medium",
            Self::Complex => "complex",
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// The analyzed profile of one request
#[derive(Clone, Debug)]
pub struct RequestProfile {
    /// Classified task type
    pub task_type: TaskType,
    /// Classified complexity
    pub complexity: Complexity,
    /// Rough token estimate for the input
    pub estimated_tokens: u32,
    /// Whether this request benefits materially from a GPU
    pub requires_gpu: bool,
    /// Estimated GPU memory the model needs, in MB
    pub estimated_vram_mb: u64,
    /// Baseline duration estimate before any per-node history applies
    pub baseline_duration_ms: f64,
}

/// Analyze a request into a [`RequestProfile`]
///
/// Pure function of the payload; the same input always yields the same
/// profile.
#[must_use]
pub fn analyze_request(request: &InferenceRequest) -> RequestProfile {
    let text = request.text();
    let task_type = classify_task(request, &text);
    let estimated_tokens = estimate_tokens(&text);
    let complexity = classify_complexity(task_type, estimated_tokens, request.max_tokens);

    // Embeddings and tiny classifications run fine on CPU; generation of
    // any real size wants a GPU.
    let requires_gpu = match task_type {
        TaskType::Embedding => false,
        TaskType::Classification => complexity == Complexity::Complex,
        TaskType::Generation | TaskType::Other => complexity != Complexity::Simple,
    };

    let spec = ModelSpec::estimate(&request.model);

    RequestProfile {
        task_type,
        complexity,
        estimated_tokens,
        requires_gpu,
        estimated_vram_mb: (spec.estimated_memory_gb * 1024.0) as u64,
        baseline_duration_ms: baseline_duration_ms(task_type, complexity),
    }
}

fn classify_task(request: &InferenceRequest, text: &str) -> TaskType {
    let lower = text.to_lowercase();

    if lower.contains("embed") || lower.contains("vector representation") {
        return TaskType::Embedding;
    }

    if lower.starts_with("classify")
        || lower.contains("which category")
        || lower.contains("label the following")
    {
        return TaskType::Classification;
    }

    if request.prompt.is_some() || !request.messages.is_empty() {
        return TaskType::Generation;
    }

    TaskType::Other
}

fn classify_complexity(task_type: TaskType, estimated_tokens: u32, max_tokens: u32) -> Complexity {
    // Embeddings are bounded by input size only.
    if task_type == TaskType::Embedding {
        return if estimated_tokens > 2048 {
            Complexity::Medium
        } else {
            Complexity::Simple
        };
    }

    let budget = estimated_tokens + max_tokens;
    if budget < 200 {
        Complexity::Simple
    } else if budget < 1500 {
        Complexity::Medium
    } else {
        Complexity::Complex
    }
}

/// Rough token estimate: ~4 characters per token
#[must_use]
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as u32).div_ceil(4)
}

fn baseline_duration_ms(task_type: TaskType, complexity: Complexity) -> f64 {
    let base = match task_type {
        TaskType::Embedding => 150.0,
        TaskType::Classification => 400.0,
        TaskType::Generation | TaskType::Other => 1_200.0,
    };

    let factor = match complexity {
        Complexity::Simple => 0.5,
        Complexity::Medium => 1.0,
        Complexity::Complex => 3.0,
    };

    base * factor
}

// ============================================================================
// Model Sizing
// ============================================================================

/// Size profile of a model, estimated from its name/tag
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSpec {
    /// Normalized model name
    pub name: String,
    /// Parameter count in billions
    pub parameters_b: u32,
    /// Rough memory requirement in GB (~0.6 GB per billion parameters)
    pub estimated_memory_gb: f64,
    /// Whether the model is too large for a single commodity node
    pub requires_sharding: bool,
}

/// Known model sizes that override name-suffix parsing
///
/// (name prefix, parameters in billions, requires sharding)
const KNOWN_MODELS: &[(&str, u32, bool)] = &[
    ("llama3.2", 3, false),
    ("llama3.1:405b", 405, true),
    ("llama3.1:70b", 70, true),
    ("llama3.1:8b", 8, false),
    ("llama3:70b", 70, true),
    ("llama3:8b", 8, false),
    ("llama2:70b", 70, true),
    ("llama2:13b", 13, false),
    ("llama2:7b", 7, false),
    ("mixtral:8x22b", 141, true),
    ("mixtral:8x7b", 47, true),
    ("qwen2.5:72b", 72, true),
    ("mistral:7b", 7, false),
    ("gemma:7b", 7, false),
    ("phi3", 4, false),
    ("phi", 3, false),
];

/// Parameter-count suffixes checked in descending order so "405b" wins
/// over "5b" and similar substrings.
const PARAM_SUFFIXES: &[(&str, u32)] = &[
    ("405b", 405),
    ("180b", 180),
    ("72b", 72),
    ("70b", 70),
    ("34b", 34),
    ("22b", 22),
    ("13b", 13),
    ("8b", 8),
    ("7b", 7),
    ("3b", 3),
    ("1b", 1),
];

impl ModelSpec {
    /// Estimate a model's size profile from its name
    ///
    /// Known models are looked up directly (with and without tag); unknown
    /// names fall back to parameter-suffix parsing, defaulting to a small
    /// single-node model.
    #[must_use]
    pub fn estimate(model: &str) -> Self {
        let key = model.trim().to_lowercase();

        if let Some(&(_, params, sharded)) = KNOWN_MODELS.iter().find(|(name, _, _)| *name == key)
        {
            return Self::from_params(&key, params, Some(sharded));
        }

        // Try the base name without the tag.
        if let Some(base) = key.split(':').next() {
            if let Some(&(_, params, sharded)) =
                KNOWN_MODELS.iter().find(|(name, _, _)| *name == base)
            {
                return Self::from_params(&key, params, Some(sharded));
            }
        }

        let params = PARAM_SUFFIXES
            .iter()
            .find(|(suffix, _)| key.contains(suffix))
            .map_or(8, |&(_, p)| p);

        Self::from_params(&key, params, None)
    }

    fn from_params(name: &str, parameters_b: u32, requires_sharding: Option<bool>) -> Self {
        Self {
            name: name.to_string(),
            parameters_b,
            estimated_memory_gb: f64::from(parameters_b) * 0.6,
            requires_sharding: requires_sharding.unwrap_or(parameters_b > 70),
        }
    }

    /// Whether the router should prefer the sharding path when both paths
    /// are configured and backends are available
    ///
    /// Models above 13B prefer sharding when they are flagged as requiring
    /// it; models above 70B always do.
    #[must_use]
    pub fn prefers_sharding(&self) -> bool {
        if self.parameters_b <= 13 {
            false
        } else if self.parameters_b <= 70 {
            self.requires_sharding
        } else {
            true
        }
    }
}
