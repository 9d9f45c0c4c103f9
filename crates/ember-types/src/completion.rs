use serde::{Deserialize, Serialize};

pub const DEFAULT_STOP_SEQUENCES: [&str; 3] = ["</s>", "User:", "Human:"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    #[default]
    Text,
    Vision,
}

impl ModelType {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelType::Text => "text",
            ModelType::Vision => "vision",
        }
    }

    pub fn other(self) -> ModelType {
        match self {
            ModelType::Text => ModelType::Vision,
            ModelType::Vision => ModelType::Text,
        }
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Base64 image attached to a vision request, in llama.cpp `image_data` form.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageData {
    pub id: u32,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub stop: Vec<String>,
    pub model_type: ModelType,
    #[serde(default)]
    pub images: Vec<ImageData>,
}

impl Default for CompletionRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            max_tokens: 2048,
            temperature: 0.1,
            top_p: 0.95,
            top_k: 40,
            repeat_penalty: 1.1,
            stop: DEFAULT_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
            model_type: ModelType::Text,
            images: Vec::new(),
        }
    }
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_model_type(mut self, model_type: ModelType) -> Self {
        self.model_type = model_type;
        self
    }

    /// Attaching images forces the vision backend.
    pub fn with_images(mut self, images: Vec<ImageData>) -> Self {
        if !images.is_empty() {
            self.model_type = ModelType::Vision;
        }
        self.images = images;
        self
    }

    pub fn has_images(&self) -> bool {
        !self.images.is_empty()
    }

    pub fn requested_model_type(&self) -> ModelType {
        if self.has_images() {
            ModelType::Vision
        } else {
            self.model_type
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub backend: ModelType,
    pub tokens_used: u64,
    pub finish_reason: String,
    pub duration_ms: u64,
}
