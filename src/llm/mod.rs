pub mod gemini;
pub mod openai;
pub mod provider;
pub mod types;

pub use gemini::GeminiClient;
pub use openai::OpenAiProvider;
pub use provider::GenerationProvider;
pub use types::{ChatMessage, ChatRequest};
