pub mod backend;
pub mod config;
pub mod history;
pub mod openai;

pub use backend::{backend_from_config, LlmBackend};
pub use config::{LlmProvider, ModelConfig};
pub use history::{HistoryWindow, Role, Turn};
pub use openai::OpenAiBackend;
