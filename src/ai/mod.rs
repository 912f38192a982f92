pub mod client;
pub mod json_parser;
pub mod parser;
pub mod prompts;
pub mod retry;
pub mod schema;

pub use client::{LanguageModel, ModelRequest, ModelStatus, OllamaClient};
pub use parser::{interpret, DirectoryListing, IntentParser, Interpretation, ParseOutcome};
pub use retry::RetryPolicy;
