//! # reverse-prompt
//!
//! Resumable batch "reverse prompt" captioning for image datasets.
//!
//! ## Features
//!
//! - Sequential batch loop that skips images already captioned
//! - Bounded retries with exponential backoff for rate limits, timeouts and
//!   server errors; permanent failures are recorded and skipped
//! - Crash-safe progress in a CSV file or a SQLite database
//! - Gemini and Ollama backends behind one [`Captioner`] trait
//! - LoRA dataset preparation from a metadata CSV with weighted terms
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use reverse_prompt::{
//!     BatchConfig, BatchRunner, CsvStore, GeminiCaptioner, GeminiConfig, ImageSource,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let captioner = GeminiCaptioner::new(GeminiConfig::with_api_key("your-key"))?;
//!     let runner = BatchRunner::new(captioner, BatchConfig::default())?;
//!
//!     let records = ImageSource::directory("dataset/images").discover()?;
//!     let mut store = CsvStore::open("reverse_prompts.csv")?;
//!
//!     let summary = runner.run(&records, &mut store).await?;
//!     println!("{} done, {} failed", summary.done, summary.failed);
//!     Ok(())
//! }
//! ```
//!
//! Running the same batch again only calls the API for images that are not
//! yet `done` in the store.

pub mod batch;
pub mod captioner;
pub mod config;
pub mod dataset;
pub mod discover;
pub mod error;
pub mod parser;
pub mod store;
pub mod terms;
pub mod types;

pub use batch::{BatchRunner, ItemOutcome};
pub use captioner::{
    read_image, Captioner, GeminiCaptioner, GeminiConfig, OllamaCaptioner, OllamaConfig,
    DEFAULT_REVERSE_PROMPT,
};
pub use config::{BatchConfig, BatchConfigBuilder, RetryPolicy};
pub use dataset::{prepare, CaptionComposer, CaptionRules, PrepareOptions, PrepareReport};
pub use discover::ImageSource;
pub use error::{BatchError, CaptionError, FailureKind, StoreError};
pub use parser::clean_caption;
pub use store::{open_store, read_store, CsvStore, ProgressStore, SqliteStore};
pub use terms::{TermDictionary, TermEntry};
pub use types::{BatchSummary, ImagePayload, ImageRecord, ProgressEntry, RecordStatus};
