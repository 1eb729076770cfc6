pub mod cli;
mod config;
mod crawl;
mod enrich;
mod error;
mod llm;
mod net;
mod registration;
mod score;
mod search;
mod table;
mod text;

pub use config::Config;
pub use enrich::{Enricher, ProgressFn, enrich};
pub use error::EnrichError;
pub use llm::{Choice, Confidence};
pub use search::Candidate;
pub use table::Table;
