//! Core library: change detection, reconciliation into the vector index,
//! freshness-weighted search and the sync cycle that ties them together.

pub mod alert;
pub mod classifier;
pub mod config;
pub mod content;
pub mod detector;
pub mod embeddings;
pub mod error;
pub mod lease;
pub mod models;
pub mod pipeline;
pub mod prefilter;
pub mod reconciler;
pub mod search;
pub mod state;
pub mod vectorstore;

pub use error::SyncError;
