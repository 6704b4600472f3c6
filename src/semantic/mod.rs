//! Embedding-space machinery behind menu resolution.
//!
//! # Architecture
//!
//! - `embeddings`: embedding oracle boundary and the local fastembed backend
//! - `store`: persisted image/review embedding tables and incremental embedding
//! - `concepts`: cached concept query vectors (menu, interior, exterior, food)
//! - `food`: likely-food tagging of review photos
//! - `retriever`: menu-board retrieval with date backoff
//! - `diversity`: Ward clustering down to a few distinct boards
//! - `calibrator`: review to item matching with a single calibrated threshold
//! - `vector`: shared vector math

pub mod calibrator;
pub mod concepts;
pub mod diversity;
pub mod embeddings;
pub mod food;
pub mod retriever;
pub mod store;
pub mod vector;

#[cfg(feature = "local-embeddings")]
pub use embeddings::LocalTextEmbedder;
pub use embeddings::{check_batch, EmbeddingError, EmbeddingOracle, TextTask};
