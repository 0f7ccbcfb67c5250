//! Embedding-vector channel matcher: given a free-form forwarding hint,
//! picks the most semantically similar managed channel.

pub mod cache;
pub mod embedding;
pub mod matcher;

pub use cache::{MatchCache, MatchCacheEntry};
pub use embedding::{Embedding, EmbeddingService, HashEmbeddingService};
pub use matcher::SemanticChannelMatcher;
