pub mod memory;
pub mod qdrant;

pub use memory::{cosine_similarity, MemoryStore};
pub use qdrant::QdrantStore;
