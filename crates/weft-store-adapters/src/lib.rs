//! Key-value backend implementations for weft persistence.

pub mod file_kv;
pub mod memory_kv;

pub use file_kv::FileKv;
pub use memory_kv::MemoryKv;
