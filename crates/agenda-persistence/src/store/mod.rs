pub mod atomic_writer;
pub mod json_file_store;
pub mod memory_store;
pub mod row_store;

pub use atomic_writer::AtomicWriter;
pub use json_file_store::{JsonEnvelope, JsonFileBackend};
pub use memory_store::MemoryBackend;
pub use row_store::Store;
