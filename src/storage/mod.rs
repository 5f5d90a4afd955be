pub mod file_store;
pub mod repository;

pub use file_store::AtomicFileStore;
pub use repository::{RecordRepository, RecordSet};
