//! Concrete storage gateways.

pub mod local_fs;

pub use local_fs::LocalFsStorage;
