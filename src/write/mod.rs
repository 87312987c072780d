//! Write module
//!
//! Orchestrates the save and rollback protocols on top of the storage
//! adapter and the transport publisher.

mod service;

pub use service::WriteService;
