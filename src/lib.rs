//! Synchronizes a local SMS/MMS/chat store with an IMAP Converged Message
//! Store. [`service::CmsService`] is the entry point.

pub mod clock;
pub mod codec;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod imap;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod sync;
