//! Core data model and streaming primitives for a real-time group-call
//! media engine: stream chunks and frames, the bounded [`buffer`], the
//! transcoder-driving [`processor`], a generic [`retry`] loop, a peer
//! [`cache`], and an [`dispatch`]ed event fan-out.
//!
//! This crate is process-local and holds no persisted state. Hosts wire
//! it to a concrete [`transport::TransportClient`] and
//! [`transport::SourceProducer`].

pub mod buffer;
pub mod cache;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod processor;
pub mod retry;
pub mod transport;

pub use error::{Error, Result};
