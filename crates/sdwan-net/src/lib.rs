//! Runtime primitives for the branch mesh
//!
//! This crate provides:
//! - Load-adaptive admission control for the HTTP front door
//! - Single-producer, many-reader stream multiplexing
//! - Streaming JSON array framing for the topology export

pub mod admission;
pub mod framing;
pub mod muxer;

pub use admission::{grace_period, Admission, AdmissionError, Token};
pub use framing::{FrameError, JsonArrayCodec};
pub use muxer::{MuxError, MuxReader, Muxer};
