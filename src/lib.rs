//! A thread-and-condvar acquisition runtime for up to two video streams.
//!
//! Each stream is a `Source -> [Filter] -> Sink` pipeline, where every
//! stage is its own OS thread and every stage-to-stage link is a
//! [`channel::Channel`]: a single-writer, multi-reader bipartite ring
//! buffer with zero-copy map/unmap windows. The sink channel's second
//! reader — the "monitor" — is exposed through [`Runtime::map_read`] so a
//! caller can observe frames as they're written to storage.
//!
//! ```text
//! camera -> [source] --channel--> [filter] --channel--> [sink] -> storage
//!                                                  \
//!                                                   -> monitor (Runtime::map_read)
//! ```

pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod filter;
pub mod frame;
pub mod metrics;
pub mod pipeline;
pub mod runtime;
pub mod sink;
pub mod source;
pub mod throttler;

pub use config::{Config, StreamConfig, StreamConfigMetadata, MAX_READERS};
pub use error::{ConfigError, Result, RuntimeError};
pub use runtime::{Runtime, RuntimeState, N_STREAMS};
