//! omnicomp — interactive completion aggregation engine
//!
//! Fans one editing request out to pluggable completion sources under a
//! shared deadline, scores everything that arrives in time against the
//! buffer and a durable insertion history, and caches the previous batch
//! for replay while the user keeps typing through the same word.

pub mod cache;
pub mod fuzzy;
pub mod parse;
pub mod rank;
pub mod reviewer;
pub mod store;
pub mod supervisor;
pub mod types;
pub mod worker;

pub use cache::CacheWorker;
pub use rank::rank;
pub use reviewer::Reviewer;
pub use store::{RecencyStore, Statistics, StoreError};
pub use supervisor::{SharedSupervisor, Supervisor};
pub use types::{
    CompleteOptions, Completion, Context, EngineOptions, Limits, MatchOptions, Metric, RangeEdit,
    SourceDescriptor, Weights,
};
pub use worker::{CompletionSource, Worker};

#[cfg(test)]
mod tests;
