#![deny(missing_docs)]
//! Shuffle client core: reliable block fetching and the transport
//! pipelines it runs over.
//!
//! - [retrying_fetch::RetryingBlockFetcher] delivers exactly one outcome
//!   per requested block, retrying I/O failures.
//! - [transport::TransportContext] builds the per-connection pipeline and
//!   creates clients and servers that use it.
//! - [one_for_one::OneForOneBlockFetchStarter] connects the two, fetching
//!   blocks over transport rpcs.

pub mod one_for_one;
pub mod retrying_fetch;
pub mod transport;
