#![deny(missing_docs)]
//! Shuffle API contains the traits and basic types shared by the
//! block fetch and transport modules.
//!
//! If you want working implementations, please see the shuffle_core crate.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

pub mod config;

mod error;
pub use error::*;

pub mod fetch;

pub mod id;
pub use id::BlockId;

pub mod protocol;

pub mod transport;
