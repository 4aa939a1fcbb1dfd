//! Shuffle error types.

use std::sync::Arc;

/// A clonable trait-object inner error.
#[derive(Clone, Default)]
pub struct DynInnerError(
    pub Option<Arc<dyn std::error::Error + 'static + Send + Sync>>,
);

impl std::fmt::Debug for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for DynInnerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_ref() {
            None => f.write_str("None"),
            Some(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for DynInnerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.as_ref().map(|s| {
            let out: &(dyn std::error::Error + 'static) = &**s;
            out
        })
    }
}

impl DynInnerError {
    /// Construct a new DynInnerError from a source error.
    pub fn new<E: std::error::Error + 'static + Send + Sync>(e: E) -> Self {
        Self(Some(Arc::new(e)))
    }
}

/// The core shuffle error type. This type is used in all external
/// apis as well as internally by the fetch and transport modules.
///
/// It is `Clone` because a single failure is frequently reported for many
/// blocks at once (for example a connection that could not be opened
/// fails every block of the batch).
#[derive(Debug, Clone, thiserror::Error)]
pub enum ShuffleError {
    /// Generic shuffle error.
    #[error("{ctx} (src: {src})")]
    Other {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: DynInnerError,
    },
}

impl ShuffleError {
    /// Construct an "other" error with an inner source error.
    pub fn other_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::new(src),
        }
    }

    /// Construct an "other" error.
    pub fn other<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: DynInnerError::default(),
        }
    }

    /// Returns true if this error is, or wraps, an [std::io::Error].
    ///
    /// I/O failures are expected to come from transient network conditions
    /// and are the only errors worth retrying a fetch for.
    pub fn is_transient(&self) -> bool {
        let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = cur {
            if err.is::<std::io::Error>() {
                return true;
            }
            cur = err.source();
        }
        false
    }
}

impl From<std::io::Error> for ShuffleError {
    fn from(err: std::io::Error) -> Self {
        Self::other_src("io error", err)
    }
}

/// The core shuffle result type.
pub type ShuffleResult<T> = Result<T, ShuffleError>;
