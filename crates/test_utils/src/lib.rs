//! Test utilities shared by the shuffle crates.

use shuffle_api::*;

pub mod listener;
pub mod rpc;

#[doc(hidden)]
pub use tokio;

/// Enable tracing with the RUST_LOG environment variable.
///
/// This is intended to be used in tests, so it defaults to DEBUG level.
pub fn enable_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::DEBUG.into())
                .from_env_lossy(),
        )
        .try_init();
}

/// Repeatedly run a block of code until it returns or breaks, or panic
/// once the timeout elapses.
///
/// `iter_check!(timeout_ms, sleep_ms, { ... })` sleeps `sleep_ms` before
/// each iteration, `iter_check!(timeout_ms, { ... })` sleeps 10 ms.
#[macro_export]
macro_rules! iter_check {
    ($timeout_ms:expr, $sleep_ms:expr, $code:block) => {
        $crate::tokio::time::timeout(
            std::time::Duration::from_millis($timeout_ms),
            async {
                loop {
                    $crate::tokio::time::sleep(std::time::Duration::from_millis(
                        $sleep_ms,
                    ))
                    .await;
                    $code
                }
            },
        )
        .await
        .expect("iter_check timed out")
    };
    ($timeout_ms:expr, $code:block) => {
        $crate::iter_check!($timeout_ms, 10, $code)
    };
}

/// Generate `count` distinct block ids of the shape `shuffle_<n>_<n>_<n>`.
pub fn random_block_ids(count: usize) -> Vec<BlockId> {
    use rand::Rng;

    let mut rng = rand::thread_rng();
    let mut out: Vec<BlockId> = Vec::with_capacity(count);
    while out.len() < count {
        let id = BlockId::from(format!(
            "shuffle_{}_{}_{}",
            rng.gen_range(0..16u32),
            rng.gen_range(0..1024u32),
            rng.gen_range(0..64u32),
        ));
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}
