use rand::{CryptoRng, RngCore};
use std::future::Future;
use std::time::Duration;
use crate::error::{Error, Result};

/// Cryptographically secure random number generator that can be used as a trait object.
// adapted from an unpublished version of `rng_core`
pub trait CryptoRngCore: CryptoRng + RngCore {
    /// Upcasts to a plain [`RngCore`].
    fn as_rngcore(&mut self) -> &mut dyn RngCore;
}

impl<T: CryptoRng + RngCore> CryptoRngCore for T {
    fn as_rngcore(&mut self) -> &mut dyn RngCore {
        self
    }
}

/// Runs `fut` to completion, or fails with [`Error::Timeout`] if `timeout` elapses first.
pub(crate) async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
    where F: Future<Output = Result<T>>
{
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout),
        },
        None => fut.await,
    }
}
