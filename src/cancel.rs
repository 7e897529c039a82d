use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// Cooperative abort signal.
///
/// The board glue raises it from the user button; every long running loop
/// polls it once per iteration.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Re-arm the token once the aborted operation has returned.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A background thread that is always cancelled and joined by its owner.
pub struct Worker<T: Send + 'static> {
    token: CancelToken,
    handle: Option<JoinHandle<T>>,
}

impl<T: Send + 'static> Worker<T> {
    /// Spawns `body` with a fresh token it must poll.
    pub fn spawn<F>(name: &str, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(CancelToken) -> T + Send + 'static,
    {
        let token = CancelToken::new();
        let inner = token.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(inner))?;
        log::debug!("worker {name} started");
        Ok(Self {
            token,
            handle: Some(handle),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Signals the worker and waits for it. `None` when the worker panicked.
    pub fn stop(mut self) -> Option<T> {
        self.token.cancel();
        self.handle.take().and_then(|handle| handle.join().ok())
    }
}

impl<T: Send + 'static> Drop for Worker<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.token.cancel();
            let _ = handle.join();
        }
    }
}
