//! Bounded, async key-generator pool.
//!
//! Cryptographic key generation is CPU-bound and occasionally slow (RSA,
//! ML-KEM). Rather than pay that cost on the request path, a small number of
//! background workers keep a bounded buffer of freshly generated items ready
//! to hand out. [`GeneratorPool::get`] drains the buffer first and only
//! falls back to synchronous generation when the buffer is empty, so callers
//! never block on a worker that hasn't caught up yet.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Produces fresh key material on demand. Implementations must be cheap to
/// clone (an `Arc` internally) since the pool invokes them from multiple
/// worker tasks concurrently.
pub trait Generator<T>: Send + Sync + 'static {
    fn generate(&self) -> T;
}

impl<T, F> Generator<T> for F
where
    F: Fn() -> T + Send + Sync + 'static,
{
    fn generate(&self) -> T {
        self()
    }
}

/// Bounds on the pool's standing inventory.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target number of pre-generated items kept warm in the buffer.
    pub buffer_size: usize,
    /// Hard ceiling on items generated but not yet issued plus items
    /// currently on loan. Exceeding it returns [`PoolError::Exhausted`].
    pub max_keys: usize,
    /// An item sitting unused in the buffer longer than this is dropped and
    /// regenerated rather than handed out stale.
    pub max_idle_time: Duration,
    /// Worker back-off when the buffer is already full.
    pub worker_idle_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8,
            max_keys: 256,
            max_idle_time: Duration::from_secs(300),
            worker_idle_backoff: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
pub enum PoolError {
    Exhausted { outstanding: usize, max_keys: usize },
    Closed,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted { outstanding, max_keys } => {
                write!(f, "key generator pool exhausted: {outstanding}/{max_keys} outstanding")
            }
            Self::Closed => write!(f, "key generator pool is closed"),
        }
    }
}

impl std::error::Error for PoolError {}

struct Item<T> {
    value: T,
    minted_at: Instant,
}

/// A warmed item on loan from the pool. Dropping it without calling
/// [`Lease::into_inner`] still releases the outstanding-count slot.
pub struct Lease<T> {
    value: Option<T>,
    outstanding: Arc<AtomicUsize>,
}

impl<T> Lease<T> {
    pub fn into_inner(mut self) -> T {
        self.value.take().expect("lease value taken twice")
    }
}

impl<T> std::ops::Deref for Lease<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("lease value taken")
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A bounded pool of background-generated key material.
///
/// Workers run until [`GeneratorPool::close`] is called or every clone of
/// the pool is dropped. The pool's `Get`/`Close` shape mirrors a classic
/// connection pool: callers ask for an item, the pool decides whether to
/// serve it from the warm buffer or mint one synchronously.
pub struct GeneratorPool<T: Send + 'static> {
    tx: mpsc::Sender<Item<T>>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Item<T>>>>,
    generator: Arc<dyn Generator<T>>,
    config: PoolConfig,
    outstanding: Arc<AtomicUsize>,
    minted_total: Arc<AtomicU64>,
    closed: Arc<Notify>,
    is_closed: Arc<std::sync::atomic::AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> GeneratorPool<T> {
    pub fn new<G: Generator<T>>(generator: G, config: PoolConfig, worker_count: usize) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let generator: Arc<dyn Generator<T>> = Arc::new(generator);
        let outstanding = Arc::new(AtomicUsize::new(0));
        let minted_total = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(Notify::new());
        let is_closed = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for id in 0..worker_count.max(1) {
            workers.push(spawn_worker(
                id,
                tx.clone(),
                generator.clone(),
                config.clone(),
                outstanding.clone(),
                minted_total.clone(),
                closed.clone(),
                is_closed.clone(),
            ));
        }

        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            generator,
            config,
            outstanding,
            minted_total,
            closed,
            is_closed,
            workers,
        }
    }

    /// Number of items minted but not yet returned/dropped.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Lifetime count of items minted by workers or synchronous fallback.
    pub fn minted_total(&self) -> u64 {
        self.minted_total.load(Ordering::SeqCst)
    }

    /// Fetch a warm item, or mint one synchronously if the buffer is empty
    /// and the pool has headroom.
    pub async fn get(&self) -> Result<Lease<T>, PoolError> {
        if self.is_closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        loop {
            let outstanding = self.outstanding.load(Ordering::SeqCst);
            if outstanding >= self.config.max_keys {
                return Err(PoolError::Exhausted {
                    outstanding,
                    max_keys: self.config.max_keys,
                });
            }

            let mut rx = self.rx.lock().await;
            match rx.try_recv() {
                Ok(item) => {
                    drop(rx);
                    if item.minted_at.elapsed() > self.config.max_idle_time {
                        debug!("discarding stale pooled item, regenerating");
                        continue;
                    }
                    self.outstanding.fetch_add(1, Ordering::SeqCst);
                    return Ok(Lease {
                        value: Some(item.value),
                        outstanding: self.outstanding.clone(),
                    });
                }
                Err(mpsc::error::TryRecvError::Empty) => {
                    drop(rx);
                    self.outstanding.fetch_add(1, Ordering::SeqCst);
                    self.minted_total.fetch_add(1, Ordering::SeqCst);
                    let value = self.generator.generate();
                    return Ok(Lease {
                        value: Some(value),
                        outstanding: self.outstanding.clone(),
                    });
                }
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(PoolError::Closed);
                }
            }
        }
    }

    /// Signal workers to stop topping up the buffer. Outstanding leases and
    /// already-buffered items remain valid.
    pub fn close(&self) {
        self.is_closed.store(true, Ordering::SeqCst);
        self.closed.notify_waiters();
    }

    /// Abort and join every worker task. Intended for test teardown.
    pub async fn shutdown(mut self) {
        self.close();
        for w in self.workers.drain(..) {
            w.abort();
        }
    }
}

fn spawn_worker<T: Send + 'static>(
    id: usize,
    tx: mpsc::Sender<Item<T>>,
    generator: Arc<dyn Generator<T>>,
    config: PoolConfig,
    outstanding: Arc<AtomicUsize>,
    minted_total: Arc<AtomicU64>,
    closed: Arc<Notify>,
    is_closed: Arc<std::sync::atomic::AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if is_closed.load(Ordering::SeqCst) {
                debug!(worker = id, "generator pool worker exiting");
                return;
            }

            if outstanding.load(Ordering::SeqCst) >= config.max_keys {
                wait_or_closed(&closed, config.worker_idle_backoff).await;
                continue;
            }

            let value = generator.generate();
            let item = Item {
                value,
                minted_at: Instant::now(),
            };

            match tx.try_send(item) {
                Ok(()) => {
                    minted_total.fetch_add(1, Ordering::SeqCst);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    wait_or_closed(&closed, config.worker_idle_backoff).await;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(worker = id, "generator pool channel closed unexpectedly");
                    return;
                }
            }
        }
    })
}

fn wait_or_closed(closed: &Notify, backoff: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
    Box::pin(async move {
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = closed.notified() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as TestCounter;

    fn counting_generator() -> (impl Generator<u64>, Arc<TestCounter>) {
        let counter = Arc::new(TestCounter::new(0));
        let c = counter.clone();
        (move || c.fetch_add(1, Ordering::SeqCst), counter)
    }

    #[tokio::test]
    async fn get_returns_distinct_items() {
        let (gen, _counter) = counting_generator();
        let pool = GeneratorPool::new(gen, PoolConfig::default(), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let a = pool.get().await.unwrap();
        let b = pool.get().await.unwrap();
        assert_ne!(*a, *b);
    }

    #[tokio::test]
    async fn exhaustion_is_reported() {
        let (gen, _counter) = counting_generator();
        let config = PoolConfig {
            buffer_size: 1,
            max_keys: 2,
            ..Default::default()
        };
        let pool = GeneratorPool::new(gen, config, 1);

        let _a = pool.get().await.unwrap();
        let _b = pool.get().await.unwrap();
        match pool.get().await {
            Err(PoolError::Exhausted { max_keys, .. }) => assert_eq!(max_keys, 2),
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_lease_frees_outstanding_slot() {
        let (gen, _counter) = counting_generator();
        let config = PoolConfig {
            max_keys: 1,
            ..Default::default()
        };
        let pool = GeneratorPool::new(gen, config, 1);

        let a = pool.get().await.unwrap();
        drop(a);
        assert!(pool.get().await.is_ok());
    }

    #[tokio::test]
    async fn close_stops_workers_without_invalidating_buffer() {
        let (gen, _counter) = counting_generator();
        let pool = GeneratorPool::new(gen, PoolConfig::default(), 2);
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.close();
        // Buffered items and synchronous fallback still serve requests.
        assert!(pool.get().await.is_ok());
    }
}
