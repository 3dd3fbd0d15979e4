//! Bounded resource pool for expensive per-session resources (VAD detectors,
//! TTS websocket connections).
//!
//! Resources are checked out as [`Pooled`] guards that return themselves to the
//! pool on drop. Waiters are woken through a [`Notify`] when capacity frees up.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PoolError {
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
    #[error("acquire timeout after {0:?}")]
    Timeout(Duration),
    #[error("Pool is closed")]
    Closed,
    #[error("Failed to create resource: {0}")]
    Create(String),
    #[error("Failed to reset resource: {0}")]
    Reset(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: usize,
    pub min_size: usize,
    pub max_idle: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub validate_on_borrow: bool,
    pub validate_on_return: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            min_size: 1,
            max_idle: 5,
            acquire_timeout_ms: 30_000,
            idle_timeout_secs: 300,
            validate_on_borrow: true,
            validate_on_return: false,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be greater than 0".into()));
        }
        if self.min_size > self.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        if self.max_idle > self.max_size {
            return Err(PoolError::InvalidConfig(format!(
                "max_idle ({}) cannot exceed max_size ({})",
                self.max_idle, self.max_size
            )));
        }
        if self.acquire_timeout_ms == 0 {
            return Err(PoolError::InvalidConfig("acquire_timeout_ms must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Supplies, checks and recycles pooled resources.
#[async_trait::async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + 'static;

    async fn create(&self) -> Result<Self::Resource, PoolError>;

    fn validate(&self, _resource: &Self::Resource) -> bool {
        true
    }

    fn reset(&self, _resource: &mut Self::Resource) -> Result<(), PoolError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub in_use: usize,
    pub max_size: usize,
    pub min_size: usize,
    pub max_idle: usize,
    pub closed: bool,
}

struct IdleEntry<R> {
    resource: R,
    since: Instant,
}

struct PoolInner<R> {
    config: PoolConfig,
    idle: VecDeque<IdleEntry<R>>,
    total: usize,
    in_use: usize,
    closed: bool,
}

pub struct ResourcePool<F: ResourceFactory> {
    name: String,
    factory: F,
    inner: Mutex<PoolInner<F::Resource>>,
    available: Notify,
    shutdown: CancellationToken,
}

enum Step<R> {
    Ready(R),
    Create,
    Wait,
}

impl<F: ResourceFactory> ResourcePool<F> {
    /// Build the pool, pre-create `min_size` resources and start the idle sweeper.
    pub async fn new(name: impl Into<String>, config: PoolConfig, factory: F) -> Result<Arc<Self>, PoolError> {
        config.validate()?;

        let mut idle = VecDeque::with_capacity(config.min_size);
        for _ in 0..config.min_size {
            idle.push_back(IdleEntry {
                resource: factory.create().await?,
                since: Instant::now(),
            });
        }

        let idle_timeout = config.idle_timeout();
        let pool = Arc::new(Self {
            name: name.into(),
            factory,
            inner: Mutex::new(PoolInner {
                total: idle.len(),
                idle,
                in_use: 0,
                closed: false,
                config,
            }),
            available: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        if !idle_timeout.is_zero() {
            spawn_sweeper(Arc::downgrade(&pool), pool.shutdown.clone(), idle_timeout);
        }

        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.inner.lock().config.acquire_timeout()
    }

    /// Check out a resource, waiting up to `timeout` for capacity.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<Pooled<F>, PoolError> {
        let deadline = Instant::now() + timeout;

        loop {
            let step = {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return Err(PoolError::Closed);
                }
                self.take_idle(&mut inner)
            };

            match step {
                Step::Ready(resource) => return Ok(Pooled::new(self, resource)),
                Step::Create => match self.factory.create().await {
                    Ok(resource) => return Ok(Pooled::new(self, resource)),
                    Err(e) => {
                        let mut inner = self.inner.lock();
                        inner.total -= 1;
                        inner.in_use -= 1;
                        drop(inner);
                        self.available.notify_one();
                        return Err(e);
                    }
                },
                Step::Wait => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        warn!(pool = %self.name, "Resource pool exhausted");
                        return Err(PoolError::Timeout(timeout));
                    }
                    if tokio::time::timeout(remaining, self.available.notified())
                        .await
                        .is_err()
                    {
                        warn!(pool = %self.name, "Resource pool exhausted");
                        return Err(PoolError::Timeout(timeout));
                    }
                }
            }
        }
    }

    /// Pop a usable idle resource or reserve a creation slot. Reservations are
    /// counted in `total` and `in_use` before the lock is released.
    fn take_idle(&self, inner: &mut PoolInner<F::Resource>) -> Step<F::Resource> {
        while let Some(mut entry) = inner.idle.pop_front() {
            if inner.config.validate_on_borrow && !self.factory.validate(&entry.resource) {
                debug!(pool = %self.name, "Discarding resource that failed validation");
                inner.total -= 1;
                continue;
            }
            if let Err(e) = self.factory.reset(&mut entry.resource) {
                debug!(pool = %self.name, "Discarding resource that failed reset: {}", e);
                inner.total -= 1;
                continue;
            }
            inner.in_use += 1;
            return Step::Ready(entry.resource);
        }

        if inner.total < inner.config.max_size {
            inner.total += 1;
            inner.in_use += 1;
            return Step::Create;
        }

        Step::Wait
    }

    fn give_back(&self, resource: F::Resource, discard: bool) {
        let mut inner = self.inner.lock();
        inner.in_use = inner.in_use.saturating_sub(1);

        let keep = !discard
            && !inner.closed
            && inner.total <= inner.config.max_size
            && inner.idle.len() < inner.config.max_idle
            && (!inner.config.validate_on_return || self.factory.validate(&resource));

        if keep {
            inner.idle.push_back(IdleEntry {
                resource,
                since: Instant::now(),
            });
        } else {
            inner.total = inner.total.saturating_sub(1);
            drop(resource);
        }
        drop(inner);
        self.available.notify_one();
    }

    /// Change the maximum size. Shrinking drops idle resources down to the new
    /// bound; checked-out resources are destroyed when they come back.
    pub fn resize(&self, max_size: usize) -> Result<(), PoolError> {
        if max_size == 0 {
            return Err(PoolError::InvalidConfig("max_size must be greater than 0".into()));
        }
        let mut inner = self.inner.lock();
        inner.config.max_size = max_size;
        inner.config.min_size = inner.config.min_size.min(max_size);
        inner.config.max_idle = inner.config.max_idle.min(max_size);

        while inner.total > max_size && inner.idle.pop_back().is_some() {
            inner.total -= 1;
        }
        while inner.idle.len() > inner.config.max_idle && inner.idle.pop_back().is_some() {
            inner.total -= 1;
        }
        drop(inner);
        self.available.notify_waiters();
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            total: inner.total,
            available: inner.idle.len(),
            in_use: inner.in_use,
            max_size: inner.config.max_size,
            min_size: inner.config.min_size,
            max_idle: inner.config.max_idle,
            closed: inner.closed,
        }
    }

    /// Destroy idle resources and refuse further checkouts. Idempotent.
    pub fn close(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            let drained: Vec<_> = inner.idle.drain(..).collect();
            inner.total -= drained.len();
            drained
        };
        drop(drained);
        self.shutdown.cancel();
        self.available.notify_waiters();
        debug!(pool = %self.name, "Resource pool closed");
    }

    fn evict_idle(&self, idle_timeout: Duration) -> usize {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let mut evicted = 0;
        while inner.total > inner.config.min_size {
            match inner.idle.front() {
                Some(entry) if now.duration_since(entry.since) >= idle_timeout => {
                    inner.idle.pop_front();
                    inner.total -= 1;
                    evicted += 1;
                }
                _ => break,
            }
        }
        evicted
    }
}

fn spawn_sweeper<F: ResourceFactory>(
    pool: Weak<ResourcePool<F>>,
    shutdown: CancellationToken,
    idle_timeout: Duration,
) {
    let period = (idle_timeout / 2).max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(pool) = pool.upgrade() else { break };
                    let evicted = pool.evict_idle(idle_timeout);
                    if evicted > 0 {
                        debug!(pool = %pool.name, evicted, "Evicted idle resources");
                    }
                }
            }
        }
    });
}

impl<F: ResourceFactory> Drop for ResourcePool<F> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A checked-out resource. Returns to the pool on drop.
pub struct Pooled<F: ResourceFactory> {
    pool: Arc<ResourcePool<F>>,
    resource: Option<F::Resource>,
    discard: bool,
}

impl<F: ResourceFactory> Pooled<F> {
    fn new(pool: &Arc<ResourcePool<F>>, resource: F::Resource) -> Self {
        Self {
            pool: Arc::clone(pool),
            resource: Some(resource),
            discard: false,
        }
    }

    /// Destroy the resource instead of returning it (e.g. a broken connection).
    pub fn discard(mut self) {
        self.discard = true;
    }
}

impl<F: ResourceFactory> Deref for Pooled<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        // Only `None` after drop has taken it.
        self.resource.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<F: ResourceFactory> DerefMut for Pooled<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<F: ResourceFactory> Drop for Pooled<F> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.give_back(resource, self.discard);
        }
    }
}
