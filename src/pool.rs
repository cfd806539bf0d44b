//! The keep-alive connection pool.
//!
//! One process-wide pool maps origin keys to buckets. H1 connections
//! are exclusively owned: by the pool while idle, by a request while in
//! use. H2 connections are registered shareable and multiplexed until
//! the peer's stream limit. Active connections (idle plus in-use plus
//! dialing) are capped per origin; saturated checkouts queue FIFO.
//!
//! Accounting is guard-based: every active slot is represented by an
//! [`ActiveGuard`], so a connection dropped anywhere (mid-body, failed
//! dial, reaper) releases its slot without cooperation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::connect::OriginKey;
use crate::proto::h1::Http1Conn;
use crate::proto::h2;

#[derive(Debug, Clone, Copy)]
pub(crate) struct PoolConfig {
    /// Cap on active connections per origin; zero means unlimited.
    pub(crate) max_conns_per_host: usize,
    /// Cap on idle H1 connections per origin.
    pub(crate) max_idle_per_host: usize,
    pub(crate) idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns_per_host: 0,
            max_idle_per_host: 2,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

struct IdleConn {
    conn: Http1Conn,
    guard: ActiveGuard,
    since: Instant,
}

enum Handed {
    Conn(Box<IdleConn>),
    H2(h2::SendRequest),
    Permit(ActiveGuard),
}

#[derive(Default)]
struct Bucket {
    /// LIFO: the most recently used connection is tried first.
    idle: Vec<IdleConn>,
    /// FIFO queue of saturated checkouts.
    waiters: VecDeque<oneshot::Sender<Handed>>,
    /// idle + in-use + dialing.
    active: usize,
    h2: Option<h2::SendRequest>,
    /// An H2-capable dial is in flight; peers wait to share it instead
    /// of opening sibling connections.
    h2_dialing: bool,
}

pub(crate) struct Pool {
    inner: Arc<PoolInner>,
}

impl Clone for Pool {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    buckets: Mutex<HashMap<OriginKey, Bucket>>,
    reaper_started: std::sync::atomic::AtomicBool,
    self_weak: Weak<PoolInner>,
}

/// What a checkout resolved to.
pub(crate) enum Checkout {
    /// A kept-alive H1 connection; idle duration is `None` when it was
    /// handed over hot from another request.
    H1(Http1Conn, ActiveGuard, Option<Duration>),
    /// A shareable H2 connection.
    H2(h2::SendRequest),
    /// Permission to dial a fresh connection.
    Dial(DialPermit),
}

impl Pool {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new_cyclic(|self_weak| PoolInner {
                config,
                buckets: Mutex::new(HashMap::new()),
                reaper_started: std::sync::atomic::AtomicBool::new(false),
                self_weak: self_weak.clone(),
            }),
        }
    }

    /// Acquires a transport for `key`: a shareable H2 connection, a
    /// live idle H1 connection, a dial permit, or (when the origin is
    /// saturated) a FIFO slot in the wait queue. `h2_able` marks
    /// origins that may negotiate H2, enabling dial coalescing.
    pub(crate) async fn checkout(&self, key: &OriginKey, h2_able: bool) -> Checkout {
        self.ensure_reaper();
        loop {
            let rx = {
                let mut buckets = self.inner.buckets.lock();
                let bucket = buckets.entry(key.clone()).or_default();

                if let Some(sender) = &bucket.h2 {
                    if !sender.is_usable() {
                        bucket.h2 = None;
                    } else if sender.has_capacity() {
                        return Checkout::H2(sender.clone());
                    }
                }

                // LIFO reuse; dead entries are discarded on the spot.
                while let Some(mut idle) = bucket.idle.pop() {
                    if idle.conn.is_open() {
                        tracing::trace!("reusing idle connection; origin={:?}", key.authority());
                        let idle_for = idle.since.elapsed();
                        return Checkout::H1(idle.conn, idle.guard, Some(idle_for));
                    }
                    tracing::trace!("discarding dead idle connection");
                    idle.guard.disarm();
                    bucket.active = bucket.active.saturating_sub(1);
                }

                let cap = self.inner.config.max_conns_per_host;
                let below_cap = cap == 0 || bucket.active < cap;

                if below_cap && !(h2_able && bucket.h2_dialing) {
                    bucket.active += 1;
                    if h2_able {
                        bucket.h2_dialing = true;
                    }
                    let guard = self.guard(key);
                    return Checkout::Dial(DialPermit {
                        pool: Arc::downgrade(&self.inner),
                        key: key.clone(),
                        guard: Some(guard),
                        coalescing: h2_able,
                        settled: false,
                    });
                }

                let (tx, rx) = oneshot::channel();
                bucket.waiters.push_back(tx);
                rx
            };

            match rx.await {
                Ok(Handed::Conn(idle)) => {
                    let mut idle = *idle;
                    if idle.conn.is_open() {
                        return Checkout::H1(idle.conn, idle.guard, Some(idle.since.elapsed()));
                    }
                    idle.guard.disarm();
                    self.inner.dec_active(&idle.guard.key);
                }
                Ok(Handed::H2(sender)) => {
                    if sender.is_usable() {
                        return Checkout::H2(sender);
                    }
                }
                Ok(Handed::Permit(guard)) => {
                    return Checkout::Dial(DialPermit {
                        pool: Arc::downgrade(&self.inner),
                        key: key.clone(),
                        guard: Some(guard),
                        coalescing: false,
                        settled: true,
                    });
                }
                Err(_) => {
                    // pool side dropped the sender; retry from scratch
                }
            }
        }
    }

    /// Returns a healthy, fully-drained H1 connection. A queued waiter
    /// gets it directly; otherwise it parks on the idle list, evicting
    /// the oldest entry when the idle cap is reached.
    pub(crate) fn checkin(&self, key: &OriginKey, conn: Http1Conn, guard: ActiveGuard) {
        let mut buckets = self.inner.buckets.lock();
        let bucket = buckets.entry(key.clone()).or_default();

        let mut handed = Handed::Conn(Box::new(IdleConn {
            conn,
            guard,
            since: Instant::now(),
        }));
        while let Some(waiter) = bucket.waiters.pop_front() {
            match waiter.send(handed) {
                Ok(()) => return,
                Err(returned) => handed = returned,
            }
        }

        let Handed::Conn(idle) = handed else { return };
        if bucket.idle.len() >= self.inner.config.max_idle_per_host.max(1) {
            // oldest idle entry makes room
            let mut oldest = bucket.idle.remove(0);
            oldest.guard.disarm();
            bucket.active = bucket.active.saturating_sub(1);
        }
        bucket.idle.push(*idle);
    }

    /// Registers a freshly negotiated H2 connection as shareable and
    /// hands clones to everyone queued on this origin.
    fn register_h2(&self, key: &OriginKey, sender: h2::SendRequest) {
        let mut buckets = self.inner.buckets.lock();
        let bucket = buckets.entry(key.clone()).or_default();
        bucket.h2 = Some(sender.clone());
        bucket.h2_dialing = false;
        while let Some(waiter) = bucket.waiters.pop_front() {
            let _ = waiter.send(Handed::H2(sender.clone()));
        }
    }

    /// Global sweep: closes every idle connection and drops shareable
    /// H2 registrations.
    pub(crate) fn close_idle(&self) {
        let mut buckets = self.inner.buckets.lock();
        for bucket in buckets.values_mut() {
            for mut idle in bucket.idle.drain(..) {
                idle.guard.disarm();
                bucket.active = bucket.active.saturating_sub(1);
            }
            bucket.h2 = None;
        }
    }

    fn guard(&self, key: &OriginKey) -> ActiveGuard {
        ActiveGuard {
            pool: Arc::downgrade(&self.inner),
            key: key.clone(),
            armed: true,
        }
    }

    /// Spawns the background reaper on first use (a runtime is
    /// guaranteed to exist by then).
    fn ensure_reaper(&self) {
        use std::sync::atomic::Ordering;
        if self
            .inner
            .reaper_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let pool = Arc::downgrade(&self.inner);
        let period = self.inner.config.idle_timeout;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                pool.reap();
            }
        });
    }
}

impl PoolInner {
    /// Releases one active slot; a queued waiter is promoted to a dial
    /// permit.
    fn dec_active(&self, key: &OriginKey) {
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(key) {
            bucket.active = bucket.active.saturating_sub(1);
            self.wake_with_permits(key, bucket);
        }
    }

    /// Promotes waiters to dial permits while the cap allows.
    fn wake_with_permits(&self, key: &OriginKey, bucket: &mut Bucket) {
        let cap = self.config.max_conns_per_host;
        while !bucket.waiters.is_empty() && (cap == 0 || bucket.active < cap) {
            let Some(waiter) = bucket.waiters.pop_front() else {
                break;
            };
            bucket.active += 1;
            let guard = ActiveGuard {
                pool: self.self_weak.clone(),
                key: key.clone(),
                armed: true,
            };
            if let Err(returned) = waiter.send(Handed::Permit(guard)) {
                // disarm before dropping: the guard would otherwise
                // re-enter the pool lock
                if let Handed::Permit(mut guard) = returned {
                    guard.disarm();
                }
                bucket.active = bucket.active.saturating_sub(1);
            }
        }
    }

    /// A dial finished without producing a shareable H2 connection:
    /// clear the coalescing latch and let queued peers dial for
    /// themselves.
    fn dial_settled_non_h2(&self, key: &OriginKey, was_coalescing: bool) {
        if !was_coalescing {
            return;
        }
        let mut buckets = self.buckets.lock();
        if let Some(bucket) = buckets.get_mut(key) {
            bucket.h2_dialing = false;
            self.wake_with_permits(key, bucket);
        }
    }

    fn reap(&self) {
        let timeout = self.config.idle_timeout;
        let mut buckets = self.buckets.lock();
        for (key, bucket) in buckets.iter_mut() {
            let before = bucket.idle.len();
            bucket.idle.retain_mut(|idle| {
                if idle.since.elapsed() >= timeout {
                    idle.guard.disarm();
                    false
                } else {
                    true
                }
            });
            let reaped = before - bucket.idle.len();
            if reaped > 0 {
                tracing::debug!("reaped {reaped} idle connections; origin={:?}", key.authority());
                bucket.active = bucket.active.saturating_sub(reaped);
                self.wake_with_permits(key, bucket);
            }
            if bucket.h2.as_ref().is_some_and(|h2| !h2.is_usable()) {
                bucket.h2 = None;
            }
        }
        buckets.retain(|_, bucket| {
            !bucket.idle.is_empty()
                || bucket.active > 0
                || bucket.h2.is_some()
                || !bucket.waiters.is_empty()
        });
    }
}

/// One active-connection slot. Dropping it (connection died, dial
/// failed, idle entry reaped) releases the slot and promotes a waiter.
pub(crate) struct ActiveGuard {
    pool: Weak<PoolInner>,
    key: OriginKey,
    armed: bool,
}

impl ActiveGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.dec_active(&self.key);
        }
    }
}

/// Permission to dial one fresh connection. The holder must settle the
/// permit (H1 taken, H2 registered) or let it drop on failure, which
/// releases the slot and the coalescing latch.
pub(crate) struct DialPermit {
    pool: Weak<PoolInner>,
    key: OriginKey,
    guard: Option<ActiveGuard>,
    coalescing: bool,
    settled: bool,
}

impl DialPermit {
    /// The dial produced an H1 connection; the caller keeps it. Returns
    /// the active-slot guard that must accompany the connection.
    pub(crate) fn take_h1(mut self) -> ActiveGuard {
        self.settled = true;
        if let Some(pool) = self.pool.upgrade() {
            pool.dial_settled_non_h2(&self.key, self.coalescing);
        }
        self.guard.take().unwrap_or_else(|| ActiveGuard {
            pool: Weak::new(),
            key: self.key.clone(),
            armed: false,
        })
    }

    /// The dial negotiated H2: register the sender as shareable and get
    /// back the guard to tie to the connection driver's lifetime.
    pub(crate) fn register_h2(mut self, pool: &Pool, sender: &h2::SendRequest) -> ActiveGuard {
        self.settled = true;
        pool.register_h2(&self.key, sender.clone());
        self.guard.take().unwrap_or_else(|| ActiveGuard {
            pool: Weak::new(),
            key: self.key.clone(),
            armed: false,
        })
    }
}

impl Drop for DialPermit {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        // dial failed or was abandoned
        if let Some(pool) = self.pool.upgrade() {
            pool.dial_settled_non_h2(&self.key, self.coalescing);
        }
        // `guard` (if still present) drops armed and releases the slot
    }
}
