//! Per-identity event cooldown shared by every camera worker.
//!
//! A match first *claims* its dedup key: the cooldown check and the pending
//! mark happen under one lock, so two cameras can never both pass the check
//! for the same key. The claim is committed with the emission instant only
//! after the sink accepted the event; dropping an uncommitted claim restores
//! the previous entry so a failed write never suppresses a later retry.
//!
//! Workers check with their own frame instants, which can arrive out of order
//! across cameras. The ledger keeps a single monotonic clock: every check runs
//! at the latest instant it has seen, and claims commit at that same instant.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Whether suppression spans all cameras or applies per camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    /// One event per identity per window, whichever camera saw them.
    #[default]
    Global,
    /// One event per (identity, camera) per window.
    PerCamera,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub identity: Arc<str>,
    pub camera: Option<Arc<str>>,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Emitted(Instant),
    Pending { previous: Option<Instant> },
}

#[derive(Default)]
struct State {
    slots: HashMap<DedupKey, Slot>,
    last_sweep: Option<Instant>,
    clock: Option<Instant>,
}

impl State {
    /// Advance the ledger clock to `now` and return it; it never moves backwards.
    fn advance(&mut self, now: Instant) -> Instant {
        let now = self.clock.map_or(now, |clock| clock.max(now));
        self.clock = Some(now);
        now
    }

    /// Drop settled entries whose window has passed; runs at most once per window.
    fn sweep_if_due(&mut self, now: Instant, window: Duration) {
        let due = self
            .last_sweep
            .map_or(true, |t| now.saturating_duration_since(t) >= window);
        if due {
            self.sweep(now, window);
        }
    }

    fn sweep(&mut self, now: Instant, window: Duration) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot {
            Slot::Emitted(at) => now.saturating_duration_since(*at) < window,
            Slot::Pending { .. } => true,
        });
        self.last_sweep = Some(now);
        before - self.slots.len()
    }
}

/// Outcome of checking a key against the ledger.
#[derive(Debug)]
pub enum Decision<'l> {
    /// The caller owns the key until the claim is committed or dropped.
    Emit(Claim<'l>),
    /// An event for this key was emitted less than one window ago.
    Suppressed { remaining: Duration },
    /// Another worker holds an uncommitted claim on this key.
    InFlight,
}

pub struct CooldownLedger {
    window: Duration,
    scope: DedupScope,
    state: Mutex<State>,
}

impl std::fmt::Debug for CooldownLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CooldownLedger")
            .field("window", &self.window)
            .field("scope", &self.scope)
            .field("entries", &self.len())
            .finish()
    }
}

impl CooldownLedger {
    pub fn new(window: Duration, scope: DedupScope) -> Self {
        Self {
            window,
            scope,
            state: Mutex::new(State::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn scope(&self) -> DedupScope {
        self.scope
    }

    // Every critical section leaves `State` consistent, so a poisoned lock is safe to reuse.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Key for `identity` seen on `camera`, according to the ledger's scope.
    pub fn key(&self, identity: &Arc<str>, camera: &Arc<str>) -> DedupKey {
        DedupKey {
            identity: Arc::clone(identity),
            camera: match self.scope {
                DedupScope::Global => None,
                DedupScope::PerCamera => Some(Arc::clone(camera)),
            },
        }
    }

    /// Atomically check the cooldown for `key` at `now` and claim it if it may emit.
    ///
    /// A key may emit when it has no settled entry or when at least one full
    /// window has elapsed since its last emission. A `now` older than an
    /// instant the ledger already saw is treated as that later instant.
    pub fn check(&self, key: DedupKey, now: Instant) -> Decision<'_> {
        let mut state = self.lock();
        let now = state.advance(now);
        state.sweep_if_due(now, self.window);

        let previous = match state.slots.get(&key) {
            None => None,
            Some(Slot::Pending { .. }) => return Decision::InFlight,
            Some(Slot::Emitted(last)) => {
                let elapsed = now.saturating_duration_since(*last);
                if elapsed < self.window {
                    return Decision::Suppressed { remaining: self.window - elapsed };
                }
                Some(*last)
            }
        };

        state.slots.insert(key.clone(), Slot::Pending { previous });
        Decision::Emit(Claim {
            ledger: self,
            key: Some(key),
            previous,
            at: now,
        })
    }

    /// Last committed emission for `key`, if still tracked.
    pub fn last_emitted(&self, key: &DedupKey) -> Option<Instant> {
        match self.lock().slots.get(key) {
            Some(Slot::Emitted(at)) => Some(*at),
            Some(Slot::Pending { previous }) => *previous,
            None => None,
        }
    }

    /// Remove every settled entry older than the window; returns how many were dropped.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut state = self.lock();
        let now = state.advance(now);
        state.sweep(now, self.window)
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn settle(&self, key: DedupKey, slot: Option<Slot>) {
        let mut state = self.lock();
        match slot {
            Some(slot) => {
                state.slots.insert(key, slot);
            }
            None => {
                state.slots.remove(&key);
            }
        }
    }
}

/// Exclusive right to emit one event for a dedup key.
#[derive(Debug)]
pub struct Claim<'l> {
    ledger: &'l CooldownLedger,
    key: Option<DedupKey>,
    previous: Option<Instant>,
    at: Instant,
}

impl Claim<'_> {
    pub fn key(&self) -> Option<&DedupKey> {
        self.key.as_ref()
    }

    /// Ledger instant the claim was granted at.
    pub fn at(&self) -> Instant {
        self.at
    }

    /// Record a successful emission; the key is suppressed for one window from the claim instant.
    pub fn commit(mut self) {
        if let Some(key) = self.key.take() {
            self.ledger.settle(key, Some(Slot::Emitted(self.at)));
        }
    }
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.ledger.settle(key, self.previous.map(Slot::Emitted));
        }
    }
}
