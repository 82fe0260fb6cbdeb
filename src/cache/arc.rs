//! Adaptive Replacement Cache
//!
//! The in-memory tier's eviction engine: two resident lists (T1 recency,
//! T2 frequency), two ghost lists (B1, B2) holding identifiers and prior
//! sizes only, and a self-tuning target `p` that shifts budget between
//! recency and frequency as ghost rehits reveal which side is under-served.
//! All sizes are measured in bytes, not entries.

use crate::cache::heat::now_ms;
use crate::fingerprint::Fingerprint;
use bytes::Bytes;
use indexmap::IndexMap;
use parking_lot::Mutex;

// =============================================================================
// Entries
// =============================================================================

/// Resident entry: body plus access metadata
#[derive(Debug, Clone)]
struct Resident {
    body: Bytes,
    #[allow(dead_code)]
    inserted_ms: u64,
    #[allow(dead_code)]
    last_access_ms: u64,
}

impl Resident {
    fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

/// Ghost entry: prior size and eviction time, never bytes
#[derive(Debug, Clone, Copy)]
struct Ghost {
    prior_size: u64,
    #[allow(dead_code)]
    evicted_ms: u64,
}

// =============================================================================
// Cache Statistics
// =============================================================================

/// Point-in-time view of the four lists and the target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArcSnapshot {
    pub t1_bytes: u64,
    pub t2_bytes: u64,
    pub b1_bytes: u64,
    pub b2_bytes: u64,
    pub t1_entries: usize,
    pub t2_entries: usize,
    pub b1_entries: usize,
    pub b2_entries: usize,
    pub target_p: u64,
    pub capacity: u64,
}

impl ArcSnapshot {
    pub fn resident_bytes(&self) -> u64 {
        self.t1_bytes + self.t2_bytes
    }
}

// =============================================================================
// State
// =============================================================================

/// Lists are ordered front = LRU, back = MRU
struct ArcState {
    t1: IndexMap<Fingerprint, Resident>,
    t2: IndexMap<Fingerprint, Resident>,
    b1: IndexMap<Fingerprint, Ghost>,
    b2: IndexMap<Fingerprint, Ghost>,
    t1_bytes: u64,
    t2_bytes: u64,
    b1_bytes: u64,
    b2_bytes: u64,
    /// Target byte share for T1, clamped to [0, capacity]
    p: u64,
    capacity: u64,
}

impl ArcState {
    fn new(capacity: u64) -> Self {
        Self {
            t1: IndexMap::new(),
            t2: IndexMap::new(),
            b1: IndexMap::new(),
            b2: IndexMap::new(),
            t1_bytes: 0,
            t2_bytes: 0,
            b1_bytes: 0,
            b2_bytes: 0,
            p: 0,
            capacity,
        }
    }

    fn resident_bytes(&self) -> u64 {
        self.t1_bytes + self.t2_bytes
    }

    fn total_bytes(&self) -> u64 {
        self.resident_bytes() + self.b1_bytes + self.b2_bytes
    }

    /// Demote one resident entry to its ghost list.
    ///
    /// If T1 is over target (or exactly at target on a B2 rehit), its LRU
    /// moves to B1; otherwise T2's LRU moves to B2. Bodies are discarded.
    fn replace(&mut self, in_b2: bool, evicted: &mut Vec<Fingerprint>) {
        let from_t1 = self.t1_bytes > 0
            && (self.t1_bytes > self.p || (in_b2 && self.t1_bytes >= self.p));

        if from_t1 {
            if let Some((fp, entry)) = self.t1.shift_remove_index(0) {
                self.t1_bytes -= entry.size();
                self.b1_bytes += entry.size();
                self.b1.insert(
                    fp.clone(),
                    Ghost {
                        prior_size: entry.size(),
                        evicted_ms: now_ms(),
                    },
                );
                evicted.push(fp);
            }
        } else if let Some((fp, entry)) = self.t2.shift_remove_index(0) {
            self.t2_bytes -= entry.size();
            self.b2_bytes += entry.size();
            self.b2.insert(
                fp.clone(),
                Ghost {
                    prior_size: entry.size(),
                    evicted_ms: now_ms(),
                },
            );
            evicted.push(fp);
        }
    }

    /// Free resident room for `incoming` bytes
    fn make_room(&mut self, incoming: u64, in_b2: bool, evicted: &mut Vec<Fingerprint>) {
        while self.resident_bytes() + incoming > self.capacity {
            let before = self.resident_bytes();
            self.replace(in_b2, evicted);
            if self.resident_bytes() == before {
                break; // nothing left to demote
            }
        }
    }

    /// Ghost-retention rule: `|T1|+|B1| ≤ c` and the four lists together
    /// stay within `2c`, both measured in bytes (ghosts by prior size).
    fn trim_ghosts(&mut self) {
        while self.t1_bytes + self.b1_bytes > self.capacity && !self.b1.is_empty() {
            if let Some((_, ghost)) = self.b1.shift_remove_index(0) {
                self.b1_bytes -= ghost.prior_size;
            }
        }
        while self.total_bytes() > 2 * self.capacity {
            let trimmed = if !self.b2.is_empty() {
                self.b2.shift_remove_index(0).map(|(_, g)| {
                    self.b2_bytes -= g.prior_size;
                })
            } else if !self.b1.is_empty() {
                self.b1.shift_remove_index(0).map(|(_, g)| {
                    self.b1_bytes -= g.prior_size;
                })
            } else {
                None
            };
            if trimmed.is_none() {
                break;
            }
        }
    }
}

// =============================================================================
// Adaptive Cache
// =============================================================================

/// Thread-safe ARC over fingerprints.
///
/// One mutex guards the four lists and `p`; bodies are reference-counted
/// [`Bytes`], so nothing is copied while the lock is held.
pub struct AdaptiveCache {
    state: Mutex<ArcState>,
}

impl AdaptiveCache {
    /// Cache with a resident budget of `capacity` bytes
    pub fn new(capacity: u64) -> Self {
        Self {
            state: Mutex::new(ArcState::new(capacity)),
        }
    }

    /// Look up a resident entry.
    ///
    /// A T1 hit promotes recent→frequent (moves to T2 MRU); a T2 hit renews
    /// its MRU position. Misses leave admission to the caller.
    pub fn lookup(&self, fp: &Fingerprint) -> Option<Bytes> {
        let mut state = self.state.lock();
        let now = now_ms();

        if let Some(mut entry) = state.t1.shift_remove(fp) {
            entry.last_access_ms = now;
            let size = entry.size();
            let body = entry.body.clone();
            state.t1_bytes -= size;
            state.t2_bytes += size;
            state.t2.insert(fp.clone(), entry);
            return Some(body);
        }

        if let Some(mut entry) = state.t2.shift_remove(fp) {
            entry.last_access_ms = now;
            let body = entry.body.clone();
            state.t2.insert(fp.clone(), entry);
            return Some(body);
        }

        None
    }

    /// Admit a body obtained after a miss. Never fails; oversized bodies are
    /// simply not admitted. Returns the fingerprints evicted from the
    /// resident lists (demoted to a ghost, or dropped outright when the
    /// recency side owns the whole budget).
    pub fn admit(&self, fp: &Fingerprint, body: Bytes) -> Vec<Fingerprint> {
        let size = body.len() as u64;
        let mut evicted = Vec::new();
        let mut state = self.state.lock();

        if size > state.capacity {
            return evicted;
        }

        // A concurrent caller may have admitted the same fingerprint already;
        // treat this as an access.
        if state.t1.contains_key(fp) || state.t2.contains_key(fp) {
            drop(state);
            self.lookup(fp);
            return evicted;
        }

        let now = now_ms();
        let entry = Resident {
            body,
            inserted_ms: now,
            last_access_ms: now,
        };

        if let Some(ghost) = state.b1.shift_remove(fp) {
            // Recency ghost rehit: grow the T1 target
            state.b1_bytes -= ghost.prior_size;
            let ratio = if state.b1.is_empty() {
                1
            } else {
                (state.b2.len() / state.b1.len().max(1)).max(1) as u64
            };
            state.p = state.capacity.min(state.p.saturating_add(ratio * size));
            state.make_room(size, false, &mut evicted);
            state.t2_bytes += size;
            state.t2.insert(fp.clone(), entry);
        } else if let Some(ghost) = state.b2.shift_remove(fp) {
            // Frequency ghost rehit: shrink the T1 target
            state.b2_bytes -= ghost.prior_size;
            let ratio = if state.b2.is_empty() {
                1
            } else {
                (state.b1.len() / state.b2.len().max(1)).max(1) as u64
            };
            state.p = state.p.saturating_sub(ratio * size);
            state.make_room(size, true, &mut evicted);
            state.t2_bytes += size;
            state.t2.insert(fp.clone(), entry);
        } else {
            // Cold miss: |T1|+|B1| may not pass c, so make ghost room first.
            // B1's LRU goes; with B1 empty, T1's LRU body is dropped outright
            // (no ghost), exactly as when the recency side owns the whole
            // budget.
            while state.t1_bytes + state.b1_bytes + size > state.capacity {
                if let Some((_, ghost)) = state.b1.shift_remove_index(0) {
                    state.b1_bytes -= ghost.prior_size;
                } else if let Some((dropped_fp, dropped)) = state.t1.shift_remove_index(0) {
                    state.t1_bytes -= dropped.size();
                    evicted.push(dropped_fp);
                } else {
                    break;
                }
            }
            if state.total_bytes() + size > 2 * state.capacity {
                if let Some((_, ghost)) = state.b2.shift_remove_index(0) {
                    state.b2_bytes -= ghost.prior_size;
                }
            }
            state.make_room(size, false, &mut evicted);
            state.t1_bytes += size;
            state.t1.insert(fp.clone(), entry);
        }

        state.trim_ghosts();
        evicted
    }

    /// Remove an entry and any ghost trace (explicit remove path)
    pub fn remove(&self, fp: &Fingerprint) -> bool {
        let mut state = self.state.lock();
        let mut found = false;
        if let Some(entry) = state.t1.shift_remove(fp) {
            state.t1_bytes -= entry.size();
            found = true;
        }
        if let Some(entry) = state.t2.shift_remove(fp) {
            state.t2_bytes -= entry.size();
            found = true;
        }
        if let Some(ghost) = state.b1.shift_remove(fp) {
            state.b1_bytes -= ghost.prior_size;
        }
        if let Some(ghost) = state.b2.shift_remove(fp) {
            state.b2_bytes -= ghost.prior_size;
        }
        found
    }

    /// Resident check without touching recency
    pub fn contains(&self, fp: &Fingerprint) -> bool {
        let state = self.state.lock();
        state.t1.contains_key(fp) || state.t2.contains_key(fp)
    }

    /// Bytes currently resident (T1 ∪ T2)
    pub fn resident_bytes(&self) -> u64 {
        self.state.lock().resident_bytes()
    }

    /// Snapshot of list sizes and the adaptive target
    pub fn snapshot(&self) -> ArcSnapshot {
        let state = self.state.lock();
        ArcSnapshot {
            t1_bytes: state.t1_bytes,
            t2_bytes: state.t2_bytes,
            b1_bytes: state.b1_bytes,
            b2_bytes: state.b2_bytes,
            t1_entries: state.t1.len(),
            t2_entries: state.t2.len(),
            b1_entries: state.b1.len(),
            b2_entries: state.b2.len(),
            target_p: state.p,
            capacity: state.capacity,
        }
    }
}
