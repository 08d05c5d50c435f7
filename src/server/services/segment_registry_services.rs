//! Short lived id -> upstream url table.
//!
//! Rewritten manifests only ever show clients an opaque id, the upstream url (which usually
//! carries session tokens) stays in here until it ages out.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::IdStrategy;

#[derive(Clone, Copy, Debug)]
pub struct SegmentRegistryConfig {
    /// entries older than this are gone, swept or not
    pub ttl: Duration,
    /// soft cap, only enforced by `sweep`
    pub max_entries: usize,
    pub id_strategy: IdStrategy,
}

impl Default for SegmentRegistryConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            max_entries: 1000,
            id_strategy: IdStrategy::Deterministic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentLookup {
    Found(String),
    /// the id was live at some point but its ttl ran out before anyone swept it
    Expired,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct SegmentEntry {
    pub id: String,
    pub url: String,
    /// insertion or last re-registration
    pub created_at: Instant,
    generation: u64,
}

#[derive(Default)]
struct RegistryTable {
    entries: HashMap<String, SegmentEntry>,
    // url -> id, only filled in deterministic mode
    by_url: HashMap<String, String>,
    // (id, generation) in created_at order. re-registering pushes a new marker so older markers
    // for the same id are stale and get skipped
    order: VecDeque<(String, u64)>,
    next_generation: u64,
}

impl RegistryTable {
    fn insert(&mut self, id: String, url: &str, now: Instant) {
        let generation = self.next_generation;
        self.next_generation += 1;

        self.order.push_back((id.clone(), generation));
        self.entries.insert(
            id.clone(),
            SegmentEntry {
                id,
                url: url.to_string(),
                created_at: now,
                generation,
            },
        );
    }

    fn remove(&mut self, id: &str) -> Option<SegmentEntry> {
        let entry = self.entries.remove(id)?;
        if self.by_url.get(&entry.url).is_some_and(|mapped| mapped == id) {
            self.by_url.remove(&entry.url);
        }
        Some(entry)
    }

    fn is_current(&self, id: &str, generation: u64) -> bool {
        self.entries
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
    }

    fn pop_oldest(&mut self) -> Option<SegmentEntry> {
        while let Some((id, generation)) = self.order.pop_front() {
            if self.is_current(&id, generation) {
                return self.remove(&id);
            }
        }
        None
    }

    fn compact(&mut self) {
        if self.order.len() <= self.entries.len() * 2 + 64 {
            return;
        }
        let order = std::mem::take(&mut self.order);
        self.order = order
            .into_iter()
            .filter(|(id, generation)| self.is_current(id, *generation))
            .collect();
    }
}

pub struct SegmentRegistry {
    config: SegmentRegistryConfig,
    table: Mutex<RegistryTable>,
}

impl SegmentRegistry {
    pub fn new(config: SegmentRegistryConfig) -> Self {
        Self {
            config,
            table: Mutex::new(RegistryTable::default()),
        }
    }

    pub fn config(&self) -> &SegmentRegistryConfig {
        &self.config
    }

    // nothing in here can leave the table half written, so a poisoned lock is still usable
    fn table(&self) -> MutexGuard<'_, RegistryTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands out the id a rewritten manifest should reference for `url`.
    ///
    /// Deterministic mode returns the same id for the same url (and refreshes its age), random
    /// mode mints a new one every call. Two different urls never share a live id.
    pub fn resolve_or_create(&self, url: &str) -> String {
        let now = Instant::now();
        let mut table = self.table();

        // the timer sweep is the real bound, this just stops a burst of huge manifests from
        // growing the table without limit between ticks
        if table.entries.len() >= self.config.max_entries.saturating_mul(2) {
            let removed = self.sweep_table(&mut table, now);
            warn!(
                "segment registry over twice its cap, swept {} entries inline",
                removed
            );
        }

        let id = match self.config.id_strategy {
            IdStrategy::Deterministic => match table.by_url.get(url) {
                Some(id) => id.clone(),
                None => Self::deterministic_id(&table, url),
            },
            IdStrategy::Random => Self::random_id(&table),
        };

        table.insert(id.clone(), url, now);
        if self.config.id_strategy == IdStrategy::Deterministic {
            table.by_url.insert(url.to_string(), id.clone());
        }
        // re-registrations leave stale order markers behind, keep them bounded between sweeps
        table.compact();

        id
    }

    pub fn lookup(&self, id: &str) -> SegmentLookup {
        let now = Instant::now();
        let mut table = self.table();

        let Some(entry) = table.entries.get(id) else {
            return SegmentLookup::NotFound;
        };

        // expired but not swept yet counts as gone
        if now.duration_since(entry.created_at) >= self.config.ttl {
            table.remove(id);
            debug!("segment {} expired on lookup", id);
            return SegmentLookup::Expired;
        }

        SegmentLookup::Found(entry.url.clone())
    }

    /// Drops expired entries, then the oldest ones until the table is back under its cap.
    /// Returns how many entries were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut table = self.table();
        self.sweep_table(&mut table, now)
    }

    pub fn len(&self) -> usize {
        self.table().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep_table(&self, table: &mut RegistryTable, now: Instant) -> usize {
        let mut removed = 0;

        while let Some((id, generation)) = table.order.front().cloned() {
            let expired = match table.entries.get(&id) {
                Some(entry) if entry.generation == generation => {
                    now.duration_since(entry.created_at) >= self.config.ttl
                }
                // stale marker, the entry was re-registered or already removed
                _ => {
                    table.order.pop_front();
                    continue;
                }
            };

            if !expired {
                break;
            }

            table.order.pop_front();
            table.remove(&id);
            removed += 1;
        }

        while table.entries.len() > self.config.max_entries {
            if table.pop_oldest().is_none() {
                break;
            }
            removed += 1;
        }

        table.compact();
        removed
    }

    fn deterministic_id(table: &RegistryTable, url: &str) -> String {
        let mut salt: u32 = 0;
        loop {
            let mut hasher = Sha256::new();
            hasher.update(url.as_bytes());
            if salt > 0 {
                hasher.update(salt.to_be_bytes());
            }
            let digest = hasher.finalize();
            let id = hex::encode(&digest[..12]);

            match table.entries.get(&id) {
                Some(entry) if entry.url != url => salt += 1,
                _ => return id,
            }
        }
    }

    fn random_id(table: &RegistryTable) -> String {
        loop {
            let id = nanoid::nanoid!();
            if !table.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

/// spawns the periodic sweep, the handle is only useful for aborting it
pub fn start_sweep_task(registry: Arc<SegmentRegistry>, every: Duration) -> JoinHandle<()> {
    info!("starting segment registry sweep every {:?}", every);

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let removed = registry.sweep();
            if removed > 0 {
                debug!(
                    "swept {} segment entries, {} left",
                    removed,
                    registry.len()
                );
            }
        }
    })
}
