//! Method resolution cache in front of the rule tables
//!
//! Every method the runtime reports is classified once. The verdict is
//! cached under a 64-bit FNV-1a key so the hot path only pays for a
//! lock-free skip-list lookup after the first sighting.
//!
//! # Design
//!
//! ```text
//! hot path ──► entries.get(key) ──hit──► CacheEntry
//!                    │
//!                   miss
//!                    ▼
//!             state.lock()  (rules + function id counter)
//!               double-check, classify, allocate id,
//!               pre-encode METHODINFO, insert
//! ```
//!
//! Rule mutations take the same lock and drop every cached entry, so no
//! method keeps a verdict computed under an older rule table. Function ids
//! keep counting across flushes and are never reused.

use crate::event::{Body, Event};
use crate::filter::{fully_qualified, RuleKind, RuleSet, Verdict};
use crate::protocol::{MethodSource, MAX_STRING_SIZE, TRACE_ENTRYPOINT};
use crate::wire::{truncated, WireStr};
use crossbeam_skiplist::SkipMap;
use fnv::FnvHasher;
use parking_lot::Mutex;
use serde::Serialize;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Fully-qualified names of synchronization primitives
pub const SYNCHRONIZATION_METHODS: &[&str] = &[
    "Object#sleep",
    "Thread::Mutex#synchronize",
    "Thread::Mutex#lock",
    "Thread::Mutex#unlock",
    "Thread::Mutex#sleep",
];

/// How cache keys are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum HashStrategy {
    /// Hash the runtime's namespace and method identities (stable for the
    /// process lifetime)
    #[default]
    Identity,
    /// Hash the path and method names (survives code reloading)
    Name,
}

/// Identity of a method as reported by the runtime hook
#[derive(Debug, Clone, Copy)]
pub struct MethodKey<'a> {
    pub namespace_id: u64,
    pub method_id: u64,
    pub path: &'a str,
    pub method: &'a str,
}

impl<'a> MethodKey<'a> {
    pub fn new(namespace_id: u64, method_id: u64, path: &'a str, method: &'a str) -> Self {
        Self {
            namespace_id,
            method_id,
            path,
            method,
        }
    }

    /// 64-bit cache key under the given strategy
    pub fn hash(&self, strategy: HashStrategy) -> u64 {
        let mut hasher = FnvHasher::default();
        match strategy {
            HashStrategy::Identity => {
                hasher.write_u64(self.namespace_id);
                hasher.write_u64(self.method_id);
            }
            HashStrategy::Name => {
                hasher.write(self.path.as_bytes());
                hasher.write_u8(b'#');
                hasher.write(self.method.as_bytes());
            }
        }
        hasher.finish()
    }
}

/// A method that passed classification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRecord {
    pub function_id: u32,
    pub source: MethodSource,
    pub verdict: Verdict,
    /// Fully-qualified name, bounded by the string limit
    pub name: String,
    /// Pre-encoded METHODINFO event, replayed on resync
    pub methodinfo: Box<[u8]>,
}

impl MethodRecord {
    pub fn is_library(&self) -> bool {
        self.source == MethodSource::KnownLibrary
    }

    pub fn is_synchronization(&self) -> bool {
        self.source == MethodSource::Synchronization
    }
}

/// Cached outcome for one method key
#[derive(Debug, Clone)]
pub enum CacheEntry {
    Blacklisted,
    Resolved(Arc<MethodRecord>),
}

impl CacheEntry {
    pub fn record(&self) -> Option<&Arc<MethodRecord>> {
        match self {
            CacheEntry::Blacklisted => None,
            CacheEntry::Resolved(record) => Some(record),
        }
    }
}

/// Header fields stamped on a freshly encoded METHODINFO event
#[derive(Debug, Clone, Copy)]
pub struct EventStamp {
    pub pid: u32,
    pub tid: u32,
    pub timestamp: i64,
}

/// Result of a cache lookup-or-insert
#[derive(Debug, Clone)]
pub struct Resolution {
    pub entry: CacheEntry,
    /// True when this call created the entry
    pub fresh: bool,
}

struct ClassifierState {
    rules: RuleSet,
    next_function_id: u32,
}

/// Rule tables plus the method resolution cache
pub struct Classifier {
    entries: SkipMap<u64, CacheEntry>,
    state: Mutex<ClassifierState>,
    strategy: AtomicU8,
    log_decisions: AtomicBool,
    blacklisted: AtomicU64,
    flushes: AtomicU64,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(HashStrategy::default())
    }
}

impl Classifier {
    pub fn new(strategy: HashStrategy) -> Self {
        Self {
            entries: SkipMap::new(),
            state: Mutex::new(ClassifierState {
                rules: RuleSet::new(),
                next_function_id: 0,
            }),
            strategy: AtomicU8::new(strategy as u8),
            log_decisions: AtomicBool::new(false),
            blacklisted: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> HashStrategy {
        if self.strategy.load(Ordering::Relaxed) == HashStrategy::Name as u8 {
            HashStrategy::Name
        } else {
            HashStrategy::Identity
        }
    }

    /// Switch key derivation; cached entries are dropped since their keys
    /// no longer match
    pub fn set_strategy(&self, strategy: HashStrategy) {
        let mut state = self.state.lock();
        if self.strategy() != strategy {
            self.strategy.store(strategy as u8, Ordering::Relaxed);
            self.flush_locked(&mut state);
        }
    }

    /// Log every classification decision at debug level
    pub fn set_log_decisions(&self, enabled: bool) {
        self.log_decisions.store(enabled, Ordering::Relaxed);
    }

    /// Lock-free cache probe
    pub fn lookup(&self, key: &MethodKey<'_>) -> Option<CacheEntry> {
        let hash = key.hash(self.strategy());
        self.entries.get(&hash).map(|e| e.value().clone())
    }

    /// Cached entry for `key`, classifying and inserting it on a miss
    pub fn resolve(&self, key: &MethodKey<'_>, stamp: EventStamp) -> Resolution {
        if let Some(entry) = self.lookup(key) {
            return Resolution {
                entry,
                fresh: false,
            };
        }

        let mut state = self.state.lock();
        let hash = key.hash(self.strategy());
        // Another thread may have won the race for this method
        if let Some(existing) = self.entries.get(&hash) {
            return Resolution {
                entry: existing.value().clone(),
                fresh: false,
            };
        }

        let fq = fully_qualified(key.path, key.method);
        let verdict = state.rules.classify(&fq, key.path, key.method);
        let entry = if verdict.is_blacklisted() {
            self.blacklisted.fetch_add(1, Ordering::Relaxed);
            CacheEntry::Blacklisted
        } else {
            state.next_function_id += 1;
            let function_id = state.next_function_id;
            let source = derive_source(&state.rules, key, &fq);
            let methodinfo = Event::new(
                stamp.pid,
                stamp.tid,
                stamp.timestamp,
                Body::MethodInfo {
                    function_id,
                    class_name: WireStr::from(key.path),
                    method_name: WireStr::from(key.method),
                    source,
                },
            )
            .encode_to_vec()
            .into_boxed_slice();
            let name = String::from_utf8_lossy(truncated(fq.as_bytes(), MAX_STRING_SIZE))
                .into_owned();
            CacheEntry::Resolved(Arc::new(MethodRecord {
                function_id,
                source,
                verdict,
                name,
                methodinfo,
            }))
        };

        if self.log_decisions.load(Ordering::Relaxed) {
            match &entry {
                CacheEntry::Blacklisted => debug!(method = %fq, "blacklisted method"),
                CacheEntry::Resolved(r) => debug!(
                    method = %fq,
                    function_id = r.function_id,
                    source = %r.source,
                    %verdict,
                    "whitelisted method"
                ),
            }
        }

        self.entries.insert(hash, entry.clone());
        Resolution { entry, fresh: true }
    }

    /// Add a rule and flush the cache
    pub fn add_rule(
        &self,
        path: Option<&str>,
        method: Option<&str>,
        verdict: Verdict,
    ) -> crate::Result<RuleKind> {
        let mut state = self.state.lock();
        let kind = state.rules.add_rule(path, method, verdict)?;
        self.flush_locked(&mut state);
        Ok(kind)
    }

    /// Register library prefixes and flush the cache
    pub fn register_libraries<I, S>(&self, prefixes: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.lock();
        let added = state.rules.register_libraries(prefixes);
        self.flush_locked(&mut state);
        added
    }

    /// Load a rule file and flush the cache
    pub fn load_rules<R: std::io::BufRead>(&self, reader: R) -> crate::Result<usize> {
        let mut state = self.state.lock();
        let added = state.rules.load_rules(reader)?;
        self.flush_locked(&mut state);
        Ok(added)
    }

    /// Classify without touching the cache
    pub fn classify(&self, path: &str, method: &str) -> Verdict {
        let state = self.state.lock();
        state
            .rules
            .classify(&fully_qualified(path, method), path, method)
    }

    /// Source a method would be assigned, without touching the cache
    pub fn source_of(&self, path: &str, method: &str) -> MethodSource {
        let state = self.state.lock();
        let key = MethodKey::new(0, 0, path, method);
        derive_source(&state.rules, &key, &fully_qualified(path, method))
    }

    fn flush_locked(&self, _state: &mut ClassifierState) {
        self.entries.clear();
        self.flushes.fetch_add(1, Ordering::Relaxed);
        debug!("method cache flushed");
    }

    /// Every currently cached non-blacklisted method, in key order
    pub fn records(&self) -> Vec<Arc<MethodRecord>> {
        self.entries
            .iter()
            .filter_map(|e| e.value().record().cloned())
            .collect()
    }

    /// Number of function ids handed out so far
    pub fn method_count(&self) -> u32 {
        self.state.lock().next_function_id
    }

    pub fn blacklisted_count(&self) -> u64 {
        self.blacklisted.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn cached_len(&self) -> usize {
        self.entries.len()
    }

    /// Rules in key order, for diagnostics
    pub fn rules(&self) -> Vec<(String, Verdict)> {
        self.state.lock().rules.rules().collect()
    }
}

fn derive_source(rules: &RuleSet, key: &MethodKey<'_>, fq: &str) -> MethodSource {
    if key.method == TRACE_ENTRYPOINT {
        MethodSource::System
    } else if rules.is_library(key.path) {
        MethodSource::KnownLibrary
    } else if SYNCHRONIZATION_METHODS.contains(&fq) {
        MethodSource::Synchronization
    } else {
        MethodSource::User
    }
}
