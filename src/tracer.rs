//! The tracing engine
//!
//! [`Engine`] is what the runtime integration talks to. It receives call,
//! return, raise and thread notifications, keeps a shadow stack per thread,
//! and turns the interesting ones into wire events.
//!
//! # Design
//!
//! ```text
//! runtime hook
//!     │  (thread, method key, self id, args)
//!     ▼
//! trace context active for the thread's group? ── no ──► ignored
//!     │ yes
//!     ▼
//! thread record ── enter()/leave() ──► depth (None past 256 frames)
//!     │
//!     ▼
//! classifier.resolve() ── Blacklisted ──► silent
//!     │ Resolved(record); first sighting also emits METHODINFO
//!     ▼
//! push_call()/pop_return() ── Suppress ──► silent (nested library call)
//!     │ Emit
//!     ▼
//! encode on the stack ──► batcher ──► ring ──► dispatch thread
//! ```
//!
//! Hooks never fail and never block on I/O. Anything that cannot be
//! reported is dropped and shows up in [`Engine::diagnostics`].

use crate::batch::{decode_frame, Batcher, Frame};
use crate::classifier::{CacheEntry, Classifier, EventStamp, MethodKey, MethodRecord};
use crate::clock::{next_engine_id, now_micros};
use crate::config::{EngineConfig, Environment};
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::dispatch::{CancellationToken, DispatchSettings, Workers};
use crate::error::{Result, TraceError};
use crate::event::{Body, Event};
use crate::filter::{RuleKind, Verdict};
use crate::protocol::{MethodSource, MAX_BATCH_PACKET_SIZE, TIMESTAMP_FREQUENCY};
use crate::ring_buffer::{ByteRing, Peek};
use crate::shadow_stack::{CallAction, Frame as StackFrame, ThreadSnapshot};
use crate::sink::SinkConfig;
use crate::thread_table::{ThreadKey, ThreadTable};
use crate::trace_context::{ContextTable, GroupKey, TraceContext, TraceContextError};
use crate::variable::VariableInfo;
use crate::wire::WireStr;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// A runtime thread as seen by a hook: its identity and its ancestry group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadRef {
    pub key: ThreadKey,
    pub group: GroupKey,
}

impl ThreadRef {
    pub fn new(key: ThreadKey, group: GroupKey) -> Self {
        Self { key, group }
    }
}

#[cfg(feature = "variables")]
fn captured_args<'a>(args: &'a [VariableInfo<'a>]) -> Cow<'a, [VariableInfo<'a>]> {
    Cow::Borrowed(args)
}

#[cfg(not(feature = "variables"))]
fn captured_args<'a>(_args: &'a [VariableInfo<'a>]) -> Cow<'a, [VariableInfo<'a>]> {
    Cow::Borrowed(&[])
}

#[cfg(feature = "variables")]
fn captured_return(value: Option<VariableInfo<'_>>) -> VariableInfo<'_> {
    value.unwrap_or_else(|| VariableInfo::void_return())
}

#[cfg(not(feature = "variables"))]
fn captured_return(_value: Option<VariableInfo<'_>>) -> VariableInfo<'_> {
    VariableInfo::void_return()
}

/// State shared with the timer thread
struct Shared {
    pid: u32,
    engine_id: u64,
    api_key: String,
    technology_type: String,
    process_type: String,
    noop: AtomicBool,
    classifier: Classifier,
    threads: ThreadTable,
    contexts: ContextTable,
    ring: Arc<ByteRing>,
    batcher: Batcher,
    diagnostics: Arc<Diagnostics>,
}

impl Shared {
    #[inline]
    fn emit_body(&self, tid: u32, timestamp: i64, body: Body<'_>) {
        self.emit_event(&Event::new(self.pid, tid, timestamp, body));
    }

    /// Encode and batch one event; never fails
    fn emit_event(&self, event: &Event<'_>) {
        if self.noop.load(Ordering::Relaxed) {
            return;
        }
        let size = event.encoded_size();
        if size > i16::MAX as usize {
            warn!(kind = %event.event_type(), size, "event too large for the wire, dropped");
            return;
        }
        trace!(kind = %event.event_type(), size, tid = event.tid, "emit");
        if size <= MAX_BATCH_PACKET_SIZE {
            let mut buf = [0u8; MAX_BATCH_PACKET_SIZE];
            let n = event.encode(&mut buf);
            self.batcher.append(&buf[..n]);
        } else {
            self.batcher.append(&event.encode_to_vec());
        }
    }

    fn resolve(&self, key: &MethodKey<'_>, tid: u32, timestamp: i64) -> CacheEntry {
        let res = self.classifier.resolve(
            key,
            EventStamp {
                pid: self.pid,
                tid,
                timestamp,
            },
        );
        if res.fresh {
            if let Some(record) = res.entry.record() {
                if !self.noop.load(Ordering::Relaxed) {
                    self.batcher.append(&record.methodinfo);
                }
            }
        }
        res.entry
    }

    fn emit_process_header(&self, tid: u32, timestamp: i64) {
        self.emit_body(
            tid,
            timestamp,
            Body::ProcessFrequency {
                frequency: TIMESTAMP_FREQUENCY,
            },
        );
    }

    /// Timer callback: flush, and periodically replay collector state
    fn on_tick(&self, resync: bool) {
        self.batcher.flush();
        if !resync || self.noop.load(Ordering::Relaxed) {
            return;
        }
        let now = now_micros();
        self.emit_process_header(0, now);
        self.emit_body(
            0,
            now,
            Body::ProcessType {
                technology_type: WireStr::from(self.technology_type.as_str()),
                process_type: WireStr::from(self.process_type.as_str()),
            },
        );
        let records = self.classifier.records();
        for record in &records {
            self.batcher.append(&record.methodinfo);
        }
        self.batcher.flush();
        debug!(methods = records.len(), "collector resync");
    }
}

/// In-process method tracer
///
/// # Example
///
/// ```
/// use calltrace::{Engine, EngineConfig, ThreadRef};
/// use calltrace::classifier::MethodKey;
///
/// let engine = Engine::new(EngineConfig::default()).unwrap();
/// let main = ThreadRef::new(1, 1);
///
/// assert!(engine.start_trace(main));
/// engine.on_call(main, &MethodKey::new(1, 1, "App", "run"), 0, &[]);
/// engine.on_return(main, &MethodKey::new(1, 1, "App", "run"), None);
/// assert!(engine.end_trace(main.group));
///
/// let events: usize = engine.drain_frames().iter().map(|f| f.event_count()).sum();
/// // PROCESS_FREQUENCY, BEGIN_TRANSACTION, METHODINFO, BEGIN, END, END_TRANSACTION
/// assert_eq!(events, 6);
/// ```
pub struct Engine {
    shared: Arc<Shared>,
    workers: Mutex<Option<Workers>>,
    tick: std::time::Duration,
    resync_ticks: u32,
    dispatch_tick: std::time::Duration,
    shutdown_grace: std::time::Duration,
    shut_down: AtomicBool,
}

impl Engine {
    /// Create an engine for this process
    ///
    /// Loads the configured rules file, if any. No sink is attached; events
    /// queue in the ring buffer until [`Engine::set_sink`] is called.
    pub fn new(config: EngineConfig) -> Result<Self> {
        Self::with_pid(config, std::process::id())
    }

    /// Create an engine reporting under an explicit pid
    pub fn with_pid(config: EngineConfig, pid: u32) -> Result<Self> {
        config.validate()?;
        let ring = Arc::new(ByteRing::new(config.ring_capacity)?);
        let diagnostics = Arc::new(Diagnostics::new());
        let classifier = Classifier::new(config.environment.hash_strategy());
        classifier.set_log_decisions(config.log_level.logs_decisions());

        if let Some(path) = &config.rules_file {
            let added = load_rules_path(&classifier, path)?;
            info!(path = %path.display(), rules = added, "rules file loaded");
        }

        let shared = Arc::new(Shared {
            pid,
            engine_id: next_engine_id(),
            api_key: config.api_key.clone(),
            technology_type: config.technology_type.clone(),
            process_type: config.process_type.clone(),
            noop: AtomicBool::new(config.noop),
            classifier,
            threads: ThreadTable::new(),
            contexts: ContextTable::new(),
            batcher: Batcher::new(pid, Arc::clone(&ring), Arc::clone(&diagnostics)),
            ring,
            diagnostics,
        });

        Ok(Self {
            shared,
            workers: Mutex::new(None),
            tick: config.tick(),
            resync_ticks: config.resync_ticks,
            dispatch_tick: config.dispatch_tick(),
            shutdown_grace: config.shutdown_grace(),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Create an engine and attach the sink its configuration names
    pub fn connect(config: EngineConfig) -> Result<Self> {
        let sink = config.network.sink();
        let engine = Self::new(config)?;
        engine.set_sink(sink)?;
        Ok(engine)
    }

    /// Attach the transport and start the dispatch and timer threads
    ///
    /// # Errors
    ///
    /// [`TraceError::SinkAlreadySet`] on a second call, or any validation
    /// and connection error from the sink itself.
    pub fn set_sink(&self, sink: SinkConfig) -> Result<()> {
        let mut slot = self.workers.lock();
        if slot.is_some() {
            return Err(TraceError::SinkAlreadySet);
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(TraceError::InvalidSink("engine has shut down".into()));
        }
        let transport = sink.connect()?;

        let mut workers = Workers::new(CancellationToken::new());
        workers.spawn_dispatch(
            Arc::clone(&self.shared.ring),
            transport,
            Arc::clone(&self.shared.diagnostics),
            DispatchSettings {
                tick: self.dispatch_tick,
                receive_buffer_size: sink.receive_buffer_size(),
            },
        )?;
        let shared = Arc::clone(&self.shared);
        workers.spawn_timer(self.tick, self.resync_ticks, move |resync| {
            shared.on_tick(resync)
        })?;
        *slot = Some(workers);
        Ok(())
    }

    /// Begin a trace for the thread's group
    ///
    /// Returns `false` (and does nothing) if the group already has an
    /// active trace or the engine is in noop mode.
    pub fn start_trace(&self, thread: ThreadRef) -> bool {
        let s = &self.shared;
        if s.noop.load(Ordering::Relaxed) {
            return false;
        }
        let handle = s.threads.get_or_register(thread.key);
        let mut th = handle.lock();
        let now = now_micros();
        let context = TraceContext::new(thread.group, thread.key, th.tid, now);
        if let Err(TraceContextError::AlreadyActive(group)) = s.contexts.begin(context) {
            debug!(group, "trace already active");
            return false;
        }
        th.reset();
        s.emit_process_header(th.tid, now);
        s.emit_body(
            th.tid,
            now,
            Body::BeginTransaction {
                api_key: WireStr::from(s.api_key.as_str()),
                technology_type: WireStr::from(s.technology_type.as_str()),
                process_type: WireStr::from(s.process_type.as_str()),
            },
        );
        info!(tid = th.tid, group = thread.group, "trace started");
        true
    }

    /// End the group's trace; `false` if none was active
    pub fn end_trace(&self, group: GroupKey) -> bool {
        let s = &self.shared;
        let Ok(context) = s.contexts.end(group) else {
            return false;
        };
        s.emit_body(context.tid, now_micros(), Body::EndTransaction);
        s.batcher.flush();
        info!(tid = context.tid, group, "trace ended");
        true
    }

    pub fn is_tracing(&self, group: GroupKey) -> bool {
        self.shared.contexts.is_active(group)
    }

    #[inline]
    fn accepts(&self, thread: &ThreadRef) -> bool {
        !self.shared.noop.load(Ordering::Relaxed) && self.shared.contexts.is_active(thread.group)
    }

    /// Call-entry hook
    pub fn on_call<'a>(
        &self,
        thread: ThreadRef,
        key: &MethodKey<'_>,
        self_id: u64,
        args: &'a [VariableInfo<'a>],
    ) {
        if !self.accepts(&thread) {
            return;
        }
        let s = &self.shared;
        let handle = s.threads.get_or_register(thread.key);
        let mut th = handle.lock();
        let Some(depth) = th.enter() else {
            return;
        };
        let now = now_micros();
        let CacheEntry::Resolved(record) = s.resolve(key, th.tid, now) else {
            return;
        };
        let frame = StackFrame {
            function_id: record.function_id,
            source: record.source,
            depth,
        };
        if th.push_call(frame) == CallAction::Emit {
            s.emit_body(
                th.tid,
                now,
                Body::Begin {
                    function_id: record.function_id,
                    instance_id: self_id,
                    args: captured_args(args),
                },
            );
        }
    }

    /// Call-return hook
    pub fn on_return(
        &self,
        thread: ThreadRef,
        key: &MethodKey<'_>,
        return_value: Option<VariableInfo<'_>>,
    ) {
        if !self.accepts(&thread) {
            return;
        }
        let s = &self.shared;
        let handle = s.threads.get_or_register(thread.key);
        let mut th = handle.lock();
        let Some(depth) = th.leave() else {
            return;
        };
        let now = now_micros();
        // A rule added mid-call can blacklist a method whose frame is open
        let closed = match s.resolve(key, th.tid, now) {
            CacheEntry::Resolved(record) => th.pop_return(record.source, depth),
            CacheEntry::Blacklisted => th.close_frame(depth),
        };
        if let Some(frame) = closed {
            s.emit_body(
                th.tid,
                now,
                Body::End {
                    function_id: frame.function_id,
                    tail_call: false,
                    return_value: captured_return(return_value),
                },
            );
        }
    }

    /// Exception hook; returns the correlation id when the exception is
    /// reported
    ///
    /// Exceptions raised directly in the trace entrypoint or anywhere inside
    /// library code are dropped.
    pub fn on_raise(&self, thread: ThreadRef, exception_id: u64, class_name: &str) -> Option<String> {
        if !self.accepts(&thread) {
            return None;
        }
        let s = &self.shared;
        let handle = s.threads.get_or_register(thread.key);
        let th = handle.lock();
        let in_entrypoint = th
            .stack
            .peek()
            .is_some_and(|f| f.source == MethodSource::System);
        if in_entrypoint || th.lib_depth > 0 {
            trace!(exception_id, lib_depth = th.lib_depth, "exception dropped");
            return None;
        }
        let correlation_id = format!("{}-{}-{}", s.pid, s.engine_id, exception_id);
        s.emit_body(
            th.tid,
            now_micros(),
            Body::ExceptionThrown {
                exception_id,
                class_name: WireStr::from(class_name),
                correlation_id: WireStr::from(correlation_id.as_str()),
            },
        );
        Some(correlation_id)
    }

    /// Thread-start hook
    ///
    /// The new thread is parented to `parent` when given, otherwise to the
    /// thread that is running the hook.
    pub fn on_thread_begin(&self, current: ThreadRef, thread: ThreadRef, parent: Option<ThreadKey>) {
        if !self.accepts(&thread) {
            return;
        }
        let s = &self.shared;
        let handle = s.threads.start(thread.key, parent.unwrap_or(current.key));
        let th = handle.lock();
        s.emit_body(
            th.tid,
            now_micros(),
            Body::ThreadStarted {
                parent_tid: th.parent_tid,
            },
        );
    }

    /// Thread-end hook; the thread's record is released either way
    pub fn on_thread_end(&self, thread: ThreadRef) {
        let Some(tid) = self.shared.threads.remove(thread.key) else {
            return;
        };
        if self.accepts(&thread) {
            self.shared.emit_body(tid, now_micros(), Body::ThreadEnded);
        }
    }

    /// Queue an event built by the host (SQL, HTTP, exceptions)
    ///
    /// A zero pid is replaced by the engine's.
    pub fn emit(&self, mut event: Event<'_>) {
        if event.pid == 0 {
            event.pid = self.shared.pid;
        }
        self.shared.emit_event(&event);
    }

    /// Engine clock, microseconds since the Unix epoch
    pub fn now(&self) -> i64 {
        now_micros()
    }

    pub fn noop(&self) -> bool {
        self.shared.noop.load(Ordering::Relaxed)
    }

    /// Enable or disable all emission
    pub fn set_noop(&self, noop: bool) {
        self.shared.noop.store(noop, Ordering::Relaxed);
    }

    /// Mark namespace prefixes as known libraries
    pub fn register_libraries<I, S>(&self, prefixes: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.shared.classifier.register_libraries(prefixes)
    }

    pub fn add_blacklist_rule(&self, path: Option<&str>, method: Option<&str>) -> Result<RuleKind> {
        self.shared
            .classifier
            .add_rule(path, method, Verdict::Blacklisted)
    }

    pub fn add_whitelist_rule(&self, path: Option<&str>, method: Option<&str>) -> Result<RuleKind> {
        self.shared
            .classifier
            .add_rule(path, method, Verdict::Whitelisted)
    }

    /// Apply a rules file
    pub fn load_rules_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        load_rules_path(&self.shared.classifier, path.as_ref())
    }

    /// Switch method caching to suit the environment
    pub fn set_environment(&self, environment: Environment) {
        self.shared
            .classifier
            .set_strategy(environment.hash_strategy());
        debug!(%environment, "environment set");
    }

    /// Verdict for a method under the current rules
    pub fn classify(&self, path: &str, method: &str) -> Verdict {
        self.shared.classifier.classify(path, method)
    }

    /// Wire tid of a host thread
    pub fn thread_id(&self, thread: ThreadKey) -> Option<u32> {
        self.shared.threads.tid_of(thread)
    }

    pub fn thread_snapshot(&self, thread: ThreadKey) -> Option<ThreadSnapshot> {
        self.shared
            .threads
            .get(thread)
            .map(|h| h.lock().snapshot())
    }

    /// Function ids handed out so far
    pub fn method_count(&self) -> u32 {
        self.shared.classifier.method_count()
    }

    /// Cached record for a method, if it resolved and was not blacklisted
    pub fn cached_method(&self, key: &MethodKey<'_>) -> Option<Arc<MethodRecord>> {
        self.shared
            .classifier
            .lookup(key)
            .and_then(|entry| entry.record().cloned())
    }

    pub fn pid(&self) -> u32 {
        self.shared.pid
    }

    pub fn engine_id(&self) -> u64 {
        self.shared.engine_id
    }

    /// Force the current batch out to the ring buffer
    pub fn flush(&self) {
        self.shared.batcher.flush();
    }

    /// Run one timer tick by hand
    pub fn tick(&self, resync: bool) {
        self.shared.on_tick(resync);
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        let s = &self.shared;
        let ring = s.ring.stats();
        DiagnosticsSnapshot {
            max_buf_used: ring.max_used,
            ring_rejections: ring.total_rejected,
            ring_used: ring.current_size as u64,
            ring_capacity: ring.capacity as u64,
            methods: s.classifier.method_count() as u64,
            blacklisted_methods: s.classifier.blacklisted_count(),
            threads: s.threads.tids_assigned() as u64,
            ..s.diagnostics.snapshot()
        }
    }

    /// Flush and take every queued frame
    ///
    /// For engines without a sink, which otherwise only accumulate. Returns
    /// nothing once a sink is attached, since the dispatch thread owns the
    /// ring from then on.
    pub fn drain_frames(&self) -> Vec<Frame> {
        if self.workers.lock().is_some() {
            return Vec::new();
        }
        self.shared.batcher.flush();
        let mut frames = Vec::new();
        let mut bytes = Vec::new();
        while let Peek::Frame(_) = self.shared.ring.poll(&mut bytes) {
            match decode_frame(&bytes) {
                Ok((frame, _)) => frames.push(frame),
                Err(e) => warn!(error = %e, "undecodable frame skipped"),
            }
        }
        frames
    }

    /// Report process end and stop background threads
    ///
    /// Idempotent. Also run by `Drop`.
    pub fn process_ended(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let s = &self.shared;
        s.batcher.flush();
        s.emit_body(0, now_micros(), Body::ProcessEnded);
        s.batcher.flush();
        if let Some(mut workers) = self.workers.lock().take() {
            workers.shutdown(self.shutdown_grace);
        }
        info!(diagnostics = ?self.diagnostics(), "process ended");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.process_ended();
    }
}

fn load_rules_path(classifier: &Classifier, path: &Path) -> Result<usize> {
    let file = File::open(path)?;
    classifier.load_rules(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{EventType, MAX_ARGS, MAX_STACK_DEPTH, THREAD_ORPHANED, TRACE_ENTRYPOINT};
    use crate::variable::Value;

    const MAIN: ThreadRef = ThreadRef { key: 1, group: 1 };

    fn engine() -> Engine {
        Engine::with_pid(EngineConfig::default(), 4242).unwrap()
    }

    fn events(engine: &Engine) -> Vec<Event<'static>> {
        engine
            .drain_frames()
            .into_iter()
            .flat_map(Frame::into_events)
            .collect()
    }

    fn kinds(events: &[Event<'_>]) -> Vec<EventType> {
        events.iter().map(Event::event_type).collect()
    }

    fn key<'a>(id: u64, path: &'a str, method: &'a str) -> MethodKey<'a> {
        MethodKey::new(id, id, path, method)
    }

    #[test]
    fn test_start_trace_emits_header() {
        let e = engine();
        assert!(e.start_trace(MAIN));
        let evs = events(&e);
        assert_eq!(
            kinds(&evs),
            vec![EventType::ProcessFrequency, EventType::BeginTransaction]
        );
        assert!(evs.iter().all(|ev| ev.pid == 4242));
        match &evs[0].body {
            Body::ProcessFrequency { frequency } => assert_eq!(*frequency, 1_000_000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_second_start_is_noop() {
        let e = engine();
        assert!(e.start_trace(MAIN));
        assert!(!e.start_trace(MAIN));
        let begins = kinds(&events(&e))
            .into_iter()
            .filter(|k| *k == EventType::BeginTransaction)
            .count();
        assert_eq!(begins, 1);
    }

    #[test]
    fn test_end_without_start() {
        let e = engine();
        assert!(!e.end_trace(MAIN.group));
        assert!(events(&e).is_empty());
    }

    #[test]
    fn test_events_outside_trace_ignored() {
        let e = engine();
        e.on_call(MAIN, &key(1, "App", "run"), 0, &[]);
        assert!(events(&e).is_empty());
        assert_eq!(e.method_count(), 0);

        // Other groups stay silent while one is traced
        e.start_trace(MAIN);
        events(&e);
        e.on_call(ThreadRef::new(2, 9), &key(1, "App", "run"), 0, &[]);
        assert!(events(&e).is_empty());
    }

    #[test]
    fn test_call_return_pair() {
        let e = engine();
        e.start_trace(MAIN);
        events(&e);

        let k = key(1, "App", "run");
        e.on_call(MAIN, &k, 77, &[]);
        e.on_return(MAIN, &k, None);
        let evs = events(&e);
        assert_eq!(
            kinds(&evs),
            vec![EventType::MethodInfo, EventType::Begin, EventType::End]
        );
        match &evs[1].body {
            Body::Begin {
                function_id,
                instance_id,
                ..
            } => {
                assert_eq!(*function_id, 1);
                assert_eq!(*instance_id, 77);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(e.thread_snapshot(1).unwrap().stack_depth, 0);
    }

    #[test]
    fn test_methodinfo_only_on_first_sighting() {
        let e = engine();
        e.start_trace(MAIN);
        let k = key(1, "App", "run");
        for _ in 0..3 {
            e.on_call(MAIN, &k, 0, &[]);
            e.on_return(MAIN, &k, None);
        }
        let infos = kinds(&events(&e))
            .into_iter()
            .filter(|k| *k == EventType::MethodInfo)
            .count();
        assert_eq!(infos, 1);
        assert!(e.cached_method(&k).is_some());
    }

    #[test]
    fn test_blacklisted_calls_are_silent() {
        let e = engine();
        e.add_blacklist_rule(Some("Noise"), None).unwrap();
        e.start_trace(MAIN);
        events(&e);

        let k = key(5, "Noise", "tick");
        e.on_call(MAIN, &k, 0, &[]);
        e.on_return(MAIN, &k, None);
        assert!(events(&e).is_empty());
        assert!(e.cached_method(&k).is_none());
        assert_eq!(e.diagnostics().blacklisted_methods, 1);
    }

    #[test]
    fn test_return_after_mid_call_blacklist_closes_frame() {
        let e = engine();
        e.start_trace(MAIN);
        events(&e);

        let outer = key(1, "App", "run");
        let inner = key(2, "Noise", "tick");
        e.on_call(MAIN, &outer, 0, &[]);
        e.on_call(MAIN, &inner, 0, &[]);
        e.add_blacklist_rule(Some("Noise"), None).unwrap();
        e.on_return(MAIN, &inner, None);
        e.on_return(MAIN, &outer, None);

        let ends: Vec<u32> = events(&e)
            .iter()
            .filter_map(|ev| match ev.body {
                Body::End { function_id, .. } => Some(function_id),
                _ => None,
            })
            .collect();
        assert_eq!(ends, vec![2, 1]);
        assert_eq!(e.thread_snapshot(1).unwrap().stack_depth, 0);
    }

    #[cfg(feature = "variables")]
    #[test]
    fn test_call_arguments_capped() {
        let e = engine();
        e.start_trace(MAIN);
        events(&e);

        let args: Vec<VariableInfo<'_>> = (0..256)
            .map(|i| VariableInfo::new("flag", Value::Boolean(i % 2 == 0)))
            .collect();
        let k = key(1, "App", "splat");
        e.on_call(MAIN, &k, 0, &args);
        let evs = events(&e);
        assert_eq!(kinds(&evs), vec![EventType::MethodInfo, EventType::Begin]);
        match &evs[1].body {
            Body::Begin { args, .. } => assert_eq!(args.len(), MAX_ARGS),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_deep_recursion_caps_at_stack_depth() {
        let e = engine();
        e.start_trace(MAIN);
        events(&e);

        let keys: Vec<String> = (0..300).map(|i| format!("m{}", i)).collect();
        for (i, name) in keys.iter().enumerate() {
            e.on_call(MAIN, &key(i as u64, "Deep", name), 0, &[]);
        }
        for (i, name) in keys.iter().enumerate().rev() {
            e.on_return(MAIN, &key(i as u64, "Deep", name), None);
        }
        let evs = events(&e);
        let count = |kind| evs.iter().filter(|ev| ev.event_type() == kind).count();
        assert_eq!(count(EventType::Begin), MAX_STACK_DEPTH);
        assert_eq!(count(EventType::End), MAX_STACK_DEPTH);
        let snap = e.thread_snapshot(1).unwrap();
        assert_eq!(snap.stack_depth, 0);
        assert_eq!(snap.vm_depth, -1);
    }

    #[test]
    fn test_library_calls_collapse() {
        let e = engine();
        e.register_libraries(["ActiveRecord"]);
        e.start_trace(MAIN);
        events(&e);

        let save = key(1, "ActiveRecord::Base", "save");
        let validate = key(2, "ActiveRecord::Base", "validate");
        e.on_call(MAIN, &save, 0, &[]);
        e.on_call(MAIN, &validate, 0, &[]);
        e.on_return(MAIN, &validate, None);
        e.on_return(MAIN, &save, None);

        let evs = events(&e);
        let begins: Vec<u32> = evs
            .iter()
            .filter_map(|ev| match ev.body {
                Body::Begin { function_id, .. } => Some(function_id),
                _ => None,
            })
            .collect();
        assert_eq!(begins, vec![1]);
        assert_eq!(
            evs.iter()
                .filter(|ev| ev.event_type() == EventType::End)
                .count(),
            1
        );
        assert_eq!(e.thread_snapshot(1).unwrap().lib_depth, 0);
    }

    #[test]
    fn test_exception_correlation() {
        let e = engine();
        e.start_trace(MAIN);
        let run = key(1, "App", "run");
        e.on_call(MAIN, &run, 0, &[]);
        events(&e);

        let id = e.on_raise(MAIN, 99, "RuntimeError").unwrap();
        assert_eq!(id, format!("4242-{}-99", e.engine_id()));
        let evs = events(&e);
        match &evs[0].body {
            Body::ExceptionThrown {
                exception_id,
                class_name,
                correlation_id,
            } => {
                assert_eq!(*exception_id, 99);
                assert_eq!(class_name.as_bytes(), b"RuntimeError");
                assert_eq!(correlation_id.to_string_lossy(), id);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_exception_in_entrypoint_or_library_dropped() {
        let e = engine();
        e.register_libraries(["Rack"]);
        e.start_trace(MAIN);
        let entry = key(1, "Object", TRACE_ENTRYPOINT);
        e.on_call(MAIN, &entry, 0, &[]);
        assert_eq!(e.on_raise(MAIN, 1, "StopIteration"), None);

        let rack = key(2, "Rack::Lint", "call");
        e.on_call(MAIN, &rack, 0, &[]);
        assert_eq!(e.on_raise(MAIN, 2, "Rack::Error"), None);
        e.on_return(MAIN, &rack, None);

        let user = key(3, "App", "run");
        e.on_call(MAIN, &user, 0, &[]);
        assert!(e.on_raise(MAIN, 3, "ArgumentError").is_some());
    }

    #[test]
    fn test_thread_lifecycle() {
        let e = engine();
        e.start_trace(MAIN);
        events(&e);

        let worker = ThreadRef::new(2, MAIN.group);
        e.on_thread_begin(MAIN, worker, None);
        assert_eq!(e.thread_id(2), Some(2));
        e.on_thread_end(worker);
        assert_eq!(e.thread_id(2), None);

        let evs = events(&e);
        assert_eq!(
            kinds(&evs),
            vec![EventType::ThreadStarted, EventType::ThreadEnded]
        );
        assert_eq!(evs[0].tid, 2);
        match evs[0].body {
            Body::ThreadStarted { parent_tid } => assert_eq!(parent_tid, 1),
            ref other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_parent_is_orphaned() {
        let e = engine();
        e.start_trace(MAIN);
        let worker = ThreadRef::new(3, MAIN.group);
        e.on_thread_begin(MAIN, worker, Some(999));
        assert_eq!(e.thread_snapshot(3).unwrap().parent_tid, THREAD_ORPHANED);
    }

    #[test]
    fn test_noop_suppresses_everything() {
        let e = Engine::with_pid(EngineConfig::default().with_noop(true), 1).unwrap();
        assert!(e.noop());
        assert!(!e.start_trace(MAIN));
        e.emit(Event::new(0, 1, 0, Body::EndTransaction));
        assert!(events(&e).is_empty());

        e.set_noop(false);
        assert!(e.start_trace(MAIN));
        assert_eq!(events(&e).len(), 2);
    }

    #[test]
    fn test_emit_stamps_pid() {
        let e = engine();
        e.emit(Event::new(
            0,
            1,
            e.now(),
            Body::HttpIn(crate::event::Http {
                url: WireStr::from("/users"),
                verb: crate::wire::ShortStr::new(b"GET"),
                status: 200,
                duration: 1500,
            }),
        ));
        let evs = events(&e);
        assert_eq!(evs.len(), 1);
        assert_eq!(evs[0].pid, 4242);
    }

    #[cfg(feature = "variables")]
    #[test]
    fn test_arguments_and_return_value_captured() {
        let e = engine();
        e.start_trace(MAIN);
        events(&e);
        let k = key(1, "App", "add");
        let args = [
            VariableInfo::new("a", Value::Int32(2)),
            VariableInfo::new("b", Value::Int32(3)),
        ];
        e.on_call(MAIN, &k, 0, &args);
        e.on_return(MAIN, &k, Some(VariableInfo::new("", Value::Int32(5))));
        let evs = events(&e);
        match &evs[1].body {
            Body::Begin { args, .. } => assert_eq!(args.len(), 2),
            other => panic!("unexpected {:?}", other),
        }
        match &evs[2].body {
            Body::End { return_value, .. } => assert_eq!(return_value.value, Value::Int32(5)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_resync_replays_methodinfo() {
        let e = engine();
        e.start_trace(MAIN);
        for i in 0..3 {
            let name = format!("m{}", i);
            e.on_call(MAIN, &key(i, "App", &name), 0, &[]);
        }
        events(&e);

        e.tick(true);
        let evs = events(&e);
        assert_eq!(
            kinds(&evs),
            vec![
                EventType::ProcessFrequency,
                EventType::ProcessType,
                EventType::MethodInfo,
                EventType::MethodInfo,
                EventType::MethodInfo,
            ]
        );
    }

    #[test]
    fn test_process_ended_is_idempotent() {
        let e = engine();
        e.process_ended();
        e.process_ended();
        let evs = events(&e);
        assert_eq!(kinds(&evs), vec![EventType::ProcessEnded]);
        assert!(matches!(
            e.set_sink(SinkConfig::callback(|_| {})),
            Err(TraceError::InvalidSink(_))
        ));
    }

    #[test]
    fn test_second_sink_rejected() {
        let e = engine();
        e.set_sink(SinkConfig::callback(|_| {})).unwrap();
        assert!(matches!(
            e.set_sink(SinkConfig::callback(|_| {})),
            Err(TraceError::SinkAlreadySet)
        ));
        assert!(e.drain_frames().is_empty());
    }
}
