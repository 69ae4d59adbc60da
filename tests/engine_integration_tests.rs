//! End-to-end tests for the tracing engine
//!
//! Events travel the whole pipeline: hooks, classification, shadow stack,
//! batching, ring buffer, dispatch thread and finally a sink.

use calltrace::classifier::MethodKey;
use calltrace::{
    decode_frame, Body, Engine, EngineConfig, Event, EventType, Frame, SinkConfig, ThreadRef,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

const MAIN: ThreadRef = ThreadRef { key: 1, group: 1 };

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_tick(Duration::from_millis(20))
        .with_resync_ticks(10_000)
        .with_dispatch_tick(Duration::from_millis(5))
}

/// Engine whose events land in a shared vector
fn collecting_engine() -> (Engine, Arc<Mutex<Vec<Event<'static>>>>) {
    let engine = Engine::new(fast_config()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    engine
        .set_sink(SinkConfig::callback(move |event| sink.lock().push(event)))
        .unwrap();
    (engine, seen)
}

fn count(events: &[Event<'_>], kind: EventType) -> usize {
    events.iter().filter(|e| e.event_type() == kind).count()
}

#[test]
fn test_library_calls_collapse_end_to_end() {
    let (engine, seen) = collecting_engine();
    engine.register_libraries(["ActiveRecord"]);
    assert!(engine.start_trace(MAIN));

    let save = MethodKey::new(10, 1, "ActiveRecord::Base", "save");
    let validate = MethodKey::new(10, 2, "ActiveRecord::Base", "validate");
    engine.on_call(MAIN, &save, 0, &[]);
    engine.on_call(MAIN, &validate, 0, &[]);
    engine.on_return(MAIN, &validate, None);
    engine.on_return(MAIN, &save, None);
    assert!(engine.end_trace(MAIN.group));
    assert_eq!(engine.thread_snapshot(MAIN.key).unwrap().lib_depth, 0);
    engine.process_ended();

    let events = seen.lock();
    assert_eq!(count(&events, EventType::Begin), 1);
    assert_eq!(count(&events, EventType::End), 1);

    let save_id = engine.cached_method(&save).unwrap().function_id;
    let begin = events
        .iter()
        .find(|e| e.event_type() == EventType::Begin)
        .unwrap();
    match begin.body {
        Body::Begin { function_id, .. } => assert_eq!(function_id, save_id),
        ref other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_second_start_trace_is_noop() {
    let (engine, seen) = collecting_engine();
    assert!(engine.start_trace(MAIN));
    assert!(!engine.start_trace(MAIN));
    assert!(engine.end_trace(MAIN.group));
    assert!(!engine.end_trace(MAIN.group));
    engine.process_ended();

    let events = seen.lock();
    assert_eq!(count(&events, EventType::BeginTransaction), 1);
    assert_eq!(count(&events, EventType::EndTransaction), 1);
}

#[test]
fn test_three_hundred_nested_calls() {
    let (engine, seen) = collecting_engine();
    engine.start_trace(MAIN);

    let names: Vec<String> = (0..300).map(|i| format!("level_{}", i)).collect();
    let keys: Vec<MethodKey<'_>> = names
        .iter()
        .enumerate()
        .map(|(i, n)| MethodKey::new(1, i as u64, "Recursive", n))
        .collect();
    for key in &keys {
        engine.on_call(MAIN, key, 0, &[]);
    }
    for key in keys.iter().rev() {
        engine.on_return(MAIN, key, None);
    }
    engine.end_trace(MAIN.group);
    engine.process_ended();

    let events = seen.lock();
    assert_eq!(count(&events, EventType::Begin), 256);
    assert_eq!(count(&events, EventType::End), 256);
}

#[test]
fn test_process_ended_drains_and_is_last() {
    let (engine, seen) = collecting_engine();
    engine.start_trace(MAIN);
    let run = MethodKey::new(2, 2, "Job", "perform");
    engine.on_call(MAIN, &run, 0, &[]);
    engine.on_return(MAIN, &run, None);
    engine.end_trace(MAIN.group);
    engine.process_ended();

    let events = seen.lock();
    assert_eq!(
        events.last().map(Event::event_type),
        Some(EventType::ProcessEnded)
    );
    let diag = engine.diagnostics();
    assert!(diag.batches >= 1);
    assert!(diag.bytes_sent > 0);
    assert_eq!(diag.failed_sends, 0);
    assert_eq!(diag.ring_rejections, 0);
    assert_eq!(diag.methods, 1);
}

#[test]
fn test_only_traced_group_is_reported() {
    let (engine, seen) = collecting_engine();
    engine.start_trace(MAIN);

    let worker = ThreadRef::new(2, MAIN.group);
    let stranger = ThreadRef::new(3, 42);
    engine.on_thread_begin(MAIN, worker, None);
    engine.on_thread_begin(MAIN, stranger, None);

    let work = MethodKey::new(3, 1, "Worker", "run");
    engine.on_call(worker, &work, 0, &[]);
    engine.on_return(worker, &work, None);
    engine.on_call(stranger, &work, 0, &[]);
    engine.on_return(stranger, &work, None);
    engine.on_thread_end(worker);
    engine.on_thread_end(stranger);
    engine.end_trace(MAIN.group);
    engine.process_ended();

    let events = seen.lock();
    assert_eq!(count(&events, EventType::ThreadStarted), 1);
    assert_eq!(count(&events, EventType::ThreadEnded), 1);
    assert_eq!(count(&events, EventType::Begin), 1);
    let worker_tid = events
        .iter()
        .find(|e| e.event_type() == EventType::ThreadStarted)
        .unwrap()
        .tid;
    assert!(events
        .iter()
        .filter(|e| e.event_type() == EventType::Begin)
        .all(|e| e.tid == worker_tid));
}

#[test]
fn test_concurrent_first_sightings_get_dense_ids() {
    let engine = Engine::new(EngineConfig::default()).unwrap();
    engine.start_trace(MAIN);

    let names: Vec<Vec<String>> = (0..8)
        .map(|t| (0..25).map(|m| format!("m{}_{}", t, m)).collect())
        .collect();
    std::thread::scope(|scope| {
        for (t, methods) in names.iter().enumerate() {
            let engine = &engine;
            scope.spawn(move || {
                let thread = ThreadRef::new(100 + t as u64, MAIN.group);
                for (m, name) in methods.iter().enumerate() {
                    let key = MethodKey::new(t as u64, m as u64, "Concurrent", name);
                    engine.on_call(thread, &key, 0, &[]);
                    engine.on_return(thread, &key, None);
                }
            });
        }
    });

    let mut ids = HashSet::new();
    for (t, methods) in names.iter().enumerate() {
        for (m, name) in methods.iter().enumerate() {
            let key = MethodKey::new(t as u64, m as u64, "Concurrent", name);
            assert!(ids.insert(engine.cached_method(&key).unwrap().function_id));
        }
    }
    assert_eq!(ids, (1..=200).collect::<HashSet<u32>>());
    assert_eq!(engine.method_count(), 200);
}

#[test]
fn test_udp_sink_delivers_batches() {
    let receiver = UdpSocket::bind(("127.0.0.1", 0)).unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let port = receiver.local_addr().unwrap().port();

    // Long timer tick so the whole transaction lands in one batch
    let config = fast_config()
        .with_tick(Duration::from_secs(60))
        .with_api_key("secret");
    let engine = Engine::with_pid(config, 777).unwrap();
    engine.set_sink(SinkConfig::udp("127.0.0.1", port)).unwrap();
    engine.start_trace(MAIN);
    engine.end_trace(MAIN.group);

    let mut buf = [0u8; 65536];
    let n = receiver.recv(&mut buf).unwrap();
    let (frame, used) = decode_frame(&buf[..n]).unwrap();
    assert_eq!(used, n);
    match frame {
        Frame::Batch { header, events } => {
            assert_eq!(header.pid, 777);
            assert_eq!(header.sequence, 0);
            let kinds: Vec<EventType> = events.iter().map(Event::event_type).collect();
            assert_eq!(
                kinds,
                vec![
                    EventType::ProcessFrequency,
                    EventType::BeginTransaction,
                    EventType::EndTransaction
                ]
            );
            match &events[1].body {
                Body::BeginTransaction { api_key, .. } => {
                    assert_eq!(api_key.as_bytes(), b"secret")
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        other => panic!("expected a batch, got {:?}", other),
    }
}

#[test]
fn test_timer_resync_replays_methods() {
    let (engine, seen) = collecting_engine();
    engine.start_trace(MAIN);
    let key = MethodKey::new(4, 4, "Cache", "fetch");
    engine.on_call(MAIN, &key, 0, &[]);
    engine.on_return(MAIN, &key, None);
    engine.tick(true);
    engine.process_ended();

    let events = seen.lock();
    assert_eq!(count(&events, EventType::MethodInfo), 2);
    assert_eq!(count(&events, EventType::ProcessType), 1);
}

#[test]
fn test_drop_runs_shutdown() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let engine = Engine::new(fast_config()).unwrap();
        let sink = Arc::clone(&seen);
        engine
            .set_sink(SinkConfig::callback(move |e| sink.lock().push(e)))
            .unwrap();
        engine.start_trace(MAIN);
    }
    let events = seen.lock();
    assert_eq!(
        events.last().map(Event::event_type),
        Some(EventType::ProcessEnded)
    );
}
