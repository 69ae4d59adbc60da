//! Background dispatch and timer threads
//!
//! # Design
//!
//! ```text
//! ┌──────────────────────┐   poll    ┌───────────────────┐   send   ┌───────────┐
//! │ ByteRing (10 MiB)    │ ────────► │ dispatch thread   │ ───────► │ Transport │
//! └──────────────────────┘           └───────────────────┘          └───────────┘
//!            ▲
//!            │ flush / resync every tick
//! ┌──────────────────────┐
//! │ timer thread         │
//! └──────────────────────┘
//! ```
//!
//! Both threads share one [`CancellationToken`] and check it at every wait
//! point. The dispatch thread keeps draining after cancellation until the
//! ring is empty, so a clean shutdown loses nothing that was already queued.

use crate::diagnostics::Diagnostics;
use crate::error::{Result, TraceError};
use crate::ring_buffer::{ByteRing, Peek};
use crate::sink::Transport;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cooperative cancellation shared by background threads
///
/// Cancelling drops the only sender, which wakes every waiter at once.
#[derive(Clone)]
pub struct CancellationToken {
    sender: Arc<Mutex<Option<Sender<()>>>>,
    receiver: Receiver<()>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        let (sender, receiver) = channel::bounded(0);
        Self {
            sender: Arc::new(Mutex::new(Some(sender))),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.lock().take();
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.receiver.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for up to `timeout`; returns `true` if cancelled meanwhile
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.receiver.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}

/// Dispatch loop tuning
#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    /// Idle sleep and jitter delay
    pub tick: Duration,
    /// Bytes a receiver can absorb per wakeup before jitter kicks in
    pub receive_buffer_size: usize,
}

/// Drain the ring into `transport` until cancelled and empty
///
/// Returns early if the ring reports a corrupt frame length.
pub fn run_dispatch(
    ring: &ByteRing,
    transport: &mut dyn Transport,
    diagnostics: &Diagnostics,
    token: &CancellationToken,
    settings: DispatchSettings,
) {
    let mut frame = Vec::with_capacity(crate::protocol::MAX_BATCH_PACKET_SIZE);
    loop {
        let running = !token.is_cancelled();
        if !running && ring.is_empty() {
            break;
        }

        let mut bytes_on_wakeup = 0usize;
        loop {
            let len = match ring.poll(&mut frame) {
                Peek::Empty => break,
                Peek::Desync(declared) => {
                    warn!(declared, "dispatch thread terminating, corrupt frame length");
                    return;
                }
                Peek::Frame(len) => len,
            };

            // Give a slow receiver room, but never while the ring is filling up
            bytes_on_wakeup += len;
            if bytes_on_wakeup >= settings.receive_buffer_size
                && ring.used() <= ring.capacity() / 2
            {
                token.wait_timeout(settings.tick);
                Diagnostics::incr(&diagnostics.jittered_sends);
                bytes_on_wakeup = 0;
            }

            match transport.send(&frame) {
                Ok(_) => Diagnostics::add(&diagnostics.bytes_sent, len as u64),
                Err(e) => {
                    Diagnostics::incr(&diagnostics.failed_sends);
                    warn!(error = %e, len, sink = %transport.describe(), "send failed");
                }
            }
        }

        if running {
            token.wait_timeout(settings.tick);
        }
    }
    debug!("dispatch thread drained");
}

/// Call `on_tick` every `tick` until cancelled
///
/// Every `resync_ticks`-th call is flagged for a collector resync.
pub fn run_timer<F>(token: &CancellationToken, tick: Duration, resync_ticks: u32, mut on_tick: F)
where
    F: FnMut(bool),
{
    let mut ticks: u32 = 0;
    while !token.wait_timeout(tick) {
        ticks = ticks.wrapping_add(1);
        let resync = resync_ticks > 0 && ticks % resync_ticks == 0;
        on_tick(resync);
    }
    debug!(ticks, "timer thread stopped");
}

/// Handles to the running background threads
pub struct Workers {
    token: CancellationToken,
    dispatch: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl Workers {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            dispatch: None,
            timer: None,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn spawn_dispatch(
        &mut self,
        ring: Arc<ByteRing>,
        mut transport: Box<dyn Transport>,
        diagnostics: Arc<Diagnostics>,
        settings: DispatchSettings,
    ) -> Result<()> {
        let token = self.token.clone();
        let handle = thread::Builder::new()
            .name("calltrace-dispatch".into())
            .spawn(move || {
                run_dispatch(&ring, transport.as_mut(), &diagnostics, &token, settings)
            })
            .map_err(|e| TraceError::Spawn(e.to_string()))?;
        self.dispatch = Some(handle);
        Ok(())
    }

    pub fn spawn_timer<F>(&mut self, tick: Duration, resync_ticks: u32, on_tick: F) -> Result<()>
    where
        F: FnMut(bool) + Send + 'static,
    {
        let token = self.token.clone();
        let handle = thread::Builder::new()
            .name("calltrace-timer".into())
            .spawn(move || run_timer(&token, tick, resync_ticks, on_tick))
            .map_err(|e| TraceError::Spawn(e.to_string()))?;
        self.timer = Some(handle);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.dispatch.is_some() || self.timer.is_some()
    }

    /// Cancel and wait up to `grace` for both threads
    ///
    /// A thread still busy when the grace period ends is detached.
    pub fn shutdown(&mut self, grace: Duration) {
        self.token.cancel();
        let deadline = Instant::now() + grace;
        for (name, slot) in [("timer", &mut self.timer), ("dispatch", &mut self.dispatch)] {
            let Some(handle) = slot.take() else { continue };
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!(thread = name, "background thread panicked");
                }
            } else {
                warn!(thread = name, ?grace, "background thread did not stop in time");
            }
        }
        info!("background threads stopped");
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        if self.is_running() {
            self.shutdown(Duration::from_secs(5));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default, Clone)]
    struct Recorder {
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        fail: bool,
    }

    impl Transport for Recorder {
        fn send(&mut self, frame: &[u8]) -> io::Result<usize> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "down"));
            }
            self.frames.lock().push(frame.to_vec());
            Ok(frame.len())
        }

        fn describe(&self) -> String {
            "recorder".into()
        }
    }

    fn frame(len: usize) -> Vec<u8> {
        let mut f = vec![0u8; len];
        f[..2].copy_from_slice(&(len as i16).to_le_bytes());
        f
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            tick: Duration::from_millis(1),
            receive_buffer_size: 1 << 20,
        }
    }

    #[test]
    fn test_token_cancel_wakes_waiter() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(!token.wait_timeout(Duration::from_millis(1)));

        let waiter = token.clone();
        let handle = thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        token.cancel();
        assert!(handle.join().unwrap());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_dispatch_drains_after_cancel() {
        let ring = ByteRing::new(4096).unwrap();
        for len in [10, 20, 30] {
            assert!(ring.offer(&frame(len)));
        }
        let token = CancellationToken::new();
        token.cancel();

        let mut recorder = Recorder::default();
        let diag = Diagnostics::new();
        run_dispatch(&ring, &mut recorder, &diag, &token, settings());

        let sent: Vec<usize> = recorder.frames.lock().iter().map(Vec::len).collect();
        assert_eq!(sent, vec![10, 20, 30]);
        assert_eq!(diag.snapshot().bytes_sent, 60);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_failed_sends_are_counted() {
        let ring = ByteRing::new(4096).unwrap();
        ring.offer(&frame(10));
        ring.offer(&frame(10));
        let token = CancellationToken::new();
        token.cancel();

        let mut recorder = Recorder {
            fail: true,
            ..Default::default()
        };
        let diag = Diagnostics::new();
        run_dispatch(&ring, &mut recorder, &diag, &token, settings());
        let snap = diag.snapshot();
        assert_eq!(snap.failed_sends, 2);
        assert_eq!(snap.bytes_sent, 0);
    }

    #[test]
    fn test_corrupt_length_terminates() {
        let ring = ByteRing::new(64).unwrap();
        ring.offer(&[0, 0, 9, 9]);
        let token = CancellationToken::new();
        let mut recorder = Recorder::default();
        let diag = Diagnostics::new();
        // Returns even though the token was never cancelled
        run_dispatch(&ring, &mut recorder, &diag, &token, settings());
        assert!(recorder.frames.lock().is_empty());
    }

    #[test]
    fn test_jitter_only_below_half_capacity() {
        let ring = ByteRing::new(4096).unwrap();
        for _ in 0..4 {
            ring.offer(&frame(100));
        }
        let token = CancellationToken::new();
        token.cancel();
        let mut recorder = Recorder::default();
        let diag = Diagnostics::new();
        let tight = DispatchSettings {
            tick: Duration::from_millis(1),
            receive_buffer_size: 150,
        };
        run_dispatch(&ring, &mut recorder, &diag, &token, tight);
        // Wakeup totals 100, 200 (jitter, reset), 100, 200 (jitter)
        assert_eq!(diag.snapshot().jittered_sends, 2);
        assert_eq!(recorder.frames.lock().len(), 4);

        let full = ByteRing::new(300).unwrap();
        for _ in 0..3 {
            full.offer(&frame(100));
        }
        let diag = Diagnostics::new();
        let tiny = DispatchSettings {
            tick: Duration::from_millis(1),
            receive_buffer_size: 50,
        };
        run_dispatch(&full, &mut recorder, &diag, &token, tiny);
        // The first poll leaves 200 of 300 buffered, so only the later two jitter
        assert_eq!(diag.snapshot().jittered_sends, 2);
    }

    #[test]
    fn test_timer_flags_resync() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let resyncs = Arc::new(AtomicUsize::new(0));
        let mut workers = Workers::new(token.clone());
        {
            let calls = Arc::clone(&calls);
            let resyncs = Arc::clone(&resyncs);
            workers
                .spawn_timer(Duration::from_millis(1), 3, move |resync| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if resync {
                        resyncs.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();
        }
        while calls.load(Ordering::SeqCst) < 9 {
            thread::sleep(Duration::from_millis(1));
        }
        workers.shutdown(Duration::from_secs(5));
        let (c, r) = (calls.load(Ordering::SeqCst), resyncs.load(Ordering::SeqCst));
        assert_eq!(r, c / 3);
        assert!(!workers.is_running());
    }

    #[test]
    fn test_workers_drain_on_shutdown() {
        let ring = Arc::new(ByteRing::new(4096).unwrap());
        let diag = Arc::new(Diagnostics::new());
        let recorder = Recorder::default();
        let frames = Arc::clone(&recorder.frames);

        let mut workers = Workers::new(CancellationToken::new());
        workers
            .spawn_dispatch(
                Arc::clone(&ring),
                Box::new(recorder),
                Arc::clone(&diag),
                settings(),
            )
            .unwrap();
        for _ in 0..5 {
            ring.offer(&frame(40));
        }
        workers.shutdown(Duration::from_secs(5));
        assert_eq!(frames.lock().len(), 5);
        assert!(ring.is_empty());
    }
}
