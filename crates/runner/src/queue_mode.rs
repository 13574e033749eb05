//! Per-session queueing-mode state machine.
//!
//! Decides what happens when a message arrives for a session that already
//! has pending or in-flight work:
//!
//! | mode      | while in-flight                    | while debouncing    |
//! |-----------|------------------------------------|---------------------|
//! | collect   | buffer, combined flush after done  | reset, concatenate  |
//! | steer     | cancel in-flight, then as collect  | reset               |
//! | followup  | hold, second invocation after done | reset               |
//! | interrupt | enqueue immediately                | no debounce         |
//!
//! The machine never touches the lane queue directly: it is constructed
//! with a flush sink (a synchronous callback registered by the runner),
//! which breaks the reference cycle back to the dispatcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use wr_domain::config::QueueMode;
use wr_domain::{CancelMap, TraceEvent};

/// `(session_key, collapsed_content, synthetic)` → enqueue onto the main lane.
pub type FlushSink = Arc<dyn Fn(&str, String, bool) + Send + Sync>;

#[derive(Default)]
struct SessionQueue {
    mode: Option<QueueMode>,
    /// Messages collapsing in the current debounce window.
    buffer: Vec<String>,
    /// Follow-up content held while an invocation is in flight.
    held: Vec<String>,
    in_flight: bool,
    /// Invalidates stale debounce timers: each arm bumps the generation and
    /// a firing timer with an old generation is a no-op.
    debounce_gen: u64,
}

struct Inner {
    default_mode: QueueMode,
    debounce: Duration,
    sink: FlushSink,
    cancels: Arc<CancelMap>,
    sessions: Mutex<HashMap<String, SessionQueue>>,
}

/// Cloneable handle; all clones share one state table.
#[derive(Clone)]
pub struct QueueModeMachine {
    inner: Arc<Inner>,
}

impl QueueModeMachine {
    pub fn new(
        default_mode: QueueMode,
        debounce: Duration,
        cancels: Arc<CancelMap>,
        sink: FlushSink,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                default_mode,
                debounce,
                sink,
                cancels,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Effective mode for a session (override or workspace default).
    pub fn mode(&self, session_key: &str) -> QueueMode {
        self.inner
            .sessions
            .lock()
            .get(session_key)
            .and_then(|s| s.mode)
            .unwrap_or(self.inner.default_mode)
    }

    /// Per-session mode override (`/queue <mode>`).
    pub fn set_mode(&self, session_key: &str, mode: QueueMode) {
        self.inner
            .sessions
            .lock()
            .entry(session_key.to_owned())
            .or_default()
            .mode = Some(mode);
    }

    /// Admit an inbound message. `synthetic` inputs (sub-agent notifications)
    /// bypass the debounce window entirely.
    pub fn on_inbound(&self, session_key: &str, content: String, synthetic: bool) {
        let mode = self.mode(session_key);
        TraceEvent::MessageAdmitted {
            session_key: session_key.to_owned(),
            mode: mode.as_str().to_owned(),
            synthetic,
        }
        .emit();

        if synthetic {
            (self.inner.sink)(session_key, content, true);
            return;
        }

        if mode == QueueMode::Interrupt {
            (self.inner.sink)(session_key, content, false);
            return;
        }

        let arm = {
            let mut sessions = self.inner.sessions.lock();
            let entry = sessions.entry(session_key.to_owned()).or_default();

            match mode {
                QueueMode::Steer if entry.in_flight => {
                    // Cooperative cancellation; the cancelled invocation's
                    // completion hook flushes the buffered replacement.
                    self.inner.cancels.cancel(session_key);
                    entry.buffer.push(content);
                    true
                }
                QueueMode::Followup if entry.in_flight => {
                    entry.held.push(content);
                    false
                }
                _ => {
                    entry.buffer.push(content);
                    true
                }
            }
        };

        if arm {
            self.arm_debounce(session_key);
        }
    }

    /// Mark the start of a main-lane invocation for this session.
    pub fn begin_invocation(&self, session_key: &str) {
        self.inner
            .sessions
            .lock()
            .entry(session_key.to_owned())
            .or_default()
            .in_flight = true;
    }

    /// Mark completion. Flushes anything that accumulated while in flight:
    /// the collect buffer as one combined dispatch, then any held follow-up
    /// as a separate second invocation.
    pub fn complete_invocation(&self, session_key: &str) {
        let (buffered, held) = {
            let mut sessions = self.inner.sessions.lock();
            let Some(entry) = sessions.get_mut(session_key) else {
                return;
            };
            entry.in_flight = false;
            entry.debounce_gen += 1; // cancel any pending timer
            (
                std::mem::take(&mut entry.buffer),
                std::mem::take(&mut entry.held),
            )
        };

        if !buffered.is_empty() {
            (self.inner.sink)(session_key, buffered.join("\n"), false);
        }
        if !held.is_empty() {
            (self.inner.sink)(session_key, held.join("\n"), false);
        }
    }

    /// Queued messages for a session (buffer + held), for `/status` and tests.
    pub fn pending_depth(&self, session_key: &str) -> usize {
        self.inner
            .sessions
            .lock()
            .get(session_key)
            .map_or(0, |s| s.buffer.len() + s.held.len())
    }

    fn arm_debounce(&self, session_key: &str) {
        let generation = {
            let mut sessions = self.inner.sessions.lock();
            let entry = sessions.entry(session_key.to_owned()).or_default();
            entry.debounce_gen += 1;
            entry.debounce_gen
        };

        let machine = self.clone();
        let key = session_key.to_owned();
        let delay = self.inner.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            machine.debounce_fired(&key, generation);
        });
    }

    fn debounce_fired(&self, session_key: &str, generation: u64) {
        let flushed = {
            let mut sessions = self.inner.sessions.lock();
            let Some(entry) = sessions.get_mut(session_key) else {
                return;
            };
            if entry.debounce_gen != generation {
                return; // superseded by a newer message or a completion
            }
            if entry.in_flight {
                // Completion will flush; keep accumulating until then.
                return;
            }
            if entry.buffer.is_empty() {
                return;
            }
            std::mem::take(&mut entry.buffer)
        };

        (self.inner.sink)(session_key, flushed.join("\n"), false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Flushes = Arc<Mutex<Vec<(String, String, bool)>>>;

    fn machine(mode: QueueMode, debounce_ms: u64) -> (QueueModeMachine, Flushes, Arc<CancelMap>) {
        let flushes: Flushes = Arc::new(Mutex::new(Vec::new()));
        let sink_log = flushes.clone();
        let sink: FlushSink = Arc::new(move |sk, content, synthetic| {
            sink_log.lock().push((sk.to_owned(), content, synthetic));
        });
        let cancels = Arc::new(CancelMap::new());
        let m = QueueModeMachine::new(
            mode,
            Duration::from_millis(debounce_ms),
            cancels.clone(),
            sink,
        );
        (m, flushes, cancels)
    }

    #[tokio::test(start_paused = true)]
    async fn collect_collapses_within_debounce() {
        let (m, flushes, _) = machine(QueueMode::Collect, 500);

        m.on_inbound("telegram:1", "hello".into(), false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        m.on_inbound("telegram:1", "world".into(), false);
        tokio::time::sleep(Duration::from_millis(600)).await;

        let got = flushes.lock().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, "hello\nworld");
        assert!(!got[0].2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_message_resets_the_window() {
        let (m, flushes, _) = machine(QueueMode::Collect, 500);

        m.on_inbound("s", "a".into(), false);
        tokio::time::sleep(Duration::from_millis(400)).await;
        m.on_inbound("s", "b".into(), false);
        // 400ms after the second message the original timer would have fired;
        // the reset must suppress it.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(flushes.lock().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(flushes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn collect_holds_during_invocation_and_flushes_on_completion() {
        let (m, flushes, _) = machine(QueueMode::Collect, 100);

        m.begin_invocation("s");
        m.on_inbound("s", "queued up".into(), false);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(flushes.lock().is_empty(), "must hold while in flight");

        m.complete_invocation("s");
        let got = flushes.lock().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, "queued up");
    }

    #[tokio::test(start_paused = true)]
    async fn steer_cancels_in_flight() {
        let (m, flushes, cancels) = machine(QueueMode::Steer, 100);
        let token = cancels.register("s");

        m.begin_invocation("s");
        m.on_inbound("s", "actually, different".into(), false);
        assert!(token.is_cancelled(), "steer must cancel the in-flight run");

        // The cancelled invocation completes, which flushes the replacement.
        m.complete_invocation("s");
        let got = flushes.lock().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, "actually, different");
    }

    #[tokio::test(start_paused = true)]
    async fn steer_without_in_flight_behaves_like_collect() {
        let (m, flushes, _) = machine(QueueMode::Steer, 100);
        m.on_inbound("s", "just text".into(), false);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(flushes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn followup_holds_until_completion() {
        let (m, flushes, cancels) = machine(QueueMode::Followup, 100);
        let token = cancels.register("s");

        m.begin_invocation("s");
        m.on_inbound("s", "one more thing".into(), false);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(flushes.lock().is_empty());
        assert!(!token.is_cancelled(), "followup never cancels");

        m.complete_invocation("s");
        let got = flushes.lock().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, "one more thing");
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_dispatches_immediately() {
        let (m, flushes, _) = machine(QueueMode::Interrupt, 500);
        m.begin_invocation("s");
        m.on_inbound("s", "now".into(), false);
        // No debounce, no buffering, even while in flight.
        assert_eq!(flushes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn synthetic_inputs_bypass_debounce() {
        let (m, flushes, _) = machine(QueueMode::Collect, 500);
        m.on_inbound("s", "[SYSTEM] Sub-agent 'R' completed.".into(), true);
        let got = flushes.lock().clone();
        assert_eq!(got.len(), 1);
        assert!(got[0].2, "synthetic flag must be carried through");
    }

    #[tokio::test(start_paused = true)]
    async fn per_session_mode_override() {
        let (m, flushes, _) = machine(QueueMode::Collect, 500);
        m.set_mode("fast", QueueMode::Interrupt);
        assert_eq!(m.mode("fast"), QueueMode::Interrupt);
        assert_eq!(m.mode("other"), QueueMode::Collect);

        m.on_inbound("fast", "zip".into(), false);
        assert_eq!(flushes.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn completion_with_empty_buffers_flushes_nothing() {
        let (m, flushes, _) = machine(QueueMode::Collect, 100);
        m.begin_invocation("s");
        m.complete_invocation("s");
        assert!(flushes.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_are_isolated() {
        let (m, flushes, _) = machine(QueueMode::Collect, 100);
        m.on_inbound("a", "for a".into(), false);
        m.on_inbound("b", "for b".into(), false);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let got = flushes.lock().clone();
        assert_eq!(got.len(), 2);
        let keys: Vec<_> = got.iter().map(|f| f.0.as_str()).collect();
        assert!(keys.contains(&"a") && keys.contains(&"b"));
    }
}
