//! Three-lane bounded FIFO with per-lane concurrency caps.
//!
//! Lanes are independent: strict FIFO within a lane, no ordering or fairness
//! across lanes. `enqueue` never suspends (it drops per policy or rejects at
//! the cap); `take` suspends until an item is available *and* the lane has a
//! free concurrency slot. Every `take` must be paired with exactly one
//! `release`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use wr_domain::config::{DropPolicy, LanesConfig};
use wr_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Lanes & items
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Main,
    Subagent,
    Cron,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Main, Lane::Subagent, Lane::Cron];

    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Main => "main",
            Lane::Subagent => "subagent",
            Lane::Cron => "cron",
        }
    }

    fn index(self) -> usize {
        match self {
            Lane::Main => 0,
            Lane::Subagent => 1,
            Lane::Cron => 2,
        }
    }
}

/// Work carried through a lane.
#[derive(Debug, Clone)]
pub enum LanePayload {
    /// Collapsed user prompt or synthetic `[SYSTEM]` input for a session.
    Prompt { content: String },
    /// An admitted sub-agent request awaiting execution.
    SubAgent { request_id: Uuid },
    /// A cron or heartbeat firing.
    Cron {
        name: String,
        prompt: String,
        /// Session key to route the output to; `None` = log only (heartbeat).
        route: Option<String>,
        heartbeat: bool,
    },
}

#[derive(Debug, Clone)]
pub struct LaneItem {
    pub lane: Lane,
    pub session_key: String,
    pub payload: LanePayload,
    pub enqueue_ts: DateTime<Utc>,
    /// Synthetic inputs (sub-agent notifications) skip the debounce window.
    pub bypass_debounce: bool,
}

impl LaneItem {
    pub fn prompt(lane: Lane, session_key: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            lane,
            session_key: session_key.into(),
            payload: LanePayload::Prompt {
                content: content.into(),
            },
            enqueue_ts: Utc::now(),
            bypass_debounce: false,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct LaneState {
    queue: VecDeque<LaneItem>,
    active: usize,
}

struct LaneInner {
    state: Mutex<LaneState>,
    wakeup: Notify,
    concurrency: usize,
}

/// Bounded three-lane queue. One instance per workspace runner.
pub struct LaneQueue {
    lanes: [LaneInner; 3],
    cap: usize,
    drop_policy: DropPolicy,
}

impl LaneQueue {
    pub fn new(config: &LanesConfig) -> Self {
        let lane = |concurrency: usize| LaneInner {
            state: Mutex::new(LaneState {
                queue: VecDeque::new(),
                active: 0,
            }),
            wakeup: Notify::new(),
            concurrency: concurrency.max(1),
        };
        Self {
            lanes: [
                lane(config.main_concurrency),
                lane(config.subagent_concurrency),
                lane(config.cron_concurrency),
            ],
            cap: config.cap.max(1),
            drop_policy: config.drop_policy,
        }
    }

    /// Admit an item. Returns any item evicted by the drop policy so the
    /// caller can account for it (e.g. a dropped sub-agent admission).
    ///
    /// `Err(Capacity)` only under [`DropPolicy::Reject`].
    pub fn enqueue(&self, item: LaneItem) -> Result<Option<LaneItem>> {
        let inner = &self.lanes[item.lane.index()];
        let evicted = {
            let mut st = inner.state.lock();
            let evicted = if st.queue.len() >= self.cap {
                match self.drop_policy {
                    DropPolicy::Reject => {
                        return Err(Error::Capacity(format!(
                            "{} lane is full ({} queued)",
                            item.lane.as_str(),
                            st.queue.len()
                        )));
                    }
                    DropPolicy::Oldest => st.queue.pop_front(),
                    DropPolicy::Newest => {
                        tracing::warn!(lane = item.lane.as_str(), "lane full, dropping incoming item");
                        return Ok(Some(item));
                    }
                }
            } else {
                None
            };
            st.queue.push_back(item);
            evicted
        };

        if let Some(dropped) = &evicted {
            tracing::warn!(
                lane = dropped.lane.as_str(),
                session_key = %dropped.session_key,
                "lane full, dropped oldest item"
            );
        }
        inner.wakeup.notify_waiters();
        Ok(evicted)
    }

    /// Wait for the next item, respecting the lane's concurrency cap.
    /// The returned item holds a concurrency slot until [`LaneQueue::release`].
    pub async fn take(&self, lane: Lane) -> LaneItem {
        let inner = &self.lanes[lane.index()];
        loop {
            // Register interest before checking state so a concurrent
            // enqueue/release cannot slip between check and sleep.
            let mut notified = std::pin::pin!(inner.wakeup.notified());
            notified.as_mut().enable();
            {
                let mut st = inner.state.lock();
                if st.active < inner.concurrency {
                    if let Some(item) = st.queue.pop_front() {
                        st.active += 1;
                        return item;
                    }
                }
            }
            notified.await;
        }
    }

    /// Free the concurrency slot held by a taken item. Must be called exactly
    /// once per `take`.
    pub fn release(&self, lane: Lane) {
        let inner = &self.lanes[lane.index()];
        {
            let mut st = inner.state.lock();
            st.active = st.active.saturating_sub(1);
        }
        inner.wakeup.notify_waiters();
    }

    pub fn depth(&self, lane: Lane) -> usize {
        self.lanes[lane.index()].state.lock().queue.len()
    }

    pub fn active(&self, lane: Lane) -> usize {
        self.lanes[lane.index()].state.lock().active
    }

    /// True when a lane has neither queued nor in-flight work.
    pub fn is_idle(&self, lane: Lane) -> bool {
        let st = self.lanes[lane.index()].state.lock();
        st.queue.is_empty() && st.active == 0
    }
}
