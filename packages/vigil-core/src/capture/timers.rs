//! Named single-shot timers for one supervisor.
//!
//! Every supervisor owns exactly one [`TimerBundle`] with five named slots.
//! Slots are single-owner: `reset` always clears first, and a generation
//! counter per slot rejects fires from timers that were cleared after their
//! message was already queued.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// The five named timers of a capture pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// No unit arrived within the startup window.
    Start,
    /// No bytes arrived within the idle window.
    Idle,
    /// No bytes arrived within the watchdog window.
    Watchdog,
    /// Graceful termination did not finish; escalate to a hard kill.
    Kill,
    /// The scheduled restart delay elapsed.
    Restart,
}

impl TimerKind {
    /// All slots, in teardown order.
    pub const ALL: [TimerKind; 5] = [
        TimerKind::Start,
        TimerKind::Idle,
        TimerKind::Watchdog,
        TimerKind::Kill,
        TimerKind::Restart,
    ];

    /// Returns the timer name for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Idle => "idle",
            Self::Watchdog => "watchdog",
            Self::Kill => "kill",
            Self::Restart => "restart",
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Start => 0,
            Self::Idle => 1,
            Self::Watchdog => 2,
            Self::Kill => 3,
            Self::Restart => 4,
        }
    }
}

/// A timer expiry delivered to the supervisor task.
#[derive(Debug, Clone, Copy)]
pub struct TimerFired {
    pub kind: TimerKind,
    generation: u64,
}

#[derive(Debug, Default)]
struct TimerSlot {
    generation: u64,
    handle: Option<AbortHandle>,
}

/// Five named single-shot timers with single-owner reset/clear semantics.
pub struct TimerBundle {
    slots: [TimerSlot; 5],
    tx: mpsc::UnboundedSender<TimerFired>,
}

impl TimerBundle {
    /// Creates a bundle and the receiver its expiries are delivered on.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                slots: std::array::from_fn(|_| TimerSlot::default()),
                tx,
            },
            rx,
        )
    }

    /// Cancels the named timer if armed. Safe to call repeatedly.
    pub fn clear(&mut self, kind: TimerKind) {
        let slot = &mut self.slots[kind.index()];
        slot.generation += 1;
        if let Some(handle) = slot.handle.take() {
            handle.abort();
        }
    }

    /// Arms the named timer, clearing any previous instance first.
    pub fn reset(&mut self, kind: TimerKind, after: Duration) {
        self.clear(kind);
        let slot = &mut self.slots[kind.index()];
        let generation = slot.generation;
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(TimerFired { kind, generation });
        });
        slot.handle = Some(handle.abort_handle());
    }

    /// Cancels every timer. Called on stop, broken, and successful attach.
    pub fn clear_all(&mut self) {
        for kind in TimerKind::ALL {
            self.clear(kind);
        }
    }

    /// Whether the named timer is currently armed.
    #[must_use]
    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots[kind.index()].handle.is_some()
    }

    /// Accepts or rejects a delivered expiry.
    ///
    /// Returns `false` for fires whose slot was cleared or re-armed after
    /// the message was queued. Accepting disarms the slot (single-shot).
    pub fn acknowledge(&mut self, fired: TimerFired) -> bool {
        let slot = &mut self.slots[fired.kind.index()];
        if slot.generation == fired.generation && slot.handle.is_some() {
            slot.handle = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{self, Duration};

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timer_fires_once() {
        let (mut timers, mut rx) = TimerBundle::new();
        timers.reset(TimerKind::Idle, Duration::from_millis(100));
        settle().await;

        time::advance(Duration::from_millis(100)).await;
        settle().await;

        let fired = rx.try_recv().expect("timer should have fired");
        assert_eq!(fired.kind, TimerKind::Idle);
        assert!(timers.acknowledge(fired));
        assert!(!timers.is_armed(TimerKind::Idle));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_timer_never_fires() {
        let (mut timers, mut rx) = TimerBundle::new();
        timers.reset(TimerKind::Watchdog, Duration::from_millis(100));
        settle().await;
        timers.clear(TimerKind::Watchdog);

        time::advance(Duration::from_millis(200)).await;
        settle().await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_fire_is_rejected_after_re_arm() {
        let (mut timers, mut rx) = TimerBundle::new();
        timers.reset(TimerKind::Restart, Duration::from_millis(50));
        settle().await;
        time::advance(Duration::from_millis(50)).await;
        settle().await;

        // The fire is queued, but the slot is re-armed before it is read.
        timers.reset(TimerKind::Restart, Duration::from_millis(500));
        settle().await;

        let stale = rx.try_recv().expect("stale fire was queued");
        assert!(!timers.acknowledge(stale));
        assert!(timers.is_armed(TimerKind::Restart));

        time::advance(Duration::from_millis(500)).await;
        settle().await;
        let fresh = rx.try_recv().expect("fresh fire expected");
        assert!(timers.acknowledge(fresh));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_all_disarms_every_slot() {
        let (mut timers, mut rx) = TimerBundle::new();
        for kind in TimerKind::ALL {
            timers.reset(kind, Duration::from_millis(10));
        }
        settle().await;
        timers.clear_all();
        for kind in TimerKind::ALL {
            assert!(!timers.is_armed(kind));
        }

        time::advance(Duration::from_millis(50)).await;
        settle().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn slots_are_independent() {
        let (mut timers, mut rx) = TimerBundle::new();
        timers.reset(TimerKind::Idle, Duration::from_millis(100));
        timers.reset(TimerKind::Watchdog, Duration::from_millis(200));
        settle().await;

        time::advance(Duration::from_millis(100)).await;
        settle().await;
        let fired = rx.try_recv().expect("idle should fire first");
        assert_eq!(fired.kind, TimerKind::Idle);
        assert!(timers.acknowledge(fired));
        assert!(timers.is_armed(TimerKind::Watchdog));

        time::advance(Duration::from_millis(100)).await;
        settle().await;
        let fired = rx.try_recv().expect("watchdog should fire second");
        assert_eq!(fired.kind, TimerKind::Watchdog);
        assert!(timers.acknowledge(fired));
    }
}
