//! Heartbeat driver: runs a [`HeartbeatState`] machine on real timers.
//!
//! The driver owns the interval and timeout timers and calls back into the
//! connection through two closures: `send_ping` and `on_timeout`. Callbacks
//! run outside the internal lock, so they may call back into the heartbeat.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use live_core::{HeartbeatAction, HeartbeatEvent, HeartbeatState};

use crate::config::HeartbeatConfig;
use crate::scheduler::{Scheduler, TimerHandle, TokioScheduler};

type Callback = Box<dyn Fn() + Send + Sync + 'static>;

/// Liveness monitor for one connection.
///
/// Dropping the heartbeat cancels its timers.
pub struct Heartbeat {
    inner: Arc<Inner>,
}

struct Inner {
    interval: Duration,
    timeout: Duration,
    scheduler: Arc<dyn Scheduler>,
    send_ping: Callback,
    on_timeout: Callback,
    timers: Mutex<Timers>,
}

#[derive(Default)]
struct Timers {
    state: HeartbeatState,
    interval: Option<TimerHandle>,
    timeout: Option<TimerHandle>,
    // Bumped on every arm and cancel so a late fire of an old timer is ignored.
    interval_epoch: u64,
    timeout_epoch: u64,
}

#[derive(Clone, Copy)]
enum Timer {
    Interval(u64),
    Timeout(u64),
}

impl Heartbeat {
    /// Create a stopped heartbeat on the tokio scheduler.
    pub fn new<P, T>(interval: Duration, timeout: Duration, send_ping: P, on_timeout: T) -> Self
    where
        P: Fn() + Send + Sync + 'static,
        T: Fn() + Send + Sync + 'static,
    {
        Self::with_scheduler(
            interval,
            timeout,
            Arc::new(TokioScheduler),
            send_ping,
            on_timeout,
        )
    }

    /// Create a stopped heartbeat from configuration.
    ///
    /// Returns `None` when the configuration disables heartbeats.
    pub fn from_config<P, T>(config: &HeartbeatConfig, send_ping: P, on_timeout: T) -> Option<Self>
    where
        P: Fn() + Send + Sync + 'static,
        T: Fn() + Send + Sync + 'static,
    {
        config
            .enabled()
            .then(|| Self::new(config.interval(), config.timeout(), send_ping, on_timeout))
    }

    /// Create a stopped heartbeat on a custom scheduler.
    pub fn with_scheduler<P, T>(
        interval: Duration,
        timeout: Duration,
        scheduler: Arc<dyn Scheduler>,
        send_ping: P,
        on_timeout: T,
    ) -> Self
    where
        P: Fn() + Send + Sync + 'static,
        T: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                interval,
                timeout,
                scheduler,
                send_ping: Box::new(send_ping),
                on_timeout: Box::new(on_timeout),
                timers: Mutex::new(Timers::default()),
            }),
        }
    }

    /// Reset and start the interval timer.
    pub fn start(&self) {
        Inner::handle(&self.inner, HeartbeatEvent::Start, None);
    }

    /// Cancel both timers. A no-op once stopped.
    pub fn stop(&self) {
        Inner::handle(&self.inner, HeartbeatEvent::Stop, None);
    }

    /// Record inbound traffic from the peer.
    pub fn message_received(&self) {
        Inner::handle(&self.inner, HeartbeatEvent::MessageReceived, None);
    }

    /// Current state.
    pub fn state(&self) -> HeartbeatState {
        self.inner.lock().state
    }

    /// Check whether a ping is outstanding.
    pub fn is_awaiting_pong(&self) -> bool {
        self.state().is_awaiting_pong()
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heartbeat")
            .field("interval", &self.inner.interval)
            .field("timeout", &self.inner.timeout)
            .field("state", &self.state())
            .finish()
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(this: &Arc<Self>, event: HeartbeatEvent, fired: Option<Timer>) {
        let mut ping = false;
        let mut timed_out = false;
        {
            let mut timers = this.lock();
            match fired {
                Some(Timer::Interval(epoch)) if epoch != timers.interval_epoch => return,
                Some(Timer::Timeout(epoch)) if epoch != timers.timeout_epoch => return,
                _ => {}
            }

            let (next, actions) = timers.state.on_event(event);
            timers.state = next;
            for action in actions {
                match action {
                    HeartbeatAction::StartIntervalTimer => {
                        timers.interval_epoch += 1;
                        let handle = this.arm(this.interval, Timer::Interval(timers.interval_epoch));
                        if let Some(old) = timers.interval.replace(handle) {
                            this.scheduler.clear_timer(old);
                        }
                    }
                    HeartbeatAction::CancelIntervalTimer => {
                        timers.interval_epoch += 1;
                        if let Some(old) = timers.interval.take() {
                            this.scheduler.clear_timer(old);
                        }
                    }
                    HeartbeatAction::StartTimeoutTimer => {
                        timers.timeout_epoch += 1;
                        let handle = this.arm(this.timeout, Timer::Timeout(timers.timeout_epoch));
                        if let Some(old) = timers.timeout.replace(handle) {
                            this.scheduler.clear_timer(old);
                        }
                    }
                    HeartbeatAction::CancelTimeoutTimer => {
                        timers.timeout_epoch += 1;
                        if let Some(old) = timers.timeout.take() {
                            this.scheduler.clear_timer(old);
                        }
                    }
                    HeartbeatAction::SendPing => ping = true,
                    HeartbeatAction::NotifyTimeout => timed_out = true,
                }
            }
        }

        if ping {
            tracing::trace!("heartbeat: sending ping");
            (this.send_ping)();
        }
        if timed_out {
            tracing::debug!("heartbeat: no traffic within {:?}, peer timed out", this.timeout);
            (this.on_timeout)();
        }
    }

    fn arm(self: &Arc<Self>, delay: Duration, timer: Timer) -> TimerHandle {
        let weak: Weak<Self> = Arc::downgrade(self);
        self.scheduler.set_timer(
            delay,
            Box::new(move || {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let event = match timer {
                    Timer::Interval(_) => HeartbeatEvent::IntervalElapsed,
                    Timer::Timeout(_) => HeartbeatEvent::TimeoutElapsed,
                };
                Inner::handle(&inner, event, Some(timer));
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Instant};

    struct Recorder {
        pings: Arc<AtomicUsize>,
        timeouts: Arc<AtomicUsize>,
        timed_out_at: Arc<Mutex<Option<Instant>>>,
    }

    fn heartbeat(interval_ms: u64, timeout_ms: u64) -> (Heartbeat, Recorder) {
        let recorder = Recorder {
            pings: Arc::new(AtomicUsize::new(0)),
            timeouts: Arc::new(AtomicUsize::new(0)),
            timed_out_at: Arc::new(Mutex::new(None)),
        };
        let pings = Arc::clone(&recorder.pings);
        let timeouts = Arc::clone(&recorder.timeouts);
        let timed_out_at = Arc::clone(&recorder.timed_out_at);
        let hb = Heartbeat::new(
            Duration::from_millis(interval_ms),
            Duration::from_millis(timeout_ms),
            move || {
                pings.fetch_add(1, Ordering::SeqCst);
            },
            move || {
                timeouts.fetch_add(1, Ordering::SeqCst);
                *timed_out_at.lock().unwrap() = Some(Instant::now());
            },
        );
        (hb, recorder)
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_exactly_once() {
        let (hb, recorder) = heartbeat(50, 50);
        let started = Instant::now();
        hb.start();

        sleep(Duration::from_millis(99)).await;
        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.pings.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 1);
        let at = recorder.timed_out_at.lock().unwrap().unwrap();
        let elapsed = at - started;
        assert!(
            elapsed >= Duration::from_millis(100) && elapsed < Duration::from_millis(110),
            "timed out after {:?}",
            elapsed
        );
        assert_eq!(hb.state(), HeartbeatState::Stopped);

        // Nothing is armed any more, and stop() is a no-op.
        hb.stop();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_traffic_never_times_out() {
        let (hb, recorder) = heartbeat(50, 50);
        hb.start();

        for _ in 0..40 {
            sleep(Duration::from_millis(30)).await;
            hb.message_received();
        }

        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.pings.load(Ordering::SeqCst), 0);
        assert!(hb.state().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_just_before_interval_skips_ping() {
        let (hb, recorder) = heartbeat(50, 50);
        hb.start();

        sleep(Duration::from_millis(49)).await;
        hb.message_received();
        sleep(Duration::from_millis(2)).await;

        assert_eq!(recorder.pings.load(Ordering::SeqCst), 0);
        assert!(!hb.is_awaiting_pong());
    }

    #[tokio::test(start_paused = true)]
    async fn pong_before_timeout_restarts_cleanly() {
        let (hb, recorder) = heartbeat(50, 50);
        hb.start();

        sleep(Duration::from_millis(60)).await;
        assert_eq!(recorder.pings.load(Ordering::SeqCst), 1);
        assert!(hb.is_awaiting_pong());

        hb.message_received();
        assert!(!hb.is_awaiting_pong());

        // The old timeout (due at 100ms) must not fire.
        sleep(Duration::from_millis(60)).await;
        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 0);

        // Silence afterwards pings again at 150ms and times out at 200ms.
        sleep(Duration::from_millis(85)).await;
        assert_eq!(recorder.pings.load(Ordering::SeqCst), 2);
        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_timers() {
        let (hb, recorder) = heartbeat(50, 50);
        hb.start();
        sleep(Duration::from_millis(60)).await;
        hb.stop();

        sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_timeout_runs_again() {
        let (hb, recorder) = heartbeat(50, 50);
        hb.start();
        sleep(Duration::from_millis(110)).await;
        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 1);

        hb.start();
        sleep(Duration::from_millis(110)).await;
        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_heartbeat_cancels_timers() {
        let (hb, recorder) = heartbeat(50, 50);
        hb.start();
        drop(hb);

        sleep(Duration::from_secs(1)).await;
        assert_eq!(recorder.pings.load(Ordering::SeqCst), 0);
        assert_eq!(recorder.timeouts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disabled_config_builds_nothing() {
        let config = HeartbeatConfig {
            interval_ms: 0,
            timeout_ms: 0,
        };
        assert!(Heartbeat::from_config(&config, || {}, || {}).is_none());
    }
}
