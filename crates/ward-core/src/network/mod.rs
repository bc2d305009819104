//! Network monitor.
//!
//! Tracks connectivity transitions reported by the host platform (or by a
//! polling [`ConnectivityProbe`]) and publishes them to the queue and UI
//! collaborators. While offline a cooperative ticker keeps
//! `offline_duration_ms` live; it is aborted on the online transition and on
//! shutdown.

mod probe;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SyncSettings;
use crate::models::{ConnectivityState, ConnectivityTransition};

pub use probe::{ConnectivityProbe, HttpProbe};

/// Connectivity monitor owned by the application and passed to consumers.
///
/// Must be constructed inside a tokio runtime. Dropping the monitor stops it.
pub struct NetworkMonitor {
    shared: Arc<Shared>,
}

struct Shared {
    state: Arc<watch::Sender<ConnectivityState>>,
    transitions: broadcast::Sender<ConnectivityTransition>,
    tick: Duration,
    control: Mutex<Control>,
}

#[derive(Default)]
struct Control {
    offline_since: Option<Instant>,
    ticker: Option<JoinHandle<()>>,
    probe: Option<JoinHandle<()>>,
    stopped: bool,
}

impl NetworkMonitor {
    /// Create a monitor seeded with the platform's current connectivity.
    ///
    /// Starting offline synthesizes the offline transition immediately.
    pub fn new(initially_online: bool, settings: &SyncSettings) -> Self {
        let (state, _) = watch::channel(ConnectivityState::online());
        let (transitions, _) = broadcast::channel(settings.channel_capacity.max(1));
        let monitor = Self {
            shared: Arc::new(Shared {
                state: Arc::new(state),
                transitions,
                tick: settings.offline_tick,
                control: Mutex::new(Control::default()),
            }),
        };
        if !initially_online {
            monitor.shared.apply(false);
        }
        monitor
    }

    /// Snapshot of the current state
    pub fn state(&self) -> ConnectivityState {
        *self.shared.state.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.state().is_online
    }

    /// Receiver that observes every state change, including duration ticks
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.shared.state.subscribe()
    }

    /// Receiver of online/offline edges
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityTransition> {
        self.shared.transitions.subscribe()
    }

    /// Run `callback` for every transition until the returned guard drops
    pub fn on_transition<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectivityTransition) + Send + 'static,
    {
        let mut receiver = self.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(transition) => callback(transition),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Transition subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Subscription { handle }
    }

    /// Platform connectivity signal. Repeated reports of the current state
    /// are ignored.
    pub fn set_online(&self, online: bool) {
        self.shared.apply(online);
    }

    /// Ask a probe once and apply the answer
    pub async fn probe_now(&self, probe: &dyn ConnectivityProbe) -> bool {
        let online = probe.probe().await;
        self.shared.apply(online);
        online
    }

    /// Poll `probe` every `interval`, replacing any previous probe task
    pub fn start_probe(&self, probe: Arc<dyn ConnectivityProbe>, interval: Duration) {
        let mut control = self.shared.lock_control();
        if control.stopped {
            return;
        }
        if let Some(previous) = control.probe.take() {
            previous.abort();
        }

        let shared = Arc::clone(&self.shared);
        control.probe = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = probe.probe().await;
                shared.apply(online);
            }
        }));
    }

    /// Tear down the ticker and probe tasks; later signals are ignored
    pub fn stop(&self) {
        let mut control = self.shared.lock_control();
        if control.stopped {
            return;
        }
        control.stopped = true;
        if let Some(ticker) = control.ticker.take() {
            ticker.abort();
        }
        if let Some(probe) = control.probe.take() {
            probe.abort();
        }
        tracing::debug!("Network monitor stopped");
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock_control(&self) -> std::sync::MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, online: bool) {
        let mut control = self.lock_control();
        if control.stopped {
            return;
        }

        let current = *self.state.borrow();
        if current.is_online == online {
            return;
        }

        if online {
            if let Some(ticker) = control.ticker.take() {
                ticker.abort();
            }
            let offline_duration_ms = control
                .offline_since
                .take()
                .map_or(0, |since| duration_ms(since.elapsed()));
            self.state.send_modify(|state| {
                state.is_online = true;
                state.offline_duration_ms = offline_duration_ms;
            });
            tracing::info!(offline_duration_ms, "Connectivity restored");
            let _ = self
                .transitions
                .send(ConnectivityTransition::WentOnline {
                    offline_duration_ms,
                });
        } else {
            let since = Instant::now();
            control.offline_since = Some(since);
            self.state.send_modify(|state| {
                state.is_online = false;
                state.was_offline = true;
                state.offline_duration_ms = 0;
            });
            if let Some(previous) = control.ticker.take() {
                previous.abort();
            }
            control.ticker = Some(spawn_ticker(Arc::clone(&self.state), since, self.tick));
            tracing::warn!("Connectivity lost; writes will be queued");
            let _ = self.transitions.send(ConnectivityTransition::WentOffline);
        }
    }
}

fn spawn_ticker(
    state: Arc<watch::Sender<ConnectivityState>>,
    since: Instant,
    tick: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(since + tick, tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let elapsed = duration_ms(since.elapsed());
            state.send_if_modified(|state| {
                if state.is_online || elapsed <= state.offline_duration_ms {
                    return false;
                }
                state.offline_duration_ms = elapsed;
                true
            });
        }
    })
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Guard for an [`NetworkMonitor::on_transition`] callback
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn settings() -> SyncSettings {
        SyncSettings {
            offline_tick: Duration::from_secs(1),
            ..SyncSettings::default()
        }
    }

    /// Let spawned tasks observe the current (paused) clock
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn was_offline_is_sticky() {
        let monitor = NetworkMonitor::new(true, &settings());
        assert!(!monitor.state().was_offline);

        monitor.set_online(false);
        assert!(monitor.state().was_offline);
        monitor.set_online(true);
        assert!(monitor.state().was_offline);
        monitor.set_online(false);
        monitor.set_online(true);
        assert!(monitor.state().was_offline);
        assert!(monitor.is_online());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn final_duration_matches_offline_period() {
        let monitor = NetworkMonitor::new(true, &settings());
        monitor.set_online(false);

        tokio::time::advance(Duration::from_millis(3_400)).await;
        settle().await;
        let live = monitor.state().offline_duration_ms;
        assert!((2_000..=3_400).contains(&live), "live duration {live}");

        monitor.set_online(true);
        let state = monitor.state();
        assert!(state.is_online);
        assert!(state.offline_duration_ms.abs_diff(3_400) <= 1_000);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(monitor.state().offline_duration_ms, state.offline_duration_ms);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn duration_is_non_decreasing_while_offline() {
        let monitor = NetworkMonitor::new(true, &settings());
        let mut watcher = monitor.watch();
        monitor.set_online(false);

        let mut last = 0;
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
            let _ = watcher.borrow_and_update();
            let current = monitor.state().offline_duration_ms;
            assert!(current >= last);
            last = current;
        }
        assert!(last >= 3_000);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn constructed_offline_synthesizes_transition() {
        let monitor = NetworkMonitor::new(false, &settings());
        let state = monitor.state();
        assert!(!state.is_online);
        assert!(state.was_offline);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(monitor.state().offline_duration_ms >= 1_000);

        monitor.set_online(true);
        assert!(monitor.state().offline_duration_ms >= 2_000);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn duplicate_signals_do_not_emit_transitions() {
        let monitor = NetworkMonitor::new(true, &settings());
        let mut transitions = monitor.subscribe();

        monitor.set_online(true);
        monitor.set_online(false);
        monitor.set_online(false);
        monitor.set_online(true);

        assert_eq!(
            transitions.recv().await.unwrap(),
            ConnectivityTransition::WentOffline
        );
        assert!(matches!(
            transitions.recv().await.unwrap(),
            ConnectivityTransition::WentOnline { .. }
        ));
        assert!(transitions.try_recv().is_err());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn stop_tears_down_ticker_and_ignores_signals() {
        let monitor = NetworkMonitor::new(true, &settings());
        monitor.set_online(false);
        monitor.stop();

        tokio::time::advance(Duration::from_secs(3)).await;
        settle().await;
        assert_eq!(monitor.state().offline_duration_ms, 0);

        monitor.set_online(true);
        assert!(!monitor.is_online());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn on_transition_callback_runs_until_unsubscribed() {
        let monitor = NetworkMonitor::new(true, &settings());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let subscription = monitor.on_transition(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        monitor.set_online(false);
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        monitor.set_online(true);
        settle().await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    struct FlagProbe(AtomicBool);

    #[async_trait]
    impl ConnectivityProbe for FlagProbe {
        async fn probe(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn probe_fallback_drives_transitions() {
        let monitor = NetworkMonitor::new(true, &settings());
        let probe = Arc::new(FlagProbe(AtomicBool::new(false)));

        assert!(!monitor.probe_now(probe.as_ref()).await);
        assert!(!monitor.is_online());

        monitor.start_probe(probe.clone(), Duration::from_secs(5));
        probe.0.store(true, Ordering::SeqCst);
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert!(monitor.is_online());
    }
}
