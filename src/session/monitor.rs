// Per-session background work: idle monitoring and predictive renewal
// Every timer is tracked by session id so sessions never share a handle

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, info};

use crate::config::SessionPolicyConfig;

/// Task handles keyed by session id.
/// Each handle carries a generation so a task can unregister itself
/// without removing a newer replacement.
pub struct TimerRegistry {
    name: &'static str,
    next_generation: AtomicU64,
    handles: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
}

impl TimerRegistry {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_generation: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, (u64, JoinHandle<()>)>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a task for a session, aborting the one it replaces.
    /// The closure receives the generation assigned to the new task.
    pub fn spawn<F, Fut>(&self, session_id: &str, task: F)
    where
        F: FnOnce(u64) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut handles = self.lock();
        let handle = tokio::spawn(task(generation));
        if let Some((_, previous)) = handles.insert(session_id.to_string(), (generation, handle)) {
            previous.abort();
        }
    }

    /// Abort and forget the session's task
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.lock().remove(session_id) {
            Some((_, handle)) => {
                handle.abort();
                debug!("Cancelled {} timer for session {}", self.name, session_id);
                true
            }
            None => false,
        }
    }

    /// Forget the session's task without aborting it, if it is still `generation`
    pub fn detach(&self, session_id: &str, generation: u64) -> bool {
        let mut handles = self.lock();
        if handles.get(session_id).is_some_and(|(g, _)| *g == generation) {
            handles.remove(session_id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&self) -> usize {
        let mut handles = self.lock();
        let count = handles.len();
        for (_, (_, handle)) in handles.drain() {
            handle.abort();
        }
        count
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

/// Activity timestamps read by the monitor on each tick
#[derive(Debug, Clone, Copy)]
pub struct ActivitySnapshot {
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityVerdict {
    Active,
    IdleWarning { idle: Duration, timeout: Duration },
    IdleTimeout,
    Expired,
}

/// Callbacks the background tasks drive; implemented by the lifecycle manager
#[async_trait]
pub trait MonitorTarget: Send + Sync {
    /// None once the session no longer exists
    async fn activity_snapshot(&self, session_id: &str) -> Option<ActivitySnapshot>;

    async fn on_idle_warning(&self, session_id: &str, idle: Duration, timeout: Duration);

    async fn on_idle_timeout(&self, session_id: &str);

    async fn on_expired(&self, session_id: &str);

    async fn on_renewal_due(&self, session_id: &str);
}

/// Periodic idle/expiry check, one task per session
pub struct ActivityMonitor {
    period: std::time::Duration,
    idle_timeout: Option<Duration>,
    warning_ratio: f64,
    timers: Arc<TimerRegistry>,
}

impl ActivityMonitor {
    pub fn new(config: &SessionPolicyConfig) -> Self {
        Self {
            period: config.cleanup_interval(),
            idle_timeout: config.idle_timeout(),
            warning_ratio: config.idle_warning_ratio,
            timers: Arc::new(TimerRegistry::new("activity")),
        }
    }

    pub fn assess(&self, snapshot: &ActivitySnapshot, now: DateTime<Utc>) -> ActivityVerdict {
        if now > snapshot.expires_at {
            return ActivityVerdict::Expired;
        }

        let Some(timeout) = self.idle_timeout else {
            return ActivityVerdict::Active;
        };

        let idle = now - snapshot.last_activity;
        if idle > timeout {
            return ActivityVerdict::IdleTimeout;
        }

        let warn_after =
            Duration::milliseconds((timeout.num_milliseconds() as f64 * self.warning_ratio) as i64);
        if idle > warn_after {
            ActivityVerdict::IdleWarning { idle, timeout }
        } else {
            ActivityVerdict::Active
        }
    }

    /// Start (or restart) monitoring a session
    pub fn start(self: &Arc<Self>, session_id: &str, target: Weak<dyn MonitorTarget>) {
        if self.period.is_zero() {
            return;
        }

        let monitor = Arc::clone(self);
        let id = session_id.to_string();

        self.timers.spawn(session_id, move |generation| async move {
            let mut ticker = interval(monitor.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            // Last activity value we already warned about
            let mut warned_for: Option<DateTime<Utc>> = None;

            loop {
                ticker.tick().await;

                let Some(target) = target.upgrade() else {
                    break;
                };

                let Some(snapshot) = target.activity_snapshot(&id).await else {
                    monitor.timers.detach(&id, generation);
                    break;
                };

                match monitor.assess(&snapshot, Utc::now()) {
                    ActivityVerdict::Active => {}
                    ActivityVerdict::IdleWarning { idle, timeout } => {
                        if warned_for != Some(snapshot.last_activity) {
                            warned_for = Some(snapshot.last_activity);
                            target.on_idle_warning(&id, idle, timeout).await;
                        }
                    }
                    ActivityVerdict::IdleTimeout => {
                        monitor.timers.detach(&id, generation);
                        info!("Session {} idle timeout detected by monitor", id);
                        target.on_idle_timeout(&id).await;
                        break;
                    }
                    ActivityVerdict::Expired => {
                        monitor.timers.detach(&id, generation);
                        info!("Session {} expiry detected by monitor", id);
                        target.on_expired(&id).await;
                        break;
                    }
                }
            }
        });
    }

    pub fn stop(&self, session_id: &str) -> bool {
        self.timers.cancel(session_id)
    }

    pub fn is_monitoring(&self, session_id: &str) -> bool {
        self.timers.contains(session_id)
    }

    pub fn active_count(&self) -> usize {
        self.timers.len()
    }

    pub fn stop_all(&self) -> usize {
        self.timers.cancel_all()
    }
}

/// One-shot renewal ahead of expiry, one timer per session
pub struct PredictiveRenewalScheduler {
    enabled: bool,
    threshold: f64,
    timers: Arc<TimerRegistry>,
}

impl PredictiveRenewalScheduler {
    pub fn new(config: &SessionPolicyConfig) -> Self {
        Self {
            enabled: config.predictive_renewal,
            threshold: config.renewal_threshold,
            timers: Arc::new(TimerRegistry::new("predictive_renewal")),
        }
    }

    /// `expires_at - ttl * threshold`
    pub fn fire_time(&self, expires_at: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        let lead = Duration::milliseconds((ttl.num_milliseconds() as f64 * self.threshold) as i64);
        expires_at - lead
    }

    /// Schedule (or reschedule) renewal; returns the fire time when a timer was set.
    /// A fire time already in the past cancels any pending timer instead.
    pub fn schedule(
        &self,
        session_id: &str,
        expires_at: DateTime<Utc>,
        ttl: Duration,
        target: Weak<dyn MonitorTarget>,
    ) -> Option<DateTime<Utc>> {
        if !self.enabled {
            return None;
        }

        let fire_at = self.fire_time(expires_at, ttl);
        let Ok(delay) = (fire_at - Utc::now()).to_std() else {
            self.timers.cancel(session_id);
            debug!(
                "Predictive renewal for session {} is already due, not scheduling",
                session_id
            );
            return None;
        };

        let timers = Arc::clone(&self.timers);
        let id = session_id.to_string();

        self.timers.spawn(session_id, move |generation| async move {
            sleep(delay).await;
            timers.detach(&id, generation);

            if let Some(target) = target.upgrade() {
                debug!("Predictive renewal due for session {}", id);
                target.on_renewal_due(&id).await;
            }
        });

        debug!(
            "Scheduled predictive renewal for session {} at {}",
            session_id, fire_at
        );
        Some(fire_at)
    }

    pub fn cancel(&self, session_id: &str) -> bool {
        self.timers.cancel(session_id)
    }

    pub fn is_scheduled(&self, session_id: &str) -> bool {
        self.timers.contains(session_id)
    }

    pub fn scheduled_count(&self) -> usize {
        self.timers.len()
    }

    pub fn cancel_all(&self) -> usize {
        self.timers.cancel_all()
    }
}
