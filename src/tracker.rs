//! Subscription state tracking and load balancing decisions.
//!
//! The tracker owns the runtime record of every configured subscription,
//! picks the credential most likely to succeed for a new request, bounds
//! per-subscription concurrency, and keeps 429 cooldown deadlines.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::configuration::SubscriptionConfig;
use crate::metric::Metrics;

const AFFINITY_BONUS: f64 = 3.0;
const SHORT_WINDOW_HOURS: f64 = 5.0;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}

/// Client workload classification, read from the `X-Client-Class` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientClass {
    Light,
    Medium,
    Heavy,
}

impl ClientClass {
    pub fn parse(s: &str) -> Option<ClientClass> {
        match s.to_ascii_lowercase().as_str() {
            "light" => Some(ClientClass::Light),
            "medium" => Some(ClientClass::Medium),
            "heavy" => Some(ClientClass::Heavy),
            _ => None,
        }
    }
}

/// One advisory usage sample for a rate-limit window.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct WindowUsage {
    /// Percentage of the window's budget already used (0.0-100.0+).
    pub utilization: f64,
    /// Hours until the window resets.
    pub hours_to_reset: f64,
}

/// Advisory utilisation sample for one subscription. Missing windows mean
/// "no data" and are treated as neutral by the scorer.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct UtilizationSample {
    #[serde(default)]
    pub five_hour: Option<WindowUsage>,
    #[serde(default)]
    pub seven_day: Option<WindowUsage>,
}

/// Runtime state for a subscription.
#[derive(Debug)]
pub struct SubscriptionState {
    config: SubscriptionConfig,
    enabled: AtomicBool,
    active: AtomicUsize,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    /// Unix-millisecond deadline; 0 means not cooling down. Only ever moves
    /// forward in time.
    cooldown_until_ms: AtomicU64,
}

impl SubscriptionState {
    fn new(config: SubscriptionConfig) -> Self {
        let enabled = config.enabled;
        Self {
            config,
            enabled: AtomicBool::new(enabled),
            active: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            cooldown_until_ms: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn api_key(&self) -> &str {
        &self.config.api_key
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    pub fn priority(&self) -> u32 {
        self.config.priority
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    pub fn available_capacity(&self) -> usize {
        self.max_concurrent().saturating_sub(self.active())
    }

    fn cooldown_remaining_ms(&self, now_ms: u64) -> u64 {
        self.cooldown_until_ms
            .load(Ordering::SeqCst)
            .saturating_sub(now_ms)
    }

    pub fn in_cooldown(&self) -> bool {
        self.cooldown_remaining_ms(now_ms()) > 0
    }
}

/// A held concurrency slot. Dropping the guard releases the slot, whatever
/// path the request took to get there.
pub struct ConnectionGuard {
    state: Arc<SubscriptionState>,
}

impl ConnectionGuard {
    pub fn subscription(&self) -> &Arc<SubscriptionState> {
        &self.state
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        // checked_sub keeps a stray double-release from driving active negative
        let _ = self
            .state
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        log::debug!(
            "{}: released connection ({}/{})",
            self.state.name(),
            self.state.active(),
            self.state.max_concurrent()
        );
    }
}

/// Per-subscription status snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    pub name: String,
    pub active: usize,
    pub max_concurrent: usize,
    pub available: usize,
    pub in_cooldown: bool,
    pub cooldown_remaining_secs: u64,
    pub total_requests: u64,
    pub total_errors: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackerStatus {
    pub subscriptions: Vec<SubscriptionStatus>,
    pub total_active: usize,
    pub total_capacity: usize,
    pub available_capacity: usize,
}

/// Tracks subscription states and makes the routing decision for each
/// request. Safe for concurrent use; no lock is held across I/O.
pub struct SubscriptionTracker {
    cooldown: Duration,
    states: RwLock<BTreeMap<String, Arc<SubscriptionState>>>,
    utilization: RwLock<HashMap<String, UtilizationSample>>,
    /// client_id -> subscription the client last landed on
    affinity: Mutex<HashMap<String, String>>,
    metrics: Arc<Metrics>,
}

impl SubscriptionTracker {
    pub fn new(
        subscriptions: Vec<SubscriptionConfig>,
        cooldown_seconds: u64,
        metrics: Arc<Metrics>,
    ) -> Self {
        let states: BTreeMap<String, Arc<SubscriptionState>> = subscriptions
            .into_iter()
            .map(|sub| (sub.name.clone(), Arc::new(SubscriptionState::new(sub))))
            .collect();
        log::info!("initialized tracker with {} subscriptions", states.len());
        Self {
            cooldown: Duration::from_secs(cooldown_seconds),
            states: RwLock::new(states),
            utilization: RwLock::new(HashMap::new()),
            affinity: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn is_empty(&self) -> bool {
        self.states.read().expect("tracker states poisoned").is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<SubscriptionState>> {
        self.states
            .read()
            .expect("tracker states poisoned")
            .get(name)
            .cloned()
    }

    pub fn subscriptions(&self) -> Vec<Arc<SubscriptionState>> {
        self.states
            .read()
            .expect("tracker states poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Select the best subscription for a new request, or `None` when every
    /// subscription is disabled, saturated, or cooling down.
    pub fn select(
        &self,
        client_id: Option<&str>,
        classification: Option<ClientClass>,
    ) -> Option<Arc<SubscriptionState>> {
        let now = now_ms();
        let preferred = client_id.and_then(|id| {
            self.affinity
                .lock()
                .expect("affinity map poisoned")
                .get(id)
                .cloned()
        });

        let states = self.states.read().expect("tracker states poisoned");
        let utilization = self.utilization.read().expect("utilization map poisoned");

        let mut candidates: Vec<(f64, &Arc<SubscriptionState>)> = Vec::new();
        for state in states.values() {
            if !state.enabled() {
                continue;
            }
            if state.available_capacity() == 0 {
                continue;
            }
            if state.cooldown_remaining_ms(now) > 0 {
                continue;
            }
            let score = self.score(
                state,
                preferred.as_deref(),
                classification,
                utilization.get(state.name()),
            );
            candidates.push((score, state));
        }

        if candidates.is_empty() {
            log::warn!("no subscriptions available");
            return None;
        }

        candidates.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.priority().cmp(&b.priority()))
        });

        let selected = candidates[0].1;
        log::debug!(
            "selected {} (capacity: {}, priority: {})",
            selected.name(),
            selected.available_capacity(),
            selected.priority()
        );
        Some(Arc::clone(selected))
    }

    /// Higher is better. With no utilisation sample, no affinity and no rate
    /// hint this reduces to available capacity plus the priority bonus, i.e.
    /// an ordering by (-available_capacity, priority).
    fn score(
        &self,
        state: &SubscriptionState,
        preferred: Option<&str>,
        classification: Option<ClientClass>,
        sample: Option<&UtilizationSample>,
    ) -> f64 {
        let mut score = state.available_capacity() as f64;

        if preferred == Some(state.name()) {
            score += AFFINITY_BONUS;
        }

        if let Some(sample) = sample {
            if let Some(short) = sample.five_hour {
                let elapsed =
                    (SHORT_WINDOW_HOURS - short.hours_to_reset).clamp(0.0, SHORT_WINDOW_HOURS);
                let expected = elapsed / SHORT_WINDOW_HOURS * 100.0;
                let pacing = expected - short.utilization;
                score += (pacing / 10.0).clamp(-5.0, 5.0);
            }
            if classification == Some(ClientClass::Heavy) {
                let pct = sample
                    .five_hour
                    .or(sample.seven_day)
                    .map_or(0.0, |w| w.utilization);
                if pct > 80.0 {
                    score -= 3.0;
                }
            }
            if let Some(long) = sample.seven_day {
                if long.hours_to_reset < 12.0 && long.utilization < 50.0 {
                    score += 2.0;
                }
            }
        }

        let rpm = self.metrics.requests_per_minute(state.name());
        if rpm > 20 {
            score -= 3.0;
        } else if rpm > 10 {
            score -= 1.0;
        }

        score += (10.0 - f64::from(state.priority())) / 10.0;
        score
    }

    /// Claim a concurrency slot on `state`. Select and acquire are not
    /// atomic: the capacity check is re-done here, and `None` means another
    /// request won the race and the caller should re-select.
    pub fn try_acquire(&self, state: &Arc<SubscriptionState>) -> Option<ConnectionGuard> {
        let max = state.max_concurrent();
        state
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                (v < max).then_some(v + 1)
            })
            .ok()?;
        state.total_requests.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "{}: acquired connection ({}/{})",
            state.name(),
            state.active(),
            max
        );
        Some(ConnectionGuard {
            state: Arc::clone(state),
        })
    }

    /// Remember which subscription a client landed on, for the affinity bonus.
    pub fn record_affinity(&self, client_id: &str, subscription: &str) {
        self.affinity
            .lock()
            .expect("affinity map poisoned")
            .insert(client_id.to_string(), subscription.to_string());
    }

    /// Record a 429, putting the subscription in cooldown. A later deadline
    /// always wins; an earlier one never shortens an existing cooldown.
    pub fn record_rate_limit(&self, state: &SubscriptionState) {
        let deadline = now_ms() + self.cooldown.as_millis() as u64;
        state
            .cooldown_until_ms
            .fetch_max(deadline, Ordering::SeqCst);
        state.total_errors.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "{}: 429 received, entering cooldown for {}s",
            state.name(),
            self.cooldown.as_secs()
        );
    }

    /// Record a non-429 error. Does not cool the subscription down.
    pub fn record_error(&self, state: &SubscriptionState) {
        state.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Replace the advisory utilisation snapshot wholesale.
    pub fn set_utilization(&self, samples: HashMap<String, UtilizationSample>) {
        *self.utilization.write().expect("utilization map poisoned") = samples;
    }

    /// Enable or disable a subscription at runtime. Takes effect on the next
    /// selection; in-flight requests are not aborted. Returns false when the
    /// name is unknown.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.get(name) {
            Some(state) => {
                state.enabled.store(enabled, Ordering::SeqCst);
                log::info!(
                    "{}: {}",
                    name,
                    if enabled { "enabled" } else { "disabled" }
                );
                true
            }
            None => false,
        }
    }

    /// Install a new subscription set. States whose config is unchanged are
    /// carried over with their counters and cooldown; in-flight requests
    /// against retired states drain out against the old records.
    pub fn replace_subscriptions(&self, subscriptions: Vec<SubscriptionConfig>) {
        let next: BTreeMap<String, Arc<SubscriptionState>> = {
            let current = self.states.read().expect("tracker states poisoned");
            subscriptions
                .into_iter()
                .map(|sub| {
                    let state = match current.get(&sub.name) {
                        Some(existing) if existing.config == sub => Arc::clone(existing),
                        _ => Arc::new(SubscriptionState::new(sub.clone())),
                    };
                    (sub.name, state)
                })
                .collect()
        };
        log::info!("installed {} subscriptions", next.len());
        *self.states.write().expect("tracker states poisoned") = next;
    }

    pub fn status(&self) -> TrackerStatus {
        let now = now_ms();
        let states = self.states.read().expect("tracker states poisoned");

        let subscriptions: Vec<SubscriptionStatus> = states
            .values()
            .map(|state| {
                let remaining_ms = state.cooldown_remaining_ms(now);
                SubscriptionStatus {
                    name: state.name().to_string(),
                    active: state.active(),
                    max_concurrent: state.max_concurrent(),
                    available: state.available_capacity(),
                    in_cooldown: remaining_ms > 0,
                    cooldown_remaining_secs: remaining_ms.div_ceil(1000),
                    total_requests: state.total_requests(),
                    total_errors: state.total_errors(),
                    enabled: state.enabled(),
                }
            })
            .collect();

        let total_active = subscriptions.iter().map(|s| s.active).sum();
        let total_capacity = subscriptions
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.max_concurrent)
            .sum::<usize>();

        TrackerStatus {
            subscriptions,
            total_active,
            total_capacity,
            available_capacity: total_capacity.saturating_sub(total_active),
        }
    }
}
