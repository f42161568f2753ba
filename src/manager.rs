use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::health;
use crate::launcher::{self, LaunchConfig, LaunchError};
use crate::types::{AuthProfile, ChildPorts, ChildProcess, ProfileQueue, ProfileSlot};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(10);

pub type LaunchFn = Arc<
    dyn Fn(&AuthProfile, ChildPorts, &LaunchConfig) -> Result<Arc<ChildProcess>, LaunchError>
        + Send
        + Sync,
>;

pub type HealthCheckFn =
    Arc<dyn Fn(Arc<ChildProcess>, Duration) -> BoxFuture<'static, bool> + Send + Sync>;

struct SlotState {
    slots: Vec<ProfileSlot>,
    queue: ProfileQueue,
}

/// Manage the fixed pool of profile slots and recycle profiles on eviction.
///
/// Each slot is identified by its port triplet, which never changes; only the
/// occupant (profile + child process) rotates. All mutation happens under one
/// OS mutex, which is also what makes `evict_child` safe to call from the
/// watchdog thread.
pub struct SlotManager {
    inner: Mutex<SlotState>,
    config: LaunchConfig,
    launch: LaunchFn,
}

impl SlotManager {
    pub fn new(ports: Vec<ChildPorts>, queue: ProfileQueue, config: LaunchConfig) -> Self {
        Self::with_launcher(ports, queue, config, Arc::new(launcher::launch_child))
    }

    pub fn with_launcher(
        ports: Vec<ChildPorts>,
        queue: ProfileQueue,
        config: LaunchConfig,
        launch: LaunchFn,
    ) -> Self {
        Self {
            inner: Mutex::new(SlotState {
                slots: ports.into_iter().map(ProfileSlot::new).collect(),
                queue,
            }),
            config,
            launch,
        }
    }

    /// Launch the initial set of profiles across the configured slots, in
    /// order. On any failure every already-launched slot is terminated and
    /// the error propagates.
    pub fn bootstrap(
        &self,
        profiles: &[AuthProfile],
    ) -> Result<Vec<Arc<ChildProcess>>, LaunchError> {
        let mut state = self.inner.lock().expect("slot state poisoned");
        if profiles.len() > state.slots.len() {
            return Err(LaunchError::TooManyProfiles {
                profiles: profiles.len(),
                slots: state.slots.len(),
            });
        }

        let mut children = Vec::with_capacity(profiles.len());
        for (index, profile) in profiles.iter().enumerate() {
            match self.launch_into_slot(&mut state.slots[index], profile.clone()) {
                Ok(child) => children.push(child),
                Err(err) => {
                    for launched in &mut state.slots[..index] {
                        Self::terminate_slot(launched, Some("bootstrap failure"));
                    }
                    return Err(err);
                }
            }
        }
        Ok(children)
    }

    /// Snapshot of the currently occupied slots.
    pub fn live_children(&self) -> Vec<Arc<ChildProcess>> {
        let state = self.inner.lock().expect("slot state poisoned");
        state
            .slots
            .iter()
            .filter_map(|slot| slot.child.clone())
            .collect()
    }

    /// Per-slot view of (ports, assigned profile name).
    pub fn snapshot(&self) -> Vec<(ChildPorts, Option<String>)> {
        let state = self.inner.lock().expect("slot state poisoned");
        state
            .slots
            .iter()
            .map(|slot| (slot.ports, slot.profile.as_ref().map(|p| p.name.clone())))
            .collect()
    }

    /// Names of the profiles currently idling in the rotation queue.
    pub fn queued_profiles(&self) -> Vec<String> {
        let state = self.inner.lock().expect("slot state poisoned");
        state.queue.names()
    }

    pub fn clear_queue(&self) {
        let mut state = self.inner.lock().expect("slot state poisoned");
        state.queue.clear();
    }

    /// Terminate the slot occupied by `child`, requeue its profile at the
    /// back, and launch the queue-head profile into the same ports.
    ///
    /// Returns the replacement child, or `None` when the queue is empty (the
    /// slot is left cleared) or the replacement launch fails (the candidate
    /// is pushed back to the queue *front* so the next recycle retries it).
    /// The replacement's `ready` flag is false; readiness is the registry's
    /// concern.
    pub fn evict_child(
        &self,
        child: &Arc<ChildProcess>,
        reason: &str,
    ) -> Option<Arc<ChildProcess>> {
        let mut state = self.inner.lock().expect("slot state poisoned");
        let state = &mut *state;
        let Some(slot) = state
            .slots
            .iter_mut()
            .find(|slot| slot.child.as_ref().is_some_and(|c| Arc::ptr_eq(c, child)))
        else {
            warn!(profile = %child.name(), "Received eviction for unmanaged child");
            return None;
        };

        let Some(current_profile) = slot.profile.clone() else {
            warn!(
                api_port = slot.ports.api_port,
                stream_port = slot.ports.stream_port,
                debug_port = slot.ports.debug_port,
                "Slot had no profile assigned during eviction"
            );
            return None;
        };

        info!(
            profile = %current_profile.name,
            api_port = slot.ports.api_port,
            stream_port = slot.ports.stream_port,
            debug_port = slot.ports.debug_port,
            reason,
            "Evicting profile from slot"
        );
        Self::terminate_slot(slot, Some(reason));

        // The evicted profile cools off at the back; the replacement comes
        // from the front. Popping before pushing keeps a lone profile from
        // being relaunched into the slot it was just evicted from.
        let next_profile = state.queue.pop_front();
        state.queue.push_back(current_profile.clone());

        let Some(next_profile) = next_profile else {
            error!(
                profile = %current_profile.name,
                "No profiles available to restart slot after eviction"
            );
            return None;
        };

        match self.launch_into_slot(slot, next_profile.clone()) {
            Ok(replacement) => {
                info!(
                    evicted = %current_profile.name,
                    activated = %replacement.name(),
                    api_port = slot.ports.api_port,
                    "Recycled slot"
                );
                Some(replacement)
            }
            Err(err) => {
                error!(
                    candidate = %next_profile.name,
                    evicted = %current_profile.name,
                    error = %err,
                    "Failed to launch replacement profile after eviction"
                );
                slot.profile = None;
                slot.child = None;
                state.queue.push_front(next_profile);
                None
            }
        }
    }

    /// Terminate every occupied slot and clear the rotation queue.
    pub fn shutdown(&self, reason: &str) {
        let mut state = self.inner.lock().expect("slot state poisoned");
        for slot in &mut state.slots {
            Self::terminate_slot(slot, Some(reason));
        }
        state.queue.clear();
    }

    fn launch_into_slot(
        &self,
        slot: &mut ProfileSlot,
        profile: AuthProfile,
    ) -> Result<Arc<ChildProcess>, LaunchError> {
        let child = (self.launch)(&profile, slot.ports, &self.config)?;
        child.set_ready(false);
        slot.profile = Some(profile);
        slot.child = Some(child.clone());
        info!(
            profile = %child.name(),
            api_port = slot.ports.api_port,
            stream_port = slot.ports.stream_port,
            debug_port = slot.ports.debug_port,
            "Launched profile into slot"
        );
        Ok(child)
    }

    fn terminate_slot(slot: &mut ProfileSlot, reason: Option<&str>) {
        let Some(child) = slot.child.take() else {
            slot.profile = None;
            return;
        };

        if child.is_alive() {
            info!(
                profile = %child.name(),
                reason = reason.unwrap_or_default(),
                "Terminating child"
            );
            if let Err(err) = child.terminate() {
                warn!(profile = %child.name(), error = %err, "Failed to signal child");
            }
            if !child.wait_timeout(SHUTDOWN_TIMEOUT) {
                warn!(
                    profile = %child.name(),
                    timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                    "Child did not exit in time; forcing kill"
                );
                if let Err(err) = child.kill_and_wait() {
                    warn!(profile = %child.name(), error = %err, "Failed to kill child");
                }
            }
        }
        slot.profile = None;
    }
}

struct RegistryState {
    children: HashMap<String, Arc<ChildProcess>>,
    ready: VecDeque<Arc<ChildProcess>>,
    unhealthy: BTreeSet<String>,
}

impl RegistryState {
    fn remove_from_ready(&mut self, child: &Arc<ChildProcess>) {
        self.ready.retain(|c| !Arc::ptr_eq(c, child));
    }

    fn add_child(&mut self, child: Arc<ChildProcess>) {
        let name = child.name().to_string();
        if child.is_ready() && child.is_alive() {
            if !self.ready.iter().any(|c| Arc::ptr_eq(c, &child)) {
                self.ready.push_back(child.clone());
            }
            self.unhealthy.remove(&name);
        } else {
            child.set_ready(false);
            self.unhealthy.insert(name.clone());
        }
        self.children.insert(name, child);
    }

    fn remove_child(&mut self, child: &Arc<ChildProcess>) {
        self.children.remove(child.name());
        self.remove_from_ready(child);
        self.unhealthy.remove(child.name());
    }
}

/// Maintain ready/unhealthy child sets and coordinate health polling.
///
/// Bookkeeping lives behind an OS mutex so the watchdog thread can call
/// `mark_unhealthy`/`evict_child` directly; the mutex is never held across an
/// await or while the slot-manager lock is taken. Recovery polling runs on a
/// background task whose rounds are serialized by an async mutex.
pub struct ChildRegistry {
    state: Mutex<RegistryState>,
    slot_manager: Mutex<Option<Arc<SlotManager>>>,
    health_check: HealthCheckFn,
    poll_interval: Duration,
    recovery_timeout: Duration,
    poll_lock: tokio::sync::Mutex<()>,
    stop: Mutex<CancellationToken>,
    monitor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ChildRegistry {
    pub fn new(children: impl IntoIterator<Item = Arc<ChildProcess>>) -> Arc<Self> {
        Self::with_health_check(
            children,
            Arc::new(
                |child: Arc<ChildProcess>, timeout: Duration| -> BoxFuture<'static, bool> {
                    Box::pin(health::wait_for_ready(child, timeout))
                },
            ),
            DEFAULT_POLL_INTERVAL,
            DEFAULT_RECOVERY_TIMEOUT,
        )
    }

    pub fn with_health_check(
        children: impl IntoIterator<Item = Arc<ChildProcess>>,
        health_check: HealthCheckFn,
        poll_interval: Duration,
        recovery_timeout: Duration,
    ) -> Arc<Self> {
        let mut state = RegistryState {
            children: HashMap::new(),
            ready: VecDeque::new(),
            unhealthy: BTreeSet::new(),
        };
        for child in children {
            state.add_child(child);
        }
        Arc::new(Self {
            state: Mutex::new(state),
            slot_manager: Mutex::new(None),
            health_check,
            poll_interval,
            recovery_timeout,
            poll_lock: tokio::sync::Mutex::new(()),
            stop: Mutex::new(CancellationToken::new()),
            monitor: Mutex::new(None),
        })
    }

    /// Attach the slot manager so unhealthy children get recycled. Left unset
    /// during startup probing, where a first timeout only demotes.
    pub fn set_slot_manager(&self, slot_manager: Arc<SlotManager>) {
        *self.slot_manager.lock().expect("registry state poisoned") = Some(slot_manager);
    }

    pub fn mark_ready(&self, child: &Arc<ChildProcess>) {
        if !child.is_alive() {
            warn!(
                profile = %child.name(),
                "Attempted to mark child ready but process is not running"
            );
            return;
        }

        child.set_ready(true);
        let mut state = self.state.lock().expect("registry state poisoned");
        state
            .children
            .insert(child.name().to_string(), child.clone());
        state.unhealthy.remove(child.name());
        if !state.ready.iter().any(|c| Arc::ptr_eq(c, child)) {
            state.ready.push_back(child.clone());
        }
        info!(profile = %child.name(), "Child marked healthy and available");
    }

    /// Round-robin selection over the ready deque. Children observed dead or
    /// not ready are demoted on the way.
    pub fn next_child(&self) -> Option<Arc<ChildProcess>> {
        let mut state = self.state.lock().expect("registry state poisoned");
        while let Some(head) = state.ready.front().cloned() {
            if head.is_alive() && head.is_ready() {
                state.ready.rotate_left(1);
                return Some(head);
            }

            warn!(
                profile = %head.name(),
                "Ready list contained unavailable child; demoting"
            );
            head.set_ready(false);
            state.unhealthy.insert(head.name().to_string());
            state.ready.pop_front();
        }
        None
    }

    pub fn mark_unhealthy(&self, child: &Arc<ChildProcess>, reason: &str) {
        warn!(profile = %child.name(), reason, "Child marked unhealthy");
        child.set_ready(false);
        {
            let mut state = self.state.lock().expect("registry state poisoned");
            state.remove_from_ready(child);
        }

        let slot_manager = self
            .slot_manager
            .lock()
            .expect("registry state poisoned")
            .clone();
        match slot_manager {
            Some(slot_manager) => {
                self.evict_via(&slot_manager, child, reason);
            }
            None => {
                let mut state = self.state.lock().expect("registry state poisoned");
                state.unhealthy.insert(child.name().to_string());
                state
                    .children
                    .insert(child.name().to_string(), child.clone());
            }
        }
    }

    /// Recycle a child immediately, irrespective of its ready flag.
    pub fn evict_child(
        &self,
        child: &Arc<ChildProcess>,
        reason: &str,
    ) -> Option<Arc<ChildProcess>> {
        child.set_ready(false);
        {
            let mut state = self.state.lock().expect("registry state poisoned");
            state.remove_from_ready(child);
        }

        let slot_manager = self
            .slot_manager
            .lock()
            .expect("registry state poisoned")
            .clone();
        match slot_manager {
            Some(slot_manager) => self.evict_via(&slot_manager, child, reason),
            None => {
                debug!(
                    profile = %child.name(),
                    "Slot manager not configured; cannot evict child"
                );
                let mut state = self.state.lock().expect("registry state poisoned");
                state.unhealthy.insert(child.name().to_string());
                state
                    .children
                    .insert(child.name().to_string(), child.clone());
                None
            }
        }
    }

    fn evict_via(
        &self,
        slot_manager: &Arc<SlotManager>,
        child: &Arc<ChildProcess>,
        reason: &str,
    ) -> Option<Arc<ChildProcess>> {
        // The slot-manager lock must be taken without holding our own.
        let replacement = slot_manager.evict_child(child, reason);
        let mut state = self.state.lock().expect("registry state poisoned");
        state.remove_child(child);
        if let Some(replacement) = &replacement {
            state.add_child(replacement.clone());
        }
        replacement
    }

    pub fn ready_children(&self) -> Vec<Arc<ChildProcess>> {
        let state = self.state.lock().expect("registry state poisoned");
        state
            .ready
            .iter()
            .filter(|child| child.is_ready() && child.is_alive())
            .cloned()
            .collect()
    }

    pub fn all_children(&self) -> Vec<Arc<ChildProcess>> {
        let state = self.state.lock().expect("registry state poisoned");
        state.children.values().cloned().collect()
    }

    pub fn unhealthy_names(&self) -> Vec<String> {
        let state = self.state.lock().expect("registry state poisoned");
        state.unhealthy.iter().cloned().collect()
    }

    pub async fn start_monitoring(self: &Arc<Self>) {
        {
            let monitor = self.monitor.lock().expect("registry state poisoned");
            if monitor.as_ref().is_some_and(|task| !task.is_finished()) {
                return;
            }
        }
        let token = CancellationToken::new();
        *self.stop.lock().expect("registry state poisoned") = token.clone();
        let registry = Arc::clone(self);
        let task = tokio::spawn(async move {
            registry.monitor_unhealthy(token).await;
        });
        *self.monitor.lock().expect("registry state poisoned") = Some(task);
    }

    pub async fn shutdown(&self) {
        self.stop.lock().expect("registry state poisoned").cancel();
        let task = self.monitor.lock().expect("registry state poisoned").take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    async fn monitor_unhealthy(self: Arc<Self>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
            if token.is_cancelled() {
                break;
            }
            self.poll_once().await;
        }
        debug!("Child registry monitor stopped");
    }

    /// One recovery round: re-probe every unhealthy child whose process is
    /// still alive. Success promotes it; a failed re-probe escalates into a
    /// recycle via `mark_unhealthy`.
    pub async fn poll_once(&self) {
        let _round = self.poll_lock.lock().await;
        let names: Vec<String> = {
            let state = self.state.lock().expect("registry state poisoned");
            state.unhealthy.iter().cloned().collect()
        };

        for name in names {
            let child = {
                let state = self.state.lock().expect("registry state poisoned");
                state.children.get(&name).cloned()
            };
            let Some(child) = child else {
                let mut state = self.state.lock().expect("registry state poisoned");
                state.unhealthy.remove(&name);
                continue;
            };
            if !child.is_alive() {
                warn!(
                    profile = %name,
                    "Child process exited while unhealthy; leaving demoted"
                );
                continue;
            }

            if (self.health_check)(child.clone(), self.recovery_timeout).await {
                self.mark_ready(&child);
            } else {
                warn!(
                    profile = %name,
                    "Child failed readiness during recovery poll; scheduling recycle"
                );
                self.mark_unhealthy(&child, "Readiness timeout during recovery poll");
            }
        }
    }
}
