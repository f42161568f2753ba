use std::collections::HashSet;
use std::io;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::warn;

use crate::manager::{ChildRegistry, SlotManager};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Background thread that notices exited child processes and forwards
/// eviction requests to the registry.
///
/// Runs on its own OS thread because exit-status polling is a blocking
/// concern; it re-enters the async world only through the registry's
/// thread-safe bookkeeping methods.
pub struct ProcessWatchdog {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProcessWatchdog {
    pub fn spawn(
        slot_manager: Arc<SlotManager>,
        registry: Arc<ChildRegistry>,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("process-watchdog".to_string())
            .spawn(move || {
                let mut reported: HashSet<(String, u32)> = HashSet::new();
                while !thread_stop.load(Ordering::SeqCst) {
                    sweep(&slot_manager, &registry, &mut reported);
                    std::thread::sleep(SWEEP_INTERVAL);
                }
            })?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// One pass over the occupied slots: report each newly-exited child once and
/// hand it to the registry for eviction.
fn sweep(
    slot_manager: &SlotManager,
    registry: &ChildRegistry,
    reported: &mut HashSet<(String, u32)>,
) {
    for child in slot_manager.live_children() {
        let Some(status) = child.exit_status() else {
            continue;
        };
        if !reported.insert((child.name().to_string(), child.pid())) {
            continue;
        }

        let reason = format!("Process exit ({})", describe_exit(&status));
        warn!(
            profile = %child.name(),
            pid = child.pid(),
            %reason,
            "Detected exited child process"
        );
        registry.evict_child(&child, &reason);
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("code {code}"),
        None => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{LaunchConfig, LaunchError};
    use crate::manager::LaunchFn;
    use crate::types::test_util::{FakeProcess, FakeProcessState};
    use crate::types::{AuthProfile, ChildProcess, ProfileQueue};
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn fake_pool(
        profiles: &[&str],
        slots: usize,
    ) -> (Arc<SlotManager>, Arc<Mutex<HashMap<String, Arc<FakeProcessState>>>>) {
        let states: Arc<Mutex<HashMap<String, Arc<FakeProcessState>>>> = Arc::default();
        let launch_states = states.clone();
        let launch: LaunchFn = Arc::new(move |profile, ports, _config| {
            let state = Arc::new(FakeProcessState::default());
            launch_states
                .lock()
                .unwrap()
                .insert(profile.name.clone(), state.clone());
            Ok::<_, LaunchError>(Arc::new(ChildProcess::new(
                profile.clone(),
                ports,
                Box::new(FakeProcess::new(ports.api_port as u32, state)),
                None,
            )))
        });
        let ports = crate::ports::assign_ports(slots, 3100, 3200, 9222, 1).unwrap();
        let all: Vec<AuthProfile> = profiles
            .iter()
            .map(|name| AuthProfile::new(*name, format!("/tmp/{name}.json")))
            .collect();
        let (active, queued) = all.split_at(slots.min(all.len()));
        let config = LaunchConfig {
            command: "/bin/false".into(),
            env: HashMap::new(),
            headless: true,
            log_dir: "/tmp/coordinator-test-logs".into(),
        };
        let manager = Arc::new(SlotManager::with_launcher(
            ports,
            queued.iter().cloned().collect::<ProfileQueue>(),
            config,
            launch,
        ));
        manager.bootstrap(active).unwrap();
        (manager, states)
    }

    #[test]
    fn sweep_evicts_exited_children_and_recycles() {
        let (manager, states) = fake_pool(&["a", "b"], 1);
        let registry = ChildRegistry::new(manager.live_children());
        registry.set_slot_manager(manager.clone());

        states.lock().unwrap().get("a").unwrap().exit(3);

        let mut reported = HashSet::new();
        sweep(&manager, &registry, &mut reported);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot[0].1.as_deref(), Some("b"));
        assert_eq!(manager.queued_profiles(), vec!["a"]);
        assert_eq!(reported.len(), 1);
        let names: Vec<String> = registry
            .all_children()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["b"]);
    }

    #[test]
    fn sweep_reports_each_exit_once() {
        let (manager, states) = fake_pool(&["a"], 1);
        let registry = ChildRegistry::new(manager.live_children());
        // No slot manager attached: the dead child stays in place, so a
        // second sweep sees it again and must stay quiet.
        states.lock().unwrap().get("a").unwrap().exit(1);

        let mut reported = HashSet::new();
        sweep(&manager, &registry, &mut reported);
        sweep(&manager, &registry, &mut reported);
        assert_eq!(reported.len(), 1);
        assert_eq!(registry.unhealthy_names(), vec!["a"]);
    }

    #[test]
    fn sweep_ignores_live_children() {
        let (manager, _states) = fake_pool(&["a"], 1);
        let registry = ChildRegistry::new(manager.live_children());

        let mut reported = HashSet::new();
        sweep(&manager, &registry, &mut reported);
        assert!(reported.is_empty());
        assert_eq!(manager.snapshot()[0].1.as_deref(), Some("a"));
    }

    #[test]
    fn watchdog_thread_starts_and_stops() {
        let (manager, _states) = fake_pool(&["a"], 1);
        let registry = ChildRegistry::new(manager.live_children());

        let watchdog = ProcessWatchdog::spawn(manager, registry).unwrap();
        watchdog.stop();
    }
}
