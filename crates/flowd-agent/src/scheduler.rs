use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use flowd_core::error::{FlowdError, Result};
use flowd_core::event::{EventBus, FlowEvent};
use flowd_core::traits::{FlowStore, RunLauncher};
use flowd_core::trigger::Trigger;
use flowd_core::types::{Flow, FlowId, Run, TriggerInput};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

struct ArmedFlow {
    token: CancellationToken,
}

#[derive(Clone)]
struct Subscription {
    flow_id: FlowId,
    trigger_index: usize,
    trigger: Trigger,
}

#[derive(Default)]
struct Registry {
    armed: HashMap<FlowId, ArmedFlow>,
    events: HashMap<String, Vec<Subscription>>,
}

impl Registry {
    fn disarm(&mut self, flow_id: &FlowId) -> bool {
        self.events.retain(|_, subs| {
            subs.retain(|s| &s.flow_id != flow_id);
            !subs.is_empty()
        });
        match self.armed.remove(flow_id) {
            Some(armed) => {
                armed.token.cancel();
                debug!(flow_id = %flow_id, "Flow disarmed");
                true
            }
            None => false,
        }
    }
}

struct Shared {
    store: Arc<dyn FlowStore>,
    launcher: Arc<dyn RunLauncher>,
    event_bus: Arc<EventBus>,
    registry: Mutex<Registry>,
    clock: Clock,
}

/// What a reconcile pass changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub armed: usize,
    pub disarmed: usize,
}

/// Owns the armed triggers of every schedulable flow.
///
/// `once` triggers are one-shot timers and `crontab` triggers are tick loops,
/// each on its own task. `event.*` triggers are subscriptions keyed by event
/// id and fire from [`deliver_event`](Self::deliver_event). Every firing goes
/// through the store's atomic `create_triggered_run`, so a flow deactivated
/// after arming never gets a new run even if its timer still fires.
#[derive(Clone)]
pub struct TriggerScheduler {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl TriggerScheduler {
    pub fn new(
        store: Arc<dyn FlowStore>,
        launcher: Arc<dyn RunLauncher>,
        event_bus: Arc<EventBus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                launcher,
                event_bus,
                registry: Mutex::new(Registry::default()),
                clock: Arc::new(Utc::now),
            }),
            cancel,
        }
    }

    /// Replace the wall clock used to evaluate cron schedules.
    ///
    /// Must be called before anything is armed.
    pub fn with_clock(self, clock: Clock) -> Self {
        let shared = match Arc::try_unwrap(self.shared) {
            Ok(mut shared) => {
                shared.clock = clock;
                Arc::new(shared)
            }
            Err(shared) => {
                warn!("Scheduler already shared, clock not replaced");
                shared
            }
        };
        Self {
            shared,
            cancel: self.cancel,
        }
    }

    /// Arm every trigger of `flow`, replacing any previous arming.
    ///
    /// The old arming is torn down and the new one registered under a single
    /// registry lock, so concurrent calls for one flow leave exactly one set
    /// of timers and subscriptions. Returns whether the flow ended up armed.
    pub fn arm_flow(&self, flow: &Flow) -> bool {
        let Ok(mut registry) = self.shared.lock() else {
            return false;
        };
        registry.disarm(&flow.id);

        if !flow.is_schedulable() {
            debug!(flow_id = %flow.id, status = %flow.status, "Flow not schedulable, not arming");
            return false;
        }

        let token = self.cancel.child_token();

        for (index, trigger) in flow.triggers.iter().enumerate() {
            if trigger.is_one_shot() && flow.spent_triggers.contains(&index) {
                debug!(flow_id = %flow.id, index, trigger = %trigger, "Trigger already spent");
                continue;
            }

            match trigger {
                Trigger::Once { delay_ms } => {
                    let shared = self.shared.clone();
                    let token = token.clone();
                    let flow_id = flow.id.clone();
                    let trigger = trigger.clone();
                    let delay = Duration::from_millis(*delay_ms);
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {
                                shared.fire(&flow_id, index, &trigger, None);
                            }
                            _ = token.cancelled() => {
                                debug!(flow_id = %flow_id, index, "Once timer cancelled");
                            }
                        }
                    });
                }
                Trigger::Crontab { expr } => match trigger.schedule() {
                    Some(Ok(schedule)) => {
                        let shared = self.shared.clone();
                        let token = token.clone();
                        let flow_id = flow.id.clone();
                        let trigger = trigger.clone();
                        tokio::spawn(async move {
                            shared.cron_loop(flow_id, index, trigger, schedule, token).await;
                        });
                    }
                    _ => {
                        warn!(flow_id = %flow.id, expr = %expr, "Invalid cron expression, skipping trigger");
                    }
                },
                Trigger::EventOnce { event_id } | Trigger::EventEvery { event_id } => {
                    registry.events.entry(event_id.clone()).or_default().push(Subscription {
                        flow_id: flow.id.clone(),
                        trigger_index: index,
                        trigger: trigger.clone(),
                    });
                }
            }
        }

        registry.armed.insert(flow.id.clone(), ArmedFlow { token });

        info!(flow_id = %flow.id, triggers = flow.triggers.len(), "Flow armed");
        true
    }

    /// Cancel the flow's timers and drop its event subscriptions.
    pub fn disarm_flow(&self, flow_id: &FlowId) -> bool {
        let Ok(mut registry) = self.shared.lock() else {
            return false;
        };
        registry.disarm(flow_id)
    }

    /// Fire every subscription for `event_id`. Returns the number of firings
    /// attempted; some may still be dropped by the store's status re-check.
    pub fn deliver_event(&self, event_id: &str, payload: Option<Value>) -> usize {
        let fired: Vec<Subscription> = {
            let Ok(mut registry) = self.shared.lock() else {
                return 0;
            };
            let Some(subs) = registry.events.get_mut(event_id) else {
                debug!(event_id, "No subscriptions for event");
                return 0;
            };
            let snapshot = subs.clone();
            subs.retain(|s| !s.trigger.is_one_shot());
            if subs.is_empty() {
                registry.events.remove(event_id);
            }
            snapshot
        };

        for sub in &fired {
            self.shared
                .fire(&sub.flow_id, sub.trigger_index, &sub.trigger, payload.clone());
        }
        info!(event_id, fired = fired.len(), "Event delivered");
        fired.len()
    }

    /// Bring the registry in line with the store: arm schedulable flows that
    /// are not armed and disarm armed flows that are no longer schedulable.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let flows = self.shared.store.list_schedulable_flows()?;
        let wanted: HashSet<FlowId> = flows.iter().map(|f| f.id.clone()).collect();
        let armed: HashSet<FlowId> = self
            .shared
            .lock()?
            .armed
            .keys()
            .cloned()
            .collect();

        let mut report = ReconcileReport::default();
        for flow in flows.iter().filter(|f| !armed.contains(&f.id)) {
            if self.arm_flow(flow) {
                report.armed += 1;
            }
        }
        for flow_id in armed.difference(&wanted) {
            if self.disarm_flow(flow_id) {
                report.disarmed += 1;
            }
        }

        if report != ReconcileReport::default() {
            info!(armed = report.armed, disarmed = report.disarmed, "Scheduler reconciled");
        }
        Ok(report)
    }

    pub fn is_armed(&self, flow_id: &FlowId) -> bool {
        self.shared
            .lock()
            .map(|r| r.armed.contains_key(flow_id))
            .unwrap_or(false)
    }

    pub fn armed_count(&self) -> usize {
        self.shared.lock().map(|r| r.armed.len()).unwrap_or(0)
    }

    pub fn subscriptions(&self, event_id: &str) -> usize {
        self.shared
            .lock()
            .map(|r| r.events.get(event_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Cancel every armed trigger.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Ok(mut registry) = self.shared.lock() {
            registry.armed.clear();
            registry.events.clear();
        }
        info!("Trigger scheduler shut down");
    }
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|e| FlowdError::InvalidArgument(format!("scheduler registry poisoned: {}", e)))
    }

    /// Ticks are computed on the wall clock and slept on tokio's monotonic
    /// clock, both anchored when the loop starts.
    async fn cron_loop(
        &self,
        flow_id: FlowId,
        index: usize,
        trigger: Trigger,
        schedule: Schedule,
        token: CancellationToken,
    ) {
        let base_wall = (self.clock)();
        let base_instant = Instant::now();
        let mut cursor = base_wall;

        loop {
            let Some(next) = schedule.after(&cursor).next() else {
                debug!(flow_id = %flow_id, index, "Cron schedule has no upcoming ticks");
                break;
            };
            let offset = (next - base_wall).to_std().unwrap_or(Duration::ZERO);

            debug!(flow_id = %flow_id, index, fire_at = %next, "Next cron tick scheduled");

            tokio::select! {
                _ = tokio::time::sleep_until(base_instant + offset) => {
                    self.fire(&flow_id, index, &trigger, None);
                    cursor = next;
                }
                _ = token.cancelled() => {
                    debug!(flow_id = %flow_id, index, "Cron loop cancelled");
                    break;
                }
            }
        }
    }

    fn fire(&self, flow_id: &FlowId, index: usize, trigger: &Trigger, payload: Option<Value>) {
        self.event_bus.publish(FlowEvent::TriggerFired {
            flow_id: flow_id.clone(),
            trigger_index: index,
            trigger: trigger.to_string(),
        });

        let flow = match self.store.get_flow(flow_id) {
            Ok(Some(flow)) => flow,
            Ok(None) => {
                self.dropped(flow_id, index);
                return;
            }
            Err(e) => {
                error!(flow_id = %flow_id, error = %e, "Failed to load flow for trigger");
                return;
            }
        };

        let run = Run::new(
            &flow,
            Some(TriggerInput {
                index,
                trigger: trigger.clone(),
                fired_at: (self.clock)(),
                payload,
            }),
        );
        let spend = trigger.is_one_shot().then_some(index);

        match self.store.create_triggered_run(&run, spend) {
            Ok(true) => {
                info!(flow_id = %flow_id, run_id = %run.id, trigger = %trigger, "Trigger fired, run created");
                self.event_bus.publish(FlowEvent::RunCreated {
                    run_id: run.id.clone(),
                    flow_id: flow_id.clone(),
                });
                self.launcher.launch(run.id);
            }
            Ok(false) => self.dropped(flow_id, index),
            Err(e) => {
                error!(flow_id = %flow_id, error = %e, "Failed to create triggered run");
            }
        }
    }

    fn dropped(&self, flow_id: &FlowId, index: usize) {
        let race = FlowdError::SchedulingRace {
            flow_id: flow_id.to_string(),
        };
        info!(index, "{}", race);
        self.event_bus.publish(FlowEvent::SchedulingRaceDropped {
            flow_id: flow_id.clone(),
            trigger_index: index,
        });
    }
}
