//! Rules engine: the single-consumer worker that turns events into actions.
//!
//! A bus listener feeds a bounded queue with a non-blocking send; the
//! worker drains it one event at a time. For each cached rule it walks
//! the triggers against the event, evaluates the conditions against the
//! state cache, and on a pass dispatches the actions in order through
//! the executor, emitting `rules.fired` / `rules.action` diagnostics.
//!
//! The cache is edited incrementally through the `automation_saved`,
//! `automation_removed` and `automation_enabled` control events instead
//! of being rebuilt on every configuration change.

use crate::executor::ActionExecutor;
use crate::store::RuleStore;
use crate::zigbee::ZigbeeCommands;
use gateway_core::{Event, EventBus, ListenerId, StateCache};
use gateway_rules::compiler::u16_any;
use gateway_rules::{CompiledRule, CondRecord, CondValue, EventKind, TriggerRecord};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Events whose kind starts with this prefix are engine output.
const RULES_PREFIX: &str = "rules.";
/// Source stamped on every engine emission.
const RULES_SOURCE: &str = "rules";

/// Minimum spacing between queue-drop diagnostics.
const DROP_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Tunables carried from the daemon configuration.
#[derive(Clone, Copy, Debug)]
pub struct EngineOptions {
    /// Bounded FIFO between the bus listener and the worker.
    pub queue_capacity: usize,
    /// Tolerance for `==`/`!=` on numeric conditions.
    pub eq_epsilon: f64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            eq_epsilon: 1e-6,
        }
    }
}

/// Payload fields the trigger matcher cares about, parsed once per event.
/// A malformed payload degrades to wildcard-only matching.
#[derive(Debug, Default)]
struct EventPayload {
    endpoint: Option<u8>,
    cmd: Option<String>,
    cluster: Option<u16>,
    attr: Option<u16>,
}

fn parse_payload(payload_json: &str) -> EventPayload {
    let map = match serde_json::from_str::<Value>(payload_json) {
        Ok(Value::Object(map)) => map,
        _ => return EventPayload::default(),
    };
    EventPayload {
        endpoint: map
            .get("endpoint")
            .and_then(u16_any)
            .and_then(|v| u8::try_from(v).ok()),
        cmd: map
            .get("cmd")
            .and_then(Value::as_str)
            .map(str::to_owned),
        cluster: map.get("cluster").and_then(u16_any),
        attr: map.get("attr").and_then(u16_any),
    }
}

/// Synchronous engine state; the async worker is a thin loop around it.
pub struct EngineCore {
    bus: Arc<EventBus>,
    store: Arc<RuleStore>,
    states: Arc<StateCache>,
    executor: ActionExecutor,
    cache: HashMap<String, CompiledRule>,
    eq_epsilon: f64,
}

impl EngineCore {
    pub fn new(
        bus: Arc<EventBus>,
        store: Arc<RuleStore>,
        states: Arc<StateCache>,
        zigbee: Arc<dyn ZigbeeCommands>,
        opts: &EngineOptions,
    ) -> Self {
        Self {
            bus,
            store,
            states,
            executor: ActionExecutor::new(zigbee),
            cache: HashMap::new(),
            eq_epsilon: opts.eq_epsilon,
        }
    }

    /// Prime the cache with every enabled automation in the store.
    pub fn load_cache(&mut self) {
        for meta in self.store.list() {
            if !meta.enabled {
                continue;
            }
            match self.store.get(&meta.id) {
                Ok(entry) => {
                    self.cache.insert(meta.id, entry.compiled);
                }
                Err(e) => warn!("skipping automation {}: {e}", meta.id),
            }
        }
        info!("rules cache primed: {} automations", self.cache.len());
    }

    pub fn cached_rules(&self) -> usize {
        self.cache.len()
    }

    /// Engine output must never feed back into the engine.
    pub fn is_feedback(event: &Event) -> bool {
        event.source == RULES_SOURCE || event.kind.starts_with(RULES_PREFIX)
    }

    /// Process one dequeued event.
    pub fn handle_event(&mut self, event: &Event) {
        if Self::is_feedback(event) {
            return;
        }
        match event.kind.as_str() {
            "automation_saved" => self.apply_control("saved", event),
            "automation_removed" => self.apply_control("removed", event),
            "automation_enabled" => self.apply_control("enabled", event),
            _ => self.match_event(event),
        }
    }

    /// Apply one incremental cache edit and report the outcome.
    fn apply_control(&mut self, op: &str, event: &Event) {
        let Some(id) = control_id(event) else {
            warn!("control event {op} without automation id");
            self.emit_cache(op, "?", Err("missing id".to_owned()));
            return;
        };

        let outcome = match op {
            "saved" => self.reload(&id),
            "removed" => {
                self.cache.remove(&id);
                Ok(())
            }
            // A missing flag falls back to the store's own enabled state.
            _ => match control_enabled(event) {
                Some(false) => {
                    self.cache.remove(&id);
                    Ok(())
                }
                _ => self.reload(&id),
            },
        };
        self.emit_cache(op, &id, outcome);
    }

    /// Refresh one cache slot from the store. The previous slot survives
    /// a load failure untouched.
    fn reload(&mut self, id: &str) -> Result<(), String> {
        match self.store.get(id) {
            Ok(entry) if entry.enabled => {
                self.cache.insert(id.to_owned(), entry.compiled);
                Ok(())
            }
            Ok(_) => {
                self.cache.remove(id);
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    fn emit_cache(&self, op: &str, id: &str, outcome: Result<(), String>) {
        let ok = outcome.is_ok();
        let mut payload = json!({
            "op": op,
            "id": id,
            "ok": ok,
            "rules": self.cache.len(),
        });
        if let Err(err) = &outcome {
            payload["err"] = json!(err);
        }
        self.emit(
            "rules.cache",
            &format!("op={op} id={id} ok={}", u8::from(ok)),
            &payload,
        );
    }

    /// Report events dropped on the full queue; called by the worker.
    pub(crate) fn report_dropped(&self, total: u64) {
        self.emit(
            "rules.cache",
            &format!("queue full, {total} events dropped"),
            &json!({"op": "queue_drop", "ok": false, "dropped": total, "rules": self.cache.len()}),
        );
    }

    /// Run every cached rule against a normalized event.
    fn match_event(&self, event: &Event) {
        let Some(kind) = EventKind::from_name(&event.kind) else {
            return;
        };
        let payload = parse_payload(&event.payload_json);

        for (id, rule) in &self.cache {
            if !rule.automation.enabled {
                continue;
            }
            let matched = rule
                .rule_triggers()
                .iter()
                .any(|t| trigger_matches(rule, t, kind, event, &payload));
            if !matched {
                continue;
            }
            debug!("rule {id} matched event #{}", event.id);

            if !rule
                .rule_conditions()
                .iter()
                .all(|c| self.condition_passes(rule, c))
            {
                debug!("rule {id} conditions failed");
                continue;
            }

            self.fire(id, rule, event);
        }
    }

    /// Emit `rules.fired` and dispatch the actions in array order,
    /// stopping this rule at the first failure.
    fn fire(&self, id: &str, rule: &CompiledRule, event: &Event) {
        self.emit(
            "rules.fired",
            &format!("automation {id} fired"),
            &json!({
                "automation_id": id,
                "event_id": event.id,
                "event_type": event.kind,
            }),
        );

        for (idx, action) in rule.rule_actions().iter().enumerate() {
            match self.executor.execute(rule, action) {
                Ok(()) => {
                    self.emit(
                        "rules.action",
                        &format!("automation {id} action {idx} ok"),
                        &json!({"automation_id": id, "idx": idx, "ok": true}),
                    );
                }
                Err(e) => {
                    warn!("automation {id} action {idx} failed: {e}");
                    self.emit(
                        "rules.action",
                        &format!("automation {id} action {idx} failed"),
                        &json!({"automation_id": id, "idx": idx, "ok": false, "err": e.to_string()}),
                    );
                    break;
                }
            }
        }
    }

    fn condition_passes(&self, rule: &CompiledRule, cond: &CondRecord) -> bool {
        let uid = rule.strings.lookup(cond.device_uid_off);
        let key = rule.strings.lookup(cond.key_off);
        let Some(item) = self.states.get(uid, key) else {
            // No report yet for this (device, key): fail closed.
            return false;
        };
        match cond.value {
            CondValue::Bool(expected) => cond.op.eval_bool(item.value.as_bool(), expected),
            CondValue::F64(expected) => {
                cond.op.eval_f64(item.value.as_f64(), expected, self.eq_epsilon)
            }
        }
    }

    fn emit(&self, kind: &str, msg: &str, payload: &Value) {
        self.bus
            .publish(kind, RULES_SOURCE, "", 0, msg, &payload.to_string());
    }

    #[cfg(test)]
    fn insert_rule(&mut self, rule: CompiledRule) {
        self.cache.insert(rule.id().to_owned(), rule);
    }
}

/// One trigger against one event; zero fields match anything.
fn trigger_matches(
    rule: &CompiledRule,
    trigger: &TriggerRecord,
    kind: EventKind,
    event: &Event,
    payload: &EventPayload,
) -> bool {
    if trigger.event_kind != kind {
        return false;
    }
    if trigger.device_uid_off != 0
        && rule.strings.lookup(trigger.device_uid_off) != event.device_uid
    {
        return false;
    }
    if trigger.endpoint != 0 && payload.endpoint != Some(trigger.endpoint) {
        return false;
    }
    match kind {
        EventKind::ZigbeeCommand => {
            if trigger.cmd_off != 0
                && payload.cmd.as_deref() != Some(rule.strings.lookup(trigger.cmd_off))
            {
                return false;
            }
            if trigger.cluster_id != 0 && payload.cluster != Some(trigger.cluster_id) {
                return false;
            }
        }
        EventKind::ZigbeeAttrReport => {
            if trigger.cluster_id != 0 && payload.cluster != Some(trigger.cluster_id) {
                return false;
            }
            if trigger.attr_id != 0 && payload.attr != Some(trigger.attr_id) {
                return false;
            }
        }
        EventKind::DeviceJoin | EventKind::DeviceLeave => {}
    }
    true
}

/// Automation id carried by a control event, either as a structured
/// payload field or as an `id=` token in `msg`.
fn control_id(event: &Event) -> Option<String> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&event.payload_json) {
        if let Some(id) = map.get("id").and_then(Value::as_str) {
            if !id.is_empty() {
                return Some(id.to_owned());
            }
        }
    }
    msg_token(&event.msg, "id=")
}

/// Enable flag of an `automation_enabled` event.
fn control_enabled(event: &Event) -> Option<bool> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&event.payload_json) {
        if let Some(flag) = map.get("enabled") {
            if let Some(b) = flag.as_bool() {
                return Some(b);
            }
            if let Some(n) = flag.as_u64() {
                return Some(n != 0);
            }
        }
    }
    match msg_token(&event.msg, "enabled=").as_deref() {
        Some("1") | Some("true") => Some(true),
        Some("0") | Some("false") => Some(false),
        _ => None,
    }
}

fn msg_token(msg: &str, prefix: &str) -> Option<String> {
    msg.split_whitespace()
        .find_map(|tok| tok.strip_prefix(prefix))
        .filter(|rest| !rest.is_empty())
        .map(str::to_owned)
}

/// Install the bus listener that feeds the engine queue.
///
/// Engine output is filtered here, before it can occupy a queue slot; a
/// full queue drops the event and bumps the shared counter.
fn install_listener(
    bus: &EventBus,
    tx: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
) -> ListenerId {
    bus.add_listener(move |event| {
        if EngineCore::is_feedback(event) {
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
            dropped.fetch_add(1, Ordering::Relaxed);
            warn!("rules queue full, dropping event #{}", event.id);
        }
    })
}

/// The running engine: bus listener + worker task.
pub struct RulesEngine {
    bus: Arc<EventBus>,
    listener: ListenerId,
    tx: mpsc::Sender<Event>,
    worker: JoinHandle<()>,
}

impl RulesEngine {
    /// Prime the cache, install the bus listener, and spawn the worker.
    pub fn start(
        bus: Arc<EventBus>,
        store: Arc<RuleStore>,
        states: Arc<StateCache>,
        zigbee: Arc<dyn ZigbeeCommands>,
        opts: EngineOptions,
    ) -> Self {
        let mut core = EngineCore::new(bus.clone(), store, states, zigbee, &opts);
        core.load_cache();

        let (tx, rx) = mpsc::channel(opts.queue_capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let listener = install_listener(&bus, tx.clone(), dropped.clone());
        let worker = tokio::spawn(worker_loop(core, rx, dropped));

        Self {
            bus,
            listener,
            tx,
            worker,
        }
    }

    /// Detach from the bus and let the worker drain out.
    pub async fn stop(self) {
        self.bus.remove_listener(self.listener);
        drop(self.tx);
        let _ = self.worker.await;
    }
}

async fn worker_loop(mut core: EngineCore, mut rx: mpsc::Receiver<Event>, dropped: Arc<AtomicU64>) {
    let mut reported: u64 = 0;
    let mut last_report: Option<Instant> = None;

    while let Some(event) = rx.recv().await {
        core.handle_event(&event);

        // Surface backpressure, at most once per interval.
        let total = dropped.load(Ordering::Relaxed);
        if total > reported
            && last_report.map_or(true, |t| t.elapsed() >= DROP_REPORT_INTERVAL)
        {
            core.report_dropped(total);
            reported = total;
            last_report = Some(Instant::now());
        }
    }
    info!("rules worker stopped");
}
