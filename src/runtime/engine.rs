/// Execution engine: the per-instance state machine
///
/// `advance` loads one instance under its lease, applies one event, walks the
/// flow graph until the instance suspends or terminates, and persists after
/// every transition. Suspension is stored state plus a timer, never a task
/// parked on an await.

use crate::error::{DeliveryError, EngineError, StoreError};
use crate::flow::{registry::FlowRegistry, types::{KeywordAction, NodeSpec}};
use crate::instance::{AutomationInstance, InstanceState, InstanceStore, LeaseManager};
use crate::runtime::actions::{resolve_action, Ack, Action, ActionExecutor};
use crate::runtime::event::{Event, InboundMessage};
use crate::runtime::keyword::find_match;
use crate::runtime::timer::TimerScheduler;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::{future::Future, sync::Arc, time::Duration};

/// Tunables for the engine loop
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Node visits allowed while applying a single event
    pub max_steps_per_event: usize,
    /// Delivery attempts per send node, first try included
    pub max_delivery_attempts: u32,
    /// First backoff delay; doubled after every transient failure
    pub retry_base_delay: Duration,
    /// Reload-and-reapply rounds after optimistic-lock conflicts
    pub max_conflict_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps_per_event: 100,
            max_delivery_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
            max_conflict_retries: 5,
        }
    }
}

/// What the current node decided for this event
enum Step {
    /// Move to a successor; `None` completes the flow
    Goto(Option<String>),
    Suspend(InstanceState, Option<DateTime<Utc>>),
    Stop,
    Fail(String),
    /// Nothing to do at this node for this event
    Hold,
}

pub struct ExecutionEngine {
    registry: Arc<FlowRegistry>,
    store: Arc<dyn InstanceStore>,
    timers: Arc<dyn TimerScheduler>,
    actions: Arc<dyn ActionExecutor>,
    leases: LeaseManager,
    config: EngineConfig,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<FlowRegistry>,
        store: Arc<dyn InstanceStore>,
        timers: Arc<dyn TimerScheduler>,
        actions: Arc<dyn ActionExecutor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            store,
            timers,
            actions,
            leases: LeaseManager::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    /// Apply `event` to the instance and run it until it suspends or ends
    ///
    /// Safe to call again with the same event: terminal instances, already
    /// seen messages and early ticks are ignored without side effects.
    pub async fn advance(&self, instance_id: &str, event: &Event) -> Result<InstanceState, EngineError> {
        let _lease = self.leases.acquire(instance_id).await;
        self.retry_on_conflict(instance_id, |instance| self.apply(instance, event))
            .await
    }

    /// Stop a non-terminal instance and drop its timer
    pub async fn cancel(&self, instance_id: &str, reason: &str) -> Result<InstanceState, EngineError> {
        let _lease = self.leases.acquire(instance_id).await;
        self.retry_on_conflict(instance_id, |mut instance| async move {
            if instance.state.is_terminal() {
                return Ok(instance.state);
            }
            let had_timer = instance.deadline.is_some();
            instance.stop();
            instance.set_var("stopReason", json!(reason));
            self.persist(&mut instance).await?;
            if had_timer {
                self.timers.cancel(&instance.id).await;
            }
            tracing::info!("🛑 Instance {} stopped: {}", instance.id, reason);
            Ok(instance.state)
        })
        .await
    }

    async fn retry_on_conflict<F, Fut>(&self, instance_id: &str, mut op: F) -> Result<InstanceState, EngineError>
    where
        F: FnMut(AutomationInstance) -> Fut,
        Fut: Future<Output = Result<InstanceState, EngineError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let instance = self
                .store
                .load(instance_id)
                .await?
                .ok_or_else(|| EngineError::InstanceNotFound(instance_id.to_string()))?;

            match op(instance).await {
                Err(EngineError::Store(StoreError::Conflict { .. })) if attempts < self.config.max_conflict_retries => {
                    tracing::warn!("🔁 Version conflict on instance {}, reloading (attempt {})", instance_id, attempts);
                }
                Err(EngineError::Store(StoreError::Conflict { .. })) => {
                    return Err(EngineError::ConflictRetriesExhausted {
                        id: instance_id.to_string(),
                        attempts,
                    });
                }
                other => return other,
            }
        }
    }

    async fn apply(&self, mut instance: AutomationInstance, event: &Event) -> Result<InstanceState, EngineError> {
        if let Some(reason) = ignore_reason(&instance, event) {
            tracing::debug!("⏭️ Ignoring {} for instance {} ({})", event.kind(), instance.id, reason);
            return Ok(instance.state);
        }

        let now = event.at();
        let armed_deadline = instance.deadline;
        let message = match event {
            Event::InboundMessage(msg) => Some(msg),
            Event::Tick { .. } => None,
        };

        // A time gap does not consume messages, but keyword_catch after it must see them
        if let (Some(msg), InstanceState::WaitingForTimer) = (message, instance.state) {
            instance.remember_message(msg.dedup_key());
            instance.set_var("lastInbound", msg.to_context());
            self.persist(&mut instance).await?;
            tracing::debug!("📥 Recorded message for instance {} during a time gap", instance.id);
            return Ok(instance.state);
        }

        // Running with an event already applied means an earlier attempt stopped mid-step
        let resuming = instance.state == InstanceState::Running
            && instance.execution_count > 0
            && message.map_or(true, |msg| instance.has_seen(&msg.dedup_key()));
        if resuming {
            tracing::debug!("⏯️ Resuming instance {} at node {}", instance.id, instance.current_node_id);
        }

        // Only a user_reply the instance was already parked on may consume the message
        let mut reply: Option<&InboundMessage> = match instance.state {
            InstanceState::WaitingForReply => message,
            _ => None,
        };
        if !resuming {
            if let Some(msg) = message {
                instance.remember_message(msg.dedup_key());
                instance.set_var("lastInbound", msg.to_context());
            }
            instance.execution_count += 1;
        }
        let mut dirty = !resuming;

        let flow = match self.registry.get_flow(&instance.flow_id) {
            Some(flow) => flow,
            None => {
                let error = format!("configuration error: flow '{}' is not registered", instance.flow_id);
                return self.finish(instance, Step::Fail(error), armed_deadline).await;
            }
        };

        let mut steps = 0;
        loop {
            if steps >= self.config.max_steps_per_event {
                let error = format!(
                    "cycle detected: more than {} steps for one event (last node '{}')",
                    self.config.max_steps_per_event, instance.current_node_id
                );
                return self.finish(instance, Step::Fail(error), armed_deadline).await;
            }
            steps += 1;

            let Some(node) = flow.node(&instance.current_node_id) else {
                let error = format!(
                    "configuration error: node '{}' not found in flow '{}'",
                    instance.current_node_id, flow.id
                );
                return self.finish(instance, Step::Fail(error), armed_deadline).await;
            };
            let next = node.next_node_id.clone();

            tracing::debug!("▶️ Instance {} at node {} ({})", instance.id, instance.current_node_id, node.spec.kind());

            let step = match &node.spec {
                NodeSpec::UserReply { wait_seconds } => match (reply.take(), instance.deadline) {
                    (Some(msg), _) => {
                        instance.set_var("lastReply", msg.to_context());
                        instance.set_var("replyTimedOut", json!(false));
                        Step::Goto(next)
                    }
                    (None, Some(deadline)) if now >= deadline => {
                        tracing::info!("⌛ Reply window elapsed for instance {}", instance.id);
                        instance.set_var("replyTimedOut", json!(true));
                        Step::Goto(next)
                    }
                    (None, Some(_)) => Step::Hold,
                    (None, None) => match deadline_after(now, *wait_seconds) {
                        Some(deadline) => Step::Suspend(InstanceState::WaitingForReply, Some(deadline)),
                        None => Step::Fail(out_of_range(&instance.current_node_id, *wait_seconds)),
                    },
                },

                NodeSpec::TimeGap { delay_seconds } => match instance.deadline {
                    Some(deadline) if now >= deadline => Step::Goto(next),
                    Some(_) => Step::Hold,
                    None if *delay_seconds == 0 => Step::Goto(next),
                    None => match deadline_after(now, *delay_seconds) {
                        Some(deadline) => Step::Suspend(InstanceState::WaitingForTimer, Some(deadline)),
                        None => Step::Fail(out_of_range(&instance.current_node_id, *delay_seconds)),
                    },
                },

                NodeSpec::SendTemplate { .. } | NodeSpec::CustomReply { .. } => {
                    match resolve_action(&node.spec, &instance.context) {
                        Some(action) => {
                            // The step must be durable before the side effect happens
                            if dirty {
                                self.persist(&mut instance).await?;
                                dirty = false;
                            }
                            match self.deliver(&action, &instance).await {
                                Ok(ack) => {
                                    if let Some(message_id) = ack.message_id {
                                        instance.set_var("lastMessageId", json!(message_id));
                                    }
                                    Step::Goto(next)
                                }
                                Err(e) => Step::Fail(format!("node '{}': {}", instance.current_node_id, e)),
                            }
                        }
                        None => Step::Fail(format!("configuration error: node '{}' produced no action", instance.current_node_id)),
                    }
                }

                NodeSpec::KeywordCatch { keywords, action, match_mode } => {
                    let text = instance
                        .var("lastInbound")
                        .and_then(|m| m.get("text"))
                        .and_then(Value::as_str)
                        .map(str::to_string);

                    match text {
                        None if instance.state == InstanceState::WaitingForReply => Step::Hold,
                        None => Step::Suspend(InstanceState::WaitingForReply, None),
                        Some(text) => match find_match(&text, keywords, *match_mode) {
                            Some(keyword) => {
                                tracing::info!("🔑 Instance {} matched keyword '{}'", instance.id, keyword);
                                instance.set_var("matchedKeyword", json!(keyword));
                                match action {
                                    KeywordAction::Continue => Step::Goto(next),
                                    KeywordAction::Stop => Step::Stop,
                                    KeywordAction::Jump { target_node_id } => Step::Goto(Some(target_node_id.clone())),
                                }
                            }
                            None => {
                                instance.set_var("matchedKeyword", Value::Null);
                                Step::Goto(next)
                            }
                        },
                    }
                }
            };

            // The event's message belongs to the node the instance was parked on
            reply = None;

            match step {
                Step::Goto(Some(target)) => {
                    instance.move_to(target);
                    self.persist(&mut instance).await?;
                    dirty = false;
                }
                Step::Hold => {
                    if dirty {
                        self.persist(&mut instance).await?;
                    }
                    return Ok(instance.state);
                }
                terminal_or_wait => return self.finish(instance, terminal_or_wait, armed_deadline).await,
            }
        }
    }

    /// Record the final transition of this event and settle the timer
    async fn finish(
        &self,
        mut instance: AutomationInstance,
        step: Step,
        armed_deadline: Option<DateTime<Utc>>,
    ) -> Result<InstanceState, EngineError> {
        match step {
            Step::Goto(None) => {
                instance.complete();
                tracing::info!("✅ Instance {} completed flow {}", instance.id, instance.flow_id);
            }
            Step::Suspend(state, deadline) => {
                instance.suspend(state, deadline);
                tracing::debug!("⏸️ Instance {} suspended ({}) at node {}", instance.id, state, instance.current_node_id);
            }
            Step::Stop => {
                instance.stop();
                tracing::info!("🛑 Instance {} stopped by keyword", instance.id);
            }
            Step::Fail(error) => {
                tracing::error!("❌ Instance {} failed: {}", instance.id, error);
                instance.fail(error);
            }
            Step::Goto(Some(_)) | Step::Hold => {}
        }

        self.persist(&mut instance).await?;

        match (instance.state.is_waiting(), instance.deadline) {
            (true, Some(at)) if armed_deadline != Some(at) => {
                if let Err(e) = self.timers.schedule_at(&instance.id, at).await {
                    // The sweeper still finds the stored deadline
                    tracing::warn!("⚠️ Could not arm timer for instance {}: {}", instance.id, e);
                }
            }
            (true, Some(_)) => {}
            _ if armed_deadline.is_some() => self.timers.cancel(&instance.id).await,
            _ => {}
        }

        Ok(instance.state)
    }

    async fn persist(&self, instance: &mut AutomationInstance) -> Result<(), EngineError> {
        instance.updated_at = Utc::now();
        instance.version = self.store.save(instance, instance.version).await?;
        Ok(())
    }

    /// Hand an action to the executor, retrying transient failures with backoff
    async fn deliver(&self, action: &Action, instance: &AutomationInstance) -> Result<Ack, DeliveryError> {
        let token = instance.idempotency_token();
        let mut attempt = 1;

        loop {
            match self
                .actions
                .execute(action, &instance.conversation_id, &instance.context, &token)
                .await
            {
                Ok(ack) => {
                    tracing::info!("📤 Delivered step {} of instance {} (attempt {})", token, instance.id, attempt);
                    return Ok(ack);
                }
                Err(e) if e.is_retryable() && attempt < self.config.max_delivery_attempts => {
                    let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        "🔄 Delivery attempt {}/{} for {} failed: {} (retrying in {:?})",
                        attempt,
                        self.config.max_delivery_attempts,
                        token,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::error!("❌ Delivery for {} gave up after {} attempts: {}", token, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Why an event has nothing to do for this instance, if it does not
fn ignore_reason(instance: &AutomationInstance, event: &Event) -> Option<&'static str> {
    if instance.state.is_terminal() {
        return Some("instance is terminal");
    }

    match event {
        Event::InboundMessage(msg) if instance.has_seen(&msg.dedup_key()) && instance.state != InstanceState::Running => {
            Some("message already applied")
        }
        Event::InboundMessage(_) => None,
        Event::Tick { at } => match (instance.state.is_waiting(), instance.deadline) {
            (true, Some(deadline)) if *at < deadline => Some("tick before deadline"),
            (true, None) => Some("tick while waiting for a message"),
            _ => None,
        },
    }
}

/// `now + seconds`, or `None` when the result leaves chrono's range
fn deadline_after(now: DateTime<Utc>, seconds: u64) -> Option<DateTime<Utc>> {
    let delta = chrono::Duration::try_seconds(i64::try_from(seconds).ok()?)?;
    now.checked_add_signed(delta)
}

fn out_of_range(node_id: &str, seconds: u64) -> String {
    format!("configuration error: node '{}' waits {}s, which is out of range", node_id, seconds)
}
