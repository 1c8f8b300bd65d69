/// Event dispatcher: routes inbound messages, triggers and timer ticks
///
/// Every instance touched by an event is advanced on its own task. The engine's
/// lease serializes work per instance, so the dispatcher never coordinates
/// beyond fan-out and collecting outcomes.

use crate::error::{EngineError, StoreError};
use crate::flow::{registry::FlowRegistry, types::{FlowDefinition, TriggerKind}};
use crate::instance::{AutomationInstance, InstanceState, InstanceStore};
use crate::runtime::engine::ExecutionEngine;
use crate::runtime::event::{Event, InboundMessage};
use crate::runtime::keyword::find_match;
use crate::runtime::timer::TimerTick;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::{sync::mpsc, task::JoinSet};

/// One instance touched while dispatching an event
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Dispatched {
    pub instance_id: String,
    pub flow_id: String,
    pub state: InstanceState,
}

/// What a dispatch did
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    /// Waiting instances the event was delivered to
    pub delivered: Vec<Dispatched>,
    /// Instances created by the event
    pub spawned: Vec<Dispatched>,
    /// Flows that already had an active instance for the conversation
    pub coalesced: Vec<String>,
    pub errors: Vec<String>,
}

enum Outcome {
    Delivered(Dispatched),
    Spawned(Dispatched),
    Coalesced(String),
    Error(String),
}

impl DispatchReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Delivered(d) => self.delivered.push(d),
            Outcome::Spawned(d) => self.spawned.push(d),
            Outcome::Coalesced(flow_id) => self.coalesced.push(flow_id),
            Outcome::Error(e) => self.errors.push(e),
        }
    }
}

pub struct EventDispatcher {
    engine: Arc<ExecutionEngine>,
    registry: Arc<FlowRegistry>,
    store: Arc<dyn InstanceStore>,
}

impl EventDispatcher {
    pub fn new(engine: Arc<ExecutionEngine>, registry: Arc<FlowRegistry>) -> Self {
        let store = Arc::clone(engine.store());
        Self { engine, registry, store }
    }

    /// Route an inbound message
    ///
    /// Instances waiting for a reply in this conversation get the message;
    /// instances inside a time gap only record it as their latest inbound. If
    /// nothing was waiting for a reply, keyword and message_received flows may
    /// start instead.
    pub async fn on_inbound_message(&self, message: InboundMessage) -> Result<DispatchReport, StoreError> {
        let mut report = DispatchReport::default();
        let event = Event::InboundMessage(message.clone());
        let waiting = self.store.find_waiting_by_conversation(&message.conversation_id).await?;
        let awaiting_reply = waiting.iter().any(|i| i.state == InstanceState::WaitingForReply);

        let mut tasks = JoinSet::new();

        if !waiting.is_empty() {
            tracing::info!(
                "💬 Delivering message to {} waiting instances of conversation {}",
                waiting.len(),
                message.conversation_id
            );
        }
        for instance in waiting {
            let engine = Arc::clone(&self.engine);
            let event = event.clone();
            tasks.spawn(async move {
                match engine.advance(&instance.id, &event).await {
                    Ok(state) => Outcome::Delivered(Dispatched {
                        instance_id: instance.id,
                        flow_id: instance.flow_id,
                        state,
                    }),
                    Err(e) => Outcome::Error(format!("instance {}: {}", instance.id, e)),
                }
            });
        }

        if !awaiting_reply {
            let trigger_payload = message.to_context();

            for flow in self.registry.flows_for_trigger(TriggerKind::Keyword) {
                let keywords = flow.trigger_keywords();
                if let Some(keyword) = find_match(&message.text, &keywords, flow.trigger_match_mode()) {
                    let trigger = json!({
                        "kind": TriggerKind::Keyword.as_str(),
                        "keyword": keyword,
                        "config": trigger_payload,
                    });
                    tasks.spawn(self.spawn_task(flow, &message.conversation_id, trigger, event.clone()));
                }
            }

            for flow in self.registry.flows_for_trigger(TriggerKind::MessageReceived) {
                let trigger = json!({
                    "kind": TriggerKind::MessageReceived.as_str(),
                    "config": trigger_payload,
                });
                tasks.spawn(self.spawn_task(flow, &message.conversation_id, trigger, event.clone()));
            }
        }

        collect(&mut tasks, &mut report).await;
        Ok(report)
    }

    /// Start every flow listening for `kind` on this conversation
    ///
    /// `campaign_sent` honours the flow's campaign filter; a `keyword` trigger
    /// raised from outside carries the text to match in `config.text`.
    pub async fn on_trigger(&self, kind: TriggerKind, conversation_id: &str, config: Value) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut tasks = JoinSet::new();
        let event = Event::tick_now();

        for flow in self.registry.flows_for_trigger(kind) {
            let applies = match kind {
                TriggerKind::CampaignSent => flow.accepts_campaign(&config),
                TriggerKind::Keyword => config
                    .get("text")
                    .and_then(Value::as_str)
                    .and_then(|text| find_match(text, &flow.trigger_keywords(), flow.trigger_match_mode()).map(|_| ()))
                    .is_some(),
                TriggerKind::NewConversation | TriggerKind::MessageReceived => true,
            };
            if !applies {
                tracing::debug!("⏭️ Flow {} does not accept this {} trigger", flow.id, kind.as_str());
                continue;
            }

            let trigger = json!({ "kind": kind.as_str(), "config": config.clone() });
            tasks.spawn(self.spawn_task(flow, conversation_id, trigger, event.clone()));
        }

        collect(&mut tasks, &mut report).await;
        tracing::info!(
            "🎯 Trigger {} on {}: {} spawned, {} coalesced",
            kind.as_str(),
            conversation_id,
            report.spawned.len(),
            report.coalesced.len()
        );
        report
    }

    /// Stop every live instance of a conversation
    pub async fn close_conversation(&self, conversation_id: &str) -> Result<Vec<String>, EngineError> {
        let active = self.store.find_active_by_conversation(conversation_id).await?;
        let stopped = self.cancel_all(active, "conversation closed").await;
        tracing::info!("📪 Conversation {} closed, {} instances stopped", conversation_id, stopped.len());
        Ok(stopped)
    }

    /// Unpublish a flow and stop its live instances
    ///
    /// Instances are stopped both before and after the registry drops the flow
    /// so an instance spawned in between does not survive the retirement.
    pub async fn retire_flow(&self, flow_id: &str) -> anyhow::Result<bool> {
        let active = self.store.find_active_by_flow(flow_id).await?;
        let mut stopped = self.cancel_all(active, "flow deleted").await;

        let removed = self.registry.remove_flow(flow_id).await?;

        let stragglers = self.store.find_active_by_flow(flow_id).await?;
        stopped.extend(self.cancel_all(stragglers, "flow deleted").await);

        tracing::info!("🗑️ Flow {} retired, {} instances stopped", flow_id, stopped.len());
        Ok(removed)
    }

    /// Feed timer ticks into the engine until the channel closes
    pub async fn run_tick_worker(self: Arc<Self>, mut ticks: mpsc::UnboundedReceiver<TimerTick>) {
        tracing::info!("⏰ Tick worker started");
        while let Some(tick) = ticks.recv().await {
            let engine = Arc::clone(&self.engine);
            tokio::spawn(async move {
                let event = Event::Tick { at: tick.at };
                match engine.advance(&tick.instance_id, &event).await {
                    Ok(state) => tracing::debug!("🔔 Tick applied to {} -> {}", tick.instance_id, state),
                    Err(EngineError::InstanceNotFound(id)) => {
                        tracing::warn!("⚠️ Tick for unknown instance {}", id)
                    }
                    Err(e) => tracing::error!("❌ Tick for {} failed: {}", tick.instance_id, e),
                }
            });
        }
        tracing::info!("⏹️ Tick worker stopped");
    }

    fn spawn_task(
        &self,
        flow: Arc<FlowDefinition>,
        conversation_id: &str,
        trigger: Value,
        first_event: Event,
    ) -> impl std::future::Future<Output = Outcome> + Send + 'static {
        let engine = Arc::clone(&self.engine);
        let store = Arc::clone(&self.store);
        let instance = AutomationInstance::new(flow.id.clone(), flow.entry_node_id.clone(), conversation_id, trigger);

        async move {
            let created = match store.create(&instance).await {
                Ok(created) => created,
                Err(StoreError::ActiveInstanceExists { flow_id, conversation_id }) => {
                    tracing::debug!("🔗 Flow {} already active for {}, coalescing", flow_id, conversation_id);
                    return Outcome::Coalesced(flow_id);
                }
                Err(e) => return Outcome::Error(format!("flow {}: {}", flow.id, e)),
            };

            tracing::info!("🚀 Started flow {} for conversation {} (instance {})", flow.id, created.conversation_id, created.id);

            match engine.advance(&created.id, &first_event).await {
                Ok(state) => Outcome::Spawned(Dispatched {
                    instance_id: created.id,
                    flow_id: created.flow_id,
                    state,
                }),
                Err(e) => Outcome::Error(format!("instance {}: {}", created.id, e)),
            }
        }
    }

    async fn cancel_all(&self, instances: Vec<AutomationInstance>, reason: &'static str) -> Vec<String> {
        let mut tasks = JoinSet::new();
        for instance in instances {
            let engine = Arc::clone(&self.engine);
            tasks.spawn(async move {
                match engine.cancel(&instance.id, reason).await {
                    Ok(_) => Some(instance.id),
                    Err(e) => {
                        tracing::error!("❌ Could not stop instance {}: {}", instance.id, e);
                        None
                    }
                }
            });
        }

        let mut stopped = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Some(id)) = joined {
                stopped.push(id);
            }
        }
        stopped
    }
}

async fn collect(tasks: &mut JoinSet<Outcome>, report: &mut DispatchReport) {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => report.record(outcome),
            Err(e) => report.errors.push(format!("dispatch task panicked: {}", e)),
        }
    }
}
