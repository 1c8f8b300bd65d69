#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use convoflow::{
    database::open_memory_pool,
    error::{DeliveryError, TimerError},
    flow::{FlowDefinition, FlowRegistry, FlowStorage},
    instance::{AutomationInstance, InstanceState, InstanceStore, SqliteInstanceStore},
    runtime::{
        actions::{Ack, Action, ActionExecutor},
        timer::{TimerHandle, TimerScheduler},
        EngineConfig, Event, EventDispatcher, ExecutionEngine, InboundMessage,
    },
};
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

/// One delivered action as seen by the channel
#[derive(Debug, Clone)]
pub struct Sent {
    pub action: Action,
    pub conversation_id: String,
    pub token: String,
}

/// Action executor that records deliveries and can be told to fail
#[derive(Default)]
pub struct RecordingExecutor {
    sent: Mutex<Vec<Sent>>,
    queued_failures: Mutex<Vec<DeliveryError>>,
}

impl RecordingExecutor {
    pub fn fail_next(&self, error: DeliveryError) {
        self.queued_failures.lock().unwrap().insert(0, error);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().unwrap().clone()
    }

    /// Free-text bodies and template ids, in delivery order
    pub fn texts(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|s| match s.action {
                Action::CustomReply { message } => message,
                Action::SendTemplate { template_id, .. } => template_id,
            })
            .collect()
    }
}

#[async_trait]
impl ActionExecutor for RecordingExecutor {
    async fn execute(
        &self,
        action: &Action,
        conversation_id: &str,
        _context: &Value,
        idempotency_token: &str,
    ) -> Result<Ack, DeliveryError> {
        if let Some(error) = self.queued_failures.lock().unwrap().pop() {
            return Err(error);
        }
        self.sent.lock().unwrap().push(Sent {
            action: action.clone(),
            conversation_id: conversation_id.to_string(),
            token: idempotency_token.to_string(),
        });
        Ok(Ack::default())
    }
}

/// Timer that only records what the engine asked for; tests fire ticks by hand
#[derive(Default)]
pub struct ManualTimer {
    armed: Mutex<HashMap<String, DateTime<Utc>>>,
    cancelled: Mutex<Vec<String>>,
}

impl ManualTimer {
    pub fn armed_at(&self, instance_id: &str) -> Option<DateTime<Utc>> {
        self.armed.lock().unwrap().get(instance_id).copied()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl TimerScheduler for ManualTimer {
    async fn schedule_at(&self, instance_id: &str, at: DateTime<Utc>) -> Result<TimerHandle, TimerError> {
        self.armed.lock().unwrap().insert(instance_id.to_string(), at);
        Ok(TimerHandle {
            instance_id: instance_id.to_string(),
            fire_at: at,
            job_id: None,
        })
    }

    async fn cancel(&self, instance_id: &str) {
        self.armed.lock().unwrap().remove(instance_id);
        self.cancelled.lock().unwrap().push(instance_id.to_string());
    }
}

pub struct Harness {
    pub registry: Arc<FlowRegistry>,
    pub store: Arc<dyn InstanceStore>,
    pub engine: Arc<ExecutionEngine>,
    pub dispatcher: Arc<EventDispatcher>,
    pub executor: Arc<RecordingExecutor>,
    pub timer: Arc<ManualTimer>,
}

impl Harness {
    pub async fn new() -> Self {
        let pool = open_memory_pool().await.expect("in-memory database");
        let registry = Arc::new(FlowRegistry::new(FlowStorage::new(pool.clone())));
        let store: Arc<dyn InstanceStore> = Arc::new(SqliteInstanceStore::new(pool));
        let executor = Arc::new(RecordingExecutor::default());
        let timer = Arc::new(ManualTimer::default());

        let config = EngineConfig {
            retry_base_delay: std::time::Duration::from_millis(1),
            ..EngineConfig::default()
        };
        let engine = Arc::new(ExecutionEngine::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            timer.clone(),
            executor.clone(),
            config,
        ));
        let dispatcher = Arc::new(EventDispatcher::new(Arc::clone(&engine), Arc::clone(&registry)));

        Self {
            registry,
            store,
            engine,
            dispatcher,
            executor,
            timer,
        }
    }

    pub async fn publish(&self, flow: Value) -> Arc<FlowDefinition> {
        let flow: FlowDefinition = serde_json::from_value(flow).expect("flow document");
        self.registry.publish(flow).await.expect("valid flow").flow
    }

    /// Create an instance at the flow's entry node and kick it at `at`
    pub async fn start(&self, flow_id: &str, conversation_id: &str, at: DateTime<Utc>) -> AutomationInstance {
        let flow = self.registry.get_flow(flow_id).expect("published flow");
        let instance = self
            .store
            .create(&AutomationInstance::new(
                flow_id,
                flow.entry_node_id.clone(),
                conversation_id,
                Value::Null,
            ))
            .await
            .expect("created");
        self.engine
            .advance(&instance.id, &Event::Tick { at })
            .await
            .expect("advanced");
        self.load(&instance.id).await
    }

    pub async fn tick(&self, instance_id: &str, at: DateTime<Utc>) -> InstanceState {
        self.engine.advance(instance_id, &Event::Tick { at }).await.expect("tick applied")
    }

    pub async fn message(&self, instance_id: &str, msg: &InboundMessage) -> InstanceState {
        self.engine
            .advance(instance_id, &Event::InboundMessage(msg.clone()))
            .await
            .expect("message applied")
    }

    pub async fn load(&self, instance_id: &str) -> AutomationInstance {
        self.store.load(instance_id).await.expect("load").expect("instance exists")
    }
}

/// Fixed reference time so deadlines are easy to reason about
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(seconds)
}
