/// Hot-reload flow registry using ArcSwap
///
/// The engine reads flows on every `advance`, so lookups must never block behind
/// a publish. Each publish validates the flow, persists it, and swaps the whole
/// map pointer; in-flight executions keep the `Arc` they already hold.

use crate::error::FlowError;
use crate::flow::{
    storage::FlowStorage,
    types::{FlowDefinition, KeywordAction, NodeSpec, TriggerKind},
};
use anyhow::Result;
use arc_swap::ArcSwap;
use petgraph::{algo::is_cyclic_directed, graph::DiGraph, visit::Dfs};
use std::{collections::HashMap, sync::Arc};

/// Longest reply window or time gap a flow may declare (ten years)
pub const MAX_DELAY_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Lock-free registry of validated flows
#[derive(Debug)]
pub struct FlowRegistry {
    /// Key: flow_id, Value: validated flow
    flows: ArcSwap<HashMap<String, CompiledFlow>>,
    storage: FlowStorage,
}

/// A flow that passed validation, plus what the analysis found
#[derive(Debug, Clone)]
pub struct CompiledFlow {
    pub flow: Arc<FlowDefinition>,
    /// Nodes that can never execute (not reachable from the entry node)
    pub unreachable_nodes: Vec<String>,
    /// The graph loops back on itself; runtime step ceiling applies
    pub has_cycle: bool,
}

impl FlowRegistry {
    pub fn new(storage: FlowStorage) -> Self {
        Self {
            flows: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    /// Populate the registry from storage at startup
    ///
    /// Invalid stored flows are logged and left out rather than aborting boot.
    pub async fn init_from_storage(&self) -> Result<()> {
        let stored = self.storage.load_all_flows().await?;
        let mut compiled = HashMap::new();

        for (id, flow) in stored {
            match compile_flow(flow) {
                Ok(c) => {
                    compiled.insert(id, c);
                }
                Err(e) => tracing::error!("❌ Stored flow '{}' is invalid and will not run: {}", id, e),
            }
        }

        self.flows.store(Arc::new(compiled));
        tracing::info!("Initialized flow registry with {} flows", self.flows.load().len());
        Ok(())
    }

    /// Validate, persist and hot-swap a flow
    pub async fn publish(&self, flow: FlowDefinition) -> Result<CompiledFlow> {
        let compiled = compile_flow(flow)?;
        self.storage.save_flow(&compiled.flow).await?;

        // rcu retries the copy if another publish swapped the map meanwhile
        self.flows.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(compiled.flow.id.clone(), compiled.clone());
            next
        });

        tracing::info!("🔥 Published flow: {} (v{})", compiled.flow.id, compiled.flow.version);
        Ok(compiled)
    }

    /// Lock-free lookup used by the engine
    pub fn get_flow(&self, flow_id: &str) -> Option<Arc<FlowDefinition>> {
        self.flows.load().get(flow_id).map(|c| Arc::clone(&c.flow))
    }

    /// All flows spawned by the given trigger kind
    pub fn flows_for_trigger(&self, kind: TriggerKind) -> Vec<Arc<FlowDefinition>> {
        self.flows
            .load()
            .values()
            .filter(|c| c.flow.trigger_kind == kind)
            .map(|c| Arc::clone(&c.flow))
            .collect()
    }

    pub fn list_flow_ids(&self) -> Vec<String> {
        self.flows.load().keys().cloned().collect()
    }

    /// Drop a flow from memory and storage; returns whether it existed
    pub async fn remove_flow(&self, flow_id: &str) -> Result<bool> {
        let previous = self.flows.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(flow_id);
            next
        });
        let in_memory = previous.contains_key(flow_id);
        if in_memory {
            tracing::info!("Removed flow from registry: {}", flow_id);
        }

        let stored = self.storage.delete_flow(flow_id).await?;
        Ok(in_memory || stored)
    }
}

/// Check a flow's structure and analyse its graph
///
/// Every successor, jump target and the entry node must exist. Cycles are
/// allowed (a keyword jump back to an earlier question is a legitimate flow),
/// but they are reported so operators know the step ceiling may kick in.
pub fn compile_flow(flow: FlowDefinition) -> Result<CompiledFlow, FlowError> {
    if flow.id.trim().is_empty() {
        return Err(FlowError::MissingId);
    }
    if !flow.nodes.contains_key(&flow.entry_node_id) {
        return Err(FlowError::UnknownEntryNode(flow.entry_node_id.clone()));
    }

    let mut graph = DiGraph::<&str, ()>::new();
    let index: HashMap<&str, _> = flow
        .nodes
        .keys()
        .map(|id| (id.as_str(), graph.add_node(id.as_str())))
        .collect();

    for (id, node) in &flow.nodes {
        let mut successors: Vec<&str> = node.next_node_id.iter().map(String::as_str).collect();

        match &node.spec {
            NodeSpec::SendTemplate { template_id, .. } if template_id.trim().is_empty() => {
                return Err(FlowError::InvalidNode {
                    node: id.clone(),
                    reason: "templateId is empty".into(),
                });
            }
            NodeSpec::KeywordCatch { keywords, action, .. } => {
                if keywords.iter().all(|k| k.trim().is_empty()) {
                    return Err(FlowError::InvalidNode {
                        node: id.clone(),
                        reason: "keyword_catch needs at least one keyword".into(),
                    });
                }
                if let KeywordAction::Jump { target_node_id } = action {
                    successors.push(target_node_id.as_str());
                }
            }
            NodeSpec::UserReply { wait_seconds: seconds } | NodeSpec::TimeGap { delay_seconds: seconds }
                if *seconds > MAX_DELAY_SECONDS =>
            {
                return Err(FlowError::DelayOutOfRange {
                    node: id.clone(),
                    seconds: *seconds,
                    max: MAX_DELAY_SECONDS,
                });
            }
            _ => {}
        }

        for to in successors {
            let target = index.get(to).ok_or_else(|| FlowError::UnknownSuccessor {
                from: id.clone(),
                to: to.to_string(),
            })?;
            graph.add_edge(index[id.as_str()], *target, ());
        }
    }

    let mut reachable = std::collections::HashSet::new();
    let mut dfs = Dfs::new(&graph, index[flow.entry_node_id.as_str()]);
    while let Some(nx) = dfs.next(&graph) {
        reachable.insert(graph[nx]);
    }

    let mut unreachable_nodes: Vec<String> = flow
        .nodes
        .keys()
        .filter(|id| !reachable.contains(id.as_str()))
        .cloned()
        .collect();
    unreachable_nodes.sort();

    let has_cycle = is_cyclic_directed(&graph);

    if !unreachable_nodes.is_empty() {
        tracing::warn!("⚠️ Flow '{}' has unreachable nodes: {:?}", flow.id, unreachable_nodes);
    }
    if has_cycle {
        tracing::debug!("🔁 Flow '{}' contains a cycle", flow.id);
    }

    Ok(CompiledFlow {
        flow: Arc::new(flow),
        unreachable_nodes,
        has_cycle,
    })
}
