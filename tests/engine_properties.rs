mod common;

use common::{at, t0, Harness};
use convoflow::{
    flow::TriggerKind,
    instance::{AutomationInstance, InstanceState},
    runtime::{InboundMessage, TimerService},
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn gap_flow() -> Value {
    json!({
        "id": "gap",
        "name": "Follow-up after a minute",
        "triggerKind": "new_conversation",
        "entryNodeId": "wait",
        "nodes": {
            "wait": { "type": "time_gap", "delaySeconds": 60, "nextNodeId": "thanks" },
            "thanks": { "type": "custom_reply", "message": "Thanks" }
        }
    })
}

fn ask_flow() -> Value {
    json!({
        "id": "ask",
        "triggerKind": "new_conversation",
        "entryNodeId": "reply",
        "nodes": {
            "reply": { "type": "user_reply", "waitSeconds": 300, "nextNodeId": "ack" },
            "ack": { "type": "custom_reply", "message": "Got it" }
        }
    })
}

#[tokio::test]
async fn no_wait_flow_completes_in_one_call() {
    let h = Harness::new().await;
    h.publish(json!({
        "id": "spring",
        "triggerKind": "campaign_sent",
        "triggerConfig": { "campaignId": "spring-2026" },
        "entryNodeId": "tpl",
        "nodes": {
            "tpl": {
                "type": "send_template",
                "templateId": "spring_promo",
                "variables": ["$.trigger.config.discount"],
                "nextNodeId": "note"
            },
            "note": { "type": "custom_reply", "message": "Enjoy {{$.trigger.config.discount}}% off", "nextNodeId": "bye" },
            "bye": { "type": "custom_reply", "message": "See you" }
        }
    }))
    .await;

    let other = h
        .dispatcher
        .on_trigger(TriggerKind::CampaignSent, "c1", json!({ "campaignId": "autumn" }))
        .await;
    assert!(other.spawned.is_empty());

    let report = h
        .dispatcher
        .on_trigger(TriggerKind::CampaignSent, "c1", json!({ "campaignId": "spring-2026", "discount": 15 }))
        .await;

    assert_eq!(report.spawned.len(), 1);
    assert_eq!(report.spawned[0].state, InstanceState::Completed);
    assert_eq!(h.executor.texts(), vec!["spring_promo", "Enjoy 15% off", "See you"]);

    let sent = h.executor.sent();
    assert!(sent.iter().all(|s| s.conversation_id == "c1"));
    match &sent[0].action {
        convoflow::runtime::Action::SendTemplate { variables, .. } => assert_eq!(variables, &vec![json!(15)]),
        other => panic!("unexpected first action {:?}", other),
    }

    let instance = h.load(&report.spawned[0].instance_id).await;
    assert_eq!(instance.execution_count, 1);
    assert!(instance.deadline.is_none());
}

#[tokio::test]
async fn time_gap_never_fires_early() {
    let h = Harness::new().await;
    h.publish(gap_flow()).await;

    let instance = h.start("gap", "c1", t0()).await;
    assert_eq!(instance.state, InstanceState::WaitingForTimer);
    assert_eq!(instance.deadline, Some(at(60)));
    assert_eq!(h.timer.armed_at(&instance.id), Some(at(60)));

    assert_eq!(h.tick(&instance.id, at(30)).await, InstanceState::WaitingForTimer);
    let early_message = InboundMessage::new("c1", "hello?", at(40));
    assert_eq!(h.message(&instance.id, &early_message).await, InstanceState::WaitingForTimer);
    assert!(h.executor.texts().is_empty());
    assert_eq!(h.load(&instance.id).await.execution_count, 1);

    assert_eq!(h.tick(&instance.id, at(61)).await, InstanceState::Completed);
    assert_eq!(h.executor.texts(), vec!["Thanks"]);

    assert_eq!(h.tick(&instance.id, at(62)).await, InstanceState::Completed);
    assert_eq!(h.executor.texts().len(), 1);

    let done = h.load(&instance.id).await;
    assert_eq!(done.execution_count, 2);
    assert!(h.timer.armed_at(&instance.id).is_none());
}

#[tokio::test]
async fn reply_is_captured_once() {
    let h = Harness::new().await;
    h.publish(ask_flow()).await;

    let instance = h.start("ask", "c1", t0()).await;
    assert_eq!(instance.state, InstanceState::WaitingForReply);
    assert_eq!(instance.deadline, Some(at(300)));

    let reply = InboundMessage::new("c1", "Ana", at(10));
    let report = h.dispatcher.on_inbound_message(reply.clone()).await.unwrap();
    assert_eq!(report.delivered.len(), 1);
    assert_eq!(report.delivered[0].state, InstanceState::Completed);
    assert_eq!(h.executor.texts(), vec!["Got it"]);

    // Redelivery through the dispatcher and straight to the engine
    let again = h.dispatcher.on_inbound_message(reply.clone()).await.unwrap();
    assert!(again.delivered.is_empty() && again.spawned.is_empty());
    assert_eq!(h.message(&instance.id, &reply).await, InstanceState::Completed);
    assert_eq!(h.executor.texts().len(), 1);

    let done = h.load(&instance.id).await;
    assert_eq!(done.context["lastReply"]["text"], "Ana");
    assert_eq!(done.context["replyTimedOut"], false);
    assert_eq!(done.execution_count, 2);
}

#[tokio::test]
async fn reply_timeout_passes_through() {
    let h = Harness::new().await;
    h.publish(ask_flow()).await;

    let instance = h.start("ask", "c2", t0()).await;
    assert_eq!(h.tick(&instance.id, at(299)).await, InstanceState::WaitingForReply);
    assert!(h.executor.texts().is_empty());

    assert_eq!(h.tick(&instance.id, at(300)).await, InstanceState::Completed);
    assert_eq!(h.executor.texts(), vec!["Got it"]);

    let done = h.load(&instance.id).await;
    assert_eq!(done.context["replyTimedOut"], true);
    assert!(done.context.get("lastReply").is_none());
}

#[tokio::test]
async fn duplicate_message_sends_once_and_counts_once() {
    let h = Harness::new().await;
    h.publish(json!({
        "id": "survey",
        "triggerKind": "new_conversation",
        "entryNodeId": "q1",
        "nodes": {
            "q1": { "type": "user_reply", "waitSeconds": 300, "nextNodeId": "ack1" },
            "ack1": { "type": "custom_reply", "message": "Thanks for {{$.lastReply.text}}", "nextNodeId": "q2" },
            "q2": { "type": "user_reply", "waitSeconds": 300, "nextNodeId": "ack2" },
            "ack2": { "type": "custom_reply", "message": "Done" }
        }
    }))
    .await;

    let instance = h.start("survey", "c1", t0()).await;
    let mut blue = InboundMessage::new("c1", "blue", at(5));
    blue.message_id = Some("wamid.1".into());

    let (first, second) = tokio::join!(h.message(&instance.id, &blue), h.message(&instance.id, &blue));
    assert_eq!(first, InstanceState::WaitingForReply);
    assert_eq!(second, InstanceState::WaitingForReply);
    assert_eq!(h.executor.texts(), vec!["Thanks for blue"]);

    let parked = h.load(&instance.id).await;
    assert_eq!(parked.current_node_id, "q2");
    assert_eq!(parked.execution_count, 2);

    assert_eq!(h.message(&instance.id, &blue).await, InstanceState::WaitingForReply);
    assert_eq!(h.load(&instance.id).await.execution_count, 2);

    let red = InboundMessage::new("c1", "red", at(6));
    assert_eq!(h.message(&instance.id, &red).await, InstanceState::Completed);
    assert_eq!(h.executor.texts(), vec!["Thanks for blue", "Done"]);

    let tokens: Vec<String> = h.executor.sent().into_iter().map(|s| s.token).collect();
    assert_ne!(tokens[0], tokens[1]);
    assert_eq!(h.load(&instance.id).await.execution_count, 3);
}

#[tokio::test]
async fn keyword_stop_halts_permanently() {
    let h = Harness::new().await;
    h.publish(json!({
        "id": "optout",
        "triggerKind": "new_conversation",
        "entryNodeId": "catch",
        "nodes": {
            "catch": {
                "type": "keyword_catch",
                "keywords": ["stop", "unsubscribe"],
                "action": { "kind": "stop" },
                "nextNodeId": "offer"
            },
            "offer": { "type": "custom_reply", "message": "Here is another offer" }
        }
    }))
    .await;

    let instance = h.start("optout", "c1", t0()).await;
    assert_eq!(instance.state, InstanceState::WaitingForReply);
    assert!(instance.deadline.is_none());
    assert_eq!(h.tick(&instance.id, at(100)).await, InstanceState::WaitingForReply);

    let report = h
        .dispatcher
        .on_inbound_message(InboundMessage::new("c1", "please STOP now", at(10)))
        .await
        .unwrap();
    assert_eq!(report.delivered[0].state, InstanceState::Stopped);

    assert_eq!(h.message(&instance.id, &InboundMessage::new("c1", "hello", at(20))).await, InstanceState::Stopped);
    assert_eq!(h.tick(&instance.id, at(9_999)).await, InstanceState::Stopped);
    assert!(h.executor.texts().is_empty());

    let stopped = h.load(&instance.id).await;
    assert_eq!(stopped.context["matchedKeyword"], "stop");
    assert_eq!(stopped.execution_count, 2);
}

#[tokio::test]
async fn opt_out_sent_during_a_time_gap_is_honoured() {
    let h = Harness::new().await;
    h.publish(json!({
        "id": "nurture",
        "triggerKind": "new_conversation",
        "entryNodeId": "ask",
        "nodes": {
            "ask": { "type": "user_reply", "waitSeconds": 300, "nextNodeId": "pause" },
            "pause": { "type": "time_gap", "delaySeconds": 60, "nextNodeId": "catch" },
            "catch": {
                "type": "keyword_catch",
                "keywords": ["stop"],
                "action": { "kind": "stop" },
                "nextNodeId": "offer"
            },
            "offer": { "type": "custom_reply", "message": "Another offer" }
        }
    }))
    .await;

    let instance = h.start("nurture", "c1", t0()).await;
    assert_eq!(instance.state, InstanceState::WaitingForReply);

    let hi = h.dispatcher.on_inbound_message(InboundMessage::new("c1", "hi", at(10))).await.unwrap();
    assert_eq!(hi.delivered[0].state, InstanceState::WaitingForTimer);

    let stop = h.dispatcher.on_inbound_message(InboundMessage::new("c1", "STOP", at(20))).await.unwrap();
    assert_eq!(stop.delivered.len(), 1);
    assert_eq!(stop.delivered[0].state, InstanceState::WaitingForTimer);
    assert!(stop.spawned.is_empty());

    let paused = h.load(&instance.id).await;
    assert_eq!(paused.context["lastInbound"]["text"], "STOP");
    assert_eq!(paused.context["lastReply"]["text"], "hi");
    assert_eq!(paused.deadline, Some(at(70)));

    assert_eq!(h.tick(&instance.id, at(80)).await, InstanceState::Stopped);
    assert!(h.executor.texts().is_empty());
    assert_eq!(h.load(&instance.id).await.context["matchedKeyword"], "stop");
}

#[tokio::test]
async fn keyword_jump_skips_the_default_successor() {
    let h = Harness::new().await;
    h.publish(json!({
        "id": "route",
        "triggerKind": "new_conversation",
        "entryNodeId": "catch",
        "nodes": {
            "catch": {
                "type": "keyword_catch",
                "keywords": ["sales"],
                "action": { "kind": "jump", "targetNodeId": "handoff" },
                "nextNodeId": "menu"
            },
            "menu": { "type": "custom_reply", "message": "Main menu" },
            "handoff": { "type": "user_reply", "waitSeconds": 600, "nextNodeId": "agent" },
            "agent": { "type": "custom_reply", "message": "An agent will call you" }
        }
    }))
    .await;

    let routed = h.start("route", "c1", t0()).await;
    let state = h.message(&routed.id, &InboundMessage::new("c1", "talk to sales", at(10))).await;
    assert_eq!(state, InstanceState::WaitingForReply);

    let routed = h.load(&routed.id).await;
    assert_eq!(routed.current_node_id, "handoff");
    assert_eq!(h.timer.armed_at(&routed.id), Some(at(610)));
    assert!(h.executor.texts().is_empty());

    // No keyword: falls through to the default successor
    let browsing = h.start("route", "c2", t0()).await;
    let state = h.message(&browsing.id, &InboundMessage::new("c2", "just looking", at(10))).await;
    assert_eq!(state, InstanceState::Completed);
    assert_eq!(h.executor.texts(), vec!["Main menu"]);
    assert_eq!(h.load(&browsing.id).await.context["matchedKeyword"], Value::Null);
}

#[tokio::test]
async fn match_modes_differ_on_partial_words() {
    let h = Harness::new().await;
    for (id, mode) in [("by-token", "token"), ("by-substring", "contains")] {
        h.publish(json!({
            "id": id,
            "triggerKind": "new_conversation",
            "entryNodeId": "catch",
            "nodes": {
                "catch": {
                    "type": "keyword_catch",
                    "keywords": ["stop"],
                    "matchMode": mode,
                    "action": { "kind": "stop" },
                    "nextNodeId": "more"
                },
                "more": { "type": "custom_reply", "message": "Still subscribed" }
            }
        }))
        .await;
    }

    let text = "Any stopwatch deals?";
    let token = h.start("by-token", "c1", t0()).await;
    let substring = h.start("by-substring", "c1", t0()).await;

    assert_eq!(h.message(&token.id, &InboundMessage::new("c1", text, at(5))).await, InstanceState::Completed);
    assert_eq!(h.message(&substring.id, &InboundMessage::new("c1", text, at(5))).await, InstanceState::Stopped);
    assert_eq!(h.executor.texts(), vec!["Still subscribed"]);

    let exact = h.start("by-token", "c2", t0()).await;
    assert_eq!(h.message(&exact.id, &InboundMessage::new("c2", "Stop!", at(5))).await, InstanceState::Stopped);
}

#[tokio::test]
async fn one_active_instance_per_flow_and_conversation() {
    let h = Harness::new().await;
    h.publish(json!({
        "id": "nurture",
        "triggerKind": "new_conversation",
        "entryNodeId": "wait",
        "nodes": {
            "wait": { "type": "user_reply", "waitSeconds": 86400, "nextNodeId": "nudge" },
            "nudge": { "type": "custom_reply", "message": "Still there?" }
        }
    }))
    .await;

    let (a, b) = tokio::join!(
        h.dispatcher.on_trigger(TriggerKind::NewConversation, "c1", json!({})),
        h.dispatcher.on_trigger(TriggerKind::NewConversation, "c1", json!({}))
    );
    assert_eq!(a.spawned.len() + b.spawned.len(), 1);
    assert_eq!(a.coalesced.len() + b.coalesced.len(), 1);
    assert!(a.errors.is_empty() && b.errors.is_empty());

    let active = h.store.find_active_by_conversation("c1").await.unwrap();
    assert_eq!(active.len(), 1);

    let stopped = h.dispatcher.close_conversation("c1").await.unwrap();
    assert_eq!(stopped, vec![active[0].id.clone()]);
    assert_eq!(h.load(&active[0].id).await.state, InstanceState::Stopped);
    assert!(h.timer.cancelled().contains(&active[0].id));

    let restarted = h.dispatcher.on_trigger(TriggerKind::NewConversation, "c1", json!({})).await;
    assert_eq!(restarted.spawned.len(), 1);
}

#[tokio::test]
async fn inbound_message_spawns_only_when_nothing_is_waiting() {
    let h = Harness::new().await;
    h.publish(json!({
        "id": "promo",
        "triggerKind": "keyword",
        "triggerConfig": { "keywords": ["promo"], "matchMode": "token" },
        "entryNodeId": "code",
        "nodes": { "code": { "type": "custom_reply", "message": "Your {{$.trigger.keyword}} code is SPRING15" } }
    }))
    .await;
    h.publish(json!({
        "id": "listener",
        "triggerKind": "message_received",
        "entryNodeId": "reply",
        "nodes": {
            "reply": { "type": "user_reply", "waitSeconds": 60, "nextNodeId": "thanks" },
            "thanks": { "type": "custom_reply", "message": "Thanks for writing" }
        }
    }))
    .await;

    let first = h
        .dispatcher
        .on_inbound_message(InboundMessage::new("c1", "Promo please", at(0)))
        .await
        .unwrap();
    assert_eq!(first.spawned.len(), 2);
    let promo = first.spawned.iter().find(|d| d.flow_id == "promo").unwrap();
    let listener = first.spawned.iter().find(|d| d.flow_id == "listener").unwrap();
    assert_eq!(promo.state, InstanceState::Completed);
    // The triggering message does not answer a reply step the flow had not reached
    assert_eq!(listener.state, InstanceState::WaitingForReply);
    assert_eq!(h.executor.texts(), vec!["Your promo code is SPRING15"]);

    let second = h
        .dispatcher
        .on_inbound_message(InboundMessage::new("c1", "promo again", at(5)))
        .await
        .unwrap();
    assert_eq!(second.delivered.len(), 1);
    assert_eq!(second.delivered[0].instance_id, listener.instance_id);
    assert!(second.spawned.is_empty());
    assert_eq!(h.executor.texts(), vec!["Your promo code is SPRING15", "Thanks for writing"]);
}

#[tokio::test]
async fn retiring_a_flow_stops_its_instances() {
    let h = Harness::new().await;
    h.publish(gap_flow()).await;

    let first = h.start("gap", "c1", t0()).await;
    let second = h.start("gap", "c2", t0()).await;

    assert!(h.dispatcher.retire_flow("gap").await.unwrap());
    for id in [&first.id, &second.id] {
        let instance = h.load(id).await;
        assert_eq!(instance.state, InstanceState::Stopped);
        assert_eq!(instance.context["stopReason"], "flow deleted");
        assert!(h.timer.cancelled().contains(id));
    }
    assert!(h.registry.get_flow("gap").is_none());

    assert_eq!(h.tick(&first.id, at(61)).await, InstanceState::Stopped);
    assert!(h.executor.texts().is_empty());
    assert!(!h.dispatcher.retire_flow("gap").await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recovery_resumes_overdue_and_interrupted_instances() {
    let h = Harness::new().await;
    h.publish(gap_flow()).await;

    let overdue = h.start("gap", "c1", t0()).await;
    let interrupted = h
        .store
        .create(&AutomationInstance::new("gap", "wait", "c2", Value::Null))
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let timers = TimerService::new(tx).await.unwrap();
    assert_eq!(timers.recover(h.store.as_ref()).await.unwrap(), 2);

    let mut ticks = Vec::new();
    while let Ok(tick) = rx.try_recv() {
        ticks.push(tick);
    }
    assert_eq!(ticks.len(), 2);

    for tick in ticks {
        h.tick(&tick.instance_id, tick.at).await;
    }

    assert_eq!(h.load(&overdue.id).await.state, InstanceState::Completed);
    assert_eq!(h.load(&interrupted.id).await.state, InstanceState::WaitingForTimer);
    assert_eq!(h.executor.texts(), vec!["Thanks"]);
}
