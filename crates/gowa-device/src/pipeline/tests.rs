use crate::device::ConnectionState;
use crate::registry::DeviceRegistry;
use crate::testing::MockTransportFactory;
use crate::transport::{HistorySyncChunk, MessageMeta, ProtocolEvent, RawMessage};
use gowa_core::event::ReceiptKind;
use gowa_core::{Jid, WorkerConfig};
use gowa_storage::{ChatRow, ChatStorage, MessageFilter, MessageRow};
use gowa_webhook::{WebhookConfig, WebhookDispatcher};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type SinkEvents = Arc<Mutex<Vec<Value>>>;

async fn spawn_sink() -> (String, SinkEvents) {
    use axum::{extract::State, routing::post, Router};

    let events: SinkEvents = Arc::default();
    let app = Router::new()
        .route(
            "/hook",
            post(
                |State(events): State<SinkEvents>, body: axum::body::Bytes| async move {
                    if let Ok(json) = serde_json::from_slice::<Value>(&body) {
                        events.lock().unwrap().push(json);
                    }
                    axum::http::StatusCode::OK
                },
            ),
        )
        .with_state(Arc::clone(&events));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/hook"), events)
}

fn events_named(events: &SinkEvents, name: &str) -> Vec<Value> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e["event"] == name)
        .cloned()
        .collect()
}

/// Poll until the sink holds at least `count` events of `name`.
async fn wait_events(sink: &SinkEvents, name: &str, count: usize) {
    for _ in 0..200 {
        if events_named(sink, name).len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {count} '{name}' event(s)");
}

struct Fixture {
    registry: Arc<DeviceRegistry>,
    factory: Arc<MockTransportFactory>,
    storage: ChatStorage,
    sink: SinkEvents,
}

impl Fixture {
    async fn new(mutate: impl FnOnce(&mut WorkerConfig)) -> Self {
        let (sink_url, sink) = spawn_sink().await;
        let storage = ChatStorage::open(None).await.unwrap();
        let mut config = WorkerConfig::default();
        config.webhooks = vec![sink_url];
        config.webhook_secret = "S".into();
        config.history_debounce_secs = 1;
        mutate(&mut config);

        let webhooks = WebhookDispatcher::new(WebhookConfig::from_worker(&config)).unwrap();
        let factory = MockTransportFactory::new();
        let registry = DeviceRegistry::new(
            storage.clone(),
            Arc::clone(&factory) as Arc<dyn crate::transport::TransportFactory>,
            webhooks,
            config,
        );
        Self {
            registry,
            factory,
            storage,
            sink,
        }
    }

    /// Register device "D" and materialize its transport + pipeline.
    async fn with_device(self) -> Self {
        self.registry.create(Some("D".into())).await.unwrap();
        self.registry.reconnect("D").await.unwrap();
        self
    }

    async fn emit(&self, event: ProtocolEvent) {
        self.factory.emit("D", event).await;
    }
}

fn inbound(chat: &str, id: &str, text: &str) -> ProtocolEvent {
    let chat: Jid = chat.parse().unwrap();
    let meta = MessageMeta::new(id, chat.clone(), chat);
    ProtocolEvent::Message(Box::new(RawMessage::text(text)), meta)
}

async fn message_count(storage: &ChatStorage) -> i64 {
    storage.get_statistics().await.unwrap().1
}

#[tokio::test]
async fn message_is_persisted_and_fanned_out() {
    let f = Fixture::new(|_| {}).await.with_device().await;

    let mut meta = MessageMeta::new(
        "MSG1",
        "5511999887766@s.whatsapp.net".parse().unwrap(),
        "5511999887766@s.whatsapp.net".parse().unwrap(),
    );
    meta.push_name = "Alice".into();
    f.emit(ProtocolEvent::Message(
        Box::new(RawMessage::text("hello")),
        meta,
    ))
    .await;

    wait_events(&f.sink, "message", 1).await;

    let chat = f
        .storage
        .get_chat("D", "5511999887766@s.whatsapp.net")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(chat.name, "Alice");

    let row = f.storage.get_message_by_id("D", "MSG1").await.unwrap().unwrap();
    assert_eq!(row.content, "hello");
    assert!(!row.is_from_me);

    let delivered = events_named(&f.sink, "message");
    assert_eq!(delivered.len(), 1);
    // Message events are flattened: fields at the top level.
    assert_eq!(delivered[0]["content"], "hello");
    assert_eq!(delivered[0]["device_id"], "D");
    assert_eq!(delivered[0]["chat_jid"], "5511999887766@s.whatsapp.net");
}

#[tokio::test]
async fn empty_message_upserts_chat_but_stores_nothing() {
    let f = Fixture::new(|_| {}).await.with_device().await;

    let chat: Jid = "5511999887766@s.whatsapp.net".parse().unwrap();
    let meta = MessageMeta::new("EMPTY1", chat.clone(), chat);
    f.emit(ProtocolEvent::Message(Box::new(RawMessage::default()), meta))
        .await;

    let mut found = None;
    for _ in 0..200 {
        found = f
            .storage
            .get_chat("D", "5511999887766@s.whatsapp.net")
            .await
            .unwrap();
        if found.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(found.is_some(), "chat row should exist for an empty event");
    assert_eq!(message_count(&f.storage).await, 0);
}

#[tokio::test]
async fn receipts_fan_out_without_persistence() {
    let f = Fixture::new(|_| {}).await.with_device().await;

    f.emit(ProtocolEvent::Receipt {
        chat: "5511999887766@s.whatsapp.net".parse().unwrap(),
        sender: "5511999887766@s.whatsapp.net".parse().unwrap(),
        ids: vec!["MSG1".into(), "MSG2".into()],
        kind: ReceiptKind::Read,
    })
    .await;

    wait_events(&f.sink, "message.ack", 1).await;
    let acks = events_named(&f.sink, "message.ack");
    assert_eq!(acks[0]["payload"]["receipt_type"], "read");
    assert_eq!(acks[0]["payload"]["ids"].as_array().unwrap().len(), 2);
    assert_eq!(message_count(&f.storage).await, 0);
}

#[tokio::test]
async fn lid_migration_consolidates_history() {
    let f = Fixture::new(|_| {}).await;
    // The protocol directory knows the hidden identifier for this number.
    f.factory
        .lid_directory
        .lock()
        .unwrap()
        .insert("55119998".into(), "204123456".into());
    let f = f.with_device().await;

    // Seed a phone-form chat with one message, as if recorded before the
    // identifier mapping existed.
    let pn = "55119998@s.whatsapp.net";
    let lid = "204123456@lid";
    f.storage
        .store_chat(&ChatRow {
            device_id: "D".into(),
            jid: pn.into(),
            name: "55119998".into(),
            last_message_time: 1,
            ephemeral_expiration: None,
        })
        .await
        .unwrap();
    f.storage
        .store_message(&MessageRow {
            device_id: "D".into(),
            chat_jid: pn.into(),
            id: "OLD".into(),
            sender: pn.into(),
            content: "old message".into(),
            timestamp: 1,
            ..Default::default()
        })
        .await
        .unwrap();

    f.emit(inbound(pn, "NEW", "fresh message")).await;

    wait_events(&f.sink, "message", 1).await;

    // No row may retain the phone-number form.
    assert!(f.storage.get_chat("D", pn).await.unwrap().is_none());
    assert!(f.storage.get_chat("D", lid).await.unwrap().is_some());
    let moved = f
        .storage
        .get_messages(
            "D",
            &MessageFilter {
                chat_jid: lid.into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(moved.len(), 2);
    assert!(moved.iter().all(|m| m.sender != pn));

    let delivered = events_named(&f.sink, "message");
    assert_eq!(delivered[0]["chat_jid"], lid);
    assert_eq!(delivered[0]["sender_pn"], pn);
}

#[tokio::test]
async fn history_sync_burst_debounces_to_one_completion() {
    let f = Fixture::new(|_| {}).await.with_device().await;

    // Seed a chat whose name is a bare number; the push-name phase should
    // rename it once the debounce fires.
    f.storage
        .store_chat(&ChatRow {
            device_id: "D".into(),
            jid: "55119998@s.whatsapp.net".into(),
            name: "55119998".into(),
            last_message_time: 1,
            ephemeral_expiration: None,
        })
        .await
        .unwrap();

    let chat: Jid = "55117777@s.whatsapp.net".parse().unwrap();
    let chunk: Vec<(RawMessage, MessageMeta)> = (0..3)
        .map(|i| {
            (
                RawMessage::text(format!("history {i}")),
                MessageMeta::new(format!("H{i}"), chat.clone(), chat.clone()),
            )
        })
        .collect();

    f.emit(ProtocolEvent::HistorySync(HistorySyncChunk::Recent(chunk)))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    f.emit(ProtocolEvent::HistorySync(HistorySyncChunk::PushNames(
        vec![("55119998".into(), "Alice".into())],
    )))
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    f.emit(ProtocolEvent::HistorySync(HistorySyncChunk::PushNames(
        vec![("55117777".into(), "Bob".into())],
    )))
    .await;

    // Three sync events inside the window; exactly one completion after it.
    wait_events(&f.sink, "history_sync_complete", 1).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(events_named(&f.sink, "history_sync_complete").len(), 1);

    // Batch ingest landed, and the placeholder names were replaced.
    assert_eq!(message_count(&f.storage).await, 3);
    let renamed = f
        .storage
        .get_chat("D", "55119998@s.whatsapp.net")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(renamed.name, "Alice");
    let renamed = f
        .storage
        .get_chat("D", "55117777@s.whatsapp.net")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(renamed.name, "Bob");

    // The cache drains on fire: a second sync burst only reports its own.
    f.emit(ProtocolEvent::HistorySync(HistorySyncChunk::PushNames(
        vec![],
    )))
    .await;
    wait_events(&f.sink, "history_sync_complete", 2).await;
    let second = &events_named(&f.sink, "history_sync_complete")[1];
    assert_eq!(second["payload"]["push_names_applied"], 0);
}

#[tokio::test]
async fn delete_for_me_joins_original_content() {
    let f = Fixture::new(|_| {}).await.with_device().await;

    f.emit(inbound("5511999887766@s.whatsapp.net", "MSG1", "soon gone"))
        .await;
    wait_events(&f.sink, "message", 1).await;

    f.emit(ProtocolEvent::DeleteForMe {
        chat: "5511999887766@s.whatsapp.net".parse().unwrap(),
        sender: "5511999887766@s.whatsapp.net".parse().unwrap(),
        id: "MSG1".into(),
    })
    .await;

    wait_events(&f.sink, "event.delete_for_me", 1).await;
    let deleted = events_named(&f.sink, "event.delete_for_me");
    assert_eq!(deleted[0]["payload"]["content"], "soon gone");
    assert_eq!(message_count(&f.storage).await, 0);

    // Unknown message: smaller payload, still not an error.
    f.emit(ProtocolEvent::DeleteForMe {
        chat: "5511999887766@s.whatsapp.net".parse().unwrap(),
        sender: "5511999887766@s.whatsapp.net".parse().unwrap(),
        id: "NEVER-SEEN".into(),
    })
    .await;
    wait_events(&f.sink, "event.delete_for_me", 2).await;
    let second = &events_named(&f.sink, "event.delete_for_me")[1];
    assert!(second["payload"].get("content").is_none());
}

#[tokio::test]
async fn edit_updates_stored_content() {
    let f = Fixture::new(|_| {}).await.with_device().await;

    f.emit(inbound("5511999887766@s.whatsapp.net", "MSG1", "first draft"))
        .await;
    wait_events(&f.sink, "message", 1).await;

    f.emit(ProtocolEvent::MessageEdited {
        chat: "5511999887766@s.whatsapp.net".parse().unwrap(),
        sender: "5511999887766@s.whatsapp.net".parse().unwrap(),
        id: "MSG1".into(),
        new_text: "final wording".into(),
    })
    .await;

    wait_events(&f.sink, "message_edited", 1).await;
    let row = f.storage.get_message_by_id("D", "MSG1").await.unwrap().unwrap();
    assert_eq!(row.content, "final wording");
}

#[tokio::test]
async fn auto_actions_fire_once_per_message() {
    let f = Fixture::new(|config| {
        config.auto_reply = Some("I'm away right now".into());
        config.auto_mark_read = true;
    })
    .await
    .with_device()
    .await;

    f.emit(inbound("5511999887766@s.whatsapp.net", "MSG1", "ping"))
        .await;
    wait_events(&f.sink, "message", 1).await;

    let transport = f.factory.transport("D").unwrap();
    for _ in 0..200 {
        if !transport.sent_texts().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(transport.sent_texts().len(), 1);
    assert_eq!(transport.sent_texts()[0].1, "I'm away right now");
    assert_eq!(transport.marks().len(), 1);

    // Replaying the same message is deduplicated for side effects.
    f.emit(inbound("5511999887766@s.whatsapp.net", "MSG1", "ping"))
        .await;
    wait_events(&f.sink, "message", 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.sent_texts().len(), 1);
}

#[tokio::test]
async fn pair_success_promotes_device_state() {
    let f = Fixture::new(|_| {}).await.with_device().await;

    f.emit(ProtocolEvent::PairSuccess {
        jid: "5511999887766@s.whatsapp.net".parse().unwrap(),
    })
    .await;

    let handle = f.registry.get("D").await.unwrap();
    for _ in 0..200 {
        if handle.state().await == ConnectionState::LoggedIn {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(handle.state().await, ConnectionState::LoggedIn);

    let row = f.storage.get_device("D").await.unwrap().unwrap();
    assert_eq!(row.state, "logged_in");
    assert_eq!(row.jid.as_deref(), Some("5511999887766@s.whatsapp.net"));
}
