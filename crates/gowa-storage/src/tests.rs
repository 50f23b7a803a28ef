use super::*;
use gowa_core::GatewayError;

async fn store() -> ChatStorage {
    ChatStorage::open(None).await.unwrap()
}

fn chat(device_id: &str, jid: &str, name: &str) -> ChatRow {
    ChatRow {
        device_id: device_id.to_string(),
        jid: jid.to_string(),
        name: name.to_string(),
        last_message_time: 1_700_000_000,
        ephemeral_expiration: None,
    }
}

fn message(device_id: &str, chat_jid: &str, id: &str, content: &str) -> MessageRow {
    MessageRow {
        device_id: device_id.to_string(),
        chat_jid: chat_jid.to_string(),
        id: id.to_string(),
        sender: chat_jid.to_string(),
        content: content.to_string(),
        timestamp: 1_700_000_000,
        ..Default::default()
    }
}

#[tokio::test]
async fn migrations_reach_latest_version() {
    let s = store().await;
    assert_eq!(s.schema_version().await.unwrap(), 4);
}

#[tokio::test]
async fn chat_upsert_is_unique_per_device_and_jid() {
    let s = store().await;
    s.store_chat(&chat("D", "1@s.whatsapp.net", "one")).await.unwrap();
    s.store_chat(&chat("D", "1@s.whatsapp.net", "renamed")).await.unwrap();
    s.store_chat(&chat("E", "1@s.whatsapp.net", "other-device")).await.unwrap();

    let rows = s.get_chats("D", &ChatFilter::default()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "renamed");

    let rows = s.get_chats("E", &ChatFilter::default()).await.unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn chat_upsert_preserves_ephemeral_expiration() {
    let s = store().await;
    let mut c = chat("D", "1@s.whatsapp.net", "one");
    c.ephemeral_expiration = Some(86_400);
    s.store_chat(&c).await.unwrap();

    // Next upsert carries no expiry; the prior value must survive.
    c.ephemeral_expiration = None;
    c.name = "still one".into();
    s.store_chat(&c).await.unwrap();

    let row = s.get_chat("D", "1@s.whatsapp.net").await.unwrap().unwrap();
    assert_eq!(row.ephemeral_expiration, Some(86_400));
    assert_eq!(row.name, "still one");
}

#[tokio::test]
async fn message_upsert_is_idempotent() {
    let s = store().await;
    s.store_chat(&chat("D", "1@s.whatsapp.net", "one")).await.unwrap();
    let m = message("D", "1@s.whatsapp.net", "MSG1", "hello");
    s.store_message(&m).await.unwrap();
    s.store_message(&m).await.unwrap();

    let (_, messages) = s.get_statistics().await.unwrap();
    assert_eq!(messages, 1);

    let row = s.get_message_by_id("D", "MSG1").await.unwrap().unwrap();
    assert_eq!(row.content, "hello");
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let s = store().await;
    s.store_chat(&chat("D", "1@s.whatsapp.net", "one")).await.unwrap();
    let m = message("D", "1@s.whatsapp.net", "MSG1", "");
    let err = s.store_message(&m).await.unwrap_err();
    assert!(matches!(err, GatewayError::InvalidInput(_)));

    // Media without text is fine.
    let mut m = message("D", "1@s.whatsapp.net", "MSG2", "");
    m.media_type = "image".into();
    s.store_message(&m).await.unwrap();
}

#[tokio::test]
async fn media_path_is_monotonic() {
    let s = store().await;
    s.store_chat(&chat("D", "1@s.whatsapp.net", "one")).await.unwrap();

    let mut m = message("D", "1@s.whatsapp.net", "MSG1", "photo");
    m.media_type = "image".into();
    m.media_path = Some("statics/media/MSG1.jpg".into());
    s.store_message(&m).await.unwrap();

    // A later upsert without a path must not clobber the stored one.
    m.media_path = None;
    m.content = "photo (edited caption)".into();
    s.store_message(&m).await.unwrap();

    let row = s.get_message_by_id("D", "MSG1").await.unwrap().unwrap();
    assert_eq!(row.media_path.as_deref(), Some("statics/media/MSG1.jpg"));
    assert_eq!(row.content, "photo (edited caption)");
}

#[tokio::test]
async fn update_media_path_after_download() {
    let s = store().await;
    s.store_chat(&chat("D", "1@s.whatsapp.net", "one")).await.unwrap();
    let mut m = message("D", "1@s.whatsapp.net", "MSG1", "");
    m.media_type = "image".into();
    s.store_message(&m).await.unwrap();

    s.update_message_media_path("D", "1@s.whatsapp.net", "MSG1", "statics/media/a.jpg")
        .await
        .unwrap();
    let row = s.get_message_by_id("D", "MSG1").await.unwrap().unwrap();
    assert_eq!(row.media_path.as_deref(), Some("statics/media/a.jpg"));
}

#[tokio::test]
async fn batch_ingest_and_dedup_probe() {
    let s = store().await;
    s.store_chat(&chat("D", "1@s.whatsapp.net", "one")).await.unwrap();

    let batch: Vec<MessageRow> = (0..50)
        .map(|i| message("D", "1@s.whatsapp.net", &format!("MSG{i}"), &format!("m{i}")))
        .collect();
    s.store_messages_batch(&batch).await.unwrap();

    let (_, count) = s.get_statistics().await.unwrap();
    assert_eq!(count, 50);
    assert!(s.message_exists("D", "1@s.whatsapp.net", "MSG7").await.unwrap());
    assert!(!s.message_exists("D", "1@s.whatsapp.net", "MSG99").await.unwrap());

    // Replaying the same batch is a no-op on row count.
    s.store_messages_batch(&batch).await.unwrap();
    let (_, count) = s.get_statistics().await.unwrap();
    assert_eq!(count, 50);
}

#[tokio::test]
async fn listing_caps_at_limit_and_hard_max() {
    let s = store().await;
    s.store_chat(&chat("D", "1@s.whatsapp.net", "one")).await.unwrap();
    let batch: Vec<MessageRow> = (0..30)
        .map(|i| {
            let mut m = message("D", "1@s.whatsapp.net", &format!("MSG{i}"), "x");
            m.timestamp = 1_700_000_000 + i;
            m
        })
        .collect();
    s.store_messages_batch(&batch).await.unwrap();

    let filter = MessageFilter {
        chat_jid: "1@s.whatsapp.net".into(),
        limit: 10,
        ..Default::default()
    };
    let rows = s.get_messages("D", &filter).await.unwrap();
    assert_eq!(rows.len(), 10);
    // Newest first.
    assert_eq!(rows[0].timestamp, 1_700_000_029);

    // An absurd limit clamps to the hard cap (observable here only as
    // accepting the query; the cap itself is a constant).
    let filter = MessageFilter {
        chat_jid: "1@s.whatsapp.net".into(),
        limit: 1_000_000,
        ..Default::default()
    };
    assert!(s.get_messages("D", &filter).await.is_ok());
    assert_eq!(clamp_limit(1_000_000), MAX_PAGE_SIZE);
    assert_eq!(clamp_limit(0), DEFAULT_PAGE_SIZE);
}

#[tokio::test]
async fn message_filters() {
    let s = store().await;
    s.store_chat(&chat("D", "1@s.whatsapp.net", "one")).await.unwrap();
    let mut early = message("D", "1@s.whatsapp.net", "EARLY", "early");
    early.timestamp = 100;
    let mut late = message("D", "1@s.whatsapp.net", "LATE", "late");
    late.timestamp = 200;
    late.is_from_me = true;
    let mut media = message("D", "1@s.whatsapp.net", "MEDIA", "pic");
    media.timestamp = 150;
    media.media_type = "image".into();
    s.store_messages_batch(&[early, late, media]).await.unwrap();

    let filter = MessageFilter {
        chat_jid: "1@s.whatsapp.net".into(),
        start_time: Some(150),
        ..Default::default()
    };
    let rows = s.get_messages("D", &filter).await.unwrap();
    assert_eq!(rows.len(), 2);

    let filter = MessageFilter {
        chat_jid: "1@s.whatsapp.net".into(),
        media_only: true,
        ..Default::default()
    };
    let rows = s.get_messages("D", &filter).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "MEDIA");

    let filter = MessageFilter {
        chat_jid: "1@s.whatsapp.net".into(),
        is_from_me: Some(true),
        ..Default::default()
    };
    let rows = s.get_messages("D", &filter).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, "LATE");

    let filter = MessageFilter::default();
    assert!(s.get_messages("D", &filter).await.is_err());
}

#[tokio::test]
async fn search_is_case_insensitive_and_empty_query_is_empty() {
    let s = store().await;
    s.store_chat(&chat("D", "1@s.whatsapp.net", "one")).await.unwrap();
    s.store_message(&message("D", "1@s.whatsapp.net", "M1", "Hello World"))
        .await
        .unwrap();

    let rows = s
        .search_messages("D", "1@s.whatsapp.net", "hello", 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    let rows = s
        .search_messages("D", "1@s.whatsapp.net", "", 10)
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn chat_filters_name_and_media() {
    let s = store().await;
    s.store_chat(&chat("D", "1@s.whatsapp.net", "Alice")).await.unwrap();
    s.store_chat(&chat("D", "2@s.whatsapp.net", "Bob")).await.unwrap();
    let mut m = message("D", "2@s.whatsapp.net", "M1", "pic");
    m.media_type = "image".into();
    s.store_message(&m).await.unwrap();

    let filter = ChatFilter {
        name_contains: Some("ali".into()),
        ..Default::default()
    };
    let rows = s.get_chats("D", &filter).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].name, "Alice");

    let filter = ChatFilter {
        has_media: true,
        ..Default::default()
    };
    let rows = s.get_chats("D", &filter).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].jid, "2@s.whatsapp.net");
}

#[tokio::test]
async fn delete_chat_removes_messages_first() {
    let s = store().await;
    s.store_chat(&chat("D", "1@s.whatsapp.net", "one")).await.unwrap();
    s.store_message(&message("D", "1@s.whatsapp.net", "M1", "x")).await.unwrap();

    s.delete_chat("D", "1@s.whatsapp.net").await.unwrap();
    let (chats, messages) = s.get_statistics().await.unwrap();
    assert_eq!((chats, messages), (0, 0));
}

#[tokio::test]
async fn truncate_reports_before_and_after_counts() {
    let s = store().await;
    s.store_chat(&chat("D", "1@s.whatsapp.net", "one")).await.unwrap();
    s.store_message(&message("D", "1@s.whatsapp.net", "M1", "x")).await.unwrap();
    s.store_message(&message("D", "1@s.whatsapp.net", "M2", "y")).await.unwrap();

    let stats = s.truncate_all_chats().await.unwrap();
    assert_eq!(stats.chats_before, 1);
    assert_eq!(stats.messages_before, 2);
    assert_eq!(stats.chats_after, 0);
    assert_eq!(stats.messages_after, 0);
    assert_eq!(s.get_statistics().await.unwrap(), (0, 0));
}

#[tokio::test]
async fn lid_migration_renames_when_lid_chat_missing() {
    let s = store().await;
    let pn = "55119998@s.whatsapp.net";
    let lid = "204123456@lid";
    s.store_chat(&chat("D", pn, "55119998")).await.unwrap();
    s.store_message(&message("D", pn, "M1", "hi")).await.unwrap();

    s.migrate_chat_to_lid("D", pn, lid).await.unwrap();

    // No row in chats or messages may retain the phone-number form.
    assert!(s.get_chat("D", pn).await.unwrap().is_none());
    assert!(s.get_chat("D", lid).await.unwrap().is_some());
    let rows = s
        .get_messages(
            "D",
            &MessageFilter {
                chat_jid: lid.into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sender, lid);
    let rows = s
        .get_messages(
            "D",
            &MessageFilter {
                chat_jid: pn.into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn lid_migration_merges_when_lid_chat_exists() {
    let s = store().await;
    let pn = "55119998@s.whatsapp.net";
    let lid = "204123456@lid";
    s.store_chat(&chat("D", pn, "55119998")).await.unwrap();
    s.store_chat(&chat("D", lid, "Alice")).await.unwrap();
    s.store_message(&message("D", pn, "OLD", "from pn era")).await.unwrap();
    s.store_message(&message("D", lid, "NEW", "from lid era")).await.unwrap();

    s.migrate_chat_to_lid("D", pn, lid).await.unwrap();

    assert!(s.get_chat("D", pn).await.unwrap().is_none());
    let lid_chat = s.get_chat("D", lid).await.unwrap().unwrap();
    assert_eq!(lid_chat.name, "Alice");

    let rows = s
        .get_messages(
            "D",
            &MessageFilter {
                chat_jid: lid.into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|m| m.sender != pn));
}

#[tokio::test]
async fn lid_side_store_roundtrip() {
    let s = store().await;
    s.store_lid_mapping("D", "55119998", "204123456").await.unwrap();
    assert_eq!(
        s.lookup_lid("D", "55119998").await.unwrap().as_deref(),
        Some("204123456")
    );
    assert_eq!(
        s.lookup_pn("D", "204123456").await.unwrap().as_deref(),
        Some("55119998")
    );
    assert!(s.lookup_lid("D", "000").await.unwrap().is_none());
    // Re-learning overwrites.
    s.store_lid_mapping("D", "55119998", "204999999").await.unwrap();
    assert_eq!(
        s.lookup_lid("D", "55119998").await.unwrap().as_deref(),
        Some("204999999")
    );
}

#[tokio::test]
async fn device_rows_and_purge() {
    let s = store().await;
    let device = DeviceRow {
        device_id: "D".into(),
        jid: Some("5511@s.whatsapp.net".into()),
        display_name: Some("Main".into()),
        state: "logged_in".into(),
    };
    s.upsert_device(&device).await.unwrap();
    assert_eq!(s.list_devices().await.unwrap().len(), 1);

    s.store_chat(&chat("D", "1@s.whatsapp.net", "one")).await.unwrap();
    s.store_message(&message("D", "1@s.whatsapp.net", "M1", "x")).await.unwrap();
    s.store_lid_mapping("D", "1", "204").await.unwrap();

    s.purge_device("D").await.unwrap();
    assert!(s.get_device("D").await.unwrap().is_none());
    assert_eq!(s.get_statistics().await.unwrap(), (0, 0));
    assert!(s.lookup_lid("D", "1").await.unwrap().is_none());
}
