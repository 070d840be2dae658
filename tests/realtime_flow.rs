//! End-to-end wiring tests: a full client against the scripted connector.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use halo::{
    CharacterId, ClientFrame, ConversationEvent, ConversationId, MessageId, MockConnector,
    MockLink, PanelEvent, PanelId, RealtimeClient, RealtimeConfig, ServerFrame, StaticCredentials,
};

fn test_config() -> RealtimeConfig {
    let dir = std::env::temp_dir().join(format!("halo-it-{}", uuid::Uuid::now_v7()));
    RealtimeConfig {
        queue_path: dir.join("queue.json"),
        ..Default::default()
    }
}

async fn started_client() -> (
    RealtimeClient,
    MockLink,
    tokio::sync::mpsc::UnboundedReceiver<MockLink>,
) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .try_init();
    let (connector, mut links) = MockConnector::new();
    let client = RealtimeClient::new(
        connector,
        Arc::new(StaticCredentials::new("tok-it")),
        test_config(),
    );
    client.start().await.unwrap();
    let link = links.recv().await.unwrap();
    (client, link, links)
}

/// Read outbound frames until one matches, panicking if the link closes.
async fn expect_frame(
    link: &mut MockLink,
    matches: impl Fn(&ClientFrame) -> bool,
) -> ClientFrame {
    loop {
        let frame = link
            .to_server
            .recv()
            .await
            .expect("link closed while waiting for frame");
        if matches(&frame) {
            return frame;
        }
    }
}

#[tokio::test]
async fn conversation_streams_end_to_end() {
    let (client, mut link, _links) = started_client().await;
    let character = CharacterId::from_raw("char_tutor");

    // creation handshake
    let conversations = Arc::clone(client.conversations());
    let create = {
        let character = character.clone();
        tokio::spawn(async move {
            conversations
                .create_conversation(&character, "course_chat", json!({"course": 12}))
                .await
        })
    };
    expect_frame(&mut link, |f| {
        matches!(f, ClientFrame::StartConversation { .. })
    })
    .await;
    link.from_server
        .send(ServerFrame::ConversationCreated {
            conversation_id: ConversationId::from_raw("conv_9"),
        })
        .await
        .unwrap();
    let conv = create.await.unwrap().unwrap();
    assert_eq!(conv.as_str(), "conv_9");

    let mut events = client.conversations().subscribe(&conv);
    client
        .conversations()
        .send_message(&conv, &character, "explain recursion")
        .await
        .unwrap();
    let sent = expect_frame(&mut link, |f| matches!(f, ClientFrame::SendMessage { .. })).await;
    match &sent {
        ClientFrame::SendMessage { text, .. } => assert_eq!(text, "explain recursion"),
        other => panic!("unexpected frame {other:?}"),
    }

    let msg = MessageId::from_raw("msg_1");
    link.from_server
        .send(ServerFrame::ProcessingStarted {
            conversation_id: conv.clone(),
            message_id: msg.clone(),
            tracking_id: None,
        })
        .await
        .unwrap();
    link.from_server
        .send(ServerFrame::StreamingStarted {
            conversation_id: conv.clone(),
            message_id: msg.clone(),
            tracking_id: None,
        })
        .await
        .unwrap();
    for (i, piece) in ["A", "B", "C"].iter().enumerate() {
        link.from_server
            .send(ServerFrame::ResponseChunk {
                conversation_id: conv.clone(),
                message_id: msg.clone(),
                chunk: piece.to_string(),
                chunk_index: i as u32,
                tool_name: None,
                tracking_id: None,
            })
            .await
            .unwrap();
    }
    link.from_server
        .send(ServerFrame::StreamingComplete {
            conversation_id: conv.clone(),
            message_id: msg,
            full_response: "ABC".into(),
            tokens: 3,
            cost_cents: 0.2,
            duration_ms: 450,
            structured_analysis: None,
            tracking_id: None,
        })
        .await
        .unwrap();

    assert!(matches!(
        events.recv().await.unwrap(),
        ConversationEvent::ProcessingStarted { .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        ConversationEvent::StreamingStarted { .. }
    ));
    for expected in ["A", "AB", "ABC"] {
        match events.recv().await.unwrap() {
            ConversationEvent::Chunk { text, .. } => assert_eq!(text, expected),
            other => panic!("expected chunk, got {other:?}"),
        }
    }
    match events.recv().await.unwrap() {
        ConversationEvent::Completed { text, usage, .. } => {
            assert_eq!(text, "ABC");
            assert_eq!(usage.tokens, 3);
        }
        other => panic!("expected completion, got {other:?}"),
    }

    client.shutdown();
}

#[tokio::test]
async fn queued_message_flushes_through_a_panel() {
    let (client, mut link, _links) = started_client().await;
    let panel = PanelId::from_raw("panel_main");

    let panels = Arc::clone(client.panels());
    let join = {
        let panel = panel.clone();
        tokio::spawn(async move {
            panels
                .create_panel(&panel, Some(ConversationId::from_raw("conv_1")))
                .await
        })
    };
    expect_frame(&mut link, |f| matches!(f, ClientFrame::JoinPanel { .. })).await;
    link.from_server
        .send(ServerFrame::PanelJoined {
            panel_id: panel.clone(),
        })
        .await
        .unwrap();
    join.await.unwrap().unwrap();

    let mut panel_events = client.panels().subscribe(&panel);

    client.queue().enqueue(
        &panel,
        "queued while offline",
        json!({"character_id": "char_tutor"}),
    );
    assert_eq!(client.queue().len(), 1);

    client.queue().process_tick().await;
    assert!(client.queue().is_empty());

    let sent = expect_frame(&mut link, |f| matches!(f, ClientFrame::SendMessage { .. })).await;
    let tracking_id = match &sent {
        ClientFrame::SendMessage {
            text, tracking_id, ..
        } => {
            assert_eq!(text, "queued while offline");
            tracking_id.clone()
        }
        other => panic!("unexpected frame {other:?}"),
    };

    // the response routes back to the panel by tracking echo
    link.from_server
        .send(ServerFrame::StreamingStarted {
            conversation_id: ConversationId::from_raw("conv_1"),
            message_id: MessageId::from_raw("msg_1"),
            tracking_id: Some(tracking_id),
        })
        .await
        .unwrap();
    assert!(matches!(
        panel_events.recv().await.unwrap(),
        PanelEvent::Stream(ConversationEvent::StreamingStarted { .. })
    ));

    client.shutdown();
}

#[tokio::test(start_paused = true)]
async fn link_loss_heals_without_caller_involvement() {
    let (client, link, mut links) = started_client().await;
    drop(link);

    let _replacement = links.recv().await.unwrap();
    // give the status watch a beat to settle
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(client.connection().is_connected());
    assert_eq!(client.health().get_health().reconnect_count, 1);

    client.shutdown();
}
