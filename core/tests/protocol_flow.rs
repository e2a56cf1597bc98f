#![allow(clippy::unwrap_used)]

//! Drives the coordinator through its public queue-pair interface: queries,
//! controls outside a batch, provider switching and session bookkeeping.
//! No model traffic is generated.

use magus_core::Config;
use magus_core::Magus;
use magus_core::protocol::EventMsg;
use magus_core::protocol::ExecState;
use magus_core::protocol::Op;
use magus_core::protocol::SessionOp;
use magus_core::protocol::TodoSelection;

async fn spawn_magus() -> (tempfile::TempDir, Magus) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::new(dir.path().to_path_buf());
    config.provider = Some("chatgpt".to_string());
    let magus = Magus::spawn(config).await.unwrap();

    let first = magus.next_event().await.unwrap();
    assert!(matches!(first.msg, EventMsg::SessionConfigured { .. }));
    (dir, magus)
}

#[tokio::test]
async fn policy_document_is_written_on_first_use() {
    let (dir, _magus) = spawn_magus().await;
    let policy_path = dir.path().join(".magus").join("policy.json");
    assert!(policy_path.exists());
    let raw = std::fs::read_to_string(policy_path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed["version"], "1.0");
    assert!(parsed["tools"]["command-tool"]["create"]["allowed_commands"].is_array());
}

#[tokio::test]
async fn status_query_reflects_the_configured_session() {
    let (_dir, magus) = spawn_magus().await;
    let id = magus.submit(Op::StatusQuery).await.unwrap();
    let event = magus.next_event().await.unwrap();
    assert_eq!(event.id, id);
    match event.msg {
        EventMsg::StatusReport {
            provider,
            chat_mode,
            always_approve,
            state,
            pending_todos,
            ..
        } => {
            assert_eq!(provider, "openai");
            assert!(chat_mode);
            assert!(!always_approve);
            assert_eq!(state, ExecState::Stopped);
            assert_eq!(pending_todos, 0);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn controls_outside_a_batch_are_noops_with_diagnostics() {
    let (_dir, magus) = spawn_magus().await;
    for op in [Op::Pause, Op::Resume, Op::Stop, Op::Cancel] {
        magus.submit(op).await.unwrap();
        let event = magus.next_event().await.unwrap();
        match event.msg {
            EventMsg::ControlState { state, note } => {
                assert_eq!(state, ExecState::Stopped);
                assert!(note.contains("no batch") || note.contains("not paused"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

#[tokio::test]
async fn executing_an_empty_queue_reports_nothing_to_do() {
    let (_dir, magus) = spawn_magus().await;
    magus
        .submit(Op::ExecuteTodos {
            selection: TodoSelection::All,
        })
        .await
        .unwrap();

    let mut saw_nothing = false;
    loop {
        let event = magus.next_event().await.unwrap();
        match event.msg {
            EventMsg::BackgroundEvent { message } if message.contains("nothing to execute") => {
                saw_nothing = true;
            }
            EventMsg::TaskComplete => break,
            _ => {}
        }
    }
    assert!(saw_nothing);
}

#[tokio::test]
async fn provider_switch_and_sessions_round_trip() {
    let (_dir, magus) = spawn_magus().await;

    magus
        .submit(Op::SetProvider {
            name: "gemini".to_string(),
        })
        .await
        .unwrap();
    let event = magus.next_event().await.unwrap();
    match event.msg {
        EventMsg::ProviderSwitched { provider, model } => {
            assert_eq!(provider, "gemini");
            assert!(!model.is_empty());
        }
        other => panic!("unexpected event: {other:?}"),
    }

    magus
        .submit(Op::SessionCommand {
            command: SessionOp::New,
        })
        .await
        .unwrap();
    let event = magus.next_event().await.unwrap();
    assert!(matches!(event.msg, EventMsg::SessionSwitched { .. }));

    // An empty session leaves nothing behind to list.
    magus
        .submit(Op::SessionCommand {
            command: SessionOp::List,
        })
        .await
        .unwrap();
    let event = magus.next_event().await.unwrap();
    match event.msg {
        EventMsg::Sessions { sessions } => assert!(sessions.is_empty()),
        other => panic!("unexpected event: {other:?}"),
    }

    let id = magus.submit(Op::Shutdown).await.unwrap();
    loop {
        let event = magus.next_event().await.unwrap();
        if matches!(event.msg, EventMsg::ShutdownComplete) && event.id == id {
            break;
        }
    }
}
