use super::*;

use crate::test_support::{text_message, FakeMessagingApi, ME};

fn store(api: &Arc<FakeMessagingApi>) -> (Arc<MessageStore>, broadcast::Receiver<ClientEvent>) {
    let (tx, rx) = broadcast::channel(64);
    (Arc::new(MessageStore::new(api.clone(), tx)), rx)
}

fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|message| message.id.as_str()).collect()
}

fn seed(api: &FakeMessagingApi, conversation: &str, messages: Vec<Message>) {
    api.with_state(|state| {
        state
            .messages
            .insert(ConversationId::from(conversation), messages);
    });
}

#[tokio::test]
async fn load_orders_oldest_first_and_records_viewer() {
    let api = FakeMessagingApi::new();
    seed(
        &api,
        "c-1",
        vec![
            text_message("m-3", "u-2", 30, "third"),
            text_message("m-1", ME, 10, "first"),
            text_message("m-2", "u-2", 20, "second"),
        ],
    );
    let (store, _rx) = store(&api);

    let outcome = store.load(&ConversationId::from("c-1")).await.expect("load");

    assert_eq!(outcome, LoadOutcome::Applied { count: 3 });
    let messages = store.messages().await;
    assert_eq!(ids(&messages), vec!["m-1", "m-2", "m-3"]);
    assert_eq!(store.current_user_id().await, Some(ProfileId::from(ME)));
    assert_eq!(store.load_state().await, LoadState::Ready);
    assert!(store.is_own(&messages[0]).await);
    assert!(!store.is_own(&messages[1]).await);
}

#[tokio::test]
async fn slow_load_for_previous_conversation_is_discarded() {
    let api = FakeMessagingApi::new();
    seed(&api, "c-a", vec![text_message("a-1", "u-2", 1, "from a")]);
    seed(&api, "c-b", vec![text_message("b-1", "u-3", 2, "from b")]);
    let gate = api.gate_messages("c-a");
    let (store, _rx) = store(&api);

    let slow_store = Arc::clone(&store);
    let slow = tokio::spawn(async move { slow_store.load(&ConversationId::from("c-a")).await });
    while api.read(|state| state.fetch_calls.is_empty()) {
        tokio::task::yield_now().await;
    }

    let fast = store.load(&ConversationId::from("c-b")).await.expect("load b");
    assert_eq!(fast, LoadOutcome::Applied { count: 1 });

    gate.notify_one();
    let late = slow.await.expect("join").expect("load a");

    assert_eq!(late, LoadOutcome::Superseded);
    assert_eq!(store.conversation_id().await, Some(ConversationId::from("c-b")));
    assert_eq!(ids(&store.messages().await), vec!["b-1"]);
    assert_eq!(store.load_state().await, LoadState::Ready);
}

#[tokio::test]
async fn failed_reload_keeps_messages_and_reports_failure() {
    let api = FakeMessagingApi::new();
    seed(&api, "c-1", vec![text_message("m-1", "u-2", 1, "hi")]);
    let (store, _rx) = store(&api);
    let id = ConversationId::from("c-1");
    store.load(&id).await.expect("load");

    api.with_state(|state| state.fail_messages = true);
    let err = store.load(&id).await.expect_err("fails");

    assert!(matches!(err, MessagingError::Network(_)));
    assert!(matches!(store.load_state().await, LoadState::Failed(_)));
    assert_eq!(store.len().await, 1);
}

#[tokio::test]
async fn switching_conversation_clears_before_fetch_completes() {
    let api = FakeMessagingApi::new();
    seed(&api, "c-a", vec![text_message("a-1", "u-2", 1, "from a")]);
    let (store, _rx) = store(&api);
    store.load(&ConversationId::from("c-a")).await.expect("load a");

    let gate = api.gate_messages("c-b");
    let switching = Arc::clone(&store);
    let pending =
        tokio::spawn(async move { switching.load(&ConversationId::from("c-b")).await });
    while api.read(|state| state.fetch_calls.len() < 2) {
        tokio::task::yield_now().await;
    }

    assert!(store.is_empty().await);
    assert_eq!(store.load_state().await, LoadState::Loading);

    gate.notify_one();
    pending.await.expect("join").expect("load b");
    assert_eq!(store.load_state().await, LoadState::Ready);
}

#[tokio::test]
async fn append_ignores_hidden_conversations_and_duplicates() {
    let api = FakeMessagingApi::new();
    seed(&api, "c-1", vec![text_message("m-1", "u-2", 1, "hi")]);
    let (store, mut rx) = store(&api);
    let open = ConversationId::from("c-1");
    store.load(&open).await.expect("load");
    while rx.try_recv().is_ok() {}

    assert!(
        !store
            .append(&ConversationId::from("c-2"), text_message("x-1", "u-3", 5, "elsewhere"))
            .await
    );
    assert!(!store.append(&open, text_message("m-1", "u-2", 1, "hi")).await);
    assert!(store.append(&open, text_message("m-2", ME, 2, "reply")).await);

    assert_eq!(ids(&store.messages().await), vec!["m-1", "m-2"]);
    assert!(matches!(
        rx.try_recv(),
        Ok(ClientEvent::MessageAppended { message, .. }) if message.id.as_str() == "m-2"
    ));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn status_only_moves_forward() {
    let api = FakeMessagingApi::new();
    seed(&api, "c-1", vec![text_message("m-1", ME, 1, "hi")]);
    let (store, _rx) = store(&api);
    store.load(&ConversationId::from("c-1")).await.expect("load");
    let id = MessageId::from("m-1");

    assert!(store.update_status(&id, MessageStatus::Read).await);
    assert!(!store.update_status(&id, MessageStatus::Delivered).await);
    assert!(!store.update_status(&id, MessageStatus::Read).await);
    assert!(!store
        .update_status(&MessageId::from("unknown"), MessageStatus::Read)
        .await);

    assert_eq!(store.messages().await[0].status, MessageStatus::Read);
}
