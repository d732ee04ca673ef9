//! End-to-end flows between two signed-in identities sharing one backend.

use std::sync::Arc;
use std::time::Duration;

use artisan_gateway::Backend;
use artisan_messaging::{MessageDraft, MessagingConfig, MessagingContext, Messenger};
use artisan_types::gateway::Gateway;
use artisan_types::models::{ConversationId, IdentityId, Profile};

macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..200 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(held, "condition never held: {}", stringify!($cond));
    }};
}

fn config() -> MessagingConfig {
    MessagingConfig {
        enrichment_timeout: Duration::from_millis(200),
        initial_backoff: Duration::from_millis(5),
        teardown_timeout: Duration::from_millis(200),
        side_effect_timeout: Duration::from_millis(100),
        ..MessagingConfig::default()
    }
}

async fn named(backend: &Backend, name: &str) -> IdentityId {
    let id = IdentityId::new();
    backend
        .upsert_profile(Profile {
            id,
            display_name: Some(name.to_string()),
            full_name: None,
            email: Some(format!("{}@example.com", name.to_lowercase())),
            avatar_url: None,
        })
        .await
        .unwrap();
    id
}

async fn sign_in(backend: &Backend, identity: IdentityId) -> Messenger {
    let gateway: Arc<dyn Gateway> = Arc::new(backend.clone());
    Messenger::sign_in(MessagingContext::new(gateway, identity, config())).await
}

#[tokio::test]
async fn concurrent_get_or_create_yields_one_conversation() {
    let backend = Backend::in_memory().unwrap();
    let (u1, u2) = (named(&backend, "Ana").await, named(&backend, "Ben").await);
    let (ana, ben) = (sign_in(&backend, u1).await, sign_in(&backend, u2).await);

    let (from_ana, from_ben) = tokio::join!(ana.get_or_create_conversation(u2), ben.get_or_create_conversation(u1));

    let (from_ana, from_ben) = (from_ana.unwrap(), from_ben.unwrap());
    assert_eq!(from_ana, from_ben);
    assert_eq!(backend.list_conversations(u1).await.unwrap().len(), 1);
    // repeated calls stay idempotent
    assert_eq!(ana.get_or_create_conversation(u2).await.unwrap(), from_ana);

    ana.sign_out().await;
    ben.sign_out().await;
}

#[tokio::test]
async fn hello_reaches_the_recipient_unread_until_opened() {
    let backend = Backend::in_memory().unwrap();
    let (u1, u2) = (named(&backend, "Ana").await, named(&backend, "Ben").await);
    let (ana, ben) = (sign_in(&backend, u1).await, sign_in(&backend, u2).await);
    let conversation = ana.get_or_create_conversation(u2).await.unwrap();

    let receipt = ana.send_message(conversation, MessageDraft::text("Hello")).await.unwrap();

    // Ben's list watch picks the message up
    eventually!(ben.total_unread() == 1);
    let listed = ben.conversations().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, conversation);
    assert_eq!(listed[0].unread_count, 1);
    assert_eq!(listed[0].last_message_preview.as_deref(), Some("Hello"));
    assert_eq!(listed[0].last_message_at, Some(receipt.message().created_at));
    assert_eq!(listed[0].other_participant.display_label(), "Ana");

    let snapshot = ben.open_conversation(conversation).await.unwrap();
    assert_eq!(snapshot.conversation.unread_count, 0);
    assert_eq!(ben.total_unread(), 0);
    let listed = ben.conversations().await;
    assert_eq!(listed[0].unread_count, 0);
    assert_eq!(ben.total_unread(), listed.iter().map(|c| c.unread_count).sum::<u32>());

    // the sender's own count never moved
    assert_eq!(ana.total_unread(), 0);

    ana.sign_out().await;
    ben.sign_out().await;
}

#[tokio::test]
async fn notifier_alerts_recipient_but_not_sender() {
    let backend = Backend::in_memory().unwrap();
    let (u1, u2) = (named(&backend, "Ana").await, named(&backend, "Ben").await);
    let (ana, ben) = (sign_in(&backend, u1).await, sign_in(&backend, u2).await);
    let conversation = ana.get_or_create_conversation(u2).await.unwrap();

    let mut ana_alerts = ana.notifications();
    let mut ben_alerts = ben.notifications();

    ana.send_message(conversation, MessageDraft::text("Are the bowls ready?"))
        .await
        .unwrap();

    let alert = tokio::time::timeout(Duration::from_secs(1), ben_alerts.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(alert.sender_id, u1);
    assert_eq!(alert.preview, "Are the bowls ready?");
    assert!(alert.link.contains(&conversation.to_string()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ana_alerts.try_recv().is_err());

    ana.sign_out().await;
    ben.sign_out().await;
}

#[tokio::test]
async fn first_contact_alerts_without_the_recipient_looking_it_up() {
    let backend = Backend::in_memory().unwrap();
    let (u1, u2) = (named(&backend, "Ana").await, named(&backend, "Ben").await);
    let ben = sign_in(&backend, u2).await;
    let mut ben_alerts = ben.notifications();

    let ana = sign_in(&backend, u1).await;
    let conversation = ana.get_or_create_conversation(u2).await.unwrap();
    ana.send_message(conversation, MessageDraft::text("first contact"))
        .await
        .unwrap();

    let alert = tokio::time::timeout(Duration::from_millis(500), ben_alerts.recv())
        .await
        .expect("no alert for a conversation Ben never opened")
        .unwrap();
    assert_eq!(alert.conversation_id, conversation);
    assert_eq!(alert.preview, "first contact");

    // the new conversation also shows up in Ben's list
    eventually!(ben.conversations().await.iter().any(|c| c.id == conversation));

    ana.sign_out().await;
    ben.sign_out().await;
}

#[tokio::test]
async fn live_and_loaded_messages_never_duplicate() {
    let backend = Backend::in_memory().unwrap();
    let (u1, u2) = (named(&backend, "Ana").await, named(&backend, "Ben").await);
    let (ana, ben) = (sign_in(&backend, u1).await, sign_in(&backend, u2).await);
    let conversation = ana.get_or_create_conversation(u2).await.unwrap();

    ana.send_message(conversation, MessageDraft::text("first")).await.unwrap();
    ben.open_conversation(conversation).await.unwrap();
    ana.open_conversation(conversation).await.unwrap();

    for i in 0..5 {
        let (a, b) = tokio::join!(
            ana.send_message(conversation, MessageDraft::text(format!("ana {i}"))),
            ben.send_message(conversation, MessageDraft::text(format!("ben {i}"))),
        );
        a.unwrap();
        b.unwrap();
    }

    eventually!(ben.active_messages().await.map(|m| m.len()) == Some(11));
    eventually!(ana.active_messages().await.map(|m| m.len()) == Some(11));
    for side in [&ana, &ben] {
        let messages = side.active_messages().await.unwrap();
        let mut ids: Vec<String> = messages.iter().map(|m| m.id.to_string()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 11);
        assert!(messages.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert!(messages.iter().all(|m| !m.id.is_local()));
    }

    ana.sign_out().await;
    ben.sign_out().await;
}

#[tokio::test]
async fn unread_counts_stay_consistent_across_conversations() {
    let backend = Backend::in_memory().unwrap();
    let (u1, u2, u3) = (
        named(&backend, "Ana").await,
        named(&backend, "Ben").await,
        named(&backend, "Cy").await,
    );
    let ana = sign_in(&backend, u1).await;
    let ben = sign_in(&backend, u2).await;
    let cy = sign_in(&backend, u3).await;

    let with_ben = ben.get_or_create_conversation(u1).await.unwrap();
    let with_cy = cy.get_or_create_conversation(u1).await.unwrap();
    for text in ["a", "b"] {
        ben.send_message(with_ben, MessageDraft::text(text)).await.unwrap();
    }
    cy.send_message(with_cy, MessageDraft::text("c")).await.unwrap();

    eventually!(ana.total_unread() == 3);
    assert_eq!(ana.mark_read(with_ben).await.unwrap(), 2);

    let unread_of = |listed: &[artisan_types::models::Conversation], id: ConversationId| {
        listed.iter().find(|c| c.id == id).map(|c| c.unread_count)
    };
    // a list reload may still be in flight; it converges to the same numbers
    eventually!(unread_of(&ana.conversations().await, with_ben) == Some(0));
    let listed = ana.conversations().await;
    assert_eq!(unread_of(&listed, with_cy), Some(1));
    assert_eq!(ana.total_unread(), listed.iter().map(|c| c.unread_count).sum::<u32>());
    assert_eq!(ana.total_unread(), 1);

    ana.load_conversations().await.unwrap();
    assert_eq!(ana.total_unread(), 1);

    for side in [&ana, &ben, &cy] {
        side.sign_out().await;
    }
}
