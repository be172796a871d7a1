//! Integration tests for the session registry

mod common;

use callrec::protocol::ServerMessage;
use callrec::session::{RegistrationError, SessionRegistry};
use chrono::Utc;
use common::{connection, connection_with_capacity, drain};

#[tokio::test]
async fn test_register_indexes_by_id_and_name() {
    let registry = SessionRegistry::new();
    let (conn, _rx) = connection();

    let session = registry
        .register(conn.id(), "alice", conn.clone())
        .await
        .expect("register failed");

    assert_eq!(session.name(), "alice");
    assert_eq!(registry.len().await, 1);
    assert_eq!(
        registry.get_by_id(&conn.id()).await.map(|s| s.name().to_string()),
        Some("alice".to_string())
    );
    assert_eq!(
        registry.get_by_name("alice").await.map(|s| s.id()),
        Some(conn.id())
    );
}

#[tokio::test]
async fn test_duplicate_name_rejected() {
    let registry = SessionRegistry::new();
    let (first, _rx1) = connection();
    let (second, _rx2) = connection();

    registry.register(first.id(), "alice", first.clone()).await.unwrap();
    let err = registry
        .register(second.id(), "alice", second.clone())
        .await
        .unwrap_err();

    assert_eq!(err, RegistrationError::NameTaken("alice".to_string()));
    assert_eq!(err.to_string(), "User alice is already registered");
    assert!(registry.get_by_id(&second.id()).await.is_none());
    assert_eq!(
        registry.get_by_name("alice").await.map(|s| s.id()),
        Some(first.id())
    );
}

#[tokio::test]
async fn test_empty_name_rejected() {
    let registry = SessionRegistry::new();
    let (conn, _rx) = connection();

    let err = registry.register(conn.id(), "", conn.clone()).await.unwrap_err();

    assert_eq!(err, RegistrationError::EmptyName);
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_second_registration_on_same_connection_rejected() {
    let registry = SessionRegistry::new();
    let (conn, _rx) = connection();

    registry.register(conn.id(), "alice", conn.clone()).await.unwrap();
    let err = registry
        .register(conn.id(), "bob", conn.clone())
        .await
        .unwrap_err();

    assert_eq!(err, RegistrationError::AlreadyRegistered("alice".to_string()));
    assert!(registry.get_by_name("bob").await.is_none());
    assert_eq!(registry.len().await, 1);
}

#[tokio::test]
async fn test_unregister_is_idempotent() {
    let registry = SessionRegistry::new();
    let (conn, _rx) = connection();
    registry.register(conn.id(), "alice", conn.clone()).await.unwrap();

    assert!(registry.unregister(&conn.id()).await.is_some());
    assert!(registry.unregister(&conn.id()).await.is_none());

    assert!(registry.is_empty().await);
    assert!(registry.get_by_name("alice").await.is_none());
}

#[tokio::test]
async fn test_name_reusable_after_unregister() {
    let registry = SessionRegistry::new();
    let (first, _rx1) = connection();
    let (second, _rx2) = connection();

    registry.register(first.id(), "alice", first.clone()).await.unwrap();
    registry.unregister(&first.id()).await;
    registry
        .register(second.id(), "alice", second.clone())
        .await
        .expect("name should be free again");

    assert_eq!(registry.names().await, vec!["alice".to_string()]);
    assert_eq!(
        registry.get_by_name("alice").await.map(|s| s.id()),
        Some(second.id())
    );
}

#[tokio::test]
async fn test_unregister_unknown_id_is_ignored() {
    let registry = SessionRegistry::new();
    let (conn, _rx) = connection();

    assert!(registry.unregister(&conn.id()).await.is_none());
    assert!(registry.is_empty().await);
}

#[tokio::test]
async fn test_unregistered_session_keeps_registration_time() {
    let registry = SessionRegistry::new();
    let (conn, _rx) = connection();
    let before = Utc::now();
    registry.register(conn.id(), "alice", conn.clone()).await.unwrap();

    let session = registry.unregister(&conn.id()).await.unwrap();

    assert!(session.registered_at() >= before);
    assert!(session.registered_at() <= Utc::now());
}

#[tokio::test]
async fn test_try_send_refuses_when_queue_is_full() {
    let registry = SessionRegistry::new();
    let (conn, mut rx) = connection_with_capacity(1);
    let session = registry.register(conn.id(), "alice", conn.clone()).await.unwrap();

    session.try_send(ServerMessage::StopPlay).unwrap();
    assert!(session.try_send(ServerMessage::StopPlay).is_err());

    assert_eq!(drain(&mut rx), vec![ServerMessage::StopPlay]);
    session.try_send(ServerMessage::StopPlay).unwrap();
}
