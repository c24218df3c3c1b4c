use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

use super::Session;

#[test]
fn test_session_ids_are_unique() {
    let (tx, _rx) = mpsc::unbounded_channel::<WsMessage>();
    let first = Session::new(tx.clone());
    let second = Session::new(tx);

    assert!(first.id.starts_with("session-"));
    assert_ne!(first.id, second.id);
}

#[test]
fn test_send_text_queues_frame() {
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let session = Session::new(tx);

    assert!(session.send_text("hello"));
    let frame = rx.try_recv().unwrap();
    assert_eq!(frame.to_text().unwrap(), "hello");
}

#[test]
fn test_send_after_disconnect_fails() {
    let (tx, rx) = mpsc::unbounded_channel::<WsMessage>();
    let session = Session::new(tx);
    drop(rx);

    assert!(!session.is_connected());
    assert!(!session.send_text("late"));
}
