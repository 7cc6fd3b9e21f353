use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use weblink::{ServerHandle, WebSocketClient, WebSocketServer};

async fn echo_server(closed: Arc<Mutex<usize>>) -> (u16, ServerHandle) {
    let mut server = WebSocketServer::new();
    server
        .on_message(|conn, msg| {
            if msg.is_binary {
                let _ = conn.send_binary(msg.data.clone());
            } else {
                let _ = conn.send_text(format!("Echo: {}", msg.as_text().unwrap_or_default()));
            }
        })
        .on_close(move |_| *closed.lock().unwrap() += 1);
    let bound = server.bind("127.0.0.1", 0).await.unwrap();
    let port = bound.local_addr().port();
    let handle = bound.handle();
    tokio::spawn(bound.run());
    (port, handle)
}

#[tokio::test]
async fn echo_is_delivered_exactly_once() {
    let server_closed = Arc::new(Mutex::new(0));
    let (port, handle) = echo_server(Arc::clone(&server_closed)).await;

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();

    let mut client = WebSocketClient::new("127.0.0.1", port, "/");
    client.on_message(move |msg| {
        sink.lock().unwrap().push(msg.as_text().unwrap_or_default().to_owned());
        let _ = tx.send(());
    });
    client.connect().await.unwrap();
    client.send_text("Test Message").unwrap();

    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    client.close().await;

    assert_eq!(*received.lock().unwrap(), vec!["Echo: Test Message"]);

    // The server session observes the close too.
    tokio::time::timeout(Duration::from_secs(5), async {
        while *server_closed.lock().unwrap() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    handle.stop();
}

#[tokio::test]
async fn messages_arrive_in_order_and_none_after_close() {
    let (port, handle) = echo_server(Arc::new(Mutex::new(0))).await;

    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    let (on_msg, on_close) = (Arc::clone(&events), Arc::clone(&events));
    let (tx, mut rx) = mpsc::unbounded_channel::<()>();

    let mut client = WebSocketClient::new("127.0.0.1", port, "/");
    client
        .on_message(move |msg| {
            let text = match msg.as_text() {
                Some(text) if !msg.is_binary => text.to_owned(),
                _ => format!("binary:{}", msg.data.len()),
            };
            on_msg.lock().unwrap().push(text);
            let _ = tx.send(());
        })
        .on_close(move || on_close.lock().unwrap().push("close".to_owned()));

    client.connect().await.unwrap();
    for text in ["one", "two", "three"] {
        client.send_text(text).unwrap();
    }
    client.send_binary(vec![1u8, 2, 3, 4]).unwrap();

    for _ in 0..4 {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
    }
    client.close().await;

    assert_eq!(
        *events.lock().unwrap(),
        vec!["Echo: one", "Echo: two", "Echo: three", "binary:4", "close"]
    );
    assert!(!client.is_connected());
    handle.stop();
}

#[tokio::test]
async fn server_stop_refuses_new_sessions() {
    let (port, handle) = echo_server(Arc::new(Mutex::new(0))).await;
    let mut first = WebSocketClient::new("127.0.0.1", port, "/");
    first.connect().await.unwrap();
    assert!(handle.is_running());

    handle.stop();
    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.is_running() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // The established session is untouched.
    assert!(first.is_connected());
    first.close().await;

    let errors = Arc::new(Mutex::new(0));
    let count = Arc::clone(&errors);
    let mut late = WebSocketClient::new("127.0.0.1", port, "/");
    late.set_connect_timeout(Duration::from_secs(1))
        .on_error(move |_| *count.lock().unwrap() += 1);
    assert!(late.connect().await.is_err());
    assert_eq!(*errors.lock().unwrap(), 1);
}
