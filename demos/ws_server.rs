//! WebSocket echo server.

use tracing_subscriber::EnvFilter;
use weblink::WebSocketServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut server = WebSocketServer::new();
    server
        .on_open(|conn| println!("open: {:?}", conn.peer_addr()))
        .on_message(|conn, msg| {
            let reply = if msg.is_binary {
                conn.send_binary(msg.data.clone())
            } else {
                conn.send_text(format!("Echo: {}", msg.as_text().unwrap_or_default()))
            };
            if let Err(e) = reply {
                eprintln!("send failed: {e}");
            }
        })
        .on_error(|conn, e| eprintln!("error from {:?}: {e}", conn.peer_addr()))
        .on_close(|conn| println!("closed: {:?}", conn.peer_addr()));

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop();
        }
    });

    println!("Listening on ws://127.0.0.1:9002");
    server.listen("127.0.0.1", 9002).await?;
    Ok(())
}
