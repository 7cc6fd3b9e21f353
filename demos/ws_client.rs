//! Sends a few messages to the `ws_server` demo and prints the replies.

use std::time::Duration;

use tracing_subscriber::EnvFilter;
use weblink::WebSocketClient;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut client = WebSocketClient::new("127.0.0.1", 9002, "/");
    client
        .on_open(|| println!("connected"))
        .on_message(|msg| println!("received: {}", msg.as_text().unwrap_or("<binary>")))
        .on_error(|e| eprintln!("error: {e}"))
        .on_close(|| println!("closed"));

    client.connect().await?;
    for text in ["Test Message", "Hello", "Goodbye"] {
        client.send_text(text)?;
    }
    client.send_binary(vec![1u8, 2, 3])?;

    tokio::time::sleep(Duration::from_millis(500)).await;
    client.close().await;
    Ok(())
}
