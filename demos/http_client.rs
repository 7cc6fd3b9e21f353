//! Talks to the `http_server` demo over one keep-alive connection.

use tracing_subscriber::EnvFilter;
use weblink::{Client, Params};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut client = Client::from_host("127.0.0.1:8080")?;
    client
        .set_keep_alive(true)
        .set_logger(|req, res| println!("{} {} -> {}", req.method(), req.path(), res.status()));

    let res = client.get("/hi").await?;
    println!("{}", res.text());

    let res = client.get("/numbers/42").await?;
    println!("{}", res.text());

    let mut form = Params::new();
    form.insert("username", "testuser");
    form.insert("password", "secret");
    let res = client.post_form("/login", &form).await?;
    println!("{}", res.text());

    let res = client.get("/panic").await?;
    println!("{} {}", res.status(), res.text());
    Ok(())
}
