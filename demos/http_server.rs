//! A small HTTP server showing routes, captures, hooks and static files.
//!
//! ```sh
//! RUST_LOG=debug cargo run --example http_server
//! curl http://127.0.0.1:8080/hi
//! curl http://127.0.0.1:8080/numbers/42
//! curl -d 'username=testuser&password=secret' http://127.0.0.1:8080/login
//! ```

use tracing_subscriber::EnvFilter;
use weblink::{Response, Routing, Server, StatusCode};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut server = Server::new();
    server
        .get("/hi", |_ctx| async { Ok(Response::new(StatusCode::Ok).body("Hello World!")) })
        .get(r"/numbers/(\d+)", |ctx| async move {
            let n = ctx.capture(0).unwrap_or_default().to_owned();
            Ok(Response::new(StatusCode::Ok).body(format!("Number: {n}")))
        })
        .post("/login", |ctx| async move {
            let user = ctx.param("username").unwrap_or("anonymous").to_owned();
            Ok(Response::json(&serde_json::json!({ "user": user }))?)
        })
        .get("/panic", |_ctx| async { Err("this handler always fails".into()) });

    server
        .set_pre_routing_handler(|req, res| {
            if req.path().starts_with("/admin") {
                res.set_status(StatusCode::Forbidden);
                res.set_content("Forbidden", "text/plain");
                return Routing::Handled;
            }
            Routing::Unhandled
        })
        .set_post_routing_handler(|_req, res| res.set_header("X-Powered-By", "weblink"))
        .set_logger(|req, res| println!("{} {} -> {}", req.method(), req.path(), res.status()));

    if !server.set_mount_point("/public", "./public") {
        println!("./public does not exist; static files disabled");
    }

    let handle = server.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.stop();
        }
    });

    println!("Listening on http://127.0.0.1:8080");
    server.listen("127.0.0.1", 8080).await?;
    Ok(())
}
