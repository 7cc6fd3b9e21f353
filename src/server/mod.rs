//! Async HTTP/1.1 server.
//!
//! Register routes and hooks on a [`Server`], then [`listen`](Server::listen)
//! (or [`bind`](Server::bind) and [`run`](BoundServer::run) to learn the
//! port first). Each accepted connection is served by its own task; the
//! route table and hooks are shared read-only between them.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::error;

use crate::codec::http::{WriteOptions, write_response};
use crate::config::{Admission, ServerConfig};
use crate::context::Context;
use crate::http::{Method, Request, Response, StatusCode};
use crate::listener::{Listener, ServerError, ServerHandle, Service};
use crate::router::{HandlerError, HandlerResult, RouteError, Router};

mod connection;
mod dispatch;
mod static_files;

use static_files::StaticFiles;

/// Outcome of the pre-routing hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// The hook produced the response; skip routing.
    Handled,
    /// Carry on with the route table. Headers the hook set are kept.
    Unhandled,
}

pub type PreRoutingHandler = Arc<dyn Fn(&Request, &mut Response) -> Routing + Send + Sync>;
pub type PostRoutingHandler = Arc<dyn Fn(&Request, &mut Response) + Send + Sync>;
/// Called when nothing produced a response; the status is already `404`.
pub type ErrorHandler = Arc<dyn Fn(&Request, &mut Response) + Send + Sync>;
/// Called when a handler fails; the status is already `500`.
pub type ExceptionHandler = Arc<dyn Fn(&Request, &mut Response, &HandlerError) + Send + Sync>;
pub type Logger = Arc<dyn Fn(&Request, &Response) + Send + Sync>;

#[derive(Default)]
pub(crate) struct Hooks {
    pub(crate) pre_routing: Option<PreRoutingHandler>,
    pub(crate) post_routing: Option<PostRoutingHandler>,
    pub(crate) error_handler: Option<ErrorHandler>,
    pub(crate) exception_handler: Option<ExceptionHandler>,
    pub(crate) logger: Option<Logger>,
}

/// Everything a connection task needs, frozen once the server starts.
pub(crate) struct App {
    pub(crate) router: Router,
    pub(crate) hooks: Hooks,
    pub(crate) statics: StaticFiles,
    pub(crate) config: ServerConfig,
}

/// The weblink HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use weblink::http::{Response, StatusCode};
/// use weblink::server::Server;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut server = Server::new();
///     server
///         .get("/hi", |_ctx| async { Ok(Response::new(StatusCode::Ok).body("Hello!")) })
///         .get(r"/numbers/(\d+)", |ctx| async move {
///             let n = ctx.capture(0).unwrap_or_default().to_owned();
///             Ok(Response::new(StatusCode::Ok).body(n))
///         });
///     server.listen("127.0.0.1", 8080).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    router: Router,
    route_error: Option<RouteError>,
    hooks: Hooks,
    statics: StaticFiles,
    config: ServerConfig,
    handle: ServerHandle,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Creates a server with the default configuration.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    /// Creates a server using `config` for timeouts, limits and admission.
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            router: Router::new(),
            route_error: None,
            hooks: Hooks::default(),
            statics: StaticFiles::default(),
            config,
            handle: ServerHandle::new(),
        }
    }

    /// Registers `handler` for `method` requests whose whole path matches `pattern`.
    ///
    /// An invalid pattern is logged and remembered; [`bind`](Self::bind)
    /// then fails with [`ServerError::Route`].
    pub fn route<H, F>(&mut self, method: Method, pattern: &str, handler: H) -> &mut Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        if let Err(e) = self.router.add(method, pattern, handler) {
            error!(pattern, error = %e, "route rejected");
            self.route_error.get_or_insert(e);
        }
        self
    }

    /// Register a handler for `GET` requests; `HEAD` requests use it too.
    pub fn get<H, F>(&mut self, pattern: &str, handler: H) -> &mut Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Get, pattern, handler)
    }

    /// Register a handler for `POST` requests.
    pub fn post<H, F>(&mut self, pattern: &str, handler: H) -> &mut Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Post, pattern, handler)
    }

    /// Register a handler for `PUT` requests.
    pub fn put<H, F>(&mut self, pattern: &str, handler: H) -> &mut Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Put, pattern, handler)
    }

    /// Register a handler for `PATCH` requests.
    pub fn patch<H, F>(&mut self, pattern: &str, handler: H) -> &mut Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Patch, pattern, handler)
    }

    /// Register a handler for `DELETE` requests.
    pub fn delete<H, F>(&mut self, pattern: &str, handler: H) -> &mut Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Delete, pattern, handler)
    }

    /// Register a handler for `OPTIONS` requests.
    pub fn options<H, F>(&mut self, pattern: &str, handler: H) -> &mut Self
    where
        H: Fn(Context) -> F + Send + Sync + 'static,
        F: Future<Output = HandlerResult> + Send + 'static,
    {
        self.route(Method::Options, pattern, handler)
    }

    /// Runs before routing. Returning [`Routing::Handled`] sends the
    /// response the hook built and skips the route table.
    pub fn set_pre_routing_handler<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&Request, &mut Response) -> Routing + Send + Sync + 'static,
    {
        self.hooks.pre_routing = Some(Arc::new(hook));
        self
    }

    /// Runs after a response exists, whatever produced it.
    pub fn set_post_routing_handler<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&Request, &mut Response) + Send + Sync + 'static,
    {
        self.hooks.post_routing = Some(Arc::new(hook));
        self
    }

    /// Shapes the `404` answer when no route or file matched.
    pub fn set_error_handler<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&Request, &mut Response) + Send + Sync + 'static,
    {
        self.hooks.error_handler = Some(Arc::new(hook));
        self
    }

    /// Shapes the `500` answer when a handler or hook fails.
    pub fn set_exception_handler<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&Request, &mut Response, &HandlerError) + Send + Sync + 'static,
    {
        self.hooks.exception_handler = Some(Arc::new(hook));
        self
    }

    /// Observes every request/response pair once routing is done.
    pub fn set_logger<F>(&mut self, logger: F) -> &mut Self
    where
        F: Fn(&Request, &Response) + Send + Sync + 'static,
    {
        self.hooks.logger = Some(Arc::new(logger));
        self
    }

    /// Serves files under `dir` for unrouted `GET`/`HEAD` requests.
    ///
    /// Returns `false` (and changes nothing) if `dir` is not a directory.
    pub fn set_base_dir(&mut self, dir: impl Into<PathBuf>) -> bool {
        self.statics.set_base_dir(dir.into())
    }

    /// Serves files under `dir` for paths below `mount`. Checked before the base directory.
    pub fn set_mount_point(&mut self, mount: &str, dir: impl Into<PathBuf>) -> bool {
        self.statics.add_mount(mount, dir.into())
    }

    /// Most requests served on one connection before it is closed.
    pub fn set_keep_alive_max_count(&mut self, count: usize) -> &mut Self {
        self.config.keep_alive_max_count = count;
        self
    }

    /// How long an idle keep-alive connection waits for its next request.
    pub fn set_keep_alive_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.keep_alive_timeout_ms = millis(timeout);
        self
    }

    /// How long a read may stall while a request is arriving.
    pub fn set_read_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.read_timeout_ms = millis(timeout);
        self
    }

    /// Bounds writing one response.
    pub fn set_write_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.config.write_timeout_ms = millis(timeout);
        self
    }

    /// Largest request body accepted; bigger ones get `413`.
    pub fn set_payload_max_length(&mut self, length: usize) -> &mut Self {
        self.config.payload_max_length = length;
        self
    }

    /// Caps live connections; `admission` decides what happens to the rest.
    pub fn set_max_connections(&mut self, max: usize, admission: Admission) -> &mut Self {
        self.config.max_connections = max;
        self.config.admission = admission;
        self
    }

    /// The configuration the server will run with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// A handle that can stop this server once it is listening.
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Stops accepting connections. Open connections finish on their own.
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Whether the accept loop is running.
    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Binds `host:port` without accepting yet.
    ///
    /// # Errors
    ///
    /// [`ServerError::Route`] if a route pattern was invalid, and
    /// [`ServerError::Bind`] if the address cannot be bound.
    pub async fn bind(self, host: &str, port: u16) -> Result<BoundServer, ServerError> {
        let handle = self.handle.clone();
        let app = self.into_app()?;
        let max_connections = app.config.max_connections;
        let admission = app.config.admission;
        let service = HttpService { app: Arc::new(app) };
        let listener = Listener::bind(host, port, service, max_connections, admission, handle).await?;
        Ok(BoundServer { listener })
    }

    /// Binds and serves until [`ServerHandle::stop`] is called.
    pub async fn listen(self, host: &str, port: u16) -> Result<(), ServerError> {
        self.bind(host, port).await?.run().await
    }

    pub(crate) fn into_app(self) -> Result<App, ServerError> {
        if let Some(e) = self.route_error {
            return Err(e.into());
        }
        Ok(App {
            router: self.router,
            hooks: self.hooks,
            statics: self.statics,
            config: self.config,
        })
    }
}

/// A [`Server`] whose socket is bound but not yet accepting.
pub struct BoundServer {
    listener: Listener<HttpService>,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        self.listener.handle().clone()
    }

    /// Accepts connections until stopped.
    pub async fn run(self) -> Result<(), ServerError> {
        self.listener.run().await
    }
}

pub(crate) struct HttpService {
    app: Arc<App>,
}

impl Service for HttpService {
    async fn serve(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let local = stream.local_addr().ok();
        let _ = stream.set_nodelay(true);
        connection::serve_connection(stream, Some(peer), local, Arc::clone(&self.app)).await;
    }

    async fn reject(self: Arc<Self>, mut stream: TcpStream, _peer: SocketAddr) {
        let mut res = Response::new(StatusCode::ServiceUnavailable).body("Service Unavailable");
        let opts = WriteOptions {
            version: 1,
            keep_alive: false,
            head_only: false,
        };
        let _ = write_response(&mut stream, &mut res, opts).await;
        let _ = stream.shutdown().await;
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
