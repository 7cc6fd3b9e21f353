//! Turns one request into one response: hooks, route table, static files,
//! error handler.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tracing::warn;

use super::{App, Routing};
use crate::context::Context;
use crate::http::{Request, Response, StatusCode};
use crate::router::{Handler, HandlerError};

/// Routes `request` and returns the response to write.
///
/// Order: pre-routing hook, route table, static files, error handler. The
/// post-routing hook then sees whatever response came out, and the logger
/// observes the final pair. A panicking hook is answered like a failing
/// handler.
pub(crate) async fn dispatch(app: &App, mut request: Request) -> Response {
    let mut res = Response::default();

    let pre_routing = match &app.hooks.pre_routing {
        Some(hook) => guard("pre-routing hook", || hook(&request, &mut res)),
        None => Ok(Routing::Unhandled),
    };

    let (request, mut res) = match pre_routing {
        Ok(Routing::Handled) => (Arc::new(request), res),
        Err(error) => {
            let res = failure(app, &request, error);
            (Arc::new(request), res)
        }
        Ok(Routing::Unhandled) => {
            if let Some(hit) = app.router.find(request.method(), request.path()) {
                request.set_captures(hit.captures);
                let request = Arc::new(request);
                let mut routed = invoke(app, &hit.handler, &request).await;
                routed.merge_missing_headers(res.headers());
                (request, routed)
            } else {
                if !app.statics.serve(&request, &mut res).await {
                    res = not_found(app, &request, res);
                }
                (Arc::new(request), res)
            }
        }
    };

    if let Some(hook) = &app.hooks.post_routing {
        if let Err(error) = guard("post-routing hook", || hook(&request, &mut res)) {
            res = failure(app, &request, error);
        }
    }
    if let Some(logger) = &app.hooks.logger {
        if let Err(error) = guard("logger", || logger(&request, &res)) {
            warn!(path = request.path(), error = %error, "logger failed");
        }
    }
    res
}

fn not_found(app: &App, request: &Request, mut res: Response) -> Response {
    res.set_status(StatusCode::NotFound);
    let Some(hook) = &app.hooks.error_handler else {
        res.set_content("Not Found", "text/plain");
        return res;
    };
    match guard("error handler", || hook(request, &mut res)) {
        Ok(()) => res,
        Err(error) => failure(app, request, error),
    }
}

/// Runs a handler, converting an `Err` or a panic into a `500` response.
async fn invoke(app: &App, handler: &Handler, request: &Arc<Request>) -> Response {
    let ctx = Context::new(Arc::clone(request));
    let outcome = AssertUnwindSafe(async { handler(ctx).await })
        .catch_unwind()
        .await;

    let error: HandlerError = match outcome {
        Ok(Ok(response)) => return response,
        Ok(Err(error)) => error,
        Err(panic) => panic_message("handler", panic).into(),
    };
    failure(app, request, error)
}

/// The `500` answer for a failed handler or hook, shaped by the exception
/// handler when one is set.
fn failure(app: &App, request: &Request, error: HandlerError) -> Response {
    warn!(
        method = %request.method(),
        path = request.path(),
        error = %error,
        "request failed"
    );

    let mut res = Response::new(StatusCode::InternalServerError);
    if let Some(hook) = &app.hooks.exception_handler {
        match guard("exception handler", || hook(request, &mut res, &error)) {
            Ok(()) => return res,
            Err(nested) => {
                warn!(path = request.path(), error = %nested, "exception handler failed");
                res = Response::new(StatusCode::InternalServerError);
            }
        }
    }
    res.set_content("Internal Server Error", "text/plain");
    res
}

/// Runs a synchronous user callback, turning a panic into an error.
fn guard<T>(what: &str, f: impl FnOnce() -> T) -> Result<T, HandlerError> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(|panic| panic_message(what, panic).into())
}

fn panic_message(what: &str, panic: Box<dyn Any + Send>) -> String {
    match panic.downcast::<String>() {
        Ok(message) => format!("{what} panicked: {message}"),
        Err(panic) => match panic.downcast_ref::<&'static str>() {
            Some(message) => format!("{what} panicked: {message}"),
            None => format!("{what} panicked"),
        },
    }
}
