//! The handler trait and its accepted shapes.
//!
//! Handlers come in four shapes, selected by the closure's arguments:
//!
//! ```text
//! |res: Responder|                                     response only
//! |req: Request, res: Responder|                       request + response
//! |body: serde_json::Value, res: Responder|            parsed JSON body
//! |req: Request, body: serde_json::Value, res: Responder|
//! ```
//!
//! each returning a `Send` future. The marker type parameter `T` lets the
//! four blanket impls coexist; registration erases the shape behind
//! [`ArcHandler`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::{Request, Responder};
use crate::http::StatusCode;

pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

pub(crate) type ArcHandler = Arc<dyn Fn(Request, Responder) -> HandlerFuture + Send + Sync>;

/// A request handler. Implemented for async closures of the four accepted
/// shapes; `T` is inferred from the closure's arguments.
pub trait Handler<T>: Send + Sync + Sized + 'static {
    fn call(&self, req: Request, res: Responder) -> HandlerFuture;

    #[doc(hidden)]
    fn erased(self) -> ArcHandler {
        Arc::new(move |req, res| self.call(req, res))
    }
}

impl<F, Fut> Handler<(Responder,)> for F
where
    F: Fn(Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, _req: Request, res: Responder) -> HandlerFuture {
        Box::pin(self(res))
    }
}

impl<F, Fut> Handler<(Request, Responder)> for F
where
    F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, req: Request, res: Responder) -> HandlerFuture {
        Box::pin(self(req, res))
    }
}

impl<F, Fut> Handler<(Value, Responder)> for F
where
    F: Fn(Value, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, req: Request, res: Responder) -> HandlerFuture {
        match req.json() {
            Ok(body) => Box::pin(self(body, res)),
            Err(_) => Box::pin(async move {
                res.error(StatusCode::BadRequest, "invalid json body");
            }),
        }
    }
}

impl<F, Fut> Handler<(Request, Value, Responder)> for F
where
    F: Fn(Request, Value, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, req: Request, res: Responder) -> HandlerFuture {
        match req.json() {
            Ok(body) => Box::pin(self(req, body, res)),
            Err(_) => Box::pin(async move {
                res.error(StatusCode::BadRequest, "invalid json body");
            }),
        }
    }
}

#[cfg(test)]
pub(crate) fn noop_handler() -> ArcHandler {
    Arc::new(|_req, _res| Box::pin(async {}))
}
