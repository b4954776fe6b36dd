//! kindling is an async HTTP/1.1 server and client with first-class
//! WebSocket and Server-Sent Events support, streaming request/response
//! bodies with TCP backpressure, TLS, and a path-parameter router.
//!
//! # High-level features
//!
//! - Persistent keep-alive connections with graceful shutdown.
//! - A router compiling `/users/:id([0-9]+)`-style patterns once at
//!   registration, with exact-match fast paths, greedy wildcards, CORS
//!   and basic-auth guards.
//! - Deferred request bodies: handlers may run before the body is read
//!   and pull it incrementally, so uploads stream under natural TCP
//!   backpressure.
//! - WebSocket upgrades (server and client), RFC 6455 framing with
//!   masking, fragmentation and close-handshake handling.
//! - SSE channels with clonable writers for broadcast patterns.
//! - gzip/deflate negotiation on both sides.
//! - A blocking client over a private event loop and an async client
//!   registered with a shared pool of single-threaded loops.
//!
//! # Example
//!
//! ```no_run
//! use kindling::server::{Responder, Request, Server};
//!
//! let mut server = Server::new();
//! server.get("/hello/:name", |req: Request, res: Responder| async move {
//!     let name = req.param("name").unwrap_or("world").to_string();
//!     res.send(format!("Hello, {name}!"));
//! });
//! server.listen("0.0.0.0", 8080).unwrap();
//! server.wait();
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod compression;
pub mod http;
pub mod net;
pub mod runtime;
pub mod server;
pub mod ws;

mod error;

pub use error::{Error, Result};

#[doc(inline)]
pub use client::{AsyncClient, Client};
#[doc(inline)]
pub use server::Server;
