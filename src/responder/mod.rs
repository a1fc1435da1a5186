//! Responder chain — ordered request handlers with pass-through.
//!
//! A virtual host answers requests through a [`Chain`]: an ordered list of
//! responders, each of which receives the [`Request`] and a [`Next`] cursor.
//! A responder may:
//!
//! - **Answer** — return a [`Response`] without calling `next`.
//! - **Pass through** — call `next.run(request).await`, e.g. the static file
//!   root does this when the requested file does not exist.
//! - **Decorate** — call `next`, then inspect or amend the response
//!   ([`AccessLog`] does this).
//!
//! When the chain is exhausted without an answer the request gets `404 Not Found`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::time::Instant;

use crate::http::{Request, Response, StatusCode};

/// A pinned, boxed, `Send` future, the return type of every responder.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A type-erased, reference-counted responder function.
///
/// The [`Arc`] wrapper makes handlers cheap to clone so that [`Next`] can
/// advance through the chain without copying closures.
pub type ResponderHandler = Arc<dyn Fn(Request, Next) -> BoxFuture<Response> + Send + Sync + 'static>;

/// The core trait for everything that can sit in a [`Chain`].
///
/// Implementations must be `Send + Sync` because one chain is shared by every
/// connection task, and `respond` must return a `'static` future, so state
/// needed across `.await` points is usually held behind an `Arc`.
pub trait Responder: Send + Sync {
    /// Answers `request` or forwards it to `next`.
    fn respond(&self, request: Request, next: Next) -> BoxFuture<Response>;
}

/// Converts a [`Responder`] implementation into a [`ResponderHandler`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use aerie::responder::{AccessLog, from_responder};
///
/// let handler = from_responder(Arc::new(AccessLog));
/// ```
pub fn from_responder<R>(responder: Arc<R>) -> ResponderHandler
where
    R: Responder + 'static,
{
    Arc::new(move |request: Request, next: Next| responder.respond(request, next))
}

/// Wraps a terminal async function. It always answers and never calls `next`.
///
/// # Examples
///
/// ```
/// use aerie::http::{Response, StatusCode};
/// use aerie::responder::from_fn;
///
/// let hello = from_fn(|_req| async { Response::new(StatusCode::Ok).body("Hello!") });
/// ```
pub fn from_fn<F, Fut>(handler: F) -> ResponderHandler
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |request: Request, _next: Next| -> BoxFuture<Response> {
        Box::pin(handler(request))
    })
}

/// A cursor into the remaining responders for a single request.
///
/// `Next` is consumed by [`run`](Self::run), so a responder can forward a
/// request at most once.
pub struct Next {
    responders: Arc<[ResponderHandler]>,
    // Which responder `run` invokes.
    index: usize,
}

impl Next {
    /// Creates a cursor positioned at the start of `responders`.
    pub fn new(responders: Arc<[ResponderHandler]>) -> Self {
        Self {
            responders,
            index: 0,
        }
    }

    /// Invokes the next responder, or answers `404 Not Found` when none is left.
    pub async fn run(mut self, request: Request) -> Response {
        match self.responders.get(self.index).cloned() {
            Some(handler) => {
                self.index += 1;
                handler(request, self).await
            }
            None => Response::error(StatusCode::NotFound),
        }
    }
}

/// An ordered list of responders.
///
/// # Examples
///
/// ```
/// use aerie::http::{Response, StatusCode};
/// use aerie::responder::{AccessLog, Chain, from_fn};
///
/// let chain = Chain::new()
///     .with(AccessLog)
///     .with_handler(from_fn(|_req| async { Response::new(StatusCode::NoContent) }));
/// assert_eq!(chain.len(), 2);
/// ```
#[derive(Clone)]
pub struct Chain {
    responders: Arc<[ResponderHandler]>,
}

impl Default for Chain {
    fn default() -> Self {
        Self {
            responders: Arc::new([]),
        }
    }
}

impl Chain {
    /// Creates an empty chain, which answers every request with `404`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a [`Responder`].
    #[must_use]
    pub fn with<R: Responder + 'static>(self, responder: R) -> Self {
        self.with_handler(from_responder(Arc::new(responder)))
    }

    /// Appends an already type-erased responder.
    #[must_use]
    pub fn with_handler(self, handler: ResponderHandler) -> Self {
        let mut responders = self.responders.to_vec();
        responders.push(handler);
        Self {
            responders: responders.into(),
        }
    }

    /// Number of responders in the chain.
    pub fn len(&self) -> usize {
        self.responders.len()
    }

    /// Returns `true` for an empty chain.
    pub fn is_empty(&self) -> bool {
        self.responders.is_empty()
    }

    /// Runs `request` through the chain.
    pub fn handle(&self, request: Request) -> BoxFuture<Response> {
        Box::pin(Next::new(Arc::clone(&self.responders)).run(request))
    }
}

impl<F, Fut> From<F> for Chain
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    fn from(handler: F) -> Self {
        Chain::new().with_handler(from_fn(handler))
    }
}

/// Logs each request's method, path, status and duration.
///
/// Emits one `tracing::info!` line after the downstream responders finish:
///
/// ```text
/// METHOD /path - STATUS (duration)
/// ```
pub struct AccessLog;

impl Responder for AccessLog {
    fn respond(&self, request: Request, next: Next) -> BoxFuture<Response> {
        Box::pin(async move {
            let start = Instant::now();
            let method = request.method().as_str().to_owned();
            let path = request.path().to_owned();
            let request_id = request.id();

            let response = next.run(request).await;

            let duration = start.elapsed();
            let status = response.status().as_u16();
            tracing::info!(request_id, "{} {} - {} ({:?})", method, path, status, duration);

            response
        })
    }
}
