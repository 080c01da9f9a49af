//! Middleware composition around the five extension points.
//!
//! Each extension point has a function type (`CallFn`, `HandlerFn`, ...) and
//! a wrapper type that turns one such function into a decorated one. Wrappers
//! are composed with [`chain`]: the first wrapper in the list is the
//! outermost, so it runs first on the way in and last on the way out.
//!
//! A wrapper calls `next` at most once. Not calling it short-circuits the
//! call; calling it twice is undefined.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::{Context, Incoming, Publication, Request, Response, Result, Stream};

/// Outbound unary call: `(context, address, request)`.
pub type CallFn =
    Arc<dyn Fn(Context, String, Request) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// Outbound stream: `(context, address, request)`.
pub type StreamFn = Arc<
    dyn Fn(Context, String, Request) -> BoxFuture<'static, Result<Box<dyn Stream>>> + Send + Sync,
>;

/// Outbound publish.
pub type PublishFn =
    Arc<dyn Fn(Context, Publication) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Inbound handler invocation.
pub type HandlerFn =
    Arc<dyn Fn(Context, Incoming) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// Inbound subscriber invocation.
pub type SubscriberFn =
    Arc<dyn Fn(Context, Publication) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Decorates a [`CallFn`].
pub type CallWrapper = Wrapper<CallFn>;
/// Decorates a [`StreamFn`].
pub type StreamWrapper = Wrapper<StreamFn>;
/// Decorates a [`PublishFn`].
pub type PublishWrapper = Wrapper<PublishFn>;
/// Decorates a [`HandlerFn`].
pub type HandlerWrapper = Wrapper<HandlerFn>;
/// Decorates a [`SubscriberFn`].
pub type SubscriberWrapper = Wrapper<SubscriberFn>;

/// Turns a `next` function into a decorated one of the same type.
pub type Wrapper<F> = Arc<dyn Fn(F) -> F + Send + Sync>;

/// Composes `wrappers` around `terminal`, first wrapper outermost.
pub fn chain<F>(terminal: F, wrappers: &[Wrapper<F>]) -> F {
    wrappers
        .iter()
        .rev()
        .fold(terminal, |next, wrapper| wrapper(next))
}

/// Builds a [`CallFn`] from an async closure.
pub fn call_fn<F, Fut>(f: F) -> CallFn
where
    F: Fn(Context, String, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(move |ctx, address, request| Box::pin(f(ctx, address, request)))
}

/// Builds a [`StreamFn`] from an async closure.
pub fn stream_fn<F, Fut>(f: F) -> StreamFn
where
    F: Fn(Context, String, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Box<dyn Stream>>> + Send + 'static,
{
    Arc::new(move |ctx, address, request| Box::pin(f(ctx, address, request)))
}

/// Builds a [`PublishFn`] from an async closure.
pub fn publish_fn<F, Fut>(f: F) -> PublishFn
where
    F: Fn(Context, Publication) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, publication| Box::pin(f(ctx, publication)))
}

/// Builds a [`HandlerFn`] from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(Context, Incoming) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response>> + Send + 'static,
{
    Arc::new(move |ctx, incoming| Box::pin(f(ctx, incoming)))
}

/// Builds a [`SubscriberFn`] from an async closure.
pub fn subscriber_fn<F, Fut>(f: F) -> SubscriberFn
where
    F: Fn(Context, Publication) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, publication| Box::pin(f(ctx, publication)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Log {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    fn recording(name: &'static str, log: Log) -> CallWrapper {
        Arc::new(move |next: CallFn| {
            let log = log.clone();
            call_fn(move |ctx, address, request| {
                let next = next.clone();
                let log = log.clone();
                async move {
                    log.push(format!("{name}-pre"));
                    let result = next(ctx, address, request).await;
                    log.push(format!("{name}-post"));
                    result
                }
            })
        })
    }

    #[tokio::test]
    async fn test_first_wrapper_is_outermost() {
        let log = Log::default();
        let terminal_log = log.clone();
        let terminal = call_fn(move |_, _, _| {
            let log = terminal_log.clone();
            async move {
                log.push("T");
                Ok(Response::new("pong"))
            }
        });

        let call = chain(
            terminal,
            &[recording("W1", log.clone()), recording("W2", log.clone())],
        );
        let response = call(Context::background(), "addr".to_string(), Request::default())
            .await
            .unwrap();

        assert_eq!(response.body, "pong");
        assert_eq!(
            log.entries(),
            vec!["W1-pre", "W2-pre", "T", "W2-post", "W1-post"]
        );
    }

    #[tokio::test]
    async fn test_wrapper_can_short_circuit() {
        let terminal = call_fn(|_, _, _| async { Ok(Response::new("terminal")) });
        let deny: CallWrapper = Arc::new(|_next: CallFn| {
            call_fn(|ctx: Context, _, _| async move {
                match ctx.metadata().get("authorization") {
                    Some(_) => Ok(Response::default()),
                    None => Err(Error::BadRequest("unauthorized".to_string())),
                }
            })
        });

        let call = chain(terminal, &[deny]);
        let result = call(Context::background(), "addr".to_string(), Request::default()).await;

        assert_eq!(result, Err(Error::BadRequest("unauthorized".to_string())));
    }

    #[tokio::test]
    async fn test_empty_chain_is_terminal() {
        let terminal = publish_fn(|_, publication: Publication| async move {
            assert_eq!(publication.topic, "events");
            Ok(())
        });

        let publish = chain(terminal, &[]);

        publish(Context::background(), Publication::new("events", "", ""))
            .await
            .unwrap();
    }
}
