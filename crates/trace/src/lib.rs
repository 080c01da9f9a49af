//! OpenTelemetry spans around the plexus extension points.
//!
//! Every wrapper starts a span under the parent it finds in the call context,
//! writes the new span back into the context in W3C trace-context form
//! (`traceparent` and `tracestate` metadata), and marks the span failed when
//! the wrapped call returns an error. The parent is the in-process
//! [`TraceParent`] extension when present; otherwise it is rebuilt from the
//! inbound metadata.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::borrow::Cow;
use std::sync::Arc;

use opentelemetry::KeyValue;
use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use plexus_core::{
    CallFn, CallWrapper, Context, HandlerFn, HandlerWrapper, Incoming, Metadata, Publication,
    PublishFn, PublishWrapper, Request, Result, StreamFn, StreamWrapper, SubscriberFn,
    SubscriberWrapper, call_fn, handler_fn, publish_fn, stream_fn, subscriber_fn,
};
use tracing::trace;

/// Span of the enclosing invocation, kept in the context's extensions.
#[derive(Clone, Debug)]
pub struct TraceParent(pub opentelemetry::Context);

struct MetadataInjector<'a>(&'a mut Metadata);

impl Injector for MetadataInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key, value);
    }
}

struct MetadataExtractor<'a>(&'a Metadata);

impl Extractor for MetadataExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.iter().map(|(key, _)| key.as_str()).collect()
    }
}

/// Starts a span under the parent found in `ctx`.
///
/// The returned OpenTelemetry context carries the new span. `ctx` itself is
/// left untouched.
pub fn start_span_from_context<T>(
    tracer: &T,
    ctx: &Context,
    name: impl Into<Cow<'static, str>>,
    kind: SpanKind,
    attributes: Vec<KeyValue>,
) -> opentelemetry::Context
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    let parent = ctx.extensions().get::<TraceParent>().map_or_else(
        || TraceContextPropagator::new().extract(&MetadataExtractor(ctx.metadata())),
        |parent| parent.0.clone(),
    );

    let name = name.into();
    trace!("Starting {:?} span {}", kind, name);
    let builder = tracer
        .span_builder(name)
        .with_kind(kind)
        .with_attributes(attributes);
    let span = tracer.build_with_context(builder, &parent);
    parent.with_span(span)
}

// Makes `cx` the parent of everything downstream of `ctx`.
fn propagate(cx: &opentelemetry::Context, ctx: &mut Context) {
    TraceContextPropagator::new().inject_context(cx, &mut MetadataInjector(ctx.metadata_mut()));
    ctx.extensions_mut().insert(TraceParent(cx.clone()));
}

fn finish<R>(cx: &opentelemetry::Context, result: &Result<R>) {
    let span = cx.span();
    if let Err(e) = result {
        span.set_status(Status::error(e.to_string()));
        span.add_event("error", vec![KeyValue::new("error.message", e.to_string())]);
    }
    span.end();
}

fn rpc_attributes(request: &Request) -> Vec<KeyValue> {
    vec![
        KeyValue::new("rpc.system", "plexus"),
        KeyValue::new("rpc.service", request.service.clone()),
        KeyValue::new("rpc.method", request.endpoint.clone()),
    ]
}

fn messaging_attributes(publication: &Publication) -> Vec<KeyValue> {
    vec![
        KeyValue::new("messaging.system", "plexus"),
        KeyValue::new("messaging.destination.name", publication.topic.clone()),
    ]
}

/// Client span around each outbound call attempt.
pub fn call_wrapper<T>(tracer: Arc<T>) -> CallWrapper
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    Arc::new(move |next: CallFn| {
        let tracer = tracer.clone();
        call_fn(move |mut ctx: Context, address: String, request: Request| {
            let mut attributes = rpc_attributes(&request);
            attributes.push(KeyValue::new("server.address", address.clone()));
            let cx = start_span_from_context(
                &*tracer,
                &ctx,
                format!("{}.{}", request.service, request.endpoint),
                SpanKind::Client,
                attributes,
            );
            propagate(&cx, &mut ctx);

            let next = next.clone();
            async move {
                let result = next(ctx, address, request).await;
                finish(&cx, &result);
                result
            }
        })
    })
}

/// Client span around opening an outbound stream.
pub fn stream_wrapper<T>(tracer: Arc<T>) -> StreamWrapper
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    Arc::new(move |next: StreamFn| {
        let tracer = tracer.clone();
        stream_fn(move |mut ctx: Context, address: String, request: Request| {
            let mut attributes = rpc_attributes(&request);
            attributes.push(KeyValue::new("server.address", address.clone()));
            let cx = start_span_from_context(
                &*tracer,
                &ctx,
                format!("{}.{}", request.service, request.endpoint),
                SpanKind::Client,
                attributes,
            );
            propagate(&cx, &mut ctx);

            let next = next.clone();
            async move {
                let result = next(ctx, address, request).await;
                finish(&cx, &result);
                result
            }
        })
    })
}

/// Producer span around each publish.
pub fn publish_wrapper<T>(tracer: Arc<T>) -> PublishWrapper
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    Arc::new(move |next: PublishFn| {
        let tracer = tracer.clone();
        publish_fn(move |mut ctx: Context, publication: Publication| {
            let cx = start_span_from_context(
                &*tracer,
                &ctx,
                format!("Pub to {}", publication.topic),
                SpanKind::Producer,
                messaging_attributes(&publication),
            );
            propagate(&cx, &mut ctx);

            let next = next.clone();
            async move {
                let result = next(ctx, publication).await;
                finish(&cx, &result);
                result
            }
        })
    })
}

/// Server span around each inbound invocation.
pub fn handler_wrapper<T>(tracer: Arc<T>) -> HandlerWrapper
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    Arc::new(move |next: HandlerFn| {
        let tracer = tracer.clone();
        handler_fn(move |mut ctx: Context, incoming: Incoming| {
            let cx = start_span_from_context(
                &*tracer,
                &ctx,
                format!("{}.{}", incoming.request.service, incoming.request.endpoint),
                SpanKind::Server,
                rpc_attributes(&incoming.request),
            );
            propagate(&cx, &mut ctx);

            let next = next.clone();
            async move {
                let result = next(ctx, incoming).await;
                finish(&cx, &result);
                result
            }
        })
    })
}

/// Consumer span around each delivered publication.
pub fn subscriber_wrapper<T>(tracer: Arc<T>) -> SubscriberWrapper
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    Arc::new(move |next: SubscriberFn| {
        let tracer = tracer.clone();
        subscriber_fn(move |mut ctx: Context, publication: Publication| {
            let cx = start_span_from_context(
                &*tracer,
                &ctx,
                format!("Sub from {}", publication.topic),
                SpanKind::Consumer,
                messaging_attributes(&publication),
            );
            propagate(&cx, &mut ctx);

            let next = next.clone();
            async move {
                let result = next(ctx, publication).await;
                finish(&cx, &result);
                result
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::TracerProvider;
    use parking_lot::Mutex;
    use plexus_core::{Error, Response, chain};

    const REMOTE_TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const REMOTE_PARENT: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    fn provider() -> TracerProvider {
        TracerProvider::builder().build()
    }

    fn trace_id(cx: &opentelemetry::Context) -> String {
        cx.span().span_context().trace_id().to_string()
    }

    // Trace id portion of a `traceparent` value.
    fn trace_id_of(traceparent: &str) -> &str {
        traceparent.split('-').nth(1).unwrap()
    }

    fn capturing_call(seen: Arc<Mutex<Option<Context>>>) -> CallFn {
        call_fn(move |ctx: Context, _address: String, _request: Request| {
            *seen.lock() = Some(ctx);
            async { Ok(Response::default()) }
        })
    }

    fn request() -> Request {
        Request::new("greeter", "hello", "application/json", "{}")
    }

    #[tokio::test]
    async fn test_call_injects_traceparent() {
        let _ = tracing_subscriber::fmt::try_init();

        let provider = provider();
        let seen = Arc::new(Mutex::new(None));
        let call = chain(
            capturing_call(seen.clone()),
            &[call_wrapper(Arc::new(provider.tracer("test")))],
        );

        call(Context::background(), "greeter-1".to_string(), request())
            .await
            .unwrap();

        let ctx = seen.lock().take().unwrap();
        let traceparent = ctx.metadata().get("traceparent").unwrap().to_string();
        assert_eq!(traceparent.len(), 55);
        assert!(traceparent.starts_with("00-"));

        let parent = ctx.extensions().get::<TraceParent>().unwrap();
        assert_eq!(trace_id(&parent.0), trace_id_of(&traceparent));
    }

    #[tokio::test]
    async fn test_handler_continues_remote_trace() {
        let provider = provider();
        let seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let handler = chain(
            handler_fn(move |ctx: Context, _incoming: Incoming| {
                *captured.lock() = Some(ctx);
                async { Ok(Response::default()) }
            }),
            &[handler_wrapper(Arc::new(provider.tracer("test")))],
        );

        let ctx = Context::background().with_metadata("traceparent", REMOTE_PARENT);
        handler(ctx, Incoming::unary(request())).await.unwrap();

        let ctx = seen.lock().take().unwrap();
        let parent = ctx.extensions().get::<TraceParent>().unwrap();
        assert_eq!(trace_id(&parent.0), REMOTE_TRACE_ID);

        // Downstream calls hang off the server span, not the remote one.
        let traceparent = ctx.metadata().get("traceparent").unwrap();
        assert_eq!(trace_id_of(traceparent), REMOTE_TRACE_ID);
        assert_ne!(traceparent, REMOTE_PARENT);
    }

    #[tokio::test]
    async fn test_in_process_parent_wins_over_metadata() {
        let provider = provider();
        let tracer = provider.tracer("test");
        let local = start_span_from_context(
            &tracer,
            &Context::background(),
            "local",
            SpanKind::Internal,
            Vec::new(),
        );

        let mut ctx = Context::background().with_metadata("traceparent", REMOTE_PARENT);
        ctx.extensions_mut().insert(TraceParent(local.clone()));

        let seen = Arc::new(Mutex::new(None));
        let call = chain(
            capturing_call(seen.clone()),
            &[call_wrapper(Arc::new(tracer))],
        );
        call(ctx, "greeter-1".to_string(), request()).await.unwrap();

        let ctx = seen.lock().take().unwrap();
        let traceparent = ctx.metadata().get("traceparent").unwrap();
        assert_eq!(trace_id_of(traceparent), trace_id(&local));
        assert_ne!(trace_id(&local), REMOTE_TRACE_ID);
    }

    #[tokio::test]
    async fn test_errors_pass_through_unchanged() {
        let provider = provider();
        let seen = Arc::new(Mutex::new(None));
        let captured = seen.clone();
        let stream = chain(
            stream_fn(move |ctx: Context, _address: String, _request: Request| {
                *captured.lock() = Some(ctx);
                async { Err(Error::NotFound("greeter".to_string())) }
            }),
            &[stream_wrapper(Arc::new(provider.tracer("test")))],
        );

        let result = stream(Context::background(), "greeter-1".to_string(), request()).await;

        assert_eq!(result.err(), Some(Error::NotFound("greeter".to_string())));
        let ctx = seen.lock().take().unwrap();
        assert!(ctx.metadata().get("traceparent").is_some());
    }

    #[tokio::test]
    async fn test_publish_and_subscribe_share_trace() {
        let provider = provider();
        let tracer = Arc::new(provider.tracer("test"));
        let delivered = Arc::new(Mutex::new(None));

        let captured = delivered.clone();
        let subscriber = chain(
            subscriber_fn(move |ctx: Context, _publication: Publication| {
                *captured.lock() = Some(ctx);
                async { Ok(()) }
            }),
            &[subscriber_wrapper(tracer.clone())],
        );

        // Stands in for the broker: metadata travels in the publication header.
        let publish = chain(
            publish_fn(move |ctx: Context, mut publication: Publication| {
                let subscriber = subscriber.clone();
                async move {
                    publication.header.extend(ctx.metadata());
                    let mut delivery = Context::background();
                    delivery.metadata_mut().extend(&publication.header);
                    subscriber(delivery, publication).await
                }
            }),
            &[publish_wrapper(tracer)],
        );

        let root = Context::background().with_metadata("traceparent", REMOTE_PARENT);
        publish(root, Publication::new("greetings", "application/json", "\"hi\""))
            .await
            .unwrap();

        let ctx = delivered.lock().take().unwrap();
        let parent = ctx.extensions().get::<TraceParent>().unwrap();
        assert_eq!(trace_id(&parent.0), REMOTE_TRACE_ID);
    }
}
