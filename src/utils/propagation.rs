//! Trace-context propagation through message headers.
//!
//! Carriers are plain string maps so the broker layer never has to interpret
//! them. The default propagator writes W3C `traceparent`/`tracestate` and
//! `baggage` entries.

use std::collections::HashMap;
use std::fmt;

use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use opentelemetry::{Context, global};
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};

const TRACER_NAME: &str = "reportbus";

/// Injects and extracts causal context to and from string-keyed carriers.
pub trait TracePropagator: Send + Sync + fmt::Debug {
    fn inject(&self, cx: &Context, carrier: &mut HashMap<String, String>);

    fn extract(&self, carrier: &HashMap<String, String>) -> Context;
}

pub struct W3cPropagator {
    inner: TextMapCompositePropagator,
}

impl W3cPropagator {
    pub fn new() -> Self {
        let inner = TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]);
        Self { inner }
    }
}

impl Default for W3cPropagator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for W3cPropagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("W3cPropagator")
            .field("fields", &self.inner.fields().collect::<Vec<_>>())
            .finish()
    }
}

impl TracePropagator for W3cPropagator {
    fn inject(&self, cx: &Context, carrier: &mut HashMap<String, String>) {
        self.inner.inject_context(cx, carrier);
    }

    fn extract(&self, carrier: &HashMap<String, String>) -> Context {
        self.inner.extract(carrier)
    }
}

/// Start a span of `kind` as a child of `parent` and return the context that
/// carries it. Without an installed provider the span is a no-op that still
/// keeps the parent's span context.
pub fn start_span(name: &'static str, kind: SpanKind, parent: &Context) -> Context {
    let tracer = global::tracer(TRACER_NAME);
    let span = tracer
        .span_builder(name)
        .with_kind(kind)
        .start_with_context(&tracer, parent);
    parent.with_span(span)
}

/// Install an SDK tracer provider as the global one. Exporters are not wired;
/// spans are sampled so trace ids flow end to end through the headers.
pub fn install_tracer_provider() {
    let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
    global::set_tracer_provider(provider);
}
