use std::collections::HashMap;

use opentelemetry::baggage::BaggageExt;
use opentelemetry::trace::{
    SpanContext, SpanId, SpanKind, TraceContextExt, TraceFlags, TraceId, TraceState,
};
use opentelemetry::{Context, KeyValue};

use super::error::{HandlerError, PipelineError};
use super::logging::normalize_level;
use super::propagation::{TracePropagator, W3cPropagator, start_span};
use crate::broker::BrokerError;
use crate::storage::StorageError;

fn remote_context() -> Context {
    let span_context = SpanContext::new(
        TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
        SpanId::from_hex("00f067aa0ba902b7").unwrap(),
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    );
    Context::new().with_remote_span_context(span_context)
}

#[test]
fn test_inject_writes_string_headers() {
    let propagator = W3cPropagator::new();
    let mut carrier = HashMap::new();

    propagator.inject(&remote_context(), &mut carrier);

    assert_eq!(
        carrier.get("traceparent").map(String::as_str),
        Some("00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
    );
}

#[test]
fn test_extract_restores_trace_id() {
    let propagator = W3cPropagator::new();
    let mut carrier = HashMap::new();
    propagator.inject(&remote_context(), &mut carrier);

    let cx = propagator.extract(&carrier);

    assert_eq!(
        cx.span().span_context().trace_id(),
        TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap()
    );
    assert!(cx.span().span_context().is_remote());
}

#[test]
fn test_baggage_travels_with_trace() {
    let propagator = W3cPropagator::new();
    let cx = remote_context().with_baggage(vec![KeyValue::new("tenant", "acme")]);
    let mut carrier = HashMap::new();

    propagator.inject(&cx, &mut carrier);
    assert!(carrier.contains_key("baggage"));

    let restored = propagator.extract(&carrier);
    assert_eq!(
        restored.baggage().get("tenant").map(|v| v.to_string()),
        Some("acme".to_string())
    );
}

#[test]
fn test_extract_from_empty_carrier_has_no_span() {
    let propagator = W3cPropagator::new();
    let cx = propagator.extract(&HashMap::new());
    assert!(!cx.span().span_context().is_valid());
}

#[test]
fn test_child_span_keeps_trace_id() {
    let parent = remote_context();
    let child = start_span("report.test", SpanKind::Consumer, &parent);
    assert_eq!(
        child.span().span_context().trace_id(),
        parent.span().span_context().trace_id()
    );
}

#[test]
fn test_normalize_level() {
    assert_eq!(normalize_level("WARNING"), "warn");
    assert_eq!(normalize_level("debug"), "debug");
    assert_eq!(normalize_level("nonsense"), "info");
}

#[test]
fn test_unavailable_classification() {
    let err = PipelineError::BrokerUnavailable {
        attempts: 3,
        source: BrokerError::Unavailable("refused".into()),
    };
    assert!(err.is_unavailable());
    assert!(PipelineError::Broker(BrokerError::Unavailable("down".into())).is_unavailable());
    assert!(!PipelineError::publish_unconfirmed("report", "nack").is_unavailable());
}

#[test]
fn test_storage_failure_is_handler_failure() {
    let err: HandlerError = StorageError::Request("connection reset".into()).into();
    assert!(err.is_storage_failure());
    assert!(err.to_string().contains("connection reset"));
}
