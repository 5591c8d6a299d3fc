// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! This module propagates the trace context through the message headers. Outgoing
//! messages carry the context of the publisher; incoming deliveries continue it in
//! a consumer span.

use crate::message::MessageProperties;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};

/// Name of the tracer used by the messaging runtime
pub(crate) const TRACER_NAME: &str = "rabbitmq-messaging";

/// Adapter exposing the trace headers of a message to the text map propagator.
pub(crate) struct TraceHeaders<'a> {
    headers: &'a mut BTreeMap<String, String>,
}

impl<'a> TraceHeaders<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, String>) -> Self {
        Self { headers }
    }
}

impl Injector for TraceHeaders<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), value);
    }
}

impl Extractor for TraceHeaders<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Writes the current trace context into the properties of an outgoing message.
pub(crate) fn inject_context(ctx: &Context, props: &mut MessageProperties) {
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(ctx, &mut TraceHeaders::new(&mut props.trace_headers))
    });
}

/// Returns the tracer of the messaging runtime.
pub(crate) fn tracer() -> BoxedTracer {
    global::tracer(TRACER_NAME)
}

/// Continues the trace of a delivery in a new consumer span named `name`.
pub(crate) fn new_span(
    props: &MessageProperties,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let mut headers = props.trace_headers.clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&TraceHeaders::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}
