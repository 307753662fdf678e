use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{Id, Subscriber};
use tracing_subscriber::{Layer, layer::Context, registry::LookupSpan};

/// Span name the linkage pipeline opens around each stage.
pub const DEFAULT_STAGE_SPAN: &str = "linkage.stage";

const UNKNOWN_STAGE: &str = "unknown";

/// Timing of one closed stage span
#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    /// Value of the span's `stage` field.
    pub stage: String,
    /// Span name.
    pub span: String,
    /// Wall time from span creation to close.
    pub elapsed: Duration,
    /// Time spent entered, i.e. actually polled.
    pub busy: Duration,
    pub attributes: HashMap<String, serde_json::Value>,
}

/// Shared storage for stage timings, in close order
#[derive(Debug, Clone, Default)]
pub struct SharedStageTimings {
    timings: Arc<RwLock<Vec<StageTiming>>>,
}

impl SharedStageTimings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, timing: StageTiming) {
        if let Ok(mut timings) = self.timings.write() {
            timings.push(timing);
        }
    }

    /// Every captured timing.
    pub fn all(&self) -> Vec<StageTiming> {
        self.timings.read().map(|t| t.clone()).unwrap_or_default()
    }

    /// Timings whose `stage` field equals `stage`.
    pub fn for_stage(&self, stage: &str) -> Vec<StageTiming> {
        self.all().into_iter().filter(|t| t.stage == stage).collect()
    }

    /// Summed wall time of every span of `stage`.
    pub fn total(&self, stage: &str) -> Duration {
        self.for_stage(stage).iter().map(|t| t.elapsed).sum()
    }

    /// Stage names in the order their spans closed, without repeats.
    pub fn stages(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for timing in self.all() {
            if !seen.contains(&timing.stage) {
                seen.push(timing.stage);
            }
        }
        seen
    }

    pub fn clear(&self) {
        if let Ok(mut timings) = self.timings.write() {
            timings.clear();
        }
    }
}

/// A tracing layer that times spans with a given name
pub struct StageTimingLayer {
    storage: Arc<SharedStageTimings>,
    span_name: &'static str,
}

impl StageTimingLayer {
    /// Time spans named [`DEFAULT_STAGE_SPAN`].
    pub fn new(storage: Arc<SharedStageTimings>) -> Self {
        Self { storage, span_name: DEFAULT_STAGE_SPAN }
    }

    /// Time spans named `span_name` instead.
    pub fn with_span_name(mut self, span_name: &'static str) -> Self {
        self.span_name = span_name;
        self
    }
}

struct StageState {
    opened: Instant,
    entered: Option<Instant>,
    busy: Duration,
    fields: HashMap<String, serde_json::Value>,
}

impl<S> Layer<S> for StageTimingLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &tracing::span::Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != self.span_name {
            return;
        }
        let Some(span) = ctx.span(id) else { return };

        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(StageState {
            opened: Instant::now(),
            entered: None,
            busy: Duration::ZERO,
            fields: visitor.0,
        });
    }

    fn on_record(&self, id: &Id, values: &tracing::span::Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        if let Some(state) = extensions.get_mut::<StageState>() {
            let mut visitor = JsonVisitor::default();
            values.record(&mut visitor);
            state.fields.extend(visitor.0);
        }
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        if let Some(state) = span.extensions_mut().get_mut::<StageState>() {
            state.entered = Some(Instant::now());
        }
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        if let Some(state) = span.extensions_mut().get_mut::<StageState>() {
            if let Some(entered) = state.entered.take() {
                state.busy += entered.elapsed();
            }
        }
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(&id) else { return };
        let Some(state) = span.extensions_mut().remove::<StageState>() else { return };

        let stage = state
            .fields
            .get("stage")
            .and_then(|v| v.as_str())
            .unwrap_or(UNKNOWN_STAGE)
            .to_string();
        self.storage.record(StageTiming {
            stage,
            span: span.metadata().name().to_string(),
            elapsed: state.opened.elapsed(),
            busy: state.busy,
            attributes: state.fields,
        });
    }
}

#[derive(Default)]
struct JsonVisitor(HashMap<String, serde_json::Value>);

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(field.name().to_string(), serde_json::Value::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.insert(field.name().to_string(), serde_json::Value::String(value.to_string()));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0.insert(field.name().to_string(), serde_json::Value::Bool(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.0.insert(field.name().to_string(), serde_json::json!(value));
    }
}
