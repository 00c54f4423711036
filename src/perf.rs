//! Coarse timing and counters for end-of-run summaries.
//!
//! Always enabled; a span costs two `Instant` reads and two relaxed atomic adds.
//! The CLI prints [`report`] when `--verbose` is given.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Duration,
    Counter,
}

/// Named metrics tracked by the perf collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    RuntimeFromCheckpoint,
    CheckpointLoad,
    FrontendEncode,
    EncoderForward,
    DecoderTotal,
    DecoderStep,
    AttentionStep,
    ConverterForward,
    VocoderTotal,
    GriffinLimIteration,
    AlignmentPlot,
    Utterances,
    FailedUtterances,
    DecoderSteps,
    WaveformSamples,
}

impl Metric {
    const ALL: [Metric; 15] = [
        Metric::RuntimeFromCheckpoint,
        Metric::CheckpointLoad,
        Metric::FrontendEncode,
        Metric::EncoderForward,
        Metric::DecoderTotal,
        Metric::DecoderStep,
        Metric::AttentionStep,
        Metric::ConverterForward,
        Metric::VocoderTotal,
        Metric::GriffinLimIteration,
        Metric::AlignmentPlot,
        Metric::Utterances,
        Metric::FailedUtterances,
        Metric::DecoderSteps,
        Metric::WaveformSamples,
    ];

    fn name(self) -> &'static str {
        match self {
            Metric::RuntimeFromCheckpoint => "runtime.from_checkpoint",
            Metric::CheckpointLoad => "checkpoint.load",
            Metric::FrontendEncode => "frontend.encode",
            Metric::EncoderForward => "encoder.forward",
            Metric::DecoderTotal => "decoder.total",
            Metric::DecoderStep => "decoder.step",
            Metric::AttentionStep => "attention.step",
            Metric::ConverterForward => "converter.forward",
            Metric::VocoderTotal => "vocoder.total",
            Metric::GriffinLimIteration => "griffin_lim.iteration",
            Metric::AlignmentPlot => "plot.alignment",
            Metric::Utterances => "synthesis.utterances",
            Metric::FailedUtterances => "synthesis.failed_utterances",
            Metric::DecoderSteps => "decoder.steps",
            Metric::WaveformSamples => "vocoder.samples",
        }
    }

    fn kind(self) -> Kind {
        match self {
            Metric::Utterances
            | Metric::FailedUtterances
            | Metric::DecoderSteps
            | Metric::WaveformSamples => Kind::Counter,
            _ => Kind::Duration,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Default)]
struct Slot {
    micros: AtomicU64,
    count: AtomicU64,
}

struct Collector {
    start: Instant,
    slots: [Slot; Metric::ALL.len()],
}

static COLLECTOR: OnceLock<Collector> = OnceLock::new();

fn collector() -> &'static Collector {
    COLLECTOR.get_or_init(|| Collector {
        start: Instant::now(),
        slots: std::array::from_fn(|_| Slot::default()),
    })
}

/// A RAII timer that records its duration when dropped.
pub struct PerfSpan {
    metric: Metric,
    start: Instant,
}

impl Drop for PerfSpan {
    fn drop(&mut self) {
        let micros = u64::try_from(self.start.elapsed().as_micros()).unwrap_or(u64::MAX);
        let slot = &collector().slots[self.metric.index()];
        slot.micros.fetch_add(micros, Ordering::Relaxed);
        slot.count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Begin a named timing span.
pub fn span(metric: Metric) -> PerfSpan {
    PerfSpan {
        metric,
        start: Instant::now(),
    }
}

/// Record a counter delta for a named metric.
pub fn add_count(metric: Metric, delta: u64) {
    collector().slots[metric.index()]
        .count
        .fetch_add(delta, Ordering::Relaxed);
}

/// Current count recorded for a metric.
pub fn count(metric: Metric) -> u64 {
    collector().slots[metric.index()].count.load(Ordering::Relaxed)
}

/// Format a report of all collected metrics, longest durations first.
pub fn report() -> String {
    let collector = collector();
    let mut durations = Vec::new();
    let mut counters = Vec::new();
    for metric in Metric::ALL {
        let slot = &collector.slots[metric.index()];
        let micros = slot.micros.load(Ordering::Relaxed);
        let count = slot.count.load(Ordering::Relaxed);
        if count == 0 {
            continue;
        }
        match metric.kind() {
            Kind::Duration => durations.push((metric, micros, count)),
            Kind::Counter => counters.push((metric, count)),
        }
    }
    durations.sort_by(|a, b| b.1.cmp(&a.1));

    let mut out = String::new();
    let _ = writeln!(
        out,
        "Performance summary (uptime: {:.3}s)",
        collector.start.elapsed().as_secs_f64()
    );
    if durations.is_empty() && counters.is_empty() {
        let _ = writeln!(out, "No performance data recorded.");
        return out;
    }
    if !durations.is_empty() {
        let _ = writeln!(
            out,
            "  {:<28} {:>10} {:>8} {:>10}",
            "name", "total", "count", "avg"
        );
        for (metric, micros, count) in durations {
            let _ = writeln!(
                out,
                "  {:<28} {:>9.3}s {:>8} {:>8.3}ms",
                metric.name(),
                micros as f64 / 1e6,
                count,
                micros as f64 / count as f64 / 1e3
            );
        }
    }
    for (metric, count) in counters {
        let _ = writeln!(out, "  {:<28} {}", metric.name(), count);
    }
    out
}
