use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static DEVICE_POLLS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("device_polls_total", "Device poll requests served").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static FRAMES_SUBMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("frames_submitted_total", "Frames submitted by backends"),
        &["instance_id"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static FRAMES_DEDUPLICATED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "frames_deduplicated_total",
            "Submissions collapsed onto an identical stored frame",
        ),
        &["instance_id"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static FRAME_DELIVERIES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "frame_deliveries_total",
            "Pending updates offered to devices, by refresh mode",
        ),
        &["mode"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static INPUTS_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("inputs_received_total", "Input events received from devices").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static INPUTS_FORWARDED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("inputs_forwarded_total", "Input events forwarded to backends").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static INPUT_FORWARD_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new(
        "input_forward_failures_total",
        "Input events that could not be delivered to a backend",
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn export_prometheus() -> String {
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    TextEncoder::new().encode(&metric_families, &mut buf).ok();
    String::from_utf8(buf).unwrap_or_default()
}
