#![allow(dead_code)]

use idn_adapters::SimNode;
use idn_flows::FlowDeps;
use idn_workflow::PollPolicy;
use std::sync::Arc;
use std::time::Duration;

pub fn setup() -> (Arc<SimNode>, FlowDeps) {
    let _ = tracing_subscriber::fmt::try_init();
    let node = Arc::new(SimNode::new());
    let deps = FlowDeps::in_memory(node.clone()).with_poll(
        PollPolicy::fixed(Duration::from_secs(1)).with_deadline(Duration::from_secs(60)),
    );
    (node, deps)
}

/// Tiny valid base64 image
pub fn image(seed: u8) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode([seed, seed + 1, seed + 2])
}
