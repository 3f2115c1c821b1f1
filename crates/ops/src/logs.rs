//! Pod log tails, with per-container aggregation.

use std::collections::VecDeque;

use futures::StreamExt;
use kindex_core::{BoxByteStream, UpstreamError};
use tracing::warn;

/// Clamp a requested tail to the ceiling; non-positive means "the ceiling".
pub fn clamp_tail(requested: i64, ceiling: i64) -> i64 {
    if requested <= 0 {
        ceiling
    } else {
        requested.min(ceiling)
    }
}

/// Drain a byte stream into newline-terminated text, keeping at most the
/// last `max_lines` lines. A mid-stream failure stops the read and is
/// returned next to whatever arrived before it.
pub async fn collect_lines(stream: BoxByteStream, max_lines: usize, ctx: &str) -> (String, Option<UpstreamError>) {
    let mut stream = stream.fuse();
    let mut buf = bytes::BytesMut::new();
    let mut lines: VecDeque<String> = VecDeque::new();
    let push = |lines: &mut VecDeque<String>, raw: &[u8]| {
        if max_lines == 0 {
            return;
        }
        if lines.len() == max_lines {
            lines.pop_front();
        }
        lines.push_back(String::from_utf8_lossy(raw).into_owned());
    };
    let mut failure = None;
    while let Some(next) = stream.next().await {
        match next {
            Ok(chunk) => {
                buf.extend_from_slice(&chunk);
                while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let line = buf.split_to(pos);
                    let _ = buf.split_to(1); // drop '\n'
                    push(&mut lines, &line);
                }
            }
            Err(e) => {
                warn!(ctx = %ctx, error = %e, "log stream error");
                failure = Some(e);
                break;
            }
        }
    }
    if !buf.is_empty() {
        push(&mut lines, &buf);
    }
    let mut out = String::new();
    for l in lines {
        out.push_str(&l);
        out.push('\n');
    }
    (out, failure)
}

pub fn container_header(container: &str) -> String {
    format!("\n--- Logs for container {} ---\n", container)
}

pub fn container_error(container: &str, err: &dyn std::fmt::Display) -> String {
    format!("\n--- Error getting logs for container {}: {} ---\n", container, err)
}

pub fn read_error(err: &dyn std::fmt::Display) -> String {
    format!("Error reading logs: {}\n", err)
}

/// Container names from a pod's `spec.containers`, in declaration order.
pub fn container_names(pod: &serde_json::Value) -> Vec<String> {
    pod.pointer("/spec/containers")
        .and_then(|c| c.as_array())
        .map(|cs| cs.iter().filter_map(|c| c.get("name").and_then(|n| n.as_str()).map(str::to_string)).collect())
        .unwrap_or_default()
}
