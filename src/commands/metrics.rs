use anyhow::Result;

use crate::config::AppConfig;
use crate::ipc::{send_request, IpcRequest};
use crate::server::{now_epoch_millis, MetricSample};
use crate::ui;

use super::common::expect_ok;

pub(crate) async fn run(
    config: &AppConfig,
    name: String,
    since_mins: Option<u64>,
    last: usize,
) -> Result<()> {
    let since_ms =
        since_mins.map(|mins| now_epoch_millis().saturating_sub(mins.saturating_mul(60_000)));
    let response = send_request(&config.daemon_addr, &IpcRequest::Metrics { name, since_ms }).await?;
    let samples = expect_ok(response)?.samples;

    let Some(summary) = summarize(&samples) else {
        println!("No samples recorded.");
        return Ok(());
    };

    println!(
        "{} {} samples, cpu avg {:.1}% peak {:.1}%, memory peak {} MB",
        ui::label("Summary:"),
        summary.count,
        summary.cpu_avg,
        summary.cpu_peak,
        ui::format_megabytes(summary.memory_peak)
    );
    println!("{}", ui::table_header("TIME        CPU%    RAM(MB)"));
    let start = samples.len().saturating_sub(last);
    for sample in &samples[start..] {
        println!(
            "{:<10} {:>6.1} {:>10}",
            ui::format_clock(sample.timestamp_ms),
            sample.cpu_percent,
            ui::format_megabytes(sample.memory_bytes)
        );
    }

    Ok(())
}

#[derive(Debug, PartialEq)]
struct Summary {
    count: usize,
    cpu_avg: f32,
    cpu_peak: f32,
    memory_peak: u64,
}

fn summarize(samples: &[MetricSample]) -> Option<Summary> {
    if samples.is_empty() {
        return None;
    }
    let cpu_total: f32 = samples.iter().map(|sample| sample.cpu_percent).sum();
    Some(Summary {
        count: samples.len(),
        cpu_avg: cpu_total / samples.len() as f32,
        cpu_peak: samples
            .iter()
            .map(|sample| sample.cpu_percent)
            .fold(0.0, f32::max),
        memory_peak: samples
            .iter()
            .map(|sample| sample.memory_bytes)
            .max()
            .unwrap_or(0),
    })
}
