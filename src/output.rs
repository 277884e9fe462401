use std::io::{self, Write};

use serde::Serialize;
use tracing::info;

use crate::app::{PipelineResult, ProgressEvent, ProgressSink};
use crate::manifest::DatasetManifest;
use crate::verify::IntegrityReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_result(result: &PipelineResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_integrity(report: &IntegrityReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_manifest(manifest: &DatasetManifest) -> io::Result<()> {
        Self::print_json(manifest)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Forwards progress events to the log on stderr.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => info!("{}", event.message),
        }
    }
}
