use std::fs;
use std::io::{self, Write};

use camino::Utf8Path;
use serde::Serialize;
use tracing::info;

use crate::download::{BatchReport, ImageDownload, ProgressEvent, ProgressSink, TaskStatus};
use crate::manifest::ParsedManifest;
use crate::pager::PagedResult;
use crate::results::Table;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_results(result: &PagedResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_report(report: &BatchReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_manifest(manifest: &ParsedManifest) -> io::Result<()> {
        Self::print_json(manifest)
    }

    pub fn print_image(image: &ImageDownload) -> io::Result<()> {
        Self::print_json(image)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct CsvOutput;

impl CsvOutput {
    pub fn print_table(table: &Table) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(table.to_csv().as_bytes())?;
        stdout.flush()
    }

    pub fn write_table(path: &Utf8Path, table: &Table) -> io::Result<()> {
        fs::write(path, table.to_csv())
    }
}

/// Reports task transitions through `tracing`.
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn event(&self, event: ProgressEvent) {
        match event.status {
            TaskStatus::Succeeded | TaskStatus::Failed => info!(
                series = %event.uid,
                status = ?event.status,
                elapsed = ?event.elapsed,
                "{}",
                event.message
            ),
            _ => {}
        }
    }
}
