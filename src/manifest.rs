//! `.tcia` manifest files.
//!
//! A manifest starts with `key=value` header lines, ends the header with
//! `ListOfSeriesToDownload=`, and then names one series UID per line:
//!
//! ```text
//! downloadServerUrl=https://nbia.cancerimagingarchive.net/nbia-download/servlet/DownloadServlet
//! includeAnnotation=true
//! noOfrRetry=4
//! databasketId=manifest-1600000000000.tcia
//! manifestVersion=3.0
//! ListOfSeriesToDownload=
//! 1.3.6.1.4.1.14519.5.2.1.7695.1700.100359209454838633826366512127
//! ```
//!
//! An entry line may carry a second token, an `http(s)` base URL that
//! overrides the API base for that series.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::domain::SeriesUid;
use crate::error::NbiaError;

const LIST_MARKER: &str = "ListOfSeriesToDownload";
const SUPPORTED_MAJOR_VERSIONS: std::ops::RangeInclusive<u32> = 1..=3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ManifestHeader {
    pub download_server_url: Option<String>,
    pub include_annotation: Option<bool>,
    pub retry_count: Option<u32>,
    pub databasket_id: Option<String>,
    pub version: Option<String>,
    /// Header keys this parser does not interpret.
    pub other: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestEntry {
    pub uid: SeriesUid,
    pub base_url: Option<String>,
    pub line: usize,
}

/// A line that could not be used; collected rather than fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MalformedEntry {
    pub line: usize,
    pub content: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedManifest {
    /// `None` for a bare list of UIDs without a header.
    pub header: Option<ManifestHeader>,
    pub entries: Vec<ManifestEntry>,
    pub diagnostics: Vec<MalformedEntry>,
}

impl ParsedManifest {
    pub fn uids(&self) -> impl Iterator<Item = &SeriesUid> {
        self.entries.iter().map(|entry| &entry.uid)
    }

    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

pub fn parse_file(path: &Path) -> Result<ParsedManifest, NbiaError> {
    let bytes = fs::read(path)
        .map_err(|err| NbiaError::Filesystem(format!("read {}: {err}", path.display())))?;
    parse(&bytes)
}

pub fn parse(bytes: &[u8]) -> Result<ParsedManifest, NbiaError> {
    let raw = String::from_utf8_lossy(bytes);
    let text = raw.strip_prefix('\u{feff}').unwrap_or(raw.as_ref());

    let mut lines = text
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .peekable();

    let has_header = lines
        .peek()
        .map(|(_, line)| line.contains('='))
        .unwrap_or(false);

    let mut manifest = ParsedManifest::default();
    if has_header {
        let mut header = ManifestHeader::default();
        while let Some((_, line)) = lines.peek().copied() {
            let Some((key, value)) = line.split_once('=') else {
                break;
            };
            lines.next();
            let (key, value) = (key.trim(), value.trim());
            if key == LIST_MARKER {
                break;
            }
            apply_header_line(&mut header, key, value)?;
        }
        manifest.header = Some(header);
    } else {
        warn!("manifest has no header; reading it as a plain list of series UIDs");
    }

    let mut seen: HashMap<SeriesUid, usize> = HashMap::new();
    for (line_number, line) in lines {
        match parse_entry(line, line_number) {
            Ok(entry) => {
                if let Some(first) = seen.get(&entry.uid) {
                    manifest.diagnostics.push(MalformedEntry {
                        line: line_number,
                        content: line.to_string(),
                        reason: format!("duplicate of line {first}"),
                    });
                    continue;
                }
                seen.insert(entry.uid.clone(), line_number);
                manifest.entries.push(entry);
            }
            Err(reason) => manifest.diagnostics.push(MalformedEntry {
                line: line_number,
                content: line.to_string(),
                reason,
            }),
        }
    }

    info!(
        entries = manifest.entries.len(),
        malformed = manifest.diagnostics.len(),
        "parsed manifest"
    );
    Ok(manifest)
}

fn apply_header_line(header: &mut ManifestHeader, key: &str, value: &str) -> Result<(), NbiaError> {
    match key {
        "downloadServerUrl" => header.download_server_url = non_empty(value),
        "includeAnnotation" => {
            header.include_annotation = match value.to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => {
                    warn!(value, "ignoring unreadable includeAnnotation");
                    None
                }
            }
        }
        "noOfrRetry" => {
            header.retry_count = value.parse().ok();
            if header.retry_count.is_none() {
                warn!(value, "ignoring unreadable noOfrRetry");
            }
        }
        "databasketId" => header.databasket_id = non_empty(value),
        "manifestVersion" => {
            check_version(value)?;
            header.version = Some(value.to_string());
        }
        _ => header.other.push((key.to_string(), value.to_string())),
    }
    Ok(())
}

fn check_version(value: &str) -> Result<(), NbiaError> {
    let major = value
        .split('.')
        .next()
        .and_then(|major| major.parse::<u32>().ok())
        .ok_or_else(|| NbiaError::UnsupportedManifest(format!("unreadable version {value}")))?;
    if !SUPPORTED_MAJOR_VERSIONS.contains(&major) {
        return Err(NbiaError::UnsupportedManifest(format!(
            "manifest version {value} is not supported"
        )));
    }
    Ok(())
}

fn parse_entry(line: &str, line_number: usize) -> Result<ManifestEntry, String> {
    let mut tokens = line.split_whitespace();
    let uid = tokens.next().unwrap_or_default();
    let uid: SeriesUid = uid
        .parse()
        .map_err(|_| format!("not a series instance UID: {uid}"))?;
    let base_url = match tokens.next() {
        Some(url) if url.starts_with("https://") || url.starts_with("http://") => {
            Some(url.to_string())
        }
        Some(other) => return Err(format!("unexpected content after UID: {other}")),
        None => None,
    };
    if let Some(extra) = tokens.next() {
        return Err(format!("unexpected content after base URL: {extra}"));
    }
    Ok(ManifestEntry {
        uid,
        base_url,
        line: line_number,
    })
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
