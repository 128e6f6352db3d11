use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::NbiaError;

static DICOM_UID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(0|[1-9][0-9]*)(\.(0|[1-9][0-9]*))+$").unwrap());

/// DICOM UIDs are dot-separated numeric components, at most 64 characters.
pub fn is_dicom_uid(value: &str) -> bool {
    value.len() <= 64 && DICOM_UID.is_match(value)
}

/// Series Instance UID, the identifier of one downloadable package.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SeriesUid(String);

impl SeriesUid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SeriesUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SeriesUid {
    type Err = NbiaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_dicom_uid(normalized) {
            return Err(NbiaError::InvalidSeriesUid(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for SeriesUid {
    type Error = NbiaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SeriesUid> for String {
    fn from(value: SeriesUid) -> Self {
        value.0
    }
}

/// SOP Instance UID, the identifier of one image within a series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InstanceUid(String);

impl InstanceUid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for InstanceUid {
    type Err = NbiaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_dicom_uid(normalized) {
            return Err(NbiaError::InvalidInstanceUid(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl TryFrom<String> for InstanceUid {
    type Error = NbiaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<InstanceUid> for String {
    fn from(value: InstanceUid) -> Self {
        value.0
    }
}

/// Public archive deployments. `Nlst` hosts the National Lung Screening Trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ApiHost {
    #[default]
    Services,
    Nlst,
}

impl ApiHost {
    pub fn base_url(self) -> String {
        format!("https://{self}.cancerimagingarchive.net/nbia-api/services")
    }
}

impl fmt::Display for ApiHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiHost::Services => write!(f, "services"),
            ApiHost::Nlst => write!(f, "nlst"),
        }
    }
}

impl FromStr for ApiHost {
    type Err = NbiaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "" | "services" => Ok(ApiHost::Services),
            "nlst" => Ok(ApiHost::Nlst),
            _ => Err(NbiaError::InvalidApiHost(value.to_string())),
        }
    }
}

/// Level at which a query returns rows. The last four are the value lists
/// used to discover filter values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Patient,
    Study,
    Series,
    Image,
    Collection,
    Modality,
    BodyPart,
    Manufacturer,
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Patient => write!(f, "patient"),
            Granularity::Study => write!(f, "study"),
            Granularity::Series => write!(f, "series"),
            Granularity::Image => write!(f, "image"),
            Granularity::Collection => write!(f, "collection"),
            Granularity::Modality => write!(f, "modality"),
            Granularity::BodyPart => write!(f, "body part"),
            Granularity::Manufacturer => write!(f, "manufacturer"),
        }
    }
}

/// Species accepted by the simple search, with their SNOMED codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Species {
    Human,
    Mouse,
    Dog,
}

impl Species {
    pub fn snomed_code(self) -> u64 {
        match self {
            Species::Human => 337915000,
            Species::Mouse => 447612001,
            Species::Dog => 448771007,
        }
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Species::Human => write!(f, "human"),
            Species::Mouse => write!(f, "mouse"),
            Species::Dog => write!(f, "dog"),
        }
    }
}

impl FromStr for Species {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "human" => Ok(Species::Human),
            "mouse" => Ok(Species::Mouse),
            "dog" => Ok(Species::Dog),
            _ => Err("expected one of human, mouse, dog".to_string()),
        }
    }
}
