use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use tracing::debug;

use crate::domain::Granularity;
use crate::error::NbiaError;

/// Canonical columns of a normalized record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Field {
    SeriesInstanceUid,
    StudyInstanceUid,
    PatientId,
    Collection,
    SopInstanceUid,
    Modality,
    BodyPartExamined,
    Manufacturer,
    ManufacturerModelName,
    SeriesDescription,
    SeriesNumber,
    SeriesDate,
    ProtocolName,
    SoftwareVersions,
    StudyDescription,
    StudyDate,
    StudyId,
    ImageCount,
    FileSize,
    SeriesCount,
    StudyCount,
    PatientName,
    PatientSex,
    PatientAge,
    EthnicGroup,
    SpeciesCode,
    SpeciesDescription,
    SliceThickness,
    LicenseName,
    LicenseUri,
    DataDescriptionUri,
    ThirdPartyAnalysis,
    DateReleased,
    TimeStamp,
    MaxSubmissionTimestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    LowerText,
    Integer,
    Decimal,
    Date,
    Timestamp,
}

struct FieldSpec {
    field: Field,
    kind: FieldKind,
    aliases: &'static [&'static str],
}

/// Raw spellings seen across archive API versions. Matching ignores case,
/// spaces and punctuation, so `Series UID` and `seriesUID` share one alias.
const FIELD_TABLE: &[FieldSpec] = &[
    FieldSpec {
        field: Field::SeriesInstanceUid,
        kind: FieldKind::Text,
        aliases: &["SeriesInstanceUID", "Series UID", "Series ID"],
    },
    FieldSpec {
        field: Field::StudyInstanceUid,
        kind: FieldKind::Text,
        aliases: &["StudyInstanceUID", "Study UID"],
    },
    FieldSpec {
        field: Field::PatientId,
        kind: FieldKind::Text,
        aliases: &["PatientID", "Subject ID", "subjectId"],
    },
    FieldSpec {
        field: Field::Collection,
        kind: FieldKind::Text,
        aliases: &["Collection", "Collection Name", "project"],
    },
    FieldSpec {
        field: Field::SopInstanceUid,
        kind: FieldKind::Text,
        aliases: &["SOPInstanceUID", "SOP UID"],
    },
    FieldSpec {
        field: Field::Modality,
        kind: FieldKind::Text,
        aliases: &["Modality"],
    },
    FieldSpec {
        field: Field::BodyPartExamined,
        kind: FieldKind::Text,
        aliases: &["BodyPartExamined"],
    },
    FieldSpec {
        field: Field::Manufacturer,
        kind: FieldKind::Text,
        aliases: &["Manufacturer"],
    },
    FieldSpec {
        field: Field::ManufacturerModelName,
        kind: FieldKind::Text,
        aliases: &["ManufacturerModelName"],
    },
    FieldSpec {
        field: Field::SeriesDescription,
        kind: FieldKind::Text,
        aliases: &["SeriesDescription"],
    },
    FieldSpec {
        field: Field::SeriesNumber,
        kind: FieldKind::Integer,
        aliases: &["SeriesNumber"],
    },
    FieldSpec {
        field: Field::SeriesDate,
        kind: FieldKind::Date,
        aliases: &["SeriesDate"],
    },
    FieldSpec {
        field: Field::ProtocolName,
        kind: FieldKind::Text,
        aliases: &["ProtocolName"],
    },
    FieldSpec {
        field: Field::SoftwareVersions,
        kind: FieldKind::Text,
        aliases: &["SoftwareVersions"],
    },
    FieldSpec {
        field: Field::StudyDescription,
        kind: FieldKind::Text,
        aliases: &["StudyDescription", "StudyDesc"],
    },
    FieldSpec {
        field: Field::StudyDate,
        kind: FieldKind::Date,
        aliases: &["StudyDate"],
    },
    FieldSpec {
        field: Field::StudyId,
        kind: FieldKind::Text,
        aliases: &["StudyID"],
    },
    FieldSpec {
        field: Field::ImageCount,
        kind: FieldKind::Integer,
        aliases: &["ImageCount", "Number of images", "ObjectCount"],
    },
    FieldSpec {
        field: Field::FileSize,
        kind: FieldKind::Integer,
        aliases: &["FileSize", "File Size (Bytes)", "TotalSizeInBytes"],
    },
    FieldSpec {
        field: Field::SeriesCount,
        kind: FieldKind::Integer,
        aliases: &["SeriesCount", "totalNumberOfSeries"],
    },
    FieldSpec {
        field: Field::StudyCount,
        kind: FieldKind::Integer,
        aliases: &["StudyCount", "totalNumberOfStudies"],
    },
    FieldSpec {
        field: Field::PatientName,
        kind: FieldKind::Text,
        aliases: &["PatientName"],
    },
    FieldSpec {
        field: Field::PatientSex,
        kind: FieldKind::Text,
        aliases: &["PatientSex"],
    },
    FieldSpec {
        field: Field::PatientAge,
        kind: FieldKind::Text,
        aliases: &["PatientAge"],
    },
    FieldSpec {
        field: Field::EthnicGroup,
        kind: FieldKind::Text,
        aliases: &["EthnicGroup"],
    },
    FieldSpec {
        field: Field::SpeciesCode,
        kind: FieldKind::Text,
        aliases: &["SpeciesCode"],
    },
    FieldSpec {
        field: Field::SpeciesDescription,
        kind: FieldKind::Text,
        aliases: &["SpeciesDescription"],
    },
    FieldSpec {
        field: Field::SliceThickness,
        kind: FieldKind::Decimal,
        aliases: &["SliceThickness", "Slice Thickness(mm)"],
    },
    FieldSpec {
        field: Field::LicenseName,
        kind: FieldKind::Text,
        aliases: &["LicenseName"],
    },
    FieldSpec {
        field: Field::LicenseUri,
        kind: FieldKind::LowerText,
        aliases: &["LicenseURI", "License URL"],
    },
    FieldSpec {
        field: Field::DataDescriptionUri,
        kind: FieldKind::LowerText,
        aliases: &["DataDescriptionURI", "Collection URI"],
    },
    FieldSpec {
        field: Field::ThirdPartyAnalysis,
        kind: FieldKind::Text,
        aliases: &["ThirdPartyAnalysis", "3rd Party Analysis"],
    },
    FieldSpec {
        field: Field::DateReleased,
        kind: FieldKind::Date,
        aliases: &["DateReleased"],
    },
    FieldSpec {
        field: Field::TimeStamp,
        kind: FieldKind::Timestamp,
        aliases: &["TimeStamp"],
    },
    FieldSpec {
        field: Field::MaxSubmissionTimestamp,
        kind: FieldKind::Timestamp,
        aliases: &["MaxSubmissionTimestamp"],
    },
];

static ALIASES: LazyLock<HashMap<String, &'static FieldSpec>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    for column in FIELD_TABLE {
        map.insert(fold(column.field.name()), column);
        for alias in column.aliases {
            map.insert(fold(alias), column);
        }
    }
    map
});

fn fold(raw: &str) -> String {
    raw.chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

impl Field {
    pub fn all() -> impl Iterator<Item = Field> {
        FIELD_TABLE.iter().map(|column| column.field)
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::SeriesInstanceUid => "SeriesInstanceUID",
            Field::StudyInstanceUid => "StudyInstanceUID",
            Field::PatientId => "PatientID",
            Field::Collection => "Collection",
            Field::SopInstanceUid => "SOPInstanceUID",
            Field::Modality => "Modality",
            Field::BodyPartExamined => "BodyPartExamined",
            Field::Manufacturer => "Manufacturer",
            Field::ManufacturerModelName => "ManufacturerModelName",
            Field::SeriesDescription => "SeriesDescription",
            Field::SeriesNumber => "SeriesNumber",
            Field::SeriesDate => "SeriesDate",
            Field::ProtocolName => "ProtocolName",
            Field::SoftwareVersions => "SoftwareVersions",
            Field::StudyDescription => "StudyDescription",
            Field::StudyDate => "StudyDate",
            Field::StudyId => "StudyID",
            Field::ImageCount => "ImageCount",
            Field::FileSize => "FileSize",
            Field::SeriesCount => "SeriesCount",
            Field::StudyCount => "StudyCount",
            Field::PatientName => "PatientName",
            Field::PatientSex => "PatientSex",
            Field::PatientAge => "PatientAge",
            Field::EthnicGroup => "EthnicGroup",
            Field::SpeciesCode => "SpeciesCode",
            Field::SpeciesDescription => "SpeciesDescription",
            Field::SliceThickness => "SliceThickness",
            Field::LicenseName => "LicenseName",
            Field::LicenseUri => "LicenseURI",
            Field::DataDescriptionUri => "DataDescriptionURI",
            Field::ThirdPartyAnalysis => "ThirdPartyAnalysis",
            Field::DateReleased => "DateReleased",
            Field::TimeStamp => "TimeStamp",
            Field::MaxSubmissionTimestamp => "MaxSubmissionTimestamp",
        }
    }

    /// Natural key of records at `granularity`.
    pub fn natural_key(granularity: Granularity) -> Field {
        match granularity {
            Granularity::Patient => Field::PatientId,
            Granularity::Study => Field::StudyInstanceUid,
            Granularity::Series => Field::SeriesInstanceUid,
            Granularity::Image => Field::SopInstanceUid,
            Granularity::Collection => Field::Collection,
            Granularity::Modality => Field::Modality,
            Granularity::BodyPart => Field::BodyPartExamined,
            Granularity::Manufacturer => Field::Manufacturer,
        }
    }

    /// Field that scopes the natural key. Patient IDs are only unique
    /// within a collection.
    pub fn key_scope(granularity: Granularity) -> Option<Field> {
        match granularity {
            Granularity::Patient => Some(Field::Collection),
            _ => None,
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Field {
    type Err = NbiaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ALIASES
            .get(&fold(value))
            .map(|column| column.field)
            .ok_or_else(|| NbiaError::InvalidQuery(format!("unknown field: {value}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl FieldValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Ordering for sorting; values of different kinds compare by kind.
    pub fn sort_cmp(&self, other: &FieldValue) -> Ordering {
        match (self, other) {
            (FieldValue::Text(a), FieldValue::Text(b)) => a.cmp(b),
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a.cmp(b),
            (FieldValue::Decimal(a), FieldValue::Decimal(b)) => a.total_cmp(b),
            (FieldValue::Date(a), FieldValue::Date(b)) => a.cmp(b),
            (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            FieldValue::Text(_) => 0,
            FieldValue::Integer(_) => 1,
            FieldValue::Decimal(_) => 2,
            FieldValue::Date(_) => 3,
            FieldValue::Timestamp(_) => 4,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(value) => write!(f, "{value}"),
            FieldValue::Integer(value) => write!(f, "{value}"),
            FieldValue::Decimal(value) => write!(f, "{value}"),
            FieldValue::Date(value) => write!(f, "{}", value.format("%Y-%m-%d")),
            FieldValue::Timestamp(value) => write!(f, "{}", value.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

/// One normalized row. Fields absent from the source are missing, not empty.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRecord {
    key: String,
    scope: Option<String>,
    fields: BTreeMap<Field, FieldValue>,
}

impl ResultRecord {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Value of the key scope field, when the granularity has one and the
    /// record carries it.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn get(&self, field: Field) -> Option<&FieldValue> {
        self.fields.get(&field)
    }

    pub fn text(&self, field: Field) -> Option<&str> {
        self.get(field).and_then(FieldValue::as_text)
    }

    pub fn fields(&self) -> impl Iterator<Item = (Field, &FieldValue)> {
        self.fields.iter().map(|(field, value)| (*field, value))
    }
}

impl Serialize for ResultRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (field, value) in &self.fields {
            map.serialize_entry(field.name(), value)?;
        }
        map.end()
    }
}

/// Normalizes one raw JSON object. Only a missing natural key is an error.
pub fn normalize_record(granularity: Granularity, raw: &Value) -> Result<ResultRecord, NbiaError> {
    let key_field = Field::natural_key(granularity);
    let Some(object) = raw.as_object() else {
        return Err(NbiaError::SchemaMismatch {
            field: key_field.name().to_string(),
        });
    };

    let mut fields = BTreeMap::new();
    for (raw_key, raw_value) in object {
        let Some(column) = ALIASES.get(&fold(raw_key)) else {
            continue;
        };
        if fields.contains_key(&column.field) {
            continue;
        }
        if let Some(value) = coerce(column.kind, raw_value) {
            fields.insert(column.field, value);
        }
    }

    let key = match fields.get(&key_field) {
        Some(FieldValue::Text(value)) => value.clone(),
        Some(other) => other.to_string(),
        None => {
            return Err(NbiaError::SchemaMismatch {
                field: key_field.name().to_string(),
            });
        }
    };

    let scope = Field::key_scope(granularity)
        .and_then(|field| fields.get(&field))
        .map(FieldValue::to_string);

    Ok(ResultRecord { key, scope, fields })
}

/// Fills fields a response leaves implicit, such as the series UID a
/// per-series endpoint was asked about. Fields already present win.
pub fn fill_context(raw: &mut Value, context: &[(Field, String)]) {
    let Some(object) = raw.as_object_mut() else {
        return;
    };
    for (field, value) in context {
        let present = object
            .keys()
            .any(|key| ALIASES.get(&fold(key)).is_some_and(|column| column.field == *field));
        if !present {
            object.insert(field.name().to_string(), Value::String(value.clone()));
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedPage {
    pub records: Vec<ResultRecord>,
    /// Records dropped because their natural key was absent.
    pub dropped: usize,
}

pub fn normalize_page(granularity: Granularity, raw: &[Value]) -> NormalizedPage {
    let mut page = NormalizedPage::default();
    for item in raw {
        match normalize_record(granularity, item) {
            Ok(record) => page.records.push(record),
            Err(err) => {
                debug!(%err, "dropping record");
                page.dropped += 1;
            }
        }
    }
    page
}

fn coerce(kind: FieldKind, raw: &Value) -> Option<FieldValue> {
    match kind {
        FieldKind::Text => scalar_text(raw).map(FieldValue::Text),
        FieldKind::LowerText => scalar_text(raw).map(|text| FieldValue::Text(text.to_lowercase())),
        FieldKind::Integer => match raw {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().filter(|v| v.fract() == 0.0).map(|v| v as i64))
                .map(FieldValue::Integer),
            Value::String(text) => text.trim().parse::<i64>().ok().map(FieldValue::Integer),
            _ => None,
        },
        FieldKind::Decimal => match raw {
            Value::Number(number) => number.as_f64().map(FieldValue::Decimal),
            Value::String(text) => text.trim().parse::<f64>().ok().map(FieldValue::Decimal),
            _ => None,
        },
        FieldKind::Date => parse_timestamp(raw).map(|ts| FieldValue::Date(ts.date())),
        FieldKind::Timestamp => parse_timestamp(raw).map(FieldValue::Timestamp),
    }
}

fn scalar_text(raw: &Value) -> Option<String> {
    let text = match raw {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => return None,
    };
    if text.is_empty() { None } else { Some(text) }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m-%d-%Y", "%m/%d/%Y", "%Y%m%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%m-%d-%Y %H:%M:%S%.f",
];

/// Accepts the date spellings the archive has used, plus epoch milliseconds.
pub fn parse_timestamp(raw: &Value) -> Option<NaiveDateTime> {
    match raw {
        Value::Number(number) => number
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(|ts| ts.naive_utc()),
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
                return Some(ts.naive_utc());
            }
            for format in DATETIME_FORMATS {
                if let Ok(ts) = NaiveDateTime::parse_from_str(text, format) {
                    return Some(ts);
                }
            }
            for format in DATE_FORMATS {
                if let Ok(date) = NaiveDate::parse_from_str(text, format) {
                    return date.and_hms_opt(0, 0, 0);
                }
            }
            if text.chars().all(|ch| ch.is_ascii_digit()) && text.len() >= 12 {
                return text
                    .parse::<i64>()
                    .ok()
                    .and_then(DateTime::from_timestamp_millis)
                    .map(|ts| ts.naive_utc());
            }
            None
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn every_field_has_a_table_entry() {
        assert_eq!(Field::all().count(), FIELD_TABLE.len());
        for column in FIELD_TABLE {
            assert_eq!(column.field.name().parse::<Field>().unwrap(), column.field);
        }
    }

    #[test]
    fn epoch_millis_become_timestamps() {
        let ts = parse_timestamp(&json!(0)).unwrap();
        assert_eq!(ts.date(), NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
    }

    #[test]
    fn patient_keys_are_scoped_by_collection() {
        let record = normalize_record(
            Granularity::Patient,
            &json!({"subjectId": "TCGA-A1-A0SB", "project": "TCGA-BRCA"}),
        )
        .unwrap();
        assert_eq!(record.key(), "TCGA-A1-A0SB");
        assert_eq!(record.scope(), Some("TCGA-BRCA"));

        let series = normalize_record(
            Granularity::Series,
            &json!({"SeriesInstanceUID": "1.2.3", "Collection": "TCGA-BRCA"}),
        )
        .unwrap();
        assert_eq!(series.scope(), None);
    }

    #[test]
    fn context_fills_only_missing_fields() {
        let mut raw = json!({"TotalSizeInBytes": "1024", "ObjectCount": 4});
        fill_context(&mut raw, &[(Field::SeriesInstanceUid, "1.2.3".to_string())]);
        let record = normalize_record(Granularity::Series, &raw).unwrap();
        assert_eq!(record.key(), "1.2.3");
        assert_eq!(record.get(Field::FileSize), Some(&FieldValue::Integer(1024)));
        assert_eq!(record.get(Field::ImageCount), Some(&FieldValue::Integer(4)));

        let mut raw = json!({"Series UID": "1.2.4"});
        fill_context(&mut raw, &[(Field::SeriesInstanceUid, "1.2.3".to_string())]);
        assert_eq!(normalize_record(Granularity::Series, &raw).unwrap().key(), "1.2.4");
    }

    #[test]
    fn compact_dicom_dates_parse() {
        let ts = parse_timestamp(&json!("20200131")).unwrap();
        assert_eq!(ts.date(), NaiveDate::from_ymd_opt(2020, 1, 31).unwrap());
    }
}
