use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::domain::{Granularity, Species, is_dicom_uid};
use crate::error::NbiaError;
use crate::normalize::Field;

/// Lower bound used when a date range only gives its end.
const OPEN_RANGE_START: (i32, u32, u32) = (1900, 1, 1);

/// Upper bound on the page size the simple search accepts.
pub const MAX_PAGE_SIZE: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FilterKey {
    Collection,
    PatientId,
    StudyInstanceUid,
    SeriesInstanceUid,
    Modality,
    BodyPartExamined,
    Manufacturer,
    ManufacturerModelName,
    StudyDate,
    FromDate,
    Species,
    MinStudies,
    ModalityAnded,
    CartName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Text,
    Uid,
    Date,
    DateRange,
    Integer,
    Species,
    Flag,
}

impl FilterKey {
    pub const ALL: [FilterKey; 14] = [
        FilterKey::Collection,
        FilterKey::PatientId,
        FilterKey::StudyInstanceUid,
        FilterKey::SeriesInstanceUid,
        FilterKey::Modality,
        FilterKey::BodyPartExamined,
        FilterKey::Manufacturer,
        FilterKey::ManufacturerModelName,
        FilterKey::StudyDate,
        FilterKey::FromDate,
        FilterKey::Species,
        FilterKey::MinStudies,
        FilterKey::ModalityAnded,
        FilterKey::CartName,
    ];

    pub fn name(self) -> &'static str {
        match self {
            FilterKey::Collection => "collection",
            FilterKey::PatientId => "patientId",
            FilterKey::StudyInstanceUid => "studyInstanceUid",
            FilterKey::SeriesInstanceUid => "seriesInstanceUid",
            FilterKey::Modality => "modality",
            FilterKey::BodyPartExamined => "bodyPartExamined",
            FilterKey::Manufacturer => "manufacturer",
            FilterKey::ManufacturerModelName => "manufacturerModelName",
            FilterKey::StudyDate => "studyDate",
            FilterKey::FromDate => "fromDate",
            FilterKey::Species => "species",
            FilterKey::MinStudies => "minStudies",
            FilterKey::ModalityAnded => "modalityAnded",
            FilterKey::CartName => "cartName",
        }
    }

    fn kind(self) -> ValueKind {
        match self {
            FilterKey::StudyInstanceUid | FilterKey::SeriesInstanceUid => ValueKind::Uid,
            FilterKey::StudyDate => ValueKind::DateRange,
            FilterKey::FromDate => ValueKind::Date,
            FilterKey::Species => ValueKind::Species,
            FilterKey::MinStudies => ValueKind::Integer,
            FilterKey::ModalityAnded => ValueKind::Flag,
            _ => ValueKind::Text,
        }
    }

    /// Keys the simple search accepts several values for.
    pub fn is_repeatable(self) -> bool {
        matches!(
            self,
            FilterKey::Collection
                | FilterKey::PatientId
                | FilterKey::Modality
                | FilterKey::BodyPartExamined
                | FilterKey::Manufacturer
                | FilterKey::Species
        )
    }

    /// Modifiers narrow nothing on their own.
    pub fn is_discriminating(self) -> bool {
        !matches!(self, FilterKey::ModalityAnded)
    }

    fn query_param(self) -> &'static str {
        match self {
            FilterKey::Collection => "Collection",
            FilterKey::PatientId => "PatientID",
            FilterKey::StudyInstanceUid => "StudyInstanceUID",
            FilterKey::SeriesInstanceUid => "SeriesInstanceUID",
            FilterKey::Modality => "Modality",
            FilterKey::BodyPartExamined => "BodyPartExamined",
            FilterKey::Manufacturer => "Manufacturer",
            FilterKey::ManufacturerModelName => "ManufacturerModelName",
            FilterKey::StudyDate => "StudyDate",
            FilterKey::FromDate => "fromDate",
            FilterKey::Species => "Species",
            FilterKey::MinStudies => "MinStudies",
            FilterKey::ModalityAnded => "ModalityAnded",
            FilterKey::CartName => "name",
        }
    }

    fn search_criteria_type(self) -> Option<&'static str> {
        match self {
            FilterKey::Collection => Some("CollectionCriteria"),
            FilterKey::Species => Some("SpeciesCriteria"),
            FilterKey::Modality => Some("ImageModalityCriteria"),
            FilterKey::BodyPartExamined => Some("AnatomicalSiteCriteria"),
            FilterKey::Manufacturer => Some("ManufacturerCriteria"),
            FilterKey::StudyDate => Some("DateRangeCriteria"),
            FilterKey::PatientId => Some("PatientCriteria"),
            FilterKey::MinStudies => Some("MinNumberOfStudiesCriteria"),
            FilterKey::ModalityAnded => Some("ModalityAndedSearchCriteria"),
            _ => None,
        }
    }
}

impl fmt::Display for FilterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for FilterKey {
    type Err = NbiaError;

    /// Matches ignoring case and separators, so `BodyPartExamined`,
    /// `bodyPartExamined` and `body_part_examined` are the same key.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = fold_key(value);
        let alias = match wanted.as_str() {
            "bodypart" => Some(FilterKey::BodyPartExamined),
            "patient" | "subjectid" => Some(FilterKey::PatientId),
            "studyuid" => Some(FilterKey::StudyInstanceUid),
            "seriesuid" => Some(FilterKey::SeriesInstanceUid),
            "manufacturermodel" => Some(FilterKey::ManufacturerModelName),
            "date" => Some(FilterKey::FromDate),
            "name" | "cart" => Some(FilterKey::CartName),
            _ => None,
        };
        alias
            .or_else(|| {
                FilterKey::ALL
                    .into_iter()
                    .find(|key| fold_key(key.name()) == wanted)
            })
            .ok_or_else(|| NbiaError::UnsupportedFilter {
                filter: value.to_string(),
                endpoint: "search criteria".to_string(),
            })
    }
}

fn fold_key(value: &str) -> String {
    value
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FilterValue {
    Text(String),
    Uid(String),
    Date(NaiveDate),
    DateRange { from: NaiveDate, to: NaiveDate },
    Integer(u32),
    Species(Species),
    Flag(bool),
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Text(value) | FilterValue::Uid(value) => write!(f, "{value}"),
            FilterValue::Date(date) => write!(f, "{}", date.format("%Y/%m/%d")),
            FilterValue::DateRange { from, to } => write!(
                f,
                "{}..{}",
                from.format("%Y/%m/%d"),
                to.format("%Y/%m/%d")
            ),
            FilterValue::Integer(value) => write!(f, "{value}"),
            FilterValue::Species(species) => write!(f, "{species}"),
            FilterValue::Flag(value) => write!(f, "{value}"),
        }
    }
}

/// The archive's v4 API takes dates as `MM-DD-YYYY`.
fn api_date(date: &NaiveDate) -> String {
    date.format("%m-%d-%Y").to_string()
}

fn parse_input_date(key: FilterKey, raw: &str) -> Result<NaiveDate, NbiaError> {
    let trimmed = raw.trim();
    NaiveDate::parse_from_str(trimmed, "%Y/%m/%d")
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y-%m-%d"))
        .map_err(|_| invalid_value(key, raw, "expected a YYYY/MM/DD date"))
}

fn invalid_value(key: FilterKey, value: &str, reason: &str) -> NbiaError {
    NbiaError::InvalidFilterValue {
        filter: key.name().to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl FilterValue {
    /// Parses and type-checks a raw value for `key`.
    ///
    /// Date ranges are written `from..to`; an open end defaults to
    /// 1900/01/01 or today.
    pub fn parse(key: FilterKey, raw: &str) -> Result<Self, NbiaError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid_value(key, raw, "value is empty"));
        }
        match key.kind() {
            ValueKind::Text => Ok(FilterValue::Text(trimmed.to_string())),
            ValueKind::Uid => {
                if is_dicom_uid(trimmed) {
                    Ok(FilterValue::Uid(trimmed.to_string()))
                } else {
                    Err(invalid_value(key, raw, "expected a DICOM UID"))
                }
            }
            ValueKind::Date => Ok(FilterValue::Date(parse_input_date(key, trimmed)?)),
            ValueKind::DateRange => {
                let (from, to) = trimmed
                    .split_once("..")
                    .ok_or_else(|| invalid_value(key, raw, "expected FROM..TO"))?;
                let from = match from.trim() {
                    "" => {
                        let (y, m, d) = OPEN_RANGE_START;
                        NaiveDate::from_ymd_opt(y, m, d)
                            .ok_or_else(|| invalid_value(key, raw, "invalid range start"))?
                    }
                    value => parse_input_date(key, value)?,
                };
                let to = match to.trim() {
                    "" => chrono::Local::now().date_naive(),
                    value => parse_input_date(key, value)?,
                };
                if from > to {
                    return Err(invalid_value(key, raw, "range start is after its end"));
                }
                Ok(FilterValue::DateRange { from, to })
            }
            ValueKind::Integer => trimmed
                .parse::<u32>()
                .map(FilterValue::Integer)
                .map_err(|_| invalid_value(key, raw, "expected a non-negative integer")),
            ValueKind::Species => trimmed
                .parse::<Species>()
                .map(FilterValue::Species)
                .map_err(|reason| invalid_value(key, raw, &reason)),
            ValueKind::Flag => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "yes" | "y" | "1" | "all" => Ok(FilterValue::Flag(true)),
                "false" | "no" | "n" | "0" | "any" => Ok(FilterValue::Flag(false)),
                _ => Err(invalid_value(key, raw, "expected true or false")),
            },
        }
    }

    fn render(&self) -> String {
        match self {
            FilterValue::Text(value) | FilterValue::Uid(value) => value.clone(),
            FilterValue::Date(date) => api_date(date),
            FilterValue::DateRange { from, to } => format!("{}-{}", api_date(from), api_date(to)),
            FilterValue::Integer(value) => value.to_string(),
            FilterValue::Species(species) => species.snomed_code().to_string(),
            FilterValue::Flag(true) => "all".to_string(),
            FilterValue::Flag(false) => "any".to_string(),
        }
    }
}

/// Typed search filters, in the order they were added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchCriteria {
    filters: Vec<(FilterKey, FilterValue)>,
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: FilterKey, raw: &str) -> Result<Self, NbiaError> {
        let value = FilterValue::parse(key, raw)?;
        self.insert(key, value)?;
        Ok(self)
    }

    /// Like [`SearchCriteria::with`] for keys given as strings, e.g. from a CLI.
    pub fn with_raw(self, key: &str, raw: &str) -> Result<Self, NbiaError> {
        let key: FilterKey = key.parse()?;
        self.with(key, raw)
    }

    pub fn insert(&mut self, key: FilterKey, value: FilterValue) -> Result<(), NbiaError> {
        if !key.is_repeatable() && self.filters.iter().any(|(existing, _)| *existing == key) {
            return Err(invalid_value(
                key,
                &value.to_string(),
                "this filter takes a single value",
            ));
        }
        self.filters.push((key, value));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(FilterKey, FilterValue)> {
        self.filters.iter()
    }

    pub fn values(&self, key: FilterKey) -> impl Iterator<Item = &FilterValue> {
        self.filters
            .iter()
            .filter(move |(existing, _)| *existing == key)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, key: FilterKey) -> bool {
        self.values(key).next().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Endpoint {
    Series,
    Studies,
    Patients,
    PatientsByModality,
    NewPatients,
    NewStudies,
    UpdatedSeries,
    SharedCart,
    SimpleSearch,
    SeriesMetadata,
    SeriesSize,
    SopInstanceUids,
    Collections,
    Modalities,
    BodyParts,
    Manufacturers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    PostForm,
}

impl Endpoint {
    pub const ALL: [Endpoint; 16] = [
        Endpoint::Series,
        Endpoint::Studies,
        Endpoint::Patients,
        Endpoint::PatientsByModality,
        Endpoint::NewPatients,
        Endpoint::NewStudies,
        Endpoint::UpdatedSeries,
        Endpoint::SharedCart,
        Endpoint::SimpleSearch,
        Endpoint::SeriesMetadata,
        Endpoint::SeriesSize,
        Endpoint::SopInstanceUids,
        Endpoint::Collections,
        Endpoint::Modalities,
        Endpoint::BodyParts,
        Endpoint::Manufacturers,
    ];

    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Series => "getSeries",
            Endpoint::Studies => "getPatientStudy",
            Endpoint::Patients => "getPatient",
            Endpoint::PatientsByModality => "getPatientByCollectionAndModality",
            Endpoint::NewPatients => "NewPatientsInCollection",
            Endpoint::NewStudies => "NewStudiesInPatientCollection",
            Endpoint::UpdatedSeries => "getUpdatedSeries",
            Endpoint::SharedCart => "getContentsByName",
            Endpoint::SimpleSearch => "getSimpleSearch",
            Endpoint::SeriesMetadata => "getSeriesMetaData",
            Endpoint::SeriesSize => "getSeriesSize",
            Endpoint::SopInstanceUids => "getSOPInstanceUIDs",
            Endpoint::Collections => "getCollectionValues",
            Endpoint::Modalities => "getModalityValues",
            Endpoint::BodyParts => "getBodyPartValues",
            Endpoint::Manufacturers => "getManufacturerValues",
        }
    }

    /// `getContentsByName` was never migrated off the v1 API.
    pub fn api_version(self) -> &'static str {
        match self {
            Endpoint::SharedCart => "v1",
            _ => "v4",
        }
    }

    pub fn method(self) -> Method {
        match self {
            Endpoint::SimpleSearch => Method::PostForm,
            _ => Method::Get,
        }
    }

    pub fn granularity(self) -> Granularity {
        match self {
            Endpoint::Series
            | Endpoint::UpdatedSeries
            | Endpoint::SharedCart
            | Endpoint::SeriesMetadata
            | Endpoint::SeriesSize => Granularity::Series,
            Endpoint::Studies | Endpoint::NewStudies => Granularity::Study,
            Endpoint::Patients
            | Endpoint::PatientsByModality
            | Endpoint::NewPatients
            | Endpoint::SimpleSearch => Granularity::Patient,
            Endpoint::SopInstanceUids => Granularity::Image,
            Endpoint::Collections => Granularity::Collection,
            Endpoint::Modalities => Granularity::Modality,
            Endpoint::BodyParts => Granularity::BodyPart,
            Endpoint::Manufacturers => Granularity::Manufacturer,
        }
    }

    /// Value lists enumerate filter values and may run unconstrained;
    /// record endpoints need at least one filter.
    pub fn requires_filter(self) -> bool {
        !matches!(
            self,
            Endpoint::Collections
                | Endpoint::Modalities
                | Endpoint::BodyParts
                | Endpoint::Manufacturers
        )
    }

    /// Whether the endpoint pages with `start`/`size`.
    pub fn is_paged(self) -> bool {
        matches!(self, Endpoint::SimpleSearch)
    }

    pub fn supported_filters(self) -> &'static [FilterKey] {
        match self {
            Endpoint::Series => &[
                FilterKey::Collection,
                FilterKey::PatientId,
                FilterKey::StudyInstanceUid,
                FilterKey::SeriesInstanceUid,
                FilterKey::Modality,
                FilterKey::BodyPartExamined,
                FilterKey::Manufacturer,
                FilterKey::ManufacturerModelName,
            ],
            Endpoint::Studies => &[
                FilterKey::Collection,
                FilterKey::PatientId,
                FilterKey::StudyInstanceUid,
            ],
            Endpoint::Patients => &[FilterKey::Collection],
            Endpoint::PatientsByModality => &[FilterKey::Collection, FilterKey::Modality],
            Endpoint::NewPatients => &[FilterKey::Collection, FilterKey::FromDate],
            Endpoint::NewStudies => &[
                FilterKey::Collection,
                FilterKey::PatientId,
                FilterKey::FromDate,
            ],
            Endpoint::UpdatedSeries => &[FilterKey::FromDate],
            Endpoint::SharedCart => &[FilterKey::CartName],
            Endpoint::SimpleSearch => &[
                FilterKey::Collection,
                FilterKey::Species,
                FilterKey::Modality,
                FilterKey::BodyPartExamined,
                FilterKey::Manufacturer,
                FilterKey::StudyDate,
                FilterKey::PatientId,
                FilterKey::MinStudies,
                FilterKey::ModalityAnded,
            ],
            Endpoint::SeriesMetadata | Endpoint::SeriesSize | Endpoint::SopInstanceUids => {
                &[FilterKey::SeriesInstanceUid]
            }
            Endpoint::Collections => &[],
            Endpoint::Modalities => &[FilterKey::Collection, FilterKey::BodyPartExamined],
            Endpoint::BodyParts => &[FilterKey::Collection, FilterKey::Modality],
            Endpoint::Manufacturers => &[
                FilterKey::Collection,
                FilterKey::Modality,
                FilterKey::BodyPartExamined,
            ],
        }
    }

    pub fn required_filters(self) -> &'static [FilterKey] {
        match self {
            Endpoint::Studies => &[FilterKey::Collection],
            Endpoint::PatientsByModality => &[FilterKey::Collection, FilterKey::Modality],
            Endpoint::NewPatients => &[FilterKey::Collection, FilterKey::FromDate],
            Endpoint::NewStudies => &[
                FilterKey::Collection,
                FilterKey::PatientId,
                FilterKey::FromDate,
            ],
            Endpoint::UpdatedSeries => &[FilterKey::FromDate],
            Endpoint::SharedCart => &[FilterKey::CartName],
            Endpoint::SeriesMetadata | Endpoint::SeriesSize | Endpoint::SopInstanceUids => {
                &[FilterKey::SeriesInstanceUid]
            }
            _ => &[],
        }
    }

    /// Per-series endpoints whose rows may leave out the series UID.
    fn omits_series_uid(self) -> bool {
        matches!(
            self,
            Endpoint::SeriesMetadata | Endpoint::SeriesSize | Endpoint::SopInstanceUids
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path())
    }
}

impl FromStr for Endpoint {
    type Err = NbiaError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = fold_key(value);
        let alias = match wanted.as_str() {
            "series" => Some(Endpoint::Series),
            "studies" | "study" => Some(Endpoint::Studies),
            "patients" | "patient" => Some(Endpoint::Patients),
            "patientsbymodality" => Some(Endpoint::PatientsByModality),
            "newpatients" => Some(Endpoint::NewPatients),
            "newstudies" => Some(Endpoint::NewStudies),
            "updatedseries" => Some(Endpoint::UpdatedSeries),
            "sharedcart" | "cart" => Some(Endpoint::SharedCart),
            "simplesearch" | "search" => Some(Endpoint::SimpleSearch),
            "seriesmetadata" | "metadata" => Some(Endpoint::SeriesMetadata),
            "seriessize" | "size" => Some(Endpoint::SeriesSize),
            "sopinstanceuids" | "instances" | "images" => Some(Endpoint::SopInstanceUids),
            "collections" => Some(Endpoint::Collections),
            "modalities" => Some(Endpoint::Modalities),
            "bodyparts" => Some(Endpoint::BodyParts),
            "manufacturers" => Some(Endpoint::Manufacturers),
            _ => None,
        };
        alias
            .or_else(|| {
                Endpoint::ALL
                    .into_iter()
                    .find(|endpoint| fold_key(endpoint.path()) == wanted)
            })
            .ok_or_else(|| NbiaError::InvalidQuery(format!("unknown endpoint: {value}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Ordering applied to an aggregated result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: Field,
    pub direction: SortDirection,
}

impl Sort {
    pub fn ascending(field: Field) -> Self {
        Self {
            field,
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(field: Field) -> Self {
        Self {
            field,
            direction: SortDirection::Descending,
        }
    }

    /// Server-side sort field of the simple search, when one corresponds.
    fn search_sort_field(self) -> Option<&'static str> {
        match self.field {
            Field::PatientId => Some("subject"),
            Field::Collection => Some("collection"),
            Field::StudyCount => Some("studies"),
            Field::SeriesCount => Some("series"),
            _ => None,
        }
    }
}

impl FromStr for Sort {
    type Err = NbiaError;

    /// `field` or `field:desc`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (field, direction) = match value.split_once(':') {
            Some((field, direction)) => (field, direction),
            None => (value, "asc"),
        };
        let field: Field = field
            .parse()
            .map_err(|_| NbiaError::InvalidQuery(format!("unknown sort field: {field}")))?;
        let direction = match direction.trim().to_ascii_lowercase().as_str() {
            "asc" | "ascending" => SortDirection::Ascending,
            "desc" | "descending" => SortDirection::Descending,
            other => {
                return Err(NbiaError::InvalidQuery(format!(
                    "unknown sort direction: {other}"
                )));
            }
        };
        Ok(Self { field, direction })
    }
}

/// Position of the next page to request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PageCursor {
    Offset(usize),
    Token(String),
}

/// A validated, immutable request against one search endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    endpoint: Endpoint,
    criteria: SearchCriteria,
    params: Vec<(String, String)>,
    page_size: usize,
    sort: Option<Sort>,
}

impl Request {
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn granularity(&self) -> Granularity {
        self.endpoint.granularity()
    }

    /// The filters this request was built from, exactly as given.
    pub fn filters(&self) -> &SearchCriteria {
        &self.criteria
    }

    /// Query or form parameters, without paging.
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn sort(&self) -> Option<Sort> {
        self.sort
    }

    pub fn is_paged(&self) -> bool {
        self.endpoint.is_paged()
    }

    /// Fields the response leaves implicit, taken from the filters.
    pub fn context(&self) -> Vec<(Field, String)> {
        if !self.endpoint.omits_series_uid() {
            return Vec::new();
        }
        self.criteria
            .values(FilterKey::SeriesInstanceUid)
            .map(|value| (Field::SeriesInstanceUid, value.to_string()))
            .collect()
    }

    /// Parameters for fetching the page at `cursor`.
    pub fn page_params(&self, cursor: &PageCursor) -> Vec<(String, String)> {
        let mut params = self.params.clone();
        if !self.is_paged() {
            return params;
        }
        match cursor {
            PageCursor::Offset(offset) => {
                params.push(("start".to_string(), offset.to_string()));
            }
            PageCursor::Token(token) => {
                params.push(("cursor".to_string(), token.clone()));
            }
        }
        params.push(("size".to_string(), self.page_size.to_string()));
        params
    }
}

pub struct QueryBuilder;

impl QueryBuilder {
    /// Validates `criteria` against `endpoint` and renders its parameters.
    pub fn build(
        endpoint: Endpoint,
        criteria: &SearchCriteria,
        page_size: usize,
        sort: Option<Sort>,
    ) -> Result<Request, NbiaError> {
        if endpoint.requires_filter() && !criteria.iter().any(|(key, _)| key.is_discriminating()) {
            return Err(NbiaError::InvalidQuery(format!(
                "{endpoint} needs at least one filter; unconstrained queries over the archive are refused"
            )));
        }
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(NbiaError::InvalidQuery(format!(
                "page size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let supported = endpoint.supported_filters();
        for (key, _) in criteria.iter() {
            if !supported.contains(key) {
                return Err(NbiaError::UnsupportedFilter {
                    filter: key.name().to_string(),
                    endpoint: endpoint.to_string(),
                });
            }
        }
        for key in endpoint.required_filters() {
            if !criteria.contains(*key) {
                return Err(NbiaError::InvalidQuery(format!("{endpoint} requires {key}")));
            }
        }

        let params = match endpoint.method() {
            Method::Get => render_query_params(endpoint, criteria)?,
            Method::PostForm => render_search_form(criteria, sort),
        };

        Ok(Request {
            endpoint,
            criteria: criteria.clone(),
            params,
            page_size,
            sort,
        })
    }
}

fn render_query_params(
    endpoint: Endpoint,
    criteria: &SearchCriteria,
) -> Result<Vec<(String, String)>, NbiaError> {
    let mut params: Vec<(String, String)> = Vec::new();
    for (key, value) in criteria.iter() {
        let name = key.query_param();
        if params.iter().any(|(existing, _)| existing == name) {
            return Err(NbiaError::InvalidQuery(format!(
                "{endpoint} accepts a single {key}"
            )));
        }
        params.push((name.to_string(), value.render()));
    }
    Ok(params)
}

/// The simple search takes numbered `criteriaTypeN`/`valueN` pairs. An
/// unset `ModalityAnded` is left out; the server's default is "any".
fn render_search_form(criteria: &SearchCriteria, sort: Option<Sort>) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut index = 0usize;
    for (key, value) in criteria.iter() {
        let Some(criteria_type) = key.search_criteria_type() else {
            continue;
        };
        if *value == FilterValue::Flag(false) {
            continue;
        }
        params.push((format!("criteriaType{index}"), criteria_type.to_string()));
        match value {
            FilterValue::DateRange { from, to } => {
                params.push((format!("fromDate{index}"), api_date(from)));
                params.push((format!("toDate{index}"), api_date(to)));
            }
            other => params.push((format!("value{index}"), other.render())),
        }
        index += 1;
    }

    let sort_field = sort
        .and_then(Sort::search_sort_field)
        .unwrap_or("subject");
    let direction = match sort.map(|sort| sort.direction).unwrap_or_default() {
        SortDirection::Ascending => "ascending",
        SortDirection::Descending => "descending",
    };
    params.push(("sortField".to_string(), sort_field.to_string()));
    params.push(("sortDirection".to_string(), direction.to_string()));
    params.push(("tool".to_string(), env!("CARGO_PKG_NAME").to_string()));
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_filter_keys_ignoring_case() {
        assert_eq!(
            "BodyPartExamined".parse::<FilterKey>().unwrap(),
            FilterKey::BodyPartExamined
        );
        assert_eq!(
            "patient_id".parse::<FilterKey>().unwrap(),
            FilterKey::PatientId
        );
        assert_eq!("bodyPart".parse::<FilterKey>().unwrap(), FilterKey::BodyPartExamined);
    }

    #[test]
    fn api_dates_are_month_first() {
        let value = FilterValue::parse(FilterKey::FromDate, "2021/03/04").unwrap();
        assert_eq!(value.render(), "03-04-2021");
    }

    #[test]
    fn open_date_range_starts_in_1900() {
        let value = FilterValue::parse(FilterKey::StudyDate, "..2000/01/01").unwrap();
        match value {
            FilterValue::DateRange { from, .. } => {
                assert_eq!(from, NaiveDate::from_ymd_opt(1900, 1, 1).unwrap())
            }
            other => panic!("unexpected value {other:?}"),
        }
    }
}
