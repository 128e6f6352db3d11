use std::collections::HashSet;

use serde::Serialize;

use crate::domain::Granularity;
use crate::normalize::{Field, ResultRecord};
use crate::query::{SearchCriteria, Sort, SortDirection};

/// Aggregated records of one query, unique by natural key within its scope
/// (patients by collection and patient ID).
#[derive(Debug, Clone, Serialize)]
pub struct ResultSet {
    granularity: Granularity,
    criteria: SearchCriteria,
    records: Vec<ResultRecord>,
    #[serde(skip)]
    seen: HashSet<(Option<String>, String)>,
}

impl ResultSet {
    pub fn new(granularity: Granularity, criteria: SearchCriteria) -> Self {
        Self {
            granularity,
            criteria,
            records: Vec::new(),
            seen: HashSet::new(),
        }
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn criteria(&self) -> &SearchCriteria {
        &self.criteria
    }

    /// Appends `record` unless its key was already seen. First occurrence wins.
    pub fn insert(&mut self, record: ResultRecord) -> bool {
        let identity = (
            record.scope().map(str::to_string),
            record.key().to_string(),
        );
        if !self.seen.insert(identity) {
            return false;
        }
        self.records.push(record);
        true
    }

    /// Appends the records of `other` in order, e.g. a resumed fetch.
    /// Returns how many were new.
    pub fn merge(&mut self, other: ResultSet) -> usize {
        let mut added = 0;
        for record in other.records {
            if self.insert(record) {
                added += 1;
            }
        }
        added
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(ResultRecord::key)
    }

    /// First record with natural key `key`, in any scope.
    pub fn get(&self, key: &str) -> Option<&ResultRecord> {
        self.records.iter().find(|record| record.key() == key)
    }

    /// Stable sort; records missing the field go last in either direction.
    pub fn sort(&mut self, sort: Sort) {
        self.records.sort_by(|a, b| {
            match (a.get(sort.field), b.get(sort.field)) {
                (Some(left), Some(right)) => {
                    let ordering = left.sort_cmp(right);
                    match sort.direction {
                        SortDirection::Ascending => ordering,
                        SortDirection::Descending => ordering.reverse(),
                    }
                }
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        });
    }

    /// Flat table over every canonical column, one row per record.
    pub fn to_table(&self) -> Table {
        let columns = Field::all().collect::<Vec<_>>();
        let rows = self
            .records
            .iter()
            .map(|record| {
                columns
                    .iter()
                    .map(|field| record.get(*field).map(|value| value.to_string()))
                    .collect()
            })
            .collect();
        Table { columns, rows }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<Field>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl Table {
    pub fn column_index(&self, field: Field) -> Option<usize> {
        self.columns.iter().position(|column| *column == field)
    }

    /// RFC 4180 CSV; missing cells are empty.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        let header = self
            .columns
            .iter()
            .map(|field| csv_cell(field.name()))
            .collect::<Vec<_>>();
        out.push_str(&header.join(","));
        out.push_str("\r\n");
        for row in &self.rows {
            let cells = row
                .iter()
                .map(|cell| cell.as_deref().map(csv_cell).unwrap_or_default())
                .collect::<Vec<_>>();
            out.push_str(&cells.join(","));
            out.push_str("\r\n");
        }
        out
    }
}

fn csv_cell(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
