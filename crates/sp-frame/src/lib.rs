#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sp_types::{DType, Scalar, TypeError, infer_dtype};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("column '{name}' has length {column_len}, expected {expected}")]
    LengthMismatch {
        name: String,
        column_len: usize,
        expected: usize,
    },
    #[error("duplicate column name: '{name}'")]
    DuplicateColumn { name: String },
    #[error("row {row} has {found} value(s), expected {expected}")]
    RaggedRow {
        row: usize,
        found: usize,
        expected: usize,
    },
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// Dtype-checked scalar storage. Mixed string/numeric data is rejected at
/// construction, so downstream consumers can trust `dtype()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    dtype: DType,
    values: Vec<Scalar>,
}

impl Column {
    pub fn from_values(values: Vec<Scalar>) -> Result<Self, TypeError> {
        let dtype = infer_dtype(&values)?;
        Ok(Self { dtype, values })
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&Scalar> {
        self.values.get(idx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn is_numeric(&self) -> bool {
        self.dtype.is_numeric()
    }
}

/// An ordered set of equal-length named columns. This is the record table
/// both pipelines borrow: rows are positional, columns are looked up by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    column_order: Vec<String>,
    columns: BTreeMap<String, Column>,
    rows: usize,
}

impl Frame {
    /// Construct from `(name, values)` pairs, preserving input column order.
    ///
    /// Matches a dict-of-columns constructor: the first column fixes the row
    /// count and every later column must agree with it.
    pub fn from_columns(data: Vec<(&str, Vec<Scalar>)>) -> Result<Self, FrameError> {
        let mut column_order = Vec::with_capacity(data.len());
        let mut columns = BTreeMap::new();
        let mut rows = None;

        for (name, values) in data {
            let expected = *rows.get_or_insert(values.len());
            if values.len() != expected {
                return Err(FrameError::LengthMismatch {
                    name: name.to_owned(),
                    column_len: values.len(),
                    expected,
                });
            }
            if columns.contains_key(name) {
                return Err(FrameError::DuplicateColumn {
                    name: name.to_owned(),
                });
            }
            column_order.push(name.to_owned());
            columns.insert(name.to_owned(), Column::from_values(values)?);
        }

        Ok(Self {
            column_order,
            columns,
            rows: rows.unwrap_or(0),
        })
    }

    /// Construct from positional row records under an explicit header.
    pub fn from_rows(header: &[&str], rows: Vec<Vec<Scalar>>) -> Result<Self, FrameError> {
        let width = header.len();
        let mut buckets: Vec<Vec<Scalar>> = (0..width)
            .map(|_| Vec::with_capacity(rows.len()))
            .collect();

        for (idx, row) in rows.into_iter().enumerate() {
            if row.len() != width {
                return Err(FrameError::RaggedRow {
                    row: idx,
                    found: row.len(),
                    expected: width,
                });
            }
            for (bucket, value) in buckets.iter_mut().zip(row) {
                bucket.push(value);
            }
        }

        let data = header.iter().copied().zip(buckets).collect::<Vec<_>>();
        Self::from_columns(data)
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_order
    }

    /// The subset of `names` that does not resolve to a column, in request
    /// order. Consumers turn a non-empty result into their own
    /// column-not-found error before touching any data.
    #[must_use]
    pub fn missing_columns(&self, names: &[&str]) -> Vec<String> {
        names
            .iter()
            .filter(|name| !self.columns.contains_key(**name))
            .map(|name| (*name).to_owned())
            .collect()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }
}
