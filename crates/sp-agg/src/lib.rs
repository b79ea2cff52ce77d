#![forbid(unsafe_code)]

use std::{collections::HashMap, mem::size_of};

use bumpalo::{Bump, collections::Vec as BumpVec};
use serde::{Deserialize, Serialize};
use sp_frame::Frame;
use sp_types::{Scalar, ScalarKey};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AggError {
    #[error("column(s) not found: {}", .columns.join(", "))]
    ColumnNotFound { columns: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateOptions {
    /// Skip rows whose category or sub-group key is missing. With `false`,
    /// missing keys form their own group under the null scalar.
    pub dropna: bool,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        Self { dropna: true }
    }
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExecutionTrace {
    used_arena: bool,
    input_rows: usize,
    estimated_bytes: usize,
}

/// One observed `(row category, sub-group)` pair and how many input rows
/// produced it. Per row category, counts sum to the number of contributing
/// rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryCount {
    pub row_category: Scalar,
    pub sub_group: Scalar,
    pub count: u64,
}

/// Dense percentage grid: one row per distinct row-category value, one column
/// per distinct sub-group value, both in first-appearance order. Every row
/// sums to 100; combinations never observed together hold an explicit 0.0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentageMatrix {
    row_categories: Vec<Scalar>,
    sub_groups: Vec<Scalar>,
    rows: Vec<Vec<f64>>,
}

impl PercentageMatrix {
    #[must_use]
    pub fn row_categories(&self) -> &[Scalar] {
        &self.row_categories
    }

    #[must_use]
    pub fn sub_groups(&self) -> &[Scalar] {
        &self.sub_groups
    }

    /// Percentages for one row category, ordered like `sub_groups()`.
    #[must_use]
    pub fn row(&self, row_category: &Scalar) -> Option<&[f64]> {
        let idx = self.row_categories.iter().position(|c| c == row_category)?;
        Some(&self.rows[idx])
    }

    #[must_use]
    pub fn get(&self, row_category: &Scalar, sub_group: &Scalar) -> Option<f64> {
        let col = self.sub_groups.iter().position(|s| s == sub_group)?;
        self.row(row_category).map(|row| row[col])
    }

    /// Number of row categories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.row_categories.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.row_categories.is_empty()
    }
}

/// Group rows by `(row_category_column, sub_group_column)` and normalize the
/// pair counts into within-category percentages.
///
/// Fails with [`AggError::ColumnNotFound`] naming every missing selector
/// before any computation; otherwise the result is a pure function of the
/// table contents, independent of row order.
pub fn aggregate(
    frame: &Frame,
    row_category_column: &str,
    sub_group_column: &str,
) -> Result<PercentageMatrix, AggError> {
    aggregate_with_options(
        frame,
        row_category_column,
        sub_group_column,
        AggregateOptions::default(),
        ExecutionOptions::default(),
    )
}

pub fn aggregate_with_options(
    frame: &Frame,
    row_category_column: &str,
    sub_group_column: &str,
    options: AggregateOptions,
    exec_options: ExecutionOptions,
) -> Result<PercentageMatrix, AggError> {
    let (matrix, _trace) = aggregate_with_trace(
        frame,
        row_category_column,
        sub_group_column,
        options,
        exec_options,
    )?;
    Ok(matrix)
}

fn aggregate_with_trace(
    frame: &Frame,
    row_category_column: &str,
    sub_group_column: &str,
    options: AggregateOptions,
    exec_options: ExecutionOptions,
) -> Result<(PercentageMatrix, ExecutionTrace), AggError> {
    let (cat_values, sub_values) =
        resolve_key_columns(frame, row_category_column, sub_group_column)?;

    let input_rows = cat_values.len();
    let estimated_bytes = estimate_count_intermediate_bytes(input_rows);
    let use_arena = exec_options.use_arena && estimated_bytes <= exec_options.arena_budget_bytes;

    let counts = if use_arena {
        count_pass_with_arena(cat_values, sub_values, options)
    } else {
        count_pass_with_global_allocator(cat_values, sub_values, options)
    };

    let matrix = normalize_pass(cat_values, sub_values, &counts);
    Ok((matrix, ExecutionTrace {
        used_arena: use_arena,
        input_rows,
        estimated_bytes,
    }))
}

/// The explicit counting pass on its own: every observed pair with its raw
/// count, categories in first-appearance order, sub-groups in
/// first-appearance order within each category block.
pub fn count_pairs(
    frame: &Frame,
    row_category_column: &str,
    sub_group_column: &str,
    options: AggregateOptions,
) -> Result<Vec<CategoryCount>, AggError> {
    let (cat_values, sub_values) =
        resolve_key_columns(frame, row_category_column, sub_group_column)?;
    let counts = count_pass_with_global_allocator(cat_values, sub_values, options);

    let mut out = Vec::new();
    for (cat_idx, &cat_row) in counts.category_rows.iter().enumerate() {
        for (sub_idx, &sub_row) in counts.sub_group_rows.iter().enumerate() {
            if let Some(&count) = counts.pair_counts.get(&(cat_idx, sub_idx)) {
                out.push(CategoryCount {
                    row_category: cat_values[cat_row].clone(),
                    sub_group: sub_values[sub_row].clone(),
                    count,
                });
            }
        }
    }
    Ok(out)
}

fn resolve_key_columns<'f>(
    frame: &'f Frame,
    row_category_column: &str,
    sub_group_column: &str,
) -> Result<(&'f [Scalar], &'f [Scalar]), AggError> {
    let missing = frame.missing_columns(&[row_category_column, sub_group_column]);
    if !missing.is_empty() {
        return Err(AggError::ColumnNotFound { columns: missing });
    }
    let cat = frame
        .column(row_category_column)
        .expect("validated selector resolves");
    let sub = frame
        .column(sub_group_column)
        .expect("validated selector resolves");
    Ok((cat.values(), sub.values()))
}

/// Estimate intermediate memory for the counting pass (dense-id maps, pair
/// map entries, ordering vectors). Assume hash-map overhead dominates.
fn estimate_count_intermediate_bytes(input_rows: usize) -> usize {
    input_rows.saturating_mul(
        size_of::<(usize, usize)>()
            .saturating_add(size_of::<u64>())
            .saturating_add(2 * size_of::<usize>())
            .saturating_add(64),
    )
}

/// Counting-pass output. Categories and sub-groups carry the source row where
/// each key was first seen, so owned labels are rebuilt only at emit time.
struct PairCounts {
    category_rows: Vec<usize>,
    sub_group_rows: Vec<usize>,
    pair_counts: HashMap<(usize, usize), u64>,
    category_totals: Vec<u64>,
}

fn count_pass_with_global_allocator(
    cat_values: &[Scalar],
    sub_values: &[Scalar],
    options: AggregateOptions,
) -> PairCounts {
    let mut category_rows = Vec::new();
    let mut sub_group_rows = Vec::new();
    let mut category_ids = HashMap::<ScalarKey<'_>, usize>::new();
    let mut sub_group_ids = HashMap::<ScalarKey<'_>, usize>::new();
    let mut pair_counts = HashMap::<(usize, usize), u64>::new();
    let mut category_totals = Vec::new();

    for (row, (cat, sub)) in cat_values.iter().zip(sub_values.iter()).enumerate() {
        if options.dropna && (cat.is_missing() || sub.is_missing()) {
            continue;
        }

        let cat_idx = *category_ids
            .entry(cat.group_key())
            .or_insert_with(|| {
                category_rows.push(row);
                category_totals.push(0);
                category_rows.len() - 1
            });
        let sub_idx = *sub_group_ids
            .entry(sub.group_key())
            .or_insert_with(|| {
                sub_group_rows.push(row);
                sub_group_rows.len() - 1
            });

        *pair_counts.entry((cat_idx, sub_idx)).or_insert(0) += 1;
        category_totals[cat_idx] += 1;
    }

    PairCounts {
        category_rows,
        sub_group_rows,
        pair_counts,
        category_totals,
    }
}

/// Arena-backed counting pass: the ordering and total vectors live in the
/// arena and are freed in bulk when it drops. Results are copied out into
/// global-allocated storage.
fn count_pass_with_arena(
    cat_values: &[Scalar],
    sub_values: &[Scalar],
    options: AggregateOptions,
) -> PairCounts {
    let arena = Bump::new();
    let mut category_rows = BumpVec::<usize>::new_in(&arena);
    let mut sub_group_rows = BumpVec::<usize>::new_in(&arena);
    let mut category_totals = BumpVec::<u64>::new_in(&arena);
    let mut category_ids = HashMap::<ScalarKey<'_>, usize>::new();
    let mut sub_group_ids = HashMap::<ScalarKey<'_>, usize>::new();
    let mut pair_counts = HashMap::<(usize, usize), u64>::new();

    for (row, (cat, sub)) in cat_values.iter().zip(sub_values.iter()).enumerate() {
        if options.dropna && (cat.is_missing() || sub.is_missing()) {
            continue;
        }

        let cat_idx = *category_ids
            .entry(cat.group_key())
            .or_insert_with(|| {
                category_rows.push(row);
                category_totals.push(0);
                category_rows.len() - 1
            });
        let sub_idx = *sub_group_ids
            .entry(sub.group_key())
            .or_insert_with(|| {
                sub_group_rows.push(row);
                sub_group_rows.len() - 1
            });

        *pair_counts.entry((cat_idx, sub_idx)).or_insert(0) += 1;
        category_totals[cat_idx] += 1;
    }

    PairCounts {
        category_rows: category_rows.iter().copied().collect(),
        sub_group_rows: sub_group_rows.iter().copied().collect(),
        pair_counts,
        category_totals: category_totals.iter().copied().collect(),
    }
}

/// Normalize pair counts into the dense percentage grid. A category exists
/// only because at least one row carried it, so its total is never zero.
fn normalize_pass(
    cat_values: &[Scalar],
    sub_values: &[Scalar],
    counts: &PairCounts,
) -> PercentageMatrix {
    let sub_count = counts.sub_group_rows.len();
    let mut rows = Vec::with_capacity(counts.category_rows.len());

    for (cat_idx, &total) in counts.category_totals.iter().enumerate() {
        let mut row = vec![0.0_f64; sub_count];
        for sub_idx in 0..sub_count {
            if let Some(&count) = counts.pair_counts.get(&(cat_idx, sub_idx)) {
                row[sub_idx] = 100.0 * count as f64 / total as f64;
            }
        }
        rows.push(row);
    }

    PercentageMatrix {
        row_categories: counts
            .category_rows
            .iter()
            .map(|&row| cat_values[row].clone())
            .collect(),
        sub_groups: counts
            .sub_group_rows
            .iter()
            .map(|&row| sub_values[row].clone())
            .collect(),
        rows,
    }
}
