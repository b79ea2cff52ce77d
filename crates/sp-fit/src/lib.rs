#![forbid(unsafe_code)]

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use sp_frame::Frame;
use sp_types::{Scalar, ScalarKey};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FitError {
    #[error("column(s) not found: {}", .columns.join(", "))]
    ColumnNotFound { columns: Vec<String> },
}

/// Regression model fitted independently per category partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitModel {
    /// Ordinary least squares line with intercept.
    Linear,
    /// Least-squares monomial polynomial of the given degree.
    Polynomial { degree: usize },
}

impl FitModel {
    /// The stock trend-curve model: a degree-2 polynomial.
    #[must_use]
    pub fn quadratic() -> Self {
        Self::Polynomial { degree: 2 }
    }

    #[must_use]
    pub fn degree(&self) -> usize {
        match self {
            Self::Linear => 1,
            Self::Polynomial { degree } => *degree,
        }
    }

    /// Minimum number of data points for the system to be well determined.
    #[must_use]
    pub fn min_points(&self) -> usize {
        self.degree() + 1
    }
}

/// Why one category produced no curve. Local to that category; the rest of
/// the batch is unaffected.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FitFailure {
    #[error("{found} usable data point(s), need at least {needed} for this model")]
    InsufficientData { needed: usize, found: usize },
    #[error("design matrix is singular or near-singular")]
    Singular,
    #[error("column '{column}' holds non-numeric values")]
    NonNumeric { column: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    Fitted,
    Failed(FitFailure),
}

/// The sampled curve for one category. On failure both sample vectors are
/// empty; on success they have `sample_count` entries and `x_samples` spans
/// [min(x), max(x)] of the partition, non-decreasing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryFit {
    pub category: Scalar,
    pub x_samples: Vec<f64>,
    pub y_samples: Vec<f64>,
    pub status: FitStatus,
}

impl CategoryFit {
    #[must_use]
    pub fn is_fitted(&self) -> bool {
        matches!(self.status, FitStatus::Fitted)
    }
}

/// Per-category fits in first-appearance order of the category values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FitResultSet {
    fits: Vec<CategoryFit>,
}

impl FitResultSet {
    #[must_use]
    pub fn fits(&self) -> &[CategoryFit] {
        &self.fits
    }

    #[must_use]
    pub fn get(&self, category: &Scalar) -> Option<&CategoryFit> {
        self.fits.iter().find(|fit| &fit.category == category)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CategoryFit> {
        self.fits.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fits.is_empty()
    }
}

impl IntoIterator for FitResultSet {
    type Item = CategoryFit;
    type IntoIter = std::vec::IntoIter<CategoryFit>;

    fn into_iter(self) -> Self::IntoIter {
        self.fits.into_iter()
    }
}

impl<'a> IntoIterator for &'a FitResultSet {
    type Item = &'a CategoryFit;
    type IntoIter = std::slice::Iter<'a, CategoryFit>;

    fn into_iter(self) -> Self::IntoIter {
        self.fits.iter()
    }
}

pub const DEFAULT_SAMPLE_COUNT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitOptions {
    /// Number of evenly spaced points in each sampled curve. Values below 2
    /// cannot span a range and are raised to 2.
    pub sample_count: usize,
    /// Skip rows whose category key is missing.
    pub dropna: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            sample_count: DEFAULT_SAMPLE_COUNT,
            dropna: true,
        }
    }
}

/// Partition rows by `category_column` and fit `model` to each partition's
/// `(x_column, y_column)` points independently.
///
/// Fails with [`FitError::ColumnNotFound`] naming every missing selector
/// before any category is processed. A failure inside one partition is
/// recorded in that partition's [`FitStatus`] and never aborts the others.
pub fn fit_per_category(
    frame: &Frame,
    x_column: &str,
    y_column: &str,
    category_column: &str,
    model: FitModel,
) -> Result<FitResultSet, FitError> {
    fit_per_category_with_options(
        frame,
        x_column,
        y_column,
        category_column,
        model,
        FitOptions::default(),
    )
}

pub fn fit_per_category_with_options(
    frame: &Frame,
    x_column: &str,
    y_column: &str,
    category_column: &str,
    model: FitModel,
    options: FitOptions,
) -> Result<FitResultSet, FitError> {
    let missing = frame.missing_columns(&[x_column, y_column, category_column]);
    if !missing.is_empty() {
        return Err(FitError::ColumnNotFound { columns: missing });
    }

    let x_values = frame
        .column(x_column)
        .expect("validated selector resolves")
        .values();
    let y_values = frame
        .column(y_column)
        .expect("validated selector resolves")
        .values();
    let cat_values = frame
        .column(category_column)
        .expect("validated selector resolves")
        .values();

    let partitions = partition_by_category(cat_values, options.dropna);

    let fits = partitions
        .into_iter()
        .map(|partition| {
            let category = cat_values[partition.first_row].clone();
            match fit_partition(
                x_values,
                y_values,
                &partition.rows,
                model,
                options.sample_count,
                x_column,
                y_column,
            ) {
                Ok((x_samples, y_samples)) => CategoryFit {
                    category,
                    x_samples,
                    y_samples,
                    status: FitStatus::Fitted,
                },
                Err(failure) => CategoryFit {
                    category,
                    x_samples: Vec::new(),
                    y_samples: Vec::new(),
                    status: FitStatus::Failed(failure),
                },
            }
        })
        .collect();

    Ok(FitResultSet { fits })
}

struct Partition {
    first_row: usize,
    rows: Vec<usize>,
}

/// Group row positions by category value, first-appearance order.
fn partition_by_category(cat_values: &[Scalar], dropna: bool) -> Vec<Partition> {
    let mut partitions = Vec::<Partition>::new();
    let mut slots = HashMap::<ScalarKey<'_>, usize>::new();

    for (row, key) in cat_values.iter().enumerate() {
        if dropna && key.is_missing() {
            continue;
        }
        let slot = *slots
            .entry(key.group_key())
            .or_insert_with(|| {
                partitions.push(Partition {
                    first_row: row,
                    rows: Vec::new(),
                });
                partitions.len() - 1
            });
        partitions[slot].rows.push(row);
    }

    partitions
}

/// Pure per-partition fit: extract the numeric point set, solve, sample.
fn fit_partition(
    x_values: &[Scalar],
    y_values: &[Scalar],
    rows: &[usize],
    model: FitModel,
    sample_count: usize,
    x_column: &str,
    y_column: &str,
) -> Result<(Vec<f64>, Vec<f64>), FitFailure> {
    let mut xs = Vec::with_capacity(rows.len());
    let mut ys = Vec::with_capacity(rows.len());

    for &row in rows {
        let (x, y) = (&x_values[row], &y_values[row]);
        if x.is_missing() || y.is_missing() {
            continue;
        }
        xs.push(x.to_f64().map_err(|_| FitFailure::NonNumeric {
            column: x_column.to_owned(),
        })?);
        ys.push(y.to_f64().map_err(|_| FitFailure::NonNumeric {
            column: y_column.to_owned(),
        })?);
    }

    if xs.len() < model.min_points() {
        return Err(FitFailure::InsufficientData {
            needed: model.min_points(),
            found: xs.len(),
        });
    }

    let coefficients = solve_least_squares(&xs, &ys, model.degree())?;

    let (min_x, max_x) = xs
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
            (lo.min(x), hi.max(x))
        });
    let x_samples = linspace(min_x, max_x, sample_count);
    let y_samples = x_samples
        .iter()
        .map(|&x| evaluate(&coefficients, x))
        .collect();

    Ok((x_samples, y_samples))
}

/// Least-squares fit of a degree-`degree` monomial polynomial via the
/// Vandermonde design matrix and SVD, with an epsilon cutoff scaled by
/// machine precision, matrix size, and the largest singular value. A
/// rank-deficient system (tied x values) is a failure rather than a
/// minimum-norm solution.
fn solve_least_squares(xs: &[f64], ys: &[f64], degree: usize) -> Result<Vec<f64>, FitFailure> {
    let n = xs.len();
    let k = degree + 1;

    let design = DMatrix::from_fn(n, k, |i, j| xs[i].powi(j as i32));
    let rhs = DVector::from_column_slice(ys);

    let svd = design.svd(true, true);
    let sigma_max = svd.singular_values.max();
    let epsilon = f64::EPSILON * n.max(k) as f64 * sigma_max;

    if svd.rank(epsilon) < k {
        return Err(FitFailure::Singular);
    }

    let solution = svd.solve(&rhs, epsilon).map_err(|_| FitFailure::Singular)?;
    let coefficients: Vec<f64> = solution.iter().copied().collect();
    if coefficients.iter().any(|c| !c.is_finite()) {
        return Err(FitFailure::Singular);
    }

    Ok(coefficients)
}

/// `count` evenly spaced points from `start` to `end` inclusive. The final
/// point is pinned to `end` so the samples span the range exactly.
fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    let count = count.max(2);
    let step = (end - start) / (count - 1) as f64;
    (0..count)
        .map(|i| {
            if i == count - 1 {
                end
            } else {
                start + step * i as f64
            }
        })
        .collect()
}

/// Horner evaluation; `coefficients[j]` multiplies `x^j`.
fn evaluate(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, &c| acc * x + c)
}

#[cfg(test)]
mod tests {
    use sp_frame::Frame;
    use sp_types::{NullKind, Scalar};

    use super::{
        FitError, FitFailure, FitModel, FitOptions, FitStatus, fit_per_category,
        fit_per_category_with_options, linspace, solve_least_squares,
    };

    fn utf8(v: &str) -> Scalar {
        Scalar::Utf8(v.to_owned())
    }

    fn points_frame(rows: &[(&str, f64, f64)]) -> Frame {
        let categories = rows.iter().map(|(c, _, _)| utf8(c)).collect();
        let xs = rows.iter().map(|(_, x, _)| Scalar::Float64(*x)).collect();
        let ys = rows.iter().map(|(_, _, y)| Scalar::Float64(*y)).collect();
        Frame::from_columns(vec![("cat", categories), ("x", xs), ("y", ys)]).expect("frame")
    }

    #[test]
    fn linear_fit_recovers_slope_and_intercept() {
        let frame = points_frame(&[
            ("C", 0.0, 0.0),
            ("C", 1.0, 2.0),
            ("C", 2.0, 4.0),
            ("C", 3.0, 6.0),
        ]);

        let results = fit_per_category_with_options(
            &frame,
            "x",
            "y",
            "cat",
            FitModel::Linear,
            FitOptions {
                sample_count: 3,
                dropna: true,
            },
        )
        .expect("fit");

        let fit = results.get(&utf8("C")).expect("category C");
        assert!(fit.is_fitted());
        assert_eq!(fit.x_samples, vec![0.0, 1.5, 3.0]);

        // y = 2x: sampled midpoint sits at 3.0.
        let slope = (fit.y_samples[2] - fit.y_samples[0]) / (fit.x_samples[2] - fit.x_samples[0]);
        assert!((slope - 2.0).abs() < 1e-9);
        assert!(fit.y_samples[0].abs() < 1e-9);
        assert!((fit.y_samples[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn quadratic_fit_reproduces_exact_parabola() {
        let frame = points_frame(&[
            ("P", 0.0, 0.0),
            ("P", 1.0, 1.0),
            ("P", 2.0, 4.0),
            ("P", 3.0, 9.0),
        ]);

        let results = fit_per_category_with_options(
            &frame,
            "x",
            "y",
            "cat",
            FitModel::quadratic(),
            FitOptions {
                sample_count: 4,
                dropna: true,
            },
        )
        .expect("fit");

        let fit = results.get(&utf8("P")).expect("category P");
        assert!(fit.is_fitted());
        for (x, y) in fit.x_samples.iter().zip(fit.y_samples.iter()) {
            assert!((y - x * x).abs() < 1e-8, "y({x}) was {y}");
        }
    }

    #[test]
    fn failure_in_one_category_leaves_others_fitted() {
        let mut rows = vec![("A", 0.0, 1.0), ("A", 1.0, 2.0)];
        for i in 0..10 {
            let x = f64::from(i);
            rows.push(("B", x, x * x - 3.0 * x + 2.0));
        }
        let frame = points_frame(&rows);

        let results =
            fit_per_category(&frame, "x", "y", "cat", FitModel::quadratic()).expect("fit");

        let a = results.get(&utf8("A")).expect("category A");
        assert_eq!(
            a.status,
            FitStatus::Failed(FitFailure::InsufficientData {
                needed: 3,
                found: 2
            })
        );
        assert!(a.x_samples.is_empty());
        assert!(a.y_samples.is_empty());

        let b = results.get(&utf8("B")).expect("category B");
        assert!(b.is_fitted());
        assert_eq!(b.x_samples.len(), 100);
        assert_eq!(b.y_samples.len(), 100);
    }

    #[test]
    fn tied_x_values_are_a_singular_failure() {
        let frame = points_frame(&[("T", 1.0, 2.0), ("T", 1.0, 3.0), ("T", 1.0, 4.0)]);

        let results = fit_per_category(&frame, "x", "y", "cat", FitModel::Linear).expect("fit");
        let fit = results.get(&utf8("T")).expect("category T");
        assert_eq!(fit.status, FitStatus::Failed(FitFailure::Singular));
    }

    #[test]
    fn first_appearance_order_is_preserved() {
        let frame = points_frame(&[
            ("late", 0.0, 0.0),
            ("early", 0.0, 0.0),
            ("late", 1.0, 1.0),
            ("early", 1.0, 1.0),
        ]);

        let results = fit_per_category(&frame, "x", "y", "cat", FitModel::Linear).expect("fit");
        let order: Vec<&Scalar> = results.iter().map(|fit| &fit.category).collect();
        assert_eq!(order, vec![&utf8("late"), &utf8("early")]);
    }

    #[test]
    fn missing_selectors_fail_before_processing() {
        let frame = points_frame(&[("A", 0.0, 0.0)]);
        let err =
            fit_per_category(&frame, "x", "wye", "kat", FitModel::Linear).expect_err("must fail");
        let FitError::ColumnNotFound { columns } = err;
        assert_eq!(columns, vec!["wye".to_owned(), "kat".to_owned()]);
    }

    #[test]
    fn missing_points_are_dropped_before_the_size_check() {
        let frame = Frame::from_columns(vec![
            ("cat", vec![utf8("A"), utf8("A"), utf8("A")]),
            (
                "x",
                vec![
                    Scalar::Float64(0.0),
                    Scalar::Float64(f64::NAN),
                    Scalar::Float64(2.0),
                ],
            ),
            (
                "y",
                vec![
                    Scalar::Float64(0.0),
                    Scalar::Float64(1.0),
                    Scalar::Null(NullKind::Null),
                ],
            ),
        ])
        .expect("frame");

        let results = fit_per_category(&frame, "x", "y", "cat", FitModel::Linear).expect("fit");
        let fit = results.get(&utf8("A")).expect("category A");
        assert_eq!(
            fit.status,
            FitStatus::Failed(FitFailure::InsufficientData {
                needed: 2,
                found: 1
            })
        );
    }

    #[test]
    fn non_numeric_column_is_a_per_category_failure() {
        let frame = Frame::from_columns(vec![
            ("cat", vec![utf8("A"), utf8("A")]),
            ("x", vec![utf8("one"), utf8("two")]),
            ("y", vec![Scalar::Float64(1.0), Scalar::Float64(2.0)]),
        ])
        .expect("frame");

        let results = fit_per_category(&frame, "x", "y", "cat", FitModel::Linear).expect("fit");
        let fit = results.get(&utf8("A")).expect("category A");
        assert_eq!(
            fit.status,
            FitStatus::Failed(FitFailure::NonNumeric {
                column: "x".to_owned()
            })
        );
    }

    #[test]
    fn dropna_false_fits_the_null_category() {
        let frame = Frame::from_columns(vec![
            (
                "cat",
                vec![Scalar::Null(NullKind::Null), Scalar::Null(NullKind::Null)],
            ),
            ("x", vec![Scalar::Float64(0.0), Scalar::Float64(1.0)]),
            ("y", vec![Scalar::Float64(0.0), Scalar::Float64(1.0)]),
        ])
        .expect("frame");

        let results = fit_per_category_with_options(
            &frame,
            "x",
            "y",
            "cat",
            FitModel::Linear,
            FitOptions {
                sample_count: 2,
                dropna: false,
            },
        )
        .expect("fit");

        assert_eq!(results.len(), 1);
        assert!(results.fits()[0].is_fitted());
    }

    #[test]
    fn sample_count_below_two_is_clamped() {
        let samples = linspace(0.0, 10.0, 0);
        assert_eq!(samples, vec![0.0, 10.0]);
    }

    #[test]
    fn linspace_spans_the_range_inclusively() {
        let samples = linspace(-1.0, 2.0, 7);
        assert_eq!(samples.len(), 7);
        assert_eq!(samples[0], -1.0);
        assert_eq!(samples[6], 2.0);
        for pair in samples.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
    }

    #[test]
    fn degenerate_range_produces_constant_samples() {
        let samples = linspace(4.0, 4.0, 5);
        assert!(samples.iter().all(|&x| x == 4.0));
    }

    #[test]
    fn least_squares_matches_known_line() {
        let xs = [1.0, 2.0, 3.0, 4.0, 5.0];
        let ys = [3.0, 5.0, 7.0, 9.0, 11.0];
        let coefficients = solve_least_squares(&xs, &ys, 1).expect("solve");
        assert!((coefficients[0] - 1.0).abs() < 1e-9);
        assert!((coefficients[1] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn linear_model_needs_two_points_quadratic_three() {
        assert_eq!(FitModel::Linear.min_points(), 2);
        assert_eq!(FitModel::quadratic().min_points(), 3);
    }
}
