#![forbid(unsafe_code)]

//! Shared fixtures for the cross-crate integration and property suites.
//!
//! Builders produce the small labeled tables the end-to-end scenarios walk
//! through; keeping them here lets the aggregation and fitting suites agree
//! on the exact same inputs.

use sp_frame::Frame;
use sp_types::Scalar;

fn utf8(v: &str) -> Scalar {
    Scalar::Utf8(v.to_owned())
}

/// Build a two-column categorical table from `(category, group)` rows.
#[must_use]
pub fn observations(rows: &[(&str, &str)]) -> Frame {
    let categories = rows.iter().map(|(c, _)| utf8(c)).collect();
    let groups = rows.iter().map(|(_, g)| utf8(g)).collect();
    Frame::from_columns(vec![("Category", categories), ("Group", groups)])
        .expect("fixture columns are well formed")
}

/// Build a three-column table from `(category, x, y)` rows.
#[must_use]
pub fn xy_observations(rows: &[(&str, f64, f64)]) -> Frame {
    let categories = rows.iter().map(|(c, _, _)| utf8(c)).collect();
    let xs = rows.iter().map(|(_, x, _)| Scalar::Float64(*x)).collect();
    let ys = rows.iter().map(|(_, _, y)| Scalar::Float64(*y)).collect();
    Frame::from_columns(vec![("Category", categories), ("x", xs), ("y", ys)])
        .expect("fixture columns are well formed")
}

/// 10x (A, Red) + 30x (A, Blue) + 20x (B, Red): the canonical distribution
/// scenario, expected to normalize to A = {Red 25, Blue 75}, B = {Red 100,
/// Blue 0}.
#[must_use]
pub fn survey_frame() -> Frame {
    let mut rows = Vec::with_capacity(60);
    rows.extend(std::iter::repeat_n(("A", "Red"), 10));
    rows.extend(std::iter::repeat_n(("A", "Blue"), 30));
    rows.extend(std::iter::repeat_n(("B", "Red"), 20));
    observations(&rows)
}

/// Category C on an exact y = 2x line plus category A with only two points,
/// the canonical per-category fitting scenario.
#[must_use]
pub fn trend_frame() -> Frame {
    xy_observations(&[
        ("C", 0.0, 0.0),
        ("C", 1.0, 2.0),
        ("C", 2.0, 4.0),
        ("C", 3.0, 6.0),
        ("A", 0.0, 1.0),
        ("A", 1.0, 3.0),
    ])
}

#[must_use]
pub fn approx_eq(left: f64, right: f64, tolerance: f64) -> bool {
    (left - right).abs() <= tolerance
}
