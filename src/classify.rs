use crate::error::{VizError, VizResult};
use crate::types::{ClassBreakResult, ClassMethod};

pub const MIN_CLASSES: usize = 3;
pub const MAX_CLASSES: usize = 9;
/// Bivariate maps are always 3x3, whatever class count the caller asked for.
pub const BIVARIATE_CLASSES: usize = 3;

/// Check method and class count before any work is done.
pub fn validate(class_count: usize, method: &str) -> VizResult<ClassMethod> {
    let method: ClassMethod = method.parse()?;
    if !(MIN_CLASSES..=MAX_CLASSES).contains(&class_count) {
        return Err(VizError::unsupported(format!(
            "only {}-{} classes supported, got {}",
            MIN_CLASSES, MAX_CLASSES, class_count
        )));
    }
    Ok(method)
}

/// Class breaks for one variable, or two independently classified variables
/// when `values2` is given.
pub fn class_breaks(
    class_count: usize,
    method: &str,
    values1: &[f64],
    values2: Option<&[f64]>,
) -> VizResult<Vec<ClassBreakResult>> {
    let method: ClassMethod = method.parse()?;
    match values2 {
        None => {
            validate(class_count, "quantile")?;
            Ok(vec![breaks_for(method, values1, class_count)?])
        }
        Some(values2) => Ok(vec![
            breaks_for(method, values1, BIVARIATE_CLASSES)?,
            breaks_for(method, values2, BIVARIATE_CLASSES)?,
        ]),
    }
}

fn breaks_for(method: ClassMethod, values: &[f64], class_count: usize) -> VizResult<ClassBreakResult> {
    if values.is_empty() {
        return Err(VizError::insufficient_data("no values to classify"));
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let breaks = match method {
        ClassMethod::Quantile => quantile_breaks(&sorted, class_count),
    };
    Ok(ClassBreakResult {
        min_val: sorted[0],
        breaks,
    })
}

/// Upper bounds of `class_count` equal-count classes over `sorted`.
/// Break `i` is the value at rank `ceil(i * n / k)`, so the last is the maximum.
fn quantile_breaks(sorted: &[f64], class_count: usize) -> Vec<f64> {
    let n = sorted.len();
    (1..=class_count)
        .map(|i| {
            let rank = (i * n).div_ceil(class_count);
            sorted[rank.clamp(1, n) - 1]
        })
        .collect()
}
