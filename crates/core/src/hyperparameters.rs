//! Hyperparameter expansion and grid generation.
//!
//! [`expand`] flattens specs into single-value assignments for up-front
//! validation; [`grid`] builds the cartesian product that drives one
//! batch per combination.

use crate::error::CoreError;
use crate::types::{HyperparameterSpec, ParamAssignment};

/// One concrete combination in the grid, one assignment per spec.
pub type GridPoint = Vec<ParamAssignment>;

/// Flatten `specs` into one assignment per candidate value.
///
/// Entries keep spec order, then value order. Only meant for validating
/// every value before execution, never for driving runs.
pub fn expand(specs: &[HyperparameterSpec]) -> Vec<ParamAssignment> {
    specs
        .iter()
        .flat_map(|spec| (0..spec.values.len()).filter_map(move |i| spec.assignment(i)))
        .collect()
}

/// Cartesian product of all specs in row-major order.
///
/// The last spec varies fastest, so point numbering is stable across
/// runs. An empty `specs` yields a single empty point; a spec with no
/// values yields no points at all (see [`validate_specs`]).
pub fn grid(specs: &[HyperparameterSpec]) -> Vec<GridPoint> {
    specs.iter().fold(vec![Vec::new()], |points, spec| {
        points
            .iter()
            .flat_map(|prefix| {
                (0..spec.values.len()).filter_map(move |i| {
                    spec.assignment(i).map(|assignment| {
                        let mut point = prefix.clone();
                        point.push(assignment);
                        point
                    })
                })
            })
            .collect()
    })
}

/// Number of points [`grid`] will produce, without building them.
pub fn grid_size(specs: &[HyperparameterSpec]) -> usize {
    specs.iter().map(|spec| spec.values.len()).product()
}

/// Reject specs that cannot contribute to a search.
///
/// Rules:
/// - At least one spec.
/// - Every spec names a node and an input.
/// - Every spec has at least one candidate value.
pub fn validate_specs(specs: &[HyperparameterSpec]) -> Result<(), CoreError> {
    if specs.is_empty() {
        return Err(CoreError::Validation(
            "No hyperparameters provided".to_string(),
        ));
    }
    for (i, spec) in specs.iter().enumerate() {
        if spec.target_name.is_empty() || spec.input_name.is_empty() {
            return Err(CoreError::Validation(format!(
                "Hyperparameter at index {i} must name a node and an input"
            )));
        }
        if spec.values.is_empty() {
            return Err(CoreError::Validation(format!(
                "Hyperparameter {}.{} has no values",
                spec.target_name, spec.input_name
            )));
        }
    }
    Ok(())
}
