//! Least-squares model fitting on top of a solve session.
//!
//! The model is an ordinary closure over [`Value`]s, so the same code is
//! solved symbolically for the parameters and then re-evaluated concretely
//! for the goodness-of-fit statistics.

use std::collections::BTreeMap;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::session::{Declaration, Session};
use crate::solvers::SolveOptions;
use crate::value::{Shape, Value};

/// Named model inputs: data columns or parameters.
pub type Inputs = BTreeMap<String, Value>;

/// Optional `(lower, upper)` bounds per parameter; either side may be open.
pub type ParamBounds = BTreeMap<String, (Option<f64>, Option<f64>)>;

/// Parameter tables longer than this are summarized by count when logging.
const MAX_LOGGED_PARAMETERS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitReport {
    pub parameters: BTreeMap<String, f64>,
    /// `sqrt(sum(w * r^2))` with normalized weights.
    pub weighted_rms_error: f64,
    /// `1 - SS_res / SS_tot`, both sums weighted. NaN for constant data.
    pub r_squared: f64,
    pub iterations: usize,
}

/// Fits `model(x, p)` to `y_data` by weighted least squares.
///
/// `x_data` columns must all have `y_data.len()` points. Weights default to
/// uniform and are normalized to sum to one. `param_bounds` may name any
/// subset of the parameters in `param_guesses`.
pub fn fit<M>(
    model: M,
    x_data: &BTreeMap<String, Vec<f64>>,
    y_data: &[f64],
    param_guesses: &BTreeMap<String, f64>,
    param_bounds: &ParamBounds,
    weights: Option<&[f64]>,
    options: &SolveOptions,
) -> Result<FitReport>
where
    M: Fn(&Inputs, &Inputs) -> Result<Value>,
{
    let n = y_data.len();
    if n == 0 {
        return Err(Error::InvalidArgument {
            operation: "fit",
            reason: "no data points".to_string(),
        });
    }
    for (name, column) in x_data {
        if column.len() != n {
            return Err(Error::InvalidArgument {
                operation: "fit",
                reason: format!(
                    "x_data column `{name}` has {} points, expected {n}",
                    column.len()
                ),
            });
        }
    }
    if let Some(unknown) = param_bounds.keys().find(|k| !param_guesses.contains_key(*k)) {
        return Err(Error::InvalidArgument {
            operation: "fit",
            reason: format!("bounds given for unknown parameter `{unknown}`"),
        });
    }
    let weights = normalized_weights(weights, n)?;

    let x: Inputs = x_data
        .iter()
        .map(|(name, column)| (name.clone(), Value::vector(column.clone())))
        .collect();
    let y = Value::vector(y_data.to_vec());

    let session = Session::new();
    let mut params = Inputs::new();
    for (name, &guess) in param_guesses {
        let mut declaration = Declaration::scalar(name.clone(), guess);
        if let Some(&(lower, upper)) = param_bounds.get(name) {
            declaration.lower = lower;
            declaration.upper = upper;
        }
        params.insert(name.clone(), session.declare_variable(declaration)?);
    }

    let y_model = model(&x, &params)?;
    check_model_shape(&y_model, n)?;
    let sqrt_weights = Value::vector(weights.iter().map(|w| w.sqrt()).collect::<Vec<_>>());
    session.add_least_squares(&y_model.sub(&y)?.mul(&sqrt_weights)?)?;
    let report = session.solve(options)?;

    let mut parameters = BTreeMap::new();
    let mut concrete_params = Inputs::new();
    for (name, param) in &params {
        let value = session.value_of(param)?;
        parameters.insert(name.clone(), value.to_f64()?);
        concrete_params.insert(name.clone(), value);
    }
    session.close();

    let fitted = model(&x, &concrete_params)?;
    check_model_shape(&fitted, n)?;
    let fitted = broadcast_to(&fitted.to_vec()?, n);
    let (weighted_rms_error, r_squared) = goodness_of_fit(&fitted, y_data, &weights);

    if options.verbose {
        info!("Fit parameters:");
        if parameters.len() <= MAX_LOGGED_PARAMETERS {
            for (name, value) in &parameters {
                info!("    {name}: {value:.6}");
            }
        } else {
            info!("    {} parameters solved for.", parameters.len());
        }
        info!("Goodness of fit:");
        info!("    Weighted RMS error: {weighted_rms_error:.6}");
        info!("    R^2: {r_squared:.6}");
    } else {
        debug!(
            "fit: {} parameters, RMS {weighted_rms_error:.3e}, R^2 {r_squared:.6}",
            parameters.len()
        );
    }

    Ok(FitReport {
        parameters,
        weighted_rms_error,
        r_squared,
        iterations: report.iterations,
    })
}

fn normalized_weights(weights: Option<&[f64]>, n: usize) -> Result<Vec<f64>> {
    let raw = match weights {
        Some(w) if w.len() != n => {
            return Err(Error::InvalidArgument {
                operation: "fit",
                reason: format!("{} weights for {n} data points", w.len()),
            })
        }
        Some(w) => w.to_vec(),
        None => vec![1.0; n],
    };
    if raw.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(Error::InvalidArgument {
            operation: "fit",
            reason: "weights must be finite and non-negative".to_string(),
        });
    }
    let total: f64 = raw.iter().sum();
    if total <= 0.0 {
        return Err(Error::InvalidArgument {
            operation: "fit",
            reason: "weights sum to zero".to_string(),
        });
    }
    Ok(raw.into_iter().map(|w| w / total).collect())
}

fn check_model_shape(y_model: &Value, n: usize) -> Result<()> {
    match y_model.shape() {
        Shape::Scalar => Ok(()),
        Shape::Vector(len) if len == n => Ok(()),
        shape => Err(Error::ShapeMismatch {
            operation: "fit",
            left: shape,
            right: Shape::Vector(n),
        }),
    }
}

fn broadcast_to(values: &[f64], n: usize) -> Vec<f64> {
    if values.len() == 1 {
        vec![values[0]; n]
    } else {
        values.to_vec()
    }
}

fn goodness_of_fit(fitted: &[f64], y_data: &[f64], weights: &[f64]) -> (f64, f64) {
    let y_mean = y_data.iter().sum::<f64>() / y_data.len() as f64;
    let ss_res: f64 = fitted
        .iter()
        .zip(y_data)
        .zip(weights)
        .map(|((f, y), w)| w * (y - f).powi(2))
        .sum();
    let ss_tot: f64 = y_data
        .iter()
        .zip(weights)
        .map(|(y, w)| w * (y - y_mean).powi(2))
        .sum();
    let r_squared = if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else {
        f64::NAN
    };
    (ss_res.sqrt(), r_squared)
}
