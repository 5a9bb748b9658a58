// Linear logistic model used for inference

use ndarray::Array1;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Failed to read model {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed model parameters: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid model parameters: {0}")]
    Invalid(String),

    #[error("Model expects {expected} features, got {actual}")]
    FeatureMismatch { expected: usize, actual: usize },
}

pub type ModelResult<T> = Result<T, ModelError>;

// Fitted attributes as written by the training side. Unknown keys are ignored.
#[derive(Debug, Deserialize)]
struct ModelFile {
    coef_: Vec<Vec<f64>>,
    intercept_: Vec<f64>,
    #[serde(default)]
    classes_: Option<Vec<serde_json::Value>>,
}

/// Binary logistic regression: P(class 1) = sigmoid(w · x + b)
#[derive(Debug, Clone, PartialEq)]
pub struct LogisticModel {
    coefficients: Array1<f64>,
    intercept: f64,
}

impl LogisticModel {
    pub fn new(coefficients: Array1<f64>, intercept: f64) -> Self {
        Self {
            coefficients,
            intercept,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> ModelResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Parse the parameter blob, replacing any previous parameters wholesale
    pub fn from_json(text: &str) -> ModelResult<Self> {
        let file: ModelFile = serde_json::from_str(text)?;

        let [row] = <[Vec<f64>; 1]>::try_from(file.coef_).map_err(|rows| {
            ModelError::Invalid(format!("coef_ must have one row, got {}", rows.len()))
        })?;
        let [intercept] = <[f64; 1]>::try_from(file.intercept_).map_err(|values| {
            ModelError::Invalid(format!(
                "intercept_ must have one value, got {}",
                values.len()
            ))
        })?;
        if let Some(classes) = &file.classes_ {
            if classes.len() != 2 {
                return Err(ModelError::Invalid(format!(
                    "expected a binary model, got {} classes",
                    classes.len()
                )));
            }
        }
        if row.iter().any(|w| !w.is_finite()) || !intercept.is_finite() {
            return Err(ModelError::Invalid(
                "parameters must be finite".to_string(),
            ));
        }

        Ok(Self::new(Array1::from(row), intercept))
    }

    pub fn feature_count(&self) -> usize {
        self.coefficients.len()
    }

    /// Fail unless the model was trained on `features` inputs
    pub fn check_features(&self, features: usize) -> ModelResult<()> {
        if features != self.feature_count() {
            return Err(ModelError::FeatureMismatch {
                expected: self.feature_count(),
                actual: features,
            });
        }
        Ok(())
    }

    pub fn decision_function(&self, x: &Array1<f64>) -> ModelResult<f64> {
        self.check_features(x.len())?;
        Ok(self.coefficients.dot(x) + self.intercept)
    }

    /// Probability of the positive class
    pub fn predict_proba(&self, x: &Array1<f64>) -> ModelResult<f64> {
        Ok(sigmoid(self.decision_function(x)?))
    }
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}
