use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Invalid price for {symbol} at row {row}: {price}")]
    InvalidPrice { symbol: String, row: usize, price: f64 },

    #[error("Misaligned price series: {0}")]
    MisalignedSeries(String),

    #[error("Invalid input: {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Numerical error: {0}")]
    Numerical(String),

    #[error("Division by zero in {context}")]
    DivisionByZero { context: String },

    #[error("Target return {target:.6} is outside the reachable range [{min:.6}, {max:.6}]")]
    Infeasible { target: f64, min: f64, max: f64 },

    #[error("Optimization did not converge: {context} after {iterations} iterations")]
    DidNotConverge { context: String, iterations: usize },
}

impl AnalysisError {
    pub fn invalid_input(field: &str, reason: impl Into<String>) -> Self {
        AnalysisError::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Errors the frontier sweep recovers from by dropping the point.
    pub fn is_recoverable_for_frontier(&self) -> bool {
        matches!(
            self,
            AnalysisError::Infeasible { .. } | AnalysisError::DidNotConverge { .. }
        )
    }
}

pub type AnalysisResult<T> = Result<T, AnalysisError>;
