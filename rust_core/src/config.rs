use crate::error::{DistMathError, DistMathResult};
use crate::tensor::DType;

const CHECK_BOUNDS_VAR: &str = "DISTMATH_CHECK_BOUNDS";
const FLOATX_VAR: &str = "DISTMATH_FLOATX";

/// Model-wide settings read by the primitives while a graph is built.
///
/// A `ModelConfig` is fixed when the owning [`Graph`](crate::graph::Graph)
/// is created and is only read afterwards, so compiled functions can be
/// evaluated from several threads without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelConfig {
    /// When false, `bound` returns its value untouched.
    pub check_bounds: bool,
    /// Default dtype for constants built from plain `f64`s.
    pub float_x: DType,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            check_bounds: true,
            float_x: DType::Float64,
        }
    }
}

impl ModelConfig {
    /// Defaults overridden by `DISTMATH_CHECK_BOUNDS` and `DISTMATH_FLOATX`.
    pub fn from_env() -> DistMathResult<Self> {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var(CHECK_BOUNDS_VAR) {
            config.check_bounds = parse_flag(CHECK_BOUNDS_VAR, &raw)?;
        }
        if let Ok(raw) = std::env::var(FLOATX_VAR) {
            config.float_x = parse_float_x(FLOATX_VAR, &raw)?;
        }
        Ok(config)
    }

    pub fn with_check_bounds(mut self, check_bounds: bool) -> Self {
        self.check_bounds = check_bounds;
        self
    }

    pub fn with_float_x(mut self, float_x: DType) -> Self {
        self.float_x = float_x;
        self
    }
}

fn parse_flag(key: &'static str, raw: &str) -> DistMathResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(DistMathError::InvalidConfig {
            key,
            value: raw.to_string(),
        }),
    }
}

/// Parse a float dtype name (`float16`, `float32` or `float64`).
pub fn parse_float_x(key: &'static str, raw: &str) -> DistMathResult<DType> {
    match raw.trim() {
        "float16" => Ok(DType::Float16),
        "float32" => Ok(DType::Float32),
        "float64" => Ok(DType::Float64),
        _ => Err(DistMathError::InvalidConfig {
            key,
            value: raw.to_string(),
        }),
    }
}
