use std::sync::Arc;

use distmath_core::bessel::I0e;
use distmath_core::bound::{self as constraint, BoundOptions, Condition};
use distmath_core::config::{parse_float_x, ModelConfig};
use distmath_core::error::DistMathError;
use distmath_core::mv_normal::MvNormalLogp;
use distmath_core::op::Op;
use distmath_core::sampling::par_clipped_beta_rvs;
use distmath_core::spline::{LinearSpline, SplineWrapper};
use distmath_core::tensor::{DType, Tensor};
use half::f16;
use ndarray::ArrayD;
use numpy::{IntoPyArray, PyReadonlyArrayDyn};
use pyo3::exceptions::{PyNotImplementedError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyTuple;

fn to_py_err(err: DistMathError) -> PyErr {
    match err {
        DistMathError::UnsupportedDerivativeOrder { .. } => {
            PyNotImplementedError::new_err(err.to_string())
        }
        _ => PyValueError::new_err(err.to_string()),
    }
}

/// Convert a Python bool, number, sequence or numpy array into a tensor.
///
/// Integer arrays and plain sequences become `float64` tensors.
fn extract_tensor(obj: &Bound<'_, PyAny>) -> PyResult<Tensor> {
    if let Ok(b) = obj.extract::<bool>() {
        return Ok(Tensor::from_bool(b));
    }
    if let Ok(arr) = obj.extract::<PyReadonlyArrayDyn<'_, bool>>() {
        let data = arr.as_array().mapv(|b| if b { 1.0 } else { 0.0 });
        return Ok(Tensor::new(data, DType::Bool));
    }
    if let Ok(arr) = obj.extract::<PyReadonlyArrayDyn<'_, f16>>() {
        return Ok(Tensor::new(arr.as_array().mapv(f16::to_f64), DType::Float16));
    }
    if let Ok(arr) = obj.extract::<PyReadonlyArrayDyn<'_, f32>>() {
        return Ok(Tensor::new(arr.as_array().mapv(f64::from), DType::Float32));
    }
    if let Ok(arr) = obj.extract::<PyReadonlyArrayDyn<'_, f64>>() {
        return Ok(Tensor::new(arr.as_array().to_owned(), DType::Float64));
    }
    if let Ok(arr) = obj.extract::<PyReadonlyArrayDyn<'_, i64>>() {
        return Ok(Tensor::new(arr.as_array().mapv(|v| v as f64), DType::Float64));
    }
    if let Ok(arr) = obj.extract::<PyReadonlyArrayDyn<'_, i32>>() {
        return Ok(Tensor::new(arr.as_array().mapv(f64::from), DType::Float64));
    }
    if let Ok(x) = obj.extract::<f64>() {
        return Ok(Tensor::scalar(x, DType::Float64));
    }
    // Lists, tuples and arrays of other numeric dtypes.
    let converted = PyModule::import(obj.py(), "numpy")?
        .getattr("asarray")?
        .call1((obj, "float64"))
        .map_err(|_| {
            PyValueError::new_err(format!(
                "expected a bool, number, sequence or numeric numpy array, got {}",
                obj.get_type()
            ))
        })?;
    let arr = converted.extract::<PyReadonlyArrayDyn<'_, f64>>()?;
    Ok(Tensor::new(arr.as_array().to_owned(), DType::Float64))
}

fn extract_condition(obj: &Bound<'_, PyAny>) -> PyResult<Condition> {
    if let Ok(b) = obj.extract::<bool>() {
        return Ok(Condition::Bool(b));
    }
    extract_tensor(obj).map(Condition::Tensor)
}

fn tensor_to_py(py: Python<'_>, tensor: Tensor) -> PyObject {
    let dtype = tensor.dtype();
    let data: ArrayD<f64> = tensor.into_data();
    match dtype {
        DType::Bool => data.mapv(|x| x != 0.0).into_pyarray(py).into_any().unbind(),
        DType::Float16 => data.mapv(f16::from_f64).into_pyarray(py).into_any().unbind(),
        DType::Float32 => data.mapv(|x| x as f32).into_pyarray(py).into_any().unbind(),
        DType::Float64 => data.into_pyarray(py).into_any().unbind(),
    }
}

fn upstream_or_ones(x: &Tensor, g: Option<&Bound<'_, PyAny>>) -> PyResult<Tensor> {
    match g {
        Some(g) => extract_tensor(g),
        None => Ok(Tensor::ones(x.shape(), x.dtype())),
    }
}

/// Mask `value` to `-inf` wherever a condition is false.
#[pyfunction]
#[pyo3(signature = (value, *conditions, broadcast_conditions=true))]
fn bound(
    py: Python<'_>,
    value: &Bound<'_, PyAny>,
    conditions: &Bound<'_, PyTuple>,
    broadcast_conditions: bool,
) -> PyResult<PyObject> {
    let config = ModelConfig::from_env().map_err(to_py_err)?;
    let options = BoundOptions {
        broadcast_conditions,
        ..BoundOptions::from_config(&config)
    };
    let value = extract_tensor(value)?;
    let conditions = conditions
        .iter()
        .map(|c| extract_condition(&c))
        .collect::<PyResult<Vec<_>>>()?;
    let out = constraint::bound(&value, &conditions, options).map_err(to_py_err)?;
    Ok(tensor_to_py(py, out))
}

/// True when every element of every condition in the sequence is truthy.
#[pyfunction]
fn alltrue_scalar(conditions: Vec<Bound<'_, PyAny>>) -> PyResult<bool> {
    let conditions = conditions
        .iter()
        .map(extract_condition)
        .collect::<PyResult<Vec<_>>>()?;
    let out = constraint::alltrue_scalar(&conditions);
    Ok(out.all_truthy())
}

#[pyfunction]
fn i0e(py: Python<'_>, x: &Bound<'_, PyAny>) -> PyResult<PyObject> {
    let x = extract_tensor(x)?;
    let mut out = I0e.forward(&[&x]).map_err(to_py_err)?;
    Ok(tensor_to_py(py, out.remove(0)))
}

/// `g * d i0e(x) / dx`, with `g` defaulting to ones.
#[pyfunction]
#[pyo3(signature = (x, g=None))]
fn i0e_grad(py: Python<'_>, x: &Bound<'_, PyAny>, g: Option<&Bound<'_, PyAny>>) -> PyResult<PyObject> {
    let x = extract_tensor(x)?;
    let g = upstream_or_ones(&x, g)?;
    let mut out = I0e.grad(&[&x], &[&g]).map_err(to_py_err)?;
    Ok(tensor_to_py(py, out.remove(0)))
}

#[pyfunction]
fn mv_normal_logp(py: Python<'_>, cov: &Bound<'_, PyAny>, delta: &Bound<'_, PyAny>) -> PyResult<f64> {
    let cov = extract_tensor(cov)?;
    let delta = extract_tensor(delta)?;
    let out = py
        .allow_threads(|| MvNormalLogp.forward(&[&cov, &delta]))
        .map_err(to_py_err)?;
    out[0].to_scalar().map_err(to_py_err)
}

/// Gradients `(d logp / d cov, d logp / d delta)`.
#[pyfunction]
fn mv_normal_logp_grad(
    py: Python<'_>,
    cov: &Bound<'_, PyAny>,
    delta: &Bound<'_, PyAny>,
) -> PyResult<(PyObject, PyObject)> {
    let cov = extract_tensor(cov)?;
    let delta = extract_tensor(delta)?;
    let seed = Tensor::ones(&[], cov.dtype().upcast(delta.dtype()));
    let mut grads = py
        .allow_threads(|| MvNormalLogp.grad(&[&cov, &delta], &[&seed]))
        .map_err(to_py_err)?;
    let g_delta = grads.remove(1);
    let g_cov = grads.remove(0);
    Ok((tensor_to_py(py, g_cov), tensor_to_py(py, g_delta)))
}

/// Piecewise-linear interpolant usable as a differentiable elementwise op.
#[pyclass(name = "LinearSpline")]
struct PyLinearSpline {
    inner: Arc<LinearSpline>,
}

#[pymethods]
impl PyLinearSpline {
    #[new]
    fn new(knots: Vec<f64>, values: Vec<f64>) -> PyResult<Self> {
        let inner = LinearSpline::new(knots, values).map_err(to_py_err)?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    fn __call__(&self, py: Python<'_>, x: &Bound<'_, PyAny>) -> PyResult<PyObject> {
        let x = extract_tensor(x)?;
        let op = SplineWrapper::new(self.inner.clone());
        let mut out = op.forward(&[&x]).map_err(to_py_err)?;
        Ok(tensor_to_py(py, out.remove(0)))
    }

    #[pyo3(signature = (x, g=None))]
    fn grad(&self, py: Python<'_>, x: &Bound<'_, PyAny>, g: Option<&Bound<'_, PyAny>>) -> PyResult<PyObject> {
        let x = extract_tensor(x)?;
        let g = upstream_or_ones(&x, g)?;
        let op = SplineWrapper::new(self.inner.clone());
        let mut out = op.grad(&[&x], &[&g]).map_err(to_py_err)?;
        Ok(tensor_to_py(py, out.remove(0)))
    }

    /// Second derivative. Raises `NotImplementedError`: the interpolant
    /// only exposes a first derivative.
    fn hessian(&self, py: Python<'_>, x: &Bound<'_, PyAny>) -> PyResult<PyObject> {
        let x = extract_tensor(x)?;
        let ones = Tensor::ones(x.shape(), x.dtype());
        let first = SplineWrapper::new(self.inner.clone())
            .grad_op()
            .map_err(to_py_err)?;
        let mut out = first.grad(&[&x, &ones], &[&ones]).map_err(to_py_err)?;
        Ok(tensor_to_py(py, out.remove(0)))
    }

    fn __repr__(&self) -> String {
        let knots = self.inner.knots();
        format!(
            "LinearSpline({} knots on [{}, {}])",
            knots.len(),
            knots[0],
            knots[knots.len() - 1]
        )
    }
}

/// Beta samples clipped strictly inside `(0, 1)` at the requested dtype.
#[pyfunction]
#[pyo3(signature = (alpha, beta, size=None, dtype=None, seed=None))]
fn clipped_beta_rvs(
    py: Python<'_>,
    alpha: f64,
    beta: f64,
    size: Option<&Bound<'_, PyAny>>,
    dtype: Option<&str>,
    seed: Option<u64>,
) -> PyResult<PyObject> {
    let shape: Vec<usize> = match size {
        None => Vec::new(),
        Some(s) => match s.extract::<usize>() {
            Ok(n) => vec![n],
            Err(_) => s.extract()?,
        },
    };
    let dtype = match dtype {
        Some(name) => parse_float_x("dtype", name).map_err(to_py_err)?,
        None => ModelConfig::from_env().map_err(to_py_err)?.float_x,
    };
    let seed = seed.unwrap_or_else(rand::random);

    let out = py
        .allow_threads(|| par_clipped_beta_rvs(alpha, beta, &shape, dtype, seed))
        .map_err(to_py_err)?;
    Ok(tensor_to_py(py, out))
}

#[pymodule]
fn distmath(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyLinearSpline>()?;
    m.add_function(wrap_pyfunction!(bound, m)?)?;
    m.add_function(wrap_pyfunction!(alltrue_scalar, m)?)?;
    m.add_function(wrap_pyfunction!(i0e, m)?)?;
    m.add_function(wrap_pyfunction!(i0e_grad, m)?)?;
    m.add_function(wrap_pyfunction!(mv_normal_logp, m)?)?;
    m.add_function(wrap_pyfunction!(mv_normal_logp_grad, m)?)?;
    m.add_function(wrap_pyfunction!(clipped_beta_rvs, m)?)?;
    Ok(())
}
