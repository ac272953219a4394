use gwsampler_core::geometry::sidereal_rotation;
use gwsampler_core::kde::{GridDensity, Support};
use gwsampler_core::math::wrap_two_pi;
use gwsampler_core::synthetic_phase;
use gwsampler_core::{importance, SyntheticPhaseSettings};
use num_complex::Complex64;
use numpy::{PyArray1, PyReadonlyArray1};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn to_py_err(e: gwsampler_core::Error) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn to_vec(arr: &PyReadonlyArray1<'_, f64>) -> Vec<f64> {
    arr.as_array().iter().copied().collect()
}

/// Piecewise-linear density on a grid, exposed for inspection and plotting.
#[pyclass(name = "GridDensity")]
struct PyGridDensity {
    inner: GridDensity,
}

#[pymethods]
impl PyGridDensity {
    #[new]
    #[pyo3(signature = (grid, log_weights, lower, upper, periodic=false, uniform_weight=0.01))]
    fn new(
        grid: PyReadonlyArray1<'_, f64>,
        log_weights: PyReadonlyArray1<'_, f64>,
        lower: f64,
        upper: f64,
        periodic: bool,
        uniform_weight: f64,
    ) -> PyResult<Self> {
        let support = Support::new(lower, upper, periodic).map_err(to_py_err)?;
        let inner =
            GridDensity::from_log_weights(&to_vec(&grid), &to_vec(&log_weights), support, uniform_weight)
                .map_err(to_py_err)?;
        Ok(Self { inner })
    }

    fn log_prob<'py>(
        &self,
        py: Python<'py>,
        x: PyReadonlyArray1<'_, f64>,
    ) -> Bound<'py, PyArray1<f64>> {
        let out: Vec<f64> = x.as_array().iter().map(|&v| self.inner.log_prob(v)).collect();
        PyArray1::from_vec(py, out)
    }

    #[pyo3(signature = (n, seed=42))]
    fn sample<'py>(&self, py: Python<'py>, n: usize, seed: u64) -> Bound<'py, PyArray1<f64>> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let out: Vec<f64> = (0..n).map(|_| self.inner.sample(&mut rng)).collect();
        PyArray1::from_vec(py, out)
    }

    fn __repr__(&self) -> String {
        let s = self.inner.support();
        format!(
            "GridDensity(support=[{:.4}, {:.4}], periodic={})",
            s.lower, s.upper, s.periodic
        )
    }
}

/// Phase draws from `<d, h(φ=0)>`; returns `(phase, delta_log_prob)`.
#[pyfunction]
#[pyo3(signature = (d_inner_h_real, d_inner_h_imag, n_grid=5001, uniform_weight=0.01, num_processes=1, seed=42))]
fn sample_synthetic_phase<'py>(
    py: Python<'py>,
    d_inner_h_real: PyReadonlyArray1<'_, f64>,
    d_inner_h_imag: PyReadonlyArray1<'_, f64>,
    n_grid: usize,
    uniform_weight: f64,
    num_processes: usize,
    seed: u64,
) -> PyResult<(Bound<'py, PyArray1<f64>>, Bound<'py, PyArray1<f64>>)> {
    let re = to_vec(&d_inner_h_real);
    let im = to_vec(&d_inner_h_imag);
    if re.len() != im.len() {
        return Err(PyValueError::new_err(format!(
            "real and imaginary parts differ in length ({} vs {})",
            re.len(),
            im.len()
        )));
    }
    let d_inner_h: Vec<Complex64> = re.into_iter().zip(im).map(|(r, i)| Complex64::new(r, i)).collect();
    let mut settings = SyntheticPhaseSettings::new(n_grid, uniform_weight);
    settings.num_processes = num_processes;

    let (phase, delta) = py
        .allow_threads(|| synthetic_phase::sample_synthetic_phase(&d_inner_h, &settings, seed))
        .map_err(to_py_err)?;
    Ok((PyArray1::from_vec(py, phase), PyArray1::from_vec(py, delta)))
}

/// Rotate right ascension between the reference-time and event-time frames.
#[pyfunction]
#[pyo3(signature = (ra, t_ref, t_event, inverse=false))]
fn correct_reference_time<'py>(
    py: Python<'py>,
    ra: PyReadonlyArray1<'_, f64>,
    t_ref: f64,
    t_event: f64,
    inverse: bool,
) -> Bound<'py, PyArray1<f64>> {
    let delta = sidereal_rotation(t_ref, t_event);
    let delta = if inverse { -delta } else { delta };
    let out: Vec<f64> = ra.as_array().iter().map(|&x| wrap_two_pi(x + delta)).collect();
    PyArray1::from_vec(py, out)
}

#[pyfunction]
fn importance_weights<'py>(
    py: Python<'py>,
    log_prior: PyReadonlyArray1<'_, f64>,
    log_likelihood: PyReadonlyArray1<'_, f64>,
    log_prob: PyReadonlyArray1<'_, f64>,
) -> PyResult<Bound<'py, PyDict>> {
    let result = importance::importance_weights(
        &to_vec(&log_prior),
        &to_vec(&log_likelihood),
        &to_vec(&log_prob),
    )
    .map_err(to_py_err)?;
    let dict = PyDict::new(py);
    dict.set_item("summary", result.to_table())?;
    dict.set_item("n_eff", result.n_eff)?;
    dict.set_item("sample_efficiency", result.sample_efficiency)?;
    dict.set_item("log_evidence", result.log_evidence)?;
    dict.set_item("log_evidence_std", result.log_evidence_std)?;
    dict.set_item("log_weights", PyArray1::from_vec(py, result.log_weights))?;
    dict.set_item("weights", PyArray1::from_vec(py, result.weights))?;
    Ok(dict)
}

#[pymodule]
fn gwsampler(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyGridDensity>()?;
    m.add_function(wrap_pyfunction!(sample_synthetic_phase, m)?)?;
    m.add_function(wrap_pyfunction!(correct_reference_time, m)?)?;
    m.add_function(wrap_pyfunction!(importance_weights, m)?)?;
    Ok(())
}
