use cpython::{exc, PyBytes, PyErr, PyResult, Python};

use crate::{CollectiveKind, DType, DeviceCluster, DeviceGroupTopology, Error, LocalOrchestrator, ProfilingResult};

fn to_py_err(py: Python, e: Error) -> PyErr {
    PyErr::new::<exc::RuntimeError, _>(py, e.to_string())
}

fn profile(kind: &str, size_range: Vec<u32>, dtype: &str, num_devices: Option<usize>) -> crate::Result<Vec<u8>> {
    let kind: CollectiveKind = kind.parse()?;
    let dtype: DType = dtype.parse()?;
    let cluster = match num_devices {
        None => DeviceCluster::new()?,
        Some(n) => DeviceCluster::connect(std::sync::Arc::new(LocalOrchestrator::with_devices(n)))?
    };
    let mesh = cluster.get_physical_mesh(None, None)?;
    mesh.profile_collective(kind, size_range, dtype, false)?;
    let bytes = mesh.prof_result().serialize();
    mesh.shutdown();
    bytes
}

fn estimate(blob: &[u8], kind: &str, topology: Vec<Vec<usize>>, size: u64, dtype: &str) -> crate::Result<f64> {
    let result = ProfilingResult::deserialize(blob)?;
    result.estimate(kind.parse()?, &DeviceGroupTopology::new(topology)?, size, dtype.parse()?)
}

cpython::py_module_initializer!(meshprof, |py, m| {
    if let Err(e) = crate::trap_ctrlc() {
        log::warn!("cannot trap ctrl-c: {e}");
    }

    // without num_devices every local device is profiled
    m.add(py, "profile_collective", cpython::py_fn!(py, py_profile_collective(kind: String, size_range: Vec<u32>, dtype: String = String::from("float32"), num_devices: Option<usize> = None) -> PyResult<PyBytes> {
        let bytes = py.allow_threads(|| profile(&kind, size_range, &dtype, num_devices)).map_err(|e| to_py_err(py, e))?;
        Ok(PyBytes::new(py, &bytes))
    }))?;

    m.add(py, "estimate", cpython::py_fn!(py, py_estimate(blob: PyBytes, kind: String, topology: Vec<Vec<usize>>, size: u64, dtype: String) -> PyResult<f64> {
        estimate(blob.data(py), &kind, topology, size, &dtype).map_err(|e| to_py_err(py, e))
    }))?;

    Ok(())
});
