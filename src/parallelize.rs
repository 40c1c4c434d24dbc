//! Binding an elementwise function to a mesh.
//!
//! `parallelize(f).devices(&mesh).build()` gives a function that splits its input into contiguous shards,
//! runs `f` on every device and reassembles the result. The output equals `f` mapped over the input.

use std::sync::Arc;

use log::debug;

use crate::collective::{CollectiveKind, DType, DeviceGroupTopology};
use crate::mesh::PhysicalMesh;
use crate::worker::Kernel;
use crate::{Error, Result, SVec};

#[derive(Clone, Debug, PartialEq)]
pub struct Array {
    shape: SVec<usize>,
    data: Vec<f32>,
}

impl Array {
    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Array> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::invalid(format!("{} elements do not fill shape {shape:?}", data.len())))
        }
        Ok(Array { shape: SVec::from_slice(shape), data })
    }

    pub fn full(shape: &[usize], value: f32) -> Array {
        Array { shape: SVec::from_slice(shape), data: vec![value; shape.iter().product()] }
    }

    /// 1-d array of `n` ones
    pub fn ones(n: usize) -> Array {
        Self::full(&[n], 1.)
    }

    pub fn zeros(n: usize) -> Array {
        Self::full(&[n], 0.)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }
}

pub fn parallelize<F>(f: F) -> Parallelize<'static, F> where F: Fn(f32) -> f32 + Send + Sync + 'static {
    Parallelize { f, mesh: None }
}

pub struct Parallelize<'m, F> {
    f: F,
    mesh: Option<&'m PhysicalMesh>,
}

impl<'m, F> Parallelize<'m, F> where F: Fn(f32) -> f32 + Send + Sync + 'static {
    pub fn devices<'n>(self, mesh: &'n PhysicalMesh) -> Parallelize<'n, F> {
        Parallelize { f: self.f, mesh: Some(mesh) }
    }

    pub fn build(self) -> Result<ParallelFunction<'m>> {
        let mesh = self.mesh.ok_or_else(|| Error::invalid("parallelize needs a mesh, call devices() first"))?;
        Ok(ParallelFunction { kernel: Arc::new(self.f), mesh })
    }
}

pub struct ParallelFunction<'m> {
    kernel: Kernel,
    mesh: &'m PhysicalMesh,
}

impl ParallelFunction<'_> {
    pub fn mesh(&self) -> &PhysicalMesh {
        self.mesh
    }

    pub fn call(&self, x: &Array) -> Result<Array> {
        let n = self.mesh.num_devices();
        let (base, extra) = (x.len() / n, x.len() % n);

        let mut shards = Vec::with_capacity(n);
        let mut start = 0;
        for i in 0..n {
            let len = base + usize::from(i < extra);
            shards.push(x.data[start..start + len].to_vec());
            start += len;
        }

        if let Ok(seconds) = self.gather_cost(x) {
            debug!("reassembling {} elements is estimated at {seconds:.6}s", x.len());
        }

        let data: Vec<f32> = self.mesh.run_sharded(&self.kernel, shards)?.into_iter().flatten().collect();
        Array::from_vec(data, &x.shape)
    }

    /// Profiled cost of gathering an output the size of `x` across the whole mesh.
    pub fn gather_cost(&self, x: &Array) -> Result<f64> {
        let topology = DeviceGroupTopology::single(self.mesh.num_devices())?;
        let bytes = (x.len() * DType::Float32.width()) as u64;
        self.mesh.prof_result().estimate(CollectiveKind::AllGather, &topology, bytes.max(1), DType::Float32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_shapes_are_checked() {
        assert!(Array::from_vec(vec![1., 2., 3.], &[2, 2]).is_err());
        let a = Array::from_vec(vec![1., 2., 3., 4.], &[2, 2]).unwrap();
        assert_eq!(a.shape(), [2, 2]);
        assert_eq!(Array::ones(3).data(), [1., 1., 1.]);
        assert!(Array::zeros(0).is_empty());
    }
}
