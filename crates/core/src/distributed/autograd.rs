//! Collectives that participate in candle's autograd.
//!
//! Each operator is a `(forward, backward)` pair of tensor functions. When
//! the communicator is active, [`Collective::apply`] runs `forward` eagerly
//! and records a custom op in the graph whose backward rule is `backward`.
//! When it is not, the operator is the identity and adds nothing to the graph.
//!
//! | Operator        | Forward                       | Backward                          |
//! |-----------------|-------------------------------|-----------------------------------|
//! | [`AllGather`]   | concat shards along dim 0     | sum over ranks, keep own segment  |
//! | [`AllReduceSum`]| element-wise sum over ranks   | identity                          |
//! | [`AllReduce`]   | element-wise mean over ranks  | identity                          |

use candle_core::backend::BackendStorage;
use candle_core::{CpuStorage, CustomOp1, Layout, Shape, Storage, Tensor};

use super::communicator::{CommContext, ReduceOp};
use super::error::{DistributedError, Result};

/// A collective with a custom gradient.
pub trait Collective: Clone + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn communicator(&self) -> &CommContext;

    /// Forward value on this rank. Must be called by every rank.
    fn forward(&self, x: &Tensor) -> Result<Tensor>;

    /// Gradient w.r.t. the input, given the gradient w.r.t. the output.
    fn backward(&self, grad: &Tensor) -> Result<Tensor>;

    /// Run the collective and register its backward rule with autograd.
    fn apply(&self, x: &Tensor) -> Result<Tensor> {
        if !self.communicator().is_active() {
            return Ok(x.clone());
        }
        let output = self.forward(x)?.force_contiguous()?;
        Ok(x.apply_op1(CollectiveOp {
            collective: self.clone(),
            output,
        })?)
    }
}

/// Graph node carrying an eagerly computed collective result.
struct CollectiveOp<C: Collective> {
    collective: C,
    output: Tensor,
}

impl<C: Collective> CollectiveOp<C> {
    fn materialize(&self) -> candle_core::Result<(Storage, Shape)> {
        let (storage, layout) = self.output.storage_and_layout();
        let copy = match &*storage {
            Storage::Cpu(s) => Storage::Cpu(s.try_clone(layout)?),
            #[cfg(feature = "cuda")]
            Storage::Cuda(s) => Storage::Cuda(s.try_clone(layout)?),
            _ => candle_core::bail!("{}: unsupported output device", self.collective.name()),
        };
        Ok((copy, layout.shape().clone()))
    }
}

impl<C: Collective> CustomOp1 for CollectiveOp<C> {
    fn name(&self) -> &'static str {
        self.collective.name()
    }

    fn cpu_fwd(&self, _: &CpuStorage, _: &Layout) -> candle_core::Result<(CpuStorage, Shape)> {
        match self.materialize()? {
            (Storage::Cpu(s), shape) => Ok((s, shape)),
            _ => candle_core::bail!("{}: output is not on the CPU", self.collective.name()),
        }
    }

    #[cfg(feature = "cuda")]
    fn cuda_fwd(
        &self,
        _: &candle_core::CudaStorage,
        _: &Layout,
    ) -> candle_core::Result<(candle_core::CudaStorage, Shape)> {
        match self.materialize()? {
            (Storage::Cuda(s), shape) => Ok((s, shape)),
            _ => candle_core::bail!("{}: output is not on CUDA", self.collective.name()),
        }
    }

    fn bwd(
        &self,
        _arg: &Tensor,
        _res: &Tensor,
        grad_res: &Tensor,
    ) -> candle_core::Result<Option<Tensor>> {
        self.collective
            .backward(grad_res)
            .map(Some)
            .map_err(candle_core::Error::wrap)
    }
}

/// Concatenate every rank's shard along the leading axis, in rank order.
#[derive(Clone)]
pub struct AllGather {
    comm: CommContext,
}

impl AllGather {
    pub fn new(comm: CommContext) -> Self {
        Self { comm }
    }
}

impl Collective for AllGather {
    fn name(&self) -> &'static str {
        "all-gather"
    }

    fn communicator(&self) -> &CommContext {
        &self.comm
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        if x.rank() == 0 {
            return Err(DistributedError::ShapeMismatch {
                expected: vec![1],
                actual: vec![],
            });
        }
        self.comm.all_gather(&x.contiguous()?)
    }

    fn backward(&self, grad: &Tensor) -> Result<Tensor> {
        let pg = self.comm.process_group();
        let (world_size, rank) = (pg.world_size(), pg.rank());
        let extent = grad.dim(0)?;
        if extent % world_size != 0 {
            return Err(DistributedError::UnevenGather { extent, world_size });
        }
        let segment = extent / world_size;
        let summed = self.comm.all_reduce(&grad.contiguous()?, ReduceOp::Sum)?;
        Ok(summed.narrow(0, segment * rank, segment)?)
    }
}

/// Element-wise sum over ranks. Gradients pass through unchanged.
#[derive(Clone)]
pub struct AllReduceSum {
    comm: CommContext,
}

impl AllReduceSum {
    pub fn new(comm: CommContext) -> Self {
        Self { comm }
    }
}

impl Collective for AllReduceSum {
    fn name(&self) -> &'static str {
        "all-reduce-sum"
    }

    fn communicator(&self) -> &CommContext {
        &self.comm
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.comm.all_reduce(&x.contiguous()?, ReduceOp::Sum)
    }

    fn backward(&self, grad: &Tensor) -> Result<Tensor> {
        Ok(grad.clone())
    }
}

/// Element-wise mean over ranks. Gradients pass through unchanged.
#[derive(Clone)]
pub struct AllReduce {
    comm: CommContext,
}

impl AllReduce {
    pub fn new(comm: CommContext) -> Self {
        Self { comm }
    }
}

impl Collective for AllReduce {
    fn name(&self) -> &'static str {
        "all-reduce-mean"
    }

    fn communicator(&self) -> &CommContext {
        &self.comm
    }

    // Scale before summing so every rank adds the same pre-divided values.
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let world_size = self.comm.process_group().world_size() as f64;
        let scaled = (x.contiguous()? / world_size)?;
        self.comm.all_reduce(&scaled, ReduceOp::Sum)
    }

    fn backward(&self, grad: &Tensor) -> Result<Tensor> {
        Ok(grad.clone())
    }
}

/// Differentiable all-gather along the leading axis.
pub fn all_gather(comm: &CommContext, x: &Tensor) -> Result<Tensor> {
    AllGather::new(comm.clone()).apply(x)
}

/// Differentiable all-reduce (sum).
pub fn all_reduce_sum(comm: &CommContext, x: &Tensor) -> Result<Tensor> {
    AllReduceSum::new(comm.clone()).apply(x)
}

/// Differentiable all-reduce (mean).
pub fn all_reduce_mean(comm: &CommContext, x: &Tensor) -> Result<Tensor> {
    AllReduce::new(comm.clone()).apply(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{DeviceCommunicator, LocalCommunicator, LocalProcessGroup};
    use candle_core::{Device, Var};
    use std::sync::Arc;

    /// Pretends to be rank `rank` of `world_size` identical ranks.
    struct MirrorCommunicator {
        pg: LocalProcessGroup,
    }

    impl DeviceCommunicator for MirrorCommunicator {
        fn process_group(&self) -> &dyn crate::distributed::ProcessGroup {
            &self.pg
        }

        fn all_reduce(&self, tensor: &Tensor, op: ReduceOp) -> Result<Tensor> {
            let n = self.pg.identity().world_size() as f64;
            Ok(match op {
                ReduceOp::Sum => (tensor * n)?,
                ReduceOp::Average | ReduceOp::Min | ReduceOp::Max => tensor.clone(),
                ReduceOp::Product => tensor.powf(n)?,
            })
        }

        fn all_gather(&self, tensor: &Tensor) -> Result<Tensor> {
            let copies = vec![tensor.clone(); self.pg.identity().world_size()];
            Ok(Tensor::cat(&copies, 0)?)
        }

        fn broadcast(&self, tensor: &Tensor, _src_rank: usize) -> Result<Tensor> {
            Ok(tensor.clone())
        }

        fn barrier(&self) -> Result<()> {
            Ok(())
        }
    }

    fn mirror(rank: usize, world_size: usize) -> CommContext {
        Arc::new(MirrorCommunicator {
            pg: LocalProcessGroup::with_rank(rank, world_size),
        })
    }

    fn input() -> Var {
        Var::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu).unwrap()
    }

    #[test]
    fn inactive_context_is_identity() {
        let comm = LocalCommunicator::context();
        let x = input();
        for out in [
            all_gather(&comm, x.as_tensor()).unwrap(),
            all_reduce_sum(&comm, x.as_tensor()).unwrap(),
            all_reduce_mean(&comm, x.as_tensor()).unwrap(),
        ] {
            assert_eq!(
                out.to_vec2::<f32>().unwrap(),
                x.as_tensor().to_vec2::<f32>().unwrap()
            );
            let grads = out.sum_all().unwrap().backward().unwrap();
            let g = grads.get(x.as_tensor()).unwrap();
            assert_eq!(g.to_vec2::<f32>().unwrap(), vec![vec![1.0; 2]; 2]);
        }
    }

    #[test]
    fn gather_forward_and_backward_route_own_segment() {
        let comm = mirror(1, 3);
        let x = input();
        let y = all_gather(&comm, x.as_tensor()).unwrap();
        assert_eq!(y.dims(), &[6, 2]);

        // Weight rows so each segment of the upstream gradient is distinct.
        let w = Tensor::arange(0f32, 6., &Device::Cpu)
            .unwrap()
            .reshape((6, 1))
            .unwrap();
        let loss = y.broadcast_mul(&w).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let g = grads.get(x.as_tensor()).unwrap();

        // Summed over 3 mirrored ranks, then rows 2..4 for rank 1.
        assert_eq!(
            g.to_vec2::<f32>().unwrap(),
            vec![vec![6.0, 6.0], vec![9.0, 9.0]]
        );
    }

    #[test]
    fn gather_backward_rejects_uneven_extent() {
        let op = AllGather::new(mirror(0, 2));
        let grad = Tensor::zeros((3, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let err = op.backward(&grad).unwrap_err();
        assert!(matches!(
            err,
            DistributedError::UnevenGather {
                extent: 3,
                world_size: 2
            }
        ));
    }

    #[test]
    fn gather_rejects_scalars() {
        let op = AllGather::new(mirror(0, 2));
        let x = Tensor::new(1f32, &Device::Cpu).unwrap();
        assert!(matches!(
            op.apply(&x),
            Err(DistributedError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn reductions_pass_gradient_through() {
        let comm = mirror(0, 4);
        let x = input();

        let sum = all_reduce_sum(&comm, x.as_tensor()).unwrap();
        assert_eq!(
            sum.to_vec2::<f32>().unwrap(),
            vec![vec![4.0, 8.0], vec![12.0, 16.0]]
        );
        let mean = all_reduce_mean(&comm, x.as_tensor()).unwrap();
        assert_eq!(
            mean.to_vec2::<f32>().unwrap(),
            x.as_tensor().to_vec2::<f32>().unwrap()
        );

        for out in [sum, mean] {
            let grads = (out * 3.0).unwrap().sum_all().unwrap().backward().unwrap();
            let g = grads.get(x.as_tensor()).unwrap();
            assert_eq!(g.to_vec2::<f32>().unwrap(), vec![vec![3.0; 2]; 2]);
        }
    }
}
