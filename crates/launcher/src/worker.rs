//! Per-process worker: config, distributed bootstrap, then the application.

use std::path::PathBuf;

use anyhow::Context;
use candle_core::{DType, Tensor, Var};
use ddp_core::distributed::{
    all_gather, all_reduce_mean, all_reduce_sum, init_distributed, vars::CUDA_VISIBLE_DEVICES,
    CandleDeviceSelector, DeviceSelector, DistributedContext, InitOptions,
};
use serde::Deserialize;
use serde_yaml::Value;

use crate::config::RunConfig;
use crate::logging;

/// The application started once distribution is set up.
///
/// By the time `run` is called the process group exists (for
/// `world_size > 1`) and the local device has been selected.
pub trait TrainingApp {
    fn run(
        &self,
        app_config: &Value,
        config: &RunConfig,
        dist: &DistributedContext,
    ) -> anyhow::Result<()>;
}

/// Inputs to [`main_worker`].
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub fname: PathBuf,
    /// Rank used for log verbosity and the config dump, known before bootstrap.
    pub rank_hint: usize,
    pub init: InitOptions,
}

/// Load the config, bootstrap distribution and run `app`.
pub fn main_worker(args: &WorkerArgs, app: &dyn TrainingApp) -> anyhow::Result<DistributedContext> {
    if let Err(e) = logging::init_for_rank(args.rank_hint) {
        tracing::debug!(error = %e, "keeping existing log subscriber");
    }

    tracing::info!(fname = %args.fname.display(), "called-params");
    let config = RunConfig::load_from(&args.fname)
        .with_context(|| format!("failed to load {}", args.fname.display()))?;
    tracing::info!("loaded params");

    if args.rank_hint == 0 {
        tracing::info!("params:\n{}", config.to_pretty_yaml()?);
        let path = config.dump_params()?;
        tracing::info!(path = %path.display(), "saved params");
    }

    let dist = init_distributed(&args.init).context("distributed initialization failed")?;
    log_diagnostics(&dist);

    app.run(&config.app, &config, &dist)?;
    Ok(dist)
}

fn log_diagnostics(dist: &DistributedContext) {
    let (world_size, rank, local_rank) = dist.as_tuple();
    tracing::info!(rank, world_size, local_rank, source = ?dist.source(), "process identity");
    tracing::info!(
        cuda_visible_devices = %std::env::var(CUDA_VISIBLE_DEVICES).unwrap_or_else(|_| "<unset>".to_string()),
        "device visibility"
    );
    let selector = CandleDeviceSelector;
    tracing::info!(
        accelerator = selector.is_available(),
        device_count = ?selector.device_count(),
        device = ?dist.device().location(),
        "selected device"
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SmokeSettings {
    pub rows: usize,
    pub cols: usize,
}

impl Default for SmokeSettings {
    fn default() -> Self {
        Self { rows: 2, cols: 3 }
    }
}

impl SmokeSettings {
    /// Settings from the `app` section; anything but a mapping means defaults.
    pub fn from_app(app_config: &Value) -> anyhow::Result<Self> {
        if !app_config.is_mapping() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(app_config.clone()).context("invalid smoke-test settings")
    }
}

/// Runs each differentiable collective once and checks the results.
///
/// Every rank contributes a `rows x cols` tensor filled with `rank + 1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectiveSmokeApp;

impl TrainingApp for CollectiveSmokeApp {
    fn run(
        &self,
        app_config: &Value,
        _config: &RunConfig,
        dist: &DistributedContext,
    ) -> anyhow::Result<()> {
        let settings = SmokeSettings::from_app(app_config)?;
        let comm = dist.communicator();
        let world_size = dist.world_size() as f32;
        let (rows, cols) = (settings.rows, settings.cols);

        let local = Tensor::full(dist.rank() as f32 + 1.0, (rows, cols), dist.device())?;
        let x = Var::from_tensor(&local)?;

        let summed = all_reduce_sum(comm, x.as_tensor())?;
        let mean = all_reduce_mean(comm, x.as_tensor())?;
        let gathered = all_gather(comm, x.as_tensor())?;

        let (expected_sum, expected_mean) = if comm.is_active() {
            let total = world_size * (world_size + 1.0) / 2.0;
            (total, total / world_size)
        } else {
            (dist.rank() as f32 + 1.0, dist.rank() as f32 + 1.0)
        };
        check_all(&summed, expected_sum, "all-reduce-sum")?;
        check_all(&mean, expected_mean, "all-reduce-mean")?;

        let expected_rows = if comm.is_active() { rows * dist.world_size() } else { rows };
        anyhow::ensure!(
            gathered.dims() == [expected_rows, cols],
            "all-gather produced shape {:?}",
            gathered.dims()
        );

        let grads = gathered.sum_all()?.backward()?;
        let grad = grads
            .get(x.as_tensor())
            .context("no gradient reached the gathered input")?;
        let expected_grad = if comm.is_active() { world_size } else { 1.0 };
        check_all(grad, expected_grad, "all-gather backward")?;

        tracing::info!(
            rank = dist.rank(),
            sum = expected_sum,
            mean = expected_mean,
            gathered_rows = expected_rows,
            "collective smoke test passed"
        );
        Ok(())
    }
}

fn check_all(t: &Tensor, expected: f32, what: &str) -> anyhow::Result<()> {
    let values = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    if let Some(bad) = values.iter().find(|v| (**v - expected).abs() > 1e-5) {
        anyhow::bail!("{what}: expected {expected}, found {bad}");
    }
    Ok(())
}
