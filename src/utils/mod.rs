use std::path::Path;
use anyhow::{anyhow, Context, Result};
use burn::prelude::*;
use tracing::{info, warn};

/// Ensure directory exists
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {:?}", path))?;
    }
    Ok(())
}

/// Format duration as human-readable string
pub fn format_duration(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}h", secs / 3600.0)
    }
}

/// Copy a tensor back to the host as `f32` values in row-major order
pub fn tensor_to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| anyhow!("Failed to read tensor data: {:?}", e))
}

/// Kind of compute device a run ended up on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Cpu,
}

impl DeviceKind {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
        }
    }
}

/// Execution context threaded through every component of a run.
///
/// Holds the device tensors are placed on and the accelerator index the
/// caller asked for, which is reported in progress output.
#[derive(Debug, Clone)]
pub struct ExecutionContext<B: Backend> {
    pub device: B::Device,
    pub device_id: usize,
    pub kind: DeviceKind,
}

impl<B: Backend> ExecutionContext<B> {
    /// Context on the default CPU device
    pub fn cpu() -> Self {
        Self {
            device: B::Device::default(),
            device_id: 0,
            kind: DeviceKind::Cpu,
        }
    }

    /// Resolve the requested accelerator, falling back to the CPU device
    /// when the build carries no accelerator backend.
    pub fn with_fallback(requested_id: usize) -> Self {
        match fallback_warning(requested_id) {
            Some(message) => warn!("{}", message),
            None => info!("CPU-only build, running on the default CPU device"),
        }
        let context = Self {
            device_id: requested_id,
            ..Self::cpu()
        };
        info!("Device type: {}", context.kind.name());
        context
    }
}

/// Warning for an accelerator id other than the default one
fn fallback_warning(requested_id: usize) -> Option<String> {
    (requested_id != 0).then(|| {
        format!(
            "Accelerator {} requested but this build is CPU-only, falling back to CPU",
            requested_id
        )
    })
}

/// Random number utilities
pub mod random {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Create RNG with fixed seed
    pub fn seeded_rng(seed: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(seed)
    }
}
