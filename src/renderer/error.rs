use std::path::PathBuf;
use thiserror::Error;
use crate::renderer::resources::PoolId;

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;
pub type RenderResult<T> = std::result::Result<T, RenderError>;

/// Failures reported by a [`Backend`](crate::renderer::backend::Backend).
/// None of these are recoverable by the renderer itself.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("device lost")]
    DeviceLost,
    #[error("presentation surface lost")]
    SurfaceLost,
    #[error("missing device capability: {0}")]
    MissingCapability(String),
    #[error("failed to load shader {path:?}: {reason}")]
    ShaderLoad { path: PathBuf, reason: String },
    #[error("graphics api error: {0}")]
    Api(String),
}

/// Errors surfaced by the public renderer API.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("resource pool {0:?} does not exist")]
    InvalidPool(PoolId),
    #[error("resource pool {0:?} was destroyed")]
    StalePool(PoolId),
    #[error("resource pool {0:?} has already been loaded to the gpu")]
    AlreadyFinalized(PoolId),
    #[error("resource pool {0:?} is not resident on the gpu")]
    PoolNotResident(PoolId),
    #[error("frame resources are not ready, call use_loaded_resources first")]
    NotReady,
    #[error("end_draw called without a begin_*_draw")]
    DrawNotStarted,
    #[error("{operation} is not valid in the current draw phase")]
    WrongDrawPhase { operation: &'static str },
    #[error("texture limit of {0} reached")]
    TextureLimitReached(usize),
    #[error("surface has a zero extent")]
    ZeroExtent,
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Per-asset failures. Loaders log these and substitute a fallback.
#[derive(Debug, Error)]
pub enum AssetLoadError {
    #[error("asset not found: {0:?}")]
    NotFound(PathBuf),
    #[error("failed to decode {path:?}: {reason}")]
    Decode { path: PathBuf, reason: String },
    #[error("failed to import {path:?}: {reason}")]
    Import { path: PathBuf, reason: String },
    #[error("unsupported asset format: {0:?}")]
    Unsupported(PathBuf),
}
