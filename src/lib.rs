pub mod boxfilter;
pub mod config;
pub mod error;
pub mod fuse;
pub mod geom;
pub mod inpaint;
pub mod kernel_model;
pub mod raster_array;
pub mod raster_pair;
pub mod utils;

pub use config::{HomoConfig, Method, ModelConfig, OutputConfig, ProcCrs, Resampling};
pub use error::{RastFuseError, Result};
pub use fuse::{OutputTarget, RasterFuse};
pub use kernel_model::{KernelModel, KernelModelConfig};
pub use raster_array::RasterArray;
pub use raster_pair::{BlockPair, RasterPairReader, ResolvedProcCrs};
