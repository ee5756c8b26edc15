//! External raster warping.
//!
//! The resampling itself is delegated to `gdalwarp`; this module builds the
//! invocation, runs it as a child process and checks the result.

mod gdalwarp;
mod invoker;

pub use gdalwarp::{build_warp_command, source_reference, WarpCommand, TARGET_RESOLUTION_DEG, TARGET_SRS};
pub use invoker::{CommandRunner, InvokerError, ProcessOutput, ProcessRunner, ResamplingInvoker};
