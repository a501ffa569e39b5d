//! Headless OpenGL ES compute on a DRM render node.
//!
//! The crate proves a driver stack can run a compute shader without a display server. The
//! flow a caller drives is:
//!
//! ```text
//!   ContextConfig
//!        │
//!        ▼
//!   HeadlessContext::initialize ──▶ driver_info()
//!        │
//!        ▼
//!   ComputeProgram::load ──▶ run() ──▶ HeadlessContext::wait_idle ──▶ unload()
//!        │
//!        ▼
//!   HeadlessContext::shutdown ──▶ TeardownReport
//! ```
//!
//! Every step returns a [`ProbeError`] on failure; [`ProbeError::kind`] groups failures into
//! acquisition, capability, compilation and runtime classes so callers can choose an exit
//! status. Nothing here aborts the process.

mod context;
mod error;
mod gbm;
mod shader;
mod types;

pub use context::{has_extension, HeadlessContext, RenderNode, REQUIRED_EGL_EXTENSIONS};
pub use error::{ErrorKind, ProbeError, Result};
pub use shader::{ComputeProgram, ShaderSource};
pub use types::{
    ContextConfig, DriverInfo, InitStage, Release, TeardownReport, DEFAULT_RENDER_NODE,
    WORKGROUPS,
};
