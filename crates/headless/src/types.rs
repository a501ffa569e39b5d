use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;

use serde::Serialize;

/// Render node opened when the caller does not supply one.
pub const DEFAULT_RENDER_NODE: &str = "/dev/dri/renderD128";

/// Work-group counts for the single dispatch. Fixed: the probe proves dispatch works, it does
/// not size a workload.
pub const WORKGROUPS: [u32; 3] = [1, 1, 1];

/// Inputs needed to bring up a [`crate::HeadlessContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextConfig {
    /// DRM render node opened read-write.
    pub render_node: PathBuf,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            render_node: PathBuf::from(DEFAULT_RENDER_NODE),
        }
    }
}

/// Ordered steps of context bring-up. Declaration order is acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InitStage {
    OpenNode,
    LoadLibraries,
    CreateDevice,
    GetDisplay,
    InitializeDisplay,
    CheckExtensions,
    ChooseConfig,
    BindApi,
    CreateContext,
    MakeCurrent,
    LoadGl,
}

impl InitStage {
    pub const ALL: [InitStage; 11] = [
        InitStage::OpenNode,
        InitStage::LoadLibraries,
        InitStage::CreateDevice,
        InitStage::GetDisplay,
        InitStage::InitializeDisplay,
        InitStage::CheckExtensions,
        InitStage::ChooseConfig,
        InitStage::BindApi,
        InitStage::CreateContext,
        InitStage::MakeCurrent,
        InitStage::LoadGl,
    ];

    pub fn describe(self) -> &'static str {
        match self {
            InitStage::OpenNode => "open render node",
            InitStage::LoadLibraries => "load EGL/GBM libraries",
            InitStage::CreateDevice => "gbm_create_device",
            InitStage::GetDisplay => "eglGetPlatformDisplay",
            InitStage::InitializeDisplay => "eglInitialize",
            InitStage::CheckExtensions => "EGL extension check",
            InitStage::ChooseConfig => "eglChooseConfig",
            InitStage::BindApi => "eglBindAPI",
            InitStage::CreateContext => "eglCreateContext",
            InitStage::MakeCurrent => "eglMakeCurrent",
            InitStage::LoadGl => "GL function loading",
        }
    }
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Resources released at teardown, listed in release order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Release {
    Context,
    Display,
    Device,
    Node,
}

impl Release {
    pub const ORDER: [Release; 4] = [
        Release::Context,
        Release::Display,
        Release::Device,
        Release::Node,
    ];

    /// Bring-up step that produced this resource.
    pub fn acquired_at(self) -> InitStage {
        match self {
            Release::Context => InitStage::CreateContext,
            Release::Display => InitStage::GetDisplay,
            Release::Device => InitStage::CreateDevice,
            Release::Node => InitStage::OpenNode,
        }
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Release::Context => "eglDestroyContext",
            Release::Display => "eglTerminate",
            Release::Device => "gbm_device_destroy",
            Release::Node => "close render node",
        };
        f.write_str(name)
    }
}

/// Outcome of a teardown pass. Failures are recorded, never fatal.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub released: Vec<Release>,
    pub failures: Vec<(Release, String)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Driver strings queried from the current context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverInfo {
    pub egl_version: (i32, i32),
    pub vendor: String,
    pub renderer: String,
    pub version: String,
    pub shading_language: String,
    pub egl_extensions: String,
    pub gl_extensions: Vec<String>,
}

impl DriverInfo {
    /// Writes the human-readable report; extension lists only when `verbose`.
    pub fn write_report<W: Write>(&self, out: &mut W, verbose: bool) -> io::Result<()> {
        writeln!(out, "EGL v{}.{}", self.egl_version.0, self.egl_version.1)?;
        if verbose {
            writeln!(out, "EGL Extensions: {}", self.egl_extensions)?;
        }
        writeln!(out, "GL Vendor: {}", self.vendor)?;
        writeln!(out, "GL Renderer: {}", self.renderer)?;
        writeln!(out, "GL Version: {}", self.version)?;
        writeln!(out, "GL Shading language: {}", self.shading_language)?;
        if verbose {
            writeln!(out, "GL Extensions: {}", self.gl_extensions.join(" "))?;
        }
        Ok(())
    }
}
