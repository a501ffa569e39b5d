use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::types::InitStage;

/// Failure classes the probe distinguishes when deciding how to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Device node, library, device, display or context could not be acquired.
    ResourceAcquisition,
    /// The driver works but lacks an extension or configuration the probe needs.
    CapabilityMismatch,
    /// The compute shader failed to compile or link; carries an info log.
    Compilation,
    /// A GL call reported an error after it was issued.
    RuntimeApi,
}

impl ErrorKind {
    /// Process exit status reported for this failure class.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::ResourceAcquisition => 10,
            ErrorKind::CapabilityMismatch => 11,
            ErrorKind::Compilation => 12,
            ErrorKind::RuntimeApi => 13,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ResourceAcquisition => "resource-acquisition",
            ErrorKind::CapabilityMismatch => "capability-mismatch",
            ErrorKind::Compilation => "compilation",
            ErrorKind::RuntimeApi => "runtime-api",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("failed to open render node {}: {source}", path.display())]
    OpenNode {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to load {library}: {reason}")]
    LoadLibrary {
        library: &'static str,
        reason: String,
    },
    #[error("{stage} failed: {reason}")]
    Acquire { stage: InitStage, reason: String },
    #[error("display does not advertise required extension {extension}")]
    MissingExtension { extension: &'static str },
    #[error("no EGL config is renderable with OpenGL ES 3")]
    NoMatchingConfig,
    #[error("eglBindAPI(EGL_OPENGL_ES_API) rejected: {reason}")]
    BindApi { reason: String },
    #[error("context reports OpenGL ES {major}.{minor}; compute shaders need 3.1")]
    NoComputeSupport { major: u32, minor: u32 },
    #[error("failed to read shader source {}: {source}", path.display())]
    ReadShader {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The driver log is kept out of the message; read it with [`ProbeError::info_log`].
    #[error("shader compilation failed: {}", path.display())]
    Compile { path: PathBuf, log: String },
    #[error("program link failed: {}", path.display())]
    Link { path: PathBuf, log: String },
    #[error("{call} reported GL error {}", gl_error_name(*code))]
    Gl { call: &'static str, code: u32 },
    #[error("{call} failed: {reason}")]
    GlObject { call: &'static str, reason: String },
    #[error("execution context is not current on this thread")]
    ContextNotCurrent,
    #[error("compute work did not complete within {timeout_ms} ms")]
    FenceTimeout { timeout_ms: u128 },
    #[error("glClientWaitSync failed with status {status:#x}")]
    FenceFailed { status: u32 },
}

impl ProbeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProbeError::OpenNode { .. }
            | ProbeError::LoadLibrary { .. }
            | ProbeError::Acquire { .. }
            | ProbeError::ReadShader { .. } => ErrorKind::ResourceAcquisition,
            ProbeError::MissingExtension { .. }
            | ProbeError::NoMatchingConfig
            | ProbeError::BindApi { .. }
            | ProbeError::NoComputeSupport { .. } => ErrorKind::CapabilityMismatch,
            ProbeError::Compile { .. } | ProbeError::Link { .. } => ErrorKind::Compilation,
            ProbeError::Gl { .. }
            | ProbeError::GlObject { .. }
            | ProbeError::ContextNotCurrent
            | ProbeError::FenceTimeout { .. }
            | ProbeError::FenceFailed { .. } => ErrorKind::RuntimeApi,
        }
    }

    /// Bring-up step that failed, for errors raised by [`crate::HeadlessContext::initialize`].
    pub fn stage(&self) -> Option<InitStage> {
        match self {
            ProbeError::OpenNode { .. } => Some(InitStage::OpenNode),
            ProbeError::LoadLibrary { .. } => Some(InitStage::LoadLibraries),
            ProbeError::Acquire { stage, .. } => Some(*stage),
            ProbeError::MissingExtension { .. } => Some(InitStage::CheckExtensions),
            ProbeError::NoMatchingConfig => Some(InitStage::ChooseConfig),
            ProbeError::BindApi { .. } => Some(InitStage::BindApi),
            ProbeError::NoComputeSupport { .. } => Some(InitStage::LoadGl),
            _ => None,
        }
    }

    /// Compiler or linker output attached to the error, if any.
    pub fn info_log(&self) -> Option<&str> {
        match self {
            ProbeError::Compile { log, .. } | ProbeError::Link { log, .. } => Some(log.as_str()),
            _ => None,
        }
    }

    pub(crate) fn acquire(stage: InitStage, reason: impl fmt::Display) -> Self {
        ProbeError::Acquire {
            stage,
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = ProbeError> = std::result::Result<T, E>;

fn gl_error_name(code: u32) -> String {
    let name = match code {
        glow::INVALID_ENUM => "GL_INVALID_ENUM",
        glow::INVALID_VALUE => "GL_INVALID_VALUE",
        glow::INVALID_OPERATION => "GL_INVALID_OPERATION",
        glow::INVALID_FRAMEBUFFER_OPERATION => "GL_INVALID_FRAMEBUFFER_OPERATION",
        glow::OUT_OF_MEMORY => "GL_OUT_OF_MEMORY",
        _ => return format!("{code:#06x}"),
    };
    name.to_string()
}
