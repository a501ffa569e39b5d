//! Compute shader compile, link, dispatch and release.
//!
//! A [`ComputeProgram`] borrows the [`HeadlessContext`] it was linked in, so the borrow checker
//! enforces that programs go away before the context is shut down. Unloading consumes the
//! program; unloading twice does not compile:
//!
//! ```compile_fail
//! # fn demo(ctx: &headless::HeadlessContext) -> headless::Result<()> {
//! let program = headless::ComputeProgram::load(ctx, "shader.cs")?;
//! program.unload()?;
//! program.unload()?;
//! # Ok(())
//! # }
//! ```
//!
//! Neither does shutting the context down underneath a live program:
//!
//! ```compile_fail
//! # fn demo(ctx: headless::HeadlessContext) -> headless::Result<()> {
//! let program = headless::ComputeProgram::load(&ctx, "shader.cs")?;
//! ctx.shutdown();
//! program.run()?;
//! # Ok(())
//! # }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use glow::HasContext;

use crate::context::HeadlessContext;
use crate::error::{ProbeError, Result};
use crate::types::WORKGROUPS;

const EMPTY_LOG: &str = "(driver returned an empty info log)";

/// Compute shader text together with the file it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    path: PathBuf,
    text: String,
}

impl ShaderSource {
    /// Reads the whole file as UTF-8 text.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ProbeError::ReadShader {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), bytes = text.len(), "read compute shader");
        Ok(Self {
            path: path.to_path_buf(),
            text,
        })
    }

    pub fn from_text(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

/// A linked compute program, valid while its context stays current.
pub struct ComputeProgram<'ctx> {
    ctx: &'ctx HeadlessContext,
    raw: glow::Program,
    source: PathBuf,
    deleted: bool,
}

impl<'ctx> ComputeProgram<'ctx> {
    /// Reads `path` and compiles it with [`ComputeProgram::compile`].
    pub fn load(ctx: &'ctx HeadlessContext, path: impl AsRef<Path>) -> Result<Self> {
        let source = ShaderSource::read(path)?;
        Self::compile(ctx, &source)
    }

    /// Compiles `source` as a compute shader and links it into a program.
    ///
    /// The intermediate shader object is deleted on every path. A compile or link failure
    /// returns the driver's info log in the error.
    pub fn compile(ctx: &'ctx HeadlessContext, source: &ShaderSource) -> Result<Self> {
        ctx.ensure_current()?;
        let gl = ctx.gl();

        // SAFETY: the context is current on this thread.
        let shader = unsafe { gl.create_shader(glow::COMPUTE_SHADER) }.map_err(|reason| {
            ProbeError::GlObject {
                call: "glCreateShader",
                reason,
            }
        })?;
        let linked = compile_and_link(ctx, shader, source);
        // SAFETY: `shader` is live; a linked program keeps its own copy of the binary.
        unsafe { gl.delete_shader(shader) };

        let raw = linked?;
        tracing::info!(path = %source.path().display(), "compute program linked");
        Ok(Self {
            ctx,
            raw,
            source: source.path().to_path_buf(),
            deleted: false,
        })
    }

    /// Binds the program and dispatches one [`WORKGROUPS`]-sized compute grid.
    ///
    /// May be called any number of times while the program is alive.
    pub fn run(&self) -> Result<()> {
        self.ctx.ensure_current()?;
        let gl = self.ctx.gl();

        // SAFETY: `raw` is a live program in the current context.
        unsafe { gl.use_program(Some(self.raw)) };
        self.ctx.check_error("glUseProgram")?;

        let [x, y, z] = WORKGROUPS;
        // SAFETY: a compute program is bound.
        unsafe { gl.dispatch_compute(x, y, z) };
        self.ctx.check_error("glDispatchCompute")?;

        tracing::debug!(path = %self.source.display(), x, y, z, "dispatched compute work");
        Ok(())
    }

    pub fn source_path(&self) -> &Path {
        &self.source
    }

    /// Deletes the program object.
    pub fn unload(mut self) -> Result<()> {
        self.ctx.ensure_current()?;
        self.deleted = true;
        delete_program(self.ctx, self.raw);
        self.ctx.check_error("glDeleteProgram")?;
        tracing::debug!(path = %self.source.display(), "compute program deleted");
        Ok(())
    }
}

impl Drop for ComputeProgram<'_> {
    fn drop(&mut self) {
        if self.deleted {
            return;
        }
        if self.ctx.ensure_current().is_ok() {
            delete_program(self.ctx, self.raw);
            tracing::debug!(path = %self.source.display(), "compute program deleted on drop");
        } else {
            tracing::warn!(
                path = %self.source.display(),
                "context not current; compute program leaked"
            );
        }
    }
}

fn delete_program(ctx: &HeadlessContext, program: glow::Program) {
    let gl = ctx.gl();
    // SAFETY: unbinding first lets the driver free the program immediately.
    unsafe {
        gl.use_program(None);
        gl.delete_program(program);
    }
}

fn compile_and_link(
    ctx: &HeadlessContext,
    shader: glow::Shader,
    source: &ShaderSource,
) -> Result<glow::Program> {
    let gl = ctx.gl();
    ctx.check_error("glCreateShader")?;

    // SAFETY: `shader` is a live shader object in the current context.
    unsafe { gl.shader_source(shader, source.text()) };
    ctx.check_error("glShaderSource")?;
    unsafe { gl.compile_shader(shader) };
    ctx.check_error("glCompileShader")?;

    if !unsafe { gl.get_shader_compile_status(shader) } {
        let log = normalize_log(unsafe { gl.get_shader_info_log(shader) });
        tracing::error!(path = %source.path().display(), "compute shader failed to compile");
        return Err(ProbeError::Compile {
            path: source.path().to_path_buf(),
            log,
        });
    }

    // SAFETY: as above.
    let program = unsafe { gl.create_program() }.map_err(|reason| ProbeError::GlObject {
        call: "glCreateProgram",
        reason,
    })?;
    match link(ctx, program, shader, source) {
        Ok(()) => Ok(program),
        Err(err) => {
            // SAFETY: the program was never handed out.
            unsafe { gl.delete_program(program) };
            Err(err)
        }
    }
}

fn link(
    ctx: &HeadlessContext,
    program: glow::Program,
    shader: glow::Shader,
    source: &ShaderSource,
) -> Result<()> {
    let gl = ctx.gl();
    // SAFETY: both objects are live in the current context.
    unsafe { gl.attach_shader(program, shader) };
    ctx.check_error("glAttachShader")?;
    unsafe { gl.link_program(program) };
    ctx.check_error("glLinkProgram")?;

    if !unsafe { gl.get_program_link_status(program) } {
        let log = normalize_log(unsafe { gl.get_program_info_log(program) });
        tracing::error!(path = %source.path().display(), "compute program failed to link");
        return Err(ProbeError::Link {
            path: source.path().to_path_buf(),
            log,
        });
    }
    Ok(())
}

fn normalize_log(log: String) -> String {
    let trimmed = log.trim_end_matches(['\0', '\n', '\r', ' ']);
    if trimmed.is_empty() {
        EMPTY_LOG.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn reads_source_verbatim() {
        let mut file = NamedTempFile::new().unwrap();
        let text = "#version 310 es\nlayout(local_size_x = 1) in;\nvoid main() {}\n";
        file.write_all(text.as_bytes()).unwrap();

        let source = ShaderSource::read(file.path()).unwrap();
        assert_eq!(source.text(), text);
        assert_eq!(source.path(), file.path());
    }

    #[test]
    fn unreadable_source_is_an_acquisition_failure() {
        let dir = TempDir::new().unwrap();
        let err = ShaderSource::read(dir.path().join("shader.cs")).unwrap_err();
        assert!(matches!(err, ProbeError::ReadShader { .. }));
        assert_eq!(err.kind(), ErrorKind::ResourceAcquisition);
    }

    #[test]
    fn empty_logs_are_replaced() {
        assert_eq!(normalize_log(String::new()), EMPTY_LOG);
        assert_eq!(normalize_log("\n\0".into()), EMPTY_LOG);
        assert_eq!(
            normalize_log("0:2(1): error: syntax error\n\0".into()),
            "0:2(1): error: syntax error"
        );
    }
}
