//! Surfaceless OpenGL ES context on a GBM render node.
//!
//! Bring-up walks [`InitStage::ALL`] in order and stops at the first failing step. Resources
//! are parked in [`Resources`] as soon as they exist, so an early return releases whatever was
//! acquired so far, in [`Release::ORDER`].

use std::ffi::c_void;
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::ptr;
use std::time::{Duration, Instant};

use glow::HasContext;
use khronos_egl as egl;

use crate::error::{ProbeError, Result};
use crate::gbm::{GbmDevice, GbmLibrary};
use crate::types::{ContextConfig, DriverInfo, InitStage, Release, TeardownReport};

type Egl = egl::DynamicInstance<egl::EGL1_5>;

/// `EGL_PLATFORM_GBM_MESA` (same value as `EGL_PLATFORM_GBM_KHR`).
const PLATFORM_GBM_MESA: egl::Enum = 0x31D7;

pub const REQUIRED_EGL_EXTENSIONS: [&str; 2] =
    ["EGL_KHR_create_context", "EGL_KHR_surfaceless_context"];

const CONFIG_ATTRIBUTES: [egl::Int; 3] = [egl::RENDERABLE_TYPE, egl::OPENGL_ES3_BIT, egl::NONE];

/// Resolved before building the GL function table; absent on drivers without compute.
const COMPUTE_ENTRY_POINT: &str = "glDispatchCompute";

const CONTEXT_ATTRIBUTES: [egl::Int; 3] = [egl::CONTEXT_CLIENT_VERSION, 3, egl::NONE];

/// An open DRM render node.
#[derive(Debug)]
pub struct RenderNode {
    file: File,
    path: PathBuf,
}

impl RenderNode {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| ProbeError::OpenNode {
                path: path.to_path_buf(),
                source,
            })?;
        tracing::debug!(node = %path.display(), "opened render node");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsFd for RenderNode {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// One teardown step per [`Release`]; `None` when that resource was never acquired.
trait Teardown {
    fn release_step(&mut self, step: Release) -> Option<Result<(), String>>;
}

/// Runs every step in [`Release::ORDER`], continuing past failures.
fn release_all(resources: &mut impl Teardown) -> TeardownReport {
    let mut report = TeardownReport::default();
    for step in Release::ORDER {
        match resources.release_step(step) {
            None => {}
            Some(Ok(())) => {
                tracing::debug!(%step, "released");
                report.released.push(step);
            }
            Some(Err(reason)) => {
                tracing::warn!(%step, %reason, "teardown step failed; continuing");
                report.failures.push((step, reason));
            }
        }
    }
    report
}

/// Everything acquired during bring-up, released in [`Release::ORDER`].
struct Resources {
    egl: Egl,
    display: Option<egl::Display>,
    context: Option<egl::Context>,
    device: Option<GbmDevice>,
    node: Option<RenderNode>,
}

impl Teardown for Resources {
    fn release_step(&mut self, step: Release) -> Option<Result<(), String>> {
        match step {
            Release::Context => self.release_context(),
            Release::Display => self.release_display(),
            Release::Device => self.device.take().map(|_| Ok(())),
            Release::Node => self.node.take().map(|_| Ok(())),
        }
    }
}

impl Resources {
    fn release(&mut self) -> TeardownReport {
        release_all(self)
    }

    fn release_context(&mut self) -> Option<Result<(), String>> {
        let context = self.context.take()?;
        let display = self.display?;
        let mut problems = Vec::new();
        if self.egl.get_current_context() == Some(context) {
            if let Err(err) = self.egl.make_current(display, None, None, None) {
                problems.push(format!("unbind: {err}"));
            }
        }
        if let Err(err) = self.egl.destroy_context(display, context) {
            problems.push(err.to_string());
        }
        Some(if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        })
    }

    fn release_display(&mut self) -> Option<Result<(), String>> {
        let display = self.display.take()?;
        Some(self.egl.terminate(display).map_err(|err| err.to_string()))
    }
}

impl Drop for Resources {
    fn drop(&mut self) {
        let report = self.release();
        if !report.released.is_empty() {
            tracing::debug!(released = ?report.released, "released resources on drop");
        }
    }
}

/// A current, surfaceless OpenGL ES 3 context bound to a render node.
///
/// ```text
///   RenderNode ─▶ GbmDevice ─▶ EGLDisplay ─▶ EGLContext (current) ─▶ glow::Context
/// ```
///
/// The context is tied to the thread that created it and is neither `Send` nor `Sync`.
pub struct HeadlessContext {
    gl: glow::Context,
    resources: Resources,
    display: egl::Display,
    context: egl::Context,
    egl_version: (i32, i32),
    egl_extensions: String,
    _thread_bound: PhantomData<*const ()>,
}

impl HeadlessContext {
    /// Brings up the context and makes it current on the calling thread.
    ///
    /// On failure everything acquired so far has already been released.
    pub fn initialize(config: &ContextConfig) -> Result<Self> {
        Self::bring_up(config).inspect_err(|err| {
            if let Some(stage) = err.stage() {
                tracing::error!(%stage, error = %err, "context bring-up failed");
            }
        })
    }

    fn bring_up(config: &ContextConfig) -> Result<Self> {
        let node = RenderNode::open(&config.render_node)?;

        // SAFETY: loading libEGL runs no code beyond its constructors.
        let instance = unsafe { Egl::load_required() }.map_err(|err| ProbeError::LoadLibrary {
            library: "libEGL",
            reason: err.to_string(),
        })?;
        let gbm = GbmLibrary::load()?;

        let device = GbmDevice::create(gbm, node.as_fd())?;
        let native_display = device.as_native();
        tracing::debug!(node = %node.path().display(), "created GBM device");

        let mut resources = Resources {
            egl: instance,
            display: None,
            context: None,
            device: Some(device),
            node: Some(node),
        };
        let api = &resources.egl;

        // SAFETY: `native_display` is a live gbm_device owned by `resources`.
        let display = unsafe {
            api.get_platform_display(
                PLATFORM_GBM_MESA,
                native_display,
                &[egl::NONE as egl::Attrib],
            )
        }
        .map_err(|err| ProbeError::acquire(InitStage::GetDisplay, err))?;
        resources.display = Some(display);

        let (major, minor) = api
            .initialize(display)
            .map_err(|err| ProbeError::acquire(InitStage::InitializeDisplay, err))?;
        tracing::debug!(major, minor, "initialised EGL display");

        let egl_extensions = api
            .query_string(Some(display), egl::EXTENSIONS)
            .map_err(|err| ProbeError::acquire(InitStage::CheckExtensions, err))?
            .to_string_lossy()
            .into_owned();
        require_extensions(&egl_extensions)?;

        let egl_config = api
            .choose_first_config(display, &CONFIG_ATTRIBUTES)
            .map_err(|err| ProbeError::acquire(InitStage::ChooseConfig, err))?
            .ok_or(ProbeError::NoMatchingConfig)?;

        api.bind_api(egl::OPENGL_ES_API)
            .map_err(|err| ProbeError::BindApi {
                reason: err.to_string(),
            })?;

        let context = api
            .create_context(display, egl_config, None, &CONTEXT_ATTRIBUTES)
            .map_err(|err| ProbeError::acquire(InitStage::CreateContext, err))?;
        resources.context = Some(context);

        api.make_current(display, None, None, Some(context))
            .map_err(|err| ProbeError::acquire(InitStage::MakeCurrent, err))?;

        if api.get_proc_address(COMPUTE_ENTRY_POINT).is_none() {
            return Err(ProbeError::acquire(
                InitStage::LoadGl,
                format!("driver does not export {COMPUTE_ENTRY_POINT}"),
            ));
        }
        // SAFETY: the context is current; symbols resolve against it.
        let gl = unsafe {
            glow::Context::from_loader_function(|name| {
                api.get_proc_address(name)
                    .map_or(ptr::null(), |func| func as *const c_void)
            })
        };
        let version = gl.version();
        if !version.is_embedded || (version.major, version.minor) < (3, 1) {
            return Err(ProbeError::NoComputeSupport {
                major: version.major,
                minor: version.minor,
            });
        }
        tracing::info!(
            node = %config.render_node.display(),
            egl_major = major,
            egl_minor = minor,
            gles_major = version.major,
            gles_minor = version.minor,
            "headless context is current"
        );

        Ok(Self {
            gl,
            resources,
            display,
            context,
            egl_version: (major, minor),
            egl_extensions,
            _thread_bound: PhantomData,
        })
    }

    /// GL function table for the current context.
    pub fn gl(&self) -> &glow::Context {
        &self.gl
    }

    pub fn egl_version(&self) -> (i32, i32) {
        self.egl_version
    }

    /// Fails unless this context is the one current on the calling thread.
    pub fn ensure_current(&self) -> Result<()> {
        match self.resources.egl.get_current_context() {
            Some(current) if current == self.context => Ok(()),
            _ => Err(ProbeError::ContextNotCurrent),
        }
    }

    /// Makes this context current again, e.g. after foreign code rebound another one.
    pub fn make_current(&self) -> Result<()> {
        self.resources
            .egl
            .make_current(self.display, None, None, Some(self.context))
            .map_err(|err| ProbeError::acquire(InitStage::MakeCurrent, err))
    }

    /// Returns `Err` if the GL error flag is set; `call` names the preceding GL call.
    pub(crate) fn check_error(&self, call: &'static str) -> Result<()> {
        // SAFETY: glGetError has no preconditions beyond a current context.
        let code = unsafe { self.gl.get_error() };
        if code == glow::NO_ERROR {
            Ok(())
        } else {
            tracing::error!(call, code, "GL call failed");
            Err(ProbeError::Gl { call, code })
        }
    }

    /// Queries the driver identification strings.
    pub fn driver_info(&self) -> DriverInfo {
        let gl = &self.gl;
        // SAFETY: these enums are always valid for glGetString on a current ES 3 context.
        let (vendor, renderer, version, shading_language) = unsafe {
            (
                gl.get_parameter_string(glow::VENDOR),
                gl.get_parameter_string(glow::RENDERER),
                gl.get_parameter_string(glow::VERSION),
                gl.get_parameter_string(glow::SHADING_LANGUAGE_VERSION),
            )
        };
        let mut gl_extensions: Vec<String> = gl.supported_extensions().iter().cloned().collect();
        gl_extensions.sort_unstable();

        DriverInfo {
            egl_version: self.egl_version,
            vendor,
            renderer,
            version,
            shading_language,
            egl_extensions: self.egl_extensions.clone(),
            gl_extensions,
        }
    }

    /// Blocks until all previously submitted GL work has completed.
    pub fn wait_idle(&self, timeout: Duration) -> Result<()> {
        self.ensure_current()?;
        let gl = &self.gl;
        // SAFETY: the context is current.
        let fence = unsafe { gl.fence_sync(glow::SYNC_GPU_COMMANDS_COMPLETE, 0) }.map_err(
            |reason| ProbeError::GlObject {
                call: "glFenceSync",
                reason,
            },
        )?;

        let started = Instant::now();
        // `None` when the timeout is too large to represent: wait without a deadline.
        let deadline = started.checked_add(timeout);
        let mut flags = glow::SYNC_FLUSH_COMMANDS_BIT;
        let outcome = loop {
            let slice = wait_slice(deadline, Instant::now());
            // SAFETY: `fence` is a live sync object created above.
            let status = unsafe { gl.client_wait_sync(fence, flags, slice) };
            flags = 0;
            match status {
                glow::ALREADY_SIGNALED | glow::CONDITION_SATISFIED => break Ok(()),
                glow::TIMEOUT_EXPIRED if !deadline_passed(deadline, Instant::now()) => continue,
                glow::TIMEOUT_EXPIRED => {
                    break Err(ProbeError::FenceTimeout {
                        timeout_ms: timeout.as_millis(),
                    })
                }
                other => break Err(ProbeError::FenceFailed { status: other }),
            }
        };
        // SAFETY: deleted exactly once.
        unsafe { gl.delete_sync(fence) };

        if outcome.is_ok() {
            tracing::debug!(elapsed = ?started.elapsed(), "GPU work completed");
        }
        outcome
    }

    /// Destroys the context, terminates the display and destroys the device, in that order.
    ///
    /// Taking `self` by value rules out a second call and, since every
    /// [`crate::ComputeProgram`] borrows its context, also rules out tearing down while a
    /// program is still alive.
    pub fn shutdown(mut self) -> TeardownReport {
        let report = self.resources.release();
        if report.is_clean() {
            tracing::info!("headless context shut down");
        } else {
            tracing::warn!(
                failures = report.failures.len(),
                "headless context shut down with errors"
            );
        }
        report
    }
}

/// Nanoseconds to block in one `glClientWaitSync` call.
fn wait_slice(deadline: Option<Instant>, now: Instant) -> i32 {
    match deadline {
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(now);
            i32::try_from(remaining.as_nanos()).unwrap_or(i32::MAX)
        }
        None => i32::MAX,
    }
}

fn deadline_passed(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.is_some_and(|deadline| now >= deadline)
}

/// Whole-token match against a space-separated extension string.
pub fn has_extension(extensions: &str, name: &str) -> bool {
    extensions.split_ascii_whitespace().any(|ext| ext == name)
}

fn require_extensions(extensions: &str) -> Result<()> {
    for extension in REQUIRED_EGL_EXTENSIONS {
        if !has_extension(extensions, extension) {
            tracing::error!(extension, "required EGL extension missing");
            return Err(ProbeError::MissingExtension { extension });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn extension_match_requires_whole_token() {
        let list = "EGL_KHR_create_context_no_error EGL_KHR_surfaceless_context";
        assert!(!has_extension(list, "EGL_KHR_create_context"));
        assert!(has_extension(list, "EGL_KHR_surfaceless_context"));
        assert!(!has_extension("", "EGL_KHR_surfaceless_context"));
    }

    #[test]
    fn both_required_extensions_must_be_present() {
        let err = require_extensions("EGL_KHR_create_context EGL_MESA_platform_gbm").unwrap_err();
        assert!(matches!(
            err,
            ProbeError::MissingExtension {
                extension: "EGL_KHR_surfaceless_context"
            }
        ));
        assert_eq!(err.kind(), ErrorKind::CapabilityMismatch);

        require_extensions("EGL_KHR_surfaceless_context\tEGL_KHR_create_context\n").unwrap();
    }

    #[test]
    fn unrepresentable_deadline_waits_in_full_slices() {
        let now = Instant::now();
        let deadline = now.checked_add(Duration::MAX);
        assert!(deadline.is_none());
        assert_eq!(wait_slice(deadline, now), i32::MAX);
        assert!(!deadline_passed(deadline, now));
    }

    #[test]
    fn wait_slice_shrinks_to_the_deadline() {
        let now = Instant::now();
        let deadline = Some(now + Duration::from_millis(2));
        assert_eq!(wait_slice(deadline, now), 2_000_000);
        assert!(!deadline_passed(deadline, now));

        let later = now + Duration::from_secs(1);
        assert_eq!(wait_slice(deadline, later), 0);
        assert!(deadline_passed(deadline, later));

        let far = Some(now + Duration::from_secs(60));
        assert_eq!(wait_slice(far, now), i32::MAX);
    }

    /// Stand-in for [`Resources`] recording which release steps ran.
    #[derive(Default)]
    struct Held {
        context: bool,
        display: bool,
        device: bool,
        node: bool,
        fail_display: bool,
        calls: Vec<Release>,
    }

    impl Teardown for Held {
        fn release_step(&mut self, step: Release) -> Option<Result<(), String>> {
            self.calls.push(step);
            let held = match step {
                Release::Context => std::mem::take(&mut self.context),
                Release::Display => std::mem::take(&mut self.display),
                Release::Device => std::mem::take(&mut self.device),
                Release::Node => std::mem::take(&mut self.node),
            };
            if !held {
                return None;
            }
            if step == Release::Display && self.fail_display {
                return Some(Err("EGL_BAD_DISPLAY".into()));
            }
            Some(Ok(()))
        }
    }

    #[test]
    fn failure_after_display_init_releases_what_was_acquired() {
        // State when eglInitialize succeeded but a later step failed: no context yet.
        let mut held = Held {
            display: true,
            device: true,
            node: true,
            ..Held::default()
        };
        let report = release_all(&mut held);
        assert!(report.is_clean());
        assert_eq!(
            report.released,
            vec![Release::Display, Release::Device, Release::Node]
        );
        assert_eq!(held.calls, Release::ORDER.to_vec());

        // A second pass finds nothing left to release.
        assert_eq!(release_all(&mut held), TeardownReport::default());
    }

    #[test]
    fn failing_release_step_does_not_stop_teardown() {
        let mut held = Held {
            context: true,
            display: true,
            device: true,
            node: true,
            fail_display: true,
            ..Held::default()
        };
        let report = release_all(&mut held);
        assert!(!report.is_clean());
        assert_eq!(
            report.failures,
            vec![(Release::Display, "EGL_BAD_DISPLAY".to_string())]
        );
        assert_eq!(
            report.released,
            vec![Release::Context, Release::Device, Release::Node]
        );
    }

    #[test]
    fn render_node_opens_read_write() {
        let file = NamedTempFile::new().unwrap();
        let node = RenderNode::open(file.path()).unwrap();
        assert_eq!(node.path(), file.path());
    }

    #[test]
    fn missing_render_node_fails_before_anything_else() {
        let dir = TempDir::new().unwrap();
        let config = ContextConfig {
            render_node: dir.path().join("renderD128"),
        };
        let err = match HeadlessContext::initialize(&config) {
            Ok(_) => panic!("initialisation must fail without a render node"),
            Err(err) => err,
        };
        assert!(matches!(err, ProbeError::OpenNode { .. }));
        assert_eq!(err.kind(), ErrorKind::ResourceAcquisition);
    }
}
