//! Runtime binding to `libgbm`.
//!
//! Only the two entry points the probe needs are resolved. Loading at runtime keeps a host
//! without Mesa's GBM from failing at link time; the probe reports it as an acquisition error
//! instead.

use std::ffi::{c_int, c_void};
use std::os::fd::{AsRawFd, BorrowedFd};
use std::ptr::NonNull;

use libloading::Library;

use crate::error::{ProbeError, Result};
use crate::types::InitStage;

const LIBRARY_NAMES: [&str; 2] = ["libgbm.so.1", "libgbm.so"];

type CreateDeviceFn = unsafe extern "C" fn(fd: c_int) -> *mut c_void;
type DestroyDeviceFn = unsafe extern "C" fn(device: *mut c_void);

pub(crate) struct GbmLibrary {
    create_device: CreateDeviceFn,
    destroy_device: DestroyDeviceFn,
    // Keeps the resolved function pointers valid.
    _library: Library,
}

impl GbmLibrary {
    pub(crate) fn load() -> Result<Self> {
        Self::load_from(&LIBRARY_NAMES)
    }

    fn load_from(names: &[&str]) -> Result<Self> {
        let mut failures = Vec::with_capacity(names.len());
        for name in names {
            // SAFETY: libgbm has no initialisation side effects on load.
            match unsafe { Library::new(name) } {
                Ok(library) => {
                    tracing::debug!(library = name, "loaded GBM library");
                    return Self::resolve(library);
                }
                Err(err) => failures.push(format!("{name}: {err}")),
            }
        }
        Err(ProbeError::LoadLibrary {
            library: "libgbm",
            reason: failures.join("; "),
        })
    }

    fn resolve(library: Library) -> Result<Self> {
        let missing = |symbol: &str, err: libloading::Error| ProbeError::LoadLibrary {
            library: "libgbm",
            reason: format!("missing symbol {symbol}: {err}"),
        };
        // SAFETY: the signatures match gbm.h.
        let create_device = unsafe {
            *library
                .get::<CreateDeviceFn>(b"gbm_create_device\0")
                .map_err(|err| missing("gbm_create_device", err))?
        };
        let destroy_device = unsafe {
            *library
                .get::<DestroyDeviceFn>(b"gbm_device_destroy\0")
                .map_err(|err| missing("gbm_device_destroy", err))?
        };
        Ok(Self {
            create_device,
            destroy_device,
            _library: library,
        })
    }
}

/// A GBM device bound to an open render node.
///
/// The node's descriptor must stay open for as long as the device exists.
pub(crate) struct GbmDevice {
    raw: NonNull<c_void>,
    library: GbmLibrary,
}

impl GbmDevice {
    pub(crate) fn create(library: GbmLibrary, node: BorrowedFd<'_>) -> Result<Self> {
        // SAFETY: `node` is a valid descriptor for the duration of the call.
        let raw = unsafe { (library.create_device)(node.as_raw_fd()) };
        let raw = NonNull::new(raw).ok_or_else(|| {
            ProbeError::acquire(InitStage::CreateDevice, "gbm_create_device returned NULL")
        })?;
        Ok(Self { raw, library })
    }

    /// Native display handle passed to `eglGetPlatformDisplay`.
    pub(crate) fn as_native(&self) -> *mut c_void {
        self.raw.as_ptr()
    }
}

impl Drop for GbmDevice {
    fn drop(&mut self) {
        // SAFETY: `raw` came from gbm_create_device and is destroyed exactly once.
        unsafe { (self.library.destroy_device)(self.raw.as_ptr()) };
        tracing::debug!("destroyed GBM device");
    }
}
