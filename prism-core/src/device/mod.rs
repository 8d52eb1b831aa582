//! Render-device adapter.
//!
//! The only part of the bridge that knows how to talk to a rendering
//! library. Everything above it (dispatcher, frame streamer, resource
//! manager) speaks [`RenderDevice`] and [`Backend`]; swapping the
//! library swaps only an implementation of these traits.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::datatype::{DataType, Parameter};
use crate::resources::ArrayInfo;

pub mod null;

// ── ObjectHandle ─────────────────────────────────────────────────

/// An opaque handle minted by a rendering device. Never re-used.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(pub u64);

// Handles are rewritten in place inside 8-byte array slots; the wire
// protocol is unsound if a handle is ever any other width.
const _: () = assert!(std::mem::size_of::<ObjectHandle>() == 8);

impl ObjectHandle {
    pub const NULL: ObjectHandle = ObjectHandle(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

// ── WaitMask ─────────────────────────────────────────────────────

/// Flags controlling whether `frame_ready` blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitMask(pub u32);

impl WaitMask {
    pub const NO_WAIT: WaitMask = WaitMask(0);
    pub const WAIT: WaitMask = WaitMask(1);
}

// ── Status reporting ─────────────────────────────────────────────

/// Severity classes of the rendering API's status stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusSeverity {
    FatalError,
    Error,
    Warning,
    PerformanceWarning,
    Info,
    Debug,
}

/// Sink for device status messages.
///
/// Carries the session's verbosity instead of reading a process-wide
/// flag; a device holds a clone and reports through it from whatever
/// context the library calls back on.
#[derive(Debug, Clone)]
pub struct StatusSink {
    verbose: bool,
}

impl StatusSink {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    /// Forward one status message. Low-severity classes are gated by
    /// the verbose flag. Status never ends the session.
    pub fn report(&self, severity: StatusSeverity, message: &str) {
        match severity {
            StatusSeverity::FatalError => error!(target: "prism::device", "[FATAL] {message}"),
            StatusSeverity::Error => error!(target: "prism::device", "{message}"),
            StatusSeverity::Warning => warn!(target: "prism::device", "{message}"),
            StatusSeverity::PerformanceWarning if self.verbose => {
                warn!(target: "prism::device", "[PERF] {message}")
            }
            StatusSeverity::Info if self.verbose => info!(target: "prism::device", "{message}"),
            StatusSeverity::Debug if self.verbose => debug!(target: "prism::device", "{message}"),
            _ => {}
        }
    }
}

// ── Query results ────────────────────────────────────────────────

/// A mapped framebuffer channel, valid only while the device borrow
/// lives.
#[derive(Debug)]
pub struct MappedFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub ty: DataType,
}

/// Result of a `get_property` query.
#[derive(Debug, Clone)]
pub struct PropertyReply {
    /// The API's integer result code (1 = property present).
    pub result: i32,
    pub value: PropertyValue,
}

/// Property payload shaped by the requested type.
#[derive(Debug, Clone)]
pub enum PropertyValue {
    /// POD payload; always exactly the requested size.
    Bytes(Vec<u8>),
    StringList(Vec<String>),
}

/// Value of an object- or parameter-info query, shaped by `info_type`.
#[derive(Debug, Clone)]
pub enum InfoValue {
    Bytes(Vec<u8>),
    String(String),
    StringList(Vec<String>),
    ParameterList(Vec<Parameter>),
}

// ── RenderDevice ─────────────────────────────────────────────────

/// Narrow capability set over one rendering device.
///
/// Called only from the dispatcher; implementations need not be
/// internally synchronized.
pub trait RenderDevice: Send {
    /// The device's own handle (target of device-level commits and
    /// device property queries).
    fn device_handle(&self) -> ObjectHandle;

    /// Construct an object of the given kind and subtype. Kinds the
    /// device cannot construct yield [`ObjectHandle::NULL`].
    fn new_object(&mut self, ty: DataType, subtype: &str) -> ObjectHandle;

    /// Construct an (unseeded) array described by `info`.
    fn new_array(&mut self, info: &ArrayInfo) -> ObjectHandle;

    fn set_parameter(&mut self, object: ObjectHandle, name: &str, ty: DataType, value: &[u8]);
    fn unset_parameter(&mut self, object: ObjectHandle, name: &str);
    fn unset_all_parameters(&mut self, object: ObjectHandle);
    fn commit_parameters(&mut self, object: ObjectHandle);

    fn retain(&mut self, object: ObjectHandle);
    fn release(&mut self, object: ObjectHandle);

    /// Map an array's backing store for read or write.
    fn map_array(&mut self, array: ObjectHandle) -> Option<&mut [u8]>;
    fn unmap_array(&mut self, array: ObjectHandle);

    fn render_frame(&mut self, frame: ObjectHandle);

    /// Wait (or poll, per the mask) for frame completion.
    fn frame_ready(&mut self, frame: ObjectHandle, wait: WaitMask) -> bool;

    /// Map one named channel of a rendered frame.
    fn map_frame(&mut self, frame: ObjectHandle, channel: &str) -> Option<MappedFrame<'_>>;

    fn get_property(
        &mut self,
        object: ObjectHandle,
        name: &str,
        ty: DataType,
        size: usize,
        wait: WaitMask,
    ) -> PropertyReply;

    fn get_object_subtypes(&mut self, ty: DataType) -> Vec<String>;

    fn get_object_info(
        &mut self,
        ty: DataType,
        subtype: &str,
        info_name: &str,
        info_type: DataType,
    ) -> Option<InfoValue>;

    #[allow(clippy::too_many_arguments)]
    fn get_parameter_info(
        &mut self,
        ty: DataType,
        subtype: &str,
        parameter: &str,
        parameter_type: DataType,
        info_name: &str,
        info_type: DataType,
    ) -> Option<InfoValue>;
}

// ── Backend ──────────────────────────────────────────────────────

/// A loaded rendering library: a factory for devices.
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    /// Instantiate a device of the named subtype.
    fn new_device(&self, subtype: &str, status: StatusSink) -> Box<dyn RenderDevice>;
}

/// Registry of loaded backends, keyed by library name.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// A registry holding the built-in backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(null::NullBackend));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
