//! Built-in in-memory reference backend.
//!
//! Stores parameters and arrays byte-accurately and renders a
//! deterministic test pattern, which makes it the default backend for
//! running the server without a real rendering library and the device
//! under test for the integration suite. Handles are minted from a
//! monotonic counter and never re-used.

use std::collections::HashMap;

use crate::datatype::{DataType, Parameter};
use crate::device::{
    Backend, InfoValue, MappedFrame, ObjectHandle, PropertyReply, PropertyValue, RenderDevice,
    StatusSeverity, StatusSink, WaitMask,
};
use crate::resources::ArrayInfo;

/// Frame size used when a frame object has no "size" parameter.
const DEFAULT_FRAME_SIZE: (u32, u32) = (64, 64);

// ── Backend ──────────────────────────────────────────────────────

/// Factory for [`NullDevice`].
pub struct NullBackend;

impl Backend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    fn new_device(&self, subtype: &str, status: StatusSink) -> Box<dyn RenderDevice> {
        Box::new(NullDevice::new(subtype, status))
    }
}

// ── Device state ─────────────────────────────────────────────────

struct RenderedChannel {
    data: Vec<u8>,
    width: u32,
    height: u32,
    ty: DataType,
}

struct ObjectSlot {
    ty: DataType,
    params: HashMap<String, (DataType, Vec<u8>)>,
    refcount: u32,
    /// Backing store for array objects.
    array: Option<Vec<u8>>,
    /// Rendered planes for frame objects, keyed by channel name.
    channels: HashMap<String, RenderedChannel>,
}

impl ObjectSlot {
    fn new(ty: DataType) -> Self {
        Self {
            ty,
            params: HashMap::new(),
            refcount: 1,
            array: None,
            channels: HashMap::new(),
        }
    }
}

/// In-memory rendering device.
pub struct NullDevice {
    status: StatusSink,
    next_handle: u64,
    device_handle: ObjectHandle,
    objects: HashMap<u64, ObjectSlot>,
}

impl NullDevice {
    pub fn new(subtype: &str, status: StatusSink) -> Self {
        let mut device = Self {
            status,
            next_handle: 0x1000,
            device_handle: ObjectHandle::NULL,
            objects: HashMap::new(),
        };
        let handle = device.mint();
        device.device_handle = handle;
        device.objects.insert(handle.0, ObjectSlot::new(DataType::Device));
        device
            .status
            .report(StatusSeverity::Info, &format!("null device '{subtype}' created"));
        device
    }

    fn mint(&mut self) -> ObjectHandle {
        let handle = ObjectHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }

    fn slot(&mut self, handle: ObjectHandle) -> Option<&mut ObjectSlot> {
        self.objects.get_mut(&handle.0)
    }

    fn param_u32_pair(&self, handle: ObjectHandle, name: &str) -> Option<(u32, u32)> {
        let (_, bytes) = self.objects.get(&handle.0)?.params.get(name)?;
        if bytes.len() < 8 {
            return None;
        }
        let a = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let b = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Some((a, b))
    }

    fn channel_type(&self, handle: ObjectHandle, name: &str, default: DataType) -> Option<DataType> {
        let slot = self.objects.get(&handle.0)?;
        match slot.params.get(name) {
            Some((_, bytes)) if bytes.len() >= 4 => {
                let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                Some(DataType::try_from(raw).unwrap_or(default))
            }
            Some(_) => Some(default),
            None => None,
        }
    }

    /// Deterministic x/y gradient, 4 bytes per pixel.
    fn gradient(width: u32, height: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push((x * 255 / width.max(2).saturating_sub(1)) as u8);
                data.push((y * 255 / height.max(2).saturating_sub(1)) as u8);
                data.push(0x80);
                data.push(0xFF);
            }
        }
        data
    }
}

impl RenderDevice for NullDevice {
    fn device_handle(&self) -> ObjectHandle {
        self.device_handle
    }

    fn new_object(&mut self, ty: DataType, _subtype: &str) -> ObjectHandle {
        if !ty.is_object() || ty.is_array() || ty == DataType::Device {
            self.status.report(
                StatusSeverity::Error,
                &format!("cannot construct object of type {ty}"),
            );
            return ObjectHandle::NULL;
        }
        let handle = self.mint();
        self.objects.insert(handle.0, ObjectSlot::new(ty));
        handle
    }

    fn new_array(&mut self, info: &ArrayInfo) -> ObjectHandle {
        let Some(size) = info.byte_size() else {
            self.status.report(
                StatusSeverity::Error,
                &format!("array element type {} has no fixed width", info.element_type),
            );
            return ObjectHandle::NULL;
        };
        let handle = self.mint();
        let mut slot = ObjectSlot::new(info.kind);
        slot.array = Some(vec![0u8; size as usize]);
        self.objects.insert(handle.0, slot);
        handle
    }

    fn set_parameter(&mut self, object: ObjectHandle, name: &str, ty: DataType, value: &[u8]) {
        if let Some(slot) = self.slot(object) {
            slot.params.insert(name.to_string(), (ty, value.to_vec()));
        }
    }

    fn unset_parameter(&mut self, object: ObjectHandle, name: &str) {
        if let Some(slot) = self.slot(object) {
            slot.params.remove(name);
        }
    }

    fn unset_all_parameters(&mut self, object: ObjectHandle) {
        if let Some(slot) = self.slot(object) {
            slot.params.clear();
        }
    }

    fn commit_parameters(&mut self, object: ObjectHandle) {
        self.status
            .report(StatusSeverity::Debug, &format!("committed {object}"));
    }

    fn retain(&mut self, object: ObjectHandle) {
        if let Some(slot) = self.slot(object) {
            slot.refcount = slot.refcount.saturating_add(1);
        }
    }

    fn release(&mut self, object: ObjectHandle) {
        let Some(slot) = self.slot(object) else {
            return;
        };
        slot.refcount = slot.refcount.saturating_sub(1);
        if slot.refcount == 0 {
            // Slots are never reclaimed; the handle just goes inert.
            let ty = slot.ty;
            self.status
                .report(StatusSeverity::Debug, &format!("{object} ({ty}) released"));
        }
    }

    fn map_array(&mut self, array: ObjectHandle) -> Option<&mut [u8]> {
        self.slot(array)?.array.as_deref_mut()
    }

    fn unmap_array(&mut self, _array: ObjectHandle) {
        // Backing stores persist; nothing to flush.
    }

    fn render_frame(&mut self, frame: ObjectHandle) {
        let (width, height) = self
            .param_u32_pair(frame, "size")
            .unwrap_or(DEFAULT_FRAME_SIZE);

        // Color renders unless explicitly disabled; depth only when the
        // frame declared the channel.
        let color_ty = self
            .channel_type(frame, "channel.color", DataType::UFixed8RgbaSrgb)
            .unwrap_or(DataType::UFixed8RgbaSrgb);
        let depth_ty = self.channel_type(frame, "channel.depth", DataType::Float32);

        let Some(slot) = self.slot(frame) else {
            return;
        };
        slot.channels.clear();

        if color_ty.size_of() == Some(4) {
            slot.channels.insert(
                "channel.color".to_string(),
                RenderedChannel {
                    data: Self::gradient(width, height),
                    width,
                    height,
                    ty: color_ty,
                },
            );
        }

        if let Some(ty) = depth_ty {
            let data = if ty == DataType::Float32 {
                (0..width * height)
                    .flat_map(|_| 1.0f32.to_le_bytes())
                    .collect()
            } else {
                vec![0u8; (width * height) as usize * ty.size_of().unwrap_or(0)]
            };
            slot.channels.insert(
                "channel.depth".to_string(),
                RenderedChannel {
                    data,
                    width,
                    height,
                    ty,
                },
            );
        }

        self.status
            .report(StatusSeverity::Debug, &format!("rendered frame {frame}"));
    }

    fn frame_ready(&mut self, _frame: ObjectHandle, _wait: WaitMask) -> bool {
        // Rendering is synchronous; frames are always complete.
        true
    }

    fn map_frame(&mut self, frame: ObjectHandle, channel: &str) -> Option<MappedFrame<'_>> {
        let rendered = self.objects.get(&frame.0)?.channels.get(channel)?;
        Some(MappedFrame {
            data: &rendered.data,
            width: rendered.width,
            height: rendered.height,
            ty: rendered.ty,
        })
    }

    fn get_property(
        &mut self,
        object: ObjectHandle,
        name: &str,
        ty: DataType,
        size: usize,
        _wait: WaitMask,
    ) -> PropertyReply {
        if ty == DataType::StringList {
            return PropertyReply {
                result: 0,
                value: PropertyValue::StringList(Vec::new()),
            };
        }

        let mut bytes = vec![0u8; size];
        let stored = self
            .objects
            .get(&object.0)
            .and_then(|slot| slot.params.get(name));
        match stored {
            Some((_, value)) => {
                let n = value.len().min(size);
                bytes[..n].copy_from_slice(&value[..n]);
                PropertyReply {
                    result: 1,
                    value: PropertyValue::Bytes(bytes),
                }
            }
            None => PropertyReply {
                result: 0,
                value: PropertyValue::Bytes(bytes),
            },
        }
    }

    fn get_object_subtypes(&mut self, ty: DataType) -> Vec<String> {
        let subtypes: &[&str] = match ty {
            DataType::Camera => &["perspective", "orthographic"],
            DataType::Renderer => &["default", "raycast"],
            DataType::Geometry => &["triangle", "sphere"],
            DataType::Light => &["directional", "point"],
            _ => &[],
        };
        subtypes.iter().map(|s| s.to_string()).collect()
    }

    fn get_object_info(
        &mut self,
        ty: DataType,
        subtype: &str,
        info_name: &str,
        info_type: DataType,
    ) -> Option<InfoValue> {
        match (info_name, info_type) {
            ("description", DataType::String) => {
                Some(InfoValue::String(format!("null {ty} '{subtype}'")))
            }
            ("parameter", DataType::ParameterList) if ty == DataType::Renderer => {
                Some(InfoValue::ParameterList(vec![
                    Parameter {
                        name: "background".into(),
                        ty: DataType::Float32Vec4,
                    },
                    Parameter {
                        name: "ambientRadiance".into(),
                        ty: DataType::Float32,
                    },
                ]))
            }
            _ => None,
        }
    }

    fn get_parameter_info(
        &mut self,
        _ty: DataType,
        _subtype: &str,
        parameter: &str,
        _parameter_type: DataType,
        info_name: &str,
        info_type: DataType,
    ) -> Option<InfoValue> {
        match (info_name, info_type) {
            ("description", DataType::String) => {
                Some(InfoValue::String(format!("parameter '{parameter}'")))
            }
            ("required", DataType::Bool) => Some(InfoValue::Bytes(vec![0, 0, 0, 0])),
            _ => None,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
