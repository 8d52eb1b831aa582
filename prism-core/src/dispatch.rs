//! Protocol dispatcher.
//!
//! A state-free function-of-message: decode the opcode, look the
//! handler up in the dispatch table, parse the payload with a
//! positional cursor, drive the render device, and return the ordered
//! replies for the work queue. Failure policy is log-and-continue —
//! bad opcodes, short payloads, and unknown ids drop the message and
//! keep the connection; only I/O errors and the unimplemented
//! `DATA_TYPE_LIST` query end the session.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::compress::CompressionFeatures;
use crate::datatype::DataType;
use crate::device::{Backend, InfoValue, PropertyValue, StatusSink, WaitMask};
use crate::error::PrismError;
use crate::frame::{channel_reply, FrameChannel};
use crate::opcode::Opcode;
use crate::payload::{PayloadReader, PayloadWriter};
use crate::resources::{ArrayInfo, ResourceManager};
use crate::wire::Message;

type Handler = fn(&mut Dispatcher, &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError>;

/// Dispatch table keyed by opcode. Reply-direction opcodes have no
/// handler; they are dropped with a warning if a client sends them.
fn handler_for(opcode: Opcode) -> Option<Handler> {
    use Opcode::*;
    Some(match opcode {
        NewDevice => Dispatcher::on_new_device,
        NewObject => Dispatcher::on_new_object,
        NewArray => Dispatcher::on_new_array,
        SetParam => Dispatcher::on_set_param,
        UnsetParam => Dispatcher::on_unset_param,
        UnsetAllParams => Dispatcher::on_unset_all_params,
        CommitParams => Dispatcher::on_commit_params,
        Release => Dispatcher::on_release,
        Retain => Dispatcher::on_retain,
        MapArray => Dispatcher::on_map_array,
        UnmapArray => Dispatcher::on_unmap_array,
        RenderFrame => Dispatcher::on_render_frame,
        FrameReady => Dispatcher::on_frame_ready,
        GetProperty => Dispatcher::on_get_property,
        GetObjectSubtypes => Dispatcher::on_get_object_subtypes,
        GetObjectInfo => Dispatcher::on_get_object_info,
        GetParameterInfo => Dispatcher::on_get_parameter_info,
        _ => return None,
    })
}

/// Per-session message dispatcher.
///
/// Owns the resource manager and the negotiated compression state.
/// Called only from the connection's reader task; rendering-API calls
/// happen on that task, which is what serializes them.
pub struct Dispatcher {
    resources: ResourceManager,
    backend: Arc<dyn Backend>,
    verbose: bool,
    server_features: CompressionFeatures,
    client_features: CompressionFeatures,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn Backend>, verbose: bool) -> Self {
        Self {
            resources: ResourceManager::new(),
            backend,
            verbose,
            server_features: CompressionFeatures::server(),
            client_features: CompressionFeatures::none(),
        }
    }

    /// Interpret one message and produce its replies, in order.
    ///
    /// Returns `Err` only for fatal conditions; everything else has
    /// already been logged and yields an empty reply list.
    pub fn dispatch(&mut self, message: &Message) -> Result<Vec<Message>, PrismError> {
        let opcode = match message.opcode() {
            Ok(op) => op,
            Err(e) => {
                warn!("dropping message: {e}");
                return Ok(Vec::new());
            }
        };
        debug!("message: {opcode}, {} payload bytes", message.payload_len());

        let Some(handler) = handler_for(opcode) else {
            warn!("unhandled {opcode} message of {} bytes", message.payload_len());
            return Ok(Vec::new());
        };

        let mut reader = PayloadReader::new(message.payload());
        match handler(self, &mut reader) {
            Ok(replies) => Ok(replies),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) if e.is_violation() => {
                warn!("{opcode}: {e}");
                Ok(Vec::new())
            }
            Err(e) => {
                error!("{opcode}: {e}");
                Ok(Vec::new())
            }
        }
    }

    // ── Device lifecycle ─────────────────────────────────────────

    fn on_new_device(&mut self, r: &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError> {
        let subtype = r.string()?;
        self.client_features = CompressionFeatures::from_bits(r.u32()?);

        let device = self
            .backend
            .new_device(&subtype, StatusSink::new(self.verbose));
        let device_id = self.resources.register_device(device);

        info!("new device '{subtype}', device id {device_id}");
        info!(
            "client codecs: color={}, depth={}",
            self.client_features.color_jpeg, self.client_features.depth_zstd
        );

        let mut out = PayloadWriter::new();
        out.u64(device_id).u32(self.server_features.bits());
        Ok(vec![Message::new(Opcode::DeviceHandle, out.freeze())])
    }

    // ── Object / array construction ──────────────────────────────

    fn on_new_object(&mut self, r: &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let ty = r.data_type()?;
        let subtype = r.string()?;
        let object_id = r.u64()?;

        let device = self.resources.device_mut(device_id)?;
        let handle = device.new_object(ty, &subtype);
        // Unconstructible kinds leave a null handle in the record.
        self.resources
            .register_object(device_id, object_id, handle, ty)?;

        info!("new object {object_id} ({ty}), handle {handle}");
        Ok(Vec::new())
    }

    fn on_new_array(&mut self, r: &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let kind = r.data_type()?;
        if kind.array_rank().is_none() {
            return Err(PrismError::Protocol("NEW_ARRAY kind is not a ranked array"));
        }
        let object_id = r.u64()?;
        let element_type = r.data_type()?;
        let info = ArrayInfo {
            kind,
            element_type,
            items1: r.u64()?,
            items2: r.u64()?,
            items3: r.u64()?,
        };

        self.resources.device_mut(device_id)?;
        let seed = if r.at_end() {
            None
        } else {
            Some(self.read_array_data(device_id, &info, r)?)
        };

        let device = self.resources.device_mut(device_id)?;
        let handle = device.new_array(&info);
        if let Some(data) = &seed {
            if !handle.is_null() {
                if let Some(store) = device.map_array(handle) {
                    let n = data.len().min(store.len());
                    store[..n].copy_from_slice(&data[..n]);
                }
                device.unmap_array(handle);
            }
        }
        self.resources
            .register_array(device_id, object_id, handle, info)?;

        info!("new array {object_id} ({kind}), handle {handle}");
        Ok(Vec::new())
    }

    /// Read an array payload, rejecting short data outright, and
    /// rewrite object ids to native handles when the element type is
    /// an object kind.
    fn read_array_data(
        &self,
        device_id: u64,
        info: &ArrayInfo,
        r: &mut PayloadReader<'_>,
    ) -> Result<Vec<u8>, PrismError> {
        let size = info
            .byte_size()
            .ok_or(PrismError::Protocol("array element type has no fixed width"))?;
        let mut data = r.bytes(size as usize)?.to_vec();
        if info.element_type.is_object() {
            self.resources.translate_handles(device_id, &mut data)?;
        }
        Ok(data)
    }

    // ── Parameters ───────────────────────────────────────────────

    fn on_set_param(&mut self, r: &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let object_id = r.u64()?;
        let target = self.resources.object(device_id, object_id)?;

        let name = r.string()?;
        let ty = r.data_type()?;

        if ty.is_object() {
            // The payload carries a client object id; the device gets
            // the native handle instead.
            let mut raw = [0u8; 8];
            raw.copy_from_slice(r.bytes(8)?);
            let ref_id = u64::from_le_bytes(raw);
            let referenced = self.resources.object(device_id, ref_id)?;

            let device = self.resources.device_mut(device_id)?;
            device.set_parameter(target.handle, &name, ty, &referenced.handle.0.to_le_bytes());
            info!(
                "set param \"{name}\" on object {object_id}: object ref {ref_id} -> {}",
                referenced.handle
            );
        } else {
            let size = ty
                .size_of()
                .ok_or(PrismError::Protocol("parameter type has no fixed width"))?;
            let value = r.bytes(size)?;
            let device = self.resources.device_mut(device_id)?;
            device.set_parameter(target.handle, &name, ty, value);
        }
        Ok(Vec::new())
    }

    fn on_unset_param(&mut self, r: &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let object_id = r.u64()?;
        let target = self.resources.object(device_id, object_id)?;
        let name = r.string()?;

        let device = self.resources.device_mut(device_id)?;
        device.unset_parameter(target.handle, &name);
        Ok(Vec::new())
    }

    fn on_unset_all_params(
        &mut self,
        r: &mut PayloadReader<'_>,
    ) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let object_id = r.u64()?;
        let target = self.resources.object(device_id, object_id)?;

        let device = self.resources.device_mut(device_id)?;
        device.unset_all_parameters(target.handle);
        Ok(Vec::new())
    }

    fn on_commit_params(&mut self, r: &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        if r.at_end() {
            // A bare device id commits the device itself.
            let device = self.resources.device_mut(device_id)?;
            let target = device.device_handle();
            device.commit_parameters(target);
        } else {
            let object_id = r.u64()?;
            let target = self.resources.object(device_id, object_id)?;
            let device = self.resources.device_mut(device_id)?;
            device.commit_parameters(target.handle);
            info!("committed object {object_id}");
        }
        Ok(Vec::new())
    }

    // ── Reference counting ───────────────────────────────────────

    fn on_release(&mut self, r: &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let object_id = r.u64()?;
        let target = self.resources.object(device_id, object_id)?;
        // The slot stays registered; counting is the device's business.
        let device = self.resources.device_mut(device_id)?;
        device.release(target.handle);
        Ok(Vec::new())
    }

    fn on_retain(&mut self, r: &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let object_id = r.u64()?;
        let target = self.resources.object(device_id, object_id)?;
        let device = self.resources.device_mut(device_id)?;
        device.retain(target.handle);
        Ok(Vec::new())
    }

    // ── Array mapping ────────────────────────────────────────────

    fn on_map_array(&mut self, r: &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let object_id = r.u64()?;
        let target = self.resources.object(device_id, object_id)?;
        let info = self.resources.array_info(device_id, object_id)?;
        let num_bytes = info
            .byte_size()
            .ok_or(PrismError::Protocol("array element type has no fixed width"))?;

        let device = self.resources.device_mut(device_id)?;
        let Some(store) = device.map_array(target.handle) else {
            return Err(PrismError::UnknownObject {
                device: device_id,
                object: object_id,
            });
        };
        if (store.len() as u64) < num_bytes {
            return Err(PrismError::Protocol("mapped array smaller than recorded size"));
        }

        let mut out = PayloadWriter::new();
        out.u64(object_id).u64(num_bytes).raw(&store[..num_bytes as usize]);
        // The array stays mapped until the client sends UNMAP_ARRAY;
        // whether it keeps writing into its copy is its business.
        info!("mapped array {object_id}, {num_bytes} bytes");
        Ok(vec![Message::new(Opcode::ArrayMapped, out.freeze())])
    }

    fn on_unmap_array(&mut self, r: &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let object_id = r.u64()?;
        let target = self.resources.object(device_id, object_id)?;
        let info = self.resources.array_info(device_id, object_id)?;

        let data = if r.at_end() {
            None
        } else {
            Some(self.read_array_data(device_id, &info, r)?)
        };

        // Writes only flow through a mapped pointer: close the client's
        // mapping, remap to write the returned bytes, unmap again.
        let device = self.resources.device_mut(device_id)?;
        device.unmap_array(target.handle);
        if let Some(store) = device.map_array(target.handle) {
            if let Some(data) = &data {
                let n = data.len().min(store.len());
                store[..n].copy_from_slice(&data[..n]);
            }
        }
        device.unmap_array(target.handle);

        let mut out = PayloadWriter::new();
        out.u64(object_id);
        info!("unmapped array {object_id}");
        Ok(vec![Message::new(Opcode::ArrayUnmapped, out.freeze())])
    }

    // ── Rendering ────────────────────────────────────────────────

    fn on_render_frame(&mut self, r: &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let frame_id = r.u64()?;
        let target = self.resources.object(device_id, frame_id)?;
        let features = self.server_features.negotiate(&self.client_features);

        let device = self.resources.device_mut(device_id)?;
        device.render_frame(target.handle);
        // Block until the frame completes, then ship its channels.
        device.frame_ready(target.handle, WaitMask::WAIT);

        let mut replies = Vec::new();
        for channel in [FrameChannel::Color, FrameChannel::Depth] {
            if let Some(mapped) = device.map_frame(target.handle, channel.name()) {
                if let Some(reply) = channel_reply(frame_id, &mapped, channel, features)? {
                    replies.push(reply);
                }
            }
        }

        info!("frame {frame_id} rendered, {} channel replies", replies.len());
        Ok(replies)
    }

    fn on_frame_ready(&mut self, r: &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let object_id = r.u64()?;
        let target = self.resources.object(device_id, object_id)?;
        let mask = WaitMask(r.u32()?);

        let device = self.resources.device_mut(device_id)?;
        device.frame_ready(target.handle, mask);

        let mut out = PayloadWriter::new();
        out.u64(object_id);
        Ok(vec![Message::new(Opcode::FrameIsReady, out.freeze())])
    }

    // ── Introspection ────────────────────────────────────────────

    fn on_get_property(&mut self, r: &mut PayloadReader<'_>) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let object_id = r.u64()?;

        // A missing or null record means the query addresses the
        // device itself.
        let target = match self.resources.try_object(device_id, object_id) {
            Some(rec) if !rec.handle.is_null() => rec.handle,
            _ => self.resources.device_mut(device_id)?.device_handle(),
        };

        let name = r.string()?;
        let ty = r.data_type()?;
        let size = r.u64()? as usize;
        let mask = WaitMask(r.u32()?);

        if ty == DataType::DataTypeList {
            return Err(PrismError::Unimplemented(
                "GET_PROPERTY with DATA_TYPE_LIST",
            ));
        }

        let device = self.resources.device_mut(device_id)?;
        let reply = device.get_property(target, &name, ty, size, mask);

        let mut out = PayloadWriter::new();
        out.u64(object_id).string(&name).i32(reply.result);
        match reply.value {
            PropertyValue::Bytes(bytes) => {
                out.raw(&bytes);
            }
            PropertyValue::StringList(list) => {
                out.string_list(&list);
            }
        }
        Ok(vec![Message::new(Opcode::Property, out.freeze())])
    }

    fn on_get_object_subtypes(
        &mut self,
        r: &mut PayloadReader<'_>,
    ) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let ty = r.data_type()?;

        let device = self.resources.device_mut(device_id)?;
        let subtypes = device.get_object_subtypes(ty);

        let mut out = PayloadWriter::new();
        out.u32(ty as u32).string_list(&subtypes);
        Ok(vec![Message::new(Opcode::ObjectSubtypes, out.freeze())])
    }

    fn on_get_object_info(
        &mut self,
        r: &mut PayloadReader<'_>,
    ) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let ty = r.data_type()?;
        let subtype = r.string()?;
        let info_name = r.string()?;
        let info_type = r.data_type()?;

        let device = self.resources.device_mut(device_id)?;
        let value = device.get_object_info(ty, &subtype, &info_name, info_type);

        let mut out = PayloadWriter::new();
        out.u32(ty as u32)
            .string(&subtype)
            .string(&info_name)
            .u32(info_type as u32);
        write_info_value(&mut out, value);
        Ok(vec![Message::new(Opcode::ObjectInfo, out.freeze())])
    }

    fn on_get_parameter_info(
        &mut self,
        r: &mut PayloadReader<'_>,
    ) -> Result<Vec<Message>, PrismError> {
        let device_id = r.u64()?;
        let ty = r.data_type()?;
        let subtype = r.string()?;
        let parameter = r.string()?;
        let parameter_type = r.data_type()?;
        let info_name = r.string()?;
        let info_type = r.data_type()?;

        let device = self.resources.device_mut(device_id)?;
        let value = device.get_parameter_info(
            ty,
            &subtype,
            &parameter,
            parameter_type,
            &info_name,
            info_type,
        );

        let mut out = PayloadWriter::new();
        out.u32(ty as u32)
            .string(&subtype)
            .string(&parameter)
            .u32(parameter_type as u32)
            .string(&info_name)
            .u32(info_type as u32);
        write_info_value(&mut out, value);
        Ok(vec![Message::new(Opcode::ParameterInfo, out.freeze())])
    }
}

/// Append an introspection value shaped by its info type. Absent
/// values append nothing.
fn write_info_value(out: &mut PayloadWriter, value: Option<InfoValue>) {
    match value {
        Some(InfoValue::String(s)) => {
            out.string(&s);
        }
        Some(InfoValue::StringList(list)) => {
            out.string_list(&list);
        }
        Some(InfoValue::ParameterList(params)) => {
            out.parameter_list(&params);
        }
        Some(InfoValue::Bytes(bytes)) => {
            out.raw(&bytes);
        }
        None => {}
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use crate::device::{MappedFrame, ObjectHandle, PropertyReply, RenderDevice};

    // A recording adapter: mints handles 0xA000, 0xA001, … in creation
    // order and logs every call for post-hoc assertions.

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        NewObject(DataType, String),
        NewArray(ArrayInfo),
        SetParameter(u64, String, DataType, Vec<u8>),
        Commit(u64),
        Retain(u64),
        Release(u64),
        MapArray(u64),
        UnmapArray(u64),
        RenderFrame(u64),
        FrameReady(u64, u32),
    }

    #[derive(Default)]
    struct MockState {
        calls: Vec<Call>,
        next: u64,
        arrays: HashMap<u64, Vec<u8>>,
        color: Option<(u32, u32, DataType, Vec<u8>)>,
        depth: Option<(u32, u32, DataType, Vec<u8>)>,
    }

    impl MockState {
        fn mint(&mut self) -> ObjectHandle {
            let handle = ObjectHandle(0xA000 + self.next);
            self.next += 1;
            handle
        }
    }

    struct MockDevice {
        state: Arc<Mutex<MockState>>,
        handle: ObjectHandle,
        scratch: Vec<u8>,
        mapped: Option<u64>,
        frame_scratch: Vec<u8>,
    }

    impl RenderDevice for MockDevice {
        fn device_handle(&self) -> ObjectHandle {
            self.handle
        }

        fn new_object(&mut self, ty: DataType, subtype: &str) -> ObjectHandle {
            let mut s = self.state.lock().unwrap();
            s.calls.push(Call::NewObject(ty, subtype.to_string()));
            s.mint()
        }

        fn new_array(&mut self, info: &ArrayInfo) -> ObjectHandle {
            let mut s = self.state.lock().unwrap();
            s.calls.push(Call::NewArray(*info));
            let handle = s.mint();
            let size = info.byte_size().unwrap_or(0) as usize;
            s.arrays.insert(handle.0, vec![0u8; size]);
            handle
        }

        fn set_parameter(&mut self, object: ObjectHandle, name: &str, ty: DataType, value: &[u8]) {
            self.state.lock().unwrap().calls.push(Call::SetParameter(
                object.0,
                name.to_string(),
                ty,
                value.to_vec(),
            ));
        }

        fn unset_parameter(&mut self, _object: ObjectHandle, _name: &str) {}
        fn unset_all_parameters(&mut self, _object: ObjectHandle) {}

        fn commit_parameters(&mut self, object: ObjectHandle) {
            self.state.lock().unwrap().calls.push(Call::Commit(object.0));
        }

        fn retain(&mut self, object: ObjectHandle) {
            self.state.lock().unwrap().calls.push(Call::Retain(object.0));
        }

        fn release(&mut self, object: ObjectHandle) {
            self.state.lock().unwrap().calls.push(Call::Release(object.0));
        }

        fn map_array(&mut self, array: ObjectHandle) -> Option<&mut [u8]> {
            let mut s = self.state.lock().unwrap();
            s.calls.push(Call::MapArray(array.0));
            let data = s.arrays.get(&array.0)?.clone();
            drop(s);
            self.scratch = data;
            self.mapped = Some(array.0);
            Some(&mut self.scratch)
        }

        fn unmap_array(&mut self, array: ObjectHandle) {
            let mut s = self.state.lock().unwrap();
            s.calls.push(Call::UnmapArray(array.0));
            if self.mapped.take() == Some(array.0) {
                s.arrays.insert(array.0, std::mem::take(&mut self.scratch));
            }
        }

        fn render_frame(&mut self, frame: ObjectHandle) {
            self.state.lock().unwrap().calls.push(Call::RenderFrame(frame.0));
        }

        fn frame_ready(&mut self, frame: ObjectHandle, wait: WaitMask) -> bool {
            self.state
                .lock()
                .unwrap()
                .calls
                .push(Call::FrameReady(frame.0, wait.0));
            true
        }

        fn map_frame(&mut self, _frame: ObjectHandle, channel: &str) -> Option<MappedFrame<'_>> {
            let s = self.state.lock().unwrap();
            let (width, height, ty, data) = match channel {
                "channel.color" => s.color.clone()?,
                "channel.depth" => s.depth.clone()?,
                _ => return None,
            };
            drop(s);
            self.frame_scratch = data;
            Some(MappedFrame {
                data: &self.frame_scratch,
                width,
                height,
                ty,
            })
        }

        fn get_property(
            &mut self,
            _object: ObjectHandle,
            _name: &str,
            _ty: DataType,
            size: usize,
            _wait: WaitMask,
        ) -> PropertyReply {
            PropertyReply {
                result: 0,
                value: PropertyValue::Bytes(vec![0; size]),
            }
        }

        fn get_object_subtypes(&mut self, _ty: DataType) -> Vec<String> {
            Vec::new()
        }

        fn get_object_info(
            &mut self,
            _ty: DataType,
            _subtype: &str,
            _info_name: &str,
            _info_type: DataType,
        ) -> Option<InfoValue> {
            None
        }

        fn get_parameter_info(
            &mut self,
            _ty: DataType,
            _subtype: &str,
            _parameter: &str,
            _parameter_type: DataType,
            _info_name: &str,
            _info_type: DataType,
        ) -> Option<InfoValue> {
            None
        }
    }

    struct MockBackend {
        state: Arc<Mutex<MockState>>,
    }

    impl Backend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }

        fn new_device(&self, _subtype: &str, _status: StatusSink) -> Box<dyn RenderDevice> {
            let handle = self.state.lock().unwrap().mint();
            Box::new(MockDevice {
                state: Arc::clone(&self.state),
                handle,
                scratch: Vec::new(),
                mapped: None,
                frame_scratch: Vec::new(),
            })
        }
    }

    fn msg(opcode: Opcode, build: impl FnOnce(&mut PayloadWriter)) -> Message {
        let mut w = PayloadWriter::new();
        build(&mut w);
        Message::new(opcode, w.freeze())
    }

    /// Dispatcher with one mock device already registered as id 1
    /// (handle 0xA000).
    fn session() -> (Dispatcher, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        let backend = Arc::new(MockBackend {
            state: Arc::clone(&state),
        });
        let mut dispatcher = Dispatcher::new(backend, false);
        let replies = dispatcher
            .dispatch(&msg(Opcode::NewDevice, |w| {
                w.string("default").u32(CompressionFeatures::server().bits());
            }))
            .unwrap();
        assert_eq!(replies.len(), 1);
        (dispatcher, state)
    }

    fn calls(state: &Arc<Mutex<MockState>>) -> Vec<Call> {
        state.lock().unwrap().calls.clone()
    }

    #[test]
    fn device_ids_are_monotonic_from_one() {
        let (mut dispatcher, _state) = session();
        for expected in 2u64..=4 {
            let replies = dispatcher
                .dispatch(&msg(Opcode::NewDevice, |w| {
                    w.string("default").u32(0);
                }))
                .unwrap();
            let mut r = PayloadReader::new(replies[0].payload());
            assert_eq!(r.u64().unwrap(), expected);
        }
    }

    #[test]
    fn device_handle_reply_carries_server_features() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let backend = Arc::new(MockBackend {
            state: Arc::clone(&state),
        });
        let mut dispatcher = Dispatcher::new(backend, false);
        let replies = dispatcher
            .dispatch(&msg(Opcode::NewDevice, |w| {
                w.string("default").u32(0);
            }))
            .unwrap();

        assert_eq!(replies[0].opcode().unwrap(), Opcode::DeviceHandle);
        let mut r = PayloadReader::new(replies[0].payload());
        assert_eq!(r.u64().unwrap(), 1);
        assert_eq!(
            CompressionFeatures::from_bits(r.u32().unwrap()),
            CompressionFeatures::server()
        );
    }

    #[test]
    fn set_param_hits_the_registered_handle_exactly_once() {
        let (mut dispatcher, state) = session();

        // Object 7 -> first minted object handle 0xA001.
        dispatcher
            .dispatch(&msg(Opcode::NewObject, |w| {
                w.u64(1).u32(DataType::Camera as u32).string("perspective").u64(7);
            }))
            .unwrap();

        dispatcher
            .dispatch(&msg(Opcode::SetParam, |w| {
                w.u64(1)
                    .u64(7)
                    .string("fovy")
                    .u32(DataType::Float32 as u32)
                    .raw(&1.5f32.to_le_bytes());
            }))
            .unwrap();

        let set_calls: Vec<_> = calls(&state)
            .into_iter()
            .filter(|c| matches!(c, Call::SetParameter(..)))
            .collect();
        assert_eq!(
            set_calls,
            vec![Call::SetParameter(
                0xA001,
                "fovy".into(),
                DataType::Float32,
                1.5f32.to_le_bytes().to_vec()
            )]
        );
    }

    #[test]
    fn string_param_takes_the_generic_fixed_width_path() {
        let (mut dispatcher, state) = session();
        dispatcher
            .dispatch(&msg(Opcode::NewObject, |w| {
                w.u64(1).u32(DataType::Renderer as u32).string("default").u64(3);
            }))
            .unwrap();

        // Like every non-object type, a String value is sized by
        // sizeof(type): pointer-wide, no length prefix.
        dispatcher
            .dispatch(&msg(Opcode::SetParam, |w| {
                w.u64(1)
                    .u64(3)
                    .string("mode")
                    .u32(DataType::String as u32)
                    .raw(&0xDEAD_BEEFu64.to_le_bytes());
            }))
            .unwrap();

        assert_eq!(
            calls(&state).last(),
            Some(&Call::SetParameter(
                0xA001,
                "mode".into(),
                DataType::String,
                0xDEAD_BEEFu64.to_le_bytes().to_vec()
            ))
        );
    }

    #[test]
    fn object_param_is_translated_to_native_handle() {
        let (mut dispatcher, state) = session();

        // Objects 3 and 4 -> handles 0xA001, 0xA002.
        for id in [3u64, 4] {
            dispatcher
                .dispatch(&msg(Opcode::NewObject, |w| {
                    w.u64(1).u32(DataType::Geometry as u32).string("triangle").u64(id);
                }))
                .unwrap();
        }

        dispatcher
            .dispatch(&msg(Opcode::SetParam, |w| {
                w.u64(1)
                    .u64(3)
                    .string("material")
                    .u32(DataType::Material as u32)
                    .u64(4); // client-space reference
            }))
            .unwrap();

        let last = calls(&state).last().unwrap().clone();
        assert_eq!(
            last,
            Call::SetParameter(
                0xA001,
                "material".into(),
                DataType::Material,
                0xA002u64.to_le_bytes().to_vec()
            )
        );
    }

    #[test]
    fn object_array_payload_is_rewritten_in_place() {
        let (mut dispatcher, state) = session();

        // Objects 4 and 5 -> handles 0xA001, 0xA002.
        for id in [4u64, 5] {
            dispatcher
                .dispatch(&msg(Opcode::NewObject, |w| {
                    w.u64(1).u32(DataType::Surface as u32).string("").u64(id);
                }))
                .unwrap();
        }

        // Array 9 of two object references [4, 5].
        dispatcher
            .dispatch(&msg(Opcode::NewArray, |w| {
                w.u64(1)
                    .u32(DataType::Array1D as u32)
                    .u64(9)
                    .u32(DataType::Object as u32)
                    .u64(2)
                    .u64(0)
                    .u64(0);
                w.u64(4).u64(5);
            }))
            .unwrap();

        let s = state.lock().unwrap();
        // Array handle is the third minted object handle: 0xA003.
        let stored = s.arrays.get(&0xA003).unwrap();
        let expect: Vec<u8> = [0xA001u64, 0xA002u64]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        assert_eq!(stored, &expect);
    }

    #[test]
    fn new_array_with_short_seed_is_rejected() {
        let (mut dispatcher, state) = session();

        let replies = dispatcher
            .dispatch(&msg(Opcode::NewArray, |w| {
                w.u64(1)
                    .u32(DataType::Array1D as u32)
                    .u64(9)
                    .u32(DataType::Float32 as u32)
                    .u64(4)
                    .u64(0)
                    .u64(0);
                w.raw(&[1, 2, 3]); // needs 16 bytes
            }))
            .unwrap();

        assert!(replies.is_empty());
        assert!(!calls(&state).iter().any(|c| matches!(c, Call::NewArray(_))));
    }

    #[test]
    fn commit_with_bare_device_id_commits_the_device() {
        let (mut dispatcher, state) = session();
        dispatcher
            .dispatch(&msg(Opcode::CommitParams, |w| {
                w.u64(1);
            }))
            .unwrap();
        assert_eq!(calls(&state).last(), Some(&Call::Commit(0xA000)));
    }

    #[test]
    fn commit_with_object_id_commits_the_object() {
        let (mut dispatcher, state) = session();
        dispatcher
            .dispatch(&msg(Opcode::NewObject, |w| {
                w.u64(1).u32(DataType::World as u32).string("").u64(9);
            }))
            .unwrap();
        dispatcher
            .dispatch(&msg(Opcode::CommitParams, |w| {
                w.u64(1).u64(9);
            }))
            .unwrap();
        assert_eq!(calls(&state).last(), Some(&Call::Commit(0xA001)));
    }

    #[test]
    fn unknown_object_drops_message_without_adapter_calls() {
        let (mut dispatcher, state) = session();
        let before = calls(&state).len();

        let replies = dispatcher
            .dispatch(&msg(Opcode::SetParam, |w| {
                w.u64(1)
                    .u64(99999)
                    .string("fovy")
                    .u32(DataType::Float32 as u32)
                    .raw(&[0; 4]);
            }))
            .unwrap();
        assert!(replies.is_empty());
        assert_eq!(calls(&state).len(), before);

        // The session is still usable.
        dispatcher
            .dispatch(&msg(Opcode::NewObject, |w| {
                w.u64(1).u32(DataType::Camera as u32).string("perspective").u64(1);
            }))
            .unwrap();
        assert!(matches!(
            calls(&state).last(),
            Some(Call::NewObject(DataType::Camera, _))
        ));
    }

    #[test]
    fn unknown_device_drops_message() {
        let (mut dispatcher, state) = session();
        let before = calls(&state).len();
        let replies = dispatcher
            .dispatch(&msg(Opcode::NewObject, |w| {
                w.u64(42).u32(DataType::Camera as u32).string("x").u64(1);
            }))
            .unwrap();
        assert!(replies.is_empty());
        assert_eq!(calls(&state).len(), before);
    }

    #[test]
    fn unknown_opcode_is_dropped() {
        let (mut dispatcher, _state) = session();
        let raw = {
            let mut w = PayloadWriter::new();
            w.u64(0);
            w.freeze()
        };
        // Decode path is exercised end-to-end in the wire tests; here
        // a reply-direction opcode stands in for "no handler".
        let replies = dispatcher.dispatch(&Message::new(Opcode::Property, raw)).unwrap();
        assert!(replies.is_empty());
    }

    #[test]
    fn truncated_payload_is_dropped_not_fatal() {
        let (mut dispatcher, _state) = session();
        let replies = dispatcher
            .dispatch(&msg(Opcode::SetParam, |w| {
                w.u64(1); // missing everything else
            }))
            .unwrap();
        assert!(replies.is_empty());
    }

    #[test]
    fn data_type_list_property_is_fatal() {
        let (mut dispatcher, _state) = session();
        let err = dispatcher
            .dispatch(&msg(Opcode::GetProperty, |w| {
                w.u64(1)
                    .u64(0)
                    .string("channels")
                    .u32(DataType::DataTypeList as u32)
                    .u64(0)
                    .u32(0);
            }))
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn render_frame_streams_channels_in_order() {
        let (mut dispatcher, state) = session();
        dispatcher
            .dispatch(&msg(Opcode::NewObject, |w| {
                w.u64(1).u32(DataType::Frame as u32).string("").u64(2);
            }))
            .unwrap();

        {
            let mut s = state.lock().unwrap();
            s.color = Some((
                2,
                2,
                DataType::UFixed8RgbaSrgb,
                vec![0xAB; 2 * 2 * 4],
            ));
            s.depth = Some((
                2,
                2,
                DataType::Float32,
                (0..4u32).flat_map(|_| 1.0f32.to_le_bytes()).collect(),
            ));
        }

        let replies = dispatcher
            .dispatch(&msg(Opcode::RenderFrame, |w| {
                w.u64(1).u64(2);
            }))
            .unwrap();

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].opcode().unwrap(), Opcode::ChannelColor);
        assert_eq!(replies[1].opcode().unwrap(), Opcode::ChannelDepth);
        for reply in &replies {
            let mut r = PayloadReader::new(reply.payload());
            assert_eq!(r.u64().unwrap(), 2, "frame id echoed");
        }

        // render preceded the blocking wait.
        let cs = calls(&state);
        let render_at = cs.iter().position(|c| matches!(c, Call::RenderFrame(_))).unwrap();
        let ready_at = cs
            .iter()
            .position(|c| matches!(c, Call::FrameReady(_, w) if *w == WaitMask::WAIT.0))
            .unwrap();
        assert!(render_at < ready_at);
    }

    #[test]
    fn render_frame_with_color_only_yields_one_reply() {
        let (mut dispatcher, state) = session();
        dispatcher
            .dispatch(&msg(Opcode::NewObject, |w| {
                w.u64(1).u32(DataType::Frame as u32).string("").u64(2);
            }))
            .unwrap();
        state.lock().unwrap().color =
            Some((2, 2, DataType::UFixed8RgbaSrgb, vec![0xCD; 2 * 2 * 4]));

        let replies = dispatcher
            .dispatch(&msg(Opcode::RenderFrame, |w| {
                w.u64(1).u64(2);
            }))
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].opcode().unwrap(), Opcode::ChannelColor);
    }

    #[test]
    fn unmap_array_performs_the_two_step() {
        let (mut dispatcher, state) = session();
        dispatcher
            .dispatch(&msg(Opcode::NewArray, |w| {
                w.u64(1)
                    .u32(DataType::Array1D as u32)
                    .u64(6)
                    .u32(DataType::UInt8 as u32)
                    .u64(4)
                    .u64(0)
                    .u64(0);
            }))
            .unwrap();

        let replies = dispatcher
            .dispatch(&msg(Opcode::UnmapArray, |w| {
                w.u64(1).u64(6).raw(&[9, 8, 7, 6]);
            }))
            .unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].opcode().unwrap(), Opcode::ArrayUnmapped);

        let cs = calls(&state);
        let tail: Vec<_> = cs
            .iter()
            .filter(|c| matches!(c, Call::MapArray(0xA001) | Call::UnmapArray(0xA001)))
            .cloned()
            .collect();
        // unmap, remap to write, unmap again.
        assert_eq!(
            tail,
            vec![
                Call::UnmapArray(0xA001),
                Call::MapArray(0xA001),
                Call::UnmapArray(0xA001)
            ]
        );
        assert_eq!(state.lock().unwrap().arrays.get(&0xA001).unwrap(), &vec![9, 8, 7, 6]);
    }

    #[test]
    fn map_array_ships_current_contents() {
        let (mut dispatcher, _state) = session();
        dispatcher
            .dispatch(&msg(Opcode::NewArray, |w| {
                w.u64(1)
                    .u32(DataType::Array1D as u32)
                    .u64(6)
                    .u32(DataType::UInt8 as u32)
                    .u64(4)
                    .u64(0)
                    .u64(0);
                w.raw(&[1, 2, 3, 4]);
            }))
            .unwrap();

        let replies = dispatcher
            .dispatch(&msg(Opcode::MapArray, |w| {
                w.u64(1).u64(6);
            }))
            .unwrap();

        let mut r = PayloadReader::new(replies[0].payload());
        assert_eq!(r.u64().unwrap(), 6);
        assert_eq!(r.u64().unwrap(), 4);
        assert_eq!(r.rest(), &[1, 2, 3, 4]);
    }

    #[test]
    fn frame_ready_propagates_mask_and_replies() {
        let (mut dispatcher, state) = session();
        dispatcher
            .dispatch(&msg(Opcode::NewObject, |w| {
                w.u64(1).u32(DataType::Frame as u32).string("").u64(2);
            }))
            .unwrap();

        let replies = dispatcher
            .dispatch(&msg(Opcode::FrameReady, |w| {
                w.u64(1).u64(2).u32(WaitMask::NO_WAIT.0);
            }))
            .unwrap();
        assert_eq!(replies[0].opcode().unwrap(), Opcode::FrameIsReady);
        let mut r = PayloadReader::new(replies[0].payload());
        assert_eq!(r.u64().unwrap(), 2);

        assert!(calls(&state)
            .iter()
            .any(|c| matches!(c, Call::FrameReady(_, 0))));
    }

    #[test]
    fn retain_release_are_forwarded() {
        let (mut dispatcher, state) = session();
        dispatcher
            .dispatch(&msg(Opcode::NewObject, |w| {
                w.u64(1).u32(DataType::Group as u32).string("").u64(3);
            }))
            .unwrap();

        dispatcher
            .dispatch(&msg(Opcode::Retain, |w| {
                w.u64(1).u64(3);
            }))
            .unwrap();
        dispatcher
            .dispatch(&msg(Opcode::Release, |w| {
                w.u64(1).u64(3);
            }))
            .unwrap();

        let cs = calls(&state);
        assert!(cs.contains(&Call::Retain(0xA001)));
        assert!(cs.contains(&Call::Release(0xA001)));
    }
}
