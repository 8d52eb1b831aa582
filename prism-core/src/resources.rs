//! Resource manager: client-id → device-handle translation tables.
//!
//! Device ids are minted here (dense, monotonic, starting at 1); object
//! ids are minted by the client and may be sparse. All three tables are
//! dense vectors grown on demand — slots are address space, not
//! ownership, so releasing an object on the device never reclaims its
//! slot. The manager is owned by the dispatcher and is deliberately
//! unsynchronized; it must not be shared across threads.

use crate::datatype::DataType;
use crate::device::{ObjectHandle, RenderDevice};
use crate::error::PrismError;

/// Growth cap for client-chosen object ids. Ids are expected to be
/// compact; anything past this is treated as a lookup failure rather
/// than an invitation to allocate gigabytes of table.
pub const MAX_OBJECT_ID: u64 = 1 << 20;

// ── ArrayInfo ────────────────────────────────────────────────────

/// Shape of an array object, captured at creation time.
///
/// Used to size map/unmap payloads and to drive in-place handle
/// rewriting for arrays of object references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayInfo {
    /// One of the ranked array kinds.
    pub kind: DataType,
    pub element_type: DataType,
    pub items1: u64,
    pub items2: u64,
    pub items3: u64,
}

impl ArrayInfo {
    /// Total element count; unused trailing axes count as 1.
    pub fn element_count(&self) -> u64 {
        self.items1 * self.items2.max(1) * self.items3.max(1)
    }

    /// Total byte size, if the element type has a fixed width.
    pub fn byte_size(&self) -> Option<u64> {
        self.element_type
            .size_of()
            .map(|s| self.element_count() * s as u64)
    }
}

// ── ObjectRecord ─────────────────────────────────────────────────

/// One client-minted object: its device-native handle and type tag.
#[derive(Debug, Clone, Copy)]
pub struct ObjectRecord {
    pub handle: ObjectHandle,
    pub ty: DataType,
}

// ── ResourceManager ──────────────────────────────────────────────

/// The session's translation tables.
pub struct ResourceManager {
    next_device_id: u64,
    devices: Vec<Option<Box<dyn RenderDevice>>>,
    objects: Vec<Vec<Option<ObjectRecord>>>,
    arrays: Vec<Vec<Option<ArrayInfo>>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            next_device_id: 1,
            devices: Vec::new(),
            objects: Vec::new(),
            arrays: Vec::new(),
        }
    }

    /// Register a freshly created device and mint its id. All three
    /// tables grow together so a valid device id indexes all of them.
    pub fn register_device(&mut self, device: Box<dyn RenderDevice>) -> u64 {
        let id = self.next_device_id;
        self.next_device_id += 1;

        let len = (id + 1) as usize;
        if self.devices.len() < len {
            self.devices.resize_with(len, || None);
            self.objects.resize_with(len, Vec::new);
            self.arrays.resize_with(len, Vec::new);
        }
        self.devices[id as usize] = Some(device);
        id
    }

    pub fn device_mut(&mut self, device_id: u64) -> Result<&mut (dyn RenderDevice + '_), PrismError> {
        match self.devices.get_mut(device_id as usize) {
            Some(Some(d)) => Ok(d.as_mut()),
            _ => Err(PrismError::UnknownDevice(device_id)),
        }
    }

    /// Register (or re-register) an object under a client-chosen id,
    /// growing the device's object table to `object_id + 1`.
    pub fn register_object(
        &mut self,
        device_id: u64,
        object_id: u64,
        handle: ObjectHandle,
        ty: DataType,
    ) -> Result<(), PrismError> {
        if object_id > MAX_OBJECT_ID {
            return Err(PrismError::ObjectIdTooLarge(object_id));
        }
        let table = self
            .objects
            .get_mut(device_id as usize)
            .ok_or(PrismError::UnknownDevice(device_id))?;
        if table.len() <= object_id as usize {
            table.resize_with(object_id as usize + 1, || None);
        }
        table[object_id as usize] = Some(ObjectRecord { handle, ty });
        Ok(())
    }

    /// Like [`register_object`](Self::register_object), but also
    /// records the array's shape so its bytes can be shipped back to
    /// the client on map.
    pub fn register_array(
        &mut self,
        device_id: u64,
        object_id: u64,
        handle: ObjectHandle,
        info: ArrayInfo,
    ) -> Result<(), PrismError> {
        self.register_object(device_id, object_id, handle, info.kind)?;
        let table = self
            .arrays
            .get_mut(device_id as usize)
            .ok_or(PrismError::UnknownDevice(device_id))?;
        if table.len() <= object_id as usize {
            table.resize_with(object_id as usize + 1, || None);
        }
        table[object_id as usize] = Some(info);
        Ok(())
    }

    /// Look up an object record; missing slots and null handles are
    /// both lookup failures.
    pub fn object(&self, device_id: u64, object_id: u64) -> Result<ObjectRecord, PrismError> {
        let record = self.try_object(device_id, object_id);
        match record {
            Some(r) if !r.handle.is_null() => Ok(r),
            _ => Err(PrismError::UnknownObject {
                device: device_id,
                object: object_id,
            }),
        }
    }

    /// Raw slot lookup, keeping null-handle records visible (device
    /// property queries fall back to the device itself on a null).
    pub fn try_object(&self, device_id: u64, object_id: u64) -> Option<ObjectRecord> {
        self.objects
            .get(device_id as usize)?
            .get(object_id as usize)?
            .as_ref()
            .copied()
    }

    pub fn array_info(&self, device_id: u64, object_id: u64) -> Result<ArrayInfo, PrismError> {
        self.arrays
            .get(device_id as usize)
            .and_then(|t| t.get(object_id as usize))
            .and_then(|i| *i)
            .ok_or(PrismError::UnknownObject {
                device: device_id,
                object: object_id,
            })
    }

    /// Rewrite every 8-byte slot of `data` from a client object id to
    /// the registered device handle, in place.
    ///
    /// The on-wire payload holds client ids; the copy handed to the
    /// device must hold native handles. The two views coexist only
    /// inside this buffer while the loop runs.
    pub fn translate_handles(&self, device_id: u64, data: &mut [u8]) -> Result<(), PrismError> {
        debug_assert_eq!(data.len() % 8, 0);
        for slot in data.chunks_exact_mut(8) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(slot);
            let object_id = u64::from_le_bytes(raw);
            let record = self.object(device_id, object_id)?;
            slot.copy_from_slice(&record.handle.0.to_le_bytes());
        }
        Ok(())
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ────────────────────────────────────────────────────────
