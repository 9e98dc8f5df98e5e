//! Shared linear memory handle.
//!
//! The primary instance's exported memory is the only linear memory of a
//! session. Deferred modules import the same memory through `module0`; the
//! host reaches it through this handle. Every access is a bounded copy,
//! no host reference outlives a single call.

use wasmtime::{AsContext, AsContextMut, Memory};

use crate::value::MarshalError;

/// WASM page size (64KB).
pub const PAGE_SIZE: usize = 65536;

/// Handle to the session's linear memory.
#[derive(Debug, Clone, Copy)]
pub struct SharedMemory {
    memory: Memory,
}

impl SharedMemory {
    pub(crate) fn new(memory: Memory) -> Self {
        SharedMemory { memory }
    }

    /// Underlying wasmtime memory.
    pub fn raw(&self) -> Memory {
        self.memory
    }

    /// Current size in bytes.
    pub fn size(&self, store: impl AsContext) -> usize {
        self.memory.data_size(store)
    }

    /// Current size in pages.
    pub fn pages(&self, store: impl AsContext) -> u64 {
        self.memory.size(store)
    }

    fn check_bounds(
        &self,
        store: impl AsContext,
        offset: usize,
        len: usize,
    ) -> Result<(), MarshalError> {
        let size = self.size(store);
        match offset.checked_add(len) {
            Some(end) if end <= size => Ok(()),
            _ => Err(MarshalError::OutOfBounds { offset, len, size }),
        }
    }

    /// Copy `len` bytes starting at `offset`.
    pub fn read(
        &self,
        store: impl AsContext,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, MarshalError> {
        let store = store.as_context();
        self.check_bounds(&store, offset, len)?;
        let mut buf = vec![0u8; len];
        buf.copy_from_slice(&self.memory.data(&store)[offset..offset + len]);
        Ok(buf)
    }

    /// Copy `bytes` into memory at `offset`.
    pub fn write(
        &self,
        mut store: impl AsContextMut,
        offset: usize,
        bytes: &[u8],
    ) -> Result<(), MarshalError> {
        self.check_bounds(&store, offset, bytes.len())?;
        self.memory.data_mut(&mut store)[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Read a byte.
    pub fn read_u8(&self, store: impl AsContext, offset: usize) -> Result<u8, MarshalError> {
        let bytes = self.read(store, offset, 1)?;
        Ok(bytes[0])
    }

    /// Read a little-endian u32.
    pub fn read_u32(&self, store: impl AsContext, offset: usize) -> Result<u32, MarshalError> {
        let bytes = self.read(store, offset, 4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write a little-endian u32.
    pub fn write_u32(
        &self,
        store: impl AsContextMut,
        offset: usize,
        value: u32,
    ) -> Result<(), MarshalError> {
        self.write(store, offset, &value.to_le_bytes())
    }
}
