use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytemuck::Pod;
use tracing::trace;

use crate::error::{DeviceFault, Error, Result};

use super::context::DeviceContext;

/// First address handed out by the allocator; keeps `0` free as the null pointer.
const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
/// Every allocation starts on this boundary.
const ALLOCATION_ALIGNMENT: u64 = 256;

/// Flat device address space shared between the host and the stream worker.
#[derive(Clone)]
pub(crate) struct DeviceMemory {
    heap: Arc<Mutex<Heap>>,
}

impl DeviceMemory {
    pub fn new(capacity: u64) -> Self {
        Self {
            heap: Arc::new(Mutex::new(Heap {
                allocations: BTreeMap::new(),
                next_address: BASE_ADDRESS,
                used: 0,
                capacity,
                last_hit: None,
            })),
        }
    }

    /// Locks the heap. A launch holds this for its whole execution.
    pub fn lock(&self) -> MutexGuard<'_, Heap> {
        self.heap.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) struct Heap {
    allocations: BTreeMap<u64, Vec<u8>>,
    next_address: u64,
    used: u64,
    capacity: u64,
    last_hit: Option<u64>,
}

impl Heap {
    fn allocate(&mut self, bytes: usize) -> Result<u64> {
        let len = bytes as u64;
        if self.used + len > self.capacity {
            return Err(Error::Buffer(format!(
                "out of device memory: requested {bytes} bytes with {} of {} in use",
                self.used, self.capacity
            )));
        }
        let address = self.next_address;
        let span = len.div_ceil(ALLOCATION_ALIGNMENT).max(1) * ALLOCATION_ALIGNMENT;
        self.next_address += span;
        self.used += len;
        self.allocations.insert(address, vec![0; bytes]);
        Ok(address)
    }

    fn free(&mut self, address: u64) {
        if let Some(block) = self.allocations.remove(&address) {
            self.used -= block.len() as u64;
            if self.last_hit == Some(address) {
                self.last_hit = None;
            }
        }
    }

    #[cfg(test)]
    pub fn used(&self) -> u64 {
        self.used
    }

    /// Finds the allocation containing `[address, address + len)`.
    fn locate(&mut self, address: u64, len: usize) -> Option<(u64, usize)> {
        if let Some(base) = self.last_hit {
            if let Some(block) = self.allocations.get(&base) {
                if let Some(offset) = span_offset(base, block.len(), address, len) {
                    return Some((base, offset));
                }
            }
        }
        let (&base, block) = self.allocations.range(..=address).next_back()?;
        let offset = span_offset(base, block.len(), address, len)?;
        self.last_hit = Some(base);
        Some((base, offset))
    }

    /// True when the whole range lies inside one live allocation.
    pub fn contains(&mut self, address: u64, len: usize) -> bool {
        self.locate(address, len).is_some()
    }

    pub fn read(&mut self, address: u64, out: &mut [u8]) -> Result<(), DeviceFault> {
        let (base, offset) = self
            .locate(address, out.len())
            .ok_or(DeviceFault::OutOfBounds {
                access: "load",
                address,
                len: out.len(),
            })?;
        out.copy_from_slice(&self.allocations[&base][offset..offset + out.len()]);
        Ok(())
    }

    pub fn write(&mut self, address: u64, data: &[u8]) -> Result<(), DeviceFault> {
        let (base, offset) = self
            .locate(address, data.len())
            .ok_or(DeviceFault::OutOfBounds {
                access: "store",
                address,
                len: data.len(),
            })?;
        let block = self
            .allocations
            .get_mut(&base)
            .ok_or(DeviceFault::OutOfBounds {
                access: "store",
                address,
                len: data.len(),
            })?;
        block[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

fn span_offset(base: u64, block_len: usize, address: u64, len: usize) -> Option<usize> {
    let offset = address.checked_sub(base)? as usize;
    (offset.checked_add(len)? <= block_len).then_some(offset)
}

/// One contiguous device allocation.
///
/// A zero-sized buffer owns no memory and reports the null address, which
/// mirrors how the driver treats empty allocations.
pub struct DeviceBuffer {
    memory: DeviceMemory,
    address: u64,
    size: usize,
}

impl DeviceBuffer {
    /// Allocates `bytes` of zeroed device memory.
    pub fn alloc(context: &DeviceContext, bytes: usize) -> Result<Self> {
        let memory = context.memory().clone();
        let address = if bytes == 0 {
            0
        } else {
            memory.lock().allocate(bytes)?
        };
        trace!(address = format_args!("{address:#x}"), bytes, "allocated device buffer");
        Ok(Self {
            memory,
            address,
            size: bytes,
        })
    }

    /// Allocates a buffer sized exactly to `data` and uploads it.
    pub fn alloc_and_upload<T: Pod>(context: &DeviceContext, data: &[T]) -> Result<Self> {
        let buffer = Self::alloc(context, std::mem::size_of_val(data))?;
        buffer.upload(data)?;
        Ok(buffer)
    }

    /// Releases the current allocation and replaces it with a new one.
    ///
    /// The device address changes; anything holding the old address is stale.
    pub fn resize(&mut self, bytes: usize) -> Result<()> {
        let mut heap = self.memory.lock();
        if self.address != 0 {
            heap.free(self.address);
        }
        self.address = 0;
        self.size = 0;
        if bytes > 0 {
            self.address = heap.allocate(bytes)?;
        }
        self.size = bytes;
        Ok(())
    }

    /// Copies `data` to the start of the buffer.
    pub fn upload<T: Pod>(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() > self.size {
            return Err(Error::Buffer(format!(
                "upload of {} bytes exceeds buffer size {}",
                bytes.len(),
                self.size
            )));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.memory
            .lock()
            .write(self.address, bytes)
            .map_err(|fault| Error::Buffer(fault.to_string()))
    }

    /// Copies the start of the buffer into `out`.
    ///
    /// Blocks while a launch is executing against device memory.
    pub fn download<T: Pod>(&self, out: &mut [T]) -> Result<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        if bytes.len() > self.size {
            return Err(Error::Buffer(format!(
                "download of {} bytes exceeds buffer size {}",
                bytes.len(),
                self.size
            )));
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.memory
            .lock()
            .read(self.address, bytes)
            .map_err(|fault| Error::Buffer(fault.to_string()))
    }

    pub fn device_address(&self) -> u64 {
        self.address
    }

    pub fn size_in_bytes(&self) -> usize {
        self.size
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if self.address != 0 {
            self.memory.lock().free(self.address);
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceOptions;

    fn context() -> DeviceContext {
        DeviceContext::create(&DeviceOptions::default()).unwrap()
    }

    #[test]
    fn upload_download_roundtrip() {
        let ctx = context();
        let buffer = DeviceBuffer::alloc_and_upload(&ctx, &[1u32, 2, 3, 4]).unwrap();
        assert_eq!(buffer.size_in_bytes(), 16);
        assert_ne!(buffer.device_address(), 0);
        let mut out = [0u32; 4];
        buffer.download(&mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn zero_sized_buffer_is_null() {
        let ctx = context();
        let buffer = DeviceBuffer::alloc(&ctx, 0).unwrap();
        assert_eq!(buffer.device_address(), 0);
        assert!(buffer.upload::<u32>(&[]).is_ok());
    }

    #[test]
    fn resize_moves_the_allocation() {
        let ctx = context();
        let mut buffer = DeviceBuffer::alloc(&ctx, 64).unwrap();
        let before = buffer.device_address();
        buffer.resize(128).unwrap();
        assert_eq!(buffer.size_in_bytes(), 128);
        assert!(!ctx.memory().lock().contains(before, 1));
        assert!(ctx.memory().lock().contains(buffer.device_address(), 128));
    }

    #[test]
    fn rejects_oversized_upload() {
        let ctx = context();
        let buffer = DeviceBuffer::alloc(&ctx, 4).unwrap();
        assert!(matches!(buffer.upload(&[1u32, 2]), Err(Error::Buffer(_))));
    }

    #[test]
    fn stores_past_the_allocation_fault() {
        let ctx = context();
        let buffer = DeviceBuffer::alloc(&ctx, 8).unwrap();
        let fault = ctx
            .memory()
            .lock()
            .write(buffer.device_address() + 6, &[0u8; 4])
            .unwrap_err();
        assert!(matches!(fault, DeviceFault::OutOfBounds { access: "store", .. }));
    }

    #[test]
    fn capacity_is_enforced() {
        let ctx = DeviceContext::create(&DeviceOptions {
            memory_capacity: Some(1024),
            ..DeviceOptions::default()
        })
        .unwrap();
        let _first = DeviceBuffer::alloc(&ctx, 1000).unwrap();
        assert!(matches!(DeviceBuffer::alloc(&ctx, 100), Err(Error::Buffer(_))));
    }

    #[test]
    fn dropping_releases_memory() {
        let ctx = context();
        {
            let _buffer = DeviceBuffer::alloc(&ctx, 4096).unwrap();
            assert_eq!(ctx.memory().lock().used(), 4096);
        }
        assert_eq!(ctx.memory().lock().used(), 0);
    }
}
