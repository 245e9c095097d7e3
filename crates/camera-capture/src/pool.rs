//! Memory-mapped buffer pool

use std::ptr::NonNull;

use tracing::debug;

use crate::device::VideoDevice;
use crate::format::NegotiatedFormat;
use crate::DeviceError;

enum Backing {
    /// Kernel mapping, released with `munmap`
    Mmap,
    /// Heap memory standing in for a driver buffer
    Heap(#[allow(dead_code)] Vec<u8>),
}

/// One mapped driver buffer. Unmapped on drop.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    backing: Backing,
}

impl MappedRegion {
    /// Map `len` bytes of the device's buffer space at `offset`
    pub fn mmap(fd: i32, offset: u32, len: usize, index: u32) -> Result<Self, DeviceError> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                offset as libc::off_t,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(DeviceError::Map {
                index,
                source: std::io::Error::last_os_error(),
            });
        }

        let ptr = NonNull::new(addr as *mut u8).ok_or(DeviceError::Map {
            index,
            source: std::io::Error::from_raw_os_error(libc::EFAULT),
        })?;

        Ok(Self {
            ptr,
            len,
            backing: Backing::Mmap,
        })
    }

    /// Zero-filled heap region of `len` bytes
    pub fn heap(len: usize) -> Self {
        let mut memory = vec![0u8; len.max(1)];
        let ptr = NonNull::new(memory.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            backing: Backing::Heap(memory),
        }
    }

    /// Length that was actually mapped
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len bytes until drop
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if let Backing::Mmap = self.backing {
            unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) };
        }
    }
}

// SAFETY: the region is plain memory owned by this value; access is
// serialised by whoever owns the pool.
unsafe impl Send for MappedRegion {}

/// One slot of the pool
pub struct BufferSlot {
    region: MappedRegion,
    length: usize,
    stride: u32,
    index: u32,
}

impl BufferSlot {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Exposed frame length (may exceed the mapping for planar 4:2:0)
    pub fn length(&self) -> usize {
        self.length
    }

    /// Bytes per line
    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Start of the mapped memory
    pub fn start(&self) -> *const u8 {
        self.region.as_ptr()
    }

    /// Frame bytes, never past the end of the mapping
    pub fn data(&self) -> &[u8] {
        let len = self.length.min(self.region.len());
        &self.region.as_slice()[..len]
    }
}

/// Fixed set of mapped buffers backing the driver's queue
pub struct BufferPool {
    slots: Vec<BufferSlot>,
}

impl BufferPool {
    /// Query and map `count` buffers in index order.
    ///
    /// A failure part way through drops the regions mapped so far.
    pub fn map<D: VideoDevice + ?Sized>(
        device: &mut D,
        count: u32,
        format: &NegotiatedFormat,
    ) -> Result<Self, DeviceError> {
        let mut slots = Vec::with_capacity(count as usize);

        for index in 0..count {
            let info = device.query_buffer(index)?;
            let region = device.map_buffer(&info)?;
            let length = format.slot_length(info.length as usize);

            debug!(
                "Mapped buffer {} ({} bytes, exposed {} bytes, stride {})",
                index,
                region.len(),
                length,
                format.bytes_per_line
            );

            slots.push(BufferSlot {
                region,
                length,
                stride: format.bytes_per_line,
                index,
            });
        }

        Ok(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn slot(&self, index: u32) -> Option<&BufferSlot> {
        self.slots.get(index as usize)
    }

    pub fn slots(&self) -> impl Iterator<Item = &BufferSlot> {
        self.slots.iter()
    }
}
