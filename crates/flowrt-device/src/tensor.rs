//! Dense host and device tensors.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use flowrt_core::error::{FlowError, Result};
use flowrt_core::executor::HostExecutor;

use crate::allocator::GpuBuffer;

/// Host buffer alignment in bytes.
const HOST_ALIGNMENT: usize = 64;

/// Element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// Boolean (1 byte).
    Bool,
    /// 8-bit signed integer.
    I8,
    /// 16-bit signed integer.
    I16,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 8-bit unsigned integer.
    U8,
    /// 16-bit unsigned integer.
    U16,
    /// 32-bit unsigned integer.
    U32,
    /// 64-bit unsigned integer.
    U64,
    /// IEEE half precision.
    F16,
    /// bfloat16.
    BF16,
    /// IEEE single precision.
    F32,
    /// IEEE double precision.
    F64,
}

impl DType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 | Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }
}

/// Element type and shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorMetadata {
    /// Element type.
    pub dtype: DType,
    /// Dimensions, outermost first.
    pub shape: Vec<usize>,
}

impl TensorMetadata {
    /// Create metadata.
    pub fn new(dtype: DType, shape: impl Into<Vec<usize>>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
        }
    }

    /// Metadata for a flat byte tensor of `len` bytes.
    pub fn bytes(len: usize) -> Self {
        Self::new(DType::U8, [len])
    }

    /// Number of elements.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Size of the tensor's contents in bytes.
    pub fn host_size_in_bytes(&self) -> usize {
        self.num_elements() * self.dtype.size_in_bytes()
    }
}

impl fmt::Display for TensorMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}{:?}", self.dtype, self.shape)
    }
}

/// Contiguous, aligned host allocation.
///
/// Zero-byte buffers do not allocate.
pub struct HostBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Option<Layout>,
}

impl HostBuffer {
    /// Allocate `len` zero-filled bytes.
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len,
                layout: None,
            });
        }

        let layout = Layout::from_size_align(len, HOST_ALIGNMENT)
            .map_err(|_| FlowError::allocation(len, "invalid host layout"))?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| FlowError::allocation(len, "host allocator returned null"))?;

        Ok(Self {
            ptr,
            len,
            layout: Some(layout),
        })
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check for a zero-byte buffer.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Get slice reference.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for len initialized bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Get mutable slice reference.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for len bytes and we hold the only reference.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Raw pointer to the first byte.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for HostBuffer {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: allocated in `new` with this layout.
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

// SAFETY: HostBuffer owns its allocation; access goes through &/&mut.
unsafe impl Send for HostBuffer {}
unsafe impl Sync for HostBuffer {}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

/// Dense tensor in host memory.
///
/// Cloning shares the underlying buffer.
#[derive(Debug, Clone)]
pub struct DenseHostTensor {
    metadata: TensorMetadata,
    buffer: Arc<HostBuffer>,
}

impl DenseHostTensor {
    /// Allocate a tensor for `metadata` without meaningful contents.
    ///
    /// Fails if the size exceeds the executor's host allocation limit or the
    /// allocation itself fails.
    pub fn create_uninitialized(metadata: TensorMetadata, host: &HostExecutor) -> Result<Self> {
        let size = metadata.host_size_in_bytes();
        host.check_host_allocation(size)?;
        let buffer = HostBuffer::new(size)?;
        Ok(Self {
            metadata,
            buffer: Arc::new(buffer),
        })
    }

    /// Allocate a tensor and fill it with `data`.
    pub fn from_slice(metadata: TensorMetadata, data: &[u8], host: &HostExecutor) -> Result<Self> {
        let size = metadata.host_size_in_bytes();
        if data.len() != size {
            return Err(FlowError::allocation(
                size,
                format!("{} bytes given for a {metadata} tensor", data.len()),
            ));
        }
        let mut tensor = Self::create_uninitialized(metadata, host)?;
        if let Some(contents) = tensor.data_mut() {
            contents.copy_from_slice(data);
        }
        Ok(tensor)
    }

    /// Tensor metadata.
    pub fn metadata(&self) -> &TensorMetadata {
        &self.metadata
    }

    /// Size in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Tensor contents.
    pub fn data(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Mutable contents, if this is the only handle to the buffer.
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        Arc::get_mut(&mut self.buffer).map(HostBuffer::as_mut_slice)
    }

    /// Raw pointer to the first byte, for handing to the device.
    pub fn data_ptr(&self) -> *mut u8 {
        self.buffer.as_ptr()
    }

    /// Number of handles sharing the buffer.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.buffer)
    }
}

/// Dense tensor in device memory.
///
/// Cloning shares the underlying buffer.
#[derive(Debug, Clone)]
pub struct DenseGpuTensor {
    metadata: TensorMetadata,
    buffer: Arc<GpuBuffer>,
}

impl DenseGpuTensor {
    /// Wrap a device buffer.
    pub fn new(metadata: TensorMetadata, buffer: Arc<GpuBuffer>) -> Self {
        Self { metadata, buffer }
    }

    /// Tensor metadata.
    pub fn metadata(&self) -> &TensorMetadata {
        &self.metadata
    }

    /// Size in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.metadata.host_size_in_bytes()
    }

    /// The backing buffer.
    pub fn buffer(&self) -> &Arc<GpuBuffer> {
        &self.buffer
    }
}
