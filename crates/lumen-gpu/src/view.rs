//! Typed views over a [`Buffer`]: [`Vector`] and [`Array`].
//!
//! Elements are laid out at `i * stride`, where the stride is the element size
//! rounded up to the allocator's alignment. Elements are read by value and can
//! only be changed through `update`/`write`, which invalidate the touched
//! range before returning.

use crate::allocator::{Allocator, AllocatorKind};
use crate::buffer::Buffer;
use crate::error::{GpuError, Result};
use crate::raw::MappedPtr;
use ash::vk;
use bytemuck::Pod;
use std::marker::PhantomData;
use std::sync::Arc;

pub(crate) fn index_out_of_range(index: usize, len: usize) -> ! {
    panic!("index out of range: {index} not in [0, {len})")
}

/// Read a `T` at `offset` of a mapping.
///
/// # Safety
/// `offset + size_of::<T>()` must lie inside the mapping.
pub(crate) unsafe fn read_at<T: Pod>(ptr: MappedPtr, offset: u64) -> T {
    unsafe { ptr.add(offset).cast::<T>().read_unaligned() }
}

/// Write a `T` at `offset` of a mapping.
///
/// # Safety
/// `offset + size_of::<T>()` must lie inside the mapping and nothing else may
/// access that range concurrently.
pub(crate) unsafe fn write_at<T: Pod>(ptr: MappedPtr, offset: u64, value: T) {
    unsafe { ptr.add(offset).cast::<T>().write_unaligned(value) }
}

/// A GPU vector of `len` elements, sized at construction.
pub struct Vector<T: Pod> {
    buffer: Buffer,
    ptr: MappedPtr,
    len: usize,
    stride: u64,
    _marker: PhantomData<T>,
}

impl<T: Pod> Vector<T> {
    /// A vector of `len` zeroed elements.
    pub fn new(allocator: &Arc<Allocator>, len: usize, usage: vk::BufferUsageFlags) -> Result<Self> {
        Self::filled(allocator, len, T::zeroed(), usage)
    }

    /// A vector of `len` copies of `value`, invalidated once as a whole.
    pub fn filled(
        allocator: &Arc<Allocator>,
        len: usize,
        value: T,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let vector = Self::uninitialized(allocator, len, usage)?;
        for i in 0..len {
            // SAFETY: `i < len`, and the vector is not shared yet.
            unsafe { write_at(vector.ptr, vector.offset(i), value) };
        }
        vector.buffer.invalidate_all()?;
        Ok(vector)
    }

    /// A vector holding a copy of `values`.
    pub fn from_slice(
        allocator: &Arc<Allocator>,
        values: &[T],
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let mut vector = Self::uninitialized(allocator, values.len(), usage)?;
        vector.write(0, values)?;
        Ok(vector)
    }

    fn uninitialized(
        allocator: &Arc<Allocator>,
        len: usize,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let stride = allocator.align_size(std::mem::size_of::<T>() as u64);
        let size = stride.checked_mul(len as u64).ok_or_else(|| {
            GpuError::AllocationFailed(format!("{len} elements of {stride} bytes overflow"))
        })?;
        let buffer = Buffer::new(allocator, size, usage)?;
        let ptr = buffer.mapped_ptr()?;
        Ok(Self {
            buffer,
            ptr,
            len,
            stride,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Distance in bytes between consecutive elements.
    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Byte offset of element `index`.
    ///
    /// # Panics
    /// If `index >= len`.
    pub fn offset(&self, index: usize) -> u64 {
        if index >= self.len {
            index_out_of_range(index, self.len);
        }
        index as u64 * self.stride
    }

    /// Element `index`, or `None` when out of range.
    pub fn get(&self, index: usize) -> Option<T> {
        (index < self.len).then(|| {
            // SAFETY: `index < len` keeps the read inside the mapping.
            unsafe { read_at(self.ptr, self.offset(index)) }
        })
    }

    /// Element `index`.
    ///
    /// # Panics
    /// If `index >= len`.
    pub fn at(&self, index: usize) -> T {
        let offset = self.offset(index);
        // SAFETY: `offset` checked the index.
        unsafe { read_at(self.ptr, offset) }
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = T> + '_ {
        (0..self.len).map(|i| self.at(i))
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }

    /// Edit element `index` in place, then invalidate it.
    ///
    /// # Panics
    /// If `index >= len`.
    pub fn update<R>(&mut self, index: usize, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let offset = self.offset(index);
        // SAFETY: `offset` checked the index, and `&mut self` is exclusive.
        let mut value: T = unsafe { read_at(self.ptr, offset) };
        let out = f(&mut value);
        // SAFETY: same element as the read above.
        unsafe { write_at(self.ptr, offset, value) };

        self.buffer
            .invalidate(offset, std::mem::size_of::<T>() as u64)?;
        Ok(out)
    }

    /// Overwrite elements starting at `start` and invalidate them with one call.
    ///
    /// # Panics
    /// If the values do not fit.
    pub fn write(&mut self, start: usize, values: &[T]) -> Result<()> {
        let Some(last) = values.len().checked_sub(1) else {
            return Ok(());
        };
        let first = self.offset(start);
        let end = self.offset(start + last) + std::mem::size_of::<T>() as u64;

        for (i, &value) in values.iter().enumerate() {
            // SAFETY: every index up to `start + last` was checked above.
            unsafe { write_at(self.ptr, first + i as u64 * self.stride, value) };
        }
        self.buffer.invalidate(first, end - first)
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Give up the view and keep the buffer.
    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }

    /// Release the staging half and keep only the device-local buffer.
    ///
    /// The contents can no longer be read or updated, so the view is consumed.
    /// The view is handed back unchanged when the staging half was kept: for
    /// host allocations, which have none, or when releasing it failed.
    pub fn into_device_only(mut self) -> std::result::Result<Buffer, Self> {
        if self.buffer.allocator().kind() != AllocatorKind::Device {
            return Err(self);
        }
        if let Err(e) = self.buffer.free_host() {
            tracing::error!(buffer = ?self.buffer.handle(), "failed to release staging memory: {e}");
            if self.buffer.is_mapped() {
                return Err(self);
            }
        }
        Ok(self.buffer)
    }
}

impl<T: Pod + std::fmt::Debug> std::fmt::Debug for Vector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vector")
            .field("len", &self.len)
            .field("stride", &self.stride)
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// A GPU array of exactly `N` elements.
pub struct Array<T: Pod, const N: usize> {
    inner: Vector<T>,
}

impl<T: Pod, const N: usize> Array<T, N> {
    pub fn new(allocator: &Arc<Allocator>, usage: vk::BufferUsageFlags) -> Result<Self> {
        Self::filled(allocator, T::zeroed(), usage)
    }

    /// An array with every element set to `value`.
    pub fn filled(allocator: &Arc<Allocator>, value: T, usage: vk::BufferUsageFlags) -> Result<Self> {
        Ok(Self {
            inner: Vector::filled(allocator, N, value, usage)?,
        })
    }

    pub fn from_array(
        allocator: &Arc<Allocator>,
        values: [T; N],
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        Ok(Self {
            inner: Vector::from_slice(allocator, &values, usage)?,
        })
    }

    pub const fn len(&self) -> usize {
        N
    }

    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    pub fn stride(&self) -> u64 {
        self.inner.stride()
    }

    /// Byte offset of element `index`.
    ///
    /// # Panics
    /// If `index >= N`.
    pub fn offset(&self, index: usize) -> u64 {
        self.inner.offset(index)
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.inner.get(index)
    }

    pub fn at(&self, index: usize) -> T {
        self.inner.at(index)
    }

    pub fn iter(&self) -> impl ExactSizeIterator<Item = T> + '_ {
        self.inner.iter()
    }

    pub fn to_array(&self) -> [T; N] {
        std::array::from_fn(|i| self.inner.at(i))
    }

    /// Edit element `index` in place, then invalidate it.
    ///
    /// # Panics
    /// If `index >= N`.
    pub fn update<R>(&mut self, index: usize, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.inner.update(index, f)
    }

    pub fn write(&mut self, start: usize, values: &[T]) -> Result<()> {
        self.inner.write(start, values)
    }

    pub fn buffer(&self) -> &Buffer {
        self.inner.buffer()
    }

    pub fn into_buffer(self) -> Buffer {
        self.inner.into_buffer()
    }

    pub fn into_device_only(self) -> std::result::Result<Buffer, Self> {
        self.inner.into_device_only().map_err(|inner| Self { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{test_context, HeadlessConfig};

    #[repr(C)]
    #[derive(Debug, Clone, Copy, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
    struct Light {
        position: [f32; 3],
        intensity: f32,
    }

    #[test]
    fn array_fill_and_read() {
        let (device, context) = test_context(HeadlessConfig::default());
        for allocator in [Allocator::host(&context, 0), Allocator::device(&context, 0)] {
            let array =
                Array::<u32, 16>::filled(&allocator, 0xdead_beef, vk::BufferUsageFlags::STORAGE_BUFFER)
                    .unwrap();
            assert_eq!(array.iter().count(), 16);
            assert!(array.iter().all(|v| v == 0xdead_beef));
            for i in 0..16 {
                assert_eq!(array.offset(i), i as u64 * allocator.align_size(4));
            }
        }
        // A device fill is a single upload.
        assert_eq!(device.submissions().len(), 1);
    }

    #[test]
    fn stride_follows_alignment() {
        let (_device, context) = test_context(HeadlessConfig::default());
        let allocator = Allocator::host(&context, 256);
        let vector =
            Vector::<Light>::new(&allocator, 3, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
        assert_eq!(vector.stride(), 256);
        assert_eq!(vector.offset(2), 512);
        assert_eq!(vector.buffer().size(), 768);
    }

    #[test]
    fn update_invalidates_one_element() {
        let (device, context) = test_context(HeadlessConfig::default());
        let allocator = Allocator::device(&context, 32);
        let mut lights = Vector::<Light>::new(&allocator, 4, vk::BufferUsageFlags::UNIFORM_BUFFER)
            .unwrap();

        let old = lights
            .update(2, |light| {
                light.intensity = 3.5;
                std::mem::replace(&mut light.position, [1.0, 2.0, 3.0])
            })
            .unwrap();
        assert_eq!(old, [0.0; 3]);
        assert_eq!(
            lights.at(2),
            Light {
                position: [1.0, 2.0, 3.0],
                intensity: 3.5
            }
        );

        let flush = *device.flushes().last().unwrap();
        assert_eq!(flush.offset, 64);
        assert_eq!(flush.size, std::mem::size_of::<Light>() as u64);

        let on_device = device.read_buffer(lights.buffer().handle()).unwrap();
        let light: Light = bytemuck::pod_read_unaligned(&on_device[64..80]);
        assert_eq!(light.intensity, 3.5);
    }

    #[test]
    #[should_panic(expected = "index out of range: 4 not in [0, 4)")]
    fn update_out_of_range_panics() {
        let (_device, context) = test_context(HeadlessConfig::default());
        let allocator = Allocator::host(&context, 0);
        let mut array =
            Array::<u16, 4>::new(&allocator, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap();
        let _ = array.update(4, |v| *v = 1);
    }

    #[test]
    fn get_is_bounded() {
        let (_device, context) = test_context(HeadlessConfig::default());
        let allocator = Allocator::host(&context, 0);
        let array = Array::from_array(&allocator, [1u8, 2, 3], vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();
        assert_eq!(array.get(2), Some(3));
        assert_eq!(array.get(3), None);
        assert_eq!(array.to_array(), [1, 2, 3]);
    }

    #[test]
    fn write_batches_one_invalidate() {
        let (device, context) = test_context(HeadlessConfig::default());
        let allocator = Allocator::device(&context, 0);
        let mut vector =
            Vector::<u32>::new(&allocator, 8, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap();
        let before = device.submissions().len();

        vector.write(2, &[5, 6, 7]).unwrap();
        assert_eq!(device.submissions().len(), before + 1);
        assert_eq!(vector.to_vec(), vec![0, 0, 5, 6, 7, 0, 0, 0]);

        let on_device: Vec<u32> =
            bytemuck::pod_collect_to_vec(&device.read_buffer(vector.buffer().handle()).unwrap());
        assert_eq!(on_device, vec![0, 0, 5, 6, 7, 0, 0, 0]);
    }

    #[test]
    fn empty_vector_cannot_be_allocated() {
        let (_device, context) = test_context(HeadlessConfig::default());
        let allocator = Allocator::host(&context, 0);
        assert!(matches!(
            Vector::<u32>::new(&allocator, 0, vk::BufferUsageFlags::STORAGE_BUFFER),
            Err(GpuError::ZeroSizedAllocation)
        ));
    }

    #[test]
    fn device_only_keeps_contents() {
        let (device, context) = test_context(HeadlessConfig::default());
        let allocator = Allocator::device(&context, 0);
        let vector = Vector::from_slice(&allocator, &[4u16, 5, 6], vk::BufferUsageFlags::INDEX_BUFFER)
            .unwrap();
        let buffer = vector.into_device_only().unwrap();
        assert!(!buffer.is_mapped());
        assert_eq!(allocator.as_device().unwrap().size_on_host(), 0);
        let on_device: Vec<u16> = bytemuck::pod_collect_to_vec(&device.read_buffer(buffer.handle()).unwrap());
        assert_eq!(on_device, vec![4, 5, 6]);
    }

    #[test]
    fn device_only_is_refused_for_host_allocations() {
        let (_device, context) = test_context(HeadlessConfig::default());
        let allocator = Allocator::host(&context, 0);
        let array = Array::from_array(&allocator, [7u32, 8], vk::BufferUsageFlags::STORAGE_BUFFER)
            .unwrap();
        let array = array.into_device_only().unwrap_err();
        assert_eq!(array.to_array(), [7, 8]);
        assert!(allocator.own(array.buffer().info()));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn overflowing_length_is_rejected() {
        let (device, context) = test_context(HeadlessConfig::default());
        let allocator = Allocator::host(&context, 0);
        assert!(matches!(
            Vector::<u64>::new(&allocator, (1 << 61) + 1, vk::BufferUsageFlags::STORAGE_BUFFER),
            Err(GpuError::AllocationFailed(_))
        ));
        assert_eq!(device.stats().buffers, 0);
    }

    #[test]
    fn freeing_after_the_view_is_given_up() {
        let (_device, context) = test_context(HeadlessConfig::default());
        let allocator = Allocator::host(&context, 0);
        let vector = Vector::<u64>::filled(
            &allocator,
            512,
            0x1111_1111_1111_1111,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )
        .unwrap();
        let buffer = vector.into_buffer();
        let info = *buffer.info();
        // SAFETY: no view maps the allocation and `buffer` is only dropped.
        unsafe { allocator.free(&info) }.unwrap();
        assert!(!allocator.own(&info));

        let other = Vector::<u64>::filled(
            &allocator,
            512,
            0x2222_2222_2222_2222,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )
        .unwrap();
        drop(buffer);
        assert!(allocator.own(other.buffer().info()));
        assert!(other.iter().all(|v| v == 0x2222_2222_2222_2222));
    }
}
