//! Heterogeneous fixed-layout view over a [`Buffer`].

use crate::allocator::{checked_align_size, Allocator};
use crate::buffer::Buffer;
use crate::error::{GpuError, Result};
use crate::raw::MappedPtr;
use crate::view::{index_out_of_range, read_at, write_at};
use ash::vk;
use bytemuck::Pod;
use std::marker::PhantomData;
use std::sync::Arc;

/// A tuple of `Pod` fields that can be laid out in a [`Tuple`].
pub trait Fields: Copy {
    /// Number of fields.
    const COUNT: usize;

    /// Size of each field in order.
    fn sizes() -> Vec<u64>;

    fn zeroed() -> Self;

    /// Write every field at its offset.
    ///
    /// # Safety
    /// Each `offsets[k] + sizes()[k]` must lie inside the mapping.
    unsafe fn write_fields(&self, ptr: MappedPtr, offsets: &[u64]);
}

/// Type of field `K` of a [`Fields`] tuple.
pub trait Field<const K: usize>: Fields {
    type Output: Pod;
}

macro_rules! impl_fields {
    ($(($idx:tt, $T:ident)),+) => {
        impl<$($T: Pod),+> Fields for ($($T,)+) {
            const COUNT: usize = impl_fields!(@count $($T)+);

            fn sizes() -> Vec<u64> {
                vec![$(std::mem::size_of::<$T>() as u64),+]
            }

            fn zeroed() -> Self {
                ($($T::zeroed(),)+)
            }

            unsafe fn write_fields(&self, ptr: MappedPtr, offsets: &[u64]) {
                // SAFETY: forwarded to the caller.
                unsafe { $(write_at(ptr, offsets[$idx], self.$idx);)+ }
            }
        }

        impl_fields!(@fields [$($T),+] $(($idx, $T))+);
    };
    (@count $($T:ident)+) => {
        0 $(+ impl_fields!(@one $T))+
    };
    (@one $T:ident) => {
        1
    };
    (@fields $all:tt $(($idx:tt, $F:ident))+) => {
        $(impl_fields!(@field $all $idx $F);)+
    };
    (@field [$($T:ident),+] $idx:tt $F:ident) => {
        impl<$($T: Pod),+> Field<$idx> for ($($T,)+) {
            type Output = $F;
        }
    };
}

impl_fields!((0, A));
impl_fields!((0, A), (1, B));
impl_fields!((0, A), (1, B), (2, C));
impl_fields!((0, A), (1, B), (2, C), (3, D));
impl_fields!((0, A), (1, B), (2, C), (3, D), (4, E));
impl_fields!((0, A), (1, B), (2, C), (3, D), (4, E), (5, G));
impl_fields!((0, A), (1, B), (2, C), (3, D), (4, E), (5, G), (6, H));
impl_fields!((0, A), (1, B), (2, C), (3, D), (4, E), (5, G), (6, H), (7, I));

/// Fields of `F` stored back to back, each starting at an aligned offset.
///
/// Field offsets are computed once at construction by accumulating the
/// aligned field sizes.
pub struct Tuple<F: Fields> {
    buffer: Buffer,
    ptr: MappedPtr,
    offsets: Vec<u64>,
    _marker: PhantomData<F>,
}

impl<F: Fields> Tuple<F> {
    /// A tuple with every field zeroed.
    pub fn new(allocator: &Arc<Allocator>, usage: vk::BufferUsageFlags) -> Result<Self> {
        Self::from_values(allocator, F::zeroed(), usage)
    }

    /// A tuple holding `values`, invalidated once as a whole.
    pub fn from_values(
        allocator: &Arc<Allocator>,
        values: F,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let (offsets, size) = field_offsets(&F::sizes(), allocator.alignment())?;
        let buffer = Buffer::new(allocator, size, usage)?;
        let ptr = buffer.mapped_ptr()?;
        // SAFETY: the offsets were laid out inside `size` bytes.
        unsafe { values.write_fields(ptr, &offsets) };
        buffer.invalidate_all()?;

        Ok(Self {
            buffer,
            ptr,
            offsets,
            _marker: PhantomData,
        })
    }

    /// Byte offset of field `k`.
    ///
    /// # Panics
    /// If `k` is not a field index.
    pub fn offset(&self, k: usize) -> u64 {
        match self.offsets.get(k) {
            Some(&offset) => offset,
            None => index_out_of_range(k, F::COUNT),
        }
    }

    /// Current value of field `K`.
    pub fn get<const K: usize>(&self) -> <F as Field<K>>::Output
    where
        F: Field<K>,
    {
        // SAFETY: field `K` exists, so its offset and size are inside the buffer.
        unsafe { read_at(self.ptr, self.offsets[K]) }
    }

    /// Edit field `K` in place, then invalidate exactly that field.
    pub fn update<const K: usize, R>(
        &mut self,
        f: impl FnOnce(&mut <F as Field<K>>::Output) -> R,
    ) -> Result<R>
    where
        F: Field<K>,
    {
        let offset = self.offsets[K];
        // SAFETY: as in `get`; `&mut self` is exclusive.
        let mut value = unsafe { read_at::<<F as Field<K>>::Output>(self.ptr, offset) };
        let out = f(&mut value);
        // SAFETY: same field as the read above.
        unsafe { write_at(self.ptr, offset, value) };

        self.buffer
            .invalidate(offset, std::mem::size_of::<<F as Field<K>>::Output>() as u64)?;
        Ok(out)
    }

    /// Replace field `K`.
    pub fn set<const K: usize>(&mut self, value: <F as Field<K>>::Output) -> Result<()>
    where
        F: Field<K>,
    {
        self.update::<K, ()>(|field| *field = value)
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

/// Offset of each field and the total size, every field starting at an
/// aligned offset.
fn field_offsets(sizes: &[u64], alignment: u64) -> Result<(Vec<u64>, u64)> {
    let mut offsets = Vec::with_capacity(sizes.len());
    let mut size = 0u64;
    for &field_size in sizes {
        offsets.push(size);
        size = checked_align_size(field_size, alignment)
            .ok()
            .and_then(|aligned| size.checked_add(aligned))
            .ok_or_else(|| GpuError::AllocationFailed("tuple layout overflows".to_string()))?;
    }
    Ok((offsets, size))
}
