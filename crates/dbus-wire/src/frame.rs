use crate::Endianness;

/// A fixed-size value that can be byte-swapped in place to match a wire
/// endianness.
///
/// # Safety
///
/// Implementors must be able to inhabit any bit pattern of their size and
/// must not have an alignment greater than 8, since frame buffers are only
/// guaranteed to be 8-byte aligned.
pub unsafe trait Frame: Copy {
    /// Swap bytes in place if `endianness` does not match the platform's
    /// native endianness.
    fn adjust(&mut self, endianness: Endianness);
}

unsafe impl Frame for u8 {
    #[inline]
    fn adjust(&mut self, _: Endianness) {}
}

unsafe impl Frame for i8 {
    #[inline]
    fn adjust(&mut self, _: Endianness) {}
}

macro_rules! impl_number {
    ($($ty:ty),* $(,)?) => {
        $(
            unsafe impl Frame for $ty {
                #[inline]
                fn adjust(&mut self, endianness: Endianness) {
                    if endianness != Endianness::NATIVE {
                        *self = <$ty>::swap_bytes(*self);
                    }
                }
            }
        )*
    }
}

impl_number!(u16, u32, u64, i16, i32, i64);

/// Read a `u32` out of a byte slice at the given offset, honoring
/// `endianness`. Panics if the slice is too short; callers are expected to
/// have already bounds-checked via the frame length.
pub fn read_u32(bytes: &[u8], offset: usize, endianness: Endianness) -> u32 {
    let raw: [u8; 4] = bytes[offset..offset + 4].try_into().expect("4 bytes");

    match endianness {
        Endianness::BIG => u32::from_be_bytes(raw),
        _ => u32::from_le_bytes(raw),
    }
}

/// Overwrite a `u32` in place at the given offset in `endianness`, without
/// touching any other byte in the buffer.
pub fn write_u32(bytes: &mut [u8], offset: usize, endianness: Endianness, value: u32) {
    let raw = match endianness {
        Endianness::BIG => value.to_be_bytes(),
        _ => value.to_le_bytes(),
    };

    bytes[offset..offset + 4].copy_from_slice(&raw);
}
