//! RFC 6455 payload masking.
//!
//! Masking is a plain XOR with a 4-byte key, where byte `i` of the payload uses key byte
//! `i mod 4`. Payloads written or received in several pieces are masked as one continuous
//! stream, so every function here takes the running `offset` of the first byte.

/// Masks (or unmasks, the operation is symmetric) `buf` in place.
///
/// `offset` is the position of `buf[0]` inside the whole frame payload, which selects the
/// key byte to start with. Passing the cumulative offset allows a payload split into
/// several buffers to be masked as a single contiguous stream.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4], offset: usize) {
    apply_mask_fast32(buf, rotate_key(key, offset));
}

/// Masks a sequence of chunks as if they were one contiguous payload.
///
/// Returns the total number of bytes masked, which is also the offset at which a
/// following chunk of the same payload would start.
pub fn bulk_mask<'a, I>(chunks: I, key: [u8; 4]) -> usize
where
    I: IntoIterator<Item = &'a mut [u8]>,
{
    let mut offset = 0;
    for chunk in chunks {
        apply_mask(chunk, key, offset);
        offset += chunk.len();
    }
    offset
}

/// Shifts the key so that index 0 lines up with the payload byte at `offset`.
#[inline]
fn rotate_key(key: [u8; 4], offset: usize) -> [u8; 4] {
    let shift = offset & 3;
    [
        key[shift],
        key[(shift + 1) & 3],
        key[(shift + 2) & 3],
        key[(shift + 3) & 3],
    ]
}

/// A safe unoptimized mask application.
#[inline]
fn apply_mask_fallback(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Faster version of the fallback which operates on 4-byte blocks.
#[inline]
fn apply_mask_fast32(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);

    // SAFETY: any bit pattern is a valid u32, and `align_to_mut` only hands out the
    // correctly aligned middle part.
    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u32>() };
    apply_mask_fallback(prefix, mask);
    let head = prefix.len() & 3;
    let mask_u32 = if head > 0 {
        if cfg!(target_endian = "big") {
            mask_u32.rotate_left(8 * head as u32)
        } else {
            mask_u32.rotate_right(8 * head as u32)
        }
    } else {
        mask_u32
    };
    for word in words.iter_mut() {
        *word ^= mask_u32;
    }
    apply_mask_fallback(suffix, mask_u32.to_ne_bytes());
}
