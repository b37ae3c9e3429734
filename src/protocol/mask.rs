//! Client-to-server payload masking (RFC 6455 Section 5.3).

/// Produce a fresh masking key from the thread-local CSPRNG.
#[inline]
pub fn generate() -> [u8; 4] {
    rand::random()
}

/// Scalar definition: XOR byte `i` with key byte `i mod 4`.
#[inline]
fn apply_mask_scalar(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// XOR the buffer with the masking key, one machine word at a time.
///
/// Self-inverse: applying the same key twice restores the input. Produces
/// byte-identical output to the scalar definition for every alignment.
#[inline]
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);

    let (prefix, words, suffix) = unsafe { buf.align_to_mut::<u32>() };

    apply_mask_scalar(prefix, mask);

    // The word loop starts `prefix.len()` bytes into the key cycle.
    let offset = prefix.len() & 3;
    let mask_u32 = if offset > 0 {
        if cfg!(target_endian = "big") {
            mask_u32.rotate_left(8 * offset as u32)
        } else {
            mask_u32.rotate_right(8 * offset as u32)
        }
    } else {
        mask_u32
    };

    for word in words.iter_mut() {
        *word ^= mask_u32;
    }

    apply_mask_scalar(suffix, mask_u32.to_ne_bytes());
}
