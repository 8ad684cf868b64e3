//! File address type, fixed-width codec and checked arithmetic.
//!
//! Addresses are unsigned byte offsets into a container's address space. The
//! all-ones value is reserved as the "undefined" sentinel, and the on-disk
//! encoding is a fixed-width little-endian integer where an undefined address
//! is stored as `width` bytes of `0xFF`.

use crate::error::{Result, VfdError};

/// A byte address inside a container file.
pub type Addr = u64;

/// The undefined address sentinel (encodes as all `0xFF` bytes).
pub const ADDR_UNDEF: Addr = u64::MAX;

/// Whether `addr` is a defined address.
#[inline]
pub fn addr_defined(addr: Addr) -> bool {
    addr != ADDR_UNDEF
}

/// `addr + size`, failing on numeric wraparound or on landing in the
/// undefined sentinel. Address arithmetic must never silently truncate.
pub fn addr_checked_add(addr: Addr, size: u64) -> Result<Addr> {
    if !addr_defined(addr) {
        return Err(VfdError::BadArgument("arithmetic on undefined address"));
    }
    match addr.checked_add(size) {
        Some(end) if addr_defined(end) => Ok(end),
        _ => Err(VfdError::AddressOverflow { addr, size }),
    }
}

/// Encode `addr` into `buf` as `width` little-endian bytes.
///
/// An undefined address is emitted as `width` bytes of `0xFF`. A defined
/// address that does not fit in `width` bytes is an overflow error. The
/// all-ones pattern is reserved for the sentinel, so the largest address
/// representable at a given width is one below it.
pub fn addr_encode(buf: &mut Vec<u8>, width: usize, addr: Addr) -> Result<()> {
    debug_assert!(width >= 1);
    if !addr_defined(addr) {
        buf.extend(std::iter::repeat_n(0xffu8, width));
        return Ok(());
    }
    let mut rest = addr;
    for _ in 0..width {
        buf.push((rest & 0xff) as u8);
        rest >>= 8;
    }
    if rest != 0 {
        return Err(VfdError::AddressOverflow { addr, size: 0 });
    }
    Ok(())
}

/// Decode a `width`-byte little-endian address from the front of `buf`.
///
/// A buffer of all `0xFF` bytes decodes to [`ADDR_UNDEF`] for every width.
/// A non-zero byte beyond the native address width that is not part of the
/// all-ones pattern is an overflow error.
pub fn addr_decode(buf: &[u8], width: usize) -> Result<Addr> {
    debug_assert!(width >= 1);
    if buf.len() < width {
        return Err(VfdError::BadArgument("address buffer shorter than width"));
    }
    let mut addr: Addr = 0;
    let mut all_ones = true;
    for (i, &c) in buf[..width].iter().enumerate() {
        if c != 0xff {
            all_ones = false;
        }
        if i < std::mem::size_of::<Addr>() {
            addr |= (c as Addr) << (i * 8);
        } else if c != 0 && !all_ones {
            return Err(VfdError::AddressOverflow { addr, size: 0 });
        }
    }
    if all_ones { Ok(ADDR_UNDEF) } else { Ok(addr) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(addr: Addr, width: usize) -> Addr {
        let mut buf = Vec::new();
        addr_encode(&mut buf, width, addr).unwrap();
        assert_eq!(buf.len(), width);
        addr_decode(&buf, width).unwrap()
    }

    #[test]
    fn test_roundtrip_defined() {
        for &w in &[1usize, 2, 4, 8, 12] {
            // The all-ones encoding is the sentinel, so the largest
            // representable address at width w is one below it.
            let max = if w >= 8 { u64::MAX - 1 } else { (1u64 << (w * 8)) - 2 };
            for &a in &[0u64, 1, max / 2, max] {
                assert_eq!(roundtrip(a, w), a, "addr {a:#x} width {w}");
            }
        }
    }

    #[test]
    fn test_width_saturated_value_decodes_as_undefined() {
        // A defined address whose width-encoding happens to be all ones is
        // indistinguishable from the sentinel and comes back undefined.
        for &w in &[1usize, 2, 4] {
            let saturated = (1u64 << (w * 8)) - 1;
            assert_eq!(roundtrip(saturated, w), ADDR_UNDEF);
        }
    }

    #[test]
    fn test_roundtrip_undefined() {
        for &w in &[1usize, 2, 8, 16] {
            assert_eq!(roundtrip(ADDR_UNDEF, w), ADDR_UNDEF);
        }
    }

    #[test]
    fn test_all_ones_is_undefined_for_every_width() {
        for w in 1..=16usize {
            let buf = vec![0xffu8; w];
            assert_eq!(addr_decode(&buf, w).unwrap(), ADDR_UNDEF);
        }
    }

    #[test]
    fn test_encode_overflow() {
        let mut buf = Vec::new();
        let err = addr_encode(&mut buf, 2, 0x1_0000).unwrap_err();
        assert!(matches!(err, VfdError::AddressOverflow { .. }));
    }

    #[test]
    fn test_decode_overflow_past_native_width() {
        // 9-byte encoding with a non-zero high byte that is not all-ones.
        let mut buf = vec![0u8; 9];
        buf[8] = 0x01;
        let err = addr_decode(&buf, 9).unwrap_err();
        assert!(matches!(err, VfdError::AddressOverflow { .. }));
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(addr_decode(&[0u8; 3], 4).is_err());
    }

    #[test]
    fn test_checked_add() {
        assert_eq!(addr_checked_add(10, 20).unwrap(), 30);
        assert!(addr_checked_add(u64::MAX - 1, 1).is_err()); // lands on sentinel
        assert!(addr_checked_add(u64::MAX - 1, 2).is_err()); // wraps
        assert!(addr_checked_add(ADDR_UNDEF, 0).is_err());
    }
}
