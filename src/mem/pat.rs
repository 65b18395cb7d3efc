//! Cache-mode encoding via the x86-64 PAT.
//!
//! All the values are fixed, so everything here is a simple lookup. The
//! PAT register is programmed identically on every CPU as:
//!
//! ```text
//! index  mode             (default?)
//! 0      write-back       (default)
//! 1      write-through    (default)
//! 2      write-combining  (replaces UC-)
//! 3      uncacheable      (default)
//! 4      write-back       (default)
//! 5      write-through    (default)
//! 6      write-protected  (replaces UC-)
//! 7      uncacheable      (default)
//! ```
//!
//! A PAT index reaches a page-table entry through three bits: PWT (bit 3),
//! PCD (bit 4) and PAT (bit 12 for 2 MiB PD entries). Intermediate table
//! entries have no PAT bit, so only indices 0–3 are usable there.

use crate::error::{KernelError, Result};

/// Value programmed into IA32_PAT, encoding the table above.
pub const PAT_REGISTER_VAL: u64 = 0x0005_0406_0001_0406;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    WriteBack,
    WriteThrough,
    WriteCombining,
    Uncacheable,
    WriteProtected,
}

/// PAT index that fulfils the requested caching mode.
///
/// `first_half` restricts the result to indices 0–3 for entries without a
/// PAT bit; write-protected cannot be expressed there.
pub fn pat_index(mode: CacheMode, first_half: bool) -> Result<u8> {
    let idx = match mode {
        CacheMode::WriteBack => 0,
        CacheMode::WriteThrough => 1,
        CacheMode::WriteCombining => 2,
        CacheMode::Uncacheable => 3,
        CacheMode::WriteProtected => {
            if first_half {
                return Err(KernelError::InvalidParam);
            }
            6
        }
    };
    Ok(idx)
}

/// Caching mode a PAT index decodes to.
pub fn decode(pat_idx: u8) -> CacheMode {
    match pat_idx & 7 {
        0 | 4 => CacheMode::WriteBack,
        1 | 5 => CacheMode::WriteThrough,
        2 => CacheMode::WriteCombining,
        6 => CacheMode::WriteProtected,
        _ => CacheMode::Uncacheable,
    }
}

/// Program the PAT on the calling CPU. Each CPU runs this once during its
/// own bring-up.
#[cfg(target_arch = "x86_64")]
pub fn init() {
    use x86_64::registers::model_specific::Msr;
    const IA32_PAT: u32 = 0x277;
    let mut msr = Msr::new(IA32_PAT);
    unsafe { msr.write(PAT_REGISTER_VAL) };
}

#[cfg(not(target_arch = "x86_64"))]
pub fn init() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_agree() {
        for mode in [
            CacheMode::WriteBack,
            CacheMode::WriteThrough,
            CacheMode::WriteCombining,
            CacheMode::Uncacheable,
            CacheMode::WriteProtected,
        ] {
            let idx = pat_index(mode, false).unwrap();
            assert_eq!(decode(idx), mode);
        }
    }

    #[test]
    fn first_half_cannot_express_write_protected() {
        assert!(pat_index(CacheMode::WriteProtected, true).is_err());
        for mode in [
            CacheMode::WriteBack,
            CacheMode::WriteThrough,
            CacheMode::WriteCombining,
            CacheMode::Uncacheable,
        ] {
            assert!(pat_index(mode, true).unwrap() <= 3);
        }
    }

    #[test]
    fn register_value_matches_table() {
        // Index 2 must be write-combining (0x01) and index 6
        // write-protected (0x05); the rest are the power-on defaults.
        let bytes = PAT_REGISTER_VAL.to_le_bytes();
        assert_eq!(bytes[0], 0x06); // WB
        assert_eq!(bytes[1], 0x04); // WT
        assert_eq!(bytes[2], 0x01); // WC
        assert_eq!(bytes[3], 0x00); // UC
        assert_eq!(bytes[6], 0x05); // WP
    }
}
