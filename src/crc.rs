//! Parameterized CRC engine
//!
//! A CRC is the remainder of the message polynomial after division by a
//! generator polynomial over GF(2), dressed up with an initial register
//! value, a final XOR mask, and optional bit-reflection of the input bytes
//! and of the final register. Every commonly deployed CRC is an instance of
//! the six-tuple (width, poly, init, xor_out, reflect_in, reflect_out).
//!
//! The register is a [`Bigint`], so the width is limited only by patience.
//! The engine processes one bit per step; the interesting speedups live in
//! the sparse differential engine, not here.

use crate::bigint::Bigint;
use core::fmt;

/// Mask selecting message bit `pos` in stream order
///
/// Stream order is the order bits are fed to the shift register: LSB-first
/// within each byte when the input is reflected, MSB-first otherwise.
///
pub(crate) fn stream_mask(reflect_in: bool, pos: usize) -> u8 {
    if reflect_in {
        1 << (pos % 8)
    } else {
        0x80 >> (pos % 8)
    }
}

/// A full CRC parameter set
///
/// Immutable once built; shared read-only by the sparse engine and the
/// forger. All bigint fields have the register width.
///
#[derive(Debug, Clone)]
pub struct Crc {
    width: usize,
    poly: Bigint,
    init: Bigint,
    xor_out: Bigint,
    reflect_in: bool,
    reflect_out: bool,
}

impl Crc {
    /// Build a CRC from its parameters
    ///
    /// `poly`, `init` and `xor_out` must all be `width` bits wide. The
    /// leading (implicit) coefficient of the generator polynomial is not
    /// stored.
    ///
    pub fn new(
        width: usize,
        poly: Bigint,
        init: Bigint,
        xor_out: Bigint,
        reflect_in: bool,
        reflect_out: bool,
    ) -> Crc {
        assert!(width > 0, "zero-width crc");
        assert_eq!(poly.bits(), width, "poly width mismatch");
        assert_eq!(init.bits(), width, "init width mismatch");
        assert_eq!(xor_out.bits(), width, "xor_out width mismatch");
        Crc {
            width,
            poly,
            init,
            xor_out,
            reflect_in,
            reflect_out,
        }
    }

    // Check values below are the CRC of the ASCII string "123456789"

    /// CRC-8, check f4
    pub fn crc8() -> Crc {
        Crc::new(
            8,
            Bigint::from_u64(8, 0x07),
            Bigint::new(8),
            Bigint::new(8),
            false,
            false,
        )
    }

    /// CRC-16/CCITT-FALSE, check 29b1
    pub fn crc16_ccitt() -> Crc {
        Crc::new(
            16,
            Bigint::from_u64(16, 0x1021),
            Bigint::from_u64(16, 0xffff),
            Bigint::new(16),
            false,
            false,
        )
    }

    /// CRC-32, check cbf43926
    pub fn crc32() -> Crc {
        let mut ones = Bigint::new(32);
        ones.load_ones();
        Crc::new(
            32,
            Bigint::from_u64(32, 0x04c11db7),
            ones.clone(),
            ones,
            true,
            true,
        )
    }

    /// CRC-32C (Castagnoli), check e3069283
    pub fn crc32c() -> Crc {
        let mut ones = Bigint::new(32);
        ones.load_ones();
        Crc::new(
            32,
            Bigint::from_u64(32, 0x1edc6f41),
            ones.clone(),
            ones,
            true,
            true,
        )
    }

    /// CRC-64/ECMA-182, check 6c40df5f0b497347
    pub fn crc64_ecma() -> Crc {
        Crc::new(
            64,
            Bigint::from_u64(64, 0x42f0e1eba9ea3693),
            Bigint::new(64),
            Bigint::new(64),
            false,
            false,
        )
    }

    /// Register width in bits
    pub fn width(&self) -> usize {
        self.width
    }

    /// Whether input bytes are consumed LSB-first
    pub fn reflect_in(&self) -> bool {
        self.reflect_in
    }

    /// Checksum of a whole message
    pub fn checksum(&self, msg: &[u8]) -> Bigint {
        let mut reg = Bigint::new(self.width);
        self.checksum_bits(msg, 0, 8 * msg.len(), &mut reg);
        reg
    }

    /// Run the register over stream bits [i, j) of `msg`
    ///
    /// The register must hold the state carried in from any preceding bits
    /// (all zeros for a fresh message). This is the one loop everything else
    /// in the crate reduces to.
    ///
    pub fn checksum_bits(&self, msg: &[u8], i: usize, j: usize, checksum: &mut Bigint) {
        assert_eq!(checksum.bits(), self.width, "register width mismatch");
        *checksum ^= &self.init;
        for pos in i..j {
            let bit = checksum.msb() ^ (msg[pos / 8] & stream_mask(self.reflect_in, pos) != 0);
            checksum.shl1();
            if bit {
                *checksum ^= &self.poly;
            }
        }
        *checksum ^= &self.xor_out;
        if self.reflect_out {
            checksum.reflect();
        }
    }

    /// Extend the checksum of a prefix with another chunk
    ///
    /// `checksum` holds CRC(P) on entry and CRC(P || chunk) on return, so a
    /// message of any length can be consumed in pieces without buffering.
    ///
    pub fn append(&self, chunk: &[u8], checksum: &mut Bigint) {
        self.append_bits(chunk, 0, 8 * chunk.len(), checksum);
    }

    /// Bit-range variant of [`Crc::append`]
    pub fn append_bits(&self, msg: &[u8], i: usize, j: usize, checksum: &mut Bigint) {
        // unwind the output transform and the init the main loop reapplies
        if self.reflect_out {
            checksum.reflect();
        }
        *checksum ^= &self.xor_out;
        *checksum ^= &self.init;
        self.checksum_bits(msg, i, j, checksum);
    }
}

impl Default for Crc {
    fn default() -> Crc {
        Crc::crc32()
    }
}

impl fmt::Display for Crc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "width={} poly={} init={} xor_out={} reflect_in={} reflect_out={}",
            self.width, self.poly, self.init, self.xor_out, self.reflect_in, self.reflect_out
        )
    }
}
