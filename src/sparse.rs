//! Sparse CRC differential engine
//!
//! Forging asks, for thousands of candidate positions p, "what would the
//! checksum be if message bit p were flipped?". Recomputing the CRC is O(N)
//! per query. Because CRC is linear over GF(2),
//!
//! ``` text
//! CRC(msg ^ e_p) = CRC(msg) ^ delta(p),    delta(p) = CRC(e_p) ^ CRC(0)
//! ```
//!
//! so the base message doesn't matter at all; only the single-bit difference
//! `delta(p)` does. This engine precomputes enough structure to produce any
//! `delta(p)` in O(w^2) after O(w^2 log N) setup:
//!
//! - `D`, a w-by-w matrix whose row i is the difference of flipping bit i
//!   inside a w-bit reference window,
//! - `L[j]` and `R[j]`, matrices that move a flip 2^j positions towards the
//!   high or low end of the message while keeping the same window. `L[0]`
//!   and `R[0]` are measured directly (solving against `D`), the rest are
//!   obtained by squaring.
//!
//! A query decomposes the distance between the flip position and the
//! reference window into powers of two and multiplies the corresponding
//! move matrices onto `D`, ping-ponging between two scratch matrices.
//!
//! All (2 log2 N + 3) * w rows of this machinery live in one [`RowPool`]
//! allocation, laid out as D, then the L levels, then the R levels, then
//! the two-matrix scratch. The scratch doubles as working space for the
//! construction-time solves.
//!
//! Messages shorter than the register width skip all of this and answer
//! queries with two explicit recomputations over a tiny window buffer.

use crate::bigint::Bigint;
use crate::crc::{stream_mask, Crc};
use crate::matrix::{mat_copy, mat_mul, mat_solve, RowPool};
use thiserror::Error;

/// Engine construction failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The single-bit differences of the reference window are linearly
    /// dependent, so no move matrix can be solved for. Generator
    /// polynomials with a non-zero constant term never end up here.
    #[error("degenerate crc parameters: single-bit differences are linearly dependent")]
    Degenerate,
}

/// Position of the most significant set bit, plus one
fn bit_length(mut v: usize) -> usize {
    let mut n = 0;
    while v != 0 {
        v >>= 1;
        n += 1;
    }
    n
}

enum Rep {
    /// size < w: explicit recomputation over a zero window buffer
    Short { window: Vec<u8> },
    /// one pool of (2 levels + 3) * w rows: D | L | R | scratch
    Windows { pool: RowPool, levels: usize },
}

/// Single-bit-flip checksum oracle for a fixed-length message
///
/// Built once per forging run; queries mutate only the internal scratch, so
/// observable behavior is a pure function of the parameters.
///
pub struct SparseCrc {
    crc: Crc,
    size: usize,
    rep: Rep,
}

impl SparseCrc {
    /// Build an engine for messages of exactly `size` bits
    pub fn new(crc: &Crc, size: usize) -> Result<SparseCrc, EngineError> {
        let w = crc.width();
        if size < w {
            return Ok(SparseCrc {
                crc: crc.clone(),
                size,
                rep: Rep::Short {
                    window: vec![0; (size + 7) / 8],
                },
            });
        }

        let m = bit_length(w);
        let n = bit_length(size);
        let reflect = crc.reflect_in();
        let mut buf = vec![0u8; (2 * w + 7) / 8];
        let mut z = Bigint::new(w);
        let mut row = Bigint::new(w);

        // the whole engine in one allocation
        let mut pool = RowPool::new((2 * n + 3) * w, w);
        let d = 0;
        let l0 = w;
        let r0 = w + n * w;
        let pq = w + 2 * n * w;

        // D: flip each bit of the leftmost w-bit window in turn
        crc.checksum_bits(&buf, 0, w, &mut z);
        for i in 0..w {
            buf[i / 8] ^= stream_mask(reflect, i);
            row.load_zeros();
            crc.checksum_bits(&buf, 0, w, &mut row);
            row ^= &z;
            pool.set_row(d + i, &row);
            buf[i / 8] ^= stream_mask(reflect, i);
        }

        // measure power-of-two moves up to the register width; the window
        // grows to w + 2^j bits, which the 2w-bit buffer always covers
        for j in 0..m {
            let s = 1usize << j;
            z.load_zeros();
            crc.checksum_bits(&buf, 0, w + s, &mut z);

            for i in 0..w {
                let pos = s + i;
                buf[pos / 8] ^= stream_mask(reflect, pos);
                row.load_zeros();
                crc.checksum_bits(&buf, 0, w + s, &mut row);
                row ^= &z;
                pool.set_row(l0 + j * w + i, &row);
                buf[pos / 8] ^= stream_mask(reflect, pos);
            }
            mat_copy(&mut pool, pq, d);
            if !mat_solve(&mut pool, pq, l0 + j * w) {
                return Err(EngineError::Degenerate);
            }

            for i in 0..w {
                buf[i / 8] ^= stream_mask(reflect, i);
                row.load_zeros();
                crc.checksum_bits(&buf, 0, w + s, &mut row);
                row ^= &z;
                pool.set_row(r0 + j * w + i, &row);
                buf[i / 8] ^= stream_mask(reflect, i);
            }
            mat_copy(&mut pool, pq, d);
            if !mat_solve(&mut pool, pq, r0 + j * w) {
                return Err(EngineError::Degenerate);
            }
        }

        // remaining moves by squaring: L[j] = L[j-1] * L[j-1]
        for j in m..n {
            mat_mul(&mut pool, l0 + (j - 1) * w, l0 + (j - 1) * w, l0 + j * w);
            mat_mul(&mut pool, r0 + (j - 1) * w, r0 + (j - 1) * w, r0 + j * w);
        }

        Ok(SparseCrc {
            crc: crc.clone(),
            size,
            rep: Rep::Windows { pool, levels: n },
        })
    }

    /// Message length in bits
    pub fn size(&self) -> usize {
        self.size
    }

    /// Register width in bits
    pub fn width(&self) -> usize {
        self.crc.width()
    }

    /// XOR into `checksum` the difference caused by flipping message bit `pos`
    ///
    /// `pos` is a canonical bit index (LSB of byte 0 is bit 0) and must be
    /// inside the message. Applied to the checksum of any message of the
    /// engine's length, the result is the checksum of that message with bit
    /// `pos` inverted.
    ///
    pub fn flip(&mut self, pos: usize, checksum: &mut Bigint) {
        assert!(pos < self.size, "bit position out of range");
        assert_eq!(checksum.bits(), self.crc.width(), "register width mismatch");
        let w = self.crc.width();

        match &mut self.rep {
            Rep::Short { window } => {
                let mut x = Bigint::new(w);
                self.crc.checksum_bits(window, 0, self.size, &mut x);
                *checksum ^= &x;
                window[pos / 8] ^= 1 << (pos % 8);
                x.load_zeros();
                self.crc.checksum_bits(window, 0, self.size, &mut x);
                *checksum ^= &x;
                window[pos / 8] ^= 1 << (pos % 8);
            }
            Rep::Windows { pool, levels } => {
                let n = *levels;
                let l0 = w;
                let r0 = w + n * w;
                let pbase = w + 2 * n * w;
                let qbase = pbase + w;

                // the window algebra runs on stream positions
                let s = if self.crc.reflect_in() {
                    pos
                } else {
                    (pos & !7) | (7 - (pos & 7))
                };
                if s >= self.size {
                    // the register never consumes this bit
                    return;
                }

                // ldist + w + rdist == size
                let mut ldist = if s < w { 0 } else { s - (w - 1) };
                let mut rdist = self.size - (ldist + w);

                mat_copy(pool, pbase, 0);
                let mut cur = pbase;

                let mut j = 0;
                while ldist != 0 {
                    if ldist & 1 != 0 {
                        let dst = if cur == pbase { qbase } else { pbase };
                        mat_mul(pool, cur, l0 + j * w, dst);
                        cur = dst;
                    }
                    ldist >>= 1;
                    j += 1;
                }

                let mut j = 0;
                while rdist != 0 {
                    if rdist & 1 != 0 {
                        let dst = if cur == pbase { qbase } else { pbase };
                        mat_mul(pool, cur, r0 + j * w, dst);
                        cur = dst;
                    }
                    rdist >>= 1;
                    j += 1;
                }

                pool.xor_into(cur + if s < w { s } else { w - 1 }, checksum);
            }
        }
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use rand::Rng;

    fn flipped(msg: &[u8], pos: usize) -> Vec<u8> {
        let mut out = msg.to_vec();
        out[pos / 8] ^= 1 << (pos % 8);
        out
    }

    /// every queried difference must match an explicit recomputation
    fn check_engine(crc: &Crc, len: usize) {
        let msg = vec![0u8; len];
        let base = crc.checksum(&msg);
        let mut engine = SparseCrc::new(crc, 8 * len).unwrap();

        let size = 8 * len;
        let positions: Vec<usize> = if size <= 256 {
            (0..size).collect()
        } else {
            let w = crc.width();
            vec![
                0,
                1,
                7,
                8,
                w - 1,
                w,
                w + 1,
                size / 2,
                size - w,
                size - 2,
                size - 1,
            ]
        };

        for &pos in &positions {
            let mut got = base.clone();
            engine.flip(pos, &mut got);
            let want = crc.checksum(&flipped(&msg, pos));
            assert_eq!(got, want, "pos {} len {} w {}", pos, len, crc.width());
        }
    }

    #[test]
    fn matches_recomputation_crc32() {
        for &len in &[4, 5, 8, 13, 64, 1000] {
            check_engine(&Crc::crc32(), len);
        }
    }

    #[test]
    fn matches_recomputation_unreflected() {
        for &len in &[2, 3, 9, 40, 500] {
            check_engine(&Crc::crc16_ccitt(), len);
        }
        for &len in &[1, 2, 31] {
            check_engine(&Crc::crc8(), len);
        }
    }

    #[test]
    fn matches_recomputation_crc64() {
        for &len in &[8, 9, 100] {
            check_engine(&Crc::crc64_ecma(), len);
        }
    }

    #[test]
    fn short_message_path() {
        // fewer message bits than register bits
        for &len in &[1, 2, 3] {
            check_engine(&Crc::crc32(), len);
        }
        check_engine(&Crc::crc64_ecma(), 7);
    }

    #[test]
    fn base_message_independence() {
        // the difference applies on top of any message, not just zeros
        let mut rng = rand::thread_rng();
        let crc = Crc::crc32();
        let msg: Vec<u8> = (0..40).map(|_| rng.gen()).collect();
        let base = crc.checksum(&msg);
        let mut engine = SparseCrc::new(&crc, 8 * msg.len()).unwrap();

        for _ in 0..32 {
            let pos = rng.gen_range(0..8 * msg.len());
            let mut got = base.clone();
            engine.flip(pos, &mut got);
            assert_eq!(got, crc.checksum(&flipped(&msg, pos)));
        }
    }

    #[test]
    fn flip_twice_cancels() {
        let crc = Crc::crc16_ccitt();
        let msg = vec![0u8; 25];
        let base = crc.checksum(&msg);
        let mut engine = SparseCrc::new(&crc, 8 * msg.len()).unwrap();

        let mut reg = base.clone();
        engine.flip(77, &mut reg);
        engine.flip(77, &mut reg);
        assert_eq!(reg, base);
    }

    #[test]
    fn pool_is_sized_to_the_message() {
        // (2 log2 N + 3) * w rows, in one buffer
        let engine = SparseCrc::new(&Crc::crc32(), 8 * 1000).unwrap();
        match &engine.rep {
            Rep::Windows { pool, levels } => {
                let n = *levels;
                assert_eq!(n, bit_length(8 * 1000));
                assert_eq!(pool.rows(), (2 * n + 3) * 32);
            }
            Rep::Short { .. } => panic!("expected the windowed representation"),
        }
    }

    #[test]
    fn degenerate_parameters_rejected() {
        // x^2 + x has a zero constant term and collapses the window diffs
        let crc = Crc::new(
            2,
            Bigint::from_u64(2, 0b10),
            Bigint::new(2),
            Bigint::new(2),
            false,
            false,
        );
        match SparseCrc::new(&crc, 64) {
            Err(EngineError::Degenerate) => {}
            Ok(_) => panic!("degenerate parameters accepted"),
        }
    }
}
