//! GF(2) linear solver that picks the bits to flip
//!
//! Any checksum H with the weak linearity property
//!
//! ``` text
//! H(x ^ y ^ z) = H(x) ^ H(y) ^ H(z)    for |x| = |y| = |z|
//! ```
//!
//! can be forged: flipping a set S of message bits moves the checksum by the
//! XOR of the individual single-bit differences, so finding S is solving the
//! linear system A x = d where row i of A is the difference contributed by
//! candidate bit i and d is the distance to the desired checksum.
//!
//! The elimination keeps no separate identity matrix. Once column i is
//! processed, bits below the pivot position are dead in every remaining row,
//! and those freed positions are reused to record which original rows were
//! XORed together. The low bits of a pivot row therefore name the exact
//! candidate subset that produces it, which is what gets read back into the
//! solution.

use crate::bigint::Bigint;
use thiserror::Error;

/// XOR row `src` into row `dst`, dst != src
fn xor_row(rows: &mut [Bigint], dst: usize, src: usize) {
    debug_assert_ne!(dst, src);
    if dst < src {
        let (head, tail) = rows.split_at_mut(src);
        head[dst] ^= &tail[0];
    } else {
        let (head, tail) = rows.split_at_mut(dst);
        tail[0] ^= &head[src];
    }
}

/// Forging failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForgeError {
    /// The system is inconsistent: the candidate bits span too small a
    /// subspace to reach the target. `needed` estimates how many more
    /// linearly independent bits would make it solvable.
    #[error("not enough mutable bits, need about {needed} more")]
    Insufficient { needed: usize },
}

/// Choose a subset of `bits` whose flips move the checksum to `target`
///
/// `oracle(Some(p))` must return the checksum of the message with bit p
/// flipped and `oracle(None)` the checksum of the untouched message; the
/// sparse engine provides exactly this. `bits` holds candidate bit indices
/// and is permuted in place: on success the function returns k and
/// `bits[0..k]` are the positions to flip, 0 <= k <= width.
///
pub fn forge<H>(target: &Bigint, mut oracle: H, bits: &mut [usize]) -> Result<usize, ForgeError>
where
    H: FnMut(Option<usize>) -> Bigint,
{
    let width = target.bits();
    let n = bits.len();

    let hmsg = oracle(None);
    assert_eq!(hmsg.bits(), width, "oracle width mismatch");

    // A[i] = H(msg ^ e_bits[i]) ^ H(msg), one w-bit row per candidate
    let mut at: Vec<Bigint> = Vec::with_capacity(n);
    for &pos in bits.iter() {
        let mut row = oracle(Some(pos));
        row ^= &hmsg;
        at.push(row);
    }

    // d = target ^ H(msg)
    let mut d = target.clone();
    d ^= &hmsg;

    let mut x = Bigint::new(width);
    let mut mask = Bigint::new(width);
    let mut acc = Bigint::new(width);

    let mut p = 0;
    let mut col = 0;
    while col < width {
        // find a pivot row with a one in this column
        match (p..n).find(|&j| at[j].get_bit(col)) {
            Some(j) => {
                // the permutation of bits[] mirrors every row swap, so row p
                // always describes the candidate at bits[p]
                bits.swap(j, p);
                at.swap(j, p);

                for j in p + 1..n {
                    if at[j].get_bit(col) {
                        xor_row(&mut at, j, p);
                        // bookkeeping: remember the combination
                        at[j].set_bit(p);
                    }
                }

                if d.get_bit(col) {
                    // d ^= at[p] & !((1 << col) - 1)
                    acc.copy_from(&mask);
                    acc.not();
                    acc &= &at[p];
                    d ^= &acc;

                    // x ^= (1 << p) ^ (at[p] & ((1 << col) - 1))
                    acc ^= &at[p];
                    acc.flip_bit(p);
                    x ^= &acc;
                }

                p += 1;
            }
            None => {
                // zero column; fatal only if the residual needs it
                if d.get_bit(col) {
                    break;
                }
            }
        }

        // mask = (1 << col) - 1 for the next column
        mask.shl1();
        mask.set_bit(0);
        col += 1;
    }

    if col < width {
        return Err(ForgeError::Insufficient { needed: width - col });
    }

    // compact the chosen candidates to the front of bits[]
    let mut k = 0;
    for i in 0..width {
        if x.get_bit(i) {
            bits.swap(i, k);
            k += 1;
        }
    }
    Ok(k)
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::crc::Crc;
    use crate::sparse::SparseCrc;
    use rand::Rng;

    fn apply_flips(msg: &mut [u8], flips: &[usize]) {
        for &b in flips {
            msg[b / 8] ^= 1 << (b % 8);
        }
    }

    /// forge against a real sparse engine and return the modified message
    fn forge_message(
        crc: &Crc,
        msg: &[u8],
        target: &Bigint,
        bits: &mut Vec<usize>,
    ) -> Result<Vec<u8>, ForgeError> {
        let base = crc.checksum(msg);
        let mut engine = SparseCrc::new(crc, 8 * msg.len()).unwrap();
        let k = forge(
            target,
            |pos| {
                let mut reg = base.clone();
                if let Some(p) = pos {
                    engine.flip(p, &mut reg);
                }
                reg
            },
            bits,
        )?;
        let mut out = msg.to_vec();
        apply_flips(&mut out, &bits[..k]);
        Ok(out)
    }

    #[test]
    fn forge_appended_window() {
        // "hello" plus four appended bytes, default CRC-32
        let crc = Crc::crc32();
        let mut msg = b"hello".to_vec();
        msg.extend_from_slice(&[0; 4]);
        let target = Bigint::from_hex(32, "deadbeef").unwrap();

        let mut bits: Vec<usize> = (40..72).collect();
        let out = forge_message(&crc, &msg, &target, &mut bits).unwrap();

        assert_eq!(crc.checksum(&out), target);
        assert_eq!(&out[..5], b"hello");
    }

    #[test]
    fn forge_prefix_window() {
        // only the first four bytes of a long message may change
        let crc = Crc::crc32();
        let msg = vec![0u8; 10000];
        let target = Bigint::from_hex(32, "12345678").unwrap();

        let mut bits: Vec<usize> = (0..32).collect();
        let out = forge_message(&crc, &msg, &target, &mut bits).unwrap();

        assert_eq!(crc.checksum(&out), target);
        assert!(out[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn forge_crc16_tail() {
        // "123" plus two appended bytes under CRC-16/CCITT-FALSE
        let crc = Crc::crc16_ccitt();
        let mut msg = b"123".to_vec();
        msg.extend_from_slice(&[0; 2]);
        let target = Bigint::from_hex(16, "abcd").unwrap();

        let mut bits: Vec<usize> = (24..40).collect();
        let out = forge_message(&crc, &msg, &target, &mut bits).unwrap();

        assert_eq!(out.len(), 5);
        assert_eq!(&out[..3], b"123");
        assert_eq!(crc.checksum(&out), target);
    }

    #[test]
    fn forge_scattered_bits() {
        let mut rng = rand::thread_rng();
        let crc = Crc::crc32();
        let msg: Vec<u8> = (0..64).map(|_| rng.gen()).collect();

        for _ in 0..4 {
            let target = Bigint::from_u64(32, rng.gen::<u32>() as u64);

            // twice as many scattered candidates as the width
            let mut bits: Vec<usize> = Vec::new();
            while bits.len() < 64 {
                let b = rng.gen_range(0..8 * msg.len());
                if !bits.contains(&b) {
                    bits.push(b);
                }
            }

            let before: Vec<usize> = {
                let mut v = bits.clone();
                v.sort_unstable();
                v
            };

            let out = forge_message(&crc, &msg, &target, &mut bits).unwrap();
            assert_eq!(crc.checksum(&out), target);

            // bits[] was permuted, never rewritten
            bits.sort_unstable();
            assert_eq!(bits, before);
        }
    }

    #[test]
    fn forge_reports_shortfall() {
        // 16 mutable bits cannot hit a 32-bit target
        let crc = Crc::crc32();
        let msg = b"hello".to_vec();
        let target = Bigint::from_hex(32, "deadbeef").unwrap();

        let mut bits: Vec<usize> = (24..40).collect();
        match forge_message(&crc, &msg, &target, &mut bits) {
            Err(ForgeError::Insufficient { needed }) => {
                assert!((15..=17).contains(&needed), "needed = {}", needed);
            }
            Ok(_) => panic!("forged with insufficient bits"),
        }
    }

    #[test]
    fn forge_nothing_to_do() {
        // the target is already the checksum: zero flips
        let crc = Crc::crc32();
        let msg = b"123456789".to_vec();
        let target = crc.checksum(&msg);

        let mut bits: Vec<usize> = (0..40).collect();
        let base = crc.checksum(&msg);
        let mut engine = SparseCrc::new(&crc, 8 * msg.len()).unwrap();
        let k = forge(
            &target,
            |pos| {
                let mut reg = base.clone();
                if let Some(p) = pos {
                    engine.flip(p, &mut reg);
                }
                reg
            },
            &mut bits,
        )
        .unwrap();
        assert_eq!(k, 0);
    }

    #[test]
    fn forge_twice_is_stable() {
        // forging the forged message onto its own checksum changes nothing
        let crc = Crc::crc32();
        let mut msg = b"stable".to_vec();
        msg.extend_from_slice(&[0; 4]);
        let target = Bigint::from_hex(32, "0badf00d").unwrap();

        let mut bits: Vec<usize> = (48..80).collect();
        let out = forge_message(&crc, &msg, &target, &mut bits).unwrap();
        let again = crc.checksum(&out);

        let mut bits2: Vec<usize> = (48..80).collect();
        let base = crc.checksum(&out);
        let mut engine = SparseCrc::new(&crc, 8 * out.len()).unwrap();
        let k = forge(
            &again,
            |pos| {
                let mut reg = base.clone();
                if let Some(p) = pos {
                    engine.flip(p, &mut reg);
                }
                reg
            },
            &mut bits2,
        )
        .unwrap();
        assert_eq!(k, 0);
    }
}
