//! Arithmetic in GF(2^8) with the primitive polynomial x^8 + x^4 + x^3 + x^2 + 1.

use once_cell::sync::Lazy;

const POLYNOMIAL: u16 = 0x11D;

struct Tables {
    // Doubled so that exp[log a + log b] never needs a modulo.
    exp: [u8; 512],
    log: [u8; 256],
}

static TABLES: Lazy<Tables> = Lazy::new(|| {
    let mut exp = [0_u8; 512];
    let mut log = [0_u8; 256];

    let mut x: u16 = 1;
    for i in 0..255 {
        exp[i] = x as u8;
        log[x as usize] = i as u8;
        x <<= 1;
        if x & 0x100 > 0 {
            x ^= POLYNOMIAL;
        }
    }
    for i in 255..512 {
        exp[i] = exp[i - 255];
    }

    Tables { exp, log }
});

#[inline]
pub fn mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[t.log[a as usize] as usize + t.log[b as usize] as usize]
}

/// Multiplicative inverse. The inverse of 0 is taken to be 0.
#[inline]
pub fn inv(a: u8) -> u8 {
    if a == 0 {
        return 0;
    }
    let t = &*TABLES;
    t.exp[255 - t.log[a as usize] as usize]
}

#[inline]
pub fn div(a: u8, b: u8) -> u8 {
    mul(a, inv(b))
}

/// `dst += c * src` over the whole slice.
pub fn mul_add_slice(dst: &mut [u8], src: &[u8], c: u8) {
    if c == 0 {
        return;
    }

    let t = &*TABLES;
    let log_c = t.log[c as usize] as usize;

    for (d, s) in dst.iter_mut().zip(src) {
        if *s != 0 {
            *d ^= t.exp[log_c + t.log[*s as usize] as usize];
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn every_element_has_an_inverse() {
        for a in 1..=255_u8 {
            assert_eq!(mul(a, inv(a)), 1, "a = {a}");
        }
    }

    #[test]
    fn known_products() {
        assert_eq!(mul(2, 0x80), 0x1D);
        assert_eq!(mul(3, 7), 9);
        assert_eq!(mul(0, 77), 0);
        assert_eq!(div(mul(13, 201), 201), 13);
    }

    #[test]
    fn multiplication_distributes() {
        for a in [1_u8, 2, 53, 255] {
            for b in [0_u8, 7, 128] {
                for c in [3_u8, 99, 254] {
                    assert_eq!(mul(a, b ^ c), mul(a, b) ^ mul(a, c));
                }
            }
        }
    }

    #[test]
    fn slice_mul_add() {
        let mut dst = vec![1, 2, 3];
        mul_add_slice(&mut dst, &[4, 0, 6], 5);
        assert_eq!(dst, vec![1 ^ mul(4, 5), 2, 3 ^ mul(6, 5)]);
    }
}
