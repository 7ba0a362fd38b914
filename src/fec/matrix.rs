use super::gf256;

/// Dense matrix over GF(2^8), row major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl Matrix {
    pub fn zero(rows: usize, cols: usize) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![0; rows * cols],
        }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zero(n, n);
        for i in 0..n {
            m.set(i, i, 1);
        }
        m
    }

    /// Systematic encoding matrix for `k` sources and `n` total symbols.
    ///
    /// The top `k` rows are the identity. Row `r >= k` is the Cauchy row
    /// `1 / (r ^ j)` for column `j`. Any `k` rows of the result are linearly
    /// independent, which is what makes every `k` symbols sufficient to decode.
    pub fn encoding(k: usize, n: usize) -> Self {
        debug_assert!(n <= 256 && k <= n);

        let mut m = Self::zero(n, k);
        for r in 0..n {
            for c in 0..k {
                let v = if r < k {
                    (r == c) as u8
                } else {
                    gf256::inv((r ^ c) as u8)
                };
                m.set(r, c, v);
            }
        }
        m
    }

    /// A single encoding row for `esi`, without building the whole matrix.
    pub fn encoding_row(k: usize, esi: usize) -> Vec<u8> {
        (0..k)
            .map(|c| {
                if esi < k {
                    (esi == c) as u8
                } else {
                    gf256::inv((esi ^ c) as u8)
                }
            })
            .collect()
    }

    pub fn from_rows(rows: Vec<Vec<u8>>) -> Self {
        let cols = rows.first().map(|r| r.len()).unwrap_or(0);
        let n = rows.len();
        let data: Vec<u8> = rows.into_iter().flatten().collect();
        debug_assert_eq!(data.len(), n * cols);
        Matrix {
            rows: n,
            cols,
            data,
        }
    }

    #[inline]
    pub fn get(&self, r: usize, c: usize) -> u8 {
        self.data[r * self.cols + c]
    }

    #[inline]
    pub fn set(&mut self, r: usize, c: usize, v: u8) {
        self.data[r * self.cols + c] = v;
    }

    pub fn row(&self, r: usize) -> &[u8] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for c in 0..self.cols {
            self.data.swap(a * self.cols + c, b * self.cols + c);
        }
    }

    /// Gauss-Jordan inversion. `None` if the matrix is singular.
    pub fn invert(&self) -> Option<Matrix> {
        if self.rows != self.cols {
            return None;
        }

        let n = self.rows;
        let mut work = self.clone();
        let mut inv = Matrix::identity(n);

        for col in 0..n {
            let pivot = (col..n).find(|r| work.get(*r, col) != 0)?;
            work.swap_rows(col, pivot);
            inv.swap_rows(col, pivot);

            let scale = gf256::inv(work.get(col, col));
            for c in 0..n {
                work.set(col, c, gf256::mul(work.get(col, c), scale));
                inv.set(col, c, gf256::mul(inv.get(col, c), scale));
            }

            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = work.get(r, col);
                if factor == 0 {
                    continue;
                }
                for c in 0..n {
                    let w = work.get(r, c) ^ gf256::mul(factor, work.get(col, c));
                    work.set(r, c, w);
                    let i = inv.get(r, c) ^ gf256::mul(factor, inv.get(col, c));
                    inv.set(r, c, i);
                }
            }
        }

        Some(inv)
    }

    /// Multiply this matrix with a column of equally sized symbols.
    pub fn mul_symbols(&self, symbols: &[&[u8]], symbol_size: usize) -> Vec<Vec<u8>> {
        debug_assert_eq!(symbols.len(), self.cols);

        (0..self.rows)
            .map(|r| {
                let mut out = vec![0_u8; symbol_size];
                for (c, s) in symbols.iter().enumerate() {
                    gf256::mul_add_slice(&mut out, s, self.get(r, c));
                }
                out
            })
            .collect()
    }
}
