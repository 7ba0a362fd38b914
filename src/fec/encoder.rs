use super::matrix::Matrix;
use super::MAX_SYMBOLS;
use crate::Error;

/// Reed-Solomon encoder producing systematic symbols.
///
/// The first `k` symbols out are the sources themselves, followed by `n - k`
/// repair symbols.
#[derive(Debug, Clone)]
pub struct FecEncoder {
    code_rate: f64,
    max_symbol_size: usize,
}

/// Total number of symbols for `k` sources at `code_rate`.
pub fn total_symbols(k: usize, code_rate: f64) -> usize {
    // The epsilon keeps exact ratios such as 4 / 0.5 from flooring to 7.
    (k as f64 / code_rate + 1e-9).floor() as usize
}

impl FecEncoder {
    /// Create an encoder. `code_rate` is `k / n` in `(0, 1]`.
    pub fn new(code_rate: f64, max_symbol_size: usize) -> Result<Self, Error> {
        if !(code_rate > 0.0 && code_rate <= 1.0) {
            return Err(Error::Malformed("FEC code rate outside (0, 1]"));
        }
        if max_symbol_size == 0 {
            return Err(Error::Malformed("FEC symbol size is zero"));
        }

        Ok(FecEncoder {
            code_rate,
            max_symbol_size,
        })
    }

    pub fn code_rate(&self) -> f64 {
        self.code_rate
    }

    pub fn max_symbol_size(&self) -> usize {
        self.max_symbol_size
    }

    /// Split `data` into `max_symbol_size` source symbols and encode them.
    ///
    /// The last source symbol is zero padded.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        if data.is_empty() {
            return Err(Error::Malformed("No data to FEC encode"));
        }

        let sources: Vec<Vec<u8>> = data
            .chunks(self.max_symbol_size)
            .map(|c| {
                let mut s = c.to_vec();
                s.resize(self.max_symbol_size, 0);
                s
            })
            .collect();

        self.encode_symbols(sources)
    }

    /// Encode equally sized source symbols into `n` symbols, sources first.
    pub fn encode_symbols(&self, sources: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>, Error> {
        let k = sources.len();
        if k == 0 {
            return Err(Error::Malformed("No source symbols to FEC encode"));
        }

        let symbol_size = sources[0].len();
        if symbol_size > self.max_symbol_size {
            return Err(Error::CapacityExceeded("FEC symbol larger than max symbol size"));
        }
        if sources.iter().any(|s| s.len() != symbol_size) {
            return Err(Error::Malformed("FEC source symbols differ in size"));
        }

        let n = total_symbols(k, self.code_rate);
        if n > MAX_SYMBOLS {
            return Err(Error::CapacityExceeded("Too many FEC symbols for GF(2^8)"));
        }

        let repair = if n > k {
            let enc = Matrix::encoding(k, n);
            let rows = Matrix::from_rows((k..n).map(|r| enc.row(r).to_vec()).collect());
            let refs: Vec<&[u8]> = sources.iter().map(|s| s.as_slice()).collect();
            rows.mul_symbols(&refs, symbol_size)
        } else {
            vec![]
        };

        trace!("FEC encoded k: {} n: {} size: {}", k, n, symbol_size);

        let mut out = sources;
        out.extend(repair);
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn symbol_counts() {
        assert_eq!(total_symbols(4, 0.5), 8);
        assert_eq!(total_symbols(3, 0.8), 3);
        assert_eq!(total_symbols(10, 0.8), 12);
        assert_eq!(total_symbols(1, 1.0), 1);
    }

    #[test]
    fn systematic_output() {
        let enc = FecEncoder::new(0.5, 4).unwrap();
        let symbols = enc.encode(&[1, 2, 3, 4, 5, 6]).unwrap();

        assert_eq!(symbols.len(), 4);
        assert_eq!(symbols[0], vec![1, 2, 3, 4]);
        assert_eq!(symbols[1], vec![5, 6, 0, 0]);
        assert!(symbols.iter().all(|s| s.len() == 4));
    }

    #[test]
    fn invalid_parameters() {
        assert!(FecEncoder::new(0.0, 100).is_err());
        assert!(FecEncoder::new(1.5, 100).is_err());
        assert!(FecEncoder::new(0.5, 0).is_err());

        let enc = FecEncoder::new(0.5, 100).unwrap();
        assert!(matches!(enc.encode(&[]), Err(Error::Malformed(_))));
    }

    #[test]
    fn too_many_symbols() {
        let enc = FecEncoder::new(0.5, 1).unwrap();
        assert!(matches!(
            enc.encode(&[0; 200]),
            Err(Error::CapacityExceeded(_))
        ));
    }
}
