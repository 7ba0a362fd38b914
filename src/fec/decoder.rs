use std::collections::BTreeMap;
use std::mem;

use super::matrix::Matrix;
use super::MAX_SYMBOLS;
use crate::Error;

/// Reed-Solomon decoder for one group of symbols.
///
/// Symbols are inserted in any order tagged with their ESI (encoding symbol
/// id). Once `k` distinct symbols are present the `k` sources can be taken
/// out, exactly once.
#[derive(Debug)]
pub struct FecDecoder {
    k: usize,
    symbol_size: usize,
    symbols: BTreeMap<usize, Vec<u8>>,
    recovered: bool,
}

impl FecDecoder {
    pub fn new(k: usize, symbol_size: usize) -> Result<Self, Error> {
        if k == 0 || k > MAX_SYMBOLS {
            return Err(Error::Malformed("FEC source symbol count out of range"));
        }
        if symbol_size == 0 {
            return Err(Error::Malformed("FEC symbol size is zero"));
        }

        Ok(FecDecoder {
            k,
            symbol_size,
            symbols: BTreeMap::new(),
            recovered: false,
        })
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn symbol_size(&self) -> usize {
        self.symbol_size
    }

    /// Number of distinct symbols received.
    pub fn received(&self) -> usize {
        self.symbols.len()
    }

    pub fn has_symbol(&self, esi: usize) -> bool {
        self.symbols.contains_key(&esi)
    }

    /// Whether the sources have been handed out.
    pub fn is_recovered(&self) -> bool {
        self.recovered
    }

    /// Add a symbol. Duplicates are ignored.
    pub fn insert(&mut self, esi: usize, symbol: &[u8]) -> Result<(), Error> {
        if esi >= MAX_SYMBOLS {
            return Err(Error::Malformed("FEC symbol id out of range"));
        }
        if symbol.len() != self.symbol_size {
            return Err(Error::Malformed("FEC symbol size mismatch"));
        }
        if self.recovered {
            return Ok(());
        }

        self.symbols.entry(esi).or_insert_with(|| symbol.to_vec());

        Ok(())
    }

    /// Take out the `k` source symbols.
    ///
    /// [`Error::NotYetDecodable`] until enough symbols have arrived, and again
    /// after the sources have been taken.
    pub fn decode(&mut self) -> Result<Vec<Vec<u8>>, Error> {
        if self.recovered || self.symbols.len() < self.k {
            return Err(Error::NotYetDecodable);
        }

        let k = self.k;

        // Sources are preferred since their rows are trivial.
        let mut chosen: Vec<usize> = self.symbols.keys().copied().filter(|e| *e < k).collect();
        chosen.extend(self.symbols.keys().copied().filter(|e| *e >= k));
        chosen.truncate(k);

        let sources = if chosen.iter().all(|e| *e < k) {
            // Nothing lost.
            let mut symbols = mem::take(&mut self.symbols);
            (0..k)
                .map(|e| symbols.remove(&e).unwrap_or_default())
                .collect()
        } else {
            let rows = chosen.iter().map(|e| Matrix::encoding_row(k, *e)).collect();
            let Some(inv) = Matrix::from_rows(rows).invert() else {
                return Err(Error::NotYetDecodable);
            };

            let symbols = mem::take(&mut self.symbols);
            let refs: Vec<&[u8]> = chosen
                .iter()
                .filter_map(|e| symbols.get(e).map(|s| s.as_slice()))
                .collect();

            inv.mul_symbols(&refs, self.symbol_size)
        };

        self.recovered = true;
        trace!("FEC decoded k: {} with ids {:?}", k, chosen);

        Ok(sources)
    }
}
