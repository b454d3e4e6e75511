//! Move-to-front decoding, bzip2's second transform layer.

pub struct MoveToFront {
    symbols: Vec<u8>,
}

impl MoveToFront {
    /// Decoder over an explicit symbol alphabet.
    pub fn new(symbols: &[u8]) -> MoveToFront {
        MoveToFront {
            symbols: symbols.to_vec(),
        }
    }

    /// Decoder over the alphabet `0..n`, used for the selector list.
    pub fn with_range(n: usize) -> MoveToFront {
        MoveToFront {
            symbols: (0..n as u8).collect(),
        }
    }

    /// The symbol currently at the front, without moving anything.
    pub fn first(&self) -> u8 {
        self.symbols[0]
    }

    /// Fetch the symbol at position `n` and move it to the front.
    pub fn decode(&mut self, n: usize) -> u8 {
        let b = self.symbols.remove(n);
        self.symbols.insert(0, b);
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_to_front() {
        let mut mtf = MoveToFront::new(&[b'a', b'b', b'c', b'd']);
        assert_eq!(mtf.decode(2), b'c');
        assert_eq!(mtf.first(), b'c');
        assert_eq!(mtf.decode(1), b'a');
        assert_eq!(mtf.decode(0), b'a');
        assert_eq!(mtf.decode(3), b'd');
        assert_eq!(mtf.first(), b'd');
    }

    #[test]
    fn range_decoder() {
        let mut mtf = MoveToFront::with_range(6);
        assert_eq!(mtf.decode(5), 5);
        assert_eq!(mtf.decode(1), 0);
        assert_eq!(mtf.decode(0), 0);
    }
}
