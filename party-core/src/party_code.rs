//! Party Code Generation and Parsing
//!
//! Party ids are short codes people can read out loud and type back in.

use std::fmt;

use rand::Rng;

/// Unambiguous uppercase characters (no 0/O, 1/I/L, 5/S, 2/Z)
const ALPHABET: &[u8] = b"346789ABCDEFGHJKMNPQRTUVWXY";

/// 27^8 combinations
const CODE_LENGTH: usize = 8;

/// A party code, stored normalized (no separator)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartyCode(String);

impl PartyCode {
    pub fn random() -> Self {
        Self::random_with(&mut rand::thread_rng())
    }

    pub fn random_with<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let code = (0..CODE_LENGTH)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        PartyCode(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Parse user input: case-insensitive, separators and spaces ignored
    pub fn parse(input: &str) -> Option<Self> {
        let normalized: String = input
            .chars()
            .filter(|c| c.is_alphanumeric())
            .map(|c| c.to_ascii_uppercase())
            .collect();

        if normalized.len() != CODE_LENGTH {
            return None;
        }

        if normalized.bytes().all(|b| ALPHABET.contains(&b)) {
            Some(PartyCode(normalized))
        } else {
            None
        }
    }
}

impl fmt::Display for PartyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", &self.0[..4], &self.0[4..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_party_code_parse() {
        let code = PartyCode::parse("abcd-efgh").unwrap();
        assert_eq!(code.as_str(), "ABCDEFGH");
        assert_eq!(code.to_string(), "ABCD-EFGH");

        assert!(PartyCode::parse("ABC").is_none());
        assert!(PartyCode::parse("ABCDEFGHJ").is_none());
        // 0 and O are excluded from the alphabet
        assert!(PartyCode::parse("ABCD-EFG0").is_none());
    }

    #[test]
    fn test_random_codes_parse_back() {
        let mut rng = StdRng::seed_from_u64(3);
        let a = PartyCode::random_with(&mut rng);
        let b = PartyCode::random_with(&mut rng);
        assert_ne!(a, b);
        assert_eq!(PartyCode::parse(&a.to_string()), Some(a));
    }
}
