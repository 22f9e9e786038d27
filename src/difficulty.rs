use super::*;

/// A forced share difficulty. The pool dialect expresses difficulty as a
/// 256-bit target a hash must fall below, serialized as little-endian hex, so
/// the only operation that matters here is the division back into a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Difficulty(u64);

impl Difficulty {
    pub fn target_hex(self) -> String {
        let target = U256::MAX / U256::from(self.0);
        hex::encode(target.to_little_endian())
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for Difficulty {
    fn from(difficulty: u64) -> Self {
        assert!(difficulty > 0, "difficulty must be > 0");
        Difficulty(difficulty)
    }
}

impl Display for Difficulty {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Difficulty {
    type Err = Error;

    fn from_str(difficulty: &str) -> Result<Self> {
        let difficulty = difficulty.trim().parse::<u64>()?;
        ensure!(difficulty > 0, "difficulty must be > 0");
        Ok(Difficulty(difficulty))
    }
}
