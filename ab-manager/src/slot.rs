use std::{borrow::Cow, fmt::Display, str::FromStr};

/// Label of one of the two system partitions.
#[derive(serde::Serialize, Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    A,
    B,
}

impl Slot {
    pub const ALL: [Slot; 2] = [Slot::A, Slot::B];

    /// Returns the slot opposite to the current one.
    ///
    /// # Examples
    ///
    /// ```
    /// use orb_ab_manager::Slot;
    ///
    /// assert_eq!(Slot::B, Slot::opposite(Slot::A));
    /// assert_eq!(Slot::A, Slot::opposite(Slot::B));
    /// ```
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    /// Lowercase name, as used in file names and bootloader entries.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Slot::A => "a",
            Slot::B => "b",
        }
    }
}

impl Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("failed to parse unknown string `{unknown}` as slot")]
pub struct SlotParseError {
    unknown: String,
}

impl SlotParseError {
    pub fn unknown<'a, T: Into<Cow<'a, str>>>(val: T) -> Self {
        Self {
            unknown: val.into().to_string(),
        }
    }
}

impl FromStr for Slot {
    type Err = SlotParseError;

    fn from_str(unknown: &str) -> Result<Self, Self::Err> {
        let slot = match unknown.to_lowercase().as_str() {
            // Slot A aliases.
            "a" | "0" => Slot::A,
            // Slot B aliases.
            "b" | "1" => Slot::B,
            _ => return Err(SlotParseError::unknown(unknown)),
        };
        Ok(slot)
    }
}

mod serde_imp {
    use std::str::FromStr;

    use serde::{Deserialize, Deserializer, de};

    use super::Slot;

    impl<'de> Deserialize<'de> for Slot {
        fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = String::deserialize(deserializer)?;
            FromStr::from_str(&s).map_err(de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Slot, SlotParseError};

    #[test]
    fn parsing_accepts_case_and_numeric_aliases() -> Result<(), SlotParseError> {
        assert_eq!(Slot::A, "a".parse()?);
        assert_eq!(Slot::A, "A".parse()?);
        assert_eq!(Slot::A, "0".parse()?);
        assert_eq!(Slot::B, "B".parse()?);
        assert_eq!(Slot::B, "1".parse()?);
        Ok(())
    }

    #[test]
    fn parsing_c_gives_error() {
        let parsed = "c".parse();
        let expected = Err::<Slot, _>(SlotParseError::unknown("c"));
        assert_eq!(expected, parsed);
    }

    #[test]
    fn slots_serialize_lowercase_and_accept_uppercase() {
        assert_eq!(serde_json::to_string(&Slot::B).unwrap(), r#""b""#);
        let slot: Slot = serde_json::from_str(r#""A""#).unwrap();
        assert_eq!(slot, Slot::A);
    }
}
