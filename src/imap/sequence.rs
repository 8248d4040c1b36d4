//! Message sequence sets.
//!
//! `sequence-set = (seq-number / seq-range) *("," (seq-number / seq-range))`
//!
//! `*` stands for the largest number in use; in a range it may appear on
//! either side (`4:*` and `*:4` are equivalent).

use std::fmt::{Display, Formatter};
use std::num::NonZeroU32;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeqOrUid {
    Value(NonZeroU32),
    /// `*` — the largest number in use.
    Asterisk,
}

impl SeqOrUid {
    fn resolve(&self, largest: u32) -> u32 {
        match self {
            SeqOrUid::Value(value) => value.get(),
            SeqOrUid::Asterisk => largest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sequence {
    Single(SeqOrUid),
    Range(SeqOrUid, SeqOrUid),
}

/// A non-empty set of sequences.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequenceSet(pub Vec<Sequence>);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed sequence set")]
pub struct SequenceSetError;

impl SequenceSet {
    /// All numbers the set denotes, bounded by `largest`, ascending and
    /// deduplicated.
    pub fn expand(&self, largest: u32) -> Vec<u32> {
        let mut numbers: Vec<u32> = Vec::new();

        for sequence in &self.0 {
            match sequence {
                Sequence::Single(value) => {
                    let n = value.resolve(largest);
                    if (1..=largest).contains(&n) {
                        numbers.push(n);
                    }
                }
                Sequence::Range(from, to) => {
                    let a = from.resolve(largest);
                    let b = to.resolve(largest);
                    let (low, high) = (a.min(b), a.max(b).min(largest));
                    for n in low..=high {
                        if n >= 1 {
                            numbers.push(n);
                        }
                    }
                }
            }
        }

        numbers.sort_unstable();
        numbers.dedup();
        numbers
    }

    /// Whether `value` is denoted by the set.
    pub fn contains(&self, value: u32, largest: u32) -> bool {
        self.0.iter().any(|sequence| match sequence {
            Sequence::Single(single) => single.resolve(largest) == value,
            Sequence::Range(from, to) => {
                let a = from.resolve(largest);
                let b = to.resolve(largest);
                (a.min(b)..=a.max(b)).contains(&value)
            }
        })
    }
}

impl FromStr for SequenceSet {
    type Err = SequenceSetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut sequences = Vec::new();

        for part in value.split(',') {
            sequences.push(part.parse()?);
        }

        if sequences.is_empty() {
            return Err(SequenceSetError);
        }

        Ok(SequenceSet(sequences))
    }
}

impl FromStr for Sequence {
    type Err = SequenceSetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.split_once(':') {
            Some((from, to)) => Ok(Sequence::Range(from.parse()?, to.parse()?)),
            None => Ok(Sequence::Single(value.parse()?)),
        }
    }
}

impl FromStr for SeqOrUid {
    type Err = SequenceSetError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "*" {
            Ok(SeqOrUid::Asterisk)
        } else {
            value
                .parse::<NonZeroU32>()
                .map(SeqOrUid::Value)
                .map_err(|_| SequenceSetError)
        }
    }
}

impl Display for SeqOrUid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            SeqOrUid::Value(value) => write!(f, "{value}"),
            SeqOrUid::Asterisk => f.write_str("*"),
        }
    }
}

impl Display for Sequence {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Sequence::Single(value) => write!(f, "{value}"),
            Sequence::Range(from, to) => write!(f, "{from}:{to}"),
        }
    }
}

impl Display for SequenceSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, sequence) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{sequence}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_expand() {
        let set: SequenceSet = "1,3:5,9".parse().unwrap();
        assert_eq!(set.expand(10), vec![1, 3, 4, 5, 9]);
    }

    #[test]
    fn test_asterisk_resolves_to_largest() {
        let set: SequenceSet = "4:*".parse().unwrap();
        assert_eq!(set.expand(6), vec![4, 5, 6]);

        let set: SequenceSet = "*".parse().unwrap();
        assert_eq!(set.expand(3), vec![3]);
    }

    #[test]
    fn test_reversed_range_is_normalised() {
        let set: SequenceSet = "5:2".parse().unwrap();
        assert_eq!(set.expand(10), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_out_of_mailbox_numbers_are_dropped() {
        let set: SequenceSet = "8,2".parse().unwrap();
        assert_eq!(set.expand(3), vec![2]);
    }

    #[test]
    fn test_contains() {
        let set: SequenceSet = "1,3:5".parse().unwrap();
        assert!(set.contains(1, 10));
        assert!(set.contains(4, 10));
        assert!(!set.contains(2, 10));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!("".parse::<SequenceSet>().is_err());
        assert!("0".parse::<SequenceSet>().is_err());
        assert!("1,,2".parse::<SequenceSet>().is_err());
        assert!("a:b".parse::<SequenceSet>().is_err());
    }
}
