//! Tri-state test verdicts and perceptual-hash comparison.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome of any oracle call.
///
/// `Indeterminate` covers crashes, hangs killed by the watchdog and unstable
/// page state. It is never interchangeable with `NoBug`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Bug,
    NoBug,
    Indeterminate,
}

impl Verdict {
    #[must_use]
    pub const fn is_bug(self) -> bool {
        matches!(self, Self::Bug)
    }

    #[must_use]
    pub const fn from_bool(bug: bool) -> Self {
        if bug { Self::Bug } else { Self::NoBug }
    }

    /// Fold repeated trials: unanimous trials keep their verdict, anything
    /// else (disagreement, an indeterminate trial, no trials) is indeterminate.
    pub fn unanimous(trials: impl IntoIterator<Item = Self>) -> Self {
        let mut agreed: Option<Self> = None;
        for trial in trials {
            match (agreed, trial) {
                (_, Self::Indeterminate) => return Self::Indeterminate,
                (None, v) => agreed = Some(v),
                (Some(prev), v) if prev == v => {}
                (Some(_), _) => return Self::Indeterminate,
            }
        }
        agreed.unwrap_or(Self::Indeterminate)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bug => "bug",
            Self::NoBug => "no-bug",
            Self::Indeterminate => "indeterminate",
        })
    }
}

const HASH_WORDS: usize = 9;

/// 576-bit perceptual hash (a 24x24 DCT hash).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PerceptualHash([u64; HASH_WORDS]);

impl PerceptualHash {
    pub const BITS: usize = HASH_WORDS * 64;
    const HEX_LEN: usize = Self::BITS / 4;

    #[must_use]
    pub const fn from_words(words: [u64; HASH_WORDS]) -> Self {
        Self(words)
    }

    /// Parse the hex rendering produced by the screenshot hasher.
    #[must_use]
    pub fn from_hex(hex: &str) -> Option<Self> {
        let hex = hex.trim();
        if hex.len() != Self::HEX_LEN || !hex.is_ascii() {
            return None;
        }
        let mut words = [0_u64; HASH_WORDS];
        for (word, chunk) in words.iter_mut().zip(hex.as_bytes().chunks(16)) {
            let chunk = std::str::from_utf8(chunk).ok()?;
            *word = u64::from_str_radix(chunk, 16).ok()?;
        }
        Some(Self(words))
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|w| format!("{w:016x}")).collect()
    }

    /// Number of differing bits.
    #[must_use]
    pub fn hamming_distance(&self, other: &Self) -> u32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum()
    }

    /// Any differing bit counts as a visual difference.
    #[must_use]
    pub fn differs_from(&self, other: &Self) -> bool {
        self.hamming_distance(other) > 0
    }
}

/// A screenshot's hash together with the captured image size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderHash {
    pub hash: PerceptualHash,
    pub width: u32,
    pub height: u32,
}

/// Decide a metamorphic differential from its two renders.
///
/// A missing render or a page whose focus/scroll/animation state changed
/// across the reload cannot be judged.
#[must_use]
pub fn differential_verdict(
    live: Option<&RenderHash>,
    reloaded: Option<&RenderHash>,
    states_match: bool,
) -> Verdict {
    let (Some(live), Some(reloaded)) = (live, reloaded) else {
        return Verdict::Indeterminate;
    };
    if !states_match {
        return Verdict::Indeterminate;
    }
    let resized = (live.width, live.height) != (reloaded.width, reloaded.height);
    Verdict::from_bool(resized || live.hash.differs_from(&reloaded.hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(word: u64) -> RenderHash {
        let mut words = [0_u64; 9];
        words[8] = word;
        RenderHash {
            hash: PerceptualHash::from_words(words),
            width: 800,
            height: 600,
        }
    }

    #[test]
    fn unanimous_requires_agreement() {
        assert_eq!(Verdict::unanimous([Verdict::Bug; 4]), Verdict::Bug);
        assert_eq!(Verdict::unanimous([Verdict::NoBug; 2]), Verdict::NoBug);
        assert_eq!(
            Verdict::unanimous([Verdict::Bug, Verdict::NoBug]),
            Verdict::Indeterminate
        );
        assert_eq!(
            Verdict::unanimous([Verdict::Bug, Verdict::Indeterminate, Verdict::Bug]),
            Verdict::Indeterminate
        );
        assert_eq!(Verdict::unanimous(std::iter::empty()), Verdict::Indeterminate);
    }

    #[test]
    fn hex_round_trips_and_rejects_bad_length() {
        let hash = render(0xdead_beef).hash;
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 144);
        assert_eq!(PerceptualHash::from_hex(&hex), Some(hash));
        assert_eq!(PerceptualHash::from_hex("abc"), None);
        assert_eq!(PerceptualHash::from_hex(&"z".repeat(144)), None);
    }

    #[test]
    fn hamming_counts_bits() {
        let a = render(0b1011).hash;
        let b = render(0b0001).hash;
        assert_eq!(a.hamming_distance(&b), 2);
        assert!(a.differs_from(&b));
        assert!(!a.differs_from(&a));
    }

    #[test]
    fn differential_verdict_handles_every_case() {
        let same = render(1);
        let other = render(3);
        assert_eq!(
            differential_verdict(Some(&same), Some(&same), true),
            Verdict::NoBug
        );
        assert_eq!(
            differential_verdict(Some(&same), Some(&other), true),
            Verdict::Bug
        );
        assert_eq!(
            differential_verdict(Some(&same), Some(&other), false),
            Verdict::Indeterminate
        );
        assert_eq!(differential_verdict(None, Some(&same), true), Verdict::Indeterminate);

        let mut resized = same;
        resized.height = 601;
        assert_eq!(
            differential_verdict(Some(&same), Some(&resized), true),
            Verdict::Bug
        );
    }
}
