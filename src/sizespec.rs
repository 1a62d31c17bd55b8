//! Size descriptor parsing.
//!
//! A size descriptor is the untrusted string a request carries to ask for
//! a derivative, e.g. `"200w"`. Grammar: a positive integer optionally
//! suffixed by one of `s` (square crop), `w` (width-constrained) or `h`
//! (height-constrained). No suffix leaves the scaling mode to be resolved
//! from the original's orientation.
//!
//! The canonical string form doubles as the cache key in
//! [`ImageRecord::sizes`](crate::record::ImageRecord), so key equality is
//! string equality: `"100"` and `"100w"` are distinct keys even when they
//! would yield the same geometry.

use std::fmt;

use crate::error::{Error, Result};

/// Max image dimension, in pixels.
pub const MAX_DIMENSION: u32 = 20_000;

/// How to map target dimensions onto the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleMode {
    /// Scale to the exact width and height, distortion allowed.
    Exact,
    /// Fix the height, derive the width from the source proportions.
    Portrait,
    /// Fix the width, derive the height from the source proportions.
    Landscape,
    /// Pick the best mode from the source orientation.
    Auto,
    /// Cover the requested box, then center-crop to it exactly.
    Crop,
}

/// A validated scaling request, parsed from a descriptor string.
///
/// Ephemeral: not persisted directly; its canonical form is the key
/// recorded in the `sizes` mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeSpec {
    value: u32,
    mode: ScaleMode,
}

impl SizeSpec {
    /// Parse and validate an untrusted descriptor string.
    ///
    /// The input is trimmed first. The numeric prefix must round-trip
    /// exactly (so `"0100"` or `"1_0w"` are rejected) and must satisfy
    /// `0 < N <= MAX_DIMENSION`. No side effects.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let s = descriptor.trim();
        if s.is_empty() {
            return Err(Error::InvalidDescriptor(descriptor.to_string()));
        }

        let (digits, mode) = match s.as_bytes()[s.len() - 1] {
            b's' => (&s[..s.len() - 1], ScaleMode::Crop),
            b'w' => (&s[..s.len() - 1], ScaleMode::Landscape),
            b'h' => (&s[..s.len() - 1], ScaleMode::Portrait),
            _ => (s, ScaleMode::Auto),
        };

        let value: u32 = digits
            .parse()
            .map_err(|_| Error::InvalidDescriptor(descriptor.to_string()))?;
        if value == 0 || value > MAX_DIMENSION {
            return Err(Error::InvalidDescriptor(descriptor.to_string()));
        }

        let spec = Self { value, mode };

        // The cache key is the canonical reconstruction; anything that
        // does not round-trip (leading zeros, embedded signs) is rejected
        // rather than silently normalized.
        if spec.canonical() != s {
            return Err(Error::InvalidDescriptor(descriptor.to_string()));
        }

        Ok(spec)
    }

    /// Construct a square-crop spec directly, e.g. for an upscale-avoidance
    /// redirect to the intrinsic bound.
    pub fn square(value: u32) -> Self {
        Self {
            value,
            mode: ScaleMode::Crop,
        }
    }

    /// The numeric target, in pixels.
    pub fn value(&self) -> u32 {
        self.value
    }

    /// The requested scale mode.
    pub fn mode(&self) -> ScaleMode {
        self.mode
    }

    /// The canonical string form, `"<N><suffix?>"`. Used verbatim as the
    /// cache key.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// The (width, height) pair to hand the resize engine.
    ///
    /// `None` marks the unconstrained dimension for the width- and
    /// height-constrained modes.
    pub fn dimensions(&self) -> (Option<u32>, Option<u32>) {
        match self.mode {
            ScaleMode::Crop | ScaleMode::Auto | ScaleMode::Exact => {
                (Some(self.value), Some(self.value))
            }
            ScaleMode::Landscape => (Some(self.value), None),
            ScaleMode::Portrait => (None, Some(self.value)),
        }
    }
}

impl fmt::Display for SizeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = match self.mode {
            ScaleMode::Crop => "s",
            ScaleMode::Landscape => "w",
            ScaleMode::Portrait => "h",
            ScaleMode::Auto | ScaleMode::Exact => "",
        };
        write!(f, "{}{}", self.value, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_suffixes() {
        assert_eq!(SizeSpec::parse("100s").unwrap().mode(), ScaleMode::Crop);
        assert_eq!(
            SizeSpec::parse("100w").unwrap().mode(),
            ScaleMode::Landscape
        );
        assert_eq!(SizeSpec::parse("100h").unwrap().mode(), ScaleMode::Portrait);
        assert_eq!(SizeSpec::parse("100").unwrap().mode(), ScaleMode::Auto);
    }

    #[test]
    fn round_trips_canonical_form() {
        for d in ["1", "1s", "200w", "200h", "20000", "20000s"] {
            assert_eq!(SizeSpec::parse(d).unwrap().canonical(), d);
        }
    }

    #[test]
    fn trims_whitespace() {
        assert_eq!(SizeSpec::parse(" 200w ").unwrap().canonical(), "200w");
    }

    #[test]
    fn rejects_garbage() {
        for d in [
            "", " ", "s", "w", "abc", "-1", "-1s", "0", "0s", "0100", "10 0w",
            "100x", "20001", "20001s", "1.5w", "+100",
        ] {
            assert!(SizeSpec::parse(d).is_err(), "should reject {d:?}");
        }
    }

    #[test]
    fn dimensions_per_mode() {
        assert_eq!(
            SizeSpec::parse("50s").unwrap().dimensions(),
            (Some(50), Some(50))
        );
        assert_eq!(
            SizeSpec::parse("50w").unwrap().dimensions(),
            (Some(50), None)
        );
        assert_eq!(
            SizeSpec::parse("50h").unwrap().dimensions(),
            (None, Some(50))
        );
        assert_eq!(
            SizeSpec::parse("50").unwrap().dimensions(),
            (Some(50), Some(50))
        );
    }

    #[test]
    fn numeric_equivalence_is_not_key_equality() {
        let a = SizeSpec::parse("100").unwrap();
        let b = SizeSpec::parse("100w").unwrap();
        assert_ne!(a.canonical(), b.canonical());
    }
}
