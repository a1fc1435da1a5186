//! `Range: bytes=…` parsing.

use std::fmt;

use thiserror::Error;

/// An inclusive, zero-based byte interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always `false`; a range covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// `Content-Range` value for a representation of `size` bytes.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Why a `Range` header cannot be honored. Either way the whole header is
/// rejected with `416 Range Not Satisfiable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("malformed Range header")]
    Malformed,

    #[error("range not satisfiable")]
    Unsatisfiable,
}

/// Sorted, non-overlapping byte ranges of one representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRangeSet {
    ranges: Vec<ByteRange>,
}

impl ByteRangeSet {
    /// Parses `header` against a representation of `size` bytes.
    ///
    /// Overlapping and adjacent ranges are merged.
    ///
    /// # Errors
    ///
    /// [`RangeError`] when any range is malformed or unsatisfiable.
    pub fn parse(header: &str, size: u64) -> Result<Self, RangeError> {
        let (unit, specs) = header.trim().split_once('=').ok_or(RangeError::Malformed)?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return Err(RangeError::Malformed);
        }

        let mut ranges = Vec::new();
        for spec in specs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            ranges.push(parse_spec(spec, size)?);
        }
        if ranges.is_empty() {
            return Err(RangeError::Malformed);
        }

        ranges.sort_unstable();
        let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        Ok(Self { ranges: merged })
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

fn parse_spec(spec: &str, size: u64) -> Result<ByteRange, RangeError> {
    let (first, last) = spec.split_once('-').ok_or(RangeError::Malformed)?;
    let (first, last) = (first.trim(), last.trim());
    let number = |s: &str| {
        if s.bytes().all(|b| b.is_ascii_digit()) {
            s.parse::<u64>().map_err(|_| RangeError::Malformed)
        } else {
            Err(RangeError::Malformed)
        }
    };

    if first.is_empty() {
        // Suffix range: the last N bytes.
        let n = number(last)?;
        if n == 0 || size == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return Ok(ByteRange {
            start: size.saturating_sub(n),
            end: size - 1,
        });
    }

    let start = number(first)?;
    let end = if last.is_empty() {
        None
    } else {
        Some(number(last)?)
    };
    if end.is_some_and(|end| end < start) || start >= size {
        return Err(RangeError::Unsatisfiable);
    }
    Ok(ByteRange {
        start,
        end: end.map_or(size - 1, |end| end.min(size - 1)),
    })
}
