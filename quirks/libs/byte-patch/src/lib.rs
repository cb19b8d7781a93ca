// SPDX-License-Identifier: MPL-2.0

//! Masked byte-pattern search and replace.
//!
//! A pattern is a fixed-length byte sequence with an optional mask of the same
//! length. A mask bit of 1 means the corresponding data bit must match; a mask
//! bit of 0 means "don't care". The same mask convention applies to the
//! replacement side, where a masked replacement only changes the selected bits:
//!
//! ```text
//! new = (old & !replace_mask) | (replace & replace_mask)
//! ```
//!
//! All scans operate on slices, so the valid range of a search is the slice
//! itself. Narrow it by slicing before calling in.
//!
//! # Example
//!
//! ```
//! use byte_patch::Substitution;
//!
//! let mut code = [0x90, 0xB9, 0xE2, 0x00, 0x00, 0x00, 0x0F, 0x30, 0xC3];
//! let nop_wrmsr = Substitution::new(
//!     &[0xB9, 0xE2, 0x00, 0x00, 0x00, 0x0F, 0x30],
//!     &[0xB9, 0xE2, 0x00, 0x00, 0x00, 0x90, 0x90],
//! )
//! .unwrap();
//!
//! assert_eq!(nop_wrmsr.apply(&mut code, 0, 0), 1);
//! assert_eq!(code, [0x90, 0xB9, 0xE2, 0x00, 0x00, 0x00, 0x90, 0x90, 0xC3]);
//! ```

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_code)]

use core::fmt;

/// The error returned when a mask or a replacement does not have the length
/// of the pattern it belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct LengthMismatch {
    pub expected: usize,
    pub found: usize,
}

impl fmt::Display for LengthMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected {} bytes, found {} bytes",
            self.expected, self.found
        )
    }
}

fn check_len(expected: usize, found: usize) -> Result<(), LengthMismatch> {
    if expected == found {
        Ok(())
    } else {
        Err(LengthMismatch { expected, found })
    }
}

/// Returns the lowest offset at or after `offset` where `pattern` matches
/// `data` under `mask`.
///
/// Returns `None` if the pattern or the data is empty, if `offset` is not
/// inside `data`, if the mask length differs from the pattern length, or if
/// no match exists. A match may end exactly at the end of `data`.
pub fn find_pattern(
    pattern: &[u8],
    mask: Option<&[u8]>,
    data: &[u8],
    offset: usize,
) -> Option<usize> {
    if pattern.is_empty() || data.is_empty() || offset >= data.len() {
        return None;
    }
    if mask.is_some_and(|mask| mask.len() != pattern.len()) {
        return None;
    }

    let window = &data[offset..];
    if window.len() < pattern.len() {
        return None;
    }

    window
        .windows(pattern.len())
        .position(|candidate| matches_at(candidate, pattern, mask))
        .map(|pos| offset + pos)
}

fn matches_at(candidate: &[u8], pattern: &[u8], mask: Option<&[u8]>) -> bool {
    match mask {
        None => candidate == pattern,
        Some(mask) => candidate
            .iter()
            .zip(pattern)
            .zip(mask)
            .all(|((data, pattern), mask)| data & mask == pattern & mask),
    }
}

/// Overwrites `dst` with `replace`, merging through `mask` when one is given.
pub fn overwrite(
    dst: &mut [u8],
    replace: &[u8],
    mask: Option<&[u8]>,
) -> Result<(), LengthMismatch> {
    check_len(dst.len(), replace.len())?;
    match mask {
        None => dst.copy_from_slice(replace),
        Some(mask) => {
            check_len(dst.len(), mask.len())?;
            for ((old, new), mask) in dst.iter_mut().zip(replace).zip(mask) {
                *old = (*old & !mask) | (new & mask);
            }
        }
    }
    Ok(())
}

/// A find/replace pair with optional masks on both sides.
///
/// All four byte sequences are guaranteed to have the same length.
#[derive(Clone, Copy, Debug)]
pub struct Substitution<'a> {
    find: &'a [u8],
    find_mask: Option<&'a [u8]>,
    replace: &'a [u8],
    replace_mask: Option<&'a [u8]>,
}

impl<'a> Substitution<'a> {
    /// Creates an exact-match substitution.
    pub fn new(find: &'a [u8], replace: &'a [u8]) -> Result<Self, LengthMismatch> {
        check_len(find.len(), replace.len())?;
        Ok(Self {
            find,
            find_mask: None,
            replace,
            replace_mask: None,
        })
    }

    /// Restricts matching to the bits set in `mask`.
    pub fn with_find_mask(mut self, mask: &'a [u8]) -> Result<Self, LengthMismatch> {
        check_len(self.find.len(), mask.len())?;
        self.find_mask = Some(mask);
        Ok(self)
    }

    /// Restricts writing to the bits set in `mask`.
    pub fn with_replace_mask(mut self, mask: &'a [u8]) -> Result<Self, LengthMismatch> {
        check_len(self.find.len(), mask.len())?;
        self.replace_mask = Some(mask);
        Ok(self)
    }

    /// Returns the length of the pattern, which is also the replacement length.
    pub fn len(&self) -> usize {
        self.find.len()
    }

    pub fn is_empty(&self) -> bool {
        self.find.is_empty()
    }

    /// Finds the next match at or after `offset`.
    pub fn find(&self, data: &[u8], offset: usize) -> Option<usize> {
        find_pattern(self.find, self.find_mask, data, offset)
    }

    /// Replaces matches in `data` in ascending offset order.
    ///
    /// The first `skip` matches are left untouched. At most `count`
    /// replacements are made, where a `count` of zero means no limit. Matches
    /// never overlap: the search resumes after the end of each match, skipped
    /// or not.
    ///
    /// Returns the number of replacements made.
    pub fn apply(&self, data: &mut [u8], count: usize, mut skip: usize) -> usize {
        let len = self.len();
        let mut cursor = 0;
        let mut replaced = 0;

        while let Some(at) = self.find(data, cursor) {
            let window = at..at + len;
            cursor = window.end;

            if skip > 0 {
                skip -= 1;
                continue;
            }

            self.trace(&data[window.clone()], at);
            // The lengths were checked on construction.
            let _ = overwrite(&mut data[window], self.replace, self.replace_mask);
            replaced += 1;

            if count > 0 && replaced == count {
                break;
            }
        }

        replaced
    }

    fn trace(&self, original: &[u8], at: usize) {
        log::trace!(
            "{}",
            TraceLine {
                substitution: self,
                original,
                at,
            }
        );
    }
}

/// Formats a byte slice as contiguous upper-case hex pairs.
pub struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

// `Replace <find>[/<mask>(<original>)] by <replace>[/<mask>(<result>)] at ofs:<hex>`,
// rendered from the bytes before the write.
struct TraceLine<'a> {
    substitution: &'a Substitution<'a>,
    original: &'a [u8],
    at: usize,
}

impl fmt::Display for TraceLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sub = self.substitution;

        write!(f, "Replace {}", Hex(sub.find))?;
        if let Some(mask) = sub.find_mask {
            write!(f, "/{}({})", Hex(mask), Hex(self.original))?;
        }
        write!(f, " by {}", Hex(sub.replace))?;
        if let Some(mask) = sub.replace_mask {
            write!(f, "/{}(", Hex(mask))?;
            for ((old, new), mask) in self.original.iter().zip(sub.replace).zip(mask) {
                write!(f, "{:02X}", (old & !mask) | (new & mask))?;
            }
            f.write_str(")")?;
        }
        write!(f, " at ofs:{:X}", self.at)
    }
}
