// SPDX-License-Identifier: MPL-2.0

//! Declarative find/replace patches.

use byte_patch::{Substitution, overwrite};

use crate::{Error, ImageContext, Result};

/// A constant patch descriptor.
///
/// Descriptors are built in `const` context from [`GenericPatch::EMPTY`]:
///
/// ```
/// use kernel_quirks::generic::GenericPatch;
///
/// const RET: GenericPatch = GenericPatch {
///     comment: "Ret",
///     base: Some("_panic_hook"),
///     replace: &[0xC3],
///     ..GenericPatch::EMPTY
/// };
/// ```
#[derive(Clone, Copy, Debug)]
pub struct GenericPatch {
    /// A short name used in diagnostics.
    pub comment: &'static str,
    /// The symbol the patch starts at. `None` patches the whole image.
    pub base: Option<&'static str>,
    /// The bytes to look for. `None` writes `replace` right at `base`.
    pub find: Option<&'static [u8]>,
    pub mask: Option<&'static [u8]>,
    pub replace: &'static [u8],
    pub replace_mask: Option<&'static [u8]>,
    /// The number of replacements expected. Zero means any positive number.
    pub count: usize,
    /// The number of matches to leave untouched before replacing.
    pub skip: usize,
    /// The length of the searched window from the start. Zero means unbounded.
    pub limit: usize,
}

impl GenericPatch {
    pub const EMPTY: Self = Self {
        comment: "",
        base: None,
        find: None,
        mask: None,
        replace: &[],
        replace_mask: None,
        count: 0,
        skip: 0,
        limit: 0,
    };

    /// Applies the patch to `image`.
    ///
    /// Returns the number of replacements made. The patch fails with
    /// [`Error::NotFound`] if nothing was replaced or if `count` is set and a
    /// different number of replacements was made.
    pub fn apply(&self, image: &mut dyn ImageContext) -> Result<usize> {
        let result = self.apply_inner(image);
        match result {
            Ok(replaced) => log::debug!("Patch {} replaced {} times", self.comment, replaced),
            Err(err) => log::debug!("Patch {} failed - {}", self.comment, err),
        }
        result
    }

    fn apply_inner(&self, image: &mut dyn ImageContext) -> Result<usize> {
        let start = match self.base {
            Some(symbol) => image.symbol_offset(symbol)?,
            None => 0,
        };
        let region = &mut image.bytes_mut()[start..];

        let Some(find) = self.find else {
            // A direct write needs an anchor.
            if self.base.is_none() {
                return Err(Error::InvalidParameter);
            }
            let dst = region
                .get_mut(..self.replace.len())
                .ok_or(Error::NotFound)?;
            overwrite(dst, self.replace, self.replace_mask)?;
            return Ok(1);
        };

        let mut substitution = Substitution::new(find, self.replace)?;
        if let Some(mask) = self.mask {
            substitution = substitution.with_find_mask(mask)?;
        }
        if let Some(mask) = self.replace_mask {
            substitution = substitution.with_replace_mask(mask)?;
        }

        let size = if self.limit > 0 && self.limit < region.len() {
            self.limit
        } else {
            region.len()
        };
        let replaced = substitution.apply(&mut region[..size], self.count, self.skip);

        if replaced > 0 && (self.count == 0 || replaced == self.count) {
            Ok(replaced)
        } else {
            Err(Error::NotFound)
        }
    }
}
