// SPDX-License-Identifier: MPL-2.0

//! Access to a loaded kernel or kernel extension image.
//!
//! The patch engine never parses the container format itself. The boot loader
//! hands over the image bytes together with a way to resolve symbols, and all
//! patches address the image through byte offsets derived from those symbols.

use crate::{Error, Result};

/// The granularity of most bounded scans.
pub const PAGE_SIZE: usize = 4096;

/// A mutable view of one loaded image.
pub trait ImageContext {
    /// Returns the address the image is linked at.
    ///
    /// Symbol addresses are relative to this address.
    fn base_address(&self) -> u64;

    /// Returns the image contents.
    fn bytes(&self) -> &[u8];

    /// Returns the image contents for patching.
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Resolves a symbol to its address.
    fn resolve_symbol(&self, name: &str) -> Option<u64>;

    fn image_size(&self) -> usize {
        self.bytes().len()
    }

    /// Resolves a symbol to an offset inside the image.
    ///
    /// Fails with [`Error::NotFound`] if the symbol is unknown or points
    /// outside of the image.
    fn symbol_offset(&self, name: &str) -> Result<usize> {
        let Some(address) = self.resolve_symbol(name) else {
            log::debug!("Failed to locate symbol {}", name);
            return Err(Error::NotFound);
        };

        address
            .checked_sub(self.base_address())
            .and_then(|offset| usize::try_from(offset).ok())
            .filter(|offset| *offset < self.image_size())
            .ok_or_else(|| {
                log::debug!("Symbol {} at {:#x} is outside of the image", name, address);
                Error::NotFound
            })
    }
}

/// An image backed by a mutable byte slice and a static symbol table.
///
/// The symbol table must be sorted by name so that lookups can use a binary
/// search.
pub struct MappedImage<'a> {
    base_address: u64,
    bytes: &'a mut [u8],
    symbols: &'a [(&'a str, u64)],
}

impl<'a> MappedImage<'a> {
    /// Creates an image view.
    ///
    /// Fails with [`Error::InvalidParameter`] if `symbols` is not strictly
    /// sorted by name.
    pub fn new(
        base_address: u64,
        bytes: &'a mut [u8],
        symbols: &'a [(&'a str, u64)],
    ) -> Result<Self> {
        if !symbols.windows(2).all(|pair| pair[0].0 < pair[1].0) {
            return Err(Error::InvalidParameter);
        }
        Ok(Self {
            base_address,
            bytes,
            symbols,
        })
    }

    /// Creates an image view without symbols.
    pub fn without_symbols(base_address: u64, bytes: &'a mut [u8]) -> Self {
        Self {
            base_address,
            bytes,
            symbols: &[],
        }
    }
}

impl ImageContext for MappedImage<'_> {
    fn base_address(&self) -> u64 {
        self.base_address
    }

    fn bytes(&self) -> &[u8] {
        &*self.bytes
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.bytes
    }

    fn resolve_symbol(&self, name: &str) -> Option<u64> {
        self.symbols
            .binary_search_by(|(symbol, _)| (*symbol).cmp(name))
            .ok()
            .map(|index| self.symbols[index].1)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const BASE: u64 = 0xFFFF_FF80_0020_0000;

    #[test]
    fn resolve_sorted_symbols() {
        let mut bytes = [0u8; 64];
        let symbols = [("_a", BASE + 8), ("_b", BASE + 16), ("_c", BASE + 128)];
        let image = MappedImage::new(BASE, &mut bytes, &symbols).unwrap();

        assert_eq!(image.resolve_symbol("_b"), Some(BASE + 16));
        assert_eq!(image.resolve_symbol("_d"), None);
        assert_eq!(image.symbol_offset("_a"), Ok(8));
        assert_eq!(image.symbol_offset("_c"), Err(Error::NotFound));
        assert_eq!(image.symbol_offset("_d"), Err(Error::NotFound));
    }

    #[test]
    fn symbol_below_base() {
        let mut bytes = [0u8; 16];
        let symbols = [("_low", BASE - 1)];
        let image = MappedImage::new(BASE, &mut bytes, &symbols).unwrap();
        assert_eq!(image.symbol_offset("_low"), Err(Error::NotFound));
    }

    #[test]
    fn unsorted_symbols_are_rejected() {
        let mut bytes = [0u8; 16];
        let symbols = [("_b", BASE), ("_a", BASE)];
        assert!(matches!(
            MappedImage::new(BASE, &mut bytes, &symbols),
            Err(Error::InvalidParameter)
        ));
    }
}
