// SPDX-License-Identifier: MPL-2.0

//! A minimal x86-64 assembler for relocated patch code.
//!
//! Code is assembled into a fixed buffer tagged with the image offset it is
//! destined for, so that relative jumps can be encoded before anything is
//! written. Nothing touches the image until [`commit`] is called, and
//! [`commit`] checks every destination before writing the first byte.

use core::fmt;

use crate::{Error, Result};

/// The largest code sequence a single [`Assembler`] can hold.
pub const MAX_CODE_SIZE: usize = 192;

pub const NOP: u8 = 0x90;

/// Encodes a x86-64 general purpose register index.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Register {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
}

/// Code assembled for a fixed position in an image.
pub struct Assembler {
    origin: usize,
    buf: [u8; MAX_CODE_SIZE],
    len: usize,
}

impl Assembler {
    /// Creates an empty sequence that will be placed at image offset `origin`.
    pub fn new(origin: usize) -> Self {
        Self {
            origin,
            buf: [0; MAX_CODE_SIZE],
            len: 0,
        }
    }

    /// Returns the image offset of the next emitted byte.
    pub fn position(&self) -> usize {
        self.origin + self.len
    }

    pub fn origin(&self) -> usize {
        self.origin
    }

    pub fn code(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends raw bytes.
    pub fn emit(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        let dst = self
            .buf
            .get_mut(self.len..self.len + bytes.len())
            .ok_or(Error::OutOfResources)?;
        dst.copy_from_slice(bytes);
        self.len += bytes.len();
        Ok(self)
    }

    /// `mov r32, imm32`
    pub fn mov_imm32(&mut self, dst: Register, imm: u32) -> Result<&mut Self> {
        self.emit(&[0xB8 + dst as u8])?;
        self.emit(&imm.to_le_bytes())
    }

    /// `mov [base], r32`
    ///
    /// `Rsp` and `Rbp` need a SIB byte or a displacement and are rejected.
    pub fn store32(&mut self, base: Register, src: Register) -> Result<&mut Self> {
        if matches!(base, Register::Rsp | Register::Rbp) {
            return Err(Error::InvalidParameter);
        }
        self.emit(&[0x89, ((src as u8) << 3) | base as u8])
    }

    /// `add r64, imm8`
    pub fn add_imm8(&mut self, dst: Register, imm: i8) -> Result<&mut Self> {
        self.emit(&[0x48, 0x83, 0xC0 | dst as u8, imm as u8])
    }

    /// `xor r32, r32`
    pub fn xor32(&mut self, dst: Register, src: Register) -> Result<&mut Self> {
        self.emit(&[0x31, 0xC0 | ((src as u8) << 3) | dst as u8])
    }

    pub fn wrmsr(&mut self) -> Result<&mut Self> {
        self.emit(&[0x0F, 0x30])
    }

    pub fn ret(&mut self) -> Result<&mut Self> {
        self.emit(&[0xC3])
    }

    /// `jmp rel8` to the image offset `target`.
    pub fn jmp_short(&mut self, target: usize) -> Result<&mut Self> {
        let rel = displacement(self.position() + 2, target)?;
        let rel = i8::try_from(rel).map_err(|_| Error::OutOfResources)?;
        self.emit(&[0xEB, rel as u8])
    }

    /// `jmp rel32` to the image offset `target`.
    pub fn jmp_near(&mut self, target: usize) -> Result<&mut Self> {
        let rel = displacement(self.position() + 5, target)?;
        let rel = i32::try_from(rel).map_err(|_| Error::OutOfResources)?;
        self.emit(&[0xE9])?;
        self.emit(&rel.to_le_bytes())
    }

    /// Pads with `nop` up to the image offset `end`.
    pub fn nop_until(&mut self, end: usize) -> Result<&mut Self> {
        let count = end
            .checked_sub(self.position())
            .ok_or(Error::OutOfResources)?;
        let dst = self
            .buf
            .get_mut(self.len..self.len + count)
            .ok_or(Error::OutOfResources)?;
        dst.fill(NOP);
        self.len += count;
        Ok(self)
    }
}

impl fmt::Debug for Assembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Assembler {{ origin: {:#x}, code: {} }}",
            self.origin,
            byte_patch::Hex(self.code())
        )
    }
}

// The displacement of `target` relative to the end of the jump, `next`.
fn displacement(next: usize, target: usize) -> Result<i64> {
    let next = i64::try_from(next).map_err(|_| Error::OutOfResources)?;
    let target = i64::try_from(target).map_err(|_| Error::OutOfResources)?;
    Ok(target - next)
}

/// Writes every sequence in `code` to `image`.
///
/// Fails with [`Error::OutOfResources`] without writing anything if one of
/// the sequences does not fit.
pub fn commit(image: &mut [u8], code: &[&Assembler]) -> Result<()> {
    let fits = |asm: &&Assembler| {
        asm.origin
            .checked_add(asm.len)
            .is_some_and(|end| end <= image.len())
    };
    if !code.iter().all(fits) {
        return Err(Error::OutOfResources);
    }

    for asm in code {
        image[asm.origin..asm.origin + asm.len].copy_from_slice(asm.code());
        log::trace!("Emitted {:?}", asm);
    }
    Ok(())
}
