//! Native-word-width dispatch over ELF structure layouts.
//!
//! The injector has to read the target's ELF image with structure types sized
//! for that image's class. Rather than composing type names textually, the
//! width is resolved once into a [`WordWidth`] and the concrete layouts hang
//! off the [`ElfClass`] trait, so an image that is not 32- or 64-bit ELF is a
//! construction-time error instead of a malformed type.
//!
//! All ELF structure accesses within one injection attempt go through a
//! single `WordWidth`; widths are never mixed.

use object::Endianness;
use object::read::elf::FileHeader as _;
use thiserror::Error;

/// Errors resolving the word width of an ELF image.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WidthError {
    #[error("not an ELF image: {0}")]
    NotElf(String),
    #[error("unsupported ELF class (expected ELFCLASS32 or ELFCLASS64)")]
    UnsupportedClass,
}

/// The pointer/address width an ELF image (or the host) uses.
///
/// Resolution is deterministic: the same width always selects the same
/// structure layouts, and the two widths never alias.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WordWidth {
    W32,
    W64,
}

impl WordWidth {
    /// The width of the process this code is running in.
    #[must_use]
    pub const fn host() -> Self {
        if size_of::<usize>() == 8 {
            WordWidth::W64
        } else {
            WordWidth::W32
        }
    }

    /// Resolve the width of an ELF image from its header.
    pub fn from_elf_image(data: &[u8]) -> Result<Self, WidthError> {
        match object::FileKind::parse(data).map_err(|e| WidthError::NotElf(e.to_string()))? {
            object::FileKind::Elf32 => Ok(WordWidth::W32),
            object::FileKind::Elf64 => Ok(WordWidth::W64),
            _ => Err(WidthError::UnsupportedClass),
        }
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            WordWidth::W32 => 32,
            WordWidth::W64 => 64,
        }
    }

    /// Size in bytes of one pointer-sized word at this width.
    #[must_use]
    pub const fn word_bytes(self) -> usize {
        match self {
            WordWidth::W32 => 4,
            WordWidth::W64 => 8,
        }
    }

    /// Size of the ELF file header at this width.
    #[must_use]
    pub fn file_header_size(self) -> usize {
        match self {
            WordWidth::W32 => size_of::<<Elf32 as ElfClass>::FileHeader>(),
            WordWidth::W64 => size_of::<<Elf64 as ElfClass>::FileHeader>(),
        }
    }

    /// Size of a symbol table entry at this width.
    #[must_use]
    pub fn sym_size(self) -> usize {
        match self {
            WordWidth::W32 => size_of::<<Elf32 as ElfClass>::Sym>(),
            WordWidth::W64 => size_of::<<Elf64 as ElfClass>::Sym>(),
        }
    }
}

/// Binds the concrete ELF structure layouts for one word width.
///
/// The two implementors, [`Elf32`] and [`Elf64`], are uninhabited markers;
/// code that walks an image picks one of them based on a [`WordWidth`]
/// resolved up front and stays generic over the class from then on.
pub trait ElfClass {
    /// The width this class resolves under.
    const WIDTH: WordWidth;

    type FileHeader: object::read::elf::FileHeader<Endian = Endianness>;
    type ProgramHeader;
    type SectionHeader;
    type Sym;
}

/// Marker for 32-bit ELF layouts.
#[derive(Debug)]
pub enum Elf32 {}

/// Marker for 64-bit ELF layouts.
#[derive(Debug)]
pub enum Elf64 {}

impl ElfClass for Elf32 {
    const WIDTH: WordWidth = WordWidth::W32;

    type FileHeader = object::elf::FileHeader32<Endianness>;
    type ProgramHeader = object::elf::ProgramHeader32<Endianness>;
    type SectionHeader = object::elf::SectionHeader32<Endianness>;
    type Sym = object::elf::Sym32<Endianness>;
}

impl ElfClass for Elf64 {
    const WIDTH: WordWidth = WordWidth::W64;

    type FileHeader = object::elf::FileHeader64<Endianness>;
    type ProgramHeader = object::elf::ProgramHeader64<Endianness>;
    type SectionHeader = object::elf::SectionHeader64<Endianness>;
    type Sym = object::elf::Sym64<Endianness>;
}

/// Run `f` over `data`, realigned to 8 bytes if needed.
///
/// `object` refuses input that is not 8-byte aligned, and `fs::read` makes
/// no alignment promise, so a misaligned image is copied through a `u64`
/// buffer first.
fn with_aligned<T>(data: &[u8], f: impl FnOnce(&[u8]) -> T) -> T {
    if (data.as_ptr() as usize) % 8 == 0 {
        return f(data);
    }
    let mut buf = vec![0u64; data.len().div_ceil(8)];
    let bytes: &mut [u8] = unsafe {
        core::slice::from_raw_parts_mut(buf.as_mut_ptr().cast::<u8>(), buf.len() * 8)
    };
    bytes[..data.len()].copy_from_slice(data);
    f(&bytes[..data.len()])
}

/// Read the entry-point address out of an ELF image of class `E`.
pub fn entry_point<E: ElfClass>(data: &[u8]) -> Result<u64, WidthError> {
    with_aligned(data, |data| {
        let header = E::FileHeader::parse(data).map_err(|e| WidthError::NotElf(e.to_string()))?;
        let endian = header
            .endian()
            .map_err(|e| WidthError::NotElf(e.to_string()))?;
        Ok(header.e_entry(endian).into())
    })
}

/// Read the entry-point address of an ELF image, dispatching on its class.
pub fn entry_point_any(data: &[u8]) -> Result<(WordWidth, u64), WidthError> {
    match WordWidth::from_elf_image(data)? {
        WordWidth::W32 => Ok((WordWidth::W32, entry_point::<Elf32>(data)?)),
        WordWidth::W64 => Ok((WordWidth::W64, entry_point::<Elf64>(data)?)),
    }
}
