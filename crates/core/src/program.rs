//! ELF32 executable images and the symbol map.

use std::path::PathBuf;

use elf::abi;
use elf::endian::LittleEndian;
use elf::file::Class;
use elf::ElfBytes;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::memory::{MemoryError, MemoryMap};

/// File extension the host accepts for ELF executables.
pub const ELF_EXTENSION: &str = "elf";

/// Errors the image loader can throw.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The file is not there.
    #[error("file {} does not exist", .0.display())]
    NotFound(PathBuf),
    /// The file extension names no supported loader.
    #[error("unexpected filetype {0:?}")]
    UnsupportedFormat(String),
    /// The image fails ELF32 validation.
    #[error("invalid elf file: {0}")]
    InvalidElf(String),
    /// A well-formed 64-bit ELF; recognized but not executable here.
    #[error("only 32-bit elf executables are supported")]
    UnsupportedElf,
    /// The file could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A segment landed outside the guest memory window.
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

fn invalid(message: impl Into<String>) -> LoadError {
    LoadError::InvalidElf(message.into())
}

/// Classification carried by an ELF symbol-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolKind {
    NoType,
    Object,
    Func,
    Section,
    Common,
    Tls,
    Unknown,
}

impl SymbolKind {
    /// Maps `ELF32_ST_TYPE(st_info)` to a kind.
    #[must_use]
    pub const fn from_st_type(st_type: u8) -> Self {
        match st_type {
            abi::STT_NOTYPE => Self::NoType,
            abi::STT_OBJECT => Self::Object,
            abi::STT_FUNC => Self::Func,
            abi::STT_SECTION => Self::Section,
            abi::STT_COMMON => Self::Common,
            abi::STT_TLS => Self::Tls,
            _ => Self::Unknown,
        }
    }

    /// Whether a symbol of this kind can anchor a breakpoint.
    #[must_use]
    pub const fn breakpointable(&self) -> bool {
        matches!(self, Self::Func | Self::NoType)
    }
}

/// A named address from the executable's symbol table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub kind: SymbolKind,
    pub addr: u32,
}

/// Symbols by name. Names are unique; a later entry with the same name
/// replaces the earlier one.
pub type SymbolMap = HashMap<String, Symbol>;

/// A validated ELF32 RISC-V executable image.
///
/// Construction checks the identification header eagerly so a bad file is
/// rejected before any guest state changes; [`ElfImage::load_into`]
/// materializes the `PT_LOAD` segments and the symbol table.
pub struct ElfImage {
    bytes: Vec<u8>,
}

impl ElfImage {
    pub fn new(bytes: Vec<u8>) -> Result<Self, LoadError> {
        let image = Self { bytes };
        image.parse()?;
        Ok(image)
    }

    fn parse(&self) -> Result<ElfBytes<'_, LittleEndian>, LoadError> {
        let elf = ElfBytes::<LittleEndian>::minimal_parse(&self.bytes)
            .map_err(|err| invalid(format!("bad header: {err}")))?;
        if elf.ehdr.class == Class::ELF64 {
            return Err(LoadError::UnsupportedElf);
        }
        if elf.ehdr.e_machine != abi::EM_RISCV {
            return Err(invalid("not a RISC-V machine"));
        }
        if elf.ehdr.e_type != abi::ET_EXEC {
            return Err(invalid("only executable files are supported"));
        }
        Ok(elf)
    }

    /// Copies every `PT_LOAD` segment into guest memory and the symbol
    /// table into `symbols`.
    pub fn load_into(&self, mem: &mut MemoryMap, symbols: &mut SymbolMap) -> Result<(), LoadError> {
        let elf = self.parse()?;
        self.load_segments(&elf, mem)?;
        self.load_symbols(&elf, symbols)?;
        Ok(())
    }

    fn load_segments(
        &self,
        elf: &ElfBytes<'_, LittleEndian>,
        mem: &mut MemoryMap,
    ) -> Result<(), LoadError> {
        let segments = elf.segments().ok_or_else(|| invalid("missing segment table"))?;

        let mut loaded = 0u64;
        for (index, segment) in segments.iter().enumerate() {
            if segment.p_type != abi::PT_LOAD {
                debug!(index, p_type = segment.p_type, "segment unused");
                continue;
            }

            let offset = usize::try_from(segment.p_offset)
                .map_err(|_| invalid("segment offset exceeds file"))?;
            let file_size = usize::try_from(segment.p_filesz)
                .map_err(|_| invalid("segment size exceeds file"))?;
            let end = offset
                .checked_add(file_size)
                .ok_or_else(|| invalid("segment extends past end of file"))?;
            let data = self
                .bytes
                .get(offset..end)
                .ok_or_else(|| invalid("segment extends past end of file"))?;

            debug!(
                index,
                paddr = format_args!("{:#010x}", segment.p_paddr),
                memsz = format_args!("{:#010x}", segment.p_memsz),
                "loading segment"
            );
            // bytes in [p_filesz, p_memsz) stay zero, the block default
            mem.put_bytes(segment.p_paddr, data)?;
            loaded += segment.p_filesz;
        }

        info!("loaded {loaded} bytes into memory");
        Ok(())
    }

    fn load_symbols(
        &self,
        elf: &ElfBytes<'_, LittleEndian>,
        symbols: &mut SymbolMap,
    ) -> Result<(), LoadError> {
        let Some(section_headers) = elf.section_headers() else {
            debug!("no section headers; image loads without symbols");
            return Ok(());
        };

        // Exactly one symbol table and one string table (beyond the
        // section-name table) may appear.
        let shstrndx = usize::from(elf.ehdr.e_shstrndx);
        let mut symtab_seen = false;
        let mut strtab_seen = false;
        for (index, header) in section_headers.iter().enumerate() {
            match header.sh_type {
                abi::SHT_SYMTAB => {
                    if symtab_seen {
                        return Err(invalid("multiple symbol tables"));
                    }
                    symtab_seen = true;
                }
                abi::SHT_STRTAB if index != shstrndx => {
                    if strtab_seen {
                        return Err(invalid("multiple string tables"));
                    }
                    strtab_seen = true;
                }
                _ => {}
            }
        }
        if !(symtab_seen && strtab_seen) {
            debug!("no symbol table; image loads without symbols");
            return Ok(());
        }

        let (symtab, strings) = elf
            .symbol_table()
            .map_err(|err| invalid(format!("bad symbol table: {err}")))?
            .ok_or_else(|| invalid("missing symbol table"))?;

        for sym in symtab.iter() {
            let name = match strings.get(sym.st_name as usize) {
                Ok(name) => name,
                Err(err) => {
                    warn!("parse symbol failed, {err}");
                    continue;
                }
            };
            if name.is_empty() {
                continue;
            }
            let symbol = Symbol {
                kind: SymbolKind::from_st_type(sym.st_symtype()),
                addr: sym.st_value as u32,
            };
            symbols.insert(name.to_string(), symbol);
        }

        info!("loaded {} symbols", symbols.len());
        Ok(())
    }
}
