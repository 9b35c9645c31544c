//! Shared fixtures for the unit tests: canned guest programs and a
//! byte-level ELF32 builder.

use crate::memory::MemoryMap;

/// Installs a per-test subscriber so `--nocapture` runs show the traces.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// `addi x1,x0,5; addi x2,x0,7; add x3,x1,x2; ebreak`
pub(crate) const ARITH_PROGRAM: [u32; 4] = [0x0050_0093, 0x0070_0113, 0x0020_81B3, 0x0010_0073];

/// Writes encoded instruction words starting at address zero.
pub(crate) fn write_program(mem: &mut MemoryMap, words: &[u32]) {
    for (index, word) in words.iter().enumerate() {
        mem.put_bytes(index as u64 * 4, &word.to_le_bytes()).unwrap();
    }
}

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;
const SHDR_SIZE: usize = 40;
const SYM_SIZE: usize = 16;

/// Builds small ELF32 executables byte by byte.
///
/// Defaults produce a valid little-endian `ET_EXEC` image for `EM_RISCV`
/// with a section-name table, one string table, and one symbol table; the
/// setters poke individual fields to produce the rejection cases.
pub(crate) struct ElfFixture {
    class: u8,
    machine: u16,
    elf_type: u16,
    segments: Vec<(u32, Vec<u8>)>,
    symbols: Vec<(String, u8, u32)>,
    extra_symtabs: usize,
    extra_strtabs: usize,
    symbol_sections: bool,
}

impl ElfFixture {
    pub(crate) fn new() -> Self {
        Self {
            class: 1,
            machine: 243,
            elf_type: 2,
            segments: Vec::new(),
            symbols: Vec::new(),
            extra_symtabs: 0,
            extra_strtabs: 0,
            symbol_sections: true,
        }
    }

    pub(crate) fn class(mut self, class: u8) -> Self {
        self.class = class;
        self
    }

    pub(crate) fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub(crate) fn elf_type(mut self, elf_type: u16) -> Self {
        self.elf_type = elf_type;
        self
    }

    pub(crate) fn segment(mut self, paddr: u32, data: &[u8]) -> Self {
        self.segments.push((paddr, data.to_vec()));
        self
    }

    pub(crate) fn symbol(mut self, name: &str, st_type: u8, addr: u32) -> Self {
        self.symbols.push((name.to_string(), st_type, addr));
        self
    }

    pub(crate) fn extra_symtab(mut self) -> Self {
        self.extra_symtabs += 1;
        self
    }

    pub(crate) fn extra_strtab(mut self) -> Self {
        self.extra_strtabs += 1;
        self
    }

    pub(crate) fn no_symbol_sections(mut self) -> Self {
        self.symbol_sections = false;
        self
    }

    pub(crate) fn build(self) -> Vec<u8> {
        if self.class == 2 {
            return self.build_elf64_header();
        }

        let phnum = self.segments.len();
        let phoff = if phnum > 0 { EHDR_SIZE } else { 0 };
        let mut cursor = EHDR_SIZE + phnum * PHDR_SIZE;

        // segment payloads
        let mut segment_offsets = Vec::new();
        for (_, data) in &self.segments {
            segment_offsets.push(cursor);
            cursor += data.len();
        }

        // .strtab: leading NUL, then the symbol names
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for (name, _, _) in &self.symbols {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(name.as_bytes());
            strtab.push(0);
        }
        let strtab_off = cursor;
        cursor += strtab.len();

        // .symtab: a null entry, then one entry per symbol
        let mut symtab = vec![0u8; SYM_SIZE];
        for ((_, st_type, addr), name_off) in self.symbols.iter().zip(&name_offsets) {
            push_u32(&mut symtab, *name_off);
            push_u32(&mut symtab, *addr);
            push_u32(&mut symtab, 0);
            symtab.push(st_type & 0xF);
            symtab.push(0);
            push_u16(&mut symtab, 1);
        }
        let symtab_off = cursor;
        cursor += symtab.len();

        let shstrtab: &[u8] = b"\0.shstrtab\0.strtab\0.symtab\0";
        let shstrtab_off = cursor;
        cursor += shstrtab.len();

        let shoff = cursor;
        let shnum = if self.symbol_sections {
            4 + self.extra_symtabs + self.extra_strtabs
        } else {
            2
        };

        let mut out = Vec::new();
        // e_ident
        out.extend_from_slice(&[0x7F, b'E', b'L', b'F', self.class, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        push_u16(&mut out, self.elf_type);
        push_u16(&mut out, self.machine);
        push_u32(&mut out, 1); // e_version
        push_u32(&mut out, 0); // e_entry
        push_u32(&mut out, phoff as u32);
        push_u32(&mut out, shoff as u32);
        push_u32(&mut out, 0); // e_flags
        push_u16(&mut out, EHDR_SIZE as u16);
        push_u16(&mut out, PHDR_SIZE as u16);
        push_u16(&mut out, phnum as u16);
        push_u16(&mut out, SHDR_SIZE as u16);
        push_u16(&mut out, shnum as u16);
        push_u16(&mut out, 1); // e_shstrndx

        for ((paddr, data), offset) in self.segments.iter().zip(&segment_offsets) {
            push_u32(&mut out, 1); // PT_LOAD
            push_u32(&mut out, *offset as u32);
            push_u32(&mut out, *paddr); // p_vaddr
            push_u32(&mut out, *paddr); // p_paddr
            push_u32(&mut out, data.len() as u32);
            push_u32(&mut out, data.len() as u32); // p_memsz
            push_u32(&mut out, 0x5); // p_flags
            push_u32(&mut out, 4);
        }

        for (_, data) in &self.segments {
            out.extend_from_slice(data);
        }
        out.extend_from_slice(&strtab);
        out.extend_from_slice(&symtab);
        out.extend_from_slice(shstrtab);

        // section headers: null, .shstrtab, then the symbol sections
        push_shdr(&mut out, Shdr::default());
        push_shdr(
            &mut out,
            Shdr { name: 1, sh_type: 3, offset: shstrtab_off, size: shstrtab.len(), ..Shdr::default() },
        );
        if self.symbol_sections {
            push_shdr(
                &mut out,
                Shdr { name: 11, sh_type: 3, offset: strtab_off, size: strtab.len(), ..Shdr::default() },
            );
            push_shdr(
                &mut out,
                Shdr {
                    name: 19,
                    sh_type: 2,
                    offset: symtab_off,
                    size: symtab.len(),
                    link: 2,
                    entsize: SYM_SIZE,
                },
            );
            for _ in 0..self.extra_symtabs {
                push_shdr(
                    &mut out,
                    Shdr { name: 19, sh_type: 2, offset: symtab_off, size: 0, link: 2, entsize: SYM_SIZE },
                );
            }
            for _ in 0..self.extra_strtabs {
                push_shdr(&mut out, Shdr { name: 11, sh_type: 3, offset: strtab_off, size: 0, ..Shdr::default() });
            }
        }

        out
    }

    /// Just enough of a 64-bit header for the parser to read the class.
    fn build_elf64_header(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        push_u16(&mut out, self.elf_type);
        push_u16(&mut out, self.machine);
        push_u32(&mut out, 1); // e_version
        out.extend_from_slice(&[0; 8]); // e_entry
        out.extend_from_slice(&[0; 8]); // e_phoff
        out.extend_from_slice(&[0; 8]); // e_shoff
        push_u32(&mut out, 0); // e_flags
        push_u16(&mut out, 64);
        push_u16(&mut out, 56);
        push_u16(&mut out, 0); // e_phnum
        push_u16(&mut out, 64);
        push_u16(&mut out, 0); // e_shnum
        push_u16(&mut out, 0); // e_shstrndx
        out
    }
}

#[derive(Default)]
struct Shdr {
    name: u32,
    sh_type: u32,
    offset: usize,
    size: usize,
    link: u32,
    entsize: usize,
}

fn push_shdr(out: &mut Vec<u8>, shdr: Shdr) {
    push_u32(out, shdr.name);
    push_u32(out, shdr.sh_type);
    push_u32(out, 0); // sh_flags
    push_u32(out, 0); // sh_addr
    push_u32(out, shdr.offset as u32);
    push_u32(out, shdr.size as u32);
    push_u32(out, shdr.link);
    push_u32(out, 0); // sh_info
    push_u32(out, 0); // sh_addralign
    push_u32(out, shdr.entsize as u32);
}

fn push_u16(out: &mut Vec<u8>, value: u16) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}
