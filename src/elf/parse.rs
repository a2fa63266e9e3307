//! Minimal ELF reader for dynamic-linking metadata.
//!
//! Reads program headers directly instead of running `readelf` or `ldd`, so
//! it works on foreign-architecture binaries and never executes anything.
//! Only what dependency resolution needs is decoded: machine, `PT_INTERP`,
//! and the `DT_NEEDED` / `DT_SONAME` / `DT_RUNPATH` entries of `PT_DYNAMIC`.

use std::fs;
use std::path::Path;

use thiserror::Error;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;

const DT_NULL: u64 = 0;
const DT_NEEDED: u64 = 1;
const DT_STRTAB: u64 = 5;
const DT_STRSZ: u64 = 10;
const DT_SONAME: u64 = 14;
const DT_RPATH: u64 = 15;
const DT_RUNPATH: u64 = 29;

#[derive(Debug, Error)]
pub enum ElfError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("not an ELF file")]
    NotElf,
    #[error("script file (interpreter: {0})")]
    Script(String),
    #[error("unsupported ELF class {0}")]
    UnsupportedClass(u8),
    #[error("unsupported ELF data encoding {0}")]
    UnsupportedEncoding(u8),
    #[error("truncated ELF: {0}")]
    Truncated(&'static str),
    #[error("dynamic string table address {0:#x} is not covered by any PT_LOAD segment")]
    UnmappedAddress(u64),
}

/// Dynamic-linking facts about one ELF file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElfInfo {
    pub machine: u16,
    pub is_64: bool,
    pub has_dynamic: bool,
    pub interpreter: Option<String>,
    pub needed: Vec<String>,
    pub soname: Option<String>,
    pub runpath: Vec<String>,
}

impl ElfInfo {
    /// No loader and nothing to load: the binary runs on its own.
    ///
    /// Static-pie binaries carry a `PT_DYNAMIC` for self-relocation but no
    /// interpreter and no `DT_NEEDED`, so they count as static too.
    pub fn is_static(&self) -> bool {
        !self.has_dynamic || (self.needed.is_empty() && self.interpreter.is_none())
    }

    pub fn architecture(&self) -> String {
        match self.machine {
            3 => "i386".to_string(),
            8 => "mips".to_string(),
            20 => "powerpc".to_string(),
            21 => "powerpc64".to_string(),
            40 => "arm".to_string(),
            62 => "x86_64".to_string(),
            183 => "aarch64".to_string(),
            243 => "riscv".to_string(),
            other => format!("machine-{}", other),
        }
    }
}

#[derive(Clone, Copy)]
struct Reader<'a> {
    data: &'a [u8],
    is_64: bool,
    big_endian: bool,
}

impl<'a> Reader<'a> {
    fn bytes(&self, offset: u64, len: usize, what: &'static str) -> Result<&'a [u8], ElfError> {
        let start = usize::try_from(offset).map_err(|_| ElfError::Truncated(what))?;
        let end = start.checked_add(len).ok_or(ElfError::Truncated(what))?;
        self.data.get(start..end).ok_or(ElfError::Truncated(what))
    }

    fn u16(&self, offset: u64, what: &'static str) -> Result<u16, ElfError> {
        let b = self.bytes(offset, 2, what)?;
        let raw = [b[0], b[1]];
        Ok(if self.big_endian {
            u16::from_be_bytes(raw)
        } else {
            u16::from_le_bytes(raw)
        })
    }

    fn u32(&self, offset: u64, what: &'static str) -> Result<u32, ElfError> {
        let b = self.bytes(offset, 4, what)?;
        let raw = [b[0], b[1], b[2], b[3]];
        Ok(if self.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        })
    }

    fn u64(&self, offset: u64, what: &'static str) -> Result<u64, ElfError> {
        let b = self.bytes(offset, 8, what)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(if self.big_endian {
            u64::from_be_bytes(raw)
        } else {
            u64::from_le_bytes(raw)
        })
    }

    /// Native word: 8 bytes on ELF64, 4 on ELF32.
    fn word(&self, offset: u64, what: &'static str) -> Result<u64, ElfError> {
        if self.is_64 {
            self.u64(offset, what)
        } else {
            self.u32(offset, what).map(u64::from)
        }
    }

    fn cstr(&self, offset: u64, limit: u64, what: &'static str) -> Result<String, ElfError> {
        let start = usize::try_from(offset).map_err(|_| ElfError::Truncated(what))?;
        let end = usize::try_from(limit)
            .unwrap_or(usize::MAX)
            .min(self.data.len());
        let slice = self.data.get(start..end).ok_or(ElfError::Truncated(what))?;
        let len = slice
            .iter()
            .position(|&b| b == 0)
            .ok_or(ElfError::Truncated(what))?;
        Ok(String::from_utf8_lossy(&slice[..len]).into_owned())
    }
}

/// Offset arithmetic on values read from the file.
fn add(base: u64, delta: u64, what: &'static str) -> Result<u64, ElfError> {
    base.checked_add(delta).ok_or(ElfError::Truncated(what))
}

struct ProgramHeader {
    p_type: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
}

/// Read and parse an ELF file from disk.
pub fn read_elf(path: &Path) -> Result<ElfInfo, ElfError> {
    let data = fs::read(path).map_err(|source| ElfError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_elf(&data)
}

/// Parse ELF bytes.
pub fn parse_elf(data: &[u8]) -> Result<ElfInfo, ElfError> {
    if data.len() < 4 || &data[..4] != ELF_MAGIC {
        if data.starts_with(b"#!") {
            let line = data
                .split(|&b| b == b'\n')
                .next()
                .unwrap_or_default();
            let interp = String::from_utf8_lossy(&line[2..]).trim().to_string();
            return Err(ElfError::Script(interp));
        }
        return Err(ElfError::NotElf);
    }
    if data.len() < 16 {
        return Err(ElfError::Truncated("e_ident"));
    }

    let is_64 = match data[4] {
        1 => false,
        2 => true,
        other => return Err(ElfError::UnsupportedClass(other)),
    };
    let big_endian = match data[5] {
        1 => false,
        2 => true,
        other => return Err(ElfError::UnsupportedEncoding(other)),
    };
    let r = Reader {
        data,
        is_64,
        big_endian,
    };

    let machine = r.u16(18, "e_machine")?;
    let (phoff, phentsize, phnum) = if is_64 {
        (
            r.u64(32, "e_phoff")?,
            r.u16(54, "e_phentsize")?,
            r.u16(56, "e_phnum")?,
        )
    } else {
        (
            u64::from(r.u32(28, "e_phoff")?),
            r.u16(42, "e_phentsize")?,
            r.u16(44, "e_phnum")?,
        )
    };

    let mut headers = Vec::with_capacity(phnum as usize);
    for i in 0..u64::from(phnum) {
        let base = add(phoff, i * u64::from(phentsize), "program header")?;
        let p_type = r.u32(base, "program header")?;
        let header = if is_64 {
            ProgramHeader {
                p_type,
                offset: r.u64(add(base, 8, "p_offset")?, "p_offset")?,
                vaddr: r.u64(add(base, 16, "p_vaddr")?, "p_vaddr")?,
                filesz: r.u64(add(base, 32, "p_filesz")?, "p_filesz")?,
            }
        } else {
            ProgramHeader {
                p_type,
                offset: u64::from(r.u32(add(base, 4, "p_offset")?, "p_offset")?),
                vaddr: u64::from(r.u32(add(base, 8, "p_vaddr")?, "p_vaddr")?),
                filesz: u64::from(r.u32(add(base, 16, "p_filesz")?, "p_filesz")?),
            }
        };
        headers.push(header);
    }

    let mut info = ElfInfo {
        machine,
        is_64,
        ..Default::default()
    };

    if let Some(interp) = headers.iter().find(|h| h.p_type == PT_INTERP) {
        let end = add(interp.offset, interp.filesz, "PT_INTERP")?;
        info.interpreter = Some(r.cstr(interp.offset, end, "PT_INTERP")?);
    }

    let Some(dynamic) = headers.iter().find(|h| h.p_type == PT_DYNAMIC) else {
        return Ok(info);
    };
    info.has_dynamic = true;

    let entry_size: u64 = if is_64 { 16 } else { 8 };
    let word_size: u64 = if is_64 { 8 } else { 4 };
    let mut entries = Vec::new();
    let mut strtab_addr = None;
    let mut strsz = None;

    let count = dynamic.filesz / entry_size;
    for i in 0..count {
        let base = add(dynamic.offset, i * entry_size, "dynamic entry")?;
        let tag = r.word(base, "dynamic entry")?;
        let value = r.word(add(base, word_size, "dynamic entry")?, "dynamic entry")?;
        match tag {
            DT_NULL => break,
            DT_STRTAB => strtab_addr = Some(value),
            DT_STRSZ => strsz = Some(value),
            _ => {}
        }
        entries.push((tag, value));
    }

    let Some(strtab_addr) = strtab_addr else {
        // A dynamic section without a string table can't name anything.
        return Ok(info);
    };
    let strtab = vaddr_to_offset(&headers, strtab_addr)
        .ok_or(ElfError::UnmappedAddress(strtab_addr))?;
    let strtab_end = strtab.saturating_add(strsz.unwrap_or(u64::MAX - strtab));

    for (tag, value) in entries {
        match tag {
            DT_NEEDED => {
                let name = r.cstr(add(strtab, value, "DT_NEEDED")?, strtab_end, "DT_NEEDED")?;
                info.needed.push(name);
            }
            DT_SONAME => {
                let name = r.cstr(add(strtab, value, "DT_SONAME")?, strtab_end, "DT_SONAME")?;
                info.soname = Some(name);
            }
            DT_RPATH | DT_RUNPATH => {
                let raw = r.cstr(add(strtab, value, "DT_RUNPATH")?, strtab_end, "DT_RUNPATH")?;
                info.runpath
                    .extend(raw.split(':').filter(|s| !s.is_empty()).map(str::to_string));
            }
            _ => {}
        }
    }

    Ok(info)
}

fn vaddr_to_offset(headers: &[ProgramHeader], vaddr: u64) -> Option<u64> {
    headers
        .iter()
        .filter(|h| h.p_type == PT_LOAD)
        .find(|h| vaddr >= h.vaddr && vaddr < h.vaddr.saturating_add(h.filesz))
        .and_then(|h| h.offset.checked_add(vaddr - h.vaddr))
}
