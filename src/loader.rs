// SPDX-License-Identifier: Apache-2.0

//! Executable loaders feeding the guest memory map.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use goblin::elf::header::{EI_CLASS, ELFCLASS64, EM_X86_64, ET_DYN, ET_EXEC};
use goblin::elf::program_header::{PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::mem::{MemoryMap, Prot};

/// Guest address a flat binary image is loaded at; also its entry point.
/// The mapping is identity, so this is both virtual and physical.
pub const BIN_LOAD_ADDR: u64 = 0x40_0000;

/// Accepted executable image formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// Raw flat binary, mapped read-only executable at [`BIN_LOAD_ADDR`].
    Bin,
    /// 64-bit x86_64 ELF executable or shared object.
    Elf64,
    /// Try ELF64 first; fall back to flat binary on any ELF failure.
    Any,
}

/// Populates `map` from the executable at `path` and returns the guest
/// entry address. A failed load never leaves partial regions behind.
pub fn load(map: &mut MemoryMap, path: &Path, format: Format) -> Result<u64> {
    let res = match format {
        Format::Bin => load_bin(map, path),
        Format::Elf64 => load_elf64(map, path),
        Format::Any => load_any(map, path),
    };

    if res.is_err() {
        map.clear();
    }
    res
}

/// Maps the whole file read-only and executable at the fixed load address.
/// No other memory is mapped; the image brings its own data and stack.
fn load_bin(map: &mut MemoryMap, path: &Path) -> Result<u64> {
    let size = fs::metadata(path)?.len() as usize;
    if size == 0 {
        return Err(Error::InvalidArg("empty flat binary"));
    }

    let mut file = File::open(path)?;
    map.map_host_memory(
        BIN_LOAD_ADDR,
        size,
        Some(&mut file),
        Prot::READ | Prot::EXEC,
    )?;

    debug!(?path, size, entry = BIN_LOAD_ADDR, "loaded flat binary");
    Ok(BIN_LOAD_ADDR)
}

fn load_elf64(map: &mut MemoryMap, path: &Path) -> Result<u64> {
    let bytes = fs::read(path)?;

    let elf = Elf::parse(&bytes)
        .map_err(|e| Error::Unsupported(format!("not a valid ELF object: {e}")))?;

    if elf.header.e_ident[EI_CLASS] != ELFCLASS64 {
        return Err(Error::Unsupported("ELF class is not 64-bit".into()));
    }

    if elf.header.e_machine != EM_X86_64 {
        return Err(Error::Unsupported("ELF machine is not x86_64".into()));
    }

    if elf.header.e_type != ET_EXEC && elf.header.e_type != ET_DYN {
        return Err(Error::Unsupported(format!(
            "ELF type {:#x} is neither executable nor shared object",
            elf.header.e_type
        )));
    }

    // Segments load at their declared virtual addresses; with the identity
    // mapping those double as guest-physical placement. Every LOAD header
    // is mapped; a zero-size one fails the whole load.
    for phdr in elf.program_headers.iter().filter(|ph| ph.p_type == PT_LOAD) {
        if phdr.p_filesz > phdr.p_memsz {
            return Err(Error::Unsupported(
                "segment file size exceeds its memory size".into(),
            ));
        }

        let file_end = phdr
            .p_offset
            .checked_add(phdr.p_filesz)
            .filter(|&end| end <= bytes.len() as u64)
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "segment data extends past end of file",
                ))
            })?;

        let mut prot = Prot::empty();
        if phdr.p_flags & PF_R != 0 {
            prot |= Prot::READ;
        }
        if phdr.p_flags & PF_W != 0 {
            prot |= Prot::WRITE;
        }
        if phdr.p_flags & PF_X != 0 {
            prot |= Prot::EXEC;
        }

        let idx = map.map_host_memory(phdr.p_vaddr, phdr.p_memsz as usize, None, prot)?;

        // Bytes past p_filesz stay zero, which is what BSS wants.
        if let Some(dst) = map.region_mut(idx).backing_mut() {
            dst[..phdr.p_filesz as usize]
                .copy_from_slice(&bytes[phdr.p_offset as usize..file_end as usize]);
        }

        trace!(
            vaddr = phdr.p_vaddr,
            memsz = phdr.p_memsz,
            filesz = phdr.p_filesz,
            flags = phdr.p_flags,
            "loaded ELF segment"
        );
    }

    debug!(?path, entry = elf.header.e_entry, "loaded ELF64 executable");
    Ok(elf.header.e_entry)
}

fn load_any(map: &mut MemoryMap, path: &Path) -> Result<u64> {
    match load_elf64(map, path) {
        Ok(entry) => Ok(entry),
        Err(e) => {
            trace!(error = %e, "ELF load failed, trying flat binary");
            map.clear();
            load_bin(map, path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging;

    use std::io::Write;

    use tempfile::NamedTempFile;

    struct Seg {
        vaddr: u64,
        memsz: u64,
        flags: u32,
        data: Vec<u8>,
    }

    fn elf64_bytes(machine: u16, e_type: u16, entry: u64, segs: &[Seg]) -> Vec<u8> {
        let phoff = 64u64;
        let mut data_off = phoff + 56 * segs.len() as u64;

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&e_type.to_le_bytes());
        out.extend_from_slice(&machine.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&entry.to_le_bytes());
        out.extend_from_slice(&phoff.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&56u16.to_le_bytes());
        out.extend_from_slice(&(segs.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());

        for seg in segs {
            out.extend_from_slice(&PT_LOAD.to_le_bytes());
            out.extend_from_slice(&seg.flags.to_le_bytes());
            out.extend_from_slice(&data_off.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&seg.vaddr.to_le_bytes());
            out.extend_from_slice(&(seg.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&seg.memsz.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
            data_off += seg.data.len() as u64;
        }

        for seg in segs {
            out.extend_from_slice(&seg.data);
        }

        out
    }

    fn elf32_bytes() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&ET_EXEC.to_le_bytes());
        out.extend_from_slice(&3u16.to_le_bytes()); // EM_386
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // e_entry
        out.extend_from_slice(&0u32.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&52u16.to_le_bytes());
        out.extend_from_slice(&32u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    fn temp_exe(bytes: &[u8]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    #[test]
    fn empty_flat_binary_is_invalid() {
        let file = temp_exe(b"");
        let mut map = MemoryMap::new();

        assert!(matches!(
            load(&mut map, file.path(), Format::Bin),
            Err(Error::InvalidArg(_))
        ));
        assert!(map.is_empty());
    }

    #[test]
    fn flat_binary_maps_read_execute() {
        let file = temp_exe(&[0x66, 0xBA, 0xFF, 0x00, 0xEE, 0xF4]);
        let mut map = MemoryMap::new();

        let entry = load(&mut map, file.path(), Format::Bin).unwrap();
        assert_eq!(entry, BIN_LOAD_ADDR);
        assert_eq!(map.len(), 1);

        let region = map.region(0);
        assert_eq!(region.first_gfn(), BIN_LOAD_ADDR >> 12);
        assert_eq!(region.prot(), Prot::READ | Prot::EXEC);
        assert!(region.is_read_only());
        assert_eq!(&region.backing()[..6], &[0x66, 0xBA, 0xFF, 0x00, 0xEE, 0xF4]);
    }

    #[test]
    fn elf_segments_become_regions() {
        let code = vec![0xF4; 16];
        let data = vec![0xAA; 8];
        let bytes = elf64_bytes(
            EM_X86_64,
            ET_EXEC,
            0x40_0000,
            &[
                Seg {
                    vaddr: 0x40_0000,
                    memsz: 0x1000,
                    flags: PF_R | PF_X,
                    data: code.clone(),
                },
                Seg {
                    vaddr: 0x60_1000,
                    memsz: 0x2000,
                    flags: PF_R | PF_W,
                    data: data.clone(),
                },
            ],
        );
        let file = temp_exe(&bytes);
        let mut map = MemoryMap::new();

        let entry = load(&mut map, file.path(), Format::Elf64).unwrap();
        assert_eq!(entry, 0x40_0000);
        assert_eq!(map.len(), 2);

        let text = map.region(0);
        assert_eq!(text.prot(), Prot::READ | Prot::EXEC);
        assert_eq!(&text.backing()[..16], &code[..]);
        assert!(text.backing()[16..].iter().all(|&b| b == 0));

        let bss = map.region(1);
        assert_eq!(bss.prot(), Prot::READ | Prot::WRITE);
        assert_eq!(bss.first_gfn(), 0x601);
        assert_eq!(bss.last_gfn(), 0x602);
        assert_eq!(&bss.backing()[..8], &data[..]);
        assert!(bss.backing()[8..].iter().all(|&b| b == 0));

        // Page-table view of the same load: code is executable read-only,
        // data is writable no-execute.
        let gpt_idx = paging::build(&mut map).unwrap();
        let table = map.region(gpt_idx).backing();
        let pte = |gfn: u64| {
            let off = (3 * 512 + gfn as usize) * 8;
            u64::from_le_bytes(table[off..][..8].try_into().unwrap())
        };
        assert_eq!(pte(0x400), (0x400 << 12) | 1);
        assert_eq!(pte(0x601), (0x601 << 12) | 1 | 2 | (1 << 63));
    }

    #[test]
    fn elf32_is_unsupported() {
        let file = temp_exe(&elf32_bytes());
        let mut map = MemoryMap::new();

        assert!(matches!(
            load(&mut map, file.path(), Format::Elf64),
            Err(Error::Unsupported(_))
        ));
        assert!(map.is_empty());
    }

    #[test]
    fn foreign_machine_is_unsupported() {
        let bytes = elf64_bytes(183, ET_EXEC, 0x40_0000, &[]); // EM_AARCH64
        let file = temp_exe(&bytes);
        let mut map = MemoryMap::new();

        assert!(matches!(
            load(&mut map, file.path(), Format::Elf64),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn relocatable_object_is_unsupported() {
        let bytes = elf64_bytes(EM_X86_64, 1, 0x40_0000, &[]); // ET_REL
        let file = temp_exe(&bytes);
        let mut map = MemoryMap::new();

        assert!(matches!(
            load(&mut map, file.path(), Format::Elf64),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn zero_size_segment_fails_the_load() {
        let bytes = elf64_bytes(
            EM_X86_64,
            ET_EXEC,
            0x40_0000,
            &[
                Seg {
                    vaddr: 0x40_0000,
                    memsz: 0x1000,
                    flags: PF_R | PF_X,
                    data: vec![0xF4; 4],
                },
                Seg {
                    vaddr: 0x50_0000,
                    memsz: 0,
                    flags: PF_R,
                    data: vec![],
                },
            ],
        );
        let file = temp_exe(&bytes);
        let mut map = MemoryMap::new();

        assert!(matches!(
            load(&mut map, file.path(), Format::Elf64),
            Err(Error::InvalidArg(_))
        ));
        assert!(map.is_empty());
    }

    #[test]
    fn any_falls_back_to_flat_binary() {
        let file = temp_exe(b"\x90\x90\xF4 definitely not an ELF");
        let mut map = MemoryMap::new();

        let entry = load(&mut map, file.path(), Format::Any).unwrap();
        assert_eq!(entry, BIN_LOAD_ADDR);
        assert_eq!(map.len(), 1);
        assert_eq!(map.region(0).first_gfn(), 0x400);
    }

    #[test]
    fn any_surfaces_the_flat_binary_error_when_both_fail() {
        // Not an ELF and empty, so both loaders reject it. The caller sees
        // the flat-binary failure, not the ELF parse error.
        let file = temp_exe(b"");
        let mut map = MemoryMap::new();

        assert!(matches!(
            load(&mut map, file.path(), Format::Any),
            Err(Error::InvalidArg("empty flat binary"))
        ));
        assert!(map.is_empty());
    }

    #[test]
    fn overlapping_segments_empty_the_map() {
        let bytes = elf64_bytes(
            EM_X86_64,
            ET_EXEC,
            0x40_0000,
            &[
                Seg {
                    vaddr: 0x40_0000,
                    memsz: 0x2000,
                    flags: PF_R | PF_X,
                    data: vec![0xF4; 4],
                },
                Seg {
                    vaddr: 0x40_1000,
                    memsz: 0x1000,
                    flags: PF_R | PF_W,
                    data: vec![],
                },
            ],
        );
        let file = temp_exe(&bytes);
        let mut map = MemoryMap::new();

        assert!(matches!(
            load(&mut map, file.path(), Format::Elf64),
            Err(Error::Conflict { .. })
        ));
        assert!(map.is_empty());
    }

    #[test]
    fn flagless_segment_is_present_readonly_nx() {
        let bytes = elf64_bytes(
            EM_X86_64,
            ET_EXEC,
            0x40_0000,
            &[Seg {
                vaddr: 0x40_0000,
                memsz: 0x1000,
                flags: 0,
                data: vec![],
            }],
        );
        let file = temp_exe(&bytes);
        let mut map = MemoryMap::new();

        load(&mut map, file.path(), Format::Elf64).unwrap();
        assert_eq!(map.region(0).prot(), Prot::READ);
    }

    #[test]
    fn truncated_segment_data_is_an_io_error() {
        let mut bytes = elf64_bytes(
            EM_X86_64,
            ET_EXEC,
            0x40_0000,
            &[Seg {
                vaddr: 0x40_0000,
                memsz: 0x1000,
                flags: PF_R | PF_X,
                data: vec![0xF4; 64],
            }],
        );
        bytes.truncate(bytes.len() - 32);
        let file = temp_exe(&bytes);
        let mut map = MemoryMap::new();

        assert!(matches!(
            load(&mut map, file.path(), Format::Elf64),
            Err(Error::Io(_))
        ));
        assert!(map.is_empty());
    }

    #[test]
    fn oversized_file_size_is_unsupported() {
        let bytes = elf64_bytes(
            EM_X86_64,
            ET_EXEC,
            0x40_0000,
            &[Seg {
                vaddr: 0x40_0000,
                memsz: 8,
                flags: PF_R,
                data: vec![0xAA; 100],
            }],
        );
        let file = temp_exe(&bytes);
        let mut map = MemoryMap::new();

        assert!(matches!(
            load(&mut map, file.path(), Format::Elf64),
            Err(Error::Unsupported(_))
        ));
    }
}
