//! Program images
//!
//! The generator sees the program as one flat byte sequence whose first byte is
//! address 0. ELF executables are flattened by copying every `PT_LOAD` segment to
//! its virtual address; the gaps and bss tails are zero.

use crate::error::{GenError, ImageError};
use elf::{abi::PT_LOAD, endian::AnyEndian, ElfBytes};
use log::debug;
use std::path::Path;

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

/// Borrowed view of a program image.
#[derive(Debug, Clone, Copy)]
pub struct ProgramImage<'a> {
    bytes: &'a [u8],
    entry_point: Option<u32>,
}

impl<'a> ProgramImage<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            entry_point: None,
        }
    }

    pub fn with_entry_point(mut self, entry_point: Option<u32>) -> Self {
        self.entry_point = entry_point;
        self
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }
}

/// An owned, flattened program image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    bytes: Vec<u8>,
    entry_point: Option<u32>,
}

impl LoadedImage {
    /// Treats `bytes` as memory starting at address 0.
    pub fn from_raw(bytes: Vec<u8>) -> Result<Self, ImageError> {
        if bytes.is_empty() {
            return Err(ImageError::Empty);
        }
        Ok(Self {
            bytes,
            entry_point: None,
        })
    }

    /// Flattens the loadable segments of a 32- or 64-bit ELF of either endianness.
    pub fn from_elf(data: &[u8]) -> Result<Self, ImageError> {
        let elf = ElfBytes::<AnyEndian>::minimal_parse(data)?;
        let segments = elf.segments().ok_or(ImageError::NoLoadableSegments)?;

        let mut bytes = Vec::new();
        let mut loaded = 0usize;
        for phdr in segments.iter().filter(|phdr| phdr.p_type == PT_LOAD) {
            if phdr.p_memsz == 0 {
                continue;
            }
            let end = phdr
                .p_vaddr
                .checked_add(phdr.p_memsz)
                .filter(|end| *end <= 1u64 << 32)
                .ok_or(ImageError::SegmentOutOfRange {
                    vaddr: phdr.p_vaddr,
                    size: phdr.p_memsz,
                })?;
            let start = phdr.p_vaddr as usize;
            let end = end as usize;
            if bytes.len() < end {
                bytes.resize(end, 0);
            }

            let file_data = elf.segment_data(&phdr)?;
            let copy_len = file_data.len().min(end - start);
            bytes[start..start + copy_len].copy_from_slice(&file_data[..copy_len]);
            debug!(
                "loaded segment {:#x}..{:#x} ({} bytes from file)",
                start, end, copy_len
            );
            loaded += 1;
        }

        if loaded == 0 {
            return Err(ImageError::NoLoadableSegments);
        }

        Ok(Self {
            bytes,
            entry_point: u32::try_from(elf.ehdr.e_entry).ok(),
        })
    }

    /// Reads a file, as ELF when it carries the ELF magic and as raw bytes otherwise.
    pub fn load(path: &Path) -> Result<Self, GenError> {
        let data = std::fs::read(path).map_err(|e| GenError::io(path, e))?;
        let image = if data.starts_with(ELF_MAGIC) {
            Self::from_elf(&data)?
        } else {
            Self::from_raw(data)?
        };
        Ok(image)
    }

    pub fn as_image(&self) -> ProgramImage<'_> {
        ProgramImage::new(&self.bytes).with_entry_point(self.entry_point)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn entry_point(&self) -> Option<u32> {
        self.entry_point
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal little-endian ELF32 executable with a single `PT_LOAD` segment.
    pub(crate) fn tiny_elf(vaddr: u32, payload: &[u8], memsz: u32, entry: u32) -> Vec<u8> {
        const EHDR: u32 = 52;
        const PHDR: u32 = 32;
        let mut out = Vec::new();
        out.extend_from_slice(b"\x7fELF");
        out.extend_from_slice(&[1, 1, 1, 0]);
        out.extend_from_slice(&[0; 8]);
        out.extend_from_slice(&2u16.to_le_bytes()); // e_type: EXEC
        out.extend_from_slice(&8u16.to_le_bytes()); // e_machine
        out.extend_from_slice(&1u32.to_le_bytes()); // e_version
        out.extend_from_slice(&entry.to_le_bytes());
        out.extend_from_slice(&EHDR.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&(EHDR as u16).to_le_bytes());
        out.extend_from_slice(&(PHDR as u16).to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        out.extend_from_slice(&40u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        assert_eq!(out.len(), EHDR as usize);

        for word in [
            PT_LOAD,
            EHDR + PHDR,
            vaddr,
            vaddr,
            payload.len() as u32,
            memsz,
            5,
            4,
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn raw_images_start_at_zero() {
        let image = LoadedImage::from_raw(vec![1, 2, 3]).unwrap();
        assert_eq!(image.as_image().bytes(), &[1, 2, 3]);
        assert_eq!(image.entry_point(), None);
        assert!(matches!(
            LoadedImage::from_raw(Vec::new()),
            Err(ImageError::Empty)
        ));
    }

    #[test]
    fn elf_segments_are_flattened() {
        let elf = tiny_elf(0x10, &[1, 2, 3, 4], 8, 0x10);
        let image = LoadedImage::from_elf(&elf).unwrap();
        assert_eq!(image.len(), 0x18);
        assert_eq!(&image.as_image().bytes()[0x10..0x14], &[1, 2, 3, 4]);
        assert!(image.as_image().bytes()[0x14..].iter().all(|b| *b == 0));
        assert!(image.as_image().bytes()[..0x10].iter().all(|b| *b == 0));
        assert_eq!(image.entry_point(), Some(0x10));
    }

    #[test]
    fn load_detects_format() {
        let dir = tempfile::tempdir().unwrap();
        let elf_path = dir.path().join("prog.elf");
        std::fs::write(&elf_path, tiny_elf(0, &[9, 9], 2, 0)).unwrap();
        let raw_path = dir.path().join("prog.bin");
        std::fs::write(&raw_path, [7u8; 6]).unwrap();

        assert_eq!(LoadedImage::load(&elf_path).unwrap().len(), 2);
        assert_eq!(LoadedImage::load(&raw_path).unwrap().len(), 6);
        assert!(matches!(
            LoadedImage::load(&dir.path().join("missing")),
            Err(GenError::Io { .. })
        ));
    }
}
