//! Program Loader
//!
//! Executables are stored in a simplified ELF form: one header describing
//! where text, read-only data, data and bss go, plus the raw section bytes.
//! The kernel asks a [`ProgramLoader`] for the header, validates it, and
//! pulls section bytes through it while building the new image.
//!
//! [`RamDisk`] is an in-memory loader used at boot and in tests.

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::config::{is_page_aligned, PAGE_SIZE, USER_MEM_START};
use crate::error::{KernError, KernResult};
use crate::types::VirtAddr;

/// One loadable section
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Section {
    /// Offset of the bytes within the image
    pub offset: u32,
    pub len: u32,
    pub start: VirtAddr,
}

impl Section {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First and last page base covered, if any
    pub fn page_span(&self) -> Option<(VirtAddr, VirtAddr)> {
        if self.len == 0 {
            return None;
        }
        let last = self.start.checked_add(self.len - 1)?;
        Some((self.start, last | (PAGE_SIZE - 1)))
    }
}

/// Simplified executable header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimpleElf {
    pub entry: VirtAddr,
    pub text: Section,
    pub rodata: Section,
    pub data: Section,
    /// Only `start` and `len` are meaningful
    pub bss: Section,
}

impl SimpleElf {
    /// Sections in load order with their role
    pub fn sections(&self) -> [(SectionKind, Section); 4] {
        [
            (SectionKind::Text, self.text),
            (SectionKind::Rodata, self.rodata),
            (SectionKind::Data, self.data),
            (SectionKind::Bss, self.bss),
        ]
    }

    /// Check that the image can be placed below `stack_low`
    ///
    /// Sections must start on page boundaries and may not share pages.
    pub fn validate(&self, stack_low: VirtAddr) -> KernResult<()> {
        if self.text.is_empty() {
            return Err(KernError::InvalidArgument);
        }
        let mut spans: Vec<(VirtAddr, VirtAddr)> = Vec::new();
        for (_, s) in self.sections() {
            if s.is_empty() {
                continue;
            }
            let (low, high) = s.page_span().ok_or(KernError::InvalidArgument)?;
            if !is_page_aligned(low) || low < USER_MEM_START || high >= stack_low {
                return Err(KernError::InvalidArgument);
            }
            if spans.iter().any(|&(l, h)| low <= h && l <= high) {
                return Err(KernError::InvalidArgument);
            }
            spans.push((low, high));
        }
        let text_end = self.text.start + (self.text.len - 1);
        if self.entry < self.text.start || self.entry > text_end {
            return Err(KernError::InvalidArgument);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Text,
    Rodata,
    Data,
    Bss,
}

/// Source of executables
pub trait ProgramLoader: Send + Sync {
    /// Header of the named program
    fn load_header(&self, name: &str) -> KernResult<SimpleElf>;

    /// Fill `buf` from the program image starting at `offset`
    fn read_bytes(&self, name: &str, offset: u32, buf: &mut [u8]) -> KernResult<()>;
}

// ============================================================================
// RAM disk
// ============================================================================

/// Builder for a program image
#[derive(Debug, Clone, Default)]
pub struct ProgramImage {
    header: SimpleElf,
    bytes: Vec<u8>,
}

impl ProgramImage {
    pub fn new(entry: VirtAddr) -> Self {
        Self {
            header: SimpleElf {
                entry,
                ..SimpleElf::default()
            },
            bytes: Vec::new(),
        }
    }

    fn append(&mut self, start: VirtAddr, contents: &[u8]) -> Section {
        let section = Section {
            offset: self.bytes.len() as u32,
            len: contents.len() as u32,
            start,
        };
        self.bytes.extend_from_slice(contents);
        section
    }

    pub fn text(mut self, start: VirtAddr, contents: &[u8]) -> Self {
        self.header.text = self.append(start, contents);
        self
    }

    pub fn rodata(mut self, start: VirtAddr, contents: &[u8]) -> Self {
        self.header.rodata = self.append(start, contents);
        self
    }

    pub fn data(mut self, start: VirtAddr, contents: &[u8]) -> Self {
        self.header.data = self.append(start, contents);
        self
    }

    pub fn bss(mut self, start: VirtAddr, len: u32) -> Self {
        self.header.bss = Section {
            offset: 0,
            len,
            start,
        };
        self
    }

    pub fn header(&self) -> &SimpleElf {
        &self.header
    }
}

/// In-memory table of named programs
#[derive(Debug, Clone, Default)]
pub struct RamDisk {
    files: BTreeMap<String, ProgramImage>,
}

impl RamDisk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, image: ProgramImage) {
        self.files.insert(name.to_string(), image);
    }

    pub fn with(mut self, name: &str, image: ProgramImage) -> Self {
        self.add(name, image);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}

impl ProgramLoader for RamDisk {
    fn load_header(&self, name: &str) -> KernResult<SimpleElf> {
        self.files
            .get(name)
            .map(|f| f.header)
            .ok_or(KernError::NotFound)
    }

    fn read_bytes(&self, name: &str, offset: u32, buf: &mut [u8]) -> KernResult<()> {
        let file = self.files.get(name).ok_or(KernError::NotFound)?;
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&e| e <= file.bytes.len())
            .ok_or(KernError::InvalidArgument)?;
        buf.copy_from_slice(&file.bytes[start..end]);
        Ok(())
    }
}
