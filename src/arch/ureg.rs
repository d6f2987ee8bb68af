//! User register frame
//!
//! Layout pushed by the trap path and handed to software exception
//! handlers; also the image `swexn` accepts when adopting new registers.

/// Divide error
pub const IDT_DE: u32 = 0;
/// General protection fault
pub const IDT_GP: u32 = 13;
/// Page fault
pub const IDT_PF: u32 = 14;

/// Interrupts enabled plus the always-set reserved bit
pub const EFLAGS_USER: u32 = 0x0000_0202;

const EFLAGS_IF: u32 = 1 << 9;
/// IOPL bits; user code must never raise its I/O privilege
const EFLAGS_IOPL: u32 = 3 << 12;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Ureg {
    pub cause: u32,
    pub cr2: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub error_code: u32,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

impl Ureg {
    pub const WORDS: usize = 13;
    pub const SIZE: usize = Self::WORDS * 4;

    /// Registers for a thread entering user mode for the first time
    pub fn user_entry(eip: u32, esp: u32) -> Self {
        Self {
            eip,
            esp,
            eflags: EFLAGS_USER,
            ..Self::default()
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let words = [
            self.cause,
            self.cr2,
            self.edi,
            self.esi,
            self.ebp,
            self.ebx,
            self.edx,
            self.ecx,
            self.eax,
            self.error_code,
            self.eip,
            self.eflags,
            self.esp,
        ];
        let mut out = [0u8; Self::SIZE];
        for (chunk, w) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut w = [0u32; Self::WORDS];
        for (word, chunk) in w.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self {
            cause: w[0],
            cr2: w[1],
            edi: w[2],
            esi: w[3],
            ebp: w[4],
            ebx: w[5],
            edx: w[6],
            ecx: w[7],
            eax: w[8],
            error_code: w[9],
            eip: w[10],
            eflags: w[11],
            esp: w[12],
        }
    }

    /// Whether user code may resume with these flags
    pub fn eflags_safe(&self) -> bool {
        self.eflags & EFLAGS_IF != 0 && self.eflags & EFLAGS_IOPL == 0
    }
}
