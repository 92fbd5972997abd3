//! Classic BPF filter programs for the team packet-classifier hash.
//!
//! The kernel stores the hash function as the binary option
//! `bpf_hash_func`, holding consecutive 8-byte `sock_filter` records.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Result, TeamError};

/// One classic BPF instruction (mirrors struct sock_filter).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SockFilter {
    /// Opcode.
    pub code: u16,
    /// Jump offset if true.
    pub jt: u8,
    /// Jump offset if false.
    pub jf: u8,
    /// Generic multiuse field.
    pub k: u32,
}

/// Size of one encoded instruction.
pub const SOCK_FILTER_SIZE: usize = std::mem::size_of::<SockFilter>();

impl SockFilter {
    /// Create an instruction.
    pub const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }
}

/// A classifier program: an ordered list of instructions
/// (mirrors struct sock_fprog).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SockFprog {
    instructions: Vec<SockFilter>,
}

impl SockFprog {
    /// Create a program from instructions.
    pub fn new(instructions: Vec<SockFilter>) -> Self {
        Self { instructions }
    }

    /// The instructions.
    pub fn instructions(&self) -> &[SockFilter] {
        &self.instructions
    }

    /// Number of instructions.
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// Check whether the program is empty.
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Encode to the fixed 8-bytes-per-instruction wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.instructions.len() * SOCK_FILTER_SIZE);
        for insn in &self.instructions {
            buf.extend_from_slice(insn.as_bytes());
        }
        buf
    }

    /// Decode from the wire format. The length must be a whole number of
    /// instructions.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() % SOCK_FILTER_SIZE != 0 {
            return Err(TeamError::Decode(format!(
                "filter program length {} not a multiple of {}",
                data.len(),
                SOCK_FILTER_SIZE
            )));
        }

        let mut instructions = Vec::with_capacity(data.len() / SOCK_FILTER_SIZE);
        for chunk in data.chunks_exact(SOCK_FILTER_SIZE) {
            let insn = SockFilter::read_from_bytes(chunk)
                .map_err(|_| TeamError::Decode("unreadable filter instruction".into()))?;
            instructions.push(insn);
        }

        Ok(Self { instructions })
    }
}
