//! Instruction formats and operand decoding.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::opcode::Opcode;
use crate::utils::sign_extend;

/// The RV32I encoding formats. SYSTEM covers the fully fixed encodings
/// (`fence`, `ecall`, `ebreak`, `mret`) that carry no operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionFormat {
    R,
    I,
    S,
    B,
    U,
    J,
    System,
}

/// Operand fields extracted from one encoded instruction.
///
/// Fields a format does not carry decode to zero.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Destination register index.
    pub rd: u32,
    /// First source register index; doubles as the zero-extended
    /// immediate of the `csr*i` forms.
    pub rs1: u32,
    /// Second source register index.
    pub rs2: u32,
    /// Immediate, sign-extended where the format calls for it.
    pub imm: i32,
}

impl InstructionFormat {
    /// Extracts the operand fields of `word` for this format.
    #[must_use]
    pub fn decode(self, word: u32) -> Decoded {
        let rd = (word >> 7) & 0x1F;
        let rs1 = (word >> 15) & 0x1F;
        let rs2 = (word >> 20) & 0x1F;

        match self {
            Self::R => Decoded { rd, rs1, rs2, imm: 0 },
            Self::I => Decoded { rd, rs1, rs2: 0, imm: sign_extend((word >> 20) & 0xFFF, 12) },
            Self::S => {
                // imm[4:0] in word[11:7], imm[11:5] in word[31:25]
                let imm = ((word >> 7) & 0x1F) | ((word >> 20) & 0xFE0);
                Decoded { rd: 0, rs1, rs2, imm: sign_extend(imm, 12) }
            }
            Self::B => {
                // imm[11] in word[7], imm[4:1] in word[11:8],
                // imm[10:5] in word[30:25], imm[12] in word[31]
                let imm = ((word << 4) & 0x800)
                    | ((word >> 7) & 0x1E)
                    | ((word >> 20) & 0x7E0)
                    | ((word >> 19) & 0x1000);
                Decoded { rd: 0, rs1, rs2, imm: sign_extend(imm, 13) }
            }
            Self::U => Decoded { rd, rs1: 0, rs2: 0, imm: (word & 0xFFFF_F000) as i32 },
            Self::J => {
                // imm[10:1] in word[30:21], imm[11] in word[20],
                // imm[19:12] in word[19:12], imm[20] in word[31]
                let imm = ((word >> 20) & 0x7FE)
                    | ((word >> 9) & 0x800)
                    | (word & 0xF_F000)
                    | ((word >> 11) & 0x10_0000);
                Decoded { rd, rs1: 0, rs2: 0, imm: sign_extend(imm, 21) }
            }
            Self::System => Decoded::default(),
        }
    }
}

/// One matched instruction: the opcode plus its decoded operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: Opcode,
    pub operands: Decoded,
}

impl Instruction {
    /// Decodes an encoded word, if any table matches it.
    #[must_use]
    pub fn decode(word: u32) -> Option<Self> {
        let opcode = Opcode::lookup(word)?;
        Some(Self { opcode, operands: opcode.format().decode(word) })
    }
}

impl Display for Instruction {
    /// Assembly-style rendering, used by the verbose instruction trace.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mnemonic = self.opcode.mnemonic();
        let Decoded { rd, rs1, rs2, imm } = self.operands;
        match self.opcode.format() {
            InstructionFormat::R => write!(f, "{mnemonic:<6}x{rd},x{rs1},x{rs2}"),
            InstructionFormat::I => write!(f, "{mnemonic:<6}x{rd},x{rs1},{imm:#x}"),
            InstructionFormat::S | InstructionFormat::B => {
                write!(f, "{mnemonic:<6}x{rs1},x{rs2},{imm:#x}")
            }
            InstructionFormat::U | InstructionFormat::J => {
                write!(f, "{mnemonic:<6}x{rd},{imm:#x}")
            }
            InstructionFormat::System => f.write_str(mnemonic),
        }
    }
}
