//! RV32I opcodes and the mask-table match.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::instruction::InstructionFormat;

/// Class masks. An encoded word is ANDed with each mask in turn and the
/// result looked up in the matching table; the first table that knows the
/// key wins.
pub(crate) const MASK_R: u32 = 0xFE00_707F;
pub(crate) const MASK_ISB: u32 = 0x707F;
pub(crate) const MASK_UJ: u32 = 0x7F;
pub(crate) const MASK_SYSTEM: u32 = 0xFFF0_707F;

/// An opcode (short for "operation code") specifies the operation to be
/// performed by the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Opcode {
    LUI,
    AUIPC,
    JAL,
    JALR,
    BEQ,
    BNE,
    BLT,
    BGE,
    BLTU,
    BGEU,
    LB,
    LH,
    LW,
    LBU,
    LHU,
    SB,
    SH,
    SW,
    ADDI,
    SLTI,
    SLTIU,
    XORI,
    ORI,
    ANDI,
    SLLI,
    SRLI,
    SRAI,
    ADD,
    SUB,
    SLL,
    SLT,
    SLTU,
    XOR,
    SRL,
    SRA,
    OR,
    AND,
    FENCE,
    ECALL,
    EBREAK,
    MRET,
    CSRRW,
    CSRRS,
    CSRRC,
    CSRRWI,
    CSRRSI,
    CSRRCI,
}

impl Opcode {
    /// Matches an encoded word against the four opcode tables in priority
    /// order: R, then I/S/B, then U/J, then SYSTEM.
    #[must_use]
    pub fn lookup(word: u32) -> Option<Self> {
        Self::from_r_key(word & MASK_R)
            .or_else(|| Self::from_isb_key(word & MASK_ISB))
            .or_else(|| Self::from_uj_key(word & MASK_UJ))
            .or_else(|| Self::from_system_key(word & MASK_SYSTEM))
    }

    const fn from_r_key(key: u32) -> Option<Self> {
        match key {
            0x33 => Some(Self::ADD),
            0x4000_0033 => Some(Self::SUB),
            0x1033 => Some(Self::SLL),
            0x2033 => Some(Self::SLT),
            0x3033 => Some(Self::SLTU),
            0x4033 => Some(Self::XOR),
            0x5033 => Some(Self::SRL),
            0x4000_5033 => Some(Self::SRA),
            0x6033 => Some(Self::OR),
            0x7033 => Some(Self::AND),
            // srai carries the arithmetic bit in funct7, so the R mask
            // distinguishes it from srli before the I/S/B table looks
            0x4000_5013 => Some(Self::SRAI),
            _ => None,
        }
    }

    const fn from_isb_key(key: u32) -> Option<Self> {
        match key {
            0x67 => Some(Self::JALR),
            0x63 => Some(Self::BEQ),
            0x1063 => Some(Self::BNE),
            0x4063 => Some(Self::BLT),
            0x5063 => Some(Self::BGE),
            0x6063 => Some(Self::BLTU),
            0x7063 => Some(Self::BGEU),
            0x3 => Some(Self::LB),
            0x1003 => Some(Self::LH),
            0x2003 => Some(Self::LW),
            0x4003 => Some(Self::LBU),
            0x5003 => Some(Self::LHU),
            0x23 => Some(Self::SB),
            0x1023 => Some(Self::SH),
            0x2023 => Some(Self::SW),
            0x13 => Some(Self::ADDI),
            0x2013 => Some(Self::SLTI),
            0x3013 => Some(Self::SLTIU),
            0x4013 => Some(Self::XORI),
            0x6013 => Some(Self::ORI),
            0x7013 => Some(Self::ANDI),
            0x1013 => Some(Self::SLLI),
            0x5013 => Some(Self::SRLI),
            0x1073 => Some(Self::CSRRW),
            0x2073 => Some(Self::CSRRS),
            0x3073 => Some(Self::CSRRC),
            0x5073 => Some(Self::CSRRWI),
            0x6073 => Some(Self::CSRRSI),
            0x7073 => Some(Self::CSRRCI),
            _ => None,
        }
    }

    const fn from_uj_key(key: u32) -> Option<Self> {
        match key {
            0x37 => Some(Self::LUI),
            0x17 => Some(Self::AUIPC),
            0x6F => Some(Self::JAL),
            _ => None,
        }
    }

    const fn from_system_key(key: u32) -> Option<Self> {
        match key {
            0xF => Some(Self::FENCE),
            0x73 => Some(Self::ECALL),
            0x10_0073 => Some(Self::EBREAK),
            0x3020_0073 => Some(Self::MRET),
            _ => None,
        }
    }

    /// Get the mnemonic for the opcode.
    #[must_use]
    pub const fn mnemonic(&self) -> &'static str {
        match self {
            Self::LUI => "lui",
            Self::AUIPC => "auipc",
            Self::JAL => "jal",
            Self::JALR => "jalr",
            Self::BEQ => "beq",
            Self::BNE => "bne",
            Self::BLT => "blt",
            Self::BGE => "bge",
            Self::BLTU => "bltu",
            Self::BGEU => "bgeu",
            Self::LB => "lb",
            Self::LH => "lh",
            Self::LW => "lw",
            Self::LBU => "lbu",
            Self::LHU => "lhu",
            Self::SB => "sb",
            Self::SH => "sh",
            Self::SW => "sw",
            Self::ADDI => "addi",
            Self::SLTI => "slti",
            Self::SLTIU => "sltiu",
            Self::XORI => "xori",
            Self::ORI => "ori",
            Self::ANDI => "andi",
            Self::SLLI => "slli",
            Self::SRLI => "srli",
            Self::SRAI => "srai",
            Self::ADD => "add",
            Self::SUB => "sub",
            Self::SLL => "sll",
            Self::SLT => "slt",
            Self::SLTU => "sltu",
            Self::XOR => "xor",
            Self::SRL => "srl",
            Self::SRA => "sra",
            Self::OR => "or",
            Self::AND => "and",
            Self::FENCE => "fence",
            Self::ECALL => "ecall",
            Self::EBREAK => "ebreak",
            Self::MRET => "mret",
            Self::CSRRW => "csrrw",
            Self::CSRRS => "csrrs",
            Self::CSRRC => "csrrc",
            Self::CSRRWI => "csrrwi",
            Self::CSRRSI => "csrrsi",
            Self::CSRRCI => "csrrci",
        }
    }

    /// The encoding format whose decoder extracts this opcode's operands.
    #[must_use]
    pub const fn format(&self) -> InstructionFormat {
        match self {
            Self::LUI | Self::AUIPC => InstructionFormat::U,
            Self::JAL => InstructionFormat::J,
            Self::BEQ | Self::BNE | Self::BLT | Self::BGE | Self::BLTU | Self::BGEU => {
                InstructionFormat::B
            }
            Self::SB | Self::SH | Self::SW => InstructionFormat::S,
            Self::ADD
            | Self::SUB
            | Self::SLL
            | Self::SLT
            | Self::SLTU
            | Self::XOR
            | Self::SRL
            | Self::SRA
            | Self::OR
            | Self::AND => InstructionFormat::R,
            Self::FENCE | Self::ECALL | Self::EBREAK | Self::MRET => InstructionFormat::System,
            _ => InstructionFormat::I,
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_r_type() {
        assert_eq!(Opcode::lookup(0x0020_81B3), Some(Opcode::ADD));
        assert_eq!(Opcode::lookup(0x4020_81B3), Some(Opcode::SUB));
        assert_eq!(Opcode::lookup(0x0020_D1B3), Some(Opcode::SRL));
        assert_eq!(Opcode::lookup(0x4020_D1B3), Some(Opcode::SRA));
    }

    #[test]
    fn test_lookup_distinguishes_shift_immediates() {
        // srli x3, x1, 4 vs srai x3, x1, 4
        assert_eq!(Opcode::lookup(0x0040_D193), Some(Opcode::SRLI));
        assert_eq!(Opcode::lookup(0x4040_D193), Some(Opcode::SRAI));
        // the shift amount does not perturb the match
        assert_eq!(Opcode::lookup(0x41F0_D193), Some(Opcode::SRAI));
    }

    #[test]
    fn test_lookup_isb_and_uj() {
        assert_eq!(Opcode::lookup(0x0050_0093), Some(Opcode::ADDI));
        assert_eq!(Opcode::lookup(0x0020_8463), Some(Opcode::BEQ));
        assert_eq!(Opcode::lookup(0x0000_A183), Some(Opcode::LW));
        assert_eq!(Opcode::lookup(0x0020_A623), Some(Opcode::SW));
        assert_eq!(Opcode::lookup(0xDEAD_B537), Some(Opcode::LUI));
        assert_eq!(Opcode::lookup(0x0080_00EF), Some(Opcode::JAL));
        assert_eq!(Opcode::lookup(0x3400_92F3), Some(Opcode::CSRRW));
    }

    #[test]
    fn test_lookup_system() {
        assert_eq!(Opcode::lookup(0x0000_0073), Some(Opcode::ECALL));
        assert_eq!(Opcode::lookup(0x0010_0073), Some(Opcode::EBREAK));
        assert_eq!(Opcode::lookup(0x3020_0073), Some(Opcode::MRET));
        assert_eq!(Opcode::lookup(0x0000_000F), Some(Opcode::FENCE));
    }

    #[test]
    fn test_lookup_rejects_unknown_words() {
        assert_eq!(Opcode::lookup(0xFFFF_FFFF), None);
        assert_eq!(Opcode::lookup(0), None);
        // mul: M extension is not implemented
        assert_eq!(Opcode::lookup(0x0220_81B3), None);
    }

    #[test]
    fn test_mnemonics() {
        assert_eq!(Opcode::ADDI.mnemonic(), "addi");
        assert_eq!(Opcode::CSRRCI.mnemonic(), "csrrci");
        assert_eq!(Opcode::MRET.to_string(), "mret");
    }
}
