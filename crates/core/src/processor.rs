//! The RV32I interpreter: fetch, decode, execute, and trap delivery.

use thiserror::Error;
use tracing::info;

use crate::csr::{self, CsrError, CsrFile, CsrWriteOutcome, PrivilegeLevel};
use crate::instruction::{Decoded, Instruction};
use crate::memory::{MemoryError, MemoryMap};
use crate::opcode::Opcode;
use crate::utils::{align, sign_extend};

/// Everything a trap needs to identify itself in `mcause`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    UserSoftwareInterrupt,
    MachineSoftwareInterrupt,
    UserTimerInterrupt,
    MachineTimerInterrupt,
    UserExternalInterrupt,
    MachineExternalInterrupt,
    InstructionAddressMisaligned,
    IllegalInstruction,
    Breakpoint,
    LoadAddressMisaligned,
    StoreAddressMisaligned,
    EnvironmentCallFromUMode,
    EnvironmentCallFromMMode,
}

impl Trap {
    /// The 4-bit exception-code field of `mcause`.
    #[must_use]
    pub const fn code(&self) -> u32 {
        match self {
            Self::UserSoftwareInterrupt => 0,
            Self::MachineSoftwareInterrupt => 3,
            Self::UserTimerInterrupt => 4,
            Self::MachineTimerInterrupt => 7,
            Self::UserExternalInterrupt => 8,
            Self::MachineExternalInterrupt => 11,
            Self::InstructionAddressMisaligned => 0,
            Self::IllegalInstruction => 2,
            Self::Breakpoint => 3,
            Self::LoadAddressMisaligned => 4,
            Self::StoreAddressMisaligned => 6,
            Self::EnvironmentCallFromUMode => 8,
            Self::EnvironmentCallFromMMode => 11,
        }
    }

    /// Whether this is an asynchronous interrupt rather than an exception.
    #[must_use]
    pub const fn is_interrupt(&self) -> bool {
        matches!(
            self,
            Self::UserSoftwareInterrupt
                | Self::MachineSoftwareInterrupt
                | Self::UserTimerInterrupt
                | Self::MachineTimerInterrupt
                | Self::UserExternalInterrupt
                | Self::MachineExternalInterrupt
        )
    }

    /// The value `mcause` holds after this trap is delivered.
    #[must_use]
    pub const fn mcause(&self) -> u32 {
        ((self.is_interrupt() as u32) << 31) | (self.code() & 0xF)
    }
}

/// Errors from the host-facing register accessors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("register {0} exceeds registers x0..x31")]
pub struct RegisterError(pub u32);

/// RV32I hart state and interpreter.
///
/// The processor borrows guest memory for the duration of each call and
/// never retains it. Guest traps never escape [`Processor::step`]; they
/// rewrite architectural state per the machine trap model and execution
/// continues at the vector. Only accesses outside the memory window
/// surface as errors.
pub struct Processor {
    pc: u32,
    regs: [u32; 32],
    csrs: CsrFile,
    prv: PrivilegeLevel,
    instruction_count: u64,
    verbose: bool,
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

impl Processor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pc: 0,
            regs: [0; 32],
            csrs: CsrFile::new(),
            prv: PrivilegeLevel::Machine,
            instruction_count: 0,
            verbose: false,
        }
    }

    /// Returns every register, the pc, the privilege level, and the CSR
    /// file to reset state. Memory is not touched.
    pub fn reset(&mut self) {
        self.pc = 0;
        self.regs = [0; 32];
        self.prv = PrivilegeLevel::Machine;
        self.instruction_count = 0;
        self.csrs.reset();
    }

    #[must_use]
    pub const fn pc(&self) -> u32 {
        self.pc
    }

    pub fn set_pc(&mut self, value: u32) {
        self.pc = value;
    }

    /// Reads register `x<index>`.
    pub fn reg(&self, index: u32) -> Result<u32, RegisterError> {
        if index > 31 {
            return Err(RegisterError(index));
        }
        Ok(self.regs[index as usize])
    }

    /// Writes register `x<index>`. Writes to `x0` are discarded.
    pub fn set_reg(&mut self, index: u32, value: u32) -> Result<(), RegisterError> {
        if index > 31 {
            return Err(RegisterError(index));
        }
        self.write_x(index, value);
        Ok(())
    }

    /// Reads a registered CSR.
    pub fn csr(&self, num: u32) -> Result<u32, CsrError> {
        self.csrs.read(num)
    }

    /// Writes a CSR through its mask, reporting the same conditions a
    /// guest `csr*` instruction would trap on. A rejected write leaves the
    /// register unchanged.
    pub fn set_csr(&mut self, num: u32, value: u32) -> Result<(), CsrError> {
        let previous = self.csrs.peek(num);
        let outcome = self.csrs.write(num, value, self.prv);
        if outcome.undefined {
            Err(CsrError::InvalidCsr(num))
        } else if outcome.read_only {
            Err(CsrError::ReadOnlyCsr(num))
        } else if outcome.user_mode {
            self.csrs.write(num, previous, self.prv);
            Err(CsrError::UserModeCsr(num))
        } else {
            Ok(())
        }
    }

    /// Number of retired instructions since reset.
    #[must_use]
    pub const fn instruction_count(&self) -> u64 {
        self.instruction_count
    }

    #[must_use]
    pub const fn privilege(&self) -> PrivilegeLevel {
        self.prv
    }

    /// Enables the per-step instruction trace.
    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Executes one instruction.
    ///
    /// The fetch happens before the pc alignment check, so a fetch outside
    /// the memory window surfaces as [`MemoryError`] rather than a guest
    /// trap. A pending enabled interrupt preempts the fetched instruction.
    pub fn step(&mut self, mem: &mut MemoryMap) -> Result<(), MemoryError> {
        let word = mem.read_word_le(u64::from(self.pc))?;

        if self.pc % 4 != 0 {
            self.trap(Trap::InstructionAddressMisaligned, self.pc);
            self.finish_step();
            return Ok(());
        }

        if let Some(interrupt) = self.pending_interrupt() {
            self.trap(interrupt, 0);
            // An interrupt retires no instruction: the pc lands on the
            // vector but the count stays put.
            self.pc = self.pc.wrapping_add(4);
            return Ok(());
        }

        match Instruction::decode(word) {
            Some(instruction) => {
                if self.verbose {
                    info!("instruction {word:#010x}    {instruction}");
                }
                self.execute(mem, word, &instruction)?;
            }
            None => {
                if self.verbose {
                    info!("instruction {word:#010x}    unknown instruction");
                }
                self.trap(Trap::IllegalInstruction, word);
            }
        }

        self.finish_step();
        Ok(())
    }

    fn finish_step(&mut self) {
        self.pc = self.pc.wrapping_add(4);
        self.instruction_count += 1;
    }

    fn read_x(&self, index: u32) -> u32 {
        self.regs[index as usize]
    }

    /// `x0` is hardwired to zero; writes to it vanish.
    fn write_x(&mut self, index: u32, value: u32) {
        if index != 0 {
            self.regs[index as usize] = value;
        }
    }

    /// The highest-priority interrupt that is pending, enabled, and
    /// deliverable at the current privilege level.
    fn pending_interrupt(&self) -> Option<Trap> {
        let mstatus_mie = (self.csrs.peek(csr::MSTATUS) >> 3) & 0x1 == 1;
        let deliverable = (mstatus_mie && self.prv == PrivilegeLevel::Machine)
            || (!mstatus_mie && self.prv == PrivilegeLevel::User);
        if !deliverable {
            return None;
        }

        let mip = self.csrs.peek(csr::MIP);
        let mie = self.csrs.peek(csr::MIE);

        // Strict priority: machine external, software, timer, then the
        // user-level counterparts in the same order.
        const PRIORITY: [(u32, Trap); 6] = [
            (11, Trap::MachineExternalInterrupt),
            (3, Trap::MachineSoftwareInterrupt),
            (7, Trap::MachineTimerInterrupt),
            (8, Trap::UserExternalInterrupt),
            (0, Trap::UserSoftwareInterrupt),
            (4, Trap::UserTimerInterrupt),
        ];
        PRIORITY
            .iter()
            .find(|(bit, _)| (mip >> bit) & 0x1 == 1 && (mie >> bit) & 0x1 == 1)
            .map(|&(_, trap)| trap)
    }

    /// Delivers a trap: records cause, epc, and tval, pushes the
    /// interrupt-enable and privilege stacks in `mstatus`, and redirects
    /// the pc to the vector in `mtvec`.
    fn trap(&mut self, cause: Trap, tval: u32) {
        self.csrs.write(csr::MCAUSE, cause.mcause(), self.prv);
        self.csrs.write(csr::MEPC, self.pc, self.prv);
        self.csrs.write(csr::MTVAL, tval, self.prv);

        let mstatus = self.csrs.peek(csr::MSTATUS);
        let mie = (mstatus >> 3) & 0x1;
        // MPIE <- MIE, MIE <- 0
        let mut pushed = mstatus & !(1 << 3);
        pushed = (pushed & !(1 << 7)) | (mie << 7);
        // MPP <- current privilege
        pushed = (pushed & !(0x3 << 11)) | ((self.prv as u32) << 11);
        self.csrs.write(csr::MSTATUS, pushed, self.prv);
        self.prv = PrivilegeLevel::Machine;

        // Vectored interrupts land at base + 4 * cause; the -4 pairs with
        // the pc advance at the end of the step.
        let mtvec = self.csrs.peek(csr::MTVEC);
        let mut base = mtvec & !0x3;
        if mtvec & 0x1 == 1 && cause.is_interrupt() {
            base = base.wrapping_add(cause.code() << 2);
        }
        self.pc = base.wrapping_sub(4);
    }

    fn execute(
        &mut self,
        mem: &mut MemoryMap,
        word: u32,
        instruction: &Instruction,
    ) -> Result<(), MemoryError> {
        let Decoded { rd, rs1, rs2, imm } = instruction.operands;

        match instruction.opcode {
            Opcode::LUI => self.write_x(rd, imm as u32),
            Opcode::AUIPC => self.write_x(rd, self.pc.wrapping_add(imm as u32)),
            Opcode::JAL => {
                self.write_x(rd, self.pc.wrapping_add(4));
                self.pc = self.pc.wrapping_add(imm as u32).wrapping_sub(4);
            }
            Opcode::JALR => {
                let target = self.read_x(rs1).wrapping_add(imm as u32) & !1;
                let saved = self.pc.wrapping_add(4);
                self.pc = target.wrapping_sub(4);
                // rd is written last so rs1 == rd still links correctly
                self.write_x(rd, saved);
            }
            Opcode::BEQ => self.branch(imm, self.read_x(rs1) == self.read_x(rs2)),
            Opcode::BNE => self.branch(imm, self.read_x(rs1) != self.read_x(rs2)),
            Opcode::BLT => self.branch(imm, (self.read_x(rs1) as i32) < self.read_x(rs2) as i32),
            Opcode::BGE => self.branch(imm, (self.read_x(rs1) as i32) >= self.read_x(rs2) as i32),
            Opcode::BLTU => self.branch(imm, self.read_x(rs1) < self.read_x(rs2)),
            Opcode::BGEU => self.branch(imm, self.read_x(rs1) >= self.read_x(rs2)),
            Opcode::LB | Opcode::LH | Opcode::LW | Opcode::LBU | Opcode::LHU => {
                self.execute_load(mem, instruction.opcode, rd, rs1, imm)?;
            }
            Opcode::SB | Opcode::SH | Opcode::SW => {
                self.execute_store(mem, instruction.opcode, rs1, rs2, imm)?;
            }
            Opcode::ADDI => {
                let value = self.read_x(rs1).wrapping_add(imm as u32);
                self.write_x(rd, value);
            }
            Opcode::SLTI => self.write_x(rd, u32::from((self.read_x(rs1) as i32) < imm)),
            Opcode::SLTIU => self.write_x(rd, u32::from(self.read_x(rs1) < imm as u32)),
            Opcode::XORI => self.write_x(rd, self.read_x(rs1) ^ imm as u32),
            Opcode::ORI => self.write_x(rd, self.read_x(rs1) | imm as u32),
            Opcode::ANDI => self.write_x(rd, self.read_x(rs1) & imm as u32),
            Opcode::SLLI => {
                let shamt = imm as u32 & 0x1F;
                self.write_x(rd, self.read_x(rs1) << shamt);
            }
            Opcode::SRLI => {
                let shamt = imm as u32 & 0x1F;
                self.write_x(rd, self.read_x(rs1) >> shamt);
            }
            Opcode::SRAI => {
                let shamt = imm as u32 & 0x1F;
                self.write_x(rd, ((self.read_x(rs1) as i32) >> shamt) as u32);
            }
            Opcode::ADD => {
                let value = self.read_x(rs1).wrapping_add(self.read_x(rs2));
                self.write_x(rd, value);
            }
            Opcode::SUB => {
                let value = self.read_x(rs1).wrapping_sub(self.read_x(rs2));
                self.write_x(rd, value);
            }
            Opcode::SLL => {
                let shamt = self.read_x(rs2) & 0x1F;
                self.write_x(rd, self.read_x(rs1) << shamt);
            }
            Opcode::SLT => {
                self.write_x(rd, u32::from((self.read_x(rs1) as i32) < self.read_x(rs2) as i32));
            }
            Opcode::SLTU => self.write_x(rd, u32::from(self.read_x(rs1) < self.read_x(rs2))),
            Opcode::XOR => self.write_x(rd, self.read_x(rs1) ^ self.read_x(rs2)),
            Opcode::SRL => {
                let shamt = self.read_x(rs2) & 0x1F;
                self.write_x(rd, self.read_x(rs1) >> shamt);
            }
            Opcode::SRA => {
                let shamt = self.read_x(rs2) & 0x1F;
                self.write_x(rd, ((self.read_x(rs1) as i32) >> shamt) as u32);
            }
            Opcode::OR => self.write_x(rd, self.read_x(rs1) | self.read_x(rs2)),
            Opcode::AND => self.write_x(rd, self.read_x(rs1) & self.read_x(rs2)),
            Opcode::FENCE => {}
            Opcode::EBREAK => self.trap(Trap::Breakpoint, 0),
            Opcode::ECALL => match self.prv {
                PrivilegeLevel::User => self.trap(Trap::EnvironmentCallFromUMode, 0),
                PrivilegeLevel::Machine => self.trap(Trap::EnvironmentCallFromMMode, 0),
            },
            Opcode::MRET => self.execute_mret(word),
            Opcode::CSRRW
            | Opcode::CSRRS
            | Opcode::CSRRC
            | Opcode::CSRRWI
            | Opcode::CSRRSI
            | Opcode::CSRRCI => self.execute_csr(word, instruction.opcode, rd, rs1, imm),
        }

        Ok(())
    }

    fn branch(&mut self, offset: i32, taken: bool) {
        if taken {
            // -4 pairs with the pc advance at the end of the step
            self.pc = self.pc.wrapping_add(offset as u32).wrapping_sub(4);
        }
    }

    fn execute_load(
        &mut self,
        mem: &MemoryMap,
        op: Opcode,
        rd: u32,
        rs1: u32,
        imm: i32,
    ) -> Result<(), MemoryError> {
        let addr = self.read_x(rs1).wrapping_add(imm as u32);
        let word = mem.read_word_le(u64::from(align(addr)))?;
        let offset = addr % 4;

        match op {
            Opcode::LB | Opcode::LBU => {
                let byte = (word >> (offset * 8)) & 0xFF;
                let value = if op == Opcode::LB { sign_extend(byte, 8) as u32 } else { byte };
                self.write_x(rd, value);
            }
            Opcode::LH | Opcode::LHU => {
                if addr % 2 != 0 {
                    self.trap(Trap::LoadAddressMisaligned, addr);
                    return Ok(());
                }
                let mut half = (word >> (offset * 8)) & 0xFFFF;
                if offset == 3 {
                    // the halfword continues into the next word
                    let next = mem.read_word_le(u64::from(align(addr).wrapping_add(4)))?;
                    half |= (next << 8) & 0xFF00;
                }
                let value = if op == Opcode::LH { sign_extend(half, 16) as u32 } else { half };
                self.write_x(rd, value);
            }
            Opcode::LW => {
                if addr % 4 != 0 {
                    self.trap(Trap::LoadAddressMisaligned, addr);
                    return Ok(());
                }
                self.write_x(rd, word);
            }
            _ => unreachable!("not a load opcode"),
        }

        Ok(())
    }

    fn execute_store(
        &mut self,
        mem: &mut MemoryMap,
        op: Opcode,
        rs1: u32,
        rs2: u32,
        imm: i32,
    ) -> Result<(), MemoryError> {
        let addr = self.read_x(rs1).wrapping_add(imm as u32);
        let value = self.read_x(rs2);
        let offset = addr % 4;
        let base = u64::from(align(addr));

        match op {
            Opcode::SB => {
                mem.write_word_masked(base, value << (offset * 8), 0xFF << (offset * 8))?;
            }
            Opcode::SH => {
                if addr % 2 != 0 {
                    self.trap(Trap::StoreAddressMisaligned, addr);
                    return Ok(());
                }
                mem.write_word_masked(base, value << (offset * 8), 0xFFFF << (offset * 8))?;
                if offset == 3 {
                    // the high byte of the halfword lands in the next word
                    mem.write_word_masked(base + 4, (value >> 8) & 0xFF, 0xFF)?;
                }
            }
            Opcode::SW => {
                if addr % 4 != 0 {
                    self.trap(Trap::StoreAddressMisaligned, addr);
                    return Ok(());
                }
                mem.write_word_masked(base, value, 0xFFFF_FFFF)?;
            }
            _ => unreachable!("not a store opcode"),
        }

        Ok(())
    }

    fn execute_mret(&mut self, word: u32) {
        if self.prv == PrivilegeLevel::User {
            self.trap(Trap::IllegalInstruction, word);
            return;
        }

        // -4 pairs with the pc advance at the end of the step
        self.pc = self.csrs.peek(csr::MEPC).wrapping_sub(4);

        // Pop the stacks: MIE takes MPIE, MPIE sets, MPP drops to user.
        let mstatus = self.csrs.peek(csr::MSTATUS);
        let mpp = (mstatus >> 11) & 0x3;
        let mpie = (mstatus >> 7) & 0x1;
        self.prv = PrivilegeLevel::from_mpp(mpp);
        let restored = ((PrivilegeLevel::User as u32) << 11) | (1 << 7) | (mpie << 3);
        self.csrs.write(csr::MSTATUS, restored, self.prv);
    }

    /// The csr read/modify/write family. The current value is read into
    /// `rd` first, then the new value lands; on a faulting write both are
    /// rolled back before the illegal-instruction trap.
    fn execute_csr(&mut self, word: u32, op: Opcode, rd: u32, rs1: u32, imm: i32) {
        let csr_num = imm as u32 & 0xFFF;
        let previous = self.csrs.peek(csr_num);
        let saved_rd = self.read_x(rd);
        // rs1 doubles as the zero-extended immediate in the csr*i forms
        let operand = match op {
            Opcode::CSRRW | Opcode::CSRRS | Opcode::CSRRC => self.read_x(rs1),
            _ => rs1,
        };

        let outcome = match op {
            Opcode::CSRRW | Opcode::CSRRWI => self.csrs.write(csr_num, operand, self.prv),
            Opcode::CSRRS | Opcode::CSRRSI if rs1 != 0 => {
                self.csrs.write(csr_num, previous | operand, self.prv)
            }
            Opcode::CSRRC | Opcode::CSRRCI if rs1 != 0 => {
                self.csrs.write(csr_num, previous & !operand, self.prv)
            }
            _ => CsrWriteOutcome::default(),
        };
        self.write_x(rd, previous);

        if outcome.faulted() {
            self.write_x(rd, saved_rd);
            if outcome.user_mode {
                // the write landed before the fault was known; put it back
                self.csrs.write(csr_num, previous, self.prv);
            }
            self.trap(Trap::IllegalInstruction, word);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{write_program, ARITH_PROGRAM};

    fn machine() -> (Processor, MemoryMap) {
        (Processor::new(), MemoryMap::default())
    }

    fn run(processor: &mut Processor, mem: &mut MemoryMap, steps: usize) {
        for _ in 0..steps {
            processor.step(mem).unwrap();
        }
    }

    #[test]
    fn test_reset_state() {
        let processor = Processor::new();
        assert_eq!(processor.pc(), 0);
        assert_eq!(processor.instruction_count(), 0);
        assert_eq!(processor.privilege(), PrivilegeLevel::Machine);
        assert_eq!(processor.csr(csr::MIMPID).unwrap(), 0x2019_0200);
        assert_eq!(processor.csr(csr::MISA).unwrap(), 0x4010_0100);
    }

    #[test]
    fn test_arith_program() {
        let (mut processor, mut mem) = machine();
        write_program(&mut mem, &ARITH_PROGRAM);
        run(&mut processor, &mut mem, 3);
        assert_eq!(processor.reg(1).unwrap(), 5);
        assert_eq!(processor.reg(2).unwrap(), 7);
        assert_eq!(processor.reg(3).unwrap(), 12);
        assert_eq!(processor.pc(), 0xC);
        assert_eq!(processor.instruction_count(), 3);
    }

    #[test]
    fn test_x0_writes_are_discarded() {
        let (mut processor, mut mem) = machine();
        // addi x0, x0, 5
        write_program(&mut mem, &[0x0050_0013]);
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.reg(0).unwrap(), 0);

        processor.set_reg(0, 7).unwrap();
        assert_eq!(processor.reg(0).unwrap(), 0);
    }

    #[test]
    fn test_register_bounds() {
        let mut processor = Processor::new();
        assert_eq!(processor.reg(32), Err(RegisterError(32)));
        assert_eq!(processor.set_reg(40, 1), Err(RegisterError(40)));
    }

    #[test]
    fn test_lui_auipc() {
        let (mut processor, mut mem) = machine();
        // lui x10, 0xDEADB; auipc x11, 0x1000
        write_program(&mut mem, &[0xDEAD_B537, 0x0100_0597]);
        run(&mut processor, &mut mem, 2);
        assert_eq!(processor.reg(10).unwrap(), 0xDEAD_B000);
        assert_eq!(processor.reg(11).unwrap(), 0x0100_0004);
    }

    #[test]
    fn test_jal() {
        let (mut processor, mut mem) = machine();
        // jal x1, +8
        write_program(&mut mem, &[0x0080_00EF]);
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.reg(1).unwrap(), 4);
        assert_eq!(processor.pc(), 8);
    }

    #[test]
    fn test_jalr_clears_bit_zero_and_links_last() {
        let (mut processor, mut mem) = machine();
        // jalr x1, x2, 3 with x2 = 0x100
        write_program(&mut mem, &[0x0031_00E7]);
        processor.set_reg(2, 0x100).unwrap();
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.pc(), 0x102);
        assert_eq!(processor.reg(1).unwrap(), 4);

        // jalr x1, x1, 0 with x1 = 0x50: rd == rs1
        let (mut processor, mut mem) = machine();
        write_program(&mut mem, &[0x0000_80E7]);
        processor.set_reg(1, 0x50).unwrap();
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.pc(), 0x50);
        assert_eq!(processor.reg(1).unwrap(), 4);
    }

    #[test]
    fn test_branches() {
        // beq x1, x2, +8: taken
        let (mut processor, mut mem) = machine();
        write_program(&mut mem, &[0x0020_8463]);
        processor.set_reg(1, 9).unwrap();
        processor.set_reg(2, 9).unwrap();
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.pc(), 8);

        // beq not taken falls through
        let (mut processor, mut mem) = machine();
        write_program(&mut mem, &[0x0020_8463]);
        processor.set_reg(1, 9).unwrap();
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.pc(), 4);

        // blt is signed: -1 < 1
        let (mut processor, mut mem) = machine();
        // blt x1, x2, +8
        write_program(&mut mem, &[0x0020_C463]);
        processor.set_reg(1, 0xFFFF_FFFF).unwrap();
        processor.set_reg(2, 1).unwrap();
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.pc(), 8);

        // bltu is unsigned: 0xFFFF_FFFF > 1
        let (mut processor, mut mem) = machine();
        // bltu x1, x2, +8
        write_program(&mut mem, &[0x0020_E463]);
        processor.set_reg(1, 0xFFFF_FFFF).unwrap();
        processor.set_reg(2, 1).unwrap();
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.pc(), 4);
    }

    #[test]
    fn test_store_load_word_roundtrip() {
        let (mut processor, mut mem) = machine();
        // sw x2, 0(x1); lw x3, 0(x1)
        write_program(&mut mem, &[0x0020_A023, 0x0000_A183]);
        processor.set_reg(1, 0x100).unwrap();
        processor.set_reg(2, 0xDEAD_BEEF).unwrap();
        run(&mut processor, &mut mem, 2);
        assert_eq!(mem.read_word_le(0x100).unwrap(), 0xDEAD_BEEF);
        assert_eq!(processor.reg(3).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_byte_loads_extend() {
        let (mut processor, mut mem) = machine();
        mem.put_byte(0x201, 0x80).unwrap();
        // lb x3, 1(x1); lbu x4, 1(x1)
        write_program(&mut mem, &[0x0010_8183, 0x0010_C203]);
        processor.set_reg(1, 0x200).unwrap();
        run(&mut processor, &mut mem, 2);
        assert_eq!(processor.reg(3).unwrap(), 0xFFFF_FF80);
        assert_eq!(processor.reg(4).unwrap(), 0x80);
    }

    #[test]
    fn test_sb_writes_one_lane() {
        let (mut processor, mut mem) = machine();
        mem.put_bytes(0x100, &[0x11, 0x22, 0x33, 0x44]).unwrap();
        // sb x2, 1(x1)
        write_program(&mut mem, &[0x0020_80A3]);
        processor.set_reg(1, 0x100).unwrap();
        processor.set_reg(2, 0xAB).unwrap();
        run(&mut processor, &mut mem, 1);
        assert_eq!(mem.read_word_le(0x100).unwrap(), 0x4433_AB11);
    }

    #[test]
    fn test_halfword_alignment_traps() {
        let (mut processor, mut mem) = machine();
        // lh x1, 3(x0)
        write_program(&mut mem, &[0x0030_1083]);
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 4);
        assert_eq!(processor.csr(csr::MTVAL).unwrap(), 3);

        let (mut processor, mut mem) = machine();
        // sh x2, 3(x0)
        write_program(&mut mem, &[0x0020_11A3]);
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 6);
        assert_eq!(processor.csr(csr::MTVAL).unwrap(), 3);
    }

    #[test]
    fn test_word_load_alignment_traps() {
        let (mut processor, mut mem) = machine();
        // lw x3, 2(x0)
        write_program(&mut mem, &[0x0020_2183]);
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 4);
        assert_eq!(processor.csr(csr::MTVAL).unwrap(), 2);
    }

    #[test]
    fn test_halfword_roundtrip_aligned() {
        let (mut processor, mut mem) = machine();
        // sh x2, 2(x1); lh x3, 2(x1); lhu x4, 2(x1)
        write_program(&mut mem, &[0x0020_1123, 0x0020_9183, 0x0020_D203]);
        processor.set_reg(1, 0x100).unwrap();
        processor.set_reg(2, 0xFFFF_8765).unwrap();
        run(&mut processor, &mut mem, 3);
        assert_eq!(processor.reg(3).unwrap(), 0xFFFF_8765);
        assert_eq!(processor.reg(4).unwrap(), 0x8765);
        // neighbouring bytes stay untouched
        assert_eq!(mem.read_word_le(0x100).unwrap(), 0x8765_0000);
    }

    #[test]
    fn test_shifts_use_low_five_bits() {
        let (mut processor, mut mem) = machine();
        // slli x1, x2, 33 (immediate bits beyond the shamt field)
        write_program(&mut mem, &[0x0211_1093]);
        processor.set_reg(2, 1).unwrap();
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.reg(1).unwrap(), 2);

        let (mut processor, mut mem) = machine();
        // sra x3, x1, x2 with shamt 0x21 in x2
        write_program(&mut mem, &[0x4020_D1B3]);
        processor.set_reg(1, 0x8000_0000).unwrap();
        processor.set_reg(2, 0x21).unwrap();
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.reg(3).unwrap(), 0xC000_0000);
    }

    #[test]
    fn test_srai_replicates_sign() {
        let (mut processor, mut mem) = machine();
        // srai x3, x1, 4
        write_program(&mut mem, &[0x4040_D193]);
        processor.set_reg(1, 0x8000_0000).unwrap();
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.reg(3).unwrap(), 0xF800_0000);
    }

    #[test]
    fn test_comparisons() {
        let (mut processor, mut mem) = machine();
        // slt x3, x1, x2; sltu x4, x1, x2
        write_program(&mut mem, &[0x0020_A1B3, 0x0020_B233]);
        processor.set_reg(1, 0xFFFF_FFFF).unwrap();
        processor.set_reg(2, 1).unwrap();
        run(&mut processor, &mut mem, 2);
        // signed: -1 < 1; unsigned: 0xFFFF_FFFF < 1 is false
        assert_eq!(processor.reg(3).unwrap(), 1);
        assert_eq!(processor.reg(4).unwrap(), 0);
    }

    #[test]
    fn test_sltiu_one_means_is_zero() {
        let (mut processor, mut mem) = machine();
        // sltiu x3, x1, 1 twice, with x1 = 0 then x1 = 5
        write_program(&mut mem, &[0x0010_B193, 0x0010_B213]);
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.reg(3).unwrap(), 1);
        processor.set_reg(1, 5).unwrap();
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.reg(4).unwrap(), 0);
    }

    #[test]
    fn test_misaligned_fetch_traps() {
        let (mut processor, mut mem) = machine();
        processor.set_pc(2);
        processor.step(&mut mem).unwrap();
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 0);
        assert_eq!(processor.csr(csr::MTVAL).unwrap(), 2);
        // pc lands on the (direct-mode) vector
        assert_eq!(processor.pc(), 0);
        assert_eq!(processor.privilege(), PrivilegeLevel::Machine);
    }

    #[test]
    fn test_fetch_outside_window_is_an_error() {
        let (mut processor, mut mem) = machine();
        processor.set_pc(0xFFFF_FFFE);
        assert!(processor.step(&mut mem).is_err());
        // the very last word of the window still fetches
        processor.set_pc(0xFFFF_FFFC);
        assert!(processor.step(&mut mem).is_ok());
    }

    #[test]
    fn test_illegal_instruction_trap() {
        let (mut processor, mut mem) = machine();
        mem.put_bytes(0, &0xFFFF_FFFFu32.to_le_bytes()).unwrap();
        processor.step(&mut mem).unwrap();
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 2);
        assert_eq!(processor.csr(csr::MTVAL).unwrap(), 0xFFFF_FFFF);
        assert_eq!(processor.csr(csr::MEPC).unwrap(), 0);
        assert_eq!(processor.pc(), 0);
    }

    #[test]
    fn test_ebreak_counts_as_an_instruction() {
        let (mut processor, mut mem) = machine();
        write_program(&mut mem, &ARITH_PROGRAM);
        run(&mut processor, &mut mem, 4);
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 3);
        assert_eq!(processor.csr(csr::MEPC).unwrap(), 0xC);
        assert_eq!(processor.instruction_count(), 4);
    }

    #[test]
    fn test_ecall_codes_per_privilege() {
        let (mut processor, mut mem) = machine();
        write_program(&mut mem, &[0x0000_0073]);
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 11);

        // drop to user mode via mret, then ecall again
        let (mut processor, mut mem) = machine();
        // mret; ecall at the mepc target
        write_program(&mut mem, &[0x3020_0073]);
        processor.set_csr(csr::MEPC, 0x10).unwrap();
        mem.put_bytes(0x10, &0x0000_0073u32.to_le_bytes()).unwrap();
        run(&mut processor, &mut mem, 2);
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 8);
    }

    #[test]
    fn test_trap_pushes_status_and_privilege_stacks() {
        let (mut processor, mut mem) = machine();
        processor.set_csr(csr::MSTATUS, 0x8).unwrap();
        write_program(&mut mem, &[0x0000_0073]);
        run(&mut processor, &mut mem, 1);
        let mstatus = processor.csr(csr::MSTATUS).unwrap();
        // MIE cleared, MPIE holds the old MIE, MPP holds machine
        assert_eq!(mstatus & 0x8, 0);
        assert_eq!(mstatus & 0x80, 0x80);
        assert_eq!((mstatus >> 11) & 0x3, 3);
        assert_eq!(processor.privilege(), PrivilegeLevel::Machine);
    }

    #[test]
    fn test_mret_restores_pre_trap_state() {
        let (mut processor, mut mem) = machine();
        processor.set_csr(csr::MSTATUS, 0x8).unwrap();
        // ecall traps at pc 0, handler at 0 runs mret
        write_program(&mut mem, &[0x0000_0073]);
        run(&mut processor, &mut mem, 1);

        mem.clear();
        write_program(&mut mem, &[0x3020_0073]);
        run(&mut processor, &mut mem, 1);

        // both MIE and the privilege level come back
        assert_eq!(processor.csr(csr::MSTATUS).unwrap() & 0x8, 0x8);
        assert_eq!(processor.privilege(), PrivilegeLevel::Machine);
        // execution resumes at mepc
        assert_eq!(processor.pc(), 0);
    }

    #[test]
    fn test_mret_from_user_mode_is_illegal() {
        let (mut processor, mut mem) = machine();
        // mret drops to user (MPP reset value), second mret traps
        write_program(&mut mem, &[0x3020_0073]);
        processor.set_csr(csr::MEPC, 0x10).unwrap();
        mem.put_bytes(0x10, &0x3020_0073u32.to_le_bytes()).unwrap();
        run(&mut processor, &mut mem, 2);
        assert_eq!(processor.privilege(), PrivilegeLevel::Machine);
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 2);
        assert_eq!(processor.csr(csr::MTVAL).unwrap(), 0x3020_0073);
    }

    #[test]
    fn test_csrrw_machine_mode() {
        let (mut processor, mut mem) = machine();
        // csrrw x5, mscratch, x1
        write_program(&mut mem, &[0x3400_92F3]);
        processor.set_reg(1, 0xDEAD_BEEF).unwrap();
        processor.set_reg(5, 0x55).unwrap();
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.reg(5).unwrap(), 0);
        assert_eq!(processor.csr(csr::MSCRATCH).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_csrrw_user_mode_traps_and_rolls_back() {
        let (mut processor, mut mem) = machine();
        processor.set_csr(csr::MSCRATCH, 0xDEAD_BEEF).unwrap();
        // mret drops to user mode, then csrrw x5, mscratch, x1
        write_program(&mut mem, &[0x3020_0073]);
        processor.set_csr(csr::MEPC, 0x10).unwrap();
        mem.put_bytes(0x10, &0x3400_92F3u32.to_le_bytes()).unwrap();
        processor.set_reg(1, 0x1111_1111).unwrap();
        processor.set_reg(5, 0x77).unwrap();
        run(&mut processor, &mut mem, 2);

        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 2);
        assert_eq!(processor.reg(5).unwrap(), 0x77);
        assert_eq!(processor.csr(csr::MSCRATCH).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn test_csrrs_with_x0_reads_read_only_csr() {
        let (mut processor, mut mem) = machine();
        // csrrs x5, mimpid, x0: a pure read, no write attempted
        write_program(&mut mem, &[0xF130_22F3]);
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.reg(5).unwrap(), 0x2019_0200);
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 0);
    }

    #[test]
    fn test_csrrs_and_csrrc_modify_bits() {
        let (mut processor, mut mem) = machine();
        processor.set_csr(csr::MSCRATCH, 0xF0).unwrap();
        // csrrs x5, mscratch, x1; csrrc x6, mscratch, x2
        write_program(&mut mem, &[0x3400_A2F3, 0x3401_3373]);
        processor.set_reg(1, 0x0F).unwrap();
        processor.set_reg(2, 0x3C).unwrap();
        run(&mut processor, &mut mem, 2);
        assert_eq!(processor.reg(5).unwrap(), 0xF0);
        assert_eq!(processor.reg(6).unwrap(), 0xFF);
        assert_eq!(processor.csr(csr::MSCRATCH).unwrap(), 0xC3);
    }

    #[test]
    fn test_csrrwi_uses_field_as_immediate() {
        let (mut processor, mut mem) = machine();
        // csrrwi x5, mscratch, 21
        write_program(&mut mem, &[0x340A_D2F3]);
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.csr(csr::MSCRATCH).unwrap(), 21);
        assert_eq!(processor.reg(5).unwrap(), 0);
    }

    #[test]
    fn test_csr_write_to_read_only_traps() {
        let (mut processor, mut mem) = machine();
        // csrrw x5, mvendorid, x1
        write_program(&mut mem, &[0xF110_92F3]);
        processor.set_reg(5, 0x42).unwrap();
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 2);
        assert_eq!(processor.reg(5).unwrap(), 0x42);
    }

    #[test]
    fn test_csr_undefined_number_traps() {
        let (mut processor, mut mem) = machine();
        // csrrw x5, 0x7C0, x1
        write_program(&mut mem, &[0x7C00_92F3]);
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 2);
    }

    #[test]
    fn test_host_set_csr_reports_conditions() {
        let mut processor = Processor::new();
        assert_eq!(processor.set_csr(0x123, 1), Err(CsrError::InvalidCsr(0x123)));
        assert_eq!(processor.set_csr(csr::MVENDORID, 1), Err(CsrError::ReadOnlyCsr(csr::MVENDORID)));
        processor.set_csr(csr::MSCRATCH, 0xAB).unwrap();
        assert_eq!(processor.csr(csr::MSCRATCH).unwrap(), 0xAB);
    }

    #[test]
    fn test_user_software_interrupt_is_taken() {
        let (mut processor, mut mem) = machine();
        write_program(&mut mem, &ARITH_PROGRAM);
        processor.set_csr(csr::MSTATUS, 0x8).unwrap();
        processor.set_csr(csr::MIE, 0x1).unwrap();
        processor.set_csr(csr::MIP, 0x1).unwrap();
        processor.step(&mut mem).unwrap();

        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 0x8000_0000);
        assert_eq!(processor.csr(csr::MTVAL).unwrap(), 0);
        // interrupts retire no instruction
        assert_eq!(processor.instruction_count(), 0);
        // the preempted instruction never ran
        assert_eq!(processor.reg(1).unwrap(), 0);
        assert_eq!(processor.pc(), 0);
    }

    #[test]
    fn test_interrupt_gating() {
        // machine mode with MIE clear: nothing fires
        let (mut processor, mut mem) = machine();
        write_program(&mut mem, &ARITH_PROGRAM);
        processor.set_csr(csr::MIE, 0x1).unwrap();
        processor.set_csr(csr::MIP, 0x1).unwrap();
        processor.step(&mut mem).unwrap();
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 0);
        assert_eq!(processor.reg(1).unwrap(), 5);

        // user mode with MIE clear: fires
        let (mut processor, mut mem) = machine();
        write_program(&mut mem, &[0x3020_0073]);
        processor.set_csr(csr::MEPC, 0x10).unwrap();
        processor.set_csr(csr::MIE, 0x1).unwrap();
        processor.set_csr(csr::MIP, 0x1).unwrap();
        run(&mut processor, &mut mem, 2);
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 0x8000_0000);
    }

    #[test]
    fn test_interrupt_priority() {
        let (mut processor, mut mem) = machine();
        write_program(&mut mem, &ARITH_PROGRAM);
        processor.set_csr(csr::MSTATUS, 0x8).unwrap();
        // user external (8) and user software (0) both pend; external wins
        processor.set_csr(csr::MIE, 0x101).unwrap();
        processor.set_csr(csr::MIP, 0x101).unwrap();
        processor.step(&mut mem).unwrap();
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 0x8000_0008);
    }

    #[test]
    fn test_vectored_interrupt_lands_at_offset() {
        let (mut processor, mut mem) = machine();
        write_program(&mut mem, &ARITH_PROGRAM);
        processor.set_csr(csr::MTVEC, 0x101).unwrap();
        processor.set_csr(csr::MSTATUS, 0x8).unwrap();
        // user timer interrupt, cause code 4
        processor.set_csr(csr::MIE, 0x10).unwrap();
        processor.set_csr(csr::MIP, 0x10).unwrap();
        processor.step(&mut mem).unwrap();
        assert_eq!(processor.pc(), 0x110);

        // exceptions ignore the vectored mode
        let (mut processor, mut mem) = machine();
        write_program(&mut mem, &[0x0010_0073]);
        processor.set_csr(csr::MTVEC, 0x101).unwrap();
        processor.step(&mut mem).unwrap();
        assert_eq!(processor.pc(), 0x100);
    }

    #[test]
    fn test_fence_is_a_no_op() {
        let (mut processor, mut mem) = machine();
        write_program(&mut mem, &[0x0000_000F]);
        run(&mut processor, &mut mem, 1);
        assert_eq!(processor.pc(), 4);
        assert_eq!(processor.instruction_count(), 1);
        assert_eq!(processor.csr(csr::MCAUSE).unwrap(), 0);
    }
}
