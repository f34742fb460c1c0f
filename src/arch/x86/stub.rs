//! Interrupt stub synthesis
//!
//! Every connected interrupt gets a small piece of generated code bridging the interrupt gate to
//! its handler. A full stub, with both callouts taking a parameter, looks like this:
//!
//! ```text
//! 0x00  e8 rel32    call  int_enter          inform the kernel of the interrupt
//! 0x05  68 imm32    push  boi_parameter      optional
//! 0x0a  e8 rel32    call  boi_routine        optional
//! 0x0f  68 imm32    push  isr_parameter
//! 0x14  e8 rel32    call  isr_routine
//! 0x19  68 imm32    push  eoi_parameter      optional
//! 0x1e  e8 rel32    call  eoi_routine        optional
//! 0x23  83 c4 imm8  add   esp, 4 * pushed
//! 0x26  e9 rel32    jmp   int_exit           restores context or reschedules
//! ```
//!
//! `int_exit` returns to the interrupted context by itself, so it is reached through a jump and
//! never through a call.
//!
//! No instruction cache maintenance follows the synthesis. IA-32 processors either have no
//! instruction cache or snoop stores into it, and the i486 only needs a control transfer before
//! running new code, which the interrupt gate provides. This does not hold on other
//! architectures.

use core::ffi::c_void;

use log::trace;
use pretty_hex::{HexConfig, PrettyHex};

use crate::config::CalloutSupport;

const CALL_OPCODE: u8 = 0xE8;
const JMP_OPCODE: u8 = 0xE9;
const PUSH_IMMEDIATE_OPCODE: u8 = 0x68;
/// `add r/m32, imm8` with ModR/M selecting `esp`.
const ADD_ESP_OPCODE: [u8; 2] = [0x83, 0xC4];

/// Longest stub the synthesizer can produce.
pub const INT_STUB_SIZE: usize = Instruction::CALL_LEN
    + 2 * (Instruction::PUSH_LEN + Instruction::CALL_LEN)
    + Instruction::PUSH_LEN
    + Instruction::CALL_LEN
    + Instruction::ADD_ESP_LEN
    + Instruction::JMP_LEN;

/// Memory a stub is synthesized into. It has to outlive the connection, which in practice means
/// a `static`.
pub type StubMemory = [u8; INT_STUB_SIZE];

/// Interrupt service routine taking the parameter given when connecting it.
pub type IsrRoutine = extern "C" fn(*mut c_void);

/// 32-bit linear address of code a stub transfers control to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeAddress(u32);

impl CodeAddress {
    pub const fn new(address: u32) -> Self {
        Self(address)
    }

    pub fn of_isr(routine: IsrRoutine) -> Self {
        Self(routine as usize as u32)
    }

    pub fn of_stub(stub: &StubMemory) -> Self {
        Self(stub.as_ptr() as usize as u32)
    }

    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

/// Kernel routines bracketing every interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelEntryPoints {
    /// Called first. Switches to the interrupt stack and saves the interrupted context.
    pub entry: CodeAddress,
    /// Jumped to last. Restores the interrupted context or reschedules.
    pub exit: CodeAddress,
}

impl KernelEntryPoints {
    /// The kernel's `int_enter` and `int_exit` routines.
    #[cfg(target_arch = "x86")]
    pub fn linked() -> Self {
        extern "C" {
            fn int_enter();
            fn int_exit();
        }

        Self {
            entry: CodeAddress(int_enter as usize as u32),
            exit: CodeAddress(int_exit as usize as u32),
        }
    }
}

/// Begin- or end-of-interrupt routine requested by the board's interrupt controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Callout {
    pub routine: Option<CodeAddress>,
    pub parameter: u32,
    pub needs_parameter: bool,
}

impl Callout {
    pub const NONE: Callout = Callout {
        routine: None,
        parameter: 0,
        needs_parameter: false,
    };

    pub const fn with_parameter(routine: CodeAddress, parameter: u32) -> Self {
        Self {
            routine: Some(routine),
            parameter,
            needs_parameter: true,
        }
    }

    pub const fn without_parameter(routine: CodeAddress) -> Self {
        Self {
            routine: Some(routine),
            parameter: 0,
            needs_parameter: false,
        }
    }
}

/// The few instructions a stub is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// `call rel32`, stored with its absolute target.
    Call(CodeAddress),
    /// `push imm32`
    Push(u32),
    /// `add esp, imm8`
    AddEsp(u8),
    /// `jmp rel32`, stored with its absolute target.
    Jmp(CodeAddress),
}

impl Instruction {
    pub const CALL_LEN: usize = 5;
    pub const PUSH_LEN: usize = 5;
    pub const ADD_ESP_LEN: usize = 3;
    pub const JMP_LEN: usize = 5;

    pub const fn encoded_len(&self) -> usize {
        match self {
            Instruction::Call(_) => Self::CALL_LEN,
            Instruction::Push(_) => Self::PUSH_LEN,
            Instruction::AddEsp(_) => Self::ADD_ESP_LEN,
            Instruction::Jmp(_) => Self::JMP_LEN,
        }
    }
}

/// Cursor writing instructions into stub memory that will execute at `base`.
///
/// Operands are written a byte at a time, the stub memory carries no alignment guarantee.
pub struct CodeEmitter<'a> {
    buffer: &'a mut StubMemory,
    base: u32,
    offset: usize,
}

impl<'a> CodeEmitter<'a> {
    pub fn new(buffer: &'a mut StubMemory, base: CodeAddress) -> Self {
        Self {
            buffer,
            base: base.as_u32(),
            offset: 0,
        }
    }

    pub fn current_offset(&self) -> usize {
        self.offset
    }

    /// Address the byte at `offset` executes from.
    fn address_of(&self, offset: usize) -> u32 {
        self.base.wrapping_add(offset as u32)
    }

    pub fn emit_byte(&mut self, byte: u8) {
        self.buffer[self.offset] = byte;
        self.offset += 1;
    }

    pub fn emit_u32_at(&mut self, offset: usize, value: u32) {
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn emit_u32(&mut self, value: u32) {
        self.emit_u32_at(self.offset, value);
        self.offset += 4;
    }

    pub fn emit(&mut self, instruction: Instruction) {
        match instruction {
            Instruction::Call(target) => self.emit_relative(CALL_OPCODE, target),
            Instruction::Jmp(target) => self.emit_relative(JMP_OPCODE, target),
            Instruction::Push(immediate) => {
                self.emit_byte(PUSH_IMMEDIATE_OPCODE);
                self.emit_u32(immediate);
            }
            Instruction::AddEsp(immediate) => {
                self.emit_byte(ADD_ESP_OPCODE[0]);
                self.emit_byte(ADD_ESP_OPCODE[1]);
                self.emit_byte(immediate);
            }
        }
    }

    /// Relative displacements count from the end of the instruction.
    fn emit_relative(&mut self, opcode: u8, target: CodeAddress) {
        self.emit_byte(opcode);

        let operand = self.offset;
        let next_instruction = self.address_of(operand + 4);

        self.emit_u32_at(operand, target.as_u32().wrapping_sub(next_instruction));
        self.offset += 4;
    }

    /// Emits `callout` and returns how many parameters it left on the stack.
    fn emit_callout(&mut self, callout: &Callout) -> u8 {
        match callout.routine {
            None => 0,
            Some(routine) if callout.needs_parameter => {
                self.emit(Instruction::Push(callout.parameter));
                self.emit(Instruction::Call(routine));
                1
            }
            Some(routine) => {
                self.emit(Instruction::Call(routine));
                0
            }
        }
    }
}

/// Handler and callouts a single stub dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StubRequest {
    pub routine: CodeAddress,
    pub parameter: u32,
    pub boi: Callout,
    pub eoi: Callout,
}

pub struct StubSynthesizer {
    support: CalloutSupport,
    entry_points: KernelEntryPoints,
}

impl StubSynthesizer {
    /// Callouts outside of `support` are never emitted, whatever a request asks for.
    pub const fn new(support: CalloutSupport, entry_points: KernelEntryPoints) -> Self {
        Self {
            support,
            entry_points,
        }
    }

    /// Writes the stub for `request` into `stub`, to be executed at `base`, and returns the
    /// number of bytes written.
    pub fn synthesize(
        &self,
        stub: &mut StubMemory,
        base: CodeAddress,
        request: &StubRequest,
    ) -> usize {
        let mut emitter = CodeEmitter::new(stub, base);
        // The handler's own parameter is always pushed
        let mut parameters = 1;

        emitter.emit(Instruction::Call(self.entry_points.entry));

        if self.support.contains(CalloutSupport::BOI) {
            parameters += emitter.emit_callout(&request.boi);
        }

        emitter.emit(Instruction::Push(request.parameter));
        emitter.emit(Instruction::Call(request.routine));

        if self.support.contains(CalloutSupport::EOI) {
            parameters += emitter.emit_callout(&request.eoi);
        }

        emitter.emit(Instruction::AddEsp(4 * parameters));
        emitter.emit(Instruction::Jmp(self.entry_points.exit));

        let length = emitter.current_offset();
        let code = &stub[..length];

        trace!(
            "Synthesized stub at {:#010x}: {}",
            base.as_u32(),
            code.hex_conf(stub_hex_config())
        );

        length
    }
}

/// Single line of space separated bytes, rendered without allocating.
fn stub_hex_config() -> HexConfig {
    HexConfig {
        title: false,
        ascii: false,
        width: 0,
        group: 0,
        ..HexConfig::default()
    }
}

/// Instruction decoded from stub memory, with its offset from the start of the stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub offset: usize,
    pub instruction: Instruction,
}

/// Decodes a synthesized stub executing at `base`, resolving call and jump targets.
///
/// Decoding stops after the final jump, at the end of `code`, or at a byte that is not part of
/// the stub's instruction set.
pub fn decode(code: &[u8], base: CodeAddress) -> StubInstructions<'_> {
    StubInstructions {
        code,
        base: base.as_u32(),
        offset: 0,
        done: false,
    }
}

pub struct StubInstructions<'a> {
    code: &'a [u8],
    base: u32,
    offset: usize,
    done: bool,
}

impl StubInstructions<'_> {
    fn read_u32(&self, offset: usize) -> Option<u32> {
        let bytes = self.code.get(offset..offset + 4)?;

        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn relative_target(&self, operand: usize) -> Option<CodeAddress> {
        let displacement = self.read_u32(operand)?;
        let next_instruction = self.base.wrapping_add((operand + 4) as u32);

        Some(CodeAddress(next_instruction.wrapping_add(displacement)))
    }
}

impl Iterator for StubInstructions<'_> {
    type Item = DecodedInstruction;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let offset = self.offset;
        let operand = offset + 1;

        let instruction = match *self.code.get(offset)? {
            CALL_OPCODE => Instruction::Call(self.relative_target(operand)?),
            JMP_OPCODE => Instruction::Jmp(self.relative_target(operand)?),
            PUSH_IMMEDIATE_OPCODE => Instruction::Push(self.read_u32(operand)?),
            opcode if opcode == ADD_ESP_OPCODE[0] => {
                if *self.code.get(operand)? != ADD_ESP_OPCODE[1] {
                    return None;
                }

                Instruction::AddEsp(*self.code.get(operand + 1)?)
            }
            _ => return None,
        };

        self.offset += instruction.encoded_len();
        self.done = matches!(instruction, Instruction::Jmp(_));

        Some(DecodedInstruction {
            offset,
            instruction,
        })
    }
}
