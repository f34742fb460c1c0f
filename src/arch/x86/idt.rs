use core::ptr::NonNull;

use bitfield_struct::bitfield;
use log::debug;
use x86_64::structures::gdt::SegmentSelector;
use x86_64::PrivilegeLevel;

use crate::arch::irq::Vector;

pub const GATE_DESCRIPTOR_SIZE: usize = 8;

/// Flat kernel code segment all gates transfer control through.
pub const KERNEL_CODE_SELECTOR: SegmentSelector = SegmentSelector::new(1, PrivilegeLevel::Ring0);

/// 32-bit gate descriptor as consumed by the processor when delivering an interrupt.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct GateDescriptor {
    pub offset_low: u16,
    pub selector: u16,
    #[bits(8)]
    __: u8,
    #[bits(4, default = GateType::InterruptGate)]
    pub gate_type: GateType,
    pub storage_segment: bool,
    #[bits(2)]
    pub privilege_level: u8,
    pub present: bool,
    pub offset_high: u16,
}

impl GateDescriptor {
    /// Interrupt gate invoking `handler` with interrupts masked.
    pub const fn interrupt_gate(
        handler: u32,
        selector: SegmentSelector,
        privilege_level: PrivilegeLevel,
    ) -> Self {
        Self::new()
            .with_offset_low(handler as u16)
            .with_offset_high((handler >> 16) as u16)
            .with_selector(selector.0)
            .with_gate_type(GateType::InterruptGate)
            .with_privilege_level(privilege_level as u8)
            .with_present(true)
    }

    pub const fn handler_address(&self) -> u32 {
        ((self.offset_high() as u32) << 16) | (self.offset_low() as u32)
    }

    pub fn privilege(&self) -> PrivilegeLevel {
        PrivilegeLevel::from_u16(self.privilege_level() as u16)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateType {
    TaskGate,
    SixteenBitInterruptGate,
    SixteenBitTrapGate,
    InterruptGate,
    TrapGate,
    Reserved(u8),
}

impl GateType {
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            0x5 => Self::TaskGate,
            0x6 => Self::SixteenBitInterruptGate,
            0x7 => Self::SixteenBitTrapGate,
            0xE => Self::InterruptGate,
            0xF => Self::TrapGate,
            reserved => Self::Reserved(reserved),
        }
    }

    pub const fn into_bits(self) -> u8 {
        match self {
            GateType::TaskGate => 0x5,
            GateType::SixteenBitInterruptGate => 0x6,
            GateType::SixteenBitTrapGate => 0x7,
            GateType::InterruptGate => 0xE,
            GateType::TrapGate => 0xF,
            GateType::Reserved(bits) => bits,
        }
    }
}

/// Raw view of the interrupt descriptor table at a fixed address.
///
/// The table is not locked, entries are expected to be written before their vector can fire.
pub struct InterruptDescriptorTable {
    base: NonNull<u8>,
    code_selector: SegmentSelector,
}

// SAFETY: Writes only happen through `install`, whose contract requires exclusive access to the
// targeted entry.
unsafe impl Send for InterruptDescriptorTable {}
unsafe impl Sync for InterruptDescriptorTable {}

impl InterruptDescriptorTable {
    /// # Safety
    ///
    /// `base` must point to writable memory large enough for every vector later passed to
    /// `install` or `entry`, and stay valid for as long as the table is used.
    pub const unsafe fn from_base(base: NonNull<u8>) -> Self {
        Self {
            base,
            code_selector: KERNEL_CODE_SELECTOR,
        }
    }

    /// Table placed by the linker script at `_idt_base_address`.
    #[cfg(target_arch = "x86")]
    pub fn linked() -> Self {
        extern "C" {
            static mut _idt_base_address: [u8; 0];
        }

        unsafe {
            let base = core::ptr::addr_of_mut!(_idt_base_address).cast::<u8>();

            Self::from_base(NonNull::new_unchecked(base))
        }
    }

    pub const fn with_code_selector(mut self, code_selector: SegmentSelector) -> Self {
        self.code_selector = code_selector;
        self
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Points `vector` at `routine`. Hardware interrupts and exceptions use `Ring0`, vectors
    /// raised by user-mode software interrupts use `Ring3`.
    ///
    /// No cache maintenance is needed, the processor reads the table on every delivery.
    ///
    /// # Safety
    ///
    /// `vector` must lie within the memory handed to `from_base` and must not fire while its
    /// entry is being rewritten.
    pub unsafe fn install(&self, vector: Vector, routine: u32, privilege_level: PrivilegeLevel) {
        let descriptor =
            GateDescriptor::interrupt_gate(routine, self.code_selector, privilege_level);

        self.entry_ptr(vector).write_unaligned(descriptor.into_bits());

        debug!("IDT[{vector}] -> {routine:#010x} ({privilege_level:?})");
    }

    /// # Safety
    ///
    /// `vector` must lie within the memory handed to `from_base`.
    pub unsafe fn entry(&self, vector: Vector) -> GateDescriptor {
        GateDescriptor::from_bits(self.entry_ptr(vector).read_unaligned())
    }

    unsafe fn entry_ptr(&self, vector: Vector) -> *mut u64 {
        self.base
            .as_ptr()
            .add(vector.as_u8() as usize * GATE_DESCRIPTOR_SIZE)
            .cast::<u64>()
    }
}
