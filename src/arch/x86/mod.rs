#[cfg(target_arch = "x86")]
pub mod asm;
pub mod idt;
pub mod interrupts;
pub mod stub;
