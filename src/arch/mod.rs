pub mod irq;
pub mod x86;
