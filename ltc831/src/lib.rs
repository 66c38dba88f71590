#![no_std]
//! LTC831 battery stack monitor: opcodes, register layouts, register map and packet error codes.

pub mod map;
pub mod pec;
pub mod regs;

pub use map::{Descriptor, Kind};
pub use regs::{Cfg, Filter, Opcode, Status};
