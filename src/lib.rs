//! Peripheral I/O layer of an Altair 8800 style simulator: the port
//! dispatcher and the devices behind it, with the tape controller of the
//! 18-bit machines and a Telnet terminal multiplexor.

pub mod config;
pub mod error;
pub mod io;
pub mod utils;
pub mod vm;
