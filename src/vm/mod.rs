pub mod memory;
pub mod runtime;
pub mod scheduler;
