pub mod inventory;
pub mod job;
pub mod order;

pub use inventory::*;
pub use job::*;
pub use order::*;
