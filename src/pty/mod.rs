//! PTY (Pseudoterminal) handling
//!
//! Allocation of master/slave pairs, attachment of a child process to the
//! slave as its controlling terminal, and the handle that owns that child.

mod allocator;
mod attach;
mod child;

pub use allocator::{OpenFlags, PtyAllocator, PtyPair};
pub use attach::{ChildStep, Command, PreparedCommand, SlaveAttacher};
pub use child::{ChildProcess, ExitReport, ExitStatus};
