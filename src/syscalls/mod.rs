pub mod dispatcher;
pub mod handlers;
pub mod numbers;

pub use dispatcher::{SyscallContext, SyscallError, SyscallResult};
pub use numbers::SyscallNumber;
