//! # Memory
//!
//! | Piece          | What it models                                      |
//! |----------------|-----------------------------------------------------|
//! | `Perm`         | User page permissions, copy-on-write as bit 11      |
//! | `FramePool`    | Physical 4 KiB frames with reference counts         |
//! | `AddressSpace` | One environment's page mappings and page tables     |

pub mod frames;
pub mod perm;
pub mod space;

pub use frames::FramePool;
pub use perm::Perm;
pub use space::{AddressSpace, Pte, TableLevel};
