//! System call numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SyscallNumber {
    // Console
    Cputs = 0,
    Cgetc = 1,

    // Environments
    GetEnvId = 2,
    EnvDestroy = 3,

    // Memory
    PageAlloc = 4,
    PageMap = 5,
    PageUnmap = 6,

    // Environment creation and control
    Exofork = 7,
    EnvSetStatus = 8,
    EnvSetPgfaultUpcall = 9,
    Yield = 10,

    // Unknown
    Unknown = usize::MAX,
}

impl From<usize> for SyscallNumber {
    fn from(num: usize) -> Self {
        match num {
            0 => Self::Cputs,
            1 => Self::Cgetc,
            2 => Self::GetEnvId,
            3 => Self::EnvDestroy,
            4 => Self::PageAlloc,
            5 => Self::PageMap,
            6 => Self::PageUnmap,
            7 => Self::Exofork,
            8 => Self::EnvSetStatus,
            9 => Self::EnvSetPgfaultUpcall,
            10 => Self::Yield,
            _ => Self::Unknown,
        }
    }
}

impl SyscallNumber {
    pub fn as_usize(self) -> usize {
        self as usize
    }
}
