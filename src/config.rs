use crate::memlayout::{NCPU, NENV};

/// Runtime sizing of a kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Physical frames available to environments (page tables included).
    pub frames: usize,
    /// Environment slots, at most `NENV`.
    pub envs: usize,
    /// Cores taking traps, at most `NCPU`.
    pub cpus: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            frames: 512,
            envs: NENV,
            cpus: 1,
        }
    }
}

impl KernelConfig {
    pub fn with_frames(frames: usize) -> Self {
        Self {
            frames,
            ..Self::default()
        }
    }

    /// Clamp to the compile-time limits.
    pub fn normalized(self) -> Self {
        Self {
            frames: self.frames,
            envs: self.envs.clamp(1, NENV),
            cpus: self.cpus.clamp(1, NCPU),
        }
    }
}
