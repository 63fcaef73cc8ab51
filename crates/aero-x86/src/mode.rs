/// Processor operating mode as seen by instruction decode.
///
/// Protected mode is split by the code segment's D flag since it fixes the default operand and
/// address size of every instruction in the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuMode {
    Real,
    Virtual8086,
    Protected16,
    Protected32,
}

impl CpuMode {
    pub const ALL: [CpuMode; 4] = [
        CpuMode::Real,
        CpuMode::Virtual8086,
        CpuMode::Protected16,
        CpuMode::Protected32,
    ];

    pub fn bitness(self) -> u32 {
        match self {
            CpuMode::Real | CpuMode::Virtual8086 | CpuMode::Protected16 => 16,
            CpuMode::Protected32 => 32,
        }
    }

    pub fn ip_mask(self) -> u32 {
        match self.bitness() {
            16 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            CpuMode::Real => 0,
            CpuMode::Virtual8086 => 1,
            CpuMode::Protected16 => 2,
            CpuMode::Protected32 => 3,
        }
    }
}
