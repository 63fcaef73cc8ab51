use aero_segment::{
    AddressTranslation, DescriptorTableSegment, IllegalSegmentOperation, Segment,
    SegmentAccessError, SegmentFault, StandardSegment,
};
use aero_x86::{CodeBlock, CpuMode, DecodeContext, DecodeDispatcher, DecodeError, DispatchConfig};
use memory::{GuestMemory, GuestMemoryError};
use thiserror::Error;
use tracing::debug;

/// #UD vector.
pub const VECTOR_INVALID_OPCODE: u8 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// No decoder accepted the bytes at CS:EIP.
    #[error("invalid opcode at eip {eip:#x} (linear {linear:#x})")]
    InvalidOpcode { eip: u32, linear: u64 },
    #[error(transparent)]
    Fault(#[from] SegmentFault),
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
    #[error(transparent)]
    IllegalSegmentOperation(#[from] IllegalSegmentOperation),
}

impl StepError {
    /// Exception vector to deliver, or `None` for host-side errors.
    pub fn vector(&self) -> Option<u8> {
        match self {
            StepError::InvalidOpcode { .. } => Some(VECTOR_INVALID_OPCODE),
            StepError::Fault(fault) => Some(fault.vector()),
            StepError::Memory(_) | StepError::IllegalSegmentOperation(_) => None,
        }
    }
}

impl From<SegmentAccessError> for StepError {
    fn from(err: SegmentAccessError) -> Self {
        match err {
            SegmentAccessError::Fault(fault) => StepError::Fault(fault),
            SegmentAccessError::Memory(err) => StepError::Memory(err),
        }
    }
}

/// The processor side of instruction fetch.
///
/// Tracks the operating mode, CS and EIP, and asks a [`DecodeDispatcher`] for the block at CS:EIP.
/// Executing the block and updating architectural state beyond EIP is left to the caller.
#[derive(Debug)]
pub struct FetchCpu<M> {
    memory: M,
    mode: CpuMode,
    cs: Segment,
    eip: u32,
    dispatcher: DecodeDispatcher,
}

impl<M: GuestMemory> FetchCpu<M> {
    /// Real mode with CS=0, EIP=0.
    pub fn new(memory: M, config: DispatchConfig) -> Self {
        Self::with_dispatcher(memory, DecodeDispatcher::new(config))
    }

    pub fn with_dispatcher(memory: M, dispatcher: DecodeDispatcher) -> Self {
        Self {
            memory,
            mode: CpuMode::Real,
            cs: Segment::Standard(StandardSegment::real_mode(0)),
            eip: 0,
            dispatcher,
        }
    }

    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Writing through this does not invalidate blocks the caller has already fetched.
    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    pub fn into_memory(self) -> M {
        self.memory
    }

    pub fn mode(&self) -> CpuMode {
        self.mode
    }

    pub fn eip(&self) -> u32 {
        self.eip
    }

    pub fn set_eip(&mut self, eip: u32) {
        self.eip = eip & self.mode.ip_mask();
    }

    pub fn code_segment(&self) -> &Segment {
        &self.cs
    }

    /// Far jump in real or virtual-8086 mode: CS is rebuilt from the selector.
    pub fn jump_real(&mut self, selector: u16, ip: u16) -> Result<(), StepError> {
        self.cs.set_selector(selector)?;
        self.eip = u32::from(ip);
        Ok(())
    }

    /// Switch to virtual-8086 mode at `selector:ip`.
    pub fn enter_virtual8086(&mut self, selector: u16, ip: u16) {
        self.mode = CpuMode::Virtual8086;
        self.cs = Segment::Standard(StandardSegment::virtual8086(selector));
        self.eip = u32::from(ip);
    }

    /// Far jump into protected mode through `gdt` (and `ldt` for TI=1 selectors).
    ///
    /// The new mode follows the descriptor's D flag. A null selector is `#GP(0)`.
    pub fn jump_protected(
        &mut self,
        gdt: &DescriptorTableSegment,
        ldt: Option<&DescriptorTableSegment>,
        selector: u16,
        eip: u32,
    ) -> Result<(), StepError> {
        let cs = Segment::load_protected(gdt, ldt, &self.memory, selector)?;
        if matches!(cs, Segment::Null(_)) {
            return Err(SegmentFault::GeneralProtection { code: 0 }.into());
        }
        let mode = if cs.default_size_flag()? {
            CpuMode::Protected32
        } else {
            CpuMode::Protected16
        };
        debug!(selector, ?mode, base = cs.base(), limit = cs.limit(), "loaded CS");
        self.cs = cs;
        self.mode = mode;
        self.eip = eip & mode.ip_mask();
        Ok(())
    }

    /// Decode the block at CS:EIP.
    pub fn fetch_block(&self) -> Result<CodeBlock, StepError> {
        match self.dispatcher.decode_at(self) {
            Ok(Some(block)) => Ok(block),
            Ok(None) | Err(DecodeError::Abort(_)) => Err(StepError::InvalidOpcode {
                eip: self.eip,
                linear: u64::from(self.cs.base().wrapping_add(self.eip)),
            }),
            Err(DecodeError::Fault(fault)) => Err(fault.into()),
            Err(DecodeError::Memory(err)) => Err(err.into()),
        }
    }

    /// Fetch the block at CS:EIP and move EIP past it.
    ///
    /// Branch targets are not followed; this is the fall-through path only.
    pub fn step(&mut self) -> Result<CodeBlock, StepError> {
        let block = self.fetch_block()?;
        self.eip = block.fallthrough_ip();
        Ok(block)
    }
}

impl<M: GuestMemory> DecodeContext for FetchCpu<M> {
    fn memory(&self) -> &dyn GuestMemory {
        &self.memory
    }

    fn mode(&self) -> CpuMode {
        self.mode
    }

    fn code_segment(&self) -> &Segment {
        &self.cs
    }

    fn instruction_pointer(&self) -> u32 {
        self.eip
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memory::DenseMemory;

    #[test]
    fn vectors() {
        let ud = StepError::InvalidOpcode { eip: 0, linear: 0 };
        assert_eq!(ud.vector(), Some(6));
        let gp: StepError = SegmentFault::GeneralProtection { code: 0 }.into();
        assert_eq!(gp.vector(), Some(13));
        let mem: StepError = GuestMemoryError::SizeTooLarge { size: 0 }.into();
        assert_eq!(mem.vector(), None);
    }

    #[test]
    fn eip_is_masked_to_mode_width() {
        let mut cpu = FetchCpu::new(DenseMemory::new(0x100).unwrap(), DispatchConfig::default());
        cpu.set_eip(0x1_2345);
        assert_eq!(cpu.eip(), 0x2345);
    }

    #[test]
    fn jump_real_rebuilds_cs() {
        let mut cpu = FetchCpu::new(DenseMemory::new(0x100).unwrap(), DispatchConfig::default());
        cpu.jump_real(0x1234, 0x10).unwrap();
        assert_eq!(cpu.code_segment().base(), 0x12340);
        assert_eq!(cpu.eip(), 0x10);
    }
}
