use memory::GuestMemory;

use crate::descriptor::{AccessRights, Descriptor, DescriptorFlags, Selector};
use crate::fault::{IllegalSegmentOperation, SegmentAccessError, SegmentFault};

/// Offset-to-linear translation shared by every segment variant.
///
/// Offsets and limits are unsigned 32-bit quantities. Translation wraps at 4GiB, matching how
/// 32-bit linear addresses are formed.
pub trait AddressTranslation {
    fn base(&self) -> u32;
    fn limit(&self) -> u32;
    fn is_present(&self) -> bool;
    fn is_system(&self) -> bool;

    /// Raise #GP tagged with `offset` if it lies beyond the limit.
    #[inline]
    fn check_address(&self, offset: u32) -> Result<(), SegmentFault> {
        if offset > self.limit() {
            return Err(SegmentFault::GeneralProtection { code: offset });
        }
        Ok(())
    }

    #[inline]
    fn translate_address_read(&self, offset: u32) -> Result<u32, SegmentFault> {
        self.check_address(offset)?;
        Ok(self.base().wrapping_add(offset))
    }

    #[inline]
    fn translate_address_write(&self, offset: u32) -> Result<u32, SegmentFault> {
        self.check_address(offset)?;
        Ok(self.base().wrapping_add(offset))
    }

    /// Translate a `len`-byte access, checking both its first and last byte.
    fn translate_span(&self, offset: u32, len: u32, write: bool) -> Result<u32, SegmentFault> {
        let last = offset
            .checked_add(len.saturating_sub(1))
            .ok_or(SegmentFault::GeneralProtection { code: offset })?;
        self.check_address(last)?;
        if write {
            self.translate_address_write(offset)
        } else {
            self.translate_address_read(offset)
        }
    }

    fn read_u8(&self, mem: &dyn GuestMemory, offset: u32) -> Result<u8, SegmentAccessError> {
        let linear = self.translate_span(offset, 1, false)?;
        Ok(mem.read_u8_le(u64::from(linear))?)
    }

    fn read_u16(&self, mem: &dyn GuestMemory, offset: u32) -> Result<u16, SegmentAccessError> {
        let linear = self.translate_span(offset, 2, false)?;
        Ok(mem.read_u16_le(u64::from(linear))?)
    }

    fn read_u32(&self, mem: &dyn GuestMemory, offset: u32) -> Result<u32, SegmentAccessError> {
        let linear = self.translate_span(offset, 4, false)?;
        Ok(mem.read_u32_le(u64::from(linear))?)
    }

    fn write_u8(
        &self,
        mem: &mut dyn GuestMemory,
        offset: u32,
        value: u8,
    ) -> Result<(), SegmentAccessError> {
        let linear = self.translate_span(offset, 1, true)?;
        Ok(mem.write_u8_le(u64::from(linear), value)?)
    }

    fn write_u16(
        &self,
        mem: &mut dyn GuestMemory,
        offset: u32,
        value: u16,
    ) -> Result<(), SegmentAccessError> {
        let linear = self.translate_span(offset, 2, true)?;
        Ok(mem.write_u16_le(u64::from(linear), value)?)
    }

    fn write_u32(
        &self,
        mem: &mut dyn GuestMemory,
        offset: u32,
        value: u32,
    ) -> Result<(), SegmentAccessError> {
        let linear = self.translate_span(offset, 4, true)?;
        Ok(mem.write_u32_le(u64::from(linear), value)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Real,
    Virtual8086,
    Protected,
}

/// A segment loaded into a segment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardSegment {
    kind: SegmentKind,
    selector: Selector,
    base: u32,
    limit: u32,
    access: AccessRights,
    flags: DescriptorFlags,
}

impl StandardSegment {
    pub fn real_mode(selector: u16) -> Self {
        Self {
            kind: SegmentKind::Real,
            selector: Selector(selector),
            base: u32::from(selector) << 4,
            limit: 0xFFFF,
            access: AccessRights::REAL_MODE_DATA,
            flags: DescriptorFlags::empty(),
        }
    }

    /// Virtual-8086 segments have real-mode geometry but run at privilege level 3.
    pub fn virtual8086(selector: u16) -> Self {
        Self {
            kind: SegmentKind::Virtual8086,
            access: AccessRights::REAL_MODE_DATA | AccessRights::DPL_LOW | AccessRights::DPL_HIGH,
            ..Self::real_mode(selector)
        }
    }

    /// Build a protected-mode segment from an already-fetched descriptor.
    ///
    /// Raises #GP(selector) for system descriptors and #NP(selector) when the descriptor is not
    /// present.
    pub fn from_descriptor(selector: Selector, raw: u64) -> Result<Self, SegmentFault> {
        let desc = Descriptor::parse(raw);
        if desc.access.is_system() {
            return Err(SegmentFault::GeneralProtection {
                code: u32::from(selector.0 & !0x3),
            });
        }
        if !desc.access.is_present() {
            return Err(SegmentFault::NotPresent {
                selector: selector.0,
            });
        }
        Ok(Self {
            kind: SegmentKind::Protected,
            selector,
            base: desc.base,
            limit: desc.effective_limit(),
            access: desc.access,
            flags: desc.flags,
        })
    }

    pub(crate) fn from_parts(
        kind: SegmentKind,
        selector: Selector,
        base: u32,
        limit: u32,
        access: AccessRights,
        flags: DescriptorFlags,
    ) -> Self {
        Self {
            kind,
            selector,
            base,
            limit,
            access,
            flags,
        }
    }

    pub fn kind(&self) -> SegmentKind {
        self.kind
    }

    pub fn selector(&self) -> Selector {
        self.selector
    }

    /// Reload the segment register with `selector`.
    ///
    /// Real and virtual-8086 segments are recomputed from the selector. Protected-mode selectors
    /// can only be loaded through a descriptor table.
    pub fn set_selector(&mut self, selector: u16) -> Result<(), IllegalSegmentOperation> {
        *self = match self.kind {
            SegmentKind::Real => Self::real_mode(selector),
            SegmentKind::Virtual8086 => Self::virtual8086(selector),
            SegmentKind::Protected => {
                return Err(IllegalSegmentOperation {
                    operation: "set_selector",
                    variant: "protected-mode",
                })
            }
        };
        Ok(())
    }

    pub fn dpl(&self) -> u8 {
        match self.kind {
            SegmentKind::Real => 0,
            SegmentKind::Virtual8086 => 3,
            SegmentKind::Protected => self.access.dpl(),
        }
    }

    pub fn rpl(&self) -> u8 {
        match self.kind {
            SegmentKind::Real => 0,
            SegmentKind::Virtual8086 => 3,
            SegmentKind::Protected => self.selector.rpl(),
        }
    }

    /// Only protected-mode selectors carry a meaningful RPL field.
    pub fn set_rpl(&mut self, rpl: u8) -> Result<(), IllegalSegmentOperation> {
        if self.kind != SegmentKind::Protected {
            return Err(IllegalSegmentOperation {
                operation: "set_rpl",
                variant: self.kind_name(),
            });
        }
        self.selector = self.selector.with_rpl(rpl);
        Ok(())
    }

    /// D/B flag: `true` for 32-bit default operand size.
    pub fn default_size_flag(&self) -> bool {
        self.kind == SegmentKind::Protected && self.flags.contains(DescriptorFlags::DEFAULT_SIZE)
    }

    pub fn segment_type(&self) -> u8 {
        self.access.segment_type()
    }

    pub fn access(&self) -> AccessRights {
        self.access
    }

    pub fn flags(&self) -> DescriptorFlags {
        self.flags
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            SegmentKind::Real => "real-mode",
            SegmentKind::Virtual8086 => "virtual-8086",
            SegmentKind::Protected => "protected-mode",
        }
    }
}

impl AddressTranslation for StandardSegment {
    fn base(&self) -> u32 {
        self.base
    }

    fn limit(&self) -> u32 {
        self.limit
    }

    fn is_present(&self) -> bool {
        self.access.is_present()
    }

    fn is_system(&self) -> bool {
        self.access.is_system()
    }
}

/// A GDT or LDT, addressed directly by base and limit.
///
/// Descriptor tables have no selector, privilege level, operand size or type of their own, so
/// this type simply does not offer those accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTableSegment {
    base: u32,
    limit: u32,
}

impl DescriptorTableSegment {
    pub const fn new(base: u32, limit: u32) -> Self {
        Self { base, limit }
    }

    /// Fetch the raw 8-byte descriptor referenced by `selector`.
    ///
    /// An entry extending past the table limit raises #GP with the selector (RPL cleared) as the
    /// error code.
    pub fn descriptor(
        &self,
        mem: &dyn GuestMemory,
        selector: Selector,
    ) -> Result<u64, SegmentAccessError> {
        let offset = u32::from(selector.index()) * 8;
        let fault = SegmentFault::GeneralProtection {
            code: u32::from(selector.0 & !0x3),
        };
        let last = offset.checked_add(7).ok_or(fault)?;
        if last > self.limit {
            return Err(fault.into());
        }
        let linear = self.base.wrapping_add(offset);
        Ok(mem.read_u64_le(u64::from(linear))?)
    }
}

impl AddressTranslation for DescriptorTableSegment {
    fn base(&self) -> u32 {
        self.base
    }

    fn limit(&self) -> u32 {
        self.limit
    }

    fn is_present(&self) -> bool {
        true
    }

    fn is_system(&self) -> bool {
        true
    }
}

/// The segment left behind by loading a null selector. Every access through it faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NullSegment;

impl NullSegment {
    pub fn selector(&self) -> Selector {
        Selector::NULL
    }
}

impl AddressTranslation for NullSegment {
    fn base(&self) -> u32 {
        0
    }

    fn limit(&self) -> u32 {
        0
    }

    fn is_present(&self) -> bool {
        false
    }

    fn is_system(&self) -> bool {
        false
    }

    fn check_address(&self, _offset: u32) -> Result<(), SegmentFault> {
        Err(SegmentFault::GeneralProtection { code: 0 })
    }
}

/// Any segment a register or table slot can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Standard(StandardSegment),
    DescriptorTable(DescriptorTableSegment),
    Null(NullSegment),
}

impl Segment {
    /// Load a protected-mode segment register from the GDT or LDT.
    ///
    /// A null selector yields [`Segment::Null`]; whether a null load is legal for a particular
    /// register is the caller's decision.
    pub fn load_protected(
        gdt: &DescriptorTableSegment,
        ldt: Option<&DescriptorTableSegment>,
        mem: &dyn GuestMemory,
        selector: u16,
    ) -> Result<Self, SegmentAccessError> {
        let selector = Selector(selector);
        if selector.is_null() {
            return Ok(Segment::Null(NullSegment));
        }
        let table = if selector.table_indicator() {
            ldt.ok_or(SegmentFault::GeneralProtection {
                code: u32::from(selector.0 & !0x3),
            })?
        } else {
            gdt
        };
        let raw = table.descriptor(mem, selector)?;
        Ok(Segment::Standard(StandardSegment::from_descriptor(
            selector, raw,
        )?))
    }

    pub fn variant_name(&self) -> &'static str {
        match self {
            Segment::Standard(seg) => seg.kind_name(),
            Segment::DescriptorTable(_) => "descriptor-table",
            Segment::Null(_) => "null",
        }
    }

    fn illegal(&self, operation: &'static str) -> IllegalSegmentOperation {
        IllegalSegmentOperation {
            operation,
            variant: self.variant_name(),
        }
    }

    pub fn selector(&self) -> Result<Selector, IllegalSegmentOperation> {
        match self {
            Segment::Standard(seg) => Ok(seg.selector()),
            Segment::Null(seg) => Ok(seg.selector()),
            Segment::DescriptorTable(_) => Err(self.illegal("selector")),
        }
    }

    pub fn set_selector(&mut self, selector: u16) -> Result<(), IllegalSegmentOperation> {
        let illegal = self.illegal("set_selector");
        match self {
            Segment::Standard(seg) => seg.set_selector(selector),
            _ => Err(illegal),
        }
    }

    pub fn dpl(&self) -> Result<u8, IllegalSegmentOperation> {
        match self {
            Segment::Standard(seg) => Ok(seg.dpl()),
            _ => Err(self.illegal("dpl")),
        }
    }

    pub fn rpl(&self) -> Result<u8, IllegalSegmentOperation> {
        match self {
            Segment::Standard(seg) => Ok(seg.rpl()),
            Segment::Null(seg) => Ok(seg.selector().rpl()),
            Segment::DescriptorTable(_) => Err(self.illegal("rpl")),
        }
    }

    pub fn set_rpl(&mut self, rpl: u8) -> Result<(), IllegalSegmentOperation> {
        let illegal = self.illegal("set_rpl");
        match self {
            Segment::Standard(seg) => seg.set_rpl(rpl),
            _ => Err(illegal),
        }
    }

    pub fn default_size_flag(&self) -> Result<bool, IllegalSegmentOperation> {
        match self {
            Segment::Standard(seg) => Ok(seg.default_size_flag()),
            _ => Err(self.illegal("default_size_flag")),
        }
    }

    pub fn segment_type(&self) -> Result<u8, IllegalSegmentOperation> {
        match self {
            Segment::Standard(seg) => Ok(seg.segment_type()),
            _ => Err(self.illegal("segment_type")),
        }
    }
}

impl AddressTranslation for Segment {
    fn base(&self) -> u32 {
        match self {
            Segment::Standard(seg) => seg.base(),
            Segment::DescriptorTable(seg) => seg.base(),
            Segment::Null(seg) => seg.base(),
        }
    }

    fn limit(&self) -> u32 {
        match self {
            Segment::Standard(seg) => seg.limit(),
            Segment::DescriptorTable(seg) => seg.limit(),
            Segment::Null(seg) => seg.limit(),
        }
    }

    fn is_present(&self) -> bool {
        match self {
            Segment::Standard(seg) => seg.is_present(),
            Segment::DescriptorTable(seg) => seg.is_present(),
            Segment::Null(seg) => seg.is_present(),
        }
    }

    fn is_system(&self) -> bool {
        match self {
            Segment::Standard(seg) => seg.is_system(),
            Segment::DescriptorTable(seg) => seg.is_system(),
            Segment::Null(seg) => seg.is_system(),
        }
    }

    fn check_address(&self, offset: u32) -> Result<(), SegmentFault> {
        match self {
            Segment::Standard(seg) => seg.check_address(offset),
            Segment::DescriptorTable(seg) => seg.check_address(offset),
            Segment::Null(seg) => seg.check_address(offset),
        }
    }
}

impl From<StandardSegment> for Segment {
    fn from(seg: StandardSegment) -> Self {
        Segment::Standard(seg)
    }
}

impl From<DescriptorTableSegment> for Segment {
    fn from(seg: DescriptorTableSegment) -> Self {
        Segment::DescriptorTable(seg)
    }
}
