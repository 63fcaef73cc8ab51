use core::fmt;

bitflags::bitflags! {
    /// Access byte of a code/data segment descriptor (bits 40..48).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessRights: u8 {
        const ACCESSED = 1 << 0;
        /// Readable (code) / writable (data).
        const READ_WRITE = 1 << 1;
        /// Conforming (code) / expand-down (data).
        const DIRECTION_CONFORMING = 1 << 2;
        const EXECUTABLE = 1 << 3;
        /// S bit: set for code/data, clear for system descriptors.
        const CODE_DATA = 1 << 4;
        const DPL_LOW = 1 << 5;
        const DPL_HIGH = 1 << 6;
        const PRESENT = 1 << 7;
    }
}

impl AccessRights {
    /// Present, data, writable, accessed. Matches what real-mode segment loads leave in the
    /// hidden descriptor cache.
    pub const REAL_MODE_DATA: Self = Self::from_bits_retain(0x93);

    #[inline]
    pub fn dpl(self) -> u8 {
        (self.bits() >> 5) & 0x3
    }

    /// Low four bits of the access byte.
    #[inline]
    pub fn segment_type(self) -> u8 {
        self.bits() & 0xF
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.contains(Self::PRESENT)
    }

    #[inline]
    pub fn is_system(self) -> bool {
        !self.contains(Self::CODE_DATA)
    }

    #[inline]
    pub fn is_code(self) -> bool {
        self.contains(Self::CODE_DATA | Self::EXECUTABLE)
    }
}

bitflags::bitflags! {
    /// High flag nibble of a descriptor (bits 52..56), shifted down to bit 0.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DescriptorFlags: u8 {
        const AVAILABLE = 1 << 0;
        const LONG = 1 << 1;
        /// D/B: 32-bit default operand size for code, 32-bit stack for SS.
        const DEFAULT_SIZE = 1 << 2;
        /// Limit is in 4KiB units.
        const GRANULARITY = 1 << 3;
    }
}

/// A segment selector: `index:13 | TI:1 | RPL:2`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Selector(pub u16);

impl Selector {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn index(self) -> u16 {
        self.0 >> 3
    }

    /// `true` when the selector refers to the LDT.
    #[inline]
    pub const fn table_indicator(self) -> bool {
        self.0 & 0x4 != 0
    }

    #[inline]
    pub const fn rpl(self) -> u8 {
        (self.0 & 0x3) as u8
    }

    #[inline]
    pub const fn with_rpl(self, rpl: u8) -> Self {
        Self((self.0 & !0x3) | (rpl as u16 & 0x3))
    }

    /// Null selectors ignore the RPL bits.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 & !0x3 == 0
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({:#06x})", self.0)
    }
}

impl From<u16> for Selector {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}

/// A decoded 8-byte code/data segment descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub base: u32,
    /// Raw 20-bit limit field.
    pub limit: u32,
    pub access: AccessRights,
    pub flags: DescriptorFlags,
}

impl Descriptor {
    pub fn parse(raw: u64) -> Self {
        let limit_low = (raw & 0xffff) as u32;
        let base_low = ((raw >> 16) & 0xffff) as u32;
        let base_mid = ((raw >> 32) & 0xff) as u32;
        let access = ((raw >> 40) & 0xff) as u8;
        let limit_high = ((raw >> 48) & 0xf) as u32;
        let flags = ((raw >> 52) & 0xf) as u8;
        let base_high = ((raw >> 56) & 0xff) as u32;

        Self {
            base: base_low | (base_mid << 16) | (base_high << 24),
            limit: limit_low | (limit_high << 16),
            access: AccessRights::from_bits_retain(access),
            flags: DescriptorFlags::from_bits_retain(flags),
        }
    }

    /// Limit in bytes after granularity scaling.
    #[inline]
    pub fn effective_limit(&self) -> u32 {
        if self.flags.contains(DescriptorFlags::GRANULARITY) {
            (self.limit << 12) | 0xfff
        } else {
            self.limit
        }
    }
}
