//! Translation attribute flags

use bitflags::bitflags;

bitflags! {
    /// Attributes attached to a BAT lookup entry or a translated page
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        /// Entry maps the effective page
        const MAPPED          = 0b0001;
        /// Target lies in RAM, so the fastmem path may serve it
        const RAM             = 0b0010;
        /// Write-through or cache-inhibited (WIMG W or I set)
        const WRITE_THROUGH   = 0b0100;
        /// Guarded storage (WIMG G set)
        const GUARDED         = 0b1000;
        /// Cache-inhibited (WIMG I set)
        const CACHE_INHIBITED = 0b1_0000;

        /// Mapped RAM page eligible for fastmem
        const FASTMEM = Self::MAPPED.bits() | Self::RAM.bits();
    }
}

impl PageFlags {
    /// Derive caching attributes from a WIMG nibble
    pub fn from_wimg(wimg: u32) -> Self {
        let mut flags = Self::empty();
        if wimg & 0b1100 != 0 {
            flags |= Self::WRITE_THROUGH;
        }
        if wimg & 0b0100 != 0 {
            flags |= Self::CACHE_INHIBITED;
        }
        if wimg & 0b0001 != 0 {
            flags |= Self::GUARDED;
        }
        flags
    }

    /// True when a fast host access may serve this entry
    pub fn is_fastmem(self) -> bool {
        self.contains(Self::FASTMEM) && !self.contains(Self::WRITE_THROUGH)
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
