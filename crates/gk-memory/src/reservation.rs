//! Load-reserve / store-conditional reservation (`lwarx` / `stwcx.`)

use crate::constants::CACHE_LINE_SIZE;

/// The single reservation held by the CPU
///
/// The reservation covers one cache line. `stwcx.` succeeds only when the
/// line still matches and always clears the reservation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reservation {
    /// Reserved line address, `None` when no reservation is held
    line: Option<u32>,
}

impl Reservation {
    /// Create an empty reservation
    pub const fn new() -> Self {
        Self { line: None }
    }

    #[inline]
    fn line_of(address: u32) -> u32 {
        address & !(CACHE_LINE_SIZE - 1)
    }

    /// Reserve the line containing `address`
    #[inline]
    pub fn reserve(&mut self, address: u32) {
        self.line = Some(Self::line_of(address));
    }

    /// Check the reservation for a conditional store and drop it
    #[inline]
    pub fn check_and_clear(&mut self, address: u32) -> bool {
        self.line.take() == Some(Self::line_of(address))
    }

    /// Drop the reservation (exception delivery, `rfi`)
    #[inline]
    pub fn clear(&mut self) {
        self.line = None;
    }

    /// Reserved line, if any
    pub fn line(&self) -> Option<u32> {
        self.line
    }

    /// Restore a reserved line from a savestate
    pub fn set_line(&mut self, line: Option<u32>) {
        self.line = line.map(Self::line_of);
    }
}
