use std::ops::Range;

/// Read access to the stack of the thread being unwound.
///
/// Reads return `Err(())` when the address is not readable; the unwinder turns
/// that into [`Error::CouldNotReadStack`](crate::Error::CouldNotReadStack).
/// Any `Fn(u64) -> Result<u64, ()>` closure can be used directly.
pub trait StackMemory {
    fn read_u64(&self, address: u64) -> Result<u64, ()>;

    fn read_u128(&self, address: u64) -> Result<u128, ()> {
        let low = self.read_u64(address)?;
        let high = self.read_u64(address.checked_add(8).ok_or(())?)?;
        Ok(u128::from(low) | (u128::from(high) << 64))
    }
}

impl<F> StackMemory for F
where
    F: Fn(u64) -> Result<u64, ()>,
{
    fn read_u64(&self, address: u64) -> Result<u64, ()> {
        self(address)
    }
}

/// A stack image held in memory: `words[i]` lives at `base + 8 * i`.
///
/// Only 8-byte aligned reads inside the image succeed.
#[derive(Clone, Debug, Default)]
pub struct SliceStack {
    base: u64,
    words: Vec<u64>,
}

impl SliceStack {
    pub fn new(base: u64, words: Vec<u64>) -> Self {
        Self { base, words }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// One past the highest address of the image.
    pub fn end(&self) -> u64 {
        self.base.saturating_add((self.words.len() as u64).saturating_mul(8))
    }

    pub fn address_range(&self) -> Range<u64> {
        self.base..self.end()
    }

    /// Overwrites the word at `address`. Returns false if it is outside the image.
    pub fn write_u64(&mut self, address: u64, value: u64) -> bool {
        match self.index_of(address) {
            Some(index) => {
                self.words[index] = value;
                true
            }
            None => false,
        }
    }

    fn index_of(&self, address: u64) -> Option<usize> {
        let offset = address.checked_sub(self.base)?;
        if offset % 8 != 0 {
            return None;
        }
        let index = usize::try_from(offset / 8).ok()?;
        (index < self.words.len()).then_some(index)
    }
}

impl StackMemory for SliceStack {
    fn read_u64(&self, address: u64) -> Result<u64, ()> {
        self.index_of(address).map(|i| self.words[i]).ok_or(())
    }
}

/// The address range a thread's stack may legally occupy.
///
/// A kernel stack can be expanded into a separately allocated extent; when a
/// frame is found in the previous extent the limits switch over to it, so the
/// walk can continue on the older stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackLimits {
    low: u64,
    high: u64,
    previous: Option<(u64, u64)>,
}

impl StackLimits {
    /// `low` is the lowest valid address, `high` the stack base (exclusive).
    pub fn new(low: u64, high: u64) -> Self {
        Self {
            low,
            high,
            previous: None,
        }
    }

    pub fn with_previous_extent(mut self, low: u64, high: u64) -> Self {
        self.previous = Some((low, high));
        self
    }

    pub fn low(&self) -> u64 {
        self.low
    }

    pub fn high(&self) -> u64 {
        self.high
    }

    /// Checks that `frame` is 8-byte aligned and inside the current limits,
    /// switching to the previous stack extent when that is where it lies.
    pub fn contains_frame(&mut self, frame: u64) -> bool {
        if frame & 0x7 != 0 {
            return false;
        }
        if (self.low..self.high).contains(&frame) {
            return true;
        }
        match self.previous {
            Some((low, high)) if (low..high).contains(&frame) => {
                self.low = low;
                self.high = high;
                self.previous = None;
                true
            }
            _ => false,
        }
    }
}
