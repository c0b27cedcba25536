use std::fmt::Debug;
use std::ops::{Deref, Range};

use crate::runtime_function::{RawRuntimeFunction, RuntimeFunction};
use crate::x86_64::{UnwindInfo, UnwindInfoError};

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageError {
    #[error("RVA 0x{0:x} is outside the image")]
    RvaOutOfRange(u32),

    #[error("function table at RVA 0x{0:x} with {1} entries is outside the image")]
    FunctionTableOutOfRange(u32, usize),
}

/// A loaded image: its mapped bytes and where its function table lives.
///
/// `image[0]` is the byte at `base_address`; every RVA the function table and
/// unwind info refer to is an offset into `image`.
pub struct Module<D: Deref<Target = [u8]>> {
    name: String,
    address_range: Range<u64>,
    base_address: u64,
    image: D,
    /// RVA range of the sorted `RUNTIME_FUNCTION` array.
    function_table: Range<u32>,
}

impl<D: Deref<Target = [u8]>> Debug for Module<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("address_range", &self.address_range)
            .finish()
    }
}

impl<D: Deref<Target = [u8]>> Module<D> {
    pub fn new(name: String, base_address: u64, image: D, function_table: Range<u32>) -> Self {
        let address_range = base_address..base_address.saturating_add(image.len() as u64);
        Self {
            name,
            address_range,
            base_address,
            image,
            function_table,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address_range(&self) -> &Range<u64> {
        &self.address_range
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    pub fn view(&self) -> ImageView<'_> {
        ImageView::new(self.base_address, &self.image)
    }

    /// The function table entries, sorted by begin address.
    pub(crate) fn function_table(&self) -> Result<&[RawRuntimeFunction], ImageError> {
        let start = self.function_table.start;
        let count = self.function_table.len() / RawRuntimeFunction::SIZE;
        RawRuntimeFunction::parse_table(&self.image, start.into(), count)
            .ok_or(ImageError::FunctionTableOutOfRange(start, count))
    }
}

/// Borrowed access to the bytes of an image by RVA.
#[derive(Clone, Copy)]
pub struct ImageView<'a> {
    base: u64,
    data: &'a [u8],
}

impl<'a> ImageView<'a> {
    pub fn new(base: u64, data: &'a [u8]) -> Self {
        Self { base, data }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// The bytes from `rva` to the end of the image.
    pub fn bytes_at_rva(&self, rva: u32) -> Result<&'a [u8], ImageError> {
        self.data
            .get(rva as usize..)
            .ok_or(ImageError::RvaOutOfRange(rva))
    }

    /// The bytes in `[start, end)`.
    pub fn bytes_in(&self, start: u32, end: u32) -> Result<&'a [u8], ImageError> {
        self.data
            .get(start as usize..end as usize)
            .ok_or(ImageError::RvaOutOfRange(end))
    }

    pub fn runtime_function_at(&self, rva: u32) -> Result<RuntimeFunction, ImageError> {
        RawRuntimeFunction::parse(self.data, rva.into()).ok_or(ImageError::RvaOutOfRange(rva))
    }

    pub fn unwind_info(&self, rva: u32) -> Result<UnwindInfo<'a>, UnwindInfoError> {
        UnwindInfo::parse(self.data, rva)
    }

    /// The RVA of `address`, if it falls inside the image.
    pub fn rva_of(&self, address: u64) -> Option<u32> {
        let offset = address.checked_sub(self.base)?;
        if offset < self.data.len() as u64 {
            u32::try_from(offset).ok()
        } else {
            None
        }
    }
}
