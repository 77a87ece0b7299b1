use crate::elements::ResizableLimits;
use crate::value::LittleEndianConvert;
use crate::Error;
use crate::memory_units::{Bytes, Pages, RoundUpTo};
use std::cell::RefCell;
use std::cmp;
use std::fmt;
use std::ops::Range;
use std::rc::Rc;

/// Size of a page of [linear memory][`MemoryInstance`] - 64KiB.
///
/// The size of a memory is always an integer multiple of a page size.
///
/// [`MemoryInstance`]: struct.MemoryInstance.html
pub const LINEAR_MEMORY_PAGE_SIZE: Bytes = Bytes(65536);

/// Maximal number of pages (4 GiB).
const LINEAR_MEMORY_MAX_PAGES: Pages = Pages(65536);

/// Number of pages a memory without a declared maximum may grow to
/// (256 MiB).
const LINEAR_MEMORY_DEFAULT_PAGES_LIMIT: Pages = Pages(4096);

/// Reference to a memory (See [`MemoryInstance`] for details).
///
/// This reference has reference-counting semantics.
///
/// [`MemoryInstance`]: struct.MemoryInstance.html
#[derive(Clone, Debug)]
pub struct MemoryRef(Rc<MemoryInstance>);

impl ::std::ops::Deref for MemoryRef {
    type Target = MemoryInstance;
    fn deref(&self) -> &MemoryInstance {
        &self.0
    }
}

/// Runtime representation of a linear memory (or `memory` for short).
///
/// A memory is a contiguous, mutable array of raw bytes. Wasm code can load
/// and store values from/to a linear memory at any byte address. A trap
/// occurs if an access is not within the bounds of the current memory size.
///
/// A memory is created zero-filled with an initial size and can be grown
/// dynamically in page (64 KiB) granularity. Growth is bounded by the
/// declared maximum, or by a default page limit when no maximum was
/// declared. Wasm doesn't provide any way to shrink a memory.
///
/// Growing reallocates the buffer: no raw pointer into memory obtained
/// before a grow may be used after it. All accesses go through this type,
/// which re-borrows the buffer each time.
pub struct MemoryInstance {
    /// Memory limits.
    limits: ResizableLimits,
    /// Linear memory buffer; its length is the current memory size and is
    /// always a whole number of pages.
    buffer: RefCell<Vec<u8>>,
    initial: Pages,
    maximum: Option<Pages>,
}

impl fmt::Debug for MemoryInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryInstance")
            .field("limits", &self.limits)
            .field("buffer.len", &self.buffer.borrow().len())
            .field("maximum", &self.maximum)
            .field("initial", &self.initial)
            .finish()
    }
}

struct CheckedRegion {
    offset: usize,
    size: usize,
}

impl CheckedRegion {
    fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }
}

impl MemoryInstance {
    /// Allocate a memory instance.
    ///
    /// The memory is allocated zero-filled, with the number of pages
    /// specified by `initial`. The minimal possible value for `initial` is 0
    /// and the maximum possible is `65536` (since 65536 * 64KiB is the full
    /// 4GiB address range).
    ///
    /// It is possible to limit the number of pages this memory can grow to
    /// by specifying `maximum`; without it, growth is bounded by the default
    /// page limit.
    ///
    /// # Errors
    ///
    /// Returns `Err` if:
    ///
    /// - `initial` is greater than `maximum`
    /// - either `initial` or `maximum` is greater than `65536`.
    pub fn alloc(initial: Pages, maximum: Option<Pages>) -> Result<MemoryRef, Error> {
        validate_memory(initial, maximum).map_err(Error::Memory)?;

        let memory = MemoryInstance::new(initial, maximum);
        Ok(MemoryRef(Rc::new(memory)))
    }

    fn new(initial: Pages, maximum: Option<Pages>) -> Self {
        let limits = ResizableLimits::new(initial.0 as u32, maximum.map(|p| p.0 as u32));

        let initial_size: Bytes = initial.into();
        MemoryInstance {
            limits,
            buffer: RefCell::new(vec![0; initial_size.0]),
            initial,
            maximum,
        }
    }

    /// Return linear memory limits.
    pub(crate) fn limits(&self) -> &ResizableLimits {
        &self.limits
    }

    /// Returns the number of pages this `MemoryInstance` was created with.
    pub fn initial(&self) -> Pages {
        self.initial
    }

    /// Returns the maximum number of pages this `MemoryInstance` can grow
    /// to, or `None` if no limit was declared.
    ///
    /// Memory size cannot exceed `65536` pages or 4GiB.
    pub fn maximum(&self) -> Option<Pages> {
        self.maximum
    }

    /// Returns the current linear memory size.
    ///
    /// # Example
    ///
    /// To convert a number of pages to a number of bytes:
    ///
    /// ```rust
    /// use wasmlet::MemoryInstance;
    /// use wasmlet::memory_units::*;
    ///
    /// let memory = MemoryInstance::alloc(Pages(1), None).unwrap();
    /// let byte_size: Bytes = memory.current_size().into();
    /// assert_eq!(byte_size, Bytes(65536));
    /// ```
    pub fn current_size(&self) -> Pages {
        Bytes(self.buffer.borrow().len()).round_up_to()
    }

    /// Get a value from memory at the given offset.
    pub fn get_value<T: LittleEndianConvert>(&self, offset: u32) -> Result<T, Error> {
        let buffer = self.buffer.borrow();
        let region = self.checked_region(&buffer, offset as usize, ::std::mem::size_of::<T>())?;
        Ok(T::from_little_endian(&buffer[region.range()]).expect("slice size is checked"))
    }

    /// Copy data from memory at the given offset into a fresh vector.
    ///
    /// If you can provide a mutable slice, use [`get_into`] instead.
    ///
    /// [`get_into`]: #method.get_into
    pub fn get(&self, offset: u32, size: usize) -> Result<Vec<u8>, Error> {
        let buffer = self.buffer.borrow();
        let region = self.checked_region(&buffer, offset as usize, size)?;

        Ok(buffer[region.range()].to_vec())
    }

    /// Copy data from the given offset in the memory into the `target`
    /// slice.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the specified region is out of bounds.
    pub fn get_into(&self, offset: u32, target: &mut [u8]) -> Result<(), Error> {
        let buffer = self.buffer.borrow();
        let region = self.checked_region(&buffer, offset as usize, target.len())?;

        target.copy_from_slice(&buffer[region.range()]);

        Ok(())
    }

    /// Copy data into the memory at the given offset.
    pub fn set(&self, offset: u32, value: &[u8]) -> Result<(), Error> {
        let mut buffer = self.buffer.borrow_mut();
        let range = self
            .checked_region(&buffer, offset as usize, value.len())?
            .range();

        buffer[range].copy_from_slice(value);

        Ok(())
    }

    /// Copy a value into the memory at the given offset.
    pub fn set_value<T: LittleEndianConvert>(&self, offset: u32, value: T) -> Result<(), Error> {
        let mut buffer = self.buffer.borrow_mut();
        let range = self
            .checked_region(&buffer, offset as usize, ::std::mem::size_of::<T>())?
            .range();
        value.into_little_endian(&mut buffer[range]);
        Ok(())
    }

    /// Increases the size of the linear memory by the given number of pages.
    /// Returns the previous memory size on success.
    ///
    /// On failure the memory is left unchanged. Growing by 0 pages succeeds
    /// and does not reallocate.
    ///
    /// # Errors
    ///
    /// Returns `Err` when growing past the declared maximum, or past the
    /// default page limit when no maximum was declared.
    pub fn grow(&self, additional: Pages) -> Result<Pages, Error> {
        let size_before_grow: Pages = self.current_size();

        if additional == Pages(0) {
            return Ok(size_before_grow);
        }
        if additional > LINEAR_MEMORY_MAX_PAGES {
            return Err(Error::Memory(
                "Trying to grow memory by more than 65536 pages".to_string(),
            ));
        }

        let new_size: Pages = size_before_grow + additional;
        let maximum = cmp::min(
            self.maximum.unwrap_or(LINEAR_MEMORY_DEFAULT_PAGES_LIMIT),
            LINEAR_MEMORY_MAX_PAGES,
        );
        if new_size > maximum {
            return Err(Error::Memory(format!(
                "Trying to grow memory by {} pages when already have {}",
                additional.0, size_before_grow.0,
            )));
        }

        log::trace!(
            "growing memory from {} to {} pages",
            size_before_grow.0,
            new_size.0
        );
        let new_buffer_length: Bytes = new_size.into();
        self.buffer.borrow_mut().resize(new_buffer_length.0, 0);
        Ok(size_before_grow)
    }

    fn checked_region(
        &self,
        buffer: &[u8],
        offset: usize,
        size: usize,
    ) -> Result<CheckedRegion, Error> {
        let end = offset.checked_add(size).ok_or_else(|| {
            Error::Memory(format!(
                "trying to access memory block of size {} from offset {}",
                size, offset
            ))
        })?;

        if end > buffer.len() {
            return Err(Error::Memory(format!(
                "trying to access region [{}..{}] in memory [0..{}]",
                offset,
                end,
                buffer.len()
            )));
        }

        Ok(CheckedRegion { offset, size })
    }

    /// Provides direct access to the underlying memory buffer.
    ///
    /// # Panics
    ///
    /// Any call that requires write access to memory made within the closure
    /// will panic.
    pub fn with_direct_access<R, F: FnOnce(&[u8]) -> R>(&self, f: F) -> R {
        let buf = self.buffer.borrow();
        f(&buf)
    }

    /// Provides direct mutable access to the underlying memory buffer.
    ///
    /// # Panics
    ///
    /// Any call that requires read or write access to memory made within
    /// the closure will panic.
    pub fn with_direct_access_mut<R, F: FnOnce(&mut [u8]) -> R>(&self, f: F) -> R {
        let mut buf = self.buffer.borrow_mut();
        f(&mut buf)
    }
}

pub fn validate_memory(initial: Pages, maximum: Option<Pages>) -> Result<(), String> {
    if initial > LINEAR_MEMORY_MAX_PAGES {
        return Err(format!(
            "initial memory size must be at most {} pages",
            LINEAR_MEMORY_MAX_PAGES.0
        ));
    }
    if let Some(maximum) = maximum {
        if initial > maximum {
            return Err(format!(
                "maximum limit {} is less than minimum {}",
                maximum.0, initial.0,
            ));
        }
        if maximum > LINEAR_MEMORY_MAX_PAGES {
            return Err(format!(
                "maximum memory size must be at most {} pages",
                LINEAR_MEMORY_MAX_PAGES.0
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_zero_fills() {
        let memory = MemoryInstance::alloc(Pages(1), None).unwrap();
        assert_eq!(memory.get(0, 65536).unwrap(), vec![0; 65536]);
    }

    #[test]
    fn alloc_validates_limits() {
        assert!(MemoryInstance::alloc(Pages(2), Some(Pages(1))).is_err());
        assert!(MemoryInstance::alloc(Pages(65537), None).is_err());
        assert!(MemoryInstance::alloc(Pages(0), Some(Pages(65537))).is_err());
    }

    #[test]
    fn size_is_page_granular() {
        let memory = MemoryInstance::alloc(Pages(1), None).unwrap();
        assert_eq!(memory.current_size(), Pages(1));
        memory.grow(Pages(2)).unwrap();
        assert_eq!(memory.current_size(), Pages(3));
        let bytes: Bytes = memory.current_size().into();
        assert_eq!(bytes.0 % LINEAR_MEMORY_PAGE_SIZE.0, 0);
    }

    #[test]
    fn grow_returns_previous_size() {
        let memory = MemoryInstance::alloc(Pages(1), Some(Pages(4))).unwrap();
        assert_eq!(memory.grow(Pages(2)).unwrap(), Pages(1));
        assert_eq!(memory.grow(Pages(1)).unwrap(), Pages(3));
        assert!(memory.grow(Pages(1)).is_err());
        // Failure leaves the size unchanged.
        assert_eq!(memory.current_size(), Pages(4));
    }

    #[test]
    fn grow_by_zero_does_not_allocate() {
        let memory = MemoryInstance::alloc(Pages(1), Some(Pages(1))).unwrap();
        assert_eq!(memory.grow(Pages(0)).unwrap(), Pages(1));
        assert_eq!(memory.current_size(), Pages(1));
    }

    #[test]
    fn grow_respects_default_limit() {
        let memory = MemoryInstance::alloc(Pages(1), None).unwrap();
        // No declared maximum: the default page limit applies.
        assert!(memory.grow(Pages(4096)).is_err());
        assert_eq!(memory.grow(Pages(4095)).unwrap(), Pages(1));
    }

    #[test]
    fn value_roundtrip_and_bounds() {
        let memory = MemoryInstance::alloc(Pages(1), None).unwrap();
        memory.set_value(100, 0xDEAD_BEEF_u32 as i32).unwrap();
        assert_eq!(memory.get_value::<i32>(100).unwrap(), 0xDEAD_BEEF_u32 as i32);

        // Crossing the end of the last page fails and writes nothing.
        assert!(memory.set_value(65535, 0xDEAD_BEEF_u32 as i32).is_err());
        assert!(memory.get_value::<i32>(65533).is_err());
        assert_eq!(memory.get_value::<u8>(65535).unwrap(), 0);
    }
}
