use crate::elements::ResizableLimits;
use crate::func::FuncRef;
use crate::module::{check_limits, ModuleInstance, ModuleRef};
use crate::Error;
use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

/// Reference to a table (See [`TableInstance`] for details).
///
/// This reference has reference-counting semantics.
///
/// [`TableInstance`]: struct.TableInstance.html
#[derive(Clone, Debug)]
pub struct TableRef(Rc<TableInstance>);

impl ::std::ops::Deref for TableRef {
    type Target = TableInstance;
    fn deref(&self) -> &TableInstance {
        &self.0
    }
}

/// Runtime representation of a table.
///
/// A table is an array of untyped function references. It allows wasm code
/// to call functions indirectly through a dynamic index into a table, which
/// is how function pointers are expressed in WebAssembly.
///
/// A table is created with an initial size but can be grown dynamically via
/// the [`grow`] method; growth can be limited by an optional maximum size.
///
/// Functions hold only a weak back-link to their defining instance, so
/// storing an element is not enough on its own to keep a foreign instance
/// alive. When a function defined by some other instance than the table's
/// own is written into the table, the table additionally records a strong
/// handle on that source instance; the entry therefore stays callable even
/// after the embedder drops its last reference to the instance that
/// provided it.
///
/// [`grow`]: #method.grow
pub struct TableInstance {
    /// Table limits.
    limits: ResizableLimits,
    /// Table elements.
    buffer: RefCell<Vec<Option<FuncRef>>>,
    /// The instance this table was defined by, if any. Entries from the
    /// owner are not retained in `keep_alive`, which would otherwise pin
    /// the owner through its own table.
    owner: RefCell<Weak<ModuleInstance>>,
    /// Strong handles on foreign instances whose functions were written
    /// into this table.
    keep_alive: RefCell<Vec<ModuleRef>>,
}

impl fmt::Debug for TableInstance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TableInstance")
            .field("limits", &self.limits)
            .field("buffer.len", &self.buffer.borrow().len())
            .finish()
    }
}

impl TableInstance {
    /// Allocate a table instance.
    ///
    /// The table is allocated with its initial size; all elements start
    /// uninitialized.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `initial_size` is greater than `maximum_size`.
    pub fn alloc(initial_size: u32, maximum_size: Option<u32>) -> Result<TableRef, Error> {
        let table = TableInstance::new(ResizableLimits::new(initial_size, maximum_size))?;
        Ok(TableRef(Rc::new(table)))
    }

    fn new(limits: ResizableLimits) -> Result<TableInstance, Error> {
        check_limits(&limits)?;
        Ok(TableInstance {
            buffer: RefCell::new(vec![None; limits.initial() as usize]),
            limits,
            owner: RefCell::new(Weak::new()),
            keep_alive: RefCell::new(Vec::new()),
        })
    }

    /// Return table limits.
    pub(crate) fn limits(&self) -> &ResizableLimits {
        &self.limits
    }

    /// Record the instance that defined this table.
    pub(crate) fn set_owner(&self, owner: &ModuleRef) {
        *self.owner.borrow_mut() = Rc::downgrade(&owner.0);
    }

    /// Returns the size this table was created with.
    pub fn initial_size(&self) -> u32 {
        self.limits.initial()
    }

    /// Returns the maximum size this table can grow to.
    pub fn maximum_size(&self) -> Option<u32> {
        self.limits.maximum()
    }

    /// Returns the current size of the table.
    pub fn current_size(&self) -> u32 {
        self.buffer.borrow().len() as u32
    }

    /// Increases the size of the table by the given number of elements.
    ///
    /// # Errors
    ///
    /// Returns `Err` when growing past the table's maximum size.
    pub fn grow(&self, by: u32) -> Result<(), Error> {
        let mut buffer = self.buffer.borrow_mut();
        let maximum_size = self.maximum_size().unwrap_or(u32::MAX);
        let new_size = self
            .current_size()
            .checked_add(by)
            .filter(|&new_size| new_size <= maximum_size)
            .ok_or_else(|| {
                Error::Table(format!(
                    "Trying to grow table by {} items when there are already {} items",
                    by,
                    self.current_size(),
                ))
            })?;
        buffer.resize(new_size as usize, None);
        Ok(())
    }

    /// Get the element at the given index.
    pub fn get(&self, offset: u32) -> Result<Option<FuncRef>, Error> {
        let buffer = self.buffer.borrow();
        let buffer_len = buffer.len();
        let table_elem = buffer.get(offset as usize).cloned().ok_or_else(|| {
            Error::Table(format!(
                "trying to read table item with index {} when there are only {} items",
                offset, buffer_len
            ))
        })?;
        Ok(table_elem)
    }

    /// Set the element at the given index to the given function (or clear it
    /// with `None`).
    ///
    /// A function defined by a foreign instance pins that instance for the
    /// rest of the table's lifetime, so the entry remains callable.
    pub fn set(&self, offset: u32, value: Option<FuncRef>) -> Result<(), Error> {
        if let Some(ref func) = value {
            self.retain_source_instance(func);
        }

        let mut buffer = self.buffer.borrow_mut();
        let buffer_len = buffer.len();
        let table_elem = buffer.get_mut(offset as usize).ok_or_else(|| {
            Error::Table(format!(
                "trying to update table item with index {} when there are only {} items",
                offset, buffer_len
            ))
        })?;
        *table_elem = value;
        Ok(())
    }

    fn retain_source_instance(&self, func: &FuncRef) {
        // Host functions carry no instance.
        let source = match func.module() {
            Some(module) => module,
            None => return,
        };
        if let Some(owner) = self.owner.borrow().upgrade() {
            if Rc::ptr_eq(&owner, &source.0) {
                return;
            }
        }
        let mut keep_alive = self.keep_alive.borrow_mut();
        if keep_alive
            .iter()
            .any(|retained| Rc::ptr_eq(&retained.0, &source.0))
        {
            return;
        }
        keep_alive.push(source);
    }
}
