//! # wasmlet
//!
//! A self-contained WebAssembly 1.0 interpreter: modules are loaded in
//! binary format, validated, compiled to an internal instruction stream and
//! executed by a stack machine.
//!
//! # Introduction
//!
//! WebAssembly (wasm) is a safe, portable and compact format designed for
//! efficient execution. Wasm code is distributed in the form of modules
//! containing definitions of functions, global variables, linear memories
//! and tables; each of these can be imported and exported. Modules can also
//! carry initialization data for their memories and tables, and may declare
//! a `start` function that runs when the module is instantiated.
//!
//! ## Loading and Validation
//!
//! Before execution a module must be validated. This process checks that
//! the module is well-formed and only does allowed operations: a valid
//! module can't access memory outside its sandbox, can't cause stack
//! underflows and can only call functions with correct signatures. The same
//! pass compiles every function body into the flattened form the
//! interpreter executes.
//!
//! ## Instantiation
//!
//! To execute code from a module it must be instantiated:
//!
//! 1. An empty module instance is created.
//! 2. Each declared import is resolved to a concrete entity.
//! 3. Entities declared by the module are instantiated (memory allocated
//!    and zero-filled, table allocated, globals initialized).
//! 4. Element and data segments are copied into the table and memory.
//! 5. The `start` function, if any, is executed.
//!
//! After these steps the module instance is ready to execute functions.
//!
//! ## Execution
//!
//! Functions exported by an instance can be invoked by name. A call either
//! returns a result or traps; traps cannot be caught by wasm code and
//! surface to the embedder. There can be no linking error in the middle of
//! a function's execution — validation took care of that up front.
//!
//! # Examples
//!
//! ```rust
//! use wasmlet::{Module, ModuleInstance, ImportsBuilder, NopExternals, RuntimeValue};
//!
//! fn main() {
//!     // Assemble wasm bytecode from the text format.
//!     let wasm_binary: Vec<u8> =
//!         wat::parse_str(
//!             r#"
//!             (module
//!                 (func (export "test") (result i32)
//!                     i32.const 1337
//!                 )
//!             )
//!             "#,
//!         )
//!         .expect("failed to parse wat");
//!
//!     // Load the wasm binary and prepare it for instantiation.
//!     let module = Module::from_bytes(&wasm_binary)
//!         .expect("failed to load wasm");
//!
//!     // Instantiate the module with no imports and assert that there is
//!     // no `start` function.
//!     let instance =
//!         ModuleInstance::new(
//!             &module,
//!             &ImportsBuilder::default()
//!         )
//!         .expect("failed to instantiate wasm module")
//!         .assert_no_start();
//!
//!     // Finally, invoke the exported function "test" with no parameters
//!     // and an empty external function executor.
//!     assert_eq!(
//!         instance.invoke_export(
//!             "test",
//!             &[],
//!             &mut NopExternals,
//!         ).expect("failed to execute export"),
//!         Some(RuntimeValue::I32(1337)),
//!     );
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::len_without_is_empty)]

use std::error;
use std::fmt;

/// Error type which can be produced by wasm code or by the host environment.
///
/// Under some conditions wasm execution produces a `Trap`, which immediately
/// aborts execution. Traps can't be handled by WebAssembly code, but are
/// reported to the embedder.
#[derive(Debug)]
pub struct Trap {
    kind: TrapKind,
}

impl Trap {
    /// Create a new trap.
    pub fn new(kind: TrapKind) -> Trap {
        Trap { kind }
    }

    /// Returns the kind of this trap.
    pub fn kind(&self) -> &TrapKind {
        &self.kind
    }

    /// Converts into the kind of this trap.
    pub fn into_kind(self) -> TrapKind {
        self.kind
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Trap: {:?}", self.kind)
    }
}

impl error::Error for Trap {}

/// The kind of a [`Trap`].
///
/// [`Trap`]: struct.Trap.html
#[derive(Debug)]
pub enum TrapKind {
    /// Wasm code executed the `unreachable` opcode.
    ///
    /// `unreachable` is a special opcode which always traps upon execution;
    /// it serves a purpose similar to `ud2` on x86.
    Unreachable,

    /// Attempt to load from or store to an address outside the bounds of
    /// the memory.
    ///
    /// Since addresses are interpreted as unsigned integers, out-of-bounds
    /// access can't happen with negative addresses (they wrap instead).
    MemoryAccessOutOfBounds,

    /// Attempt to access a table element at an index that lies outside its
    /// bounds.
    ///
    /// This typically happens when `call_indirect` is executed with an
    /// out-of-range index.
    TableAccessOutOfBounds,

    /// Attempt to call through an uninitialized table element.
    ///
    /// This typically happens when `call_indirect` is executed.
    ElemUninitialized,

    /// Attempt to divide by zero.
    ///
    /// Raised by `div` and `rem` instructions with a zero divisor.
    DivisionByZero,

    /// The result of a signed integer division does not fit its type.
    ///
    /// The only such case is dividing -2<sup>N-1</sup> by -1: the result
    /// +2<sup>N-1</sup> is not representable as an N-bit signed integer.
    IntegerOverflow,

    /// A conversion to an integer failed.
    ///
    /// Raised when truncating a NaN, an infinity, or a value outside of the
    /// target type's range to an integer.
    InvalidConversionToInt,

    /// Stack overflow.
    ///
    /// Likely caused by unbounded or very deep recursion: the number of
    /// nested calls exceeded the call-stack limit.
    StackOverflow,

    /// Attempt to invoke a function with a mismatching signature.
    ///
    /// This can always happen with indirect calls: `call_indirect` states
    /// the expected signature of the callee, and calling through a table
    /// element whose function has a structurally different signature raises
    /// this trap.
    UnexpectedSignature,

    /// An error specified by the host.
    ///
    /// Typically returned from an implementation of [`Externals`].
    ///
    /// [`Externals`]: trait.Externals.html
    Host(Box<dyn host::HostError>),
}

impl TrapKind {
    /// Whether this trap was raised by the host.
    pub fn is_host(&self) -> bool {
        matches!(self, TrapKind::Host(_))
    }
}

/// Internal interpreter error.
#[derive(Debug)]
pub enum Error {
    /// Module parse or validation error. Can only occur at load time.
    Validation(String),
    /// Error while instantiating a module: a missing or mis-typed import,
    /// a segment that doesn't fit, a failing allocation, etc.
    Instantiation(String),
    /// Function-level error.
    Function(String),
    /// Table-level error.
    Table(String),
    /// Memory-level error.
    Memory(String),
    /// Global-level error.
    Global(String),
    /// Value-level error.
    Value(String),
    /// Trap.
    Trap(Trap),
    /// Custom embedder error.
    Host(Box<dyn host::HostError>),
}

impl Error {
    /// Returns a reference to a [`HostError`] if this `Error` represents
    /// some host error, i.e. if it is of variant [`Host`] or a [`Trap`] of
    /// kind [`TrapKind::Host`].
    ///
    /// [`HostError`]: trait.HostError.html
    /// [`Host`]: enum.Error.html#variant.Host
    /// [`Trap`]: enum.Error.html#variant.Trap
    /// [`TrapKind::Host`]: enum.TrapKind.html#variant.Host
    pub fn as_host_error(&self) -> Option<&dyn host::HostError> {
        match self {
            Error::Host(host_err) => Some(&**host_err),
            Error::Trap(Trap {
                kind: TrapKind::Host(host_err),
            }) => Some(&**host_err),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Validation(ref s) => write!(f, "Validation: {}", s),
            Error::Instantiation(ref s) => write!(f, "Instantiation: {}", s),
            Error::Function(ref s) => write!(f, "Function: {}", s),
            Error::Table(ref s) => write!(f, "Table: {}", s),
            Error::Memory(ref s) => write!(f, "Memory: {}", s),
            Error::Global(ref s) => write!(f, "Global: {}", s),
            Error::Value(ref s) => write!(f, "Value: {}", s),
            Error::Trap(ref s) => write!(f, "Trap: {:?}", s),
            Error::Host(ref e) => write!(f, "User: {}", e),
        }
    }
}

impl error::Error for Error {}

impl<U> From<U> for Error
where
    U: host::HostError + Sized,
{
    fn from(e: U) -> Self {
        Error::Host(Box::new(e))
    }
}

impl<U> From<U> for Trap
where
    U: host::HostError + Sized,
{
    fn from(e: U) -> Self {
        Trap::new(TrapKind::Host(Box::new(e)))
    }
}

impl From<Trap> for Error {
    fn from(e: Trap) -> Error {
        Error::Trap(e)
    }
}

impl From<TrapKind> for Trap {
    fn from(e: TrapKind) -> Trap {
        Trap::new(e)
    }
}

impl From<elements::Error> for Error {
    fn from(e: elements::Error) -> Error {
        Error::Validation(e.to_string())
    }
}

impl From<validation::Error> for Error {
    fn from(e: validation::Error) -> Error {
        Error::Validation(e.to_string())
    }
}

mod common;
pub mod elements;
mod func;
mod global;
mod host;
mod imports;
mod isa;
mod memory;
mod module;
pub mod nan_preserving_float;
mod runner;
mod table;
mod types;
mod validation;
mod value;

#[cfg(test)]
mod tests;

pub use self::elements::ValueType;
pub use self::func::{FuncInstance, FuncRef};
pub use self::global::{GlobalInstance, GlobalRef};
pub use self::host::{Externals, HostError, NopExternals, RuntimeArgs};
pub use self::imports::{ImportResolver, ImportsBuilder, ModuleImportResolver};
pub use self::memory::{MemoryInstance, MemoryRef, LINEAR_MEMORY_PAGE_SIZE};
pub use self::module::{ExternVal, ModuleInstance, ModuleRef, NotStartedModuleRef};
pub use self::runner::{StackRecycler, DEFAULT_CALL_STACK_LIMIT, DEFAULT_VALUE_STACK_LIMIT};
pub use self::table::{TableInstance, TableRef};
pub use self::types::{GlobalDescriptor, MemoryDescriptor, Signature, TableDescriptor};
pub use self::value::{Error as ValueError, FromRuntimeValue, LittleEndianConvert, RuntimeValue};

/// WebAssembly-specific sizes and units.
pub mod memory_units {
    pub use memory_units::wasm32::*;
    pub use memory_units::{size_of, ByteSize, Bytes, RoundUpTo};
}

/// A deserialized and validated module, ready for instantiation.
///
/// Every function body has already been compiled to the internal
/// instruction stream; instantiating the module only binds it to concrete
/// memories, tables, globals and imports.
#[derive(Debug)]
pub struct Module {
    code_map: Vec<isa::Instructions>,
    module: elements::Module,
}

impl Module {
    /// Create a `Module` from an already decoded [`elements::Module`].
    ///
    /// This validates the module and compiles its code.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the module is not valid.
    pub fn from_elements(module: elements::Module) -> Result<Module, Error> {
        let validation::CompiledModule { code_map } = validation::validate_module(&module)?;

        Ok(Module { code_map, module })
    }

    /// Create a `Module` from the bytes of a binary wasm module.
    ///
    /// This decodes the module, validates it and prepares it for
    /// instantiation.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the buffer is not a valid wasm binary.
    ///
    /// # Examples
    ///
    /// ```rust
    /// fn main() {
    ///     let module =
    ///         wasmlet::Module::from_bytes(
    ///             // Minimal module:
    ///             //   \0asm - magic
    ///             //    0x01 - version (in little-endian)
    ///             &[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00]
    ///         ).expect("Failed to load minimal module");
    ///
    ///     // Instantiate `module`, etc...
    /// }
    /// ```
    pub fn from_bytes<B: AsRef<[u8]>>(bytes: B) -> Result<Module, Error> {
        let module = elements::Module::parse(bytes.as_ref())?;
        Module::from_elements(module)
    }

    pub(crate) fn module(&self) -> &elements::Module {
        &self.module
    }

    pub(crate) fn code(&self) -> &[isa::Instructions] {
        &self.code_map
    }
}
