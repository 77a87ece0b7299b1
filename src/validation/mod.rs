//! Module validation and compilation.
//!
//! [`validate_module`] performs the cross-section checks of a decoded module
//! and runs every function body through the single-pass validator/compiler
//! in [`func`], producing the internal code of each function. A module that
//! passes is safe to instantiate and run; the interpreter relies on the
//! invariants established here instead of re-checking them.

use crate::common::stack;
use crate::elements::{
    BlockType, External, GlobalEntry, GlobalType, InitExpr, Internal, MemoryType, Module,
    TableType, ValueType,
};
use crate::isa;
use crate::memory::validate_memory;
use crate::memory_units::Pages;
use std::collections::HashSet;
use std::error;
use std::fmt;

mod context;
mod func;
mod util;

#[cfg(test)]
mod tests;

pub use self::context::{ModuleContext, ModuleContextBuilder};
use self::func::FunctionReader;

#[derive(Debug)]
pub struct Error(pub String);

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl error::Error for Error {}

impl From<stack::Error> for Error {
    fn from(e: stack::Error) -> Error {
        Error(format!("Stack: {}", e))
    }
}

/// The outcome of validation: the compiled body of every defined function,
/// in function-section order.
pub struct CompiledModule {
    pub code_map: Vec<isa::Instructions>,
}

/// Checks a decoded module against the constraints that span sections and
/// compiles every function body.
///
/// The first violation aborts validation; no partial result is returned.
pub fn validate_module(module: &Module) -> Result<CompiledModule, Error> {
    let mut context_builder = ModuleContextBuilder::new();
    let mut imported_globals = Vec::new();

    // Types are copied from the module as-is.
    context_builder.set_types(module.types().to_vec());

    // Fill the index spaces with imported entities first.
    for import_entry in module.imports() {
        match *import_entry.external() {
            External::Function(type_idx) => {
                if module.types().get(type_idx as usize).is_none() {
                    return Err(Error(format!(
                        "Function import {} refers to non-existent type {}",
                        import_entry.field(),
                        type_idx
                    )));
                }
                context_builder.push_func_type_index(type_idx);
            }
            External::Table(ref table) => {
                validate_table_type(table)?;
                context_builder.push_table(*table);
            }
            External::Memory(ref memory) => {
                validate_memory_type(memory)?;
                context_builder.push_memory(*memory);
            }
            External::Global(ref global) => {
                if global.is_mutable() {
                    return Err(Error(format!(
                        "trying to import mutable global {}",
                        import_entry.field()
                    )));
                }
                context_builder.push_global(*global);
                imported_globals.push(*global);
            }
        }
    }

    // Then the entities defined in the module itself.
    for func_entry in module.functions() {
        if module.types().get(func_entry.type_ref() as usize).is_none() {
            return Err(Error(format!(
                "Function refers to non-existent type {}",
                func_entry.type_ref()
            )));
        }
        context_builder.push_func_type_index(func_entry.type_ref());
    }
    for table_entry in module.tables() {
        validate_table_type(table_entry)?;
        context_builder.push_table(*table_entry);
    }
    for memory_entry in module.memories() {
        validate_memory_type(memory_entry)?;
        context_builder.push_memory(*memory_entry);
    }
    for global_entry in module.globals() {
        validate_global_entry(global_entry, &imported_globals)?;
        context_builder.push_global(*global_entry.global_type());
    }

    let context = context_builder.build();

    // At most one table and one memory, counting imported and defined
    // together; this also rules out having both an import and a definition.
    if context.tables().len() > 1 {
        return Err(Error(format!(
            "too many tables in index space: {}",
            context.tables().len()
        )));
    }
    if context.memories().len() > 1 {
        return Err(Error(format!(
            "too many memory regions in index space: {}",
            context.memories().len()
        )));
    }

    let function_section_len = module.functions().len();
    let code_section_len = module.code().len();
    if function_section_len != code_section_len {
        return Err(Error(format!(
            "length of function section is {}, while len of code section is {}",
            function_section_len, code_section_len
        )));
    }

    // Validate and compile every function body.
    let mut code_map = Vec::with_capacity(code_section_len);
    for (index, (func_entry, body)) in module
        .functions()
        .iter()
        .zip(module.code())
        .enumerate()
    {
        let code = FunctionReader::read_function(&context, func_entry, body).map_err(|e| {
            let Error(ref msg) = e;
            Error(format!("Function #{} validation error: {}", index, msg))
        })?;
        code_map.push(code);
    }

    // The start function must exist and have type [] -> [].
    if let Some(start_fn_idx) = module.start_section() {
        let (params, return_ty) = context.require_function(start_fn_idx)?;
        if return_ty != BlockType::NoResult || !params.is_empty() {
            return Err(Error(
                "start function expected to have type [] -> []".into(),
            ));
        }
    }

    // Export names are unique and export indices in range. Mutable globals
    // cannot be exported.
    let mut export_names = HashSet::with_capacity(module.exports().len());
    for export in module.exports() {
        if !export_names.insert(export.field()) {
            return Err(Error(format!("duplicate export {}", export.field())));
        }
        match *export.internal() {
            Internal::Function(function_index) => {
                context.require_function(function_index)?;
            }
            Internal::Global(global_index) => {
                context.require_global(global_index, Some(false))?;
            }
            Internal::Memory(memory_index) => {
                context.require_memory(memory_index)?;
            }
            Internal::Table(table_index) => {
                context.require_table(table_index)?;
            }
        }
    }

    // Data segments require a memory and an i32-typed offset expression.
    for data_segment in module.data_segments() {
        context.require_memory(data_segment.index())?;
        let init_ty = expr_const_type(data_segment.offset(), context.globals())?;
        if init_ty != ValueType::I32 {
            return Err(Error("segment offset should return I32".into()));
        }
    }

    // Element segments require a table, an i32-typed offset expression and
    // in-range function indices.
    for element_segment in module.element_segments() {
        context.require_table(element_segment.index())?;

        let init_ty = expr_const_type(element_segment.offset(), context.globals())?;
        if init_ty != ValueType::I32 {
            return Err(Error("segment offset should return I32".into()));
        }

        for function_index in element_segment.members() {
            context.require_function(*function_index)?;
        }
    }

    Ok(CompiledModule { code_map })
}

fn validate_limits(initial: u32, maximum: Option<u32>) -> Result<(), Error> {
    if let Some(maximum) = maximum {
        if initial > maximum {
            return Err(Error(format!(
                "maximum limit {} is less than minimum {}",
                maximum, initial
            )));
        }
    }
    Ok(())
}

fn validate_memory_type(memory_type: &MemoryType) -> Result<(), Error> {
    let initial: Pages = Pages(memory_type.limits().initial() as usize);
    let maximum: Option<Pages> = memory_type.limits().maximum().map(|m| Pages(m as usize));
    validate_memory(initial, maximum).map_err(Error)
}

fn validate_table_type(table_type: &TableType) -> Result<(), Error> {
    validate_limits(table_type.limits().initial(), table_type.limits().maximum())
}

fn validate_global_entry(global_entry: &GlobalEntry, globals: &[GlobalType]) -> Result<(), Error> {
    // Only imported globals are in scope for initializer expressions; they
    // are known constant by the time instantiation evaluates them.
    let init_expr_ty = expr_const_type(global_entry.init_expr(), globals)?;
    if init_expr_ty != global_entry.global_type().content_type() {
        return Err(Error(format!(
            "Trying to initialize variable of type {:?} with value of type {:?}",
            global_entry.global_type().content_type(),
            init_expr_ty
        )));
    }
    Ok(())
}

/// Returns the type produced by a constant expression.
fn expr_const_type(init_expr: &InitExpr, globals: &[GlobalType]) -> Result<ValueType, Error> {
    match *init_expr {
        InitExpr::I32(_) => Ok(ValueType::I32),
        InitExpr::I64(_) => Ok(ValueType::I64),
        InitExpr::F32(_) => Ok(ValueType::F32),
        InitExpr::F64(_) => Ok(ValueType::F64),
        InitExpr::Global(idx) => match globals.get(idx as usize) {
            Some(target_global) => {
                if target_global.is_mutable() {
                    return Err(Error(format!("Global {} is mutable", idx)));
                }
                Ok(target_global.content_type())
            }
            None => Err(Error(format!(
                "Global {} doesn't exist or is not an import",
                idx
            ))),
        },
    }
}
