use super::{
    Error, FunctionType, GlobalType, Instructions, Local, MemoryType, Reader, TableType,
};

const MAGIC: &[u8; 4] = b"\0asm";
const VERSION: u32 = 1;

const SECTION_CUSTOM: u8 = 0;
const SECTION_TYPE: u8 = 1;
const SECTION_IMPORT: u8 = 2;
const SECTION_FUNCTION: u8 = 3;
const SECTION_TABLE: u8 = 4;
const SECTION_MEMORY: u8 = 5;
const SECTION_GLOBAL: u8 = 6;
const SECTION_EXPORT: u8 = 7;
const SECTION_START: u8 = 8;
const SECTION_ELEMENT: u8 = 9;
const SECTION_CODE: u8 = 10;
const SECTION_DATA: u8 = 11;

/// An entry of the function section: the index of the function's type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Func {
    type_ref: u32,
}

impl Func {
    pub fn type_ref(&self) -> u32 {
        self.type_ref
    }
}

/// What an import provides.
#[derive(Clone, Debug, PartialEq)]
pub enum External {
    Function(u32),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

/// One entry of the import section.
#[derive(Clone, Debug, PartialEq)]
pub struct ImportEntry {
    module: String,
    field: String,
    external: External,
}

impl ImportEntry {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn external(&self) -> &External {
        &self.external
    }

    fn parse(reader: &mut Reader) -> Result<ImportEntry, Error> {
        let module = reader.read_string()?;
        let field = reader.read_string()?;
        let external = match reader.read_byte()? {
            0x00 => External::Function(reader.read_var_u32()?),
            0x01 => External::Table(TableType::parse(reader)?),
            0x02 => External::Memory(MemoryType::parse(reader)?),
            0x03 => External::Global(GlobalType::parse(reader)?),
            other => return Err(Error::UnknownImportKind(other)),
        };
        Ok(ImportEntry {
            module,
            field,
            external,
        })
    }
}

/// What an export refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Internal {
    Function(u32),
    Table(u32),
    Memory(u32),
    Global(u32),
}

/// One entry of the export section.
#[derive(Clone, Debug, PartialEq)]
pub struct ExportEntry {
    field: String,
    internal: Internal,
}

impl ExportEntry {
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn internal(&self) -> &Internal {
        &self.internal
    }

    fn parse(reader: &mut Reader) -> Result<ExportEntry, Error> {
        let field = reader.read_string()?;
        let internal = match reader.read_byte()? {
            0x00 => Internal::Function(reader.read_var_u32()?),
            0x01 => Internal::Table(reader.read_var_u32()?),
            0x02 => Internal::Memory(reader.read_var_u32()?),
            0x03 => Internal::Global(reader.read_var_u32()?),
            other => return Err(Error::UnknownExportKind(other)),
        };
        Ok(ExportEntry { field, internal })
    }
}

/// A constant expression: one constant-producing instruction followed by
/// `end`. Used for global initializers and segment offsets.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum InitExpr {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    Global(u32),
}

impl InitExpr {
    fn parse(reader: &mut Reader) -> Result<InitExpr, Error> {
        let expr = match reader.read_byte()? {
            0x41 => InitExpr::I32(reader.read_var_i32()?),
            0x42 => InitExpr::I64(reader.read_var_i64()?),
            0x43 => InitExpr::F32(reader.read_f32_bits()?),
            0x44 => InitExpr::F64(reader.read_f64_bits()?),
            0x23 => InitExpr::Global(reader.read_var_u32()?),
            _ => return Err(Error::InvalidInitExpr),
        };
        // `end` terminates the expression.
        if reader.read_byte()? != 0x0B {
            return Err(Error::InvalidInitExpr);
        }
        Ok(expr)
    }
}

/// One entry of the global section: its type plus the initializer.
#[derive(Clone, Debug, PartialEq)]
pub struct GlobalEntry {
    global_type: GlobalType,
    init_expr: InitExpr,
}

impl GlobalEntry {
    pub fn global_type(&self) -> &GlobalType {
        &self.global_type
    }

    pub fn init_expr(&self) -> &InitExpr {
        &self.init_expr
    }

    fn parse(reader: &mut Reader) -> Result<GlobalEntry, Error> {
        let global_type = GlobalType::parse(reader)?;
        let init_expr = InitExpr::parse(reader)?;
        Ok(GlobalEntry {
            global_type,
            init_expr,
        })
    }
}

/// One entry of the element section: function indices written into the table
/// starting at a computed offset.
#[derive(Clone, Debug, PartialEq)]
pub struct ElementSegment {
    index: u32,
    offset: InitExpr,
    members: Vec<u32>,
}

impl ElementSegment {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> &InitExpr {
        &self.offset
    }

    pub fn members(&self) -> &[u32] {
        &self.members
    }

    fn parse(reader: &mut Reader) -> Result<ElementSegment, Error> {
        let index = reader.read_var_u32()?;
        let offset = InitExpr::parse(reader)?;
        let members = reader.read_vec(Reader::read_var_u32)?;
        Ok(ElementSegment {
            index,
            offset,
            members,
        })
    }
}

/// One entry of the data section: bytes copied into memory at a computed
/// offset.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSegment {
    index: u32,
    offset: InitExpr,
    value: Vec<u8>,
}

impl DataSegment {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn offset(&self) -> &InitExpr {
        &self.offset
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    fn parse(reader: &mut Reader) -> Result<DataSegment, Error> {
        let index = reader.read_var_u32()?;
        let offset = InitExpr::parse(reader)?;
        let len = reader.read_var_u32()? as usize;
        let value = reader.read_bytes(len)?.to_vec();
        Ok(DataSegment {
            index,
            offset,
            value,
        })
    }
}

/// The body of one defined function: local declarations plus instructions.
#[derive(Clone, Debug, PartialEq)]
pub struct FuncBody {
    locals: Vec<Local>,
    code: Instructions,
}

impl FuncBody {
    pub fn locals(&self) -> &[Local] {
        &self.locals
    }

    pub fn code(&self) -> &Instructions {
        &self.code
    }

    fn parse(reader: &mut Reader) -> Result<FuncBody, Error> {
        let size = reader.read_var_u32()? as usize;
        let start = reader.position();
        let locals = reader.read_vec(Local::parse)?;
        let mut total: u64 = 0;
        for local in &locals {
            total += u64::from(local.count());
        }
        if total > u64::from(u32::MAX) {
            return Err(Error::TooManyLocals);
        }
        let code = Instructions::parse(reader)?;
        let consumed = reader.position() - start;
        if consumed != size {
            return Err(Error::BodySizeMismatch {
                declared: size,
                consumed,
            });
        }
        Ok(FuncBody { locals, code })
    }
}

/// A decoded module: the contents of every known section.
///
/// Immutable once parsed. This is the structural representation only; index
/// ranges, typing and the relationships between sections are checked by
/// [`crate::validation::validate_module`].
#[derive(Clone, Debug, Default)]
pub struct Module {
    types: Vec<FunctionType>,
    imports: Vec<ImportEntry>,
    functions: Vec<Func>,
    tables: Vec<TableType>,
    memories: Vec<MemoryType>,
    globals: Vec<GlobalEntry>,
    exports: Vec<ExportEntry>,
    start: Option<u32>,
    elements: Vec<ElementSegment>,
    code: Vec<FuncBody>,
    data: Vec<DataSegment>,
}

impl Module {
    pub fn types(&self) -> &[FunctionType] {
        &self.types
    }

    pub fn imports(&self) -> &[ImportEntry] {
        &self.imports
    }

    pub fn functions(&self) -> &[Func] {
        &self.functions
    }

    pub fn tables(&self) -> &[TableType] {
        &self.tables
    }

    pub fn memories(&self) -> &[MemoryType] {
        &self.memories
    }

    pub fn globals(&self) -> &[GlobalEntry] {
        &self.globals
    }

    pub fn exports(&self) -> &[ExportEntry] {
        &self.exports
    }

    pub fn start_section(&self) -> Option<u32> {
        self.start
    }

    pub fn element_segments(&self) -> &[ElementSegment] {
        &self.elements
    }

    pub fn code(&self) -> &[FuncBody] {
        &self.code
    }

    pub fn data_segments(&self) -> &[DataSegment] {
        &self.data
    }

    /// Looks up the type of the function with the given index, counting
    /// imported functions first.
    pub fn type_of_function(&self, func_idx: u32) -> Option<&FunctionType> {
        let imported = self
            .imports
            .iter()
            .filter_map(|entry| match entry.external() {
                External::Function(type_ref) => Some(*type_ref),
                _ => None,
            });
        let defined = self.functions.iter().map(|func| func.type_ref());
        imported
            .chain(defined)
            .nth(func_idx as usize)
            .and_then(|type_ref| self.types.get(type_ref as usize))
    }

    /// Decodes a binary module.
    ///
    /// The 8-byte prefix is checked first, then sections are read one at a
    /// time. Non-custom sections must appear at most once and in increasing
    /// id order; custom sections may appear anywhere and are skipped after
    /// their name is UTF-8 validated.
    pub fn parse(bytes: &[u8]) -> Result<Module, Error> {
        let mut reader = Reader::new(bytes);

        if reader.read_bytes(4)? != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let mut module = Module::default();
        let mut last_id = SECTION_CUSTOM;

        while !reader.is_at_end() {
            let id = reader.read_byte()?;
            let size = reader.read_var_u32()? as usize;
            let payload = reader.read_bytes(size)?;
            let mut section = Reader::new(payload);

            if id == SECTION_CUSTOM {
                // Name must still be well-formed; content is opaque.
                let name = section.read_string()?;
                log::trace!("skipping custom section `{}` ({} bytes)", name, size);
                continue;
            }
            if id > SECTION_DATA {
                return Err(Error::UnknownSectionId(id));
            }
            if id == last_id {
                return Err(Error::DuplicateSection(id));
            }
            if id < last_id {
                return Err(Error::OutOfOrderSection(id));
            }
            last_id = id;

            match id {
                SECTION_TYPE => module.types = section.read_vec(FunctionType::parse)?,
                SECTION_IMPORT => module.imports = section.read_vec(ImportEntry::parse)?,
                SECTION_FUNCTION => {
                    module.functions = section.read_vec(|reader| {
                        Ok(Func {
                            type_ref: reader.read_var_u32()?,
                        })
                    })?
                }
                SECTION_TABLE => module.tables = section.read_vec(TableType::parse)?,
                SECTION_MEMORY => module.memories = section.read_vec(MemoryType::parse)?,
                SECTION_GLOBAL => module.globals = section.read_vec(GlobalEntry::parse)?,
                SECTION_EXPORT => module.exports = section.read_vec(ExportEntry::parse)?,
                SECTION_START => module.start = Some(section.read_var_u32()?),
                SECTION_ELEMENT => module.elements = section.read_vec(ElementSegment::parse)?,
                SECTION_CODE => module.code = section.read_vec(FuncBody::parse)?,
                SECTION_DATA => module.data = section.read_vec(DataSegment::parse)?,
                _ => unreachable!("id is range-checked above"),
            }

            if !section.is_at_end() {
                return Err(Error::SectionSizeMismatch {
                    declared: size,
                    consumed: section.position(),
                });
            }
        }

        log::debug!(
            "decoded module: {} types, {} imports, {} functions, {} exports",
            module.types.len(),
            module.imports.len(),
            module.functions.len(),
            module.exports.len()
        );
        Ok(module)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const EMPTY_MODULE: &[u8] = &[0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00];

    #[test]
    fn parses_empty_module() {
        let module = Module::parse(EMPTY_MODULE).unwrap();
        assert!(module.types().is_empty());
        assert!(module.start_section().is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let bytes = [0x00, 0x61, 0x73, 0x6E, 0x01, 0x00, 0x00, 0x00];
        assert_matches!(Module::parse(&bytes), Err(Error::InvalidMagic));
    }

    #[test]
    fn rejects_bad_version() {
        let bytes = [0x00, 0x61, 0x73, 0x6D, 0x02, 0x00, 0x00, 0x00];
        assert_matches!(Module::parse(&bytes), Err(Error::UnsupportedVersion(2)));
    }

    #[test]
    fn rejects_duplicate_section() {
        let mut bytes = EMPTY_MODULE.to_vec();
        // Two empty type sections.
        bytes.extend_from_slice(&[0x01, 0x01, 0x00]);
        bytes.extend_from_slice(&[0x01, 0x01, 0x00]);
        assert_matches!(Module::parse(&bytes), Err(Error::DuplicateSection(1)));
    }

    #[test]
    fn rejects_out_of_order_section() {
        let mut bytes = EMPTY_MODULE.to_vec();
        // Function section (3) before type section (1).
        bytes.extend_from_slice(&[0x03, 0x01, 0x00]);
        bytes.extend_from_slice(&[0x01, 0x01, 0x00]);
        assert_matches!(Module::parse(&bytes), Err(Error::OutOfOrderSection(1)));
    }

    #[test]
    fn rejects_unknown_section() {
        let mut bytes = EMPTY_MODULE.to_vec();
        bytes.extend_from_slice(&[0x0C, 0x01, 0x00]);
        assert_matches!(Module::parse(&bytes), Err(Error::UnknownSectionId(12)));
    }

    #[test]
    fn rejects_overlong_section_body() {
        let mut bytes = EMPTY_MODULE.to_vec();
        // Type section declares 2 bytes but the (empty) vector takes 1.
        bytes.extend_from_slice(&[0x01, 0x02, 0x00, 0x00]);
        assert_matches!(Module::parse(&bytes), Err(Error::SectionSizeMismatch { .. }));
    }

    #[test]
    fn skips_custom_sections_anywhere() {
        let mut bytes = EMPTY_MODULE.to_vec();
        // custom section: size 5, name "four" (len 4), no payload
        bytes.extend_from_slice(&[0x00, 0x05, 0x04, b'f', b'o', b'u', b'r']);
        // empty type section
        bytes.extend_from_slice(&[0x01, 0x01, 0x00]);
        // another custom section after it
        bytes.extend_from_slice(&[0x00, 0x05, 0x04, b'f', b'o', b'u', b'r']);
        assert!(Module::parse(&bytes).is_ok());
    }

    #[test]
    fn custom_section_name_must_be_utf8() {
        let mut bytes = EMPTY_MODULE.to_vec();
        bytes.extend_from_slice(&[0x00, 0x03, 0x02, 0xFF, 0xFE]);
        assert_matches!(Module::parse(&bytes), Err(Error::InvalidUtf8));
    }

    #[test]
    fn parse_is_deterministic() {
        let wasm = wat::parse_str(
            r#"
            (module
                (func (export "answer") (result i32)
                    i32.const 42))
            "#,
        )
        .unwrap();
        let first = Module::parse(&wasm).unwrap();
        let second = Module::parse(&wasm).unwrap();
        assert_eq!(first.code(), second.code());
    }
}
