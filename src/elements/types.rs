use super::{Error, Reader};

/// Type of a value that wasm code operates on.
///
/// There is no distinction between signed and unsigned integer types;
/// individual instructions reinterpret the bits as one or the other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// 32-bit integer.
    I32,
    /// 64-bit integer.
    I64,
    /// 32-bit IEEE 754-2008 floating point number.
    F32,
    /// 64-bit IEEE 754-2008 floating point number.
    F64,
}

impl ValueType {
    pub(crate) fn from_byte(byte: u8) -> Result<ValueType, Error> {
        match byte {
            0x7F => Ok(ValueType::I32),
            0x7E => Ok(ValueType::I64),
            0x7D => Ok(ValueType::F32),
            0x7C => Ok(ValueType::F64),
            other => Err(Error::UnknownValueType(other)),
        }
    }

    pub(crate) fn parse(reader: &mut Reader) -> Result<ValueType, Error> {
        ValueType::from_byte(reader.read_byte()?)
    }
}

/// Result type of a block, loop, if or function: either empty or a single
/// value type. WebAssembly 1.0 does not admit more than one result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockType {
    /// No result.
    NoResult,
    /// One result of the given type.
    Value(ValueType),
}

impl BlockType {
    pub(crate) fn parse(reader: &mut Reader) -> Result<BlockType, Error> {
        let byte = reader.read_byte()?;
        if byte == 0x40 {
            return Ok(BlockType::NoResult);
        }
        ValueType::from_byte(byte)
            .map(BlockType::Value)
            .map_err(|_| Error::UnknownBlockType(byte))
    }
}

impl From<Option<ValueType>> for BlockType {
    fn from(result: Option<ValueType>) -> BlockType {
        match result {
            None => BlockType::NoResult,
            Some(value_type) => BlockType::Value(value_type),
        }
    }
}

/// Type of a function: parameter types plus an optional result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionType {
    params: Vec<ValueType>,
    result: Option<ValueType>,
}

impl FunctionType {
    pub fn params(&self) -> &[ValueType] {
        &self.params
    }

    pub fn result(&self) -> Option<ValueType> {
        self.result
    }

    pub fn block_type(&self) -> BlockType {
        self.result.into()
    }

    pub(crate) fn parse(reader: &mut Reader) -> Result<FunctionType, Error> {
        let form = reader.read_byte()?;
        if form != 0x60 {
            return Err(Error::InvalidFunctionTypeForm(form));
        }
        let params = reader.read_vec(ValueType::parse)?;
        let results = reader.read_vec(ValueType::parse)?;
        if results.len() > 1 {
            return Err(Error::MultipleResults);
        }
        Ok(FunctionType {
            params,
            result: results.first().copied(),
        })
    }
}

/// Minimum and optional maximum size of a memory (in pages) or a table
/// (in elements).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResizableLimits {
    initial: u32,
    maximum: Option<u32>,
}

impl ResizableLimits {
    pub fn new(initial: u32, maximum: Option<u32>) -> ResizableLimits {
        ResizableLimits { initial, maximum }
    }

    pub fn initial(&self) -> u32 {
        self.initial
    }

    pub fn maximum(&self) -> Option<u32> {
        self.maximum
    }

    pub(crate) fn parse(reader: &mut Reader) -> Result<ResizableLimits, Error> {
        let flag = reader.read_byte()?;
        let initial = reader.read_var_u32()?;
        let maximum = match flag {
            0x00 => None,
            0x01 => Some(reader.read_var_u32()?),
            other => return Err(Error::InvalidLimitsFlag(other)),
        };
        Ok(ResizableLimits { initial, maximum })
    }
}

/// Type of a table. The only element type in WebAssembly 1.0 is `funcref`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableType {
    limits: ResizableLimits,
}

impl TableType {
    pub fn limits(&self) -> &ResizableLimits {
        &self.limits
    }

    pub(crate) fn parse(reader: &mut Reader) -> Result<TableType, Error> {
        let elem_type = reader.read_byte()?;
        if elem_type != 0x70 {
            return Err(Error::UnknownElementType(elem_type));
        }
        let limits = ResizableLimits::parse(reader)?;
        Ok(TableType { limits })
    }
}

/// Type of a linear memory. Limits are given in 64 KiB pages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    limits: ResizableLimits,
}

impl MemoryType {
    pub fn limits(&self) -> &ResizableLimits {
        &self.limits
    }

    pub(crate) fn parse(reader: &mut Reader) -> Result<MemoryType, Error> {
        let limits = ResizableLimits::parse(reader)?;
        Ok(MemoryType { limits })
    }
}

/// Type of a global variable: its content type plus mutability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalType {
    content_type: ValueType,
    mutable: bool,
}

impl GlobalType {
    pub fn content_type(&self) -> ValueType {
        self.content_type
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub(crate) fn parse(reader: &mut Reader) -> Result<GlobalType, Error> {
        let content_type = ValueType::parse(reader)?;
        let mutable = match reader.read_byte()? {
            0x00 => false,
            0x01 => true,
            other => return Err(Error::InvalidMutabilityFlag(other)),
        };
        Ok(GlobalType {
            content_type,
            mutable,
        })
    }
}

/// A run of local variables of one type inside a function body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Local {
    count: u32,
    value_type: ValueType,
}

impl Local {
    #[cfg(test)]
    pub(crate) fn new(count: u32, value_type: ValueType) -> Local {
        Local { count, value_type }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub(crate) fn parse(reader: &mut Reader) -> Result<Local, Error> {
        let count = reader.read_var_u32()?;
        let value_type = ValueType::parse(reader)?;
        Ok(Local { count, value_type })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn function_type_decoding() {
        // (i32, i64) -> f32
        let bytes = [0x60, 0x02, 0x7F, 0x7E, 0x01, 0x7D];
        let ty = FunctionType::parse(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(ty.params(), &[ValueType::I32, ValueType::I64]);
        assert_eq!(ty.result(), Some(ValueType::F32));
    }

    #[test]
    fn multi_value_rejected() {
        let bytes = [0x60, 0x00, 0x02, 0x7F, 0x7F];
        assert_matches!(
            FunctionType::parse(&mut Reader::new(&bytes)),
            Err(Error::MultipleResults)
        );
    }

    #[test]
    fn limits_flags() {
        let bytes = [0x01, 0x01, 0x10];
        let limits = ResizableLimits::parse(&mut Reader::new(&bytes)).unwrap();
        assert_eq!(limits.initial(), 1);
        assert_eq!(limits.maximum(), Some(16));

        let bytes = [0x02, 0x01];
        assert_matches!(
            ResizableLimits::parse(&mut Reader::new(&bytes)),
            Err(Error::InvalidLimitsFlag(0x02))
        );
    }

    #[test]
    fn block_type_decoding() {
        assert_eq!(
            BlockType::parse(&mut Reader::new(&[0x40])).unwrap(),
            BlockType::NoResult
        );
        assert_eq!(
            BlockType::parse(&mut Reader::new(&[0x7F])).unwrap(),
            BlockType::Value(ValueType::I32)
        );
        assert_matches!(
            BlockType::parse(&mut Reader::new(&[0x6F])),
            Err(Error::UnknownBlockType(0x6F))
        );
    }
}
