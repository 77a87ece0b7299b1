use crate::elements::ValueType;
use crate::nan_preserving_float::{F32, F64};
use crate::TrapKind;

/// Error for `LittleEndianConvert`
#[derive(Debug)]
pub enum Error {
    /// The buffer is too short for the type being deserialized
    InvalidLittleEndianBuffer,
}

/// Runtime representation of a value.
///
/// Wasm code manipulates values of four basic types: integers and
/// floating-point (IEEE 754-2008) data of 32 or 64 bit width each.
///
/// There is no distinction between signed and unsigned integer types.
/// Instead, integers are interpreted by respective operations as either
/// unsigned or signed in two's complement representation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RuntimeValue {
    /// Value of 32-bit signed or unsigned integer.
    I32(i32),
    /// Value of 64-bit signed or unsigned integer.
    I64(i64),
    /// Value of 32-bit IEEE 754-2008 floating point number.
    F32(F32),
    /// Value of 64-bit IEEE 754-2008 floating point number.
    F64(F64),
}

/// Trait for creating a value from a [`RuntimeValue`].
///
/// Typically each implementation can create a value from one specific
/// variant; e.g. `bool` and `u32` both convert from [`RuntimeValue::I32`].
pub trait FromRuntimeValue
where
    Self: Sized,
{
    /// Creates a value of type `Self` from a given [`RuntimeValue`].
    ///
    /// Returns `None` if the `RuntimeValue` has a different type than
    /// expected by the conversion in question.
    fn from_runtime_value(val: RuntimeValue) -> Option<Self>;
}

/// Convert one type to another by wrapping.
pub trait WrapInto<T> {
    /// Convert one type to another by wrapping.
    fn wrap_into(self) -> T;
}

/// Convert one type to another by rounding to the nearest integer towards
/// zero. Fails when the source has no representation in the destination.
pub trait TryTruncateInto<T, E> {
    /// Convert one type to another by rounding to the nearest integer
    /// towards zero.
    fn try_truncate_into(self) -> Result<T, E>;
}

/// Convert one type to another by extending with leading zeroes or the sign
/// bit.
pub trait ExtendInto<T> {
    /// Convert one type to another by extending.
    fn extend_into(self) -> T;
}

/// Reinterprets the bits of a value of one type as another type.
pub trait TransmuteInto<T> {
    /// Reinterprets the bits of a value of one type as another type.
    fn transmute_into(self) -> T;
}

/// Convert from and to little endian.
pub trait LittleEndianConvert
where
    Self: Sized,
{
    /// Convert to little endian buffer.
    fn into_little_endian(self, buffer: &mut [u8]);
    /// Convert from little endian buffer.
    fn from_little_endian(buffer: &[u8]) -> Result<Self, Error>;
}

/// Arithmetic operations.
pub trait ArithmeticOps<T> {
    /// Add two values.
    fn add(self, other: T) -> T;
    /// Subtract two values.
    fn sub(self, other: T) -> T;
    /// Multiply two values.
    fn mul(self, other: T) -> T;
    /// Divide two values.
    fn div(self, other: T) -> Result<T, TrapKind>;
}

/// Integer value.
pub trait Integer<T>: ArithmeticOps<T> {
    /// Counts leading zeros in the bitwise representation of the value.
    fn leading_zeros(self) -> T;
    /// Counts trailing zeros in the bitwise representation of the value.
    fn trailing_zeros(self) -> T;
    /// Counts 1-bits in the bitwise representation of the value.
    fn count_ones(self) -> T;
    /// Get left bit rotation result.
    fn rotl(self, other: T) -> T;
    /// Get right bit rotation result.
    fn rotr(self, other: T) -> T;
    /// Get division remainder.
    fn rem(self, other: T) -> Result<T, TrapKind>;
}

/// Float-point value.
pub trait Float<T>: ArithmeticOps<T> {
    /// Get absolute value.
    fn abs(self) -> T;
    /// Returns the largest integer less than or equal to a number.
    fn floor(self) -> T;
    /// Returns the smallest integer greater than or equal to a number.
    fn ceil(self) -> T;
    /// Returns the integer part of a number.
    fn trunc(self) -> T;
    /// Returns the nearest integer to a number. Round half-way cases away
    /// from 0.0.
    fn round(self) -> T;
    /// Returns the nearest integer to a number. Ties round to even.
    fn nearest(self) -> T;
    /// Takes the square root of a number.
    fn sqrt(self) -> T;
    /// Returns the minimum of the two numbers.
    fn min(self, other: T) -> T;
    /// Returns the maximum of the two numbers.
    fn max(self, other: T) -> T;
    /// Sets sign of this value to the sign of other value.
    fn copysign(self, other: T) -> T;
}

impl RuntimeValue {
    /// Creates new default value of given type.
    pub fn default(value_type: ValueType) -> Self {
        match value_type {
            ValueType::I32 => RuntimeValue::I32(0),
            ValueType::I64 => RuntimeValue::I64(0),
            ValueType::F32 => RuntimeValue::F32(0f32.into()),
            ValueType::F64 => RuntimeValue::F64(0f64.into()),
        }
    }

    /// Creates new value by interpreting passed u32 as f32.
    pub fn decode_f32(val: u32) -> Self {
        RuntimeValue::F32(F32::from_bits(val))
    }

    /// Creates new value by interpreting passed u64 as f64.
    pub fn decode_f64(val: u64) -> Self {
        RuntimeValue::F64(F64::from_bits(val))
    }

    /// Get variable type for this value.
    pub fn value_type(&self) -> ValueType {
        match *self {
            RuntimeValue::I32(_) => ValueType::I32,
            RuntimeValue::I64(_) => ValueType::I64,
            RuntimeValue::F32(_) => ValueType::F32,
            RuntimeValue::F64(_) => ValueType::F64,
        }
    }

    /// Returns `T` if this particular [`RuntimeValue`] contains an
    /// appropriate type.
    ///
    /// See [`FromRuntimeValue`] for details.
    pub fn try_into<T: FromRuntimeValue>(self) -> Option<T> {
        FromRuntimeValue::from_runtime_value(self)
    }
}

impl From<i8> for RuntimeValue {
    fn from(val: i8) -> Self {
        RuntimeValue::I32(val as i32)
    }
}

impl From<i16> for RuntimeValue {
    fn from(val: i16) -> Self {
        RuntimeValue::I32(val as i32)
    }
}

impl From<i32> for RuntimeValue {
    fn from(val: i32) -> Self {
        RuntimeValue::I32(val)
    }
}

impl From<i64> for RuntimeValue {
    fn from(val: i64) -> Self {
        RuntimeValue::I64(val)
    }
}

impl From<u8> for RuntimeValue {
    fn from(val: u8) -> Self {
        RuntimeValue::I32(val as i32)
    }
}

impl From<u16> for RuntimeValue {
    fn from(val: u16) -> Self {
        RuntimeValue::I32(val as i32)
    }
}

impl From<u32> for RuntimeValue {
    fn from(val: u32) -> Self {
        RuntimeValue::I32(val.transmute_into())
    }
}

impl From<u64> for RuntimeValue {
    fn from(val: u64) -> Self {
        RuntimeValue::I64(val.transmute_into())
    }
}

impl From<F32> for RuntimeValue {
    fn from(val: F32) -> Self {
        RuntimeValue::F32(val)
    }
}

impl From<F64> for RuntimeValue {
    fn from(val: F64) -> Self {
        RuntimeValue::F64(val)
    }
}

macro_rules! impl_from_runtime_value {
    ($expected_rt_ty: ident, $into: ty) => {
        impl FromRuntimeValue for $into {
            fn from_runtime_value(val: RuntimeValue) -> Option<Self> {
                match val {
                    RuntimeValue::$expected_rt_ty(val) => Some(val.transmute_into()),
                    _ => None,
                }
            }
        }
    };
}

/// This conversion assumes that boolean values are represented by
/// [`RuntimeValue::I32`] type.
impl FromRuntimeValue for bool {
    fn from_runtime_value(val: RuntimeValue) -> Option<Self> {
        match val {
            RuntimeValue::I32(val) => Some(val != 0),
            _ => None,
        }
    }
}

impl_from_runtime_value!(I32, i32);
impl_from_runtime_value!(I64, i64);
impl_from_runtime_value!(F32, F32);
impl_from_runtime_value!(F64, F64);
impl_from_runtime_value!(I32, u32);
impl_from_runtime_value!(I64, u64);

macro_rules! impl_wrap_into {
    ($from:ident, $into:ident) => {
        impl WrapInto<$into> for $from {
            fn wrap_into(self) -> $into {
                self as $into
            }
        }
    };
    ($from:ident, $intermediate:ident, $into:ident) => {
        impl WrapInto<$into> for $from {
            fn wrap_into(self) -> $into {
                $into::from(self as $intermediate)
            }
        }
    };
}

impl_wrap_into!(i32, i8);
impl_wrap_into!(i32, i16);
impl_wrap_into!(i64, i8);
impl_wrap_into!(i64, i16);
impl_wrap_into!(i64, i32);
impl_wrap_into!(i64, f32, F32);
impl_wrap_into!(u64, f32, F32);
impl_wrap_into!(f64, f32);

impl WrapInto<F32> for F64 {
    fn wrap_into(self) -> F32 {
        (f64::from(self) as f32).into()
    }
}

macro_rules! impl_try_truncate_into {
    (@primitive $from: ident, $into: ident, $to_primitive:path) => {
        impl TryTruncateInto<$into, TrapKind> for $from {
            fn try_truncate_into(self) -> Result<$into, TrapKind> {
                // Rejects NaN and infinities up front, then truncates toward
                // zero with exact rational arithmetic so the range check is
                // not subject to rounding.
                num_rational::BigRational::from_float(self)
                    .map(|val| val.to_integer())
                    .and_then(|val| $to_primitive(&val))
                    .ok_or(TrapKind::InvalidConversionToInt)
            }
        }
    };
    (@wrapped $from:ident, $intermediate:ident, $into:ident) => {
        impl TryTruncateInto<$into, TrapKind> for $from {
            fn try_truncate_into(self) -> Result<$into, TrapKind> {
                $intermediate::from(self).try_truncate_into()
            }
        }
    };
}

impl_try_truncate_into!(@primitive f32, i32, num_traits::cast::ToPrimitive::to_i32);
impl_try_truncate_into!(@primitive f32, i64, num_traits::cast::ToPrimitive::to_i64);
impl_try_truncate_into!(@primitive f64, i32, num_traits::cast::ToPrimitive::to_i32);
impl_try_truncate_into!(@primitive f64, i64, num_traits::cast::ToPrimitive::to_i64);
impl_try_truncate_into!(@primitive f32, u32, num_traits::cast::ToPrimitive::to_u32);
impl_try_truncate_into!(@primitive f32, u64, num_traits::cast::ToPrimitive::to_u64);
impl_try_truncate_into!(@primitive f64, u32, num_traits::cast::ToPrimitive::to_u32);
impl_try_truncate_into!(@primitive f64, u64, num_traits::cast::ToPrimitive::to_u64);
impl_try_truncate_into!(@wrapped F32, f32, i32);
impl_try_truncate_into!(@wrapped F32, f32, i64);
impl_try_truncate_into!(@wrapped F64, f64, i32);
impl_try_truncate_into!(@wrapped F64, f64, i64);
impl_try_truncate_into!(@wrapped F32, f32, u32);
impl_try_truncate_into!(@wrapped F32, f32, u64);
impl_try_truncate_into!(@wrapped F64, f64, u32);
impl_try_truncate_into!(@wrapped F64, f64, u64);

macro_rules! impl_extend_into {
    ($from:ident, $into:ident) => {
        impl ExtendInto<$into> for $from {
            fn extend_into(self) -> $into {
                self as $into
            }
        }
    };
    ($from:ident, $intermediate:ident, $into:ident) => {
        impl ExtendInto<$into> for $from {
            fn extend_into(self) -> $into {
                $into::from(self as $intermediate)
            }
        }
    };
}

impl_extend_into!(i8, i32);
impl_extend_into!(u8, i32);
impl_extend_into!(i16, i32);
impl_extend_into!(u16, i32);
impl_extend_into!(i8, i64);
impl_extend_into!(u8, i64);
impl_extend_into!(i16, i64);
impl_extend_into!(u16, i64);
impl_extend_into!(i32, i64);
impl_extend_into!(u32, i64);
impl_extend_into!(u32, u64);
impl_extend_into!(i32, f32);
impl_extend_into!(i32, f64);
impl_extend_into!(u32, f32);
impl_extend_into!(u32, f64);
impl_extend_into!(i64, f64);
impl_extend_into!(u64, f64);
impl_extend_into!(f32, f64);

impl_extend_into!(i32, f32, F32);
impl_extend_into!(i32, f64, F64);
impl_extend_into!(u32, f32, F32);
impl_extend_into!(u32, f64, F64);
impl_extend_into!(i64, f64, F64);
impl_extend_into!(u64, f64, F64);
impl_extend_into!(f32, f64, F64);

impl ExtendInto<F64> for F32 {
    fn extend_into(self) -> F64 {
        (f32::from(self) as f64).into()
    }
}

macro_rules! impl_transmute_into_self {
    ($type: ident) => {
        impl TransmuteInto<$type> for $type {
            fn transmute_into(self) -> $type {
                self
            }
        }
    };
}

impl_transmute_into_self!(i32);
impl_transmute_into_self!(i64);
impl_transmute_into_self!(f32);
impl_transmute_into_self!(f64);
impl_transmute_into_self!(F32);
impl_transmute_into_self!(F64);

macro_rules! impl_transmute_into_as {
    ($from: ident, $into: ident) => {
        impl TransmuteInto<$into> for $from {
            fn transmute_into(self) -> $into {
                self as $into
            }
        }
    };
}

impl_transmute_into_as!(i8, u8);
impl_transmute_into_as!(i32, u32);
impl_transmute_into_as!(i64, u64);

macro_rules! impl_transmute_into_npf {
    ($npf:ident, $float:ident, $signed:ident, $unsigned:ident) => {
        impl TransmuteInto<$float> for $npf {
            fn transmute_into(self) -> $float {
                self.into()
            }
        }

        impl TransmuteInto<$npf> for $float {
            fn transmute_into(self) -> $npf {
                self.into()
            }
        }

        impl TransmuteInto<$signed> for $npf {
            fn transmute_into(self) -> $signed {
                self.to_bits() as _
            }
        }

        impl TransmuteInto<$unsigned> for $npf {
            fn transmute_into(self) -> $unsigned {
                self.to_bits()
            }
        }

        impl TransmuteInto<$npf> for $signed {
            fn transmute_into(self) -> $npf {
                $npf::from_bits(self as _)
            }
        }

        impl TransmuteInto<$npf> for $unsigned {
            fn transmute_into(self) -> $npf {
                $npf::from_bits(self)
            }
        }
    };
}

impl_transmute_into_npf!(F32, f32, i32, u32);
impl_transmute_into_npf!(F64, f64, i64, u64);

impl TransmuteInto<i32> for f32 {
    fn transmute_into(self) -> i32 {
        self.to_bits() as i32
    }
}

impl TransmuteInto<i64> for f64 {
    fn transmute_into(self) -> i64 {
        self.to_bits() as i64
    }
}

impl TransmuteInto<f32> for i32 {
    fn transmute_into(self) -> f32 {
        f32::from_bits(self as u32)
    }
}

impl TransmuteInto<f64> for i64 {
    fn transmute_into(self) -> f64 {
        f64::from_bits(self as u64)
    }
}

impl TransmuteInto<i32> for u32 {
    fn transmute_into(self) -> i32 {
        self as _
    }
}

impl TransmuteInto<i64> for u64 {
    fn transmute_into(self) -> i64 {
        self as _
    }
}

impl LittleEndianConvert for i8 {
    fn into_little_endian(self, buffer: &mut [u8]) {
        buffer[0] = self as u8;
    }

    fn from_little_endian(buffer: &[u8]) -> Result<Self, Error> {
        buffer
            .first()
            .map(|v| *v as i8)
            .ok_or(Error::InvalidLittleEndianBuffer)
    }
}

impl LittleEndianConvert for u8 {
    fn into_little_endian(self, buffer: &mut [u8]) {
        buffer[0] = self;
    }

    fn from_little_endian(buffer: &[u8]) -> Result<Self, Error> {
        buffer
            .first()
            .copied()
            .ok_or(Error::InvalidLittleEndianBuffer)
    }
}

macro_rules! impl_little_endian_convert_int {
    ($type:ident, $size:literal) => {
        impl LittleEndianConvert for $type {
            fn into_little_endian(self, buffer: &mut [u8]) {
                buffer.copy_from_slice(&self.to_le_bytes());
            }

            fn from_little_endian(buffer: &[u8]) -> Result<Self, Error> {
                let mut res = [0u8; $size];
                buffer
                    .get(0..$size)
                    .map(|s| {
                        res.copy_from_slice(s);
                        Self::from_le_bytes(res)
                    })
                    .ok_or(Error::InvalidLittleEndianBuffer)
            }
        }
    };
}

impl_little_endian_convert_int!(i16, 2);
impl_little_endian_convert_int!(u16, 2);
impl_little_endian_convert_int!(i32, 4);
impl_little_endian_convert_int!(u32, 4);
impl_little_endian_convert_int!(i64, 8);
impl_little_endian_convert_int!(u64, 8);

macro_rules! impl_little_endian_convert_float {
    ($type:ident, $bits:ident, $size:literal) => {
        impl LittleEndianConvert for $type {
            fn into_little_endian(self, buffer: &mut [u8]) {
                buffer.copy_from_slice(&self.to_bits().to_le_bytes());
            }

            fn from_little_endian(buffer: &[u8]) -> Result<Self, Error> {
                let mut res = [0u8; $size];
                buffer
                    .get(0..$size)
                    .map(|s| {
                        res.copy_from_slice(s);
                        Self::from_bits($bits::from_le_bytes(res))
                    })
                    .ok_or(Error::InvalidLittleEndianBuffer)
            }
        }
    };
}

impl_little_endian_convert_float!(f32, u32, 4);
impl_little_endian_convert_float!(f64, u64, 8);
impl_little_endian_convert_float!(F32, u32, 4);
impl_little_endian_convert_float!(F64, u64, 8);

macro_rules! impl_integer_arithmetic_ops {
    ($type: ident) => {
        impl ArithmeticOps<$type> for $type {
            fn add(self, other: $type) -> $type {
                self.wrapping_add(other)
            }
            fn sub(self, other: $type) -> $type {
                self.wrapping_sub(other)
            }
            fn mul(self, other: $type) -> $type {
                self.wrapping_mul(other)
            }
            fn div(self, other: $type) -> Result<$type, TrapKind> {
                if other == 0 {
                    Err(TrapKind::DivisionByZero)
                } else {
                    // Signed MIN / -1 does not fit the result type.
                    let (result, overflow) = self.overflowing_div(other);
                    if overflow {
                        Err(TrapKind::IntegerOverflow)
                    } else {
                        Ok(result)
                    }
                }
            }
        }
    };
}

impl_integer_arithmetic_ops!(i32);
impl_integer_arithmetic_ops!(u32);
impl_integer_arithmetic_ops!(i64);
impl_integer_arithmetic_ops!(u64);

macro_rules! impl_float_arithmetic_ops {
    ($type: ident) => {
        impl ArithmeticOps<$type> for $type {
            fn add(self, other: $type) -> $type {
                self + other
            }
            fn sub(self, other: $type) -> $type {
                self - other
            }
            fn mul(self, other: $type) -> $type {
                self * other
            }
            fn div(self, other: $type) -> Result<$type, TrapKind> {
                Ok(self / other)
            }
        }
    };
}

impl_float_arithmetic_ops!(f32);
impl_float_arithmetic_ops!(f64);
impl_float_arithmetic_ops!(F32);
impl_float_arithmetic_ops!(F64);

macro_rules! impl_integer {
    ($type: ident) => {
        impl Integer<$type> for $type {
            fn leading_zeros(self) -> $type {
                self.leading_zeros() as $type
            }
            fn trailing_zeros(self) -> $type {
                self.trailing_zeros() as $type
            }
            fn count_ones(self) -> $type {
                self.count_ones() as $type
            }
            fn rotl(self, other: $type) -> $type {
                self.rotate_left(other as u32)
            }
            fn rotr(self, other: $type) -> $type {
                self.rotate_right(other as u32)
            }
            fn rem(self, other: $type) -> Result<$type, TrapKind> {
                if other == 0 {
                    Err(TrapKind::DivisionByZero)
                } else {
                    // Signed MIN % -1 wraps to 0 rather than trapping.
                    Ok(self.wrapping_rem(other))
                }
            }
        }
    };
}

impl_integer!(i32);
impl_integer!(u32);
impl_integer!(i64);
impl_integer!(u64);

macro_rules! impl_float {
    ($type:ident, $fXX:ident, $iXX:ident, $nan_bits:expr) => {
        // Direct float comparisons are exactly what the semantics call for
        // here.
        #[allow(clippy::float_cmp)]
        impl Float<$type> for $type {
            fn abs(self) -> $type {
                $fXX::from(self).abs().into()
            }
            fn floor(self) -> $type {
                $fXX::from(self).floor().into()
            }
            fn ceil(self) -> $type {
                $fXX::from(self).ceil().into()
            }
            fn trunc(self) -> $type {
                $fXX::from(self).trunc().into()
            }
            fn round(self) -> $type {
                $fXX::from(self).round().into()
            }
            fn nearest(self) -> $type {
                let round = self.round();
                if $fXX::from(self).fract().abs() != 0.5 {
                    return round;
                }

                use core::ops::Rem;
                if round.rem(2.0) == 1.0 {
                    self.floor()
                } else if round.rem(2.0) == -1.0 {
                    self.ceil()
                } else {
                    round
                }
            }
            fn sqrt(self) -> $type {
                $fXX::from(self).sqrt().into()
            }
            // The result of min/max on a NaN operand is the canonical NaN,
            // independent of how the host propagates payloads.
            fn min(self, other: $type) -> $type {
                if self.is_nan() || other.is_nan() {
                    return <$type>::from_bits($nan_bits);
                }
                if self == other {
                    // ±0 compare equal; merging the sign bits picks -0.
                    let self_int: $iXX = self.transmute_into();
                    let other_int: $iXX = other.transmute_into();
                    return (self_int | other_int).transmute_into();
                }
                if self < other {
                    self
                } else {
                    other
                }
            }
            fn max(self, other: $type) -> $type {
                if self.is_nan() || other.is_nan() {
                    return <$type>::from_bits($nan_bits);
                }
                if self == other {
                    // ±0 compare equal; clearing a differing sign bit
                    // picks +0.
                    let self_int: $iXX = self.transmute_into();
                    let other_int: $iXX = other.transmute_into();
                    return (self_int & other_int).transmute_into();
                }
                if self > other {
                    self
                } else {
                    other
                }
            }
            // Purely a bit-level operation, NaN operands included.
            fn copysign(self, other: $type) -> $type {
                use core::mem::size_of;

                let sign_mask: $iXX = 1 << ((size_of::<$iXX>() << 3) - 1);
                let self_int: $iXX = self.transmute_into();
                let other_int: $iXX = other.transmute_into();
                ((self_int & !sign_mask) | (other_int & sign_mask)).transmute_into()
            }
        }
    };
}

impl_float!(f32, f32, i32, 0x7fc0_0000_u32);
impl_float!(f64, f64, i64, 0x7ff8_0000_0000_0000_u64);
impl_float!(F32, f32, i32, 0x7fc0_0000_u32);
impl_float!(F64, f64, i64, 0x7ff8_0000_0000_0000_u64);

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn integer_add_wraps() {
        // (a + b) mod 2^N
        assert_eq!(ArithmeticOps::add(u32::MAX, 1u32), 0);
        assert_eq!(ArithmeticOps::add(i32::MAX, 1i32), i32::MIN);
        assert_eq!(ArithmeticOps::mul(0x8000_0001_u32, 2), 2);
    }

    #[test]
    fn signed_division_overflow_traps() {
        assert_matches!(
            ArithmeticOps::div(i32::MIN, -1i32),
            Err(TrapKind::IntegerOverflow)
        );
        assert_matches!(
            ArithmeticOps::div(i64::MIN, -1i64),
            Err(TrapKind::IntegerOverflow)
        );
        assert_matches!(ArithmeticOps::div(1i32, 0), Err(TrapKind::DivisionByZero));
    }

    #[test]
    fn signed_remainder_overflow_is_zero() {
        assert_eq!(Integer::rem(i32::MIN, -1i32).unwrap(), 0);
        assert_eq!(Integer::rem(i64::MIN, -1i64).unwrap(), 0);
        assert_matches!(Integer::rem(1i32, 0), Err(TrapKind::DivisionByZero));
    }

    #[test]
    fn clz_ctz_of_zero_is_bit_width() {
        assert_eq!(Integer::leading_zeros(0u32), 32);
        assert_eq!(Integer::trailing_zeros(0u32), 32);
        assert_eq!(Integer::leading_zeros(0u64), 64);
        assert_eq!(Integer::trailing_zeros(0u64), 64);
    }

    #[test]
    fn truncation_rejects_nan_and_out_of_range() {
        assert_matches!(
            TryTruncateInto::<i32, _>::try_truncate_into(f32::NAN),
            Err(TrapKind::InvalidConversionToInt)
        );
        assert_matches!(
            TryTruncateInto::<i32, _>::try_truncate_into(f64::INFINITY),
            Err(TrapKind::InvalidConversionToInt)
        );
        assert_matches!(
            TryTruncateInto::<u32, _>::try_truncate_into(-1.0f64),
            Err(TrapKind::InvalidConversionToInt)
        );
        // 2^31 is out of range for i32, 2^31 - 1 is the last value in.
        assert_matches!(
            TryTruncateInto::<i32, _>::try_truncate_into(2147483648.0f64),
            Err(TrapKind::InvalidConversionToInt)
        );
        assert_eq!(
            TryTruncateInto::<i32, _>::try_truncate_into(2147483647.0f64).unwrap(),
            i32::MAX
        );
        // Truncation is toward zero.
        assert_eq!(TryTruncateInto::<i32, _>::try_truncate_into(-1.9f64).unwrap(), -1);
        assert_eq!(
            TryTruncateInto::<u32, _>::try_truncate_into(-0.5f64).unwrap(),
            0
        );
    }

    #[test]
    fn float_min_max_nan_is_canonical() {
        let min = Float::min(f32::NAN, 1.0f32);
        assert_eq!(min.to_bits(), 0x7fc0_0000);
        let max = Float::max(1.0f64, f64::NAN);
        assert_eq!(max.to_bits(), 0x7ff8_0000_0000_0000);
        // Payloads of NaN inputs do not leak through.
        let noisy = F32::from_bits(0xffc0_1234);
        assert_eq!(Float::min(noisy, F32::from(1.0f32)).to_bits(), 0x7fc0_0000);
    }

    #[test]
    fn float_min_max_signed_zeros() {
        let neg = -0.0f32;
        let pos = 0.0f32;
        assert_eq!(Float::min(neg, pos).to_bits(), neg.to_bits());
        assert_eq!(Float::min(pos, neg).to_bits(), neg.to_bits());
        assert_eq!(Float::max(neg, pos).to_bits(), pos.to_bits());
        assert_eq!(Float::max(pos, neg).to_bits(), pos.to_bits());
    }

    #[test]
    fn copysign_is_bit_level() {
        assert_eq!(Float::copysign(1.5f32, -2.0f32), -1.5);
        assert_eq!(Float::copysign(-1.5f32, 2.0f32), 1.5);
        // Sign transfers onto NaN without touching the payload.
        let nan = F64::from_bits(0x7ff8_0000_0000_1234);
        assert_eq!(
            Float::copysign(nan, F64::from(-1.0f64)).to_bits(),
            0xfff8_0000_0000_1234
        );
    }

    #[test]
    fn nearest_rounds_half_to_even() {
        assert_eq!(Float::nearest(2.5f64).to_bits(), 2.0f64.to_bits());
        assert_eq!(Float::nearest(3.5f64).to_bits(), 4.0f64.to_bits());
        assert_eq!(Float::nearest(-2.5f64).to_bits(), (-2.0f64).to_bits());
        assert_eq!(Float::nearest(0.5f64).to_bits(), 0.0f64.to_bits());
        assert_eq!(Float::nearest(-0.5f64).to_bits(), (-0.0f64).to_bits());
    }

    #[test]
    fn reinterpret_roundtrips_bits() {
        let bits: i64 = 0x7ff8_0000_0000_cafe_u64 as i64;
        let as_float: f64 = bits.transmute_into();
        let back: i64 = as_float.transmute_into();
        assert_eq!(bits, back);
    }
}
