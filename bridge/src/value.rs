//! Host value model.
//!
//! Every host value crossing into a module travels as an `externref` that
//! carries a `HostValue`. Reference kinds (arrays, buffers, objects,
//! functions) share their payload through `Arc`, so cloning a value never
//! copies the underlying storage and identity survives any number of
//! round trips.

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Weak};

use spin::Mutex;
use wasmtime::ExternRef;

use crate::deferred::DeferredModule;
use crate::finalization::FinalizationRegistry;
use crate::function::{HostFunction, WeakFunction};

/// Whether the host stores multi-byte elements little-endian.
pub const NATIVE_LITTLE_ENDIAN: bool = cfg!(target_endian = "little");

// ---------------------------------------------------------------------------
// Type tags
// ---------------------------------------------------------------------------

/// Type tag of a host value as reported to the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ValueKind {
    Undefined = 1,
    Boolean = 2,
    Number = 3,
    String = 4,
    Array = 5,
    Int8Array = 6,
    Uint8Array = 7,
    Uint8ClampedArray = 8,
    Int16Array = 9,
    Uint16Array = 10,
    Int32Array = 11,
    Uint32Array = 12,
    Float32Array = 13,
    Float64Array = 14,
    DataView = 15,
    ArrayBuffer = 16,
    /// Anything else: null, objects, functions, modules, errors.
    Other = 17,
}

impl ValueKind {
    /// Numeric tag passed to the module.
    pub fn tag(self) -> i32 {
        self as i32
    }

    /// Parse a numeric tag.
    pub fn from_tag(tag: i32) -> Option<Self> {
        let kind = match tag {
            1 => ValueKind::Undefined,
            2 => ValueKind::Boolean,
            3 => ValueKind::Number,
            4 => ValueKind::String,
            5 => ValueKind::Array,
            6 => ValueKind::Int8Array,
            7 => ValueKind::Uint8Array,
            8 => ValueKind::Uint8ClampedArray,
            9 => ValueKind::Int16Array,
            10 => ValueKind::Uint16Array,
            11 => ValueKind::Int32Array,
            12 => ValueKind::Uint32Array,
            13 => ValueKind::Float32Array,
            14 => ValueKind::Float64Array,
            15 => ValueKind::DataView,
            16 => ValueKind::ArrayBuffer,
            17 => ValueKind::Other,
            _ => return None,
        };
        Some(kind)
    }

    /// Element kind for typed array tags.
    pub fn element_kind(self) -> Option<ElementKind> {
        let kind = match self {
            ValueKind::Int8Array => ElementKind::Int8,
            ValueKind::Uint8Array => ElementKind::Uint8,
            ValueKind::Uint8ClampedArray => ElementKind::Uint8Clamped,
            ValueKind::Int16Array => ElementKind::Int16,
            ValueKind::Uint16Array => ElementKind::Uint16,
            ValueKind::Int32Array => ElementKind::Int32,
            ValueKind::Uint32Array => ElementKind::Uint32,
            ValueKind::Float32Array => ElementKind::Float32,
            ValueKind::Float64Array => ElementKind::Float64,
            _ => return None,
        };
        Some(kind)
    }
}

/// Element type of a typed array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float32,
    Float64,
}

impl ElementKind {
    /// Every element kind, in tag order.
    pub const ALL: [ElementKind; 9] = [
        ElementKind::Int8,
        ElementKind::Uint8,
        ElementKind::Uint8Clamped,
        ElementKind::Int16,
        ElementKind::Uint16,
        ElementKind::Int32,
        ElementKind::Uint32,
        ElementKind::Float32,
        ElementKind::Float64,
    ];

    /// Parse a typed array type tag.
    pub fn from_tag(tag: i32) -> Option<Self> {
        ValueKind::from_tag(tag)?.element_kind()
    }

    /// Element width in bytes.
    pub fn width(self) -> usize {
        match self {
            ElementKind::Int8 | ElementKind::Uint8 | ElementKind::Uint8Clamped => 1,
            ElementKind::Int16 | ElementKind::Uint16 => 2,
            ElementKind::Int32 | ElementKind::Uint32 | ElementKind::Float32 => 4,
            ElementKind::Float64 => 8,
        }
    }

    /// Whether the element type is a signed integer.
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ElementKind::Int8 | ElementKind::Int16 | ElementKind::Int32
        )
    }

    /// Whether the element type is floating point.
    pub fn is_float(self) -> bool {
        matches!(self, ElementKind::Float32 | ElementKind::Float64)
    }

    /// Type tag of arrays with this element kind.
    pub fn value_kind(self) -> ValueKind {
        match self {
            ElementKind::Int8 => ValueKind::Int8Array,
            ElementKind::Uint8 => ValueKind::Uint8Array,
            ElementKind::Uint8Clamped => ValueKind::Uint8ClampedArray,
            ElementKind::Int16 => ValueKind::Int16Array,
            ElementKind::Uint16 => ValueKind::Uint16Array,
            ElementKind::Int32 => ValueKind::Int32Array,
            ElementKind::Uint32 => ValueKind::Uint32Array,
            ElementKind::Float32 => ValueKind::Float32Array,
            ElementKind::Float64 => ValueKind::Float64Array,
        }
    }

    /// Decode one element stored in host byte order.
    fn decode(self, bytes: &[u8]) -> f64 {
        match self {
            ElementKind::Int8 => f64::from(i8::from_ne_bytes(array(bytes))),
            ElementKind::Uint8 | ElementKind::Uint8Clamped => f64::from(bytes[0]),
            ElementKind::Int16 => f64::from(i16::from_ne_bytes(array(bytes))),
            ElementKind::Uint16 => f64::from(u16::from_ne_bytes(array(bytes))),
            ElementKind::Int32 => f64::from(i32::from_ne_bytes(array(bytes))),
            ElementKind::Uint32 => f64::from(u32::from_ne_bytes(array(bytes))),
            ElementKind::Float32 => f64::from(f32::from_ne_bytes(array(bytes))),
            ElementKind::Float64 => f64::from_ne_bytes(array(bytes)),
        }
    }

    /// Encode one element in host byte order, applying the number
    /// conversion of the element type (modular for integers, clamped for
    /// `Uint8Clamped`).
    fn encode(self, value: f64, out: &mut [u8]) {
        let bits = to_uint32_bits(value);
        match self {
            ElementKind::Int8 => out.copy_from_slice(&(bits as u8 as i8).to_ne_bytes()),
            ElementKind::Uint8 => out[0] = bits as u8,
            ElementKind::Uint8Clamped => out[0] = to_uint8_clamp(value),
            ElementKind::Int16 => out.copy_from_slice(&(bits as u16 as i16).to_ne_bytes()),
            ElementKind::Uint16 => out.copy_from_slice(&(bits as u16).to_ne_bytes()),
            ElementKind::Int32 => out.copy_from_slice(&(bits as i32).to_ne_bytes()),
            ElementKind::Uint32 => out.copy_from_slice(&bits.to_ne_bytes()),
            ElementKind::Float32 => out.copy_from_slice(&(value as f32).to_ne_bytes()),
            ElementKind::Float64 => out.copy_from_slice(&value.to_ne_bytes()),
        }
    }
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Number to 32-bit pattern, modulo 2^32 (NaN and infinities become 0).
fn to_uint32_bits(value: f64) -> u32 {
    if !value.is_finite() {
        return 0;
    }
    value.trunc().rem_euclid(4_294_967_296.0) as u32
}

/// Number to byte, clamped to 0..=255 with round-half-to-even.
fn to_uint8_clamp(value: f64) -> u8 {
    if value.is_nan() || value <= 0.0 {
        return 0;
    }
    if value >= 255.0 {
        return 255;
    }
    let floor = value.floor();
    let diff = value - floor;
    let rounded = if diff > 0.5 {
        floor + 1.0
    } else if diff < 0.5 || floor % 2.0 == 0.0 {
        floor
    } else {
        floor + 1.0
    };
    rounded as u8
}

/// Reorder one element between host order and little-endian.
fn swap_le(chunk: &mut [u8]) {
    if !NATIVE_LITTLE_ENDIAN {
        chunk.reverse();
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A value could not be converted across the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum MarshalError {
    /// The externref does not carry a bridge host value.
    ForeignReference,
    /// A null reference was passed where a value is required.
    NullReference,
    /// The value has the wrong kind for the conversion.
    TypeMismatch {
        expected: &'static str,
        found: ValueKind,
    },
    /// The function value did not originate in the module.
    NotModuleFunction,
    /// Unknown type tag.
    InvalidTypeTag(i32),
    /// Access outside the bounds of a string, array, buffer or memory.
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    /// A reserved export needed for the conversion is missing.
    MissingExport(String),
    /// A reserved export has an unexpected signature or returned a bad value.
    UnexpectedResult(String),
    /// The primary instance is not linked yet.
    NotLinked,
    /// No trampoline exists for functions of this arity.
    UnsupportedArity(usize),
}

impl fmt::Display for MarshalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarshalError::ForeignReference => {
                write!(f, "externref does not carry a host value")
            }
            MarshalError::NullReference => write!(f, "unexpected null reference"),
            MarshalError::TypeMismatch { expected, found } => {
                write!(f, "expected {}, found {:?}", expected, found)
            }
            MarshalError::NotModuleFunction => {
                write!(f, "function was not created by the module")
            }
            MarshalError::InvalidTypeTag(tag) => write!(f, "invalid type tag {}", tag),
            MarshalError::OutOfBounds { offset, len, size } => write!(
                f,
                "access out of bounds: {} + {} > {}",
                offset, len, size
            ),
            MarshalError::MissingExport(name) => write!(f, "missing export `{}`", name),
            MarshalError::UnexpectedResult(name) => {
                write!(f, "export `{}` returned an unexpected result", name)
            }
            MarshalError::NotLinked => write!(f, "primary instance is not linked"),
            MarshalError::UnsupportedArity(arity) => {
                write!(f, "no trampoline for functions of arity {}", arity)
            }
        }
    }
}

impl std::error::Error for MarshalError {}

fn check_range(offset: usize, len: usize, size: usize) -> Result<(), MarshalError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(MarshalError::OutOfBounds { offset, len, size }),
    }
}

// ---------------------------------------------------------------------------
// Strings
// ---------------------------------------------------------------------------

/// Immutable sequence of UTF-16 code units.
///
/// Unpaired surrogates are preserved as-is; conversion to `String` is lossy.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostString(Arc<[u16]>);

impl HostString {
    /// Create a string from raw code units.
    pub fn from_units(units: impl Into<Arc<[u16]>>) -> Self {
        HostString(units.into())
    }

    /// The empty string.
    pub fn empty() -> Self {
        HostString(Arc::from(Vec::new()))
    }

    /// Single code unit string (`String.fromCharCode`).
    pub fn from_char_code(code: u16) -> Self {
        HostString(Arc::from(vec![code]))
    }

    /// Code units.
    pub fn units(&self) -> &[u16] {
        &self.0
    }

    /// Length in code units.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the string is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Code unit at `index`.
    pub fn char_code_at(&self, index: usize) -> Option<u16> {
        self.0.get(index).copied()
    }

    /// Concatenate two strings.
    pub fn concat(&self, other: &HostString) -> HostString {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut units = Vec::with_capacity(self.len() + other.len());
        units.extend_from_slice(&self.0);
        units.extend_from_slice(&other.0);
        HostString::from_units(units)
    }

    /// Code units `start..end`, both clamped to the length.
    /// Returns the empty string when `start >= end`.
    pub fn substring(&self, start: usize, end: usize) -> HostString {
        let end = end.min(self.len());
        let start = start.min(end);
        if start == 0 && end == self.len() {
            return self.clone();
        }
        HostString::from_units(&self.0[start..end])
    }

    /// Convert to a Rust string, replacing unpaired surrogates.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }
}

impl From<&str> for HostString {
    fn from(s: &str) -> Self {
        HostString::from_units(s.encode_utf16().collect::<Vec<u16>>())
    }
}

impl From<String> for HostString {
    fn from(s: String) -> Self {
        HostString::from(s.as_str())
    }
}

impl fmt::Display for HostString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl fmt::Debug for HostString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

/// Raw byte buffer shared by typed arrays and data views.
#[derive(Clone)]
pub struct ArrayBuffer(Arc<Mutex<Vec<u8>>>);

impl ArrayBuffer {
    /// Zero-filled buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        ArrayBuffer(Arc::new(Mutex::new(vec![0; len])))
    }

    /// Buffer taking ownership of `bytes`.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        ArrayBuffer(Arc::new(Mutex::new(bytes)))
    }

    /// Size in bytes.
    pub fn byte_length(&self) -> usize {
        self.0.lock().len()
    }

    /// Copy of the whole buffer.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.lock().clone()
    }

    /// Copy `len` bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, MarshalError> {
        let data = self.0.lock();
        check_range(offset, len, data.len())?;
        Ok(data[offset..offset + len].to_vec())
    }

    /// Overwrite bytes starting at `offset`.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<(), MarshalError> {
        let mut data = self.0.lock();
        check_range(offset, bytes.len(), data.len())?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Whether both handles refer to the same buffer.
    pub fn ptr_eq(a: &ArrayBuffer, b: &ArrayBuffer) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    fn with_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.0.lock())
    }
}

impl fmt::Debug for ArrayBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArrayBuffer({})", self.byte_length())
    }
}

/// Typed view over an `ArrayBuffer`. Elements are stored in host byte order.
#[derive(Clone, Debug)]
pub struct TypedArray {
    kind: ElementKind,
    buffer: ArrayBuffer,
    byte_offset: usize,
    length: usize,
}

impl TypedArray {
    /// Zero-filled array of `length` elements.
    pub fn new(kind: ElementKind, length: usize) -> Self {
        TypedArray {
            kind,
            buffer: ArrayBuffer::new(length * kind.width()),
            byte_offset: 0,
            length,
        }
    }

    /// Array holding `values`, converted to the element type.
    pub fn from_values(kind: ElementKind, values: &[f64]) -> Self {
        let array = TypedArray::new(kind, values.len());
        let width = kind.width();
        array.buffer.with_bytes(|bytes| {
            for (chunk, value) in bytes.chunks_exact_mut(width).zip(values) {
                kind.encode(*value, chunk);
            }
        });
        array
    }

    /// View `length` elements of `buffer` starting at `byte_offset`.
    pub fn view(
        kind: ElementKind,
        buffer: ArrayBuffer,
        byte_offset: usize,
        length: usize,
    ) -> Result<Self, MarshalError> {
        let byte_length = length
            .checked_mul(kind.width())
            .ok_or(MarshalError::OutOfBounds {
                offset: byte_offset,
                len: length,
                size: buffer.byte_length(),
            })?;
        check_range(byte_offset, byte_length, buffer.byte_length())?;
        if byte_offset % kind.width() != 0 {
            return Err(MarshalError::OutOfBounds {
                offset: byte_offset,
                len: byte_length,
                size: buffer.byte_length(),
            });
        }
        Ok(TypedArray {
            kind,
            buffer,
            byte_offset,
            length,
        })
    }

    /// Element kind.
    pub fn kind(&self) -> ElementKind {
        self.kind
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Backing buffer.
    pub fn buffer(&self) -> &ArrayBuffer {
        &self.buffer
    }

    /// Offset of the first element in the backing buffer.
    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Size of the view in bytes.
    pub fn byte_length(&self) -> usize {
        self.length * self.kind.width()
    }

    /// Element at `index` as a number.
    pub fn get(&self, index: usize) -> Option<f64> {
        if index >= self.length {
            return None;
        }
        let width = self.kind.width();
        let start = self.byte_offset + index * width;
        let kind = self.kind;
        Some(self.buffer.with_bytes(|bytes| kind.decode(&bytes[start..start + width])))
    }

    /// Store `value` at `index`, converted to the element type.
    pub fn set(&self, index: usize, value: f64) -> Result<(), MarshalError> {
        check_range(index, 1, self.length)?;
        let width = self.kind.width();
        let start = self.byte_offset + index * width;
        let kind = self.kind;
        self.buffer
            .with_bytes(|bytes| kind.encode(value, &mut bytes[start..start + width]));
        Ok(())
    }

    /// All elements as numbers.
    pub fn to_vec(&self) -> Vec<f64> {
        (0..self.length).filter_map(|i| self.get(i)).collect()
    }

    /// `count` elements from `start`, little-endian (the module's layout).
    pub fn to_le_bytes(&self, start: usize, count: usize) -> Result<Vec<u8>, MarshalError> {
        check_range(start, count, self.length)?;
        let width = self.kind.width();
        let mut bytes = self
            .buffer
            .read(self.byte_offset + start * width, count * width)?;
        for chunk in bytes.chunks_exact_mut(width) {
            swap_le(chunk);
        }
        Ok(bytes)
    }

    /// Overwrite elements from `start` with little-endian `bytes`.
    pub fn set_from_le_bytes(&self, start: usize, bytes: &[u8]) -> Result<(), MarshalError> {
        let width = self.kind.width();
        check_range(start, bytes.len() / width, self.length)?;
        let mut native = bytes[..bytes.len() - bytes.len() % width].to_vec();
        for chunk in native.chunks_exact_mut(width) {
            swap_le(chunk);
        }
        self.buffer.write(self.byte_offset + start * width, &native)
    }
}

macro_rules! data_view_accessors {
    ($($get:ident, $set:ident, $ty:ty, $width:literal;)*) => {
        $(
            /// Read a value at `offset` relative to the view.
            pub fn $get(&self, offset: usize, little_endian: bool) -> Result<$ty, MarshalError> {
                let raw = self.read_raw::<$width>(offset)?;
                Ok(if little_endian {
                    <$ty>::from_le_bytes(raw)
                } else {
                    <$ty>::from_be_bytes(raw)
                })
            }

            /// Write a value at `offset` relative to the view.
            pub fn $set(
                &self,
                offset: usize,
                value: $ty,
                little_endian: bool,
            ) -> Result<(), MarshalError> {
                let raw = if little_endian {
                    value.to_le_bytes()
                } else {
                    value.to_be_bytes()
                };
                check_range(offset, $width, self.byte_length)?;
                self.buffer.write(self.byte_offset + offset, &raw)
            }
        )*
    };
}

/// Untyped view over an `ArrayBuffer` with explicit-endianness accessors.
#[derive(Clone, Debug)]
pub struct DataView {
    buffer: ArrayBuffer,
    byte_offset: usize,
    byte_length: usize,
}

impl DataView {
    /// View over a fresh zero-filled buffer.
    pub fn new(byte_length: usize) -> Self {
        DataView {
            buffer: ArrayBuffer::new(byte_length),
            byte_offset: 0,
            byte_length,
        }
    }

    /// View over a fresh buffer holding `bytes`.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let byte_length = bytes.len();
        DataView {
            buffer: ArrayBuffer::from_bytes(bytes),
            byte_offset: 0,
            byte_length,
        }
    }

    /// View `byte_length` bytes of `buffer` starting at `byte_offset`.
    pub fn over(
        buffer: ArrayBuffer,
        byte_offset: usize,
        byte_length: usize,
    ) -> Result<Self, MarshalError> {
        check_range(byte_offset, byte_length, buffer.byte_length())?;
        Ok(DataView {
            buffer,
            byte_offset,
            byte_length,
        })
    }

    /// Backing buffer.
    pub fn buffer(&self) -> &ArrayBuffer {
        &self.buffer
    }

    /// Offset of the view in the backing buffer.
    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    /// Size of the view in bytes.
    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    /// Copy `len` bytes at `offset` into a view over a new buffer.
    pub fn copy(&self, offset: usize, len: usize) -> Result<DataView, MarshalError> {
        check_range(offset, len, self.byte_length)?;
        let bytes = self.buffer.read(self.byte_offset + offset, len)?;
        Ok(DataView::from_bytes(bytes))
    }

    /// Copy of the viewed bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer
            .read(self.byte_offset, self.byte_length)
            .unwrap_or_default()
    }

    fn read_raw<const N: usize>(&self, offset: usize) -> Result<[u8; N], MarshalError> {
        check_range(offset, N, self.byte_length)?;
        let bytes = self.buffer.read(self.byte_offset + offset, N)?;
        Ok(array(&bytes))
    }

    data_view_accessors! {
        get_int8, set_int8, i8, 1;
        get_uint8, set_uint8, u8, 1;
        get_int16, set_int16, i16, 2;
        get_uint16, set_uint16, u16, 2;
        get_int32, set_int32, i32, 4;
        get_uint32, set_uint32, u32, 4;
        get_big_int64, set_big_int64, i64, 8;
        get_big_uint64, set_big_uint64, u64, 8;
        get_float32, set_float32, f32, 4;
        get_float64, set_float64, f64, 8;
    }
}

// ---------------------------------------------------------------------------
// Arrays and objects
// ---------------------------------------------------------------------------

/// Growable array of host values.
#[derive(Clone, Default)]
pub struct HostArray(Arc<Mutex<Vec<HostValue>>>);

impl HostArray {
    /// Empty array.
    pub fn new() -> Self {
        Self::default()
    }

    /// Array holding `values`.
    pub fn from_values(values: Vec<HostValue>) -> Self {
        HostArray(Arc::new(Mutex::new(values)))
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Element at `index`; holes and out-of-range reads are `undefined`.
    pub fn get(&self, index: usize) -> HostValue {
        self.0
            .lock()
            .get(index)
            .cloned()
            .unwrap_or(HostValue::Undefined)
    }

    /// Store at `index`, growing the array with `undefined` as needed.
    pub fn set(&self, index: usize, value: HostValue) {
        let mut values = self.0.lock();
        if index >= values.len() {
            values.resize(index + 1, HostValue::Undefined);
        }
        values[index] = value;
    }

    /// Append a value.
    pub fn push(&self, value: HostValue) {
        self.0.lock().push(value);
    }

    /// Snapshot of the elements.
    pub fn to_vec(&self) -> Vec<HostValue> {
        self.0.lock().clone()
    }

    /// Whether both handles refer to the same array.
    pub fn ptr_eq(a: &HostArray, b: &HostArray) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

thread_local! {
    /// Arrays and objects being formatted on this thread.
    static FORMATTING: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

/// Run `body` unless `ptr` is already being formatted further up the stack,
/// in which case `[...]` is written instead.
fn format_once(
    ptr: usize,
    f: &mut fmt::Formatter<'_>,
    body: impl FnOnce(&mut fmt::Formatter<'_>) -> fmt::Result,
) -> fmt::Result {
    let reentered = FORMATTING.with(|active| {
        let mut active = active.borrow_mut();
        if active.contains(&ptr) {
            true
        } else {
            active.push(ptr);
            false
        }
    });
    if reentered {
        return f.write_str("[...]");
    }
    let result = body(f);
    FORMATTING.with(|active| active.borrow_mut().pop());
    result
}

impl fmt::Debug for HostArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_once(Arc::as_ptr(&self.0) as usize, f, |f| {
            f.debug_list().entries(self.to_vec()).finish()
        })
    }
}

/// Property bag keyed by string, kept in insertion order.
#[derive(Clone, Default)]
pub struct HostObject(Arc<Mutex<Vec<(HostString, HostValue)>>>);

impl HostObject {
    /// Empty object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Property value, if present.
    pub fn get(&self, key: &HostString) -> Option<HostValue> {
        self.0
            .lock()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Insert or replace a property.
    pub fn set(&self, key: HostString, value: HostValue) {
        let mut props = self.0.lock();
        match props.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => props.push((key, value)),
        }
    }

    /// Whether the property exists.
    pub fn has(&self, key: &HostString) -> bool {
        self.0.lock().iter().any(|(k, _)| k == key)
    }

    /// Remove a property, returning whether it existed.
    pub fn delete(&self, key: &HostString) -> bool {
        let mut props = self.0.lock();
        let before = props.len();
        props.retain(|(k, _)| k != key);
        props.len() != before
    }

    /// Property names in insertion order.
    pub fn keys(&self) -> Vec<HostString> {
        self.0.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Whether both handles refer to the same object.
    pub fn ptr_eq(a: &HostObject, b: &HostObject) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_once(Arc::as_ptr(&self.0) as usize, f, |f| {
            let props = self.0.lock().clone();
            f.debug_map()
                .entries(props.iter().map(|(k, v)| (k, v)))
                .finish()
        })
    }
}

/// An error surfaced to the module as a value (e.g. a failed deferred load).
#[derive(Clone)]
pub struct HostError(Arc<anyhow::Error>);

impl HostError {
    /// Wrap an error without altering it.
    pub fn new(error: anyhow::Error) -> Self {
        HostError(Arc::new(error))
    }

    /// The wrapped error.
    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    /// Error message including its causes.
    pub fn message(&self) -> String {
        format!("{:#}", self.0)
    }

    /// Downcast the wrapped error.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Debug for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostError({})", self.message())
    }
}

// ---------------------------------------------------------------------------
// HostValue
// ---------------------------------------------------------------------------

/// A host value as seen by the bridge.
#[derive(Clone, Debug)]
pub enum HostValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(HostString),
    Array(HostArray),
    TypedArray(TypedArray),
    DataView(DataView),
    ArrayBuffer(ArrayBuffer),
    Function(HostFunction),
    Object(HostObject),
    /// A linked deferred module.
    Module(DeferredModule),
    Error(HostError),
    FinalizationRegistry(FinalizationRegistry),
}

impl HostValue {
    /// Type tag reported to the module.
    pub fn kind(&self) -> ValueKind {
        match self {
            HostValue::Undefined => ValueKind::Undefined,
            HostValue::Bool(_) => ValueKind::Boolean,
            HostValue::Number(_) => ValueKind::Number,
            HostValue::String(_) => ValueKind::String,
            HostValue::Array(_) => ValueKind::Array,
            HostValue::TypedArray(a) => a.kind().value_kind(),
            HostValue::DataView(_) => ValueKind::DataView,
            HostValue::ArrayBuffer(_) => ValueKind::ArrayBuffer,
            HostValue::Null
            | HostValue::Function(_)
            | HostValue::Object(_)
            | HostValue::Module(_)
            | HostValue::Error(_)
            | HostValue::FinalizationRegistry(_) => ValueKind::Other,
        }
    }

    /// Whether the value is `undefined`.
    pub fn is_undefined(&self) -> bool {
        matches!(self, HostValue::Undefined)
    }

    /// Boolean coercion.
    pub fn truthy(&self) -> bool {
        match self {
            HostValue::Undefined | HostValue::Null => false,
            HostValue::Bool(b) => *b,
            HostValue::Number(n) => *n != 0.0 && !n.is_nan(),
            HostValue::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Strict equality: primitives by value, everything else by identity.
    pub fn strict_equals(&self, other: &HostValue) -> bool {
        match (self, other) {
            (HostValue::Undefined, HostValue::Undefined) => true,
            (HostValue::Null, HostValue::Null) => true,
            (HostValue::Bool(a), HostValue::Bool(b)) => a == b,
            (HostValue::Number(a), HostValue::Number(b)) => a == b,
            (HostValue::String(a), HostValue::String(b)) => a == b,
            (HostValue::Array(a), HostValue::Array(b)) => HostArray::ptr_eq(a, b),
            (HostValue::TypedArray(a), HostValue::TypedArray(b)) => {
                ArrayBuffer::ptr_eq(a.buffer(), b.buffer())
                    && a.kind() == b.kind()
                    && a.byte_offset() == b.byte_offset()
                    && a.len() == b.len()
            }
            (HostValue::DataView(a), HostValue::DataView(b)) => {
                ArrayBuffer::ptr_eq(a.buffer(), b.buffer())
                    && a.byte_offset() == b.byte_offset()
                    && a.byte_length() == b.byte_length()
            }
            (HostValue::ArrayBuffer(a), HostValue::ArrayBuffer(b)) => ArrayBuffer::ptr_eq(a, b),
            (HostValue::Function(a), HostValue::Function(b)) => HostFunction::ptr_eq(a, b),
            (HostValue::Object(a), HostValue::Object(b)) => HostObject::ptr_eq(a, b),
            (HostValue::Module(a), HostValue::Module(b)) => DeferredModule::ptr_eq(a, b),
            (HostValue::Error(a), HostValue::Error(b)) => Arc::ptr_eq(&a.0, &b.0),
            (HostValue::FinalizationRegistry(a), HostValue::FinalizationRegistry(b)) => {
                FinalizationRegistry::ptr_eq(a, b)
            }
            _ => false,
        }
    }

    /// String conversion used by `print` and `to_display_string`.
    pub fn to_display_string(&self) -> HostString {
        match self {
            HostValue::String(s) => s.clone(),
            other => HostString::from(other.display_text()),
        }
    }

    fn display_text(&self) -> String {
        self.display_text_in(&mut Vec::new())
    }

    /// `joining` holds the arrays currently being joined; an array met again
    /// inside itself renders as the empty string.
    fn display_text_in(&self, joining: &mut Vec<*const Mutex<Vec<HostValue>>>) -> String {
        match self {
            HostValue::Undefined => "undefined".into(),
            HostValue::Null => "null".into(),
            HostValue::Bool(b) => b.to_string(),
            HostValue::Number(n) => format_number(*n),
            HostValue::String(s) => s.to_string_lossy(),
            HostValue::Array(a) => {
                let ptr = Arc::as_ptr(&a.0);
                if joining.contains(&ptr) {
                    return String::new();
                }
                joining.push(ptr);
                let text = a
                    .to_vec()
                    .iter()
                    .map(|v| match v {
                        HostValue::Undefined | HostValue::Null => String::new(),
                        v => v.display_text_in(joining),
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                joining.pop();
                text
            }
            HostValue::TypedArray(a) => a
                .to_vec()
                .into_iter()
                .map(format_number)
                .collect::<Vec<_>>()
                .join(","),
            HostValue::DataView(_) => "[object DataView]".into(),
            HostValue::ArrayBuffer(_) => "[object ArrayBuffer]".into(),
            HostValue::Function(_) => "function () { [native code] }".into(),
            HostValue::Object(_) => "[object Object]".into(),
            HostValue::Module(m) => format!("[object Module {}]", m.name()),
            HostValue::Error(e) => e.message(),
            HostValue::FinalizationRegistry(_) => "[object FinalizationRegistry]".into(),
        }
    }

    /// Borrow the string payload.
    pub fn as_string(&self) -> Result<&HostString, MarshalError> {
        match self {
            HostValue::String(s) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    /// Number payload.
    pub fn as_number(&self) -> Result<f64, MarshalError> {
        match self {
            HostValue::Number(n) => Ok(*n),
            other => Err(other.mismatch("number")),
        }
    }

    /// Borrow the array payload.
    pub fn as_array(&self) -> Result<&HostArray, MarshalError> {
        match self {
            HostValue::Array(a) => Ok(a),
            other => Err(other.mismatch("array")),
        }
    }

    /// Borrow the typed array payload.
    pub fn as_typed_array(&self) -> Result<&TypedArray, MarshalError> {
        match self {
            HostValue::TypedArray(a) => Ok(a),
            other => Err(other.mismatch("typed array")),
        }
    }

    /// Borrow the data view payload.
    pub fn as_data_view(&self) -> Result<&DataView, MarshalError> {
        match self {
            HostValue::DataView(v) => Ok(v),
            other => Err(other.mismatch("data view")),
        }
    }

    /// Borrow the function payload.
    pub fn as_function(&self) -> Result<&HostFunction, MarshalError> {
        match self {
            HostValue::Function(f) => Ok(f),
            other => Err(other.mismatch("function")),
        }
    }

    /// Borrow the object payload.
    pub fn as_object(&self) -> Result<&HostObject, MarshalError> {
        match self {
            HostValue::Object(o) => Ok(o),
            other => Err(other.mismatch("object")),
        }
    }

    /// Borrow the finalization registry payload.
    pub fn as_finalization_registry(&self) -> Result<&FinalizationRegistry, MarshalError> {
        match self {
            HostValue::FinalizationRegistry(r) => Ok(r),
            other => Err(other.mismatch("finalization registry")),
        }
    }

    fn mismatch(&self, expected: &'static str) -> MarshalError {
        match self {
            HostValue::Null => MarshalError::NullReference,
            other => MarshalError::TypeMismatch {
                expected,
                found: other.kind(),
            },
        }
    }

    /// Wrap for the module. `null` becomes a null reference.
    pub fn to_extern(self) -> Option<ExternRef> {
        match self {
            HostValue::Null => None,
            value => Some(ExternRef::new(value)),
        }
    }

    /// Unwrap a reference received from the module.
    pub fn from_extern(reference: Option<&ExternRef>) -> Result<HostValue, MarshalError> {
        match reference {
            None => Ok(HostValue::Null),
            Some(r) => r
                .data()
                .downcast_ref::<HostValue>()
                .cloned()
                .ok_or(MarshalError::ForeignReference),
        }
    }
}

/// Weak handle to a reference-kind host value. Views (typed arrays, data
/// views) are tracked through their backing buffer.
#[derive(Clone)]
pub(crate) enum WeakValue {
    Array(Weak<Mutex<Vec<HostValue>>>),
    Object(Weak<Mutex<Vec<(HostString, HostValue)>>>),
    Buffer(Weak<Mutex<Vec<u8>>>),
    Function(WeakFunction),
    Error(Weak<anyhow::Error>),
}

impl WeakValue {
    /// `None` for primitives, null, modules and registries.
    pub(crate) fn new(value: &HostValue) -> Option<Self> {
        let weak = match value {
            HostValue::Array(a) => WeakValue::Array(Arc::downgrade(&a.0)),
            HostValue::Object(o) => WeakValue::Object(Arc::downgrade(&o.0)),
            HostValue::ArrayBuffer(b) => WeakValue::Buffer(Arc::downgrade(&b.0)),
            HostValue::TypedArray(a) => WeakValue::Buffer(Arc::downgrade(&a.buffer.0)),
            HostValue::DataView(v) => WeakValue::Buffer(Arc::downgrade(&v.buffer.0)),
            HostValue::Function(f) => WeakValue::Function(f.downgrade()),
            HostValue::Error(e) => WeakValue::Error(Arc::downgrade(&e.0)),
            _ => return None,
        };
        Some(weak)
    }

    pub(crate) fn is_alive(&self) -> bool {
        match self {
            WeakValue::Array(w) => w.strong_count() > 0,
            WeakValue::Object(w) => w.strong_count() > 0,
            WeakValue::Buffer(w) => w.strong_count() > 0,
            WeakValue::Function(w) => w.is_alive(),
            WeakValue::Error(w) => w.strong_count() > 0,
        }
    }

    /// Whether `value` is the value this handle was taken from.
    pub(crate) fn refers_to(&self, value: &HostValue) -> bool {
        match (self, WeakValue::new(value)) {
            (WeakValue::Array(a), Some(WeakValue::Array(b))) => a.ptr_eq(&b),
            (WeakValue::Object(a), Some(WeakValue::Object(b))) => a.ptr_eq(&b),
            (WeakValue::Buffer(a), Some(WeakValue::Buffer(b))) => a.ptr_eq(&b),
            (WeakValue::Function(a), Some(WeakValue::Function(b))) => a.ptr_eq(&b),
            (WeakValue::Error(a), Some(WeakValue::Error(b))) => a.ptr_eq(&b),
            _ => false,
        }
    }
}

/// Number to string with the ECMAScript `Number::toString` layout: plain
/// decimal for exponents in `-7..21`, exponent form otherwise.
fn format_number(n: f64) -> String {
    if n.is_nan() {
        return "NaN".into();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.into();
    }
    if n == 0.0 {
        return "0".into();
    }

    // Shortest round-trip digits and decimal exponent, e.g. "1.25e-7".
    let sci = format!("{:e}", n.abs());
    let (mantissa, exp) = match sci.split_once('e') {
        Some(parts) => parts,
        None => return format!("{}", n),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let exp: i32 = match exp.parse() {
        Ok(e) => e,
        Err(_) => return format!("{}", n),
    };
    let k = digits.len() as i32;
    let point = exp + 1;

    let body = if k <= point && point <= 21 {
        format!("{}{}", digits, "0".repeat((point - k) as usize))
    } else if 0 < point && point <= 21 {
        let (int, frac) = digits.split_at(point as usize);
        format!("{}.{}", int, frac)
    } else if -6 < point && point <= 0 {
        format!("0.{}{}", "0".repeat((-point) as usize), digits)
    } else {
        let sign = if point - 1 < 0 { '-' } else { '+' };
        let (first, rest) = digits.split_at(1);
        if rest.is_empty() {
            format!("{}e{}{}", first, sign, (point - 1).abs())
        } else {
            format!("{}.{}e{}{}", first, rest, sign, (point - 1).abs())
        }
    };

    if n < 0.0 {
        format!("-{}", body)
    } else {
        body
    }
}

impl From<bool> for HostValue {
    fn from(b: bool) -> Self {
        HostValue::Bool(b)
    }
}

impl From<f64> for HostValue {
    fn from(n: f64) -> Self {
        HostValue::Number(n)
    }
}

impl From<&str> for HostValue {
    fn from(s: &str) -> Self {
        HostValue::String(HostString::from(s))
    }
}

impl From<HostString> for HostValue {
    fn from(s: HostString) -> Self {
        HostValue::String(s)
    }
}

impl From<TypedArray> for HostValue {
    fn from(a: TypedArray) -> Self {
        HostValue::TypedArray(a)
    }
}

impl From<HostArray> for HostValue {
    fn from(a: HostArray) -> Self {
        HostValue::Array(a)
    }
}

impl From<HostObject> for HostValue {
    fn from(o: HostObject) -> Self {
        HostValue::Object(o)
    }
}
