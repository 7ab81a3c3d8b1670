//! Value memory: a growable byte arena addressed by `u32` offsets.
//!
//! Compiled code never holds a raw pointer into the heap across a call; it
//! holds offsets and re-derives the base after anything that may allocate.
//! [`Value`] is the dynamic mirror used to build inputs and inspect outputs.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::schema::{BOX_CELL_SIZE, Field, Kind, TypeDescriptor};

/// Offset 0 is the nil pointer; the first word is never handed out.
pub const NIL: u32 = 0;
const HEAP_ALIGN: usize = 8;
const RESERVED: usize = 8;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValueError {
    #[error("expected a {expected} value, found {found}")]
    TypeMismatch { expected: Kind, found: &'static str },

    #[error("struct {name} has {expected} fields, value has {found}")]
    FieldCount {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("heap exhausted")]
    HeapExhausted,

    #[error(transparent)]
    Schema(#[from] crate::error::CompileError),
}

// ─── Heap ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Heap {
    bytes: Vec<u8>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Heap({} bytes)", self.bytes.len())
    }
}

impl Heap {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let mut bytes = Vec::with_capacity(capacity.max(RESERVED));
        bytes.resize(RESERVED, 0);
        Heap { bytes }
    }

    /// Allocates `size` zeroed bytes aligned to 8. Never returns [`NIL`],
    /// even for `size == 0`. `None` once offsets would leave the `u32` range.
    pub fn alloc(&mut self, size: usize) -> Option<u32> {
        let start = self.bytes.len().next_multiple_of(HEAP_ALIGN);
        let end = start.checked_add(size)?;
        if end > u32::MAX as usize {
            return None;
        }
        self.bytes.resize(end, 0);
        Some(start as u32)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.len() <= RESERVED
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn bytes(&self, off: u32, len: usize) -> &[u8] {
        let off = off as usize;
        &self.bytes[off..off + len]
    }

    pub fn bytes_mut(&mut self, off: u32, len: usize) -> &mut [u8] {
        let off = off as usize;
        &mut self.bytes[off..off + len]
    }

    /// Little-endian load of `width` bytes, zero-extended.
    pub fn read(&self, off: u32, width: usize) -> u64 {
        let mut le = [0u8; 8];
        le[..width].copy_from_slice(self.bytes(off, width));
        u64::from_le_bytes(le)
    }

    /// Little-endian store of the low `width` bytes of `value`.
    pub fn write(&mut self, off: u32, width: usize, value: u64) {
        self.bytes_mut(off, width)
            .copy_from_slice(&value.to_le_bytes()[..width]);
    }

    pub fn read_u32(&self, off: u32) -> u32 {
        self.read(off, 4) as u32
    }

    pub fn write_u32(&mut self, off: u32, value: u32) {
        self.write(off, 4, value as u64);
    }

    /// Allocates and fills a byte buffer, returning its offset.
    pub fn alloc_bytes(&mut self, data: &[u8]) -> Option<u32> {
        let off = self.alloc(data.len())?;
        self.bytes_mut(off, data.len()).copy_from_slice(data);
        Some(off)
    }
}

// ─── Dynamic values ─────────────────────────────────────────────────────────

/// A dynamically typed value. Doubles compare and hash by bit pattern, so
/// `Value` is usable as a set/map key.
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    List(Vec<Value>),
    Set(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Struct(StructValue),
}

/// Struct contents, one slot per descriptor field in declaration order.
/// `None` marks an absent field (nil reference or absent boxed scalar).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructValue {
    pub fields: Vec<Option<Value>>,
}

impl StructValue {
    pub fn new(fields: Vec<Option<Value>>) -> Self {
        StructValue { fields }
    }

    pub fn empty(n: usize) -> Self {
        StructValue {
            fields: vec![None; n],
        }
    }
}

impl Value {
    fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Binary(_) => "binary",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Struct(_) => "struct",
        }
    }

    /// Raw in-memory bits for scalars.
    fn scalar_bits(&self) -> Option<u64> {
        Some(match *self {
            Value::Bool(b) => b as u64,
            Value::I8(v) => v as u8 as u64,
            Value::I16(v) => v as u16 as u64,
            Value::I32(v) => v as u32 as u64,
            Value::I64(v) => v as u64,
            Value::Double(v) => v.to_bits(),
            _ => return None,
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Binary(a), Value::Binary(b)) => a == b,
            (Value::List(a), Value::List(b)) | (Value::Set(a), Value::Set(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::String(s) => s.hash(state),
            Value::Binary(b) => b.hash(state),
            Value::List(v) | Value::Set(v) => v.hash(state),
            Value::Map(m) => m.hash(state),
            Value::Struct(s) => s.hash(state),
            scalar => scalar.scalar_bits().hash(state),
        }
    }
}

// ─── Reflection ─────────────────────────────────────────────────────────────

/// Allocates a value of type `ty` on the heap and returns its offset.
pub fn alloc_value(heap: &mut Heap, ty: &Arc<TypeDescriptor>, value: &Value) -> Result<u32, ValueError> {
    let off = heap.alloc(ty.size as usize).ok_or(ValueError::HeapExhausted)?;
    write_value(heap, off, ty, value)?;
    Ok(off)
}

/// Writes `value` into the `ty.size` bytes at `off`.
pub fn write_value(heap: &mut Heap, off: u32, ty: &Arc<TypeDescriptor>, value: &Value) -> Result<(), ValueError> {
    let mismatch = || ValueError::TypeMismatch {
        expected: ty.kind,
        found: value.kind_name(),
    };
    match (ty.kind, value) {
        (Kind::Bool, Value::Bool(_))
        | (Kind::I8, Value::I8(_))
        | (Kind::I16, Value::I16(_))
        | (Kind::I32, Value::I32(_))
        | (Kind::I64, Value::I64(_))
        | (Kind::Double, Value::Double(_)) => {
            let bits = value.scalar_bits().ok_or_else(mismatch)?;
            heap.write(off, ty.size as usize, bits);
        }
        (Kind::String, Value::String(s)) => write_blob(heap, off, s.as_bytes())?,
        (Kind::Binary, Value::Binary(b)) => write_blob(heap, off, b)?,
        (Kind::List, Value::List(items)) | (Kind::Set, Value::Set(items)) => {
            let elem = ty.elem()?;
            let stride = elem.size;
            let data = heap
                .alloc(stride as usize * items.len())
                .ok_or(ValueError::HeapExhausted)?;
            for (i, item) in items.iter().enumerate() {
                write_value(heap, data + i as u32 * stride, elem, item)?;
            }
            write_header(heap, off, data, items.len());
        }
        (Kind::Map, Value::Map(entries)) => {
            let (key_ty, val_ty) = (ty.map_key()?, ty.elem()?);
            let (value_offset, stride) = ty.map_entry_layout()?;
            let data = heap
                .alloc(stride as usize * entries.len())
                .ok_or(ValueError::HeapExhausted)?;
            for (i, (k, v)) in entries.iter().enumerate() {
                let entry = data + i as u32 * stride;
                write_value(heap, entry, key_ty, k)?;
                write_value(heap, entry + value_offset, val_ty, v)?;
            }
            write_header(heap, off, data, entries.len());
        }
        (Kind::Struct, Value::Struct(s)) => write_struct(heap, off, ty, s)?,
        (Kind::Pointer, Value::Struct(_)) => {
            let target = ty.pointee()?;
            let ptr = alloc_value(heap, &target, value)?;
            heap.write_u32(off, ptr);
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

fn write_blob(heap: &mut Heap, off: u32, data: &[u8]) -> Result<(), ValueError> {
    let ptr = heap.alloc_bytes(data).ok_or(ValueError::HeapExhausted)?;
    write_header(heap, off, ptr, data.len());
    Ok(())
}

fn write_header(heap: &mut Heap, off: u32, data: u32, len: usize) {
    heap.write_u32(off, data);
    heap.write_u32(off + 4, len as u32);
}

fn write_struct(heap: &mut Heap, off: u32, ty: &TypeDescriptor, value: &StructValue) -> Result<(), ValueError> {
    if value.fields.len() != ty.fields.len() {
        return Err(ValueError::FieldCount {
            name: ty.name.clone(),
            expected: ty.fields.len(),
            found: value.fields.len(),
        });
    }
    for (field, slot) in ty.fields.iter().zip(&value.fields) {
        let at = off + field.offset;
        match slot {
            Some(v) if field.is_boxed() => {
                let cell = heap.alloc(BOX_CELL_SIZE as usize).ok_or(ValueError::HeapExhausted)?;
                write_value(heap, cell, &field.ty, v)?;
                heap.write_u32(at, cell);
            }
            Some(v) => write_value(heap, at, &field.ty, v)?,
            None => write_absent(heap, at, field),
        }
    }
    Ok(())
}

fn write_absent(heap: &mut Heap, at: u32, field: &Field) {
    if let Some(d) = field.default {
        heap.write(at, field.ty.size as usize, d.raw_bits());
    }
}

/// Reads the value of type `ty` stored at `off`.
///
/// Nil pointers inside containers read back as a struct with every field absent.
pub fn read_value(heap: &Heap, off: u32, ty: &Arc<TypeDescriptor>) -> Result<Value, ValueError> {
    let bits = |width: u32| heap.read(off, width as usize);
    Ok(match ty.kind {
        Kind::Bool => Value::Bool(bits(1) != 0),
        Kind::I8 => Value::I8(bits(1) as u8 as i8),
        Kind::I16 => Value::I16(bits(2) as u16 as i16),
        Kind::I32 => Value::I32(bits(4) as u32 as i32),
        Kind::I64 => Value::I64(bits(8) as i64),
        Kind::Double => Value::Double(f64::from_bits(bits(8))),
        Kind::String => {
            let (data, len) = read_header(heap, off);
            Value::String(String::from_utf8_lossy(heap.bytes(data, len)).into_owned())
        }
        Kind::Binary => {
            let (data, len) = read_header(heap, off);
            Value::Binary(heap.bytes(data, len).to_vec())
        }
        Kind::List | Kind::Set => {
            let elem = ty.elem()?;
            let (data, count) = read_header(heap, off);
            let items = (0..count)
                .map(|i| read_value(heap, data + i as u32 * elem.size, elem))
                .collect::<Result<Vec<_>, _>>()?;
            if ty.kind == Kind::List {
                Value::List(items)
            } else {
                Value::Set(items)
            }
        }
        Kind::Map => {
            let (key_ty, val_ty) = (ty.map_key()?, ty.elem()?);
            let (value_offset, stride) = ty.map_entry_layout()?;
            let (data, count) = read_header(heap, off);
            let entries = (0..count)
                .map(|i| {
                    let entry = data + i as u32 * stride;
                    Ok((
                        read_value(heap, entry, key_ty)?,
                        read_value(heap, entry + value_offset, val_ty)?,
                    ))
                })
                .collect::<Result<Vec<_>, ValueError>>()?;
            Value::Map(entries)
        }
        Kind::Struct => Value::Struct(read_struct(heap, off, ty)?),
        Kind::Pointer => {
            let target = ty.pointee()?;
            match heap.read_u32(off) {
                NIL => Value::Struct(StructValue::empty(target.fields.len())),
                ptr => read_value(heap, ptr, &target)?,
            }
        }
    })
}

fn read_header(heap: &Heap, off: u32) -> (u32, usize) {
    (heap.read_u32(off), heap.read_u32(off + 4) as usize)
}

fn read_struct(heap: &Heap, off: u32, ty: &TypeDescriptor) -> Result<StructValue, ValueError> {
    let mut fields = Vec::with_capacity(ty.fields.len());
    for field in &ty.fields {
        let at = off + field.offset;
        let slot = if field.is_boxed() {
            match heap.read_u32(at) {
                NIL => None,
                cell => Some(read_value(heap, cell, &field.ty)?),
            }
        } else if field.ty.kind.has_header() || field.ty.kind == Kind::Pointer {
            match heap.read_u32(at) {
                NIL => None,
                _ => Some(read_value(heap, at, &field.ty)?),
            }
        } else {
            Some(read_value(heap, at, &field.ty)?)
        };
        fields.push(slot);
    }
    Ok(StructValue::new(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DefaultValue;

    #[test]
    fn alloc_is_aligned_zeroed_and_never_nil() {
        let mut heap = Heap::new();
        let a = heap.alloc(0).unwrap();
        assert_ne!(a, NIL);
        let b = heap.alloc(3).unwrap();
        assert_eq!(b % 8, 0);
        let c = heap.alloc(16).unwrap();
        assert_eq!(c % 8, 0);
        assert!(c >= b + 3);
        assert!(heap.bytes(c, 16).iter().all(|&x| x == 0));
    }

    #[test]
    fn scalar_access_is_little_endian() {
        let mut heap = Heap::new();
        let off = heap.alloc(8).unwrap();
        heap.write(off, 4, 0x0102_0304);
        assert_eq!(heap.bytes(off, 4), &[4, 3, 2, 1]);
        assert_eq!(heap.read(off, 2), 0x0304);
    }

    #[test]
    fn struct_values_survive_the_heap() {
        let inner = TypeDescriptor::structure("Inner")
            .field(1, "n", TypeDescriptor::i16())
            .build()
            .unwrap();
        let ty = TypeDescriptor::structure("Outer")
            .field(1, "name", TypeDescriptor::string())
            .optional(2, "maybe", TypeDescriptor::i32())
            .field(3, "tags", TypeDescriptor::set(TypeDescriptor::i64()))
            .field(4, "m", TypeDescriptor::map(TypeDescriptor::string(), inner.clone()))
            .field(5, "p", TypeDescriptor::pointer(inner))
            .build()
            .unwrap();
        let value = Value::Struct(StructValue::new(vec![
            Some(Value::String("hi".into())),
            None,
            Some(Value::Set(vec![Value::I64(1), Value::I64(-2)])),
            Some(Value::Map(vec![(
                Value::String("k".into()),
                Value::Struct(StructValue::new(vec![Some(Value::I16(9))])),
            )])),
            Some(Value::Struct(StructValue::new(vec![Some(Value::I16(3))]))),
        ]));
        let mut heap = Heap::new();
        let off = alloc_value(&mut heap, &ty, &value).unwrap();
        assert_eq!(read_value(&heap, off, &ty).unwrap(), value);
    }

    #[test]
    fn absent_defaulted_fields_take_their_default() {
        let ty = TypeDescriptor::structure("S")
            .optional_default(1, "d", TypeDescriptor::i32(), DefaultValue::I32(42))
            .build()
            .unwrap();
        let mut heap = Heap::new();
        let off = alloc_value(&mut heap, &ty, &Value::Struct(StructValue::empty(1))).unwrap();
        assert_eq!(
            read_value(&heap, off, &ty).unwrap(),
            Value::Struct(StructValue::new(vec![Some(Value::I32(42))]))
        );
    }

    #[test]
    fn doubles_compare_by_bits() {
        assert_eq!(Value::Double(f64::NAN), Value::Double(f64::NAN));
        assert_ne!(Value::Double(0.0), Value::Double(-0.0));
    }

    #[test]
    fn type_mismatch_is_reported() {
        let mut heap = Heap::new();
        let err = alloc_value(&mut heap, &TypeDescriptor::i32(), &Value::Bool(true)).unwrap_err();
        assert!(matches!(err, ValueError::TypeMismatch { expected: Kind::I32, .. }));
    }
}
