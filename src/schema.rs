//! Type descriptors: the immutable schema tree every compiled codec is derived from.
//!
//! A descriptor carries its own value-memory layout (`size`/`align`), so the
//! frontends never need to consult anything else to emit loads and stores.
//! Recursive schemas are expressed by pointing a [`Kind::Pointer`] at a weak
//! reference to the enclosing struct, see [`StructBuilder::build_recursive`].

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::error::CompileError;

/// Width in bytes of a string/binary/container header in value memory.
pub const HEADER_SIZE: u32 = 8;
/// Width in bytes of a heap pointer in value memory.
pub const POINTER_SIZE: u32 = 4;
/// Size of the heap cell a boxed optional scalar points at.
pub const BOX_CELL_SIZE: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Bool,
    I8,
    I16,
    I32,
    I64,
    Double,
    String,
    Binary,
    List,
    Set,
    Map,
    Struct,
    /// Pointer to a heap-allocated struct. The target is `TypeDescriptor::target`.
    Pointer,
}

impl Kind {
    pub fn is_scalar(self) -> bool {
        matches!(
            self,
            Kind::Bool | Kind::I8 | Kind::I16 | Kind::I32 | Kind::I64 | Kind::Double
        )
    }

    /// Kinds whose in-memory representation is a `[data: u32][len: u32]` header.
    pub fn has_header(self) -> bool {
        matches!(
            self,
            Kind::String | Kind::Binary | Kind::List | Kind::Set | Kind::Map
        )
    }

    pub fn is_container(self) -> bool {
        matches!(self, Kind::List | Kind::Set | Kind::Map)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Kind::Bool => "bool",
            Kind::I8 => "i8",
            Kind::I16 => "i16",
            Kind::I32 => "i32",
            Kind::I64 => "i64",
            Kind::Double => "double",
            Kind::String => "string",
            Kind::Binary => "binary",
            Kind::List => "list",
            Kind::Set => "set",
            Kind::Map => "map",
            Kind::Struct => "struct",
            Kind::Pointer => "pointer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requiredness {
    Default,
    Required,
    Optional,
}

/// A declared default for a scalar field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    Double(f64),
}

impl DefaultValue {
    pub fn kind(&self) -> Kind {
        match self {
            DefaultValue::Bool(_) => Kind::Bool,
            DefaultValue::I8(_) => Kind::I8,
            DefaultValue::I16(_) => Kind::I16,
            DefaultValue::I32(_) => Kind::I32,
            DefaultValue::I64(_) => Kind::I64,
            DefaultValue::Double(_) => Kind::Double,
        }
    }

    /// The value's in-memory bit pattern, zero-extended from its width.
    /// Doubles compare by bit pattern.
    pub fn raw_bits(&self) -> u64 {
        match *self {
            DefaultValue::Bool(b) => b as u64,
            DefaultValue::I8(v) => v as u8 as u64,
            DefaultValue::I16(v) => v as u16 as u64,
            DefaultValue::I32(v) => v as u32 as u64,
            DefaultValue::I64(v) => v as u64,
            DefaultValue::Double(v) => v.to_bits(),
        }
    }
}

/// A reference to a descriptor. Weak references close recursive cycles.
#[derive(Clone)]
pub enum TypeRef {
    Strong(Arc<TypeDescriptor>),
    Weak(Weak<TypeDescriptor>),
}

impl TypeRef {
    /// Resolves the reference. Fails only if the referenced descriptor was dropped.
    pub fn resolve(&self) -> Result<Arc<TypeDescriptor>, CompileError> {
        match self {
            TypeRef::Strong(t) => Ok(t.clone()),
            TypeRef::Weak(w) => w
                .upgrade()
                .ok_or_else(|| CompileError::Unsupported("dangling type reference".into())),
        }
    }
}

impl From<Arc<TypeDescriptor>> for TypeRef {
    fn from(t: Arc<TypeDescriptor>) -> Self {
        TypeRef::Strong(t)
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Strong(t) => write!(f, "{}", t.name),
            TypeRef::Weak(w) => match w.upgrade() {
                Some(t) => write!(f, "weak {}", t.name),
                None => write!(f, "weak <dropped>"),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Field {
    pub id: u16,
    pub name: String,
    pub requiredness: Requiredness,
    /// Byte offset inside the enclosing struct.
    pub offset: u32,
    pub ty: Arc<TypeDescriptor>,
    pub default: Option<DefaultValue>,
}

impl Field {
    /// Optional scalars without a default are stored as a pointer to a heap cell,
    /// so absence can be represented.
    pub fn is_boxed(&self) -> bool {
        self.requiredness == Requiredness::Optional
            && self.default.is_none()
            && self.ty.kind.is_scalar()
    }

    /// Size of this field's slot in the enclosing struct.
    pub fn slot_size(&self) -> u32 {
        if self.is_boxed() { POINTER_SIZE } else { self.ty.size }
    }
}

/// Immutable schema node. Identity is the address of the shared `Arc`.
pub struct TypeDescriptor {
    pub kind: Kind,
    pub name: String,
    /// Map key type.
    pub key: Option<Arc<TypeDescriptor>>,
    /// List/set element type, map value type.
    pub value: Option<Arc<TypeDescriptor>>,
    /// Pointee of a [`Kind::Pointer`].
    pub target: Option<TypeRef>,
    pub fields: Vec<Field>,
    pub size: u32,
    pub align: u32,
}

impl fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("align", &self.align)
            .finish_non_exhaustive()
    }
}

impl TypeDescriptor {
    fn primitive(kind: Kind, size: u32) -> Arc<Self> {
        Arc::new(TypeDescriptor {
            kind,
            name: kind.to_string(),
            key: None,
            value: None,
            target: None,
            fields: Vec::new(),
            size,
            align: size,
        })
    }

    pub fn bool() -> Arc<Self> {
        Self::primitive(Kind::Bool, 1)
    }
    pub fn i8() -> Arc<Self> {
        Self::primitive(Kind::I8, 1)
    }
    pub fn i16() -> Arc<Self> {
        Self::primitive(Kind::I16, 2)
    }
    pub fn i32() -> Arc<Self> {
        Self::primitive(Kind::I32, 4)
    }
    pub fn i64() -> Arc<Self> {
        Self::primitive(Kind::I64, 8)
    }
    pub fn double() -> Arc<Self> {
        Self::primitive(Kind::Double, 8)
    }

    fn header(kind: Kind, name: String, key: Option<Arc<Self>>, value: Option<Arc<Self>>) -> Arc<Self> {
        Arc::new(TypeDescriptor {
            kind,
            name,
            key,
            value,
            target: None,
            fields: Vec::new(),
            size: HEADER_SIZE,
            align: 4,
        })
    }

    pub fn string() -> Arc<Self> {
        Self::header(Kind::String, "string".into(), None, None)
    }

    pub fn binary() -> Arc<Self> {
        Self::header(Kind::Binary, "binary".into(), None, None)
    }

    pub fn list(elem: Arc<Self>) -> Arc<Self> {
        Self::header(Kind::List, format!("list<{}>", elem.name), None, Some(elem))
    }

    pub fn set(elem: Arc<Self>) -> Arc<Self> {
        Self::header(Kind::Set, format!("set<{}>", elem.name), None, Some(elem))
    }

    pub fn map(key: Arc<Self>, value: Arc<Self>) -> Arc<Self> {
        Self::header(
            Kind::Map,
            format!("map<{},{}>", key.name, value.name),
            Some(key),
            Some(value),
        )
    }

    pub fn pointer(target: impl Into<TypeRef>) -> Arc<Self> {
        let target = target.into();
        let name = match &target {
            TypeRef::Strong(t) => format!("*{}", t.name),
            TypeRef::Weak(_) => "*self".to_string(),
        };
        Arc::new(TypeDescriptor {
            kind: Kind::Pointer,
            name,
            key: None,
            value: None,
            target: Some(target),
            fields: Vec::new(),
            size: POINTER_SIZE,
            align: POINTER_SIZE,
        })
    }

    pub fn structure(name: impl Into<String>) -> StructBuilder {
        StructBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Identity of this descriptor; the cache key.
    pub fn identity(this: &Arc<Self>) -> usize {
        Arc::as_ptr(this) as usize
    }

    /// Element type of a list/set, value type of a map.
    pub fn elem(&self) -> Result<&Arc<TypeDescriptor>, CompileError> {
        self.value
            .as_ref()
            .ok_or_else(|| CompileError::Unsupported(format!("{} has no element type", self.name)))
    }

    pub fn map_key(&self) -> Result<&Arc<TypeDescriptor>, CompileError> {
        self.key
            .as_ref()
            .ok_or_else(|| CompileError::Unsupported(format!("{} has no key type", self.name)))
    }

    pub fn pointee(&self) -> Result<Arc<TypeDescriptor>, CompileError> {
        match &self.target {
            Some(t) => t.resolve(),
            None => Err(CompileError::Unsupported(format!("{} is not a pointer", self.name))),
        }
    }

    /// The struct a struct or pointer descriptor ultimately describes.
    pub fn struct_type(this: &Arc<Self>) -> Result<Arc<TypeDescriptor>, CompileError> {
        match this.kind {
            Kind::Struct => Ok(this.clone()),
            Kind::Pointer => this.pointee(),
            _ => Err(CompileError::Unsupported(format!("{} is not a struct", this.name))),
        }
    }

    /// Stride of one list/set element in value memory.
    pub fn elem_stride(&self) -> Result<u32, CompileError> {
        Ok(self.elem()?.size)
    }

    /// `(value_offset, entry_stride)` of a map entry in value memory.
    pub fn map_entry_layout(&self) -> Result<(u32, u32), CompileError> {
        let k = self.map_key()?;
        let v = self.elem()?;
        let value_offset = align_up(k.size, v.align);
        let align = k.align.max(v.align);
        Ok((value_offset, align_up(value_offset + v.size, align)))
    }

    /// Encoded size of a value of this type, if it is the same for every value.
    pub fn fixed_wire_size(&self) -> Option<u32> {
        match self.kind {
            Kind::Bool | Kind::I8 => Some(1),
            Kind::I16 => Some(2),
            Kind::I32 => Some(4),
            Kind::I64 | Kind::Double => Some(8),
            _ => None,
        }
    }

    /// Smallest number of wire bytes any value of this type can occupy.
    /// Used to reject container counts that cannot fit the remaining input.
    pub fn min_wire_size(&self) -> u32 {
        match self.kind {
            Kind::String | Kind::Binary => 4,
            Kind::List | Kind::Set => 5,
            Kind::Map => 6,
            Kind::Struct | Kind::Pointer => 1,
            _ => self.fixed_wire_size().unwrap_or(1),
        }
    }

    pub fn field_by_id(&self, id: u16) -> Option<(usize, &Field)> {
        self.fields.iter().enumerate().find(|(_, f)| f.id == id)
    }
}

pub(crate) fn align_up(n: u32, align: u32) -> u32 {
    let align = align.max(1);
    n.div_ceil(align) * align
}

// ─── Struct layout ──────────────────────────────────────────────────────────

struct FieldSpec {
    id: u16,
    name: String,
    requiredness: Requiredness,
    ty: Arc<TypeDescriptor>,
    default: Option<DefaultValue>,
}

/// Lays out a struct C-style: fields in declaration order, each aligned to
/// its own alignment, total size rounded up to the largest alignment.
pub struct StructBuilder {
    name: String,
    fields: Vec<FieldSpec>,
}

impl StructBuilder {
    pub fn field_with(
        mut self,
        id: u16,
        name: impl Into<String>,
        requiredness: Requiredness,
        ty: Arc<TypeDescriptor>,
        default: Option<DefaultValue>,
    ) -> Self {
        self.fields.push(FieldSpec {
            id,
            name: name.into(),
            requiredness,
            ty,
            default,
        });
        self
    }

    pub fn field(self, id: u16, name: impl Into<String>, ty: Arc<TypeDescriptor>) -> Self {
        self.field_with(id, name, Requiredness::Default, ty, None)
    }

    pub fn required(self, id: u16, name: impl Into<String>, ty: Arc<TypeDescriptor>) -> Self {
        self.field_with(id, name, Requiredness::Required, ty, None)
    }

    pub fn optional(self, id: u16, name: impl Into<String>, ty: Arc<TypeDescriptor>) -> Self {
        self.field_with(id, name, Requiredness::Optional, ty, None)
    }

    pub fn optional_default(
        self,
        id: u16,
        name: impl Into<String>,
        ty: Arc<TypeDescriptor>,
        default: DefaultValue,
    ) -> Self {
        self.field_with(id, name, Requiredness::Optional, ty, Some(default))
    }

    pub fn build(self) -> Result<Arc<TypeDescriptor>, CompileError> {
        Ok(Arc::new(self.layout()?))
    }

    /// Builds a struct that may refer to itself. `f` receives a reference to
    /// the struct under construction, usable only through [`TypeDescriptor::pointer`].
    pub fn build_recursive(
        name: impl Into<String>,
        f: impl FnOnce(TypeRef, StructBuilder) -> StructBuilder,
    ) -> Result<Arc<TypeDescriptor>, CompileError> {
        let name = name.into();
        let mut failure = None;
        let built = Arc::new_cyclic(|weak| {
            let builder = StructBuilder {
                name: name.clone(),
                fields: Vec::new(),
            };
            match f(TypeRef::Weak(weak.clone()), builder).layout() {
                Ok(desc) => desc,
                Err(e) => {
                    failure = Some(e);
                    StructBuilder {
                        name: name.clone(),
                        fields: Vec::new(),
                    }
                    .empty()
                }
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(built),
        }
    }

    fn empty(self) -> TypeDescriptor {
        TypeDescriptor {
            kind: Kind::Struct,
            name: self.name,
            key: None,
            value: None,
            target: None,
            fields: Vec::new(),
            size: 0,
            align: 1,
        }
    }

    fn layout(self) -> Result<TypeDescriptor, CompileError> {
        let mut seen = HashSet::new();
        let mut fields = Vec::with_capacity(self.fields.len());
        let mut offset = 0u32;
        let mut align = 1u32;

        for spec in self.fields {
            if !seen.insert(spec.id) {
                return Err(CompileError::Unsupported(format!(
                    "{}: duplicate field id {}",
                    self.name, spec.id
                )));
            }
            if spec.id > i16::MAX as u16 {
                return Err(CompileError::Unsupported(format!(
                    "{}: field id {} out of range",
                    self.name, spec.id
                )));
            }
            if let Some(d) = &spec.default {
                if spec.requiredness != Requiredness::Optional || d.kind() != spec.ty.kind {
                    return Err(CompileError::Unsupported(format!(
                        "{}.{}: default {:?} does not fit a {:?} {} field",
                        self.name, spec.name, d, spec.requiredness, spec.ty.kind
                    )));
                }
            }

            let mut field = Field {
                id: spec.id,
                name: spec.name,
                requiredness: spec.requiredness,
                offset: 0,
                ty: spec.ty,
                default: spec.default,
            };
            let field_align = if field.is_boxed() { POINTER_SIZE } else { field.ty.align };
            offset = align_up(offset, field_align);
            field.offset = offset;
            offset += field.slot_size();
            align = align.max(field_align);
            fields.push(field);
        }

        Ok(TypeDescriptor {
            kind: Kind::Struct,
            name: self.name,
            key: None,
            value: None,
            target: None,
            fields,
            size: align_up(offset, align),
            align,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_layout_is_c_like() {
        let t = TypeDescriptor::structure("S")
            .field(1, "a", TypeDescriptor::bool())
            .field(2, "b", TypeDescriptor::i64())
            .field(3, "c", TypeDescriptor::i16())
            .field(4, "s", TypeDescriptor::string())
            .build()
            .unwrap();
        let offsets: Vec<u32> = t.fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 8, 16, 20]);
        assert_eq!(t.size, 32);
        assert_eq!(t.align, 8);
    }

    #[test]
    fn optional_scalars_without_default_are_boxed() {
        let t = TypeDescriptor::structure("S")
            .optional(1, "x", TypeDescriptor::i64())
            .optional_default(2, "y", TypeDescriptor::i32(), DefaultValue::I32(7))
            .build()
            .unwrap();
        assert!(t.fields[0].is_boxed());
        assert_eq!(t.fields[0].slot_size(), POINTER_SIZE);
        assert!(!t.fields[1].is_boxed());
        assert_eq!(t.fields[1].offset, 4);
        assert_eq!(t.size, 8);
    }

    #[test]
    fn rejects_duplicate_ids_and_bad_defaults() {
        let dup = TypeDescriptor::structure("S")
            .field(1, "a", TypeDescriptor::bool())
            .field(1, "b", TypeDescriptor::bool())
            .build();
        assert!(matches!(dup, Err(CompileError::Unsupported(_))));

        let bad = TypeDescriptor::structure("S")
            .optional_default(1, "a", TypeDescriptor::i16(), DefaultValue::I32(1))
            .build();
        assert!(matches!(bad, Err(CompileError::Unsupported(_))));
    }

    #[test]
    fn map_entry_layout_respects_alignment() {
        let m = TypeDescriptor::map(TypeDescriptor::i8(), TypeDescriptor::i64());
        assert_eq!(m.map_entry_layout().unwrap(), (8, 16));
        let m = TypeDescriptor::map(TypeDescriptor::i32(), TypeDescriptor::i16());
        assert_eq!(m.map_entry_layout().unwrap(), (4, 8));
    }

    #[test]
    fn recursive_struct_resolves_itself() {
        let node = StructBuilder::build_recursive("Node", |this, b| {
            b.field(1, "value", TypeDescriptor::i32())
                .optional(2, "next", TypeDescriptor::pointer(this))
        })
        .unwrap();
        let next = &node.fields[1];
        let pointee = next.ty.pointee().unwrap();
        assert_eq!(
            TypeDescriptor::identity(&pointee),
            TypeDescriptor::identity(&node)
        );
        assert_eq!(node.size, 8);
    }

    #[test]
    fn default_raw_bits_are_zero_extended() {
        assert_eq!(DefaultValue::I8(-1).raw_bits(), 0xff);
        assert_eq!(DefaultValue::Double(1.5).raw_bits(), 1.5f64.to_bits());
    }
}
