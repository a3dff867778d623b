//! Declarative record layouts
//!
//! A [`Layout`] is the wire description of a record: field order, fixed
//! arrays, arrays sized by a sibling field (`size_is`), strings, unique
//! pointers and unions switched by a sibling field (`switch_is`). A
//! [`Value`] is a dynamic instance of a layout. [`encode_value`] and
//! [`decode_value`] drive the codec from the description, with the same
//! alignment, deferral and bounds rules as hand-written records.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    backfill, NdrContext, NdrDecodeOwned, NdrEncode, NdrError, NdrReader, NdrUuid, NdrWriter, Result,
    ResultExt, StringLayout, SwitchWidth,
};

/// Primitive field types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scalar {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    /// 16-bit enumeration
    Enum,
}

impl Scalar {
    /// Wire size, which is also the alignment
    pub fn size(self) -> usize {
        match self {
            Scalar::Bool | Scalar::U8 | Scalar::I8 => 1,
            Scalar::U16 | Scalar::I16 | Scalar::Enum => 2,
            Scalar::U32 | Scalar::I32 | Scalar::F32 => 4,
            Scalar::U64 | Scalar::I64 | Scalar::F64 => 8,
        }
    }

    fn range(self) -> (i128, i128) {
        match self {
            Scalar::Bool => (0, 1),
            Scalar::U8 => (0, u8::MAX.into()),
            Scalar::I8 => (i8::MIN.into(), i8::MAX.into()),
            Scalar::U16 | Scalar::Enum => (0, u16::MAX.into()),
            Scalar::I16 => (i16::MIN.into(), i16::MAX.into()),
            Scalar::U32 => (0, u32::MAX.into()),
            Scalar::I32 => (i32::MIN.into(), i32::MAX.into()),
            Scalar::U64 => (0, u64::MAX.into()),
            Scalar::I64 => (i64::MIN.into(), i64::MAX.into()),
            Scalar::F32 | Scalar::F64 => (0, 0),
        }
    }

    fn is_signed(self) -> bool {
        matches!(self, Scalar::I8 | Scalar::I16 | Scalar::I32 | Scalar::I64)
    }
}

/// Named member of a structure layout
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub layout: Layout,
}

impl Field {
    pub fn new(name: impl Into<String>, layout: Layout) -> Self {
        Self {
            name: name.into(),
            layout,
        }
    }
}

/// Union arm selected by one discriminant value
#[derive(Debug, Clone, PartialEq)]
pub struct Arm {
    pub discriminant: u32,
    pub layout: Layout,
}

impl Arm {
    pub fn new(discriminant: u32, layout: Layout) -> Self {
        Self { discriminant, layout }
    }
}

/// Wire description of a record or field
#[derive(Debug, Clone, PartialEq)]
pub enum Layout {
    Scalar(Scalar),
    Uuid,
    Struct {
        fields: Vec<Field>,
    },
    /// Exactly `len` elements, no count on the wire
    FixedArray {
        element: Box<Layout>,
        len: usize,
    },
    /// Conformant array whose count is held by the sibling field `size_is`
    SizedArray {
        element: Box<Layout>,
        size_is: String,
    },
    /// Conformant array with no length field of its own
    ConformantArray {
        element: Box<Layout>,
    },
    String(StringLayout),
    /// `[unique]` pointer
    Unique(Box<Layout>),
    /// Discriminated union. With `switch_is` set the union is
    /// non-encapsulated and its arm is chosen by that sibling field.
    Union {
        switch_is: Option<String>,
        switch: SwitchWidth,
        arms: Vec<Arm>,
        default: Option<Box<Layout>>,
    },
}

impl Layout {
    pub fn structure(fields: Vec<Field>) -> Self {
        Layout::Struct { fields }
    }

    pub fn fixed_array(element: Layout, len: usize) -> Self {
        Layout::FixedArray {
            element: Box::new(element),
            len,
        }
    }

    pub fn sized_array(element: Layout, size_is: impl Into<String>) -> Self {
        Layout::SizedArray {
            element: Box::new(element),
            size_is: size_is.into(),
        }
    }

    pub fn conformant_array(element: Layout) -> Self {
        Layout::ConformantArray {
            element: Box::new(element),
        }
    }

    pub fn unique(target: Layout) -> Self {
        Layout::Unique(Box::new(target))
    }

    /// Encapsulated union with a 32-bit discriminant
    pub fn union(arms: Vec<Arm>) -> Self {
        Layout::Union {
            switch_is: None,
            switch: SwitchWidth::U32,
            arms,
            default: None,
        }
    }

    /// Non-encapsulated union switched by the sibling field `switch_is`
    pub fn switched_union(switch_is: impl Into<String>, arms: Vec<Arm>) -> Self {
        Layout::Union {
            switch_is: Some(switch_is.into()),
            switch: SwitchWidth::U32,
            arms,
            default: None,
        }
    }

    /// Set the arm used for discriminants with no explicit arm
    pub fn with_default_arm(self, layout: Layout) -> Self {
        match self {
            Layout::Union {
                switch_is,
                switch,
                arms,
                ..
            } => Layout::Union {
                switch_is,
                switch,
                arms,
                default: Some(Box::new(layout)),
            },
            other => other,
        }
    }

    /// Alignment of this layout under `ctx`
    pub fn align(&self, ctx: &NdrContext) -> usize {
        match self {
            Layout::Scalar(s) => s.size(),
            Layout::Uuid => 4,
            Layout::Struct { fields } => {
                let members = fields.iter().map(|f| f.layout.align(ctx)).max().unwrap_or(1);
                if is_conformant_struct(fields) {
                    members.max(ctx.size_align())
                } else {
                    members
                }
            }
            Layout::FixedArray { element, .. } => element.align(ctx),
            Layout::SizedArray { element, .. } | Layout::ConformantArray { element } => {
                element.align(ctx).max(ctx.size_align())
            }
            Layout::String(_) => ctx.size_align(),
            Layout::Unique(_) => ctx.pointer_align(),
            Layout::Union {
                switch_is,
                switch,
                arms,
                default,
            } => {
                let arms_align = arms
                    .iter()
                    .map(|a| &a.layout)
                    .chain(default.as_deref())
                    .map(|l| l.align(ctx))
                    .max()
                    .unwrap_or(1);
                let switch_align = match (switch_is, switch) {
                    (Some(_), _) => 1,
                    (None, SwitchWidth::U16) => 2,
                    (None, SwitchWidth::U32) => 4,
                };
                arms_align.max(switch_align)
            }
        }
    }

    /// Zero value: zero scalars, empty arrays and strings, null pointers,
    /// and the first arm of a union
    pub fn default_value(&self) -> Value {
        match self {
            Layout::Scalar(Scalar::Bool) => Value::Bool(false),
            Layout::Scalar(Scalar::F32 | Scalar::F64) => Value::Float(0.0),
            Layout::Scalar(s) if s.is_signed() => Value::Int(0),
            Layout::Scalar(_) => Value::UInt(0),
            Layout::Uuid => Value::Uuid(NdrUuid::NIL),
            Layout::Struct { fields } => Value::Struct(fields.iter().map(|f| f.layout.default_value()).collect()),
            Layout::FixedArray { element, len } => Value::Array(vec![element.default_value(); *len]),
            Layout::SizedArray { .. } | Layout::ConformantArray { .. } => Value::Array(Vec::new()),
            Layout::String(_) => Value::String(String::new()),
            Layout::Unique(_) => Value::Pointer(None),
            Layout::Union { arms, default, .. } => match (arms.first(), default) {
                (Some(arm), _) => Value::Union {
                    discriminant: arm.discriminant,
                    arm: Box::new(arm.layout.default_value()),
                },
                (None, Some(layout)) => Value::Union {
                    discriminant: 0,
                    arm: Box::new(layout.default_value()),
                },
                (None, None) => Value::Null,
            },
        }
    }

    fn is_conformant_array(&self) -> bool {
        matches!(self, Layout::SizedArray { .. } | Layout::ConformantArray { .. })
    }
}

/// A struct is conformant when its last field is a conformant array or a
/// conformant struct
fn is_conformant_struct(fields: &[Field]) -> bool {
    fields.last().map_or(false, |f| match &f.layout {
        Layout::Struct { fields } => is_conformant_struct(fields),
        layout => layout.is_conformant_array(),
    })
}

fn select_arm<'l>(arms: &'l [Arm], default: &'l Option<Box<Layout>>, discriminant: u32) -> Option<&'l Layout> {
    arms.iter()
        .find(|a| a.discriminant == discriminant)
        .map(|a| &a.layout)
        .or(default.as_deref())
}

/// Dynamic instance of a [`Layout`]
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    Uuid(NdrUuid),
    String(String),
    Array(Vec<Value>),
    /// Members in field order
    Struct(Vec<Value>),
    Pointer(Option<Box<Value>>),
    Union {
        discriminant: u32,
        arm: Box<Value>,
    },
}

impl Value {
    /// Integer view used for `size_is` and `switch_is` lookups
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(n) => Some(*n),
            Value::Int(n) => u64::try_from(*n).ok(),
            Value::Bool(b) => Some(u64::from(*b)),
            _ => None,
        }
    }

    fn as_integer(&self) -> Option<i128> {
        match self {
            Value::UInt(n) => Some((*n).into()),
            Value::Int(n) => Some((*n).into()),
            Value::Bool(b) => Some((*b).into()),
            _ => None,
        }
    }

    /// Member `index` of a structure value
    pub fn field(&self, index: usize) -> Option<&Value> {
        match self {
            Value::Struct(values) => values.get(index),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::UInt(_) | Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Uuid(_) => "uuid",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Struct(_) => "struct",
            Value::Pointer(_) => "pointer",
            Value::Union { .. } => "union",
        }
    }
}

fn mismatch(layout: &Layout, value: &Value) -> NdrError {
    let expected = match layout {
        Layout::Scalar(_) => "scalar",
        Layout::Uuid => "uuid",
        Layout::Struct { .. } => "struct",
        Layout::FixedArray { .. } | Layout::SizedArray { .. } | Layout::ConformantArray { .. } => "array",
        Layout::String(_) => "string",
        Layout::Unique(_) => "pointer",
        Layout::Union { .. } => "union",
    };
    NdrError::LayoutMismatch(format!("expected {}, found {}", expected, value.kind()))
}

/// Integer fields visible to `size_is` and `switch_is` references. Each
/// struct level owns one table, shared with the pointer bodies it defers,
/// so a deferred body sees every field of its enclosing struct.
#[derive(Clone, Default)]
struct Scope<'a> {
    fields: Rc<RefCell<HashMap<&'a str, u64>>>,
    outer: Option<Rc<Scope<'a>>>,
}

impl<'a> Scope<'a> {
    fn nested(&self) -> Self {
        Scope {
            fields: Rc::default(),
            outer: Some(Rc::new(self.clone())),
        }
    }

    fn insert(&self, name: &'a str, n: u64) {
        self.fields.borrow_mut().insert(name, n);
    }

    fn get(&self, name: &str) -> Option<u64> {
        match self.fields.borrow().get(name) {
            Some(&n) => Some(n),
            None => self.outer.as_ref().and_then(|outer| outer.get(name)),
        }
    }

    /// Flattened copy, for encoding into a writer of a shorter lifetime
    fn detached<'b>(&self) -> Scope<'b>
    where
        'a: 'b,
    {
        let mut flat = HashMap::new();
        self.collect(&mut flat);
        Scope {
            fields: Rc::new(RefCell::new(flat)),
            outer: None,
        }
    }

    fn collect<'b>(&self, flat: &mut HashMap<&'b str, u64>)
    where
        'a: 'b,
    {
        if let Some(outer) = &self.outer {
            outer.collect(flat);
        }
        flat.extend(self.fields.borrow().iter().map(|(&name, &n)| (name, n)));
    }
}

fn lookup(scope: &Scope<'_>, name: &str) -> Result<u64> {
    scope
        .get(name)
        .ok_or_else(|| NdrError::LayoutMismatch(format!("no integer field `{}` in scope", name)))
}

/// Reconcile `size_is` and `switch_is` fields with the live arrays and
/// union arms. Length fields are only filled when zero; switch fields
/// always follow the union value.
pub fn prepare_value(layout: &Layout, value: &mut Value) -> Result<()> {
    match (layout, value) {
        (Layout::Struct { fields }, Value::Struct(values)) => {
            if fields.len() != values.len() {
                return Err(NdrError::LayoutMismatch(format!(
                    "struct has {} fields, value has {}",
                    fields.len(),
                    values.len()
                )));
            }
            let mut updates = Vec::new();
            for (field, value) in fields.iter().zip(values.iter_mut()) {
                prepare_value(&field.layout, value).field(&field.name)?;
                if let Some(update) = derived_field(&field.layout, value) {
                    updates.push(update);
                }
            }
            for (name, derived, always) in updates {
                let Some(index) = fields.iter().position(|f| f.name == name) else {
                    return Err(NdrError::LayoutMismatch(format!("no field `{}` in struct", name)));
                };
                let Layout::Scalar(scalar) = fields[index].layout else {
                    return Err(NdrError::LayoutMismatch(format!("field `{}` is not an integer", name)));
                };
                if always || values[index].as_u64() == Some(0) {
                    values[index] = integer_value(scalar, i128::from(derived), name)?;
                }
            }
            Ok(())
        }
        (
            Layout::FixedArray { element, .. }
            | Layout::SizedArray { element, .. }
            | Layout::ConformantArray { element },
            Value::Array(items),
        ) => items.iter_mut().try_for_each(|item| prepare_value(element, item)),
        (Layout::Unique(target), Value::Pointer(Some(value))) => prepare_value(target, value),
        (Layout::Union { arms, default, .. }, Value::Union { discriminant, arm }) => {
            match select_arm(arms, default, *discriminant) {
                Some(layout) => prepare_value(layout, arm),
                None => Err(NdrError::UnsupportedVariant(*discriminant)),
            }
        }
        _ => Ok(()),
    }
}

/// `(field name, derived value, overwrite)` implied by one member
fn derived_field<'l>(layout: &'l Layout, value: &Value) -> Option<(&'l str, u64, bool)> {
    match (layout, value) {
        (Layout::SizedArray { size_is, .. }, Value::Array(items)) => Some((size_is.as_str(), items.len() as u64, false)),
        (Layout::Unique(target), Value::Pointer(Some(value))) => derived_field(target, value),
        (
            Layout::Union {
                switch_is: Some(name), ..
            },
            Value::Union { discriminant, .. },
        ) => Some((name.as_str(), u64::from(*discriminant), true)),
        _ => None,
    }
}

fn integer_value(scalar: Scalar, n: i128, what: &str) -> Result<Value> {
    let (min, max) = scalar.range();
    if n < min || n > max {
        warn!(field = what, value = %n, "derived value does not fit its field");
        return Err(NdrError::Range {
            what: "length or switch field",
            value: u64::try_from(n).unwrap_or(u64::MAX),
            max: u64::try_from(max).unwrap_or(u64::MAX),
        });
    }
    Ok(match scalar {
        Scalar::Bool => Value::Bool(n != 0),
        s if s.is_signed() => Value::Int(n as i64),
        _ => Value::UInt(n as u64),
    })
}

/// Prepare `value`, then encode it as a complete message
pub fn encode_value(layout: &Layout, value: &mut Value, ctx: NdrContext) -> Result<Bytes> {
    prepare_value(layout, value)?;
    let value: &Value = value;
    let mut w = NdrWriter::new(ctx);
    write_value(&mut w, layout, value)?;
    w.flush_deferred()?;
    Ok(w.into_bytes())
}

/// Decode a complete message described by `layout`
pub fn decode_value(layout: &Layout, bytes: impl Into<Bytes>, ctx: NdrContext) -> Result<Value> {
    let mut value = Value::Null;
    {
        let mut r = NdrReader::new(bytes, ctx);
        read_value(&mut r, layout, &mut value)?;
        r.flush_deferred()?;
    }
    Ok(value)
}

/// Encode `value` at the writer's position as part of a larger message.
/// Pointer bodies are queued on the writer.
pub fn write_value<'a>(w: &mut NdrWriter<'a>, layout: &'a Layout, value: &'a Value) -> Result<()> {
    encode_in(layout, value, w, &Scope::default())
}

/// Decode into `slot` at the reader's position as part of a larger
/// message. Pointer bodies are queued on the reader.
pub fn read_value<'a>(r: &mut NdrReader<'a>, layout: &'a Layout, slot: &'a mut Value) -> Result<()> {
    decode_in(layout, slot, r, &Scope::default()).map(drop)
}

fn write_scalar(w: &mut NdrWriter<'_>, scalar: Scalar, value: &Value) -> Result<()> {
    match (scalar, value) {
        (Scalar::F32, Value::Float(f)) => w.write_f32(*f as f32),
        (Scalar::F64, Value::Float(f)) => w.write_f64(*f),
        (Scalar::F32 | Scalar::F64, other) => {
            return Err(NdrError::LayoutMismatch(format!("expected float, found {}", other.kind())))
        }
        (scalar, value) => {
            let Some(n) = value.as_integer() else {
                return Err(NdrError::LayoutMismatch(format!("expected integer, found {}", value.kind())));
            };
            let (min, max) = scalar.range();
            if n < min || n > max {
                return Err(NdrError::Range {
                    what: "scalar value",
                    value: u64::try_from(n).unwrap_or(u64::MAX),
                    max: u64::try_from(max).unwrap_or(u64::MAX),
                });
            }
            match scalar {
                Scalar::Bool => w.write_bool(n != 0),
                Scalar::U8 => w.write_u8(n as u8),
                Scalar::I8 => w.write_i8(n as i8),
                Scalar::U16 => w.write_u16(n as u16),
                Scalar::I16 => w.write_i16(n as i16),
                Scalar::Enum => w.write_enum(n as u32)?,
                Scalar::U32 => w.write_u32(n as u32),
                Scalar::I32 => w.write_i32(n as i32),
                Scalar::U64 => w.write_u64(n as u64),
                Scalar::I64 => w.write_i64(n as i64),
                Scalar::F32 | Scalar::F64 => {}
            }
        }
    }
    Ok(())
}

fn read_scalar(r: &mut NdrReader<'_>, scalar: Scalar) -> Result<Value> {
    Ok(match scalar {
        Scalar::Bool => Value::Bool(r.read_bool()?),
        Scalar::U8 => Value::UInt(r.read_u8()?.into()),
        Scalar::I8 => Value::Int(r.read_i8()?.into()),
        Scalar::U16 => Value::UInt(r.read_u16()?.into()),
        Scalar::I16 => Value::Int(r.read_i16()?.into()),
        Scalar::Enum => Value::UInt(r.read_enum()?.into()),
        Scalar::U32 => Value::UInt(r.read_u32()?.into()),
        Scalar::I32 => Value::Int(r.read_i32()?.into()),
        Scalar::U64 => Value::UInt(r.read_u64()?),
        Scalar::I64 => Value::Int(r.read_i64()?),
        Scalar::F32 => Value::Float(r.read_f32()?.into()),
        Scalar::F64 => Value::Float(r.read_f64()?),
    })
}

fn encode_in<'a>(layout: &'a Layout, value: &'a Value, w: &mut NdrWriter<'a>, scope: &Scope<'a>) -> Result<()> {
    match (layout, value) {
        (Layout::Scalar(scalar), value) => write_scalar(w, *scalar, value),
        (Layout::Uuid, Value::Uuid(uuid)) => uuid.ndr_encode(w),
        (Layout::Struct { fields }, Value::Struct(values)) => encode_struct(layout, fields, values, w, scope),
        (Layout::FixedArray { element, len }, Value::Array(items)) => {
            encode_elements(element, items, *len as u64, w, scope)
        }
        (Layout::SizedArray { element, size_is }, Value::Array(items)) => {
            let declared = lookup(scope, size_is)?;
            encode_conformant(element, items, declared, w, scope)
        }
        (Layout::ConformantArray { element }, Value::Array(items)) => encode_conformant(element, items, 0, w, scope),
        (Layout::String(string), Value::String(s)) => w.write_string(s, *string),
        (Layout::Unique(target), Value::Pointer(pointee)) => {
            let scope = scope.clone();
            w.write_pointer(pointee.as_deref(), move |w, value| encode_in(target, value, w, &scope))
        }
        (
            Layout::Union {
                switch_is,
                switch,
                arms,
                default,
            },
            Value::Union { discriminant, arm },
        ) => {
            let Some(arm_layout) = select_arm(arms, default, *discriminant) else {
                return Err(NdrError::UnsupportedVariant(*discriminant));
            };
            let align = layout.align(w.context());
            match switch_is {
                Some(name) => {
                    let expected = lookup(scope, name)?;
                    if expected != u64::from(*discriminant) {
                        return Err(NdrError::DiscriminantMismatch {
                            expected: expected as u32,
                            found: *discriminant,
                        });
                    }
                    w.align(align);
                }
                None => w.write_union_header(*discriminant, align, *switch)?,
            }
            encode_in(arm_layout, arm, w, scope)
        }
        (layout, value) => Err(mismatch(layout, value)),
    }
}

fn encode_struct<'a>(
    layout: &'a Layout,
    fields: &'a [Field],
    values: &'a [Value],
    w: &mut NdrWriter<'a>,
    outer: &Scope<'a>,
) -> Result<()> {
    if fields.len() != values.len() {
        return Err(NdrError::LayoutMismatch(format!(
            "struct has {} fields, value has {}",
            fields.len(),
            values.len()
        )));
    }
    let scope = outer.nested();
    declare_fields(&scope, fields, values);
    let hoisted = match struct_conformance(fields, values, &scope)? {
        Some(count) => Some(w.write_conformance(vec![count])?),
        None => None,
    };

    w.align(layout.align(w.context()));
    let last = fields.len().saturating_sub(1);
    for (i, (field, value)) in fields.iter().zip(values).enumerate() {
        let result = match &hoisted {
            Some(sizes) if i == last => {
                let scope = &scope;
                w.with_inherited_size(sizes.clone(), |w| encode_in(&field.layout, value, w, scope))
            }
            _ => encode_in(&field.layout, value, w, &scope),
        };
        result.field(&field.name)?;
    }
    Ok(())
}

fn declare_fields<'a>(scope: &Scope<'a>, fields: &'a [Field], values: &[Value]) {
    for (field, value) in fields.iter().zip(values) {
        if let (Layout::Scalar(_), Some(n)) = (&field.layout, value.as_u64()) {
            scope.insert(field.name.as_str(), n);
        }
    }
}

/// Conformance of a struct's trailing array, found through any chain of
/// trailing nested structs
fn struct_conformance<'a>(fields: &'a [Field], values: &'a [Value], scope: &Scope<'a>) -> Result<Option<u64>> {
    match (fields.last(), values.last()) {
        (Some(field), Some(Value::Array(items))) if field.layout.is_conformant_array() => {
            let declared = match &field.layout {
                Layout::SizedArray { size_is, .. } => lookup(scope, size_is)?,
                _ => 0,
            };
            Ok(Some(backfill(declared, items.len())))
        }
        (
            Some(Field {
                layout: Layout::Struct { fields: inner },
                ..
            }),
            Some(Value::Struct(inner_values)),
        ) if inner.len() == inner_values.len() => {
            let scope = scope.nested();
            declare_fields(&scope, inner, inner_values);
            struct_conformance(inner, inner_values, &scope)
        }
        _ => Ok(None),
    }
}

fn encode_conformant<'a>(
    element: &'a Layout,
    items: &'a [Value],
    declared: u64,
    w: &mut NdrWriter<'a>,
    scope: &Scope<'a>,
) -> Result<()> {
    let count = match w.take_inherited_size() {
        Some(sizes) => sizes.first().copied().unwrap_or(0),
        None => {
            let count = backfill(declared, items.len());
            w.write_size(count)?;
            count
        }
    };
    encode_elements(element, items, count, w, scope)
}

fn encode_elements<'a>(
    element: &'a Layout,
    items: &'a [Value],
    count: u64,
    w: &mut NdrWriter<'a>,
    scope: &Scope<'a>,
) -> Result<()> {
    let count = w.check_encode_count(count)?;
    for item in items.iter().take(count) {
        encode_in(element, item, w, scope)?;
    }
    for _ in items.len()..count {
        let filler = element.default_value();
        let mut scratch = w.scratch();
        encode_in(element, &filler, &mut scratch, &scope.detached())?;
        scratch.flush_deferred()?;
        w.append(scratch.as_bytes());
    }
    Ok(())
}

/// Minimum wire bytes of one element, for bounding untrusted counts
fn min_size(layout: &Layout) -> usize {
    match layout {
        Layout::Scalar(s) => s.size(),
        Layout::Uuid => 16,
        Layout::Struct { fields } => fields.iter().map(|f| min_size(&f.layout)).sum::<usize>().max(1),
        Layout::FixedArray { element, len } => min_size(element).saturating_mul(*len).max(1),
        Layout::String(_) => 1,
        Layout::Unique(_) | Layout::SizedArray { .. } | Layout::ConformantArray { .. } | Layout::Union { .. } => 1,
    }
}

fn decode_in<'a>(layout: &'a Layout, slot: &'a mut Value, r: &mut NdrReader<'a>, scope: &Scope<'a>) -> Result<Option<u64>> {
    match layout {
        Layout::Scalar(scalar) => {
            let value = read_scalar(r, *scalar)?;
            let count = value.as_u64();
            *slot = value;
            Ok(count)
        }
        Layout::Uuid => {
            *slot = Value::Uuid(NdrUuid::ndr_decode_owned(r)?);
            Ok(None)
        }
        Layout::Struct { fields } => decode_struct(layout, fields, slot, r, scope),
        Layout::FixedArray { element, len } => {
            let count = r.check_count(*len as u64, min_size(element))?;
            decode_elements(element, slot, count, r, scope)
        }
        Layout::SizedArray { element, size_is } => {
            let declared = lookup(scope, size_is)?;
            let count = r.conformant_count(declared, min_size(element))?;
            decode_elements(element, slot, count, r, scope)
        }
        Layout::ConformantArray { element } => {
            let count = r.conformant_count(0, min_size(element))?;
            decode_elements(element, slot, count, r, scope)
        }
        Layout::String(string) => {
            *slot = Value::String(r.read_string(*string)?);
            Ok(None)
        }
        Layout::Unique(target) => {
            *slot = Value::Pointer(None);
            if let Value::Pointer(pointee) = slot {
                let scope = scope.clone();
                r.read_pointer(pointee, move |r, value: &'a mut Box<Value>| {
                    decode_in(target, value, r, &scope).map(drop)
                })?;
            }
            Ok(None)
        }
        Layout::Union {
            switch_is,
            switch,
            arms,
            default,
        } => {
            let align = layout.align(r.context());
            let discriminant = match switch_is {
                Some(name) => {
                    r.align(align)?;
                    let d = lookup(scope, name)?;
                    u32::try_from(d).map_err(|_| NdrError::Range {
                        what: "union discriminant",
                        value: d,
                        max: u64::from(u32::MAX),
                    })?
                }
                None => r.read_union_header(align, *switch)?,
            };
            let Some(arm_layout) = select_arm(arms, default, discriminant) else {
                warn!(discriminant, offset = r.position(), "no union arm for discriminant");
                return Err(NdrError::UnsupportedVariant(discriminant));
            };
            debug!(discriminant, "union arm selected");
            *slot = Value::Union {
                discriminant,
                arm: Box::default(),
            };
            if let Value::Union { arm, .. } = slot {
                decode_in(arm_layout, arm, r, scope)?;
            }
            Ok(None)
        }
    }
}

fn decode_struct<'a>(
    layout: &'a Layout,
    fields: &'a [Field],
    slot: &'a mut Value,
    r: &mut NdrReader<'a>,
    outer: &Scope<'a>,
) -> Result<Option<u64>> {
    let hoisted = if is_conformant_struct(fields) {
        Some(r.read_conformance(1)?)
    } else {
        None
    };
    r.align(layout.align(r.context()))?;

    let scope = outer.nested();
    *slot = Value::Struct(Vec::new());
    if let Value::Struct(values) = slot {
        values.resize_with(fields.len(), Value::default);
        let last = fields.len().saturating_sub(1);
        for (i, (field, value)) in fields.iter().zip(values.iter_mut()).enumerate() {
            let count = match &hoisted {
                Some(sizes) if i == last => {
                    let outer_sizes = r.replace_inherited_size(Some(sizes.clone()));
                    let result = decode_in(&field.layout, value, r, &scope);
                    r.replace_inherited_size(outer_sizes);
                    result
                }
                _ => decode_in(&field.layout, value, r, &scope),
            }
            .field(&field.name)?;
            if let Some(n) = count {
                scope.insert(field.name.as_str(), n);
            }
        }
    }
    Ok(None)
}

fn decode_elements<'a>(
    element: &'a Layout,
    slot: &'a mut Value,
    count: usize,
    r: &mut NdrReader<'a>,
    scope: &Scope<'a>,
) -> Result<Option<u64>> {
    *slot = Value::Array(Vec::new());
    if let Value::Array(items) = slot {
        items.resize_with(count, Value::default);
        for item in items.iter_mut() {
            decode_in(element, item, r, scope)?;
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counted_words() -> Layout {
        Layout::structure(vec![
            Field::new("count", Layout::Scalar(Scalar::U32)),
            Field::new("words", Layout::sized_array(Layout::Scalar(Scalar::U16), "count")),
        ])
    }

    #[test]
    fn test_conformant_struct_hoists_count() {
        let layout = counted_words();
        let mut value = Value::Struct(vec![
            Value::UInt(0),
            Value::Array(vec![Value::UInt(1), Value::UInt(2), Value::UInt(3)]),
        ]);
        let bytes = encode_value(&layout, &mut value, NdrContext::ndr20()).unwrap();
        assert_eq!(value.field(0), Some(&Value::UInt(3)));
        assert_eq!(
            &bytes[..],
            &[
                3, 0, 0, 0, // hoisted max_count
                3, 0, 0, 0, // count
                1, 0, 2, 0, 3, 0,
            ]
        );

        let decoded = decode_value(&layout, bytes, NdrContext::ndr20()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_length_field_overflow_is_range_error() {
        let layout = Layout::structure(vec![
            Field::new("count", Layout::Scalar(Scalar::U8)),
            Field::new("data", Layout::unique(Layout::sized_array(Layout::Scalar(Scalar::U8), "count"))),
        ]);
        let mut value = Value::Struct(vec![
            Value::UInt(0),
            Value::Pointer(Some(Box::new(Value::Array(vec![Value::UInt(0); 300])))),
        ]);
        let err = encode_value(&layout, &mut value, NdrContext::ndr20()).unwrap_err();
        assert!(matches!(err, NdrError::Range { value: 300, max: 255, .. }));
    }

    #[test]
    fn test_pointer_to_sized_array() {
        let layout = Layout::structure(vec![
            Field::new("len", Layout::Scalar(Scalar::U16)),
            Field::new("data", Layout::unique(Layout::sized_array(Layout::Scalar(Scalar::U8), "len"))),
            Field::new("tail", Layout::Scalar(Scalar::U32)),
        ]);
        let mut value = Value::Struct(vec![
            Value::UInt(0),
            Value::Pointer(Some(Box::new(Value::Array(vec![Value::UInt(0xAA), Value::UInt(0xBB)])))),
            Value::UInt(7),
        ]);
        let bytes = encode_value(&layout, &mut value, NdrContext::ndr20()).unwrap();
        assert_eq!(
            &bytes[..],
            &[
                2, 0, 0, 0, // len + padding
                0x00, 0x00, 0x02, 0x00, // referent
                7, 0, 0, 0, // tail
                2, 0, 0, 0, 0xAA, 0xBB, // deferred conformant body
            ]
        );
        let decoded = decode_value(&layout, bytes, NdrContext::ndr20()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_deferred_body_sized_by_later_field() {
        let layout = Layout::structure(vec![
            Field::new("data", Layout::unique(Layout::sized_array(Layout::Scalar(Scalar::U8), "len"))),
            Field::new("len", Layout::Scalar(Scalar::U32)),
        ]);
        let mut value = Value::Struct(vec![
            Value::Pointer(Some(Box::new(Value::Array(vec![Value::UInt(0xAA), Value::UInt(0xBB)])))),
            Value::UInt(0),
        ]);
        let bytes = encode_value(&layout, &mut value, NdrContext::ndr20()).unwrap();
        assert_eq!(
            &bytes[..],
            &[
                0x00, 0x00, 0x02, 0x00, // referent
                2, 0, 0, 0, // len
                2, 0, 0, 0, 0xAA, 0xBB, // deferred conformant body
            ]
        );
        let decoded = decode_value(&layout, bytes, NdrContext::ndr20()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_nested_conformant_struct_hoists_to_outermost() {
        let layout = Layout::structure(vec![
            Field::new("a", Layout::Scalar(Scalar::U32)),
            Field::new("inner", counted_words()),
        ]);
        let mut value = Value::Struct(vec![
            Value::UInt(170),
            Value::Struct(vec![Value::UInt(0), Value::Array(vec![Value::UInt(1), Value::UInt(2)])]),
        ]);
        let bytes = encode_value(&layout, &mut value, NdrContext::ndr20()).unwrap();
        assert_eq!(
            &bytes[..],
            &[
                2, 0, 0, 0, // hoisted max_count
                170, 0, 0, 0, // a
                2, 0, 0, 0, // inner count
                1, 0, 2, 0,
            ]
        );
        for ctx in [NdrContext::ndr20(), NdrContext::ndr64()] {
            let bytes = encode_value(&layout, &mut value, ctx).unwrap();
            assert_eq!(decode_value(&layout, bytes, ctx).unwrap(), value);
        }
    }

    #[test]
    fn test_switched_union_sets_switch_field() {
        let layout = Layout::structure(vec![
            Field::new("kind", Layout::Scalar(Scalar::U16)),
            Field::new(
                "data",
                Layout::switched_union(
                    "kind",
                    vec![
                        Arm::new(1, Layout::Scalar(Scalar::U32)),
                        Arm::new(2, Layout::String(StringLayout::WIDE)),
                    ],
                )
                .with_default_arm(Layout::Scalar(Scalar::U8)),
            ),
        ]);
        let mut value = Value::Struct(vec![
            Value::UInt(0),
            Value::Union {
                discriminant: 1,
                arm: Box::new(Value::UInt(0xCAFE)),
            },
        ]);
        let bytes = encode_value(&layout, &mut value, NdrContext::ndr20()).unwrap();
        assert_eq!(&bytes[..], &[1, 0, 0, 0, 0xFE, 0xCA, 0, 0]);
        assert_eq!(decode_value(&layout, bytes, NdrContext::ndr20()).unwrap(), value);

        // default arm
        let bytes = vec![9u8, 0, 0, 0, 0x42];
        let decoded = decode_value(&layout, bytes, NdrContext::ndr20()).unwrap();
        assert_eq!(
            decoded.field(1),
            Some(&Value::Union {
                discriminant: 9,
                arm: Box::new(Value::UInt(0x42))
            })
        );
    }

    #[test]
    fn test_unknown_discriminant_without_default() {
        let layout = Layout::union(vec![Arm::new(1, Layout::Scalar(Scalar::U8))]);
        let err = decode_value(&layout, vec![5u8, 0, 0, 0, 1], NdrContext::new()).unwrap_err();
        assert!(matches!(err, NdrError::UnsupportedVariant(5)));
    }

    #[test]
    fn test_fixed_array_pads_with_defaults() {
        let layout = Layout::fixed_array(Layout::Scalar(Scalar::U16), 3);
        let mut value = Value::Array(vec![Value::UInt(5)]);
        let bytes = encode_value(&layout, &mut value, NdrContext::new()).unwrap();
        assert_eq!(&bytes[..], &[5, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_mismatched_value_is_reported() {
        let layout = counted_words();
        let mut value = Value::Struct(vec![Value::UInt(0), Value::String("x".into())]);
        let err = encode_value(&layout, &mut value, NdrContext::new()).unwrap_err();
        assert_eq!(err.field_path(), vec!["words"]);
        assert!(matches!(err.root(), NdrError::LayoutMismatch(_)));
    }

    #[test]
    fn test_hostile_count_rejected_before_allocation() {
        let layout = counted_words();
        let wire = vec![0xFF, 0xFF, 0xFF, 0x7F, 1, 0, 0, 0, 1, 0];
        let err = decode_value(&layout, wire, NdrContext::ndr20()).unwrap_err();
        assert!(matches!(err.root(), NdrError::BufferOverflow { .. }));
    }
}
