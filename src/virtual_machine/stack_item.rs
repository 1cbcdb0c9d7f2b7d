//! Stack item value model.
//!
//! Every value the VM manipulates is a [`StackItem`]. Value types (null,
//! booleans, integers, byte strings, pointers) clone freely; buffers and
//! compound types (arrays, structs, maps) are shared behind `Rc<RefCell>`
//! and compare by identity. Compound creation goes through the
//! constructors that take a [`ReferenceCounter`] so that every child edge
//! is registered the moment it exists.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::Zero;

use crate::types::bytes::Bytes;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::limits::ExecutionEngineLimits;
use crate::virtual_machine::reference_counter::ReferenceCounter;
use crate::virtual_machine::script::Script;

/// Maximum byte length of the canonical integer encoding.
pub const INTEGER_MAX_SIZE: usize = 32;
/// Maximum byte length of a map key.
pub const MAP_MAX_KEY_SIZE: usize = 64;

/// Wire-level type tags.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StackItemType {
    /// The type of null; also the wildcard in type tests.
    Any = 0x00,
    Pointer = 0x10,
    Boolean = 0x20,
    Integer = 0x21,
    ByteString = 0x28,
    Buffer = 0x30,
    Array = 0x40,
    Struct = 0x41,
    Map = 0x48,
    InteropInterface = 0x60,
}

impl StackItemType {
    /// Decodes a type byte; `None` for undefined values.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Any),
            0x10 => Some(Self::Pointer),
            0x20 => Some(Self::Boolean),
            0x21 => Some(Self::Integer),
            0x28 => Some(Self::ByteString),
            0x30 => Some(Self::Buffer),
            0x40 => Some(Self::Array),
            0x41 => Some(Self::Struct),
            0x48 => Some(Self::Map),
            0x60 => Some(Self::InteropInterface),
            _ => None,
        }
    }

    /// Whether items of this type may serve as map keys.
    pub fn is_primitive(&self) -> bool {
        matches!(self, Self::Boolean | Self::Integer | Self::ByteString)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "Any",
            Self::Pointer => "Pointer",
            Self::Boolean => "Boolean",
            Self::Integer => "Integer",
            Self::ByteString => "ByteString",
            Self::Buffer => "Buffer",
            Self::Array => "Array",
            Self::Struct => "Struct",
            Self::Map => "Map",
            Self::InteropInterface => "InteropInterface",
        }
    }
}

/// Shared storage of an array or struct.
pub struct ArrayInner {
    pub(crate) items: Vec<StackItem>,
    pub(crate) read_only: bool,
}

/// One map entry; the key hash is computed at insertion and reused by
/// lookups as a cheap pre-filter.
pub(crate) struct MapEntry {
    pub(crate) hash: u64,
    pub(crate) key: StackItem,
    pub(crate) value: StackItem,
}

/// Shared storage of a map. Entries keep insertion order, which makes
/// KEYS/VALUES/UNPACK deterministic.
pub struct MapInner {
    pub(crate) entries: Vec<MapEntry>,
    pub(crate) read_only: bool,
}

impl MapInner {
    pub(crate) fn index_of(&self, key: &StackItem) -> Result<Option<usize>, VMError> {
        let hash = key.map_key_hash()?;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.hash == hash && entry.key.equals(key)? {
                return Ok(Some(i));
            }
        }
        Ok(None)
    }
}

/// A code pointer: a script plus an offset into it.
#[derive(Clone)]
pub struct PointerItem {
    pub script: Script,
    pub position: usize,
}

/// A single VM value.
#[derive(Clone)]
pub enum StackItem {
    /// The absence of a value. Its type tag is [`StackItemType::Any`].
    Null,
    Boolean(bool),
    /// Arbitrary-precision integer whose canonical encoding fits in
    /// [`INTEGER_MAX_SIZE`] bytes.
    Integer(BigInt),
    /// Immutable byte sequence.
    ByteString(Bytes),
    /// Mutable byte sequence, shared by identity.
    Buffer(Rc<RefCell<Vec<u8>>>),
    Array(Rc<RefCell<ArrayInner>>),
    /// Like an array, but compared structurally by EQUAL and cloned on
    /// APPEND/SETITEM insertion.
    Struct(Rc<RefCell<ArrayInner>>),
    Map(Rc<RefCell<MapInner>>),
    Pointer(PointerItem),
    /// Opaque host object.
    InteropInterface(Rc<dyn Any>),
}

impl StackItem {
    /// Builds an integer item, rejecting values whose canonical encoding
    /// exceeds [`INTEGER_MAX_SIZE`] bytes.
    pub fn integer(value: BigInt) -> Result<Self, VMError> {
        let size = encoded_integer_size(&value);
        if size > INTEGER_MAX_SIZE {
            return Err(VMError::IntegerOverflow { size });
        }
        Ok(Self::Integer(value))
    }

    /// Builds a zero-filled buffer of `len` bytes.
    pub fn buffer(len: usize) -> Self {
        Self::Buffer(Rc::new(RefCell::new(vec![0u8; len])))
    }

    /// Builds a buffer holding a copy of `data`.
    pub fn buffer_from(data: &[u8]) -> Self {
        Self::Buffer(Rc::new(RefCell::new(data.to_vec())))
    }

    /// Builds an array, registering it and its child edges with `rc`.
    pub fn new_array(rc: &mut ReferenceCounter, items: Vec<StackItem>) -> Self {
        Self::new_array_like(rc, items, false)
    }

    /// Builds a struct, registering it and its child edges with `rc`.
    pub fn new_struct(rc: &mut ReferenceCounter, items: Vec<StackItem>) -> Self {
        Self::new_array_like(rc, items, true)
    }

    fn new_array_like(rc: &mut ReferenceCounter, items: Vec<StackItem>, is_struct: bool) -> Self {
        let inner = Rc::new(RefCell::new(ArrayInner {
            items,
            read_only: false,
        }));
        let item = if is_struct {
            Self::Struct(inner)
        } else {
            Self::Array(inner)
        };
        rc.register_compound(&item);
        item
    }

    /// Builds an empty map, registering it with `rc`.
    pub fn new_map(rc: &mut ReferenceCounter) -> Self {
        let item = Self::Map(Rc::new(RefCell::new(MapInner {
            entries: Vec::new(),
            read_only: false,
        })));
        rc.register_compound(&item);
        item
    }

    /// Wraps a host object.
    pub fn interop(value: Rc<dyn Any>) -> Self {
        Self::InteropInterface(value)
    }

    /// The wire-level type tag.
    pub fn item_type(&self) -> StackItemType {
        match self {
            Self::Null => StackItemType::Any,
            Self::Boolean(_) => StackItemType::Boolean,
            Self::Integer(_) => StackItemType::Integer,
            Self::ByteString(_) => StackItemType::ByteString,
            Self::Buffer(_) => StackItemType::Buffer,
            Self::Array(_) => StackItemType::Array,
            Self::Struct(_) => StackItemType::Struct,
            Self::Map(_) => StackItemType::Map,
            Self::Pointer(_) => StackItemType::Pointer,
            Self::InteropInterface(_) => StackItemType::InteropInterface,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.item_type().as_str()
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Shared-allocation address for identity-compared items; `None` for
    /// value types.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Self::Buffer(b) => Some(Rc::as_ptr(b) as usize),
            Self::Array(a) | Self::Struct(a) => Some(Rc::as_ptr(a) as usize),
            Self::Map(m) => Some(Rc::as_ptr(m) as usize),
            Self::InteropInterface(i) => Some(Rc::as_ptr(i) as *const () as usize),
            _ => None,
        }
    }

    /// Whether two items are the same shared allocation.
    pub fn same_identity(a: &StackItem, b: &StackItem) -> bool {
        match (a.identity(), b.identity()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    /// Boolean coercion. Defined for every item except byte strings
    /// longer than the integer encoding limit.
    pub fn get_boolean(&self) -> Result<bool, VMError> {
        match self {
            Self::Null => Ok(false),
            Self::Boolean(b) => Ok(*b),
            Self::Integer(v) => Ok(!v.is_zero()),
            Self::ByteString(b) => {
                if b.len() > INTEGER_MAX_SIZE {
                    return Err(VMError::InvalidCast {
                        from: "ByteString",
                        to: "Boolean",
                    });
                }
                Ok(b.iter().any(|&x| x != 0))
            }
            Self::Buffer(_)
            | Self::Array(_)
            | Self::Struct(_)
            | Self::Map(_)
            | Self::Pointer(_)
            | Self::InteropInterface(_) => Ok(true),
        }
    }

    /// Integer coercion. Booleans map to 0/1; byte sequences of at most
    /// 32 bytes decode as little-endian two's complement.
    pub fn get_integer(&self) -> Result<BigInt, VMError> {
        match self {
            Self::Boolean(b) => Ok(BigInt::from(*b as u8)),
            Self::Integer(v) => Ok(v.clone()),
            Self::ByteString(b) => decode_integer(b.as_slice(), "ByteString"),
            Self::Buffer(b) => decode_integer(&b.borrow(), "Buffer"),
            other => Err(VMError::InvalidCast {
                from: other.type_name(),
                to: "Integer",
            }),
        }
    }

    /// Byte-sequence view of primitives and buffers.
    ///
    /// Integers yield their canonical encoding; buffers yield a snapshot
    /// of their current contents.
    pub fn get_bytes(&self) -> Result<Bytes, VMError> {
        match self {
            Self::Boolean(b) => Ok(Bytes::from(vec![*b as u8])),
            Self::Integer(v) => Ok(Bytes::from(encode_integer(v))),
            Self::ByteString(b) => Ok(b.clone()),
            Self::Buffer(b) => Ok(Bytes::from(b.borrow().clone())),
            other => Err(VMError::InvalidCast {
                from: other.type_name(),
                to: "ByteString",
            }),
        }
    }

    /// Downcasts an interop item to a concrete host type.
    pub fn get_interface<T: 'static>(&self) -> Result<Rc<T>, VMError> {
        match self {
            Self::InteropInterface(value) => {
                Rc::clone(value)
                    .downcast::<T>()
                    .map_err(|_| VMError::InvalidCast {
                        from: "InteropInterface",
                        to: std::any::type_name::<T>(),
                    })
            }
            other => Err(VMError::TypeMismatch {
                expected: "InteropInterface",
                actual: other.type_name(),
            }),
        }
    }

    /// Unbudgeted equality.
    ///
    /// Value types compare by content, shared types by identity. Structs
    /// refuse: their structural comparison needs a budget, see
    /// [`StackItem::equals_with_limits`].
    pub fn equals(&self, other: &StackItem) -> Result<bool, VMError> {
        match (self, other) {
            (Self::Struct(_), _) => Err(VMError::UnsupportedOperation(
                "struct comparison requires engine limits",
            )),
            (Self::Null, Self::Null) => Ok(true),
            (Self::Boolean(a), Self::Boolean(b)) => Ok(a == b),
            (Self::Integer(a), Self::Integer(b)) => Ok(a == b),
            (Self::ByteString(a), Self::ByteString(b)) => Ok(a == b),
            (Self::Pointer(a), Self::Pointer(b)) => {
                Ok(Script::same_script(&a.script, &b.script) && a.position == b.position)
            }
            _ => Ok(StackItem::same_identity(self, other)),
        }
    }

    /// Budgeted equality, used by the EQUAL/NOTEQUAL opcodes.
    ///
    /// Byte strings deduct the larger operand size from the comparable
    /// budget; struct comparison walks both operands pairwise, deducting
    /// per visited element. Exhausting the budget fails with
    /// [`VMError::ComparisonTooLarge`].
    pub fn equals_with_limits(
        &self,
        other: &StackItem,
        limits: &ExecutionEngineLimits,
    ) -> Result<bool, VMError> {
        match self {
            Self::ByteString(a) => {
                let mut budget = limits.max_comparable_size as u64;
                bytestring_equals(a, other, &mut budget)
            }
            Self::Struct(_) => struct_equals(self, other, limits),
            _ => self.equals(other),
        }
    }

    /// Content hash for map keys; only primitives hash.
    pub fn map_key_hash(&self) -> Result<u64, VMError> {
        match self {
            Self::Boolean(_) | Self::Integer(_) | Self::ByteString(_) => {
                let bytes = self.get_bytes()?;
                // FNV-1a over the type tag and canonical encoding.
                let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
                for &b in std::iter::once(&(self.item_type() as u8)).chain(bytes.iter()) {
                    hash ^= b as u64;
                    hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
                }
                Ok(hash)
            }
            _ => Err(VMError::UnsupportedOperation("only primitives hash")),
        }
    }

    /// Validates this item as a map key and returns its hash.
    pub(crate) fn require_map_key(&self) -> Result<u64, VMError> {
        if !self.item_type().is_primitive() {
            return Err(VMError::TypeMismatch {
                expected: "primitive map key",
                actual: self.type_name(),
            });
        }
        let size = self.get_bytes()?.len();
        if size > MAP_MAX_KEY_SIZE {
            return Err(VMError::ItemTooLarge {
                size,
                max: MAP_MAX_KEY_SIZE as u32,
            });
        }
        self.map_key_hash()
    }

    /// Recursively copies this item, preserving internal sharing and
    /// cycles via an identity map. The copies are marked read-only; with
    /// `as_immutable`, buffers become byte strings.
    pub fn deep_copy(&self, rc: &mut ReferenceCounter, as_immutable: bool) -> StackItem {
        let mut seen = HashMap::new();
        self.deep_copy_inner(rc, as_immutable, &mut seen)
    }

    fn deep_copy_inner(
        &self,
        rc: &mut ReferenceCounter,
        as_immutable: bool,
        seen: &mut HashMap<usize, StackItem>,
    ) -> StackItem {
        if let Some(id) = self.identity() {
            if let Some(copy) = seen.get(&id) {
                return copy.clone();
            }
        }
        match self {
            Self::Buffer(b) => {
                let data = b.borrow().clone();
                let copy = if as_immutable {
                    Self::ByteString(Bytes::from(data))
                } else {
                    Self::buffer_from(&data)
                };
                seen.insert(Rc::as_ptr(b) as usize, copy.clone());
                copy
            }
            Self::Array(inner) | Self::Struct(inner) => {
                let is_struct = matches!(self, Self::Struct(_));
                let copy = Self::new_array_like(rc, Vec::new(), is_struct);
                seen.insert(Rc::as_ptr(inner) as usize, copy.clone());
                let sources: Vec<StackItem> = inner.borrow().items.clone();
                for source in sources {
                    let child = source.deep_copy_inner(rc, as_immutable, seen);
                    rc.add_reference(&child, &copy);
                    if let Self::Array(target) | Self::Struct(target) = &copy {
                        target.borrow_mut().items.push(child);
                    }
                }
                if let Self::Array(target) | Self::Struct(target) = &copy {
                    target.borrow_mut().read_only = true;
                }
                copy
            }
            Self::Map(inner) => {
                let copy = Self::new_map(rc);
                seen.insert(Rc::as_ptr(inner) as usize, copy.clone());
                let sources: Vec<(u64, StackItem, StackItem)> = inner
                    .borrow()
                    .entries
                    .iter()
                    .map(|e| (e.hash, e.key.clone(), e.value.clone()))
                    .collect();
                for (hash, key, value) in sources {
                    let value = value.deep_copy_inner(rc, as_immutable, seen);
                    rc.add_reference(&key, &copy);
                    rc.add_reference(&value, &copy);
                    if let Self::Map(target) = &copy {
                        target.borrow_mut().entries.push(MapEntry { hash, key, value });
                    }
                }
                if let Self::Map(target) = &copy {
                    target.borrow_mut().read_only = true;
                }
                copy
            }
            _ => self.clone(),
        }
    }

    /// Value-semantics copy of a struct: nested structs are cloned
    /// breadth-first, other children stay shared.
    ///
    /// The element count across the whole clone is bounded by the stack
    /// size limit, which stops clone bombs from self-referential structs.
    pub fn struct_clone(
        &self,
        rc: &mut ReferenceCounter,
        limits: &ExecutionEngineLimits,
    ) -> Result<StackItem, VMError> {
        let source = match self {
            Self::Struct(inner) => Rc::clone(inner),
            other => {
                return Err(VMError::TypeMismatch {
                    expected: "Struct",
                    actual: other.type_name(),
                })
            }
        };
        let mut count = limits.max_stack_size as i64 - 1;
        let result = Self::new_struct(rc, Vec::new());
        let result_inner = match &result {
            Self::Struct(inner) => Rc::clone(inner),
            _ => return Err(VMError::NoContext),
        };
        let mut queue: VecDeque<(Rc<RefCell<ArrayInner>>, Rc<RefCell<ArrayInner>>)> =
            VecDeque::new();
        queue.push_back((result_inner, source));
        while let Some((target, source)) = queue.pop_front() {
            let children: Vec<StackItem> = source.borrow().items.clone();
            for child in children {
                count -= 1;
                if count < 0 {
                    return Err(VMError::InvalidOperation(
                        "struct clone exceeds the item limit".into(),
                    ));
                }
                let parent = Self::Struct(Rc::clone(&target));
                if let Self::Struct(nested_source) = &child {
                    let nested = Self::new_struct(rc, Vec::new());
                    rc.add_reference(&nested, &parent);
                    if let Self::Struct(nested_inner) = &nested {
                        queue.push_back((Rc::clone(nested_inner), Rc::clone(nested_source)));
                    }
                    target.borrow_mut().items.push(nested);
                } else {
                    rc.add_reference(&child, &parent);
                    target.borrow_mut().items.push(child);
                }
            }
        }
        Ok(result)
    }

    /// Type-directed conversion, used by the CONVERT opcode.
    pub fn convert_to(
        &self,
        ty: StackItemType,
        rc: &mut ReferenceCounter,
    ) -> Result<StackItem, VMError> {
        if ty == self.item_type() {
            return Ok(self.clone());
        }
        let cast_err = || VMError::InvalidCast {
            from: self.type_name(),
            to: ty.as_str(),
        };
        if self.is_null() {
            // Null converts to nothing but its own type.
            return Err(cast_err());
        }
        match ty {
            StackItemType::Boolean => Ok(Self::Boolean(self.get_boolean()?)),
            StackItemType::Integer => match self {
                Self::Boolean(_) | Self::ByteString(_) | Self::Buffer(_) => {
                    Self::integer(self.get_integer()?)
                }
                _ => Err(cast_err()),
            },
            StackItemType::ByteString => match self {
                Self::Boolean(_) | Self::Integer(_) | Self::Buffer(_) => {
                    Ok(Self::ByteString(self.get_bytes()?))
                }
                _ => Err(cast_err()),
            },
            StackItemType::Buffer => match self {
                Self::Boolean(_) | Self::Integer(_) | Self::ByteString(_) => {
                    Ok(Self::buffer_from(&self.get_bytes()?))
                }
                _ => Err(cast_err()),
            },
            StackItemType::Array => match self {
                Self::Struct(inner) => {
                    let items = inner.borrow().items.clone();
                    Ok(Self::new_array(rc, items))
                }
                _ => Err(cast_err()),
            },
            StackItemType::Struct => match self {
                Self::Array(inner) => {
                    let items = inner.borrow().items.clone();
                    Ok(Self::new_struct(rc, items))
                }
                _ => Err(cast_err()),
            },
            _ => Err(cast_err()),
        }
    }

    /// The default value of a type, used by NEWARRAY_T.
    pub fn default_of(ty: StackItemType) -> StackItem {
        match ty {
            StackItemType::Boolean => Self::Boolean(false),
            StackItemType::Integer => Self::Integer(BigInt::zero()),
            StackItemType::ByteString => Self::ByteString(Bytes::default()),
            _ => Self::Null,
        }
    }

    /// Direct children of a compound (keys and values for maps).
    pub(crate) fn sub_items(&self) -> Vec<StackItem> {
        match self {
            Self::Array(inner) | Self::Struct(inner) => inner.borrow().items.clone(),
            Self::Map(inner) => inner
                .borrow()
                .entries
                .iter()
                .flat_map(|e| [e.key.clone(), e.value.clone()])
                .collect(),
            _ => Vec::new(),
        }
    }

    pub(crate) fn sub_items_count(&self) -> usize {
        match self {
            Self::Array(inner) | Self::Struct(inner) => inner.borrow().items.len(),
            Self::Map(inner) => inner.borrow().entries.len() * 2,
            _ => 0,
        }
    }
}

impl fmt::Debug for StackItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Null"),
            Self::Boolean(b) => write!(f, "Boolean({})", b),
            Self::Integer(v) => write!(f, "Integer({})", v),
            Self::ByteString(b) => write!(f, "ByteString({:?})", b),
            Self::Buffer(b) => write!(f, "Buffer(len={})", b.borrow().len()),
            Self::Array(a) => write!(f, "Array(len={})", a.borrow().items.len()),
            Self::Struct(s) => write!(f, "Struct(len={})", s.borrow().items.len()),
            Self::Map(m) => write!(f, "Map(len={})", m.borrow().entries.len()),
            Self::Pointer(p) => write!(f, "Pointer({})", p.position),
            Self::InteropInterface(_) => write!(f, "InteropInterface"),
        }
    }
}

impl From<bool> for StackItem {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for StackItem {
    fn from(value: i64) -> Self {
        Self::Integer(BigInt::from(value))
    }
}

impl From<BigInt> for StackItem {
    fn from(value: BigInt) -> Self {
        Self::Integer(value)
    }
}

impl From<&[u8]> for StackItem {
    fn from(value: &[u8]) -> Self {
        Self::ByteString(Bytes::from(value))
    }
}

impl From<Bytes> for StackItem {
    fn from(value: Bytes) -> Self {
        Self::ByteString(value)
    }
}

impl From<&str> for StackItem {
    fn from(value: &str) -> Self {
        Self::ByteString(Bytes::from(value))
    }
}

/// Canonical integer encoding: little-endian two's complement with no
/// redundant sign bytes; zero is the empty sequence.
pub fn encode_integer(value: &BigInt) -> Vec<u8> {
    if value.is_zero() {
        return Vec::new();
    }
    value.to_signed_bytes_le()
}

fn encoded_integer_size(value: &BigInt) -> usize {
    encode_integer(value).len()
}

fn decode_integer(bytes: &[u8], from: &'static str) -> Result<BigInt, VMError> {
    if bytes.len() > INTEGER_MAX_SIZE {
        return Err(VMError::InvalidCast {
            from,
            to: "Integer",
        });
    }
    Ok(BigInt::from_signed_bytes_le(bytes))
}

/// Byte-string equality against a shrinking comparable budget.
///
/// The budget is charged `max(len(a), len(b), 1)` whether or not the
/// operands match; an operand longer than the remaining budget fails
/// before any bytes are compared.
fn bytestring_equals(a: &Bytes, other: &StackItem, budget: &mut u64) -> Result<bool, VMError> {
    if a.len() as u64 > *budget {
        return Err(VMError::ComparisonTooLarge);
    }
    let mut compared: u64 = 1;
    let result = match other {
        StackItem::ByteString(b) => {
            compared = compared.max(a.len().max(b.len()) as u64);
            if b.len() as u64 > *budget {
                Err(VMError::ComparisonTooLarge)
            } else {
                Ok(a == b)
            }
        }
        _ => Ok(false),
    };
    *budget = budget.saturating_sub(compared);
    result
}

/// Structural struct equality over explicit stacks.
///
/// Both the element visit count (bounded by the stack size limit) and the
/// comparable budget shrink as the walk proceeds, so adversarially deep or
/// wide structs fail instead of running away.
fn struct_equals(
    a: &StackItem,
    b: &StackItem,
    limits: &ExecutionEngineLimits,
) -> Result<bool, VMError> {
    let mut stack1 = vec![a.clone()];
    let mut stack2 = vec![b.clone()];
    let mut count = limits.max_stack_size as u64;
    let mut budget = limits.max_comparable_size as u64;
    while let Some(x) = stack1.pop() {
        let y = match stack2.pop() {
            Some(y) => y,
            None => return Ok(false),
        };
        if count == 0 {
            return Err(VMError::InvalidOperation(
                "too many struct items to compare".into(),
            ));
        }
        count -= 1;
        if let StackItem::ByteString(bytes) = &x {
            if !bytestring_equals(bytes, &y, &mut budget)? {
                return Ok(false);
            }
            continue;
        }
        if budget == 0 {
            return Err(VMError::ComparisonTooLarge);
        }
        budget -= 1;
        match (&x, &y) {
            (StackItem::Struct(sx), StackItem::Struct(sy)) => {
                if Rc::ptr_eq(sx, sy) {
                    continue;
                }
                let items_x = sx.borrow().items.clone();
                let items_y = sy.borrow().items.clone();
                if items_x.len() != items_y.len() {
                    return Ok(false);
                }
                stack1.extend(items_x);
                stack2.extend(items_y);
            }
            (StackItem::Struct(_), _) => return Ok(false),
            _ => {
                if !x.equals(&y)? {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bs(data: &[u8]) -> StackItem {
        StackItem::from(data)
    }

    #[test]
    fn integer_encoding_round_trip() {
        for value in [
            0i64,
            1,
            -1,
            127,
            128,
            -128,
            -129,
            255,
            256,
            i64::MAX,
            i64::MIN,
        ] {
            let v = BigInt::from(value);
            let encoded = encode_integer(&v);
            assert!(encoded.len() <= INTEGER_MAX_SIZE);
            assert_eq!(BigInt::from_signed_bytes_le(&encoded), v, "value {}", value);
        }
        assert!(encode_integer(&BigInt::zero()).is_empty());
        // Minimality: 255 must not carry a redundant byte beyond its sign byte.
        assert_eq!(encode_integer(&BigInt::from(255)), vec![0xFF, 0x00]);
        assert_eq!(encode_integer(&BigInt::from(-1)), vec![0xFF]);
    }

    #[test]
    fn integer_size_limit() {
        let max: BigInt = (BigInt::from(1) << 255u32) - 1;
        assert!(StackItem::integer(max.clone()).is_ok());
        assert!(matches!(
            StackItem::integer(max + 1),
            Err(VMError::IntegerOverflow { .. })
        ));
        let min: BigInt = -(BigInt::from(1) << 255u32);
        assert!(StackItem::integer(min.clone()).is_ok());
        assert!(matches!(
            StackItem::integer(min - 1),
            Err(VMError::IntegerOverflow { .. })
        ));
    }

    #[test]
    fn boolean_coercion() {
        assert!(!StackItem::Null.get_boolean().unwrap());
        assert!(!StackItem::from(0i64).get_boolean().unwrap());
        assert!(StackItem::from(-5i64).get_boolean().unwrap());
        assert!(!bs(&[0, 0]).get_boolean().unwrap());
        assert!(bs(&[0, 1]).get_boolean().unwrap());
        assert!(StackItem::buffer(0).get_boolean().unwrap());
        let long = vec![0u8; 33];
        assert!(bs(&long).get_boolean().is_err());
    }

    #[test]
    fn integer_coercion() {
        assert_eq!(
            StackItem::Boolean(true).get_integer().unwrap(),
            BigInt::from(1)
        );
        assert_eq!(bs(&[]).get_integer().unwrap(), BigInt::zero());
        assert_eq!(bs(&[0xFF]).get_integer().unwrap(), BigInt::from(-1));
        assert_eq!(
            bs(&[0xFF, 0x00]).get_integer().unwrap(),
            BigInt::from(255)
        );
        assert!(bs(&vec![1u8; 33]).get_integer().is_err());
        assert!(StackItem::Null.get_integer().is_err());
    }

    #[test]
    fn identity_equality() {
        let mut rc = ReferenceCounter::new();
        let a = StackItem::new_array(&mut rc, vec![StackItem::from(1i64)]);
        let b = a.clone();
        let c = StackItem::new_array(&mut rc, vec![StackItem::from(1i64)]);
        assert!(a.equals(&b).unwrap());
        assert!(!a.equals(&c).unwrap());
    }

    #[test]
    fn struct_plain_equals_is_unsupported() {
        let mut rc = ReferenceCounter::new();
        let s = StackItem::new_struct(&mut rc, vec![]);
        assert!(matches!(
            s.equals(&s.clone()),
            Err(VMError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn struct_structural_equality() {
        let mut rc = ReferenceCounter::new();
        let limits = ExecutionEngineLimits::default();
        let inner_a = StackItem::new_struct(&mut rc, vec![StackItem::from(7i64)]);
        let a = StackItem::new_struct(&mut rc, vec![StackItem::from(1i64), inner_a]);
        let inner_b = StackItem::new_struct(&mut rc, vec![StackItem::from(7i64)]);
        let b = StackItem::new_struct(&mut rc, vec![StackItem::from(1i64), inner_b]);
        assert!(a.equals_with_limits(&b, &limits).unwrap());

        let inner_c = StackItem::new_struct(&mut rc, vec![StackItem::from(8i64)]);
        let c = StackItem::new_struct(&mut rc, vec![StackItem::from(1i64), inner_c]);
        assert!(!a.equals_with_limits(&c, &limits).unwrap());
        // Struct never equals a non-struct.
        assert!(!a
            .equals_with_limits(&StackItem::from(1i64), &limits)
            .unwrap());
    }

    #[test]
    fn bytestring_comparison_budget() {
        let data = vec![0xAB; 32 * 1024];
        let a = Bytes::from(data.clone());
        let b = StackItem::from(&data[..]);
        let mut budget = 65536u64;
        assert!(bytestring_equals(&a, &b, &mut budget).unwrap());
        assert_eq!(budget, 65536 - 32 * 1024);
        assert!(bytestring_equals(&a, &b, &mut budget).unwrap());
        assert_eq!(budget, 0);
        assert!(matches!(
            bytestring_equals(&a, &b, &mut budget),
            Err(VMError::ComparisonTooLarge)
        ));
    }

    #[test]
    fn empty_bytestrings_consume_budget() {
        let a = Bytes::default();
        let b = StackItem::ByteString(Bytes::default());
        let mut budget = 2u64;
        assert!(bytestring_equals(&a, &b, &mut budget).unwrap());
        assert_eq!(budget, 1);
    }

    #[test]
    fn struct_clone_copies_nested_structs() {
        let mut rc = ReferenceCounter::new();
        let limits = ExecutionEngineLimits::default();
        let inner = StackItem::new_struct(&mut rc, vec![StackItem::from(5i64)]);
        let outer = StackItem::new_struct(&mut rc, vec![inner.clone(), StackItem::from(9i64)]);
        let clone = outer.struct_clone(&mut rc, &limits).unwrap();
        assert!(!StackItem::same_identity(&outer, &clone));
        assert!(outer.equals_with_limits(&clone, &limits).unwrap());
        // Mutating the original's nested struct must not affect the clone.
        if let StackItem::Struct(s) = &inner {
            s.borrow_mut().items[0] = StackItem::from(6i64);
        }
        assert!(!outer.equals_with_limits(&clone, &limits).unwrap());
    }

    #[test]
    fn struct_clone_bomb_is_rejected() {
        let mut rc = ReferenceCounter::new();
        let limits = ExecutionEngineLimits {
            max_stack_size: 8,
            ..Default::default()
        };
        // Self-referential struct: cloning would never terminate without
        // the element bound.
        let s = StackItem::new_struct(&mut rc, vec![]);
        if let StackItem::Struct(inner) = &s {
            inner.borrow_mut().items.push(s.clone());
        }
        assert!(matches!(
            s.struct_clone(&mut rc, &limits),
            Err(VMError::InvalidOperation(_))
        ));
    }

    #[test]
    fn deep_copy_preserves_sharing_and_cycles() {
        let mut rc = ReferenceCounter::new();
        let shared = StackItem::new_array(&mut rc, vec![StackItem::from(3i64)]);
        let outer = StackItem::new_array(&mut rc, vec![shared.clone(), shared.clone()]);
        // Introduce a cycle.
        if let StackItem::Array(inner) = &outer {
            inner.borrow_mut().items.push(outer.clone());
        }
        let copy = outer.deep_copy(&mut rc, false);
        assert!(!StackItem::same_identity(&outer, &copy));
        if let StackItem::Array(inner) = &copy {
            let items = &inner.borrow().items;
            assert_eq!(items.len(), 3);
            assert!(StackItem::same_identity(&items[0], &items[1]));
            assert!(StackItem::same_identity(&items[2], &copy));
            assert!(!StackItem::same_identity(&items[0], &shared));
        } else {
            panic!("expected array");
        }
    }

    #[test]
    fn deep_copy_immutable_turns_buffers_into_bytestrings() {
        let mut rc = ReferenceCounter::new();
        let buf = StackItem::buffer_from(&[1, 2, 3]);
        let arr = StackItem::new_array(&mut rc, vec![buf]);
        let copy = arr.deep_copy(&mut rc, true);
        if let StackItem::Array(inner) = &copy {
            assert!(matches!(inner.borrow().items[0], StackItem::ByteString(_)));
        } else {
            panic!("expected array");
        }
    }

    #[test]
    fn conversion_matrix() {
        let mut rc = ReferenceCounter::new();
        // Integer -> ByteString -> Integer
        let n = StackItem::from(255i64);
        let s = n.convert_to(StackItemType::ByteString, &mut rc).unwrap();
        assert_eq!(s.get_bytes().unwrap().as_slice(), &[0xFF, 0x00]);
        let back = s.convert_to(StackItemType::Integer, &mut rc).unwrap();
        assert!(back.equals(&n).unwrap());

        // Array <-> Struct share children
        let arr = StackItem::new_array(&mut rc, vec![StackItem::from(1i64)]);
        let st = arr.convert_to(StackItemType::Struct, &mut rc).unwrap();
        assert_eq!(st.item_type(), StackItemType::Struct);
        assert!(!StackItem::same_identity(&arr, &st));

        // Null converts to nothing.
        assert!(StackItem::Null
            .convert_to(StackItemType::Boolean, &mut rc)
            .is_err());
        // Map to integer is invalid.
        let map = StackItem::new_map(&mut rc);
        assert!(map.convert_to(StackItemType::Integer, &mut rc).is_err());
        // Same type is the identity.
        let same = map.convert_to(StackItemType::Map, &mut rc).unwrap();
        assert!(StackItem::same_identity(&map, &same));
    }

    #[test]
    fn map_key_rules() {
        assert!(StackItem::from(1i64).require_map_key().is_ok());
        assert!(bs(&[0u8; 64]).require_map_key().is_ok());
        assert!(matches!(
            bs(&[0u8; 65]).require_map_key(),
            Err(VMError::ItemTooLarge { .. })
        ));
        let mut rc = ReferenceCounter::new();
        let arr = StackItem::new_array(&mut rc, vec![]);
        assert!(matches!(
            arr.require_map_key(),
            Err(VMError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn map_keys_distinguish_types() {
        // Boolean true and Integer 1 are distinct keys even though their
        // encodings agree.
        let t = StackItem::Boolean(true);
        let one = StackItem::from(1i64);
        assert!(!t.equals(&one).unwrap());
        assert_ne!(
            t.map_key_hash().unwrap(),
            one.map_key_hash().unwrap()
        );
    }

    #[test]
    fn pointer_equality() {
        let script = Script::new(vec![0x21, 0x21]);
        let a = StackItem::Pointer(PointerItem {
            script: script.clone(),
            position: 1,
        });
        let b = StackItem::Pointer(PointerItem {
            script: script.clone(),
            position: 1,
        });
        let c = StackItem::Pointer(PointerItem {
            script: Script::new(vec![0x21, 0x21]),
            position: 1,
        });
        assert!(a.equals(&b).unwrap());
        assert!(!a.equals(&c).unwrap());
    }

    #[test]
    fn interop_downcast() {
        let item = StackItem::interop(Rc::new(42u32));
        assert_eq!(*item.get_interface::<u32>().unwrap(), 42);
        assert!(item.get_interface::<String>().is_err());
    }
}
