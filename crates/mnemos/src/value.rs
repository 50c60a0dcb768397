//! The immutable value algebra shared by the loader, the dumper and the
//! runtime.
//!
//! [`Value`] is a tagged sum of scalars (empty, integer, double, string),
//! object references, and composite forms (set, tuple, closure, instance,
//! embedded JSON). Composites are immutable and structurally shared through
//! `Arc`, so cloning a value is cheap and cycles live only between objects,
//! never inside values.
//!
//! Equality, ordering and hashing are total over the sum: first by variant
//! tag, then by contents. Tuples, closures and instances are
//! order-sensitive; sets are id-sorted at construction, which makes their
//! hash order-insensitive by construction; embedded JSON compares and hashes
//! structurally, independent of object key order.

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use smallvec::SmallVec;

use crate::{error::PersistError, object::ObjectRef, oid::Oid};

/// A persistent value.
///
/// Scalars are stored inline; composite forms are `Arc`-shared and
/// immutable after construction. The `Empty` sentinel is distinct from a
/// null [`ObjectRef`]: `Empty` means "no value at all", while a null ref is
/// a value whose referent is absent.
#[derive(Debug, Clone)]
pub enum Value {
    /// The "no value" sentinel.
    Empty,
    /// A signed immediate integer.
    Int(i64),
    /// A finite IEEE-754 double. NaN is forbidden at every constructor.
    Double(f64),
    /// An immutable UTF-8 string.
    String(Arc<str>),
    /// A reference to an object, possibly the null reference.
    ObjectRef(ObjectRef),
    /// A sorted, duplicate-free set of object ids.
    Set(Arc<ObjSet>),
    /// An ordered sequence of object references, duplicates allowed.
    Tuple(Arc<ObjTuple>),
    /// A connective object applied over a captured environment.
    Closure(Arc<Closure>),
    /// An immutable instance of a class, with fixed-width attributes.
    Instance(Arc<Instance>),
    /// An embedded JSON document.
    Json(Arc<JsonDoc>),
}

/// Discriminant names, used by error messages and by the total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueKind {
    Empty,
    Int,
    Double,
    String,
    ObjectRef,
    Set,
    Tuple,
    Closure,
    Instance,
    Json,
}

impl ValueKind {
    /// The lowercase name used in diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Int => "int",
            Self::Double => "double",
            Self::String => "string",
            Self::ObjectRef => "object",
            Self::Set => "set",
            Self::Tuple => "tuple",
            Self::Closure => "closure",
            Self::Instance => "instance",
            Self::Json => "json",
        }
    }
}

/// Optional metadata attached to closures and instances.
///
/// A value whose metaobject is absent is *meta-transient*: the metadata is
/// dropped at dump time rather than persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetaData {
    /// The metaobject; never the null reference when the pair is present.
    pub object: Oid,
    /// Host-interpreted rank alongside the metaobject.
    pub rank: i32,
}

/// A sorted, duplicate-free set of object ids.
///
/// Iteration order is ascending id order, which is also the order the
/// dumper emits; the ordering holds by construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjSet {
    elems: Vec<Oid>,
}

impl ObjSet {
    /// Builds a set from arbitrary ids, sorting and deduplicating.
    #[must_use]
    pub fn from_ids(mut ids: Vec<Oid>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self { elems: ids }
    }

    /// The elements in ascending id order.
    #[must_use]
    pub fn elems(&self) -> &[Oid] {
        &self.elems
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// `true` when the set has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// Membership test by binary search.
    #[must_use]
    pub fn contains(&self, oid: Oid) -> bool {
        self.elems.binary_search(&oid).is_ok()
    }

    /// Position of `oid` in the sorted element sequence.
    #[must_use]
    pub fn index_of(&self, oid: Oid) -> Option<usize> {
        self.elems.binary_search(&oid).ok()
    }
}

/// An ordered tuple of object references; duplicates and nulls allowed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjTuple {
    comps: Vec<ObjectRef>,
}

impl ObjTuple {
    /// Builds a tuple preserving order and duplicates.
    #[must_use]
    pub fn from_refs(comps: Vec<ObjectRef>) -> Self {
        Self { comps }
    }

    /// The components in their stored order.
    #[must_use]
    pub fn comps(&self) -> &[ObjectRef] {
        &self.comps
    }

    /// Number of components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.comps.len()
    }

    /// `true` when the tuple has no components.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.comps.is_empty()
    }
}

/// A closure: a connective (function-like) object over captured values.
#[derive(Debug, Clone)]
pub struct Closure {
    /// The object carrying the function-like behavior.
    pub connective: Oid,
    /// The captured environment, in application order.
    pub env: SmallVec<[Value; 4]>,
    /// Optional `(metaobject, metarank)` pair.
    pub meta: Option<MetaData>,
}

impl Closure {
    /// `true` when no metaobject is attached.
    #[must_use]
    pub fn is_meta_transient(&self) -> bool {
        self.meta.is_none()
    }
}

/// An immutable instance value.
///
/// The attribute rows are kept sorted by attribute id; the class's declared
/// attribute set bounds which attributes may appear (checked at
/// construction when the classinfo is available, or by a deferred loader
/// task otherwise).
#[derive(Debug, Clone)]
pub struct Instance {
    /// The class object of this instance.
    pub class: Oid,
    /// Optional `(metaobject, metarank)` pair.
    pub meta: Option<MetaData>,
    /// Attribute rows, sorted by attribute id.
    attrs: SmallVec<[(Oid, Value); 4]>,
    /// Trailing components, order preserved.
    comps: Vec<Value>,
}

impl Instance {
    /// Builds an instance, sorting the attribute rows by attribute id.
    #[must_use]
    pub fn new(class: Oid, meta: Option<MetaData>, mut attrs: SmallVec<[(Oid, Value); 4]>, comps: Vec<Value>) -> Self {
        attrs.sort_unstable_by_key(|(attr, _)| *attr);
        Self { class, meta, attrs, comps }
    }

    /// The attribute rows in ascending attribute-id order.
    #[must_use]
    pub fn attrs(&self) -> &[(Oid, Value)] {
        &self.attrs
    }

    /// The trailing components.
    #[must_use]
    pub fn comps(&self) -> &[Value] {
        &self.comps
    }

    /// Total width: attribute rows plus trailing components.
    #[must_use]
    pub fn width(&self) -> usize {
        self.attrs.len() + self.comps.len()
    }

    /// `true` when no metaobject is attached.
    #[must_use]
    pub fn is_meta_transient(&self) -> bool {
        self.meta.is_none()
    }
}

/// An embedded JSON document with structural equality and hashing.
///
/// Two documents are equal iff they are structurally equal with JSON-object
/// key order ignored; the hash is consistent with that equality.
#[derive(Debug, Clone)]
pub struct JsonDoc {
    doc: serde_json::Value,
}

impl JsonDoc {
    /// Wraps a JSON document.
    #[must_use]
    pub fn new(doc: serde_json::Value) -> Self {
        Self { doc }
    }

    /// The underlying document.
    #[must_use]
    pub fn doc(&self) -> &serde_json::Value {
        &self.doc
    }
}

impl Value {
    /// Builds a string value.
    #[must_use]
    pub fn string(s: impl Into<Arc<str>>) -> Self {
        Self::String(s.into())
    }

    /// Builds a finite double.
    ///
    /// # Errors
    /// `TypeMismatch` when `d` is NaN; NaN is forbidden in the algebra.
    pub fn double(d: f64) -> Result<Self, PersistError> {
        if d.is_nan() {
            return Err(PersistError::TypeMismatch {
                expected: "finite double",
                actual: "NaN",
            });
        }
        Ok(Self::Double(d))
    }

    /// Builds a set value, deduplicating and sorting the ids.
    #[must_use]
    pub fn set(ids: Vec<Oid>) -> Self {
        Self::Set(Arc::new(ObjSet::from_ids(ids)))
    }

    /// Builds a tuple value, preserving order and duplicates.
    #[must_use]
    pub fn tuple(refs: Vec<ObjectRef>) -> Self {
        Self::Tuple(Arc::new(ObjTuple::from_refs(refs)))
    }

    /// Builds a closure value.
    #[must_use]
    pub fn closure(connective: Oid, env: impl IntoIterator<Item = Value>, meta: Option<MetaData>) -> Self {
        Self::Closure(Arc::new(Closure {
            connective,
            env: env.into_iter().collect(),
            meta,
        }))
    }

    /// Builds an instance value.
    #[must_use]
    pub fn instance(class: Oid, meta: Option<MetaData>, attrs: Vec<(Oid, Value)>, comps: Vec<Value>) -> Self {
        Self::Instance(Arc::new(Instance::new(class, meta, attrs.into(), comps)))
    }

    /// Builds an embedded-JSON value.
    #[must_use]
    pub fn json(doc: serde_json::Value) -> Self {
        Self::Json(Arc::new(JsonDoc::new(doc)))
    }

    /// Builds an object-reference value from an id.
    #[must_use]
    pub fn object(oid: Oid) -> Self {
        Self::ObjectRef(ObjectRef::from_oid(oid))
    }

    /// The variant tag.
    #[must_use]
    pub fn type_of(&self) -> ValueKind {
        match self {
            Self::Empty => ValueKind::Empty,
            Self::Int(_) => ValueKind::Int,
            Self::Double(_) => ValueKind::Double,
            Self::String(_) => ValueKind::String,
            Self::ObjectRef(_) => ValueKind::ObjectRef,
            Self::Set(_) => ValueKind::Set,
            Self::Tuple(_) => ValueKind::Tuple,
            Self::Closure(_) => ValueKind::Closure,
            Self::Instance(_) => ValueKind::Instance,
            Self::Json(_) => ValueKind::Json,
        }
    }

    /// `true` for the `Empty` sentinel.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    fn mismatch(&self, expected: &'static str) -> PersistError {
        PersistError::TypeMismatch {
            expected,
            actual: self.type_of().name(),
        }
    }

    /// Extracts the integer.
    pub fn as_int(&self) -> Result<i64, PersistError> {
        match self {
            Self::Int(i) => Ok(*i),
            _ => Err(self.mismatch("int")),
        }
    }

    /// Extracts the double.
    pub fn as_double(&self) -> Result<f64, PersistError> {
        match self {
            Self::Double(d) => Ok(*d),
            _ => Err(self.mismatch("double")),
        }
    }

    /// Extracts the string.
    pub fn as_str(&self) -> Result<&str, PersistError> {
        match self {
            Self::String(s) => Ok(s),
            _ => Err(self.mismatch("string")),
        }
    }

    /// Extracts the object reference.
    pub fn as_object_ref(&self) -> Result<ObjectRef, PersistError> {
        match self {
            Self::ObjectRef(r) => Ok(*r),
            _ => Err(self.mismatch("object")),
        }
    }

    /// Extracts the set.
    pub fn as_set(&self) -> Result<&Arc<ObjSet>, PersistError> {
        match self {
            Self::Set(s) => Ok(s),
            _ => Err(self.mismatch("set")),
        }
    }

    /// Extracts the tuple.
    pub fn as_tuple(&self) -> Result<&Arc<ObjTuple>, PersistError> {
        match self {
            Self::Tuple(t) => Ok(t),
            _ => Err(self.mismatch("tuple")),
        }
    }

    /// Extracts the closure.
    pub fn as_closure(&self) -> Result<&Arc<Closure>, PersistError> {
        match self {
            Self::Closure(c) => Ok(c),
            _ => Err(self.mismatch("closure")),
        }
    }

    /// Extracts the instance.
    pub fn as_instance(&self) -> Result<&Arc<Instance>, PersistError> {
        match self {
            Self::Instance(i) => Ok(i),
            _ => Err(self.mismatch("instance")),
        }
    }

    /// Extracts the embedded JSON document.
    pub fn as_json(&self) -> Result<&serde_json::Value, PersistError> {
        match self {
            Self::Json(j) => Ok(j.doc()),
            _ => Err(self.mismatch("json")),
        }
    }

    /// Calls `visitor` with every object reference nested anywhere inside
    /// this value, recursing through composite forms.
    ///
    /// This is the traversal the dumper's scan and the collector's mark
    /// phase are built on; null references are not reported.
    pub fn walk_references(&self, visitor: &mut dyn FnMut(Oid)) {
        match self {
            Self::Empty | Self::Int(_) | Self::Double(_) | Self::String(_) | Self::Json(_) => {}
            Self::ObjectRef(r) => {
                if let Some(oid) = r.oid() {
                    visitor(oid);
                }
            }
            Self::Set(set) => {
                for &oid in set.elems() {
                    visitor(oid);
                }
            }
            Self::Tuple(tuple) => {
                for comp in tuple.comps() {
                    if let Some(oid) = comp.oid() {
                        visitor(oid);
                    }
                }
            }
            Self::Closure(closure) => {
                visitor(closure.connective);
                for value in &closure.env {
                    value.walk_references(visitor);
                }
                if let Some(meta) = closure.meta {
                    visitor(meta.object);
                }
            }
            Self::Instance(instance) => {
                visitor(instance.class);
                for (attr, value) in instance.attrs() {
                    visitor(*attr);
                    value.walk_references(visitor);
                }
                for value in instance.comps() {
                    value.walk_references(visitor);
                }
                if let Some(meta) = instance.meta {
                    visitor(meta.object);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("__"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::ObjectRef(r) => write!(f, "{r}"),
            Self::Set(s) => {
                f.write_str("{")?;
                for (ix, oid) in s.elems().iter().enumerate() {
                    if ix > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{oid}")?;
                }
                f.write_str("}")
            }
            Self::Tuple(t) => {
                f.write_str("[")?;
                for (ix, r) in t.comps().iter().enumerate() {
                    if ix > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{r}")?;
                }
                f.write_str("]")
            }
            Self::Closure(c) => write!(f, "closure({}/{})", c.connective, c.env.len()),
            Self::Instance(i) => write!(f, "instance({}/{})", i.class, i.width()),
            Self::Json(j) => write!(f, "json({})", j.doc()),
        }
    }
}

// ---------------------------------------------------------------------------
// equality, total order, hash

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Empty, Self::Empty) => Ordering::Equal,
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            // NaN is forbidden, so total_cmp only has to break the 0.0/-0.0 tie
            (Self::Double(a), Self::Double(b)) => a.total_cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::ObjectRef(a), Self::ObjectRef(b)) => a.cmp(b),
            (Self::Set(a), Self::Set(b)) => a.elems().cmp(b.elems()),
            (Self::Tuple(a), Self::Tuple(b)) => a.comps().cmp(b.comps()),
            (Self::Closure(a), Self::Closure(b)) => a
                .connective
                .cmp(&b.connective)
                .then_with(|| a.env.cmp(&b.env))
                .then_with(|| a.meta.cmp(&b.meta)),
            (Self::Instance(a), Self::Instance(b)) => a
                .class
                .cmp(&b.class)
                .then_with(|| a.attrs.cmp(&b.attrs))
                .then_with(|| a.comps.cmp(&b.comps))
                .then_with(|| a.meta.cmp(&b.meta)),
            (Self::Json(a), Self::Json(b)) => json_structural_cmp(a.doc(), b.doc()),
            _ => self.type_of().cmp(&other.type_of()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // variant seed keeps e.g. Int(0) and Double(0.0) apart
        state.write_u8(self.type_of() as u8);
        match self {
            Self::Empty => {}
            Self::Int(i) => i.hash(state),
            Self::Double(d) => d.to_bits().hash(state),
            Self::String(s) => s.hash(state),
            Self::ObjectRef(r) => r.hash(state),
            Self::Set(s) => s.elems().hash(state),
            Self::Tuple(t) => t.comps().hash(state),
            Self::Closure(c) => {
                c.connective.hash(state);
                c.env.hash(state);
                c.meta.hash(state);
            }
            Self::Instance(i) => {
                i.class.hash(state);
                i.attrs.hash(state);
                i.comps.hash(state);
                i.meta.hash(state);
            }
            Self::Json(j) => json_structural_hash(j.doc(), state),
        }
    }
}

impl PartialEq for Closure {
    fn eq(&self, other: &Self) -> bool {
        self.connective == other.connective && self.env == other.env && self.meta == other.meta
    }
}

impl Eq for Closure {}

impl PartialOrd for Closure {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Closure {
    fn cmp(&self, other: &Self) -> Ordering {
        self.connective
            .cmp(&other.connective)
            .then_with(|| self.env.cmp(&other.env))
            .then_with(|| self.meta.cmp(&other.meta))
    }
}

impl Hash for Closure {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.connective.hash(state);
        self.env.hash(state);
        self.meta.hash(state);
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class && self.attrs == other.attrs && self.comps == other.comps && self.meta == other.meta
    }
}

impl Eq for Instance {}

impl PartialEq for JsonDoc {
    fn eq(&self, other: &Self) -> bool {
        json_structural_cmp(&self.doc, &other.doc) == Ordering::Equal
    }
}

impl Eq for JsonDoc {}

/// Structural comparison of JSON documents: objects compare as key-sorted
/// maps, so insertion order never matters.
fn json_structural_cmp(a: &serde_json::Value, b: &serde_json::Value) -> Ordering {
    use serde_json::Value as Jv;

    fn rank(v: &Jv) -> u8 {
        match v {
            Jv::Null => 0,
            Jv::Bool(_) => 1,
            Jv::Number(_) => 2,
            Jv::String(_) => 3,
            Jv::Array(_) => 4,
            Jv::Object(_) => 5,
        }
    }

    match (a, b) {
        (Jv::Null, Jv::Null) => Ordering::Equal,
        (Jv::Bool(x), Jv::Bool(y)) => x.cmp(y),
        (Jv::Number(x), Jv::Number(y)) => {
            let xf = x.as_f64().unwrap_or(f64::INFINITY);
            let yf = y.as_f64().unwrap_or(f64::INFINITY);
            xf.total_cmp(&yf)
        }
        (Jv::String(x), Jv::String(y)) => x.cmp(y),
        (Jv::Array(x), Jv::Array(y)) => {
            for (xe, ye) in x.iter().zip(y.iter()) {
                let ord = json_structural_cmp(xe, ye);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Jv::Object(x), Jv::Object(y)) => {
            let mut xkeys: Vec<&String> = x.keys().collect();
            let mut ykeys: Vec<&String> = y.keys().collect();
            xkeys.sort_unstable();
            ykeys.sort_unstable();
            for (xk, yk) in xkeys.iter().zip(ykeys.iter()) {
                let ord = xk.cmp(yk).then_with(|| json_structural_cmp(&x[*xk], &y[*yk]));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xkeys.len().cmp(&ykeys.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Structural hash consistent with [`json_structural_cmp`] equality.
fn json_structural_hash<H: Hasher>(v: &serde_json::Value, state: &mut H) {
    use serde_json::Value as Jv;
    match v {
        Jv::Null => state.write_u8(0),
        Jv::Bool(b) => {
            state.write_u8(1);
            b.hash(state);
        }
        Jv::Number(n) => {
            state.write_u8(2);
            n.as_f64().unwrap_or(f64::INFINITY).to_bits().hash(state);
        }
        Jv::String(s) => {
            state.write_u8(3);
            s.hash(state);
        }
        Jv::Array(items) => {
            state.write_u8(4);
            state.write_usize(items.len());
            for item in items {
                json_structural_hash(item, state);
            }
        }
        Jv::Object(map) => {
            state.write_u8(5);
            state.write_usize(map.len());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for key in keys {
                key.hash(state);
                json_structural_hash(&map[key], state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::hash_map::DefaultHasher;

    use super::*;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn set_constructor_sorts_and_dedups() {
        let a = Oid::from_parts(1, 1).unwrap();
        let b = Oid::from_parts(2, 1).unwrap();
        let c = Oid::from_parts(3, 1).unwrap();
        let v = Value::set(vec![b, a, c, a]);
        let set = v.as_set().unwrap();
        assert_eq!(set.elems(), &[a, b, c]);
    }

    #[test]
    fn tuple_constructor_keeps_duplicates() {
        let a = ObjectRef::from_oid(Oid::from_parts(1, 1).unwrap());
        let v = Value::tuple(vec![a, a]);
        assert_eq!(v.as_tuple().unwrap().len(), 2);
    }

    #[test]
    fn nan_double_is_rejected() {
        assert!(Value::double(f64::NAN).is_err());
        assert!(Value::double(1.5).is_ok());
    }

    #[test]
    fn order_is_variant_first() {
        let int = Value::Int(100);
        let dbl = Value::Double(0.5);
        let s = Value::string("a");
        assert!(int < dbl);
        assert!(dbl < s);
        assert!(Value::Empty < int);
    }

    #[test]
    fn extractors_report_mismatch() {
        let err = Value::Int(1).as_str().unwrap_err();
        assert!(matches!(
            err,
            PersistError::TypeMismatch { expected: "string", actual: "int" }
        ));
    }

    #[test]
    fn json_equality_ignores_key_order() {
        let a = Value::json(serde_json::json!({"x": 1, "y": [1, 2]}));
        let b = Value::json(serde_json::json!({"y": [1, 2], "x": 1}));
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn set_hash_is_order_insensitive() {
        let a = Oid::from_parts(1, 1).unwrap();
        let b = Oid::from_parts(2, 1).unwrap();
        assert_eq!(hash_of(&Value::set(vec![a, b])), hash_of(&Value::set(vec![b, a])));
    }

    #[test]
    fn walk_references_reaches_nested_refs() {
        let a = Oid::from_parts(1, 1).unwrap();
        let b = Oid::from_parts(2, 1).unwrap();
        let c = Oid::from_parts(3, 1).unwrap();
        let closure = Value::closure(a, [Value::object(b), Value::set(vec![c])], None);
        let mut seen = Vec::new();
        closure.walk_references(&mut |oid| seen.push(oid));
        assert_eq!(seen, vec![a, b, c]);
    }

    #[test]
    fn meta_transient_predicates() {
        let a = Oid::from_parts(1, 1).unwrap();
        let plain = Value::closure(a, [], None);
        assert!(plain.as_closure().unwrap().is_meta_transient());
        let meta = MetaData {
            object: Oid::from_parts(9, 9).unwrap(),
            rank: 3,
        };
        let tagged = Value::closure(a, [], Some(meta));
        assert!(!tagged.as_closure().unwrap().is_meta_transient());
        assert_ne!(plain, tagged);
    }
}
