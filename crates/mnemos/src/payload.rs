//! Payloads: optional typed state attached to an object beyond its
//! attribute map and component sequence.
//!
//! The built-in kinds (`space`, `symbol`, `classinfo`, `setob`, `vectob`,
//! `vectval`) are variants of the [`Payload`] sum. New kinds are a plug-in
//! point, not a fixed set: hosts register `(deserializer, scanner,
//! serializer)` hooks under a kind name through [`PayloadKinds`], and
//! objects carrying such a kind hold an [`ExtensionPayload`] whose hooks
//! travel with the state. Either way the dumper delegates scanning and
//! body emission to the payload itself.

use std::{any::Any, collections::BTreeMap, sync::Arc, sync::LazyLock};

use indexmap::IndexMap;
use regex::Regex;
use serde_json::{Map as JsonMap, Value as Jv};
use strum::{EnumString, IntoStaticStr};

use crate::{
    error::{PersistError, Warning},
    object::ObjectRef,
    oid::Oid,
    value::{ObjSet, Value},
};

/// The built-in payload kinds, named as they appear in the `payload` token
/// of an object body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum PayloadKind {
    Space,
    Symbol,
    Classinfo,
    Setob,
    Vectob,
    Vectval,
}

/// Services the dumper provides to payload and object body emission.
///
/// Implemented by the dumper; payloads use it to turn references and values
/// into their JSON forms with dumpability rules applied.
pub trait DumpCtx {
    /// `true` when the object is persisted and reached by this dump.
    fn is_dumpable_oid(&self, oid: Oid) -> bool;
    /// The JSON form of a reference: its id string, or JSON null when the
    /// reference is null or not dumpable.
    fn json_object_ref(&mut self, r: ObjectRef) -> Jv;
    /// The JSON form of a value; transient parts degrade to JSON null with
    /// a warning.
    fn json_value(&mut self, v: &Value) -> Jv;
}

/// Services the loader provides to extension-payload deserializers.
pub trait LoadResolver {
    /// Resolves an already-interned object by id.
    fn object_by_id(&self, oid: Oid) -> Option<ObjectRef>;
    /// Parses a JSON datum as an object reference.
    fn ref_from_json(&mut self, jv: &Jv) -> Result<ObjectRef, PersistError>;
    /// Parses a JSON datum as a value.
    fn value_from_json(&mut self, jv: &Jv) -> Result<Value, PersistError>;
    /// Records a recoverable diagnostic.
    fn warn(&mut self, warning: Warning);
}

/// Builds an extension payload's state from the object body JSON.
pub type ExtLoadFn =
    fn(&mut dyn LoadResolver, owner: Oid, body: &Jv) -> Result<Box<dyn Any + Send + Sync>, PersistError>;

/// Enumerates the object ids reachable from an extension payload's state.
pub type ExtScanFn = fn(&(dyn Any + Send + Sync), &mut dyn FnMut(Oid));

/// Emits an extension payload's fields into the object body JSON.
pub type ExtDumpFn = fn(&(dyn Any + Send + Sync), &mut dyn DumpCtx, &mut JsonMap<String, Jv>);

/// The hook triple a payload kind registers: how to rebuild the state from
/// JSON, how to scan it, and how to emit it.
#[derive(Clone, Copy)]
pub struct PayloadHooks {
    pub load: ExtLoadFn,
    pub scan: ExtScanFn,
    pub dump: ExtDumpFn,
}

/// The process-wide table of registered extension payload kinds, handed
/// explicitly into each load.
#[derive(Default)]
pub struct PayloadKinds {
    table: IndexMap<String, Arc<PayloadHooks>>,
}

impl PayloadKinds {
    /// Creates an empty table; the built-in kinds need no registration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `hooks` under `name`.
    ///
    /// Returns `false` without registering when `name` is not an
    /// identifier or collides with a built-in kind.
    pub fn register(&mut self, name: impl Into<String>, hooks: PayloadHooks) -> bool {
        let name = name.into();
        let identifier = name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !identifier || name.parse::<PayloadKind>().is_ok() {
            return false;
        }
        self.table.insert(name, Arc::new(hooks));
        true
    }

    /// Looks up a registered kind.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Arc<PayloadHooks>> {
        self.table.get(name)
    }
}

/// State of an object carrying a registered (non-built-in) payload kind.
pub struct ExtensionPayload {
    kind: String,
    hooks: Arc<PayloadHooks>,
    state: Box<dyn Any + Send + Sync>,
}

impl ExtensionPayload {
    /// Assembles an extension payload from its kind name, hooks and state.
    #[must_use]
    pub fn new(kind: impl Into<String>, hooks: Arc<PayloadHooks>, state: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            kind: kind.into(),
            hooks,
            state,
        }
    }

    /// The registered kind name.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Downcasts the state to a concrete type.
    #[must_use]
    pub fn state<T: 'static>(&self) -> Option<&T> {
        self.state.downcast_ref()
    }
}

/// Marks its owner as a persistence bucket. Presence is the whole content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpacePayload;

static SYMBOL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[A-Za-z_][A-Za-z0-9_]*$").expect("symbol name pattern"));

/// A global name binding: symbol name, weakness, optional stored value.
#[derive(Debug, Clone)]
pub struct SymbolPayload {
    name: String,
    weak: bool,
    value: Option<Value>,
}

impl SymbolPayload {
    /// `true` when `name` is a well-formed symbol name.
    #[must_use]
    pub fn valid_name(name: &str) -> bool {
        SYMBOL_NAME_RE.is_match(name)
    }

    /// Builds a symbol payload; `None` when the name is malformed.
    #[must_use]
    pub fn new(name: impl Into<String>, weak: bool) -> Option<Self> {
        let name = name.into();
        Self::valid_name(&name).then_some(Self {
            name,
            weak,
            value: None,
        })
    }

    /// The symbol's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `true` for weak symbols, which are omitted from generated-names
    /// emission but still resolvable at runtime.
    #[must_use]
    pub fn is_weak(&self) -> bool {
        self.weak
    }

    /// The stored value, if any.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Stores or replaces the symbol's value.
    pub fn put_value(&mut self, value: Value) {
        self.value = Some(value);
    }
}

/// Class behavior: superclass, optional naming symbol, method dictionary,
/// optional declared attribute set.
#[derive(Debug, Clone, Default)]
pub struct ClassInfoPayload {
    superclass: ObjectRef,
    symbol: ObjectRef,
    methods: BTreeMap<Oid, Value>,
    attrset: Option<Arc<ObjSet>>,
}

impl ClassInfoPayload {
    /// Creates an empty classinfo.
    #[must_use]
    pub fn new(superclass: ObjectRef) -> Self {
        Self {
            superclass,
            ..Self::default()
        }
    }

    /// The superclass object.
    #[must_use]
    pub fn superclass(&self) -> ObjectRef {
        self.superclass
    }

    /// Replaces the superclass.
    pub fn put_superclass(&mut self, superclass: ObjectRef) {
        self.superclass = superclass;
    }

    /// The symbol object naming this class, or null.
    #[must_use]
    pub fn symbol(&self) -> ObjectRef {
        self.symbol
    }

    /// Binds the naming symbol.
    pub fn put_symbol(&mut self, symbol: ObjectRef) {
        self.symbol = symbol;
    }

    /// The method dictionary, selector id to closure value, in selector-id
    /// order.
    #[must_use]
    pub fn methods(&self) -> &BTreeMap<Oid, Value> {
        &self.methods
    }

    /// Installs or replaces a method under `selector`.
    pub fn put_method(&mut self, selector: Oid, closure: Value) {
        self.methods.insert(selector, closure);
    }

    /// The declared attribute set, if any.
    #[must_use]
    pub fn attrset(&self) -> Option<&Arc<ObjSet>> {
        self.attrset.as_ref()
    }

    /// Declares the attribute set.
    pub fn put_attrset(&mut self, attrset: Arc<ObjSet>) {
        self.attrset = Some(attrset);
    }
}

/// A mutable, id-ordered set of objects.
#[derive(Debug, Clone, Default)]
pub struct SetObPayload {
    elems: std::collections::BTreeSet<Oid>,
}

impl SetObPayload {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an element; `false` when already present.
    pub fn add(&mut self, oid: Oid) -> bool {
        self.elems.insert(oid)
    }

    /// Removes an element; `false` when absent.
    pub fn remove(&mut self, oid: Oid) -> bool {
        self.elems.remove(&oid)
    }

    /// Membership test.
    #[must_use]
    pub fn contains(&self, oid: Oid) -> bool {
        self.elems.contains(&oid)
    }

    /// Elements in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = Oid> + '_ {
        self.elems.iter().copied()
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// `true` when empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }
}

/// A mutable vector of object references.
#[derive(Debug, Clone, Default)]
pub struct VectObPayload {
    elems: Vec<ObjectRef>,
}

impl VectObPayload {
    /// Creates an empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allocates capacity.
    pub fn reserve(&mut self, n: usize) {
        self.elems.reserve(n);
    }

    /// Appends a reference.
    pub fn push(&mut self, r: ObjectRef) {
        self.elems.push(r);
    }

    /// The references in insertion order.
    #[must_use]
    pub fn elems(&self) -> &[ObjectRef] {
        &self.elems
    }
}

/// A mutable vector of values.
#[derive(Debug, Clone, Default)]
pub struct VectValPayload {
    comps: Vec<Value>,
}

impl VectValPayload {
    /// Creates an empty vector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allocates capacity.
    pub fn reserve(&mut self, n: usize) {
        self.comps.reserve(n);
    }

    /// Appends a value.
    pub fn push(&mut self, value: Value) {
        self.comps.push(value);
    }

    /// The values in insertion order.
    #[must_use]
    pub fn comps(&self) -> &[Value] {
        &self.comps
    }
}

/// The payload sum: built-in kinds plus the open extension variant.
pub enum Payload {
    Space(SpacePayload),
    Symbol(SymbolPayload),
    ClassInfo(ClassInfoPayload),
    SetOb(SetObPayload),
    VectOb(VectObPayload),
    VectVal(VectValPayload),
    Extension(ExtensionPayload),
}

impl Payload {
    /// The kind name as written in the `payload` token.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        match self {
            Self::Space(_) => PayloadKind::Space.into(),
            Self::Symbol(_) => PayloadKind::Symbol.into(),
            Self::ClassInfo(_) => PayloadKind::Classinfo.into(),
            Self::SetOb(_) => PayloadKind::Setob.into(),
            Self::VectOb(_) => PayloadKind::Vectob.into(),
            Self::VectVal(_) => PayloadKind::Vectval.into(),
            Self::Extension(ext) => ext.kind(),
        }
    }

    /// Downcast to the symbol payload.
    #[must_use]
    pub fn as_symbol(&self) -> Option<&SymbolPayload> {
        match self {
            Self::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Mutable downcast to the symbol payload.
    pub fn as_symbol_mut(&mut self) -> Option<&mut SymbolPayload> {
        match self {
            Self::Symbol(s) => Some(s),
            _ => None,
        }
    }

    /// Downcast to the classinfo payload.
    #[must_use]
    pub fn as_classinfo(&self) -> Option<&ClassInfoPayload> {
        match self {
            Self::ClassInfo(c) => Some(c),
            _ => None,
        }
    }

    /// Mutable downcast to the classinfo payload.
    pub fn as_classinfo_mut(&mut self) -> Option<&mut ClassInfoPayload> {
        match self {
            Self::ClassInfo(c) => Some(c),
            _ => None,
        }
    }

    /// Downcast to the space payload.
    #[must_use]
    pub fn as_space(&self) -> Option<&SpacePayload> {
        match self {
            Self::Space(s) => Some(s),
            _ => None,
        }
    }

    /// Downcast to the mutable object-set payload.
    #[must_use]
    pub fn as_setob(&self) -> Option<&SetObPayload> {
        match self {
            Self::SetOb(s) => Some(s),
            _ => None,
        }
    }

    /// Mutable downcast to the object-set payload.
    pub fn as_setob_mut(&mut self) -> Option<&mut SetObPayload> {
        match self {
            Self::SetOb(s) => Some(s),
            _ => None,
        }
    }

    /// Downcast to the object-vector payload.
    #[must_use]
    pub fn as_vectob(&self) -> Option<&VectObPayload> {
        match self {
            Self::VectOb(v) => Some(v),
            _ => None,
        }
    }

    /// Downcast to the value-vector payload.
    #[must_use]
    pub fn as_vectval(&self) -> Option<&VectValPayload> {
        match self {
            Self::VectVal(v) => Some(v),
            _ => None,
        }
    }

    /// Downcast to an extension payload of the given kind.
    #[must_use]
    pub fn as_extension(&self, kind: &str) -> Option<&ExtensionPayload> {
        match self {
            Self::Extension(ext) if ext.kind() == kind => Some(ext),
            _ => None,
        }
    }

    /// Calls `visit` with every object id reachable from the payload.
    pub fn dump_scan(&self, visit: &mut dyn FnMut(Oid)) {
        match self {
            Self::Space(_) => {}
            Self::Symbol(symbol) => {
                if let Some(value) = symbol.value() {
                    value.walk_references(visit);
                }
            }
            Self::ClassInfo(info) => {
                if let Some(oid) = info.superclass().oid() {
                    visit(oid);
                }
                if let Some(oid) = info.symbol().oid() {
                    visit(oid);
                }
                for (selector, closure) in info.methods() {
                    visit(*selector);
                    closure.walk_references(visit);
                }
                if let Some(attrset) = info.attrset() {
                    for &oid in attrset.elems() {
                        visit(oid);
                    }
                }
            }
            Self::SetOb(set) => {
                for oid in set.iter() {
                    visit(oid);
                }
            }
            Self::VectOb(vect) => {
                for r in vect.elems() {
                    if let Some(oid) = r.oid() {
                        visit(oid);
                    }
                }
            }
            Self::VectVal(vect) => {
                for value in vect.comps() {
                    value.walk_references(visit);
                }
            }
            Self::Extension(ext) => (ext.hooks.scan)(ext.state.as_ref(), visit),
        }
    }

    /// Emits `payload` plus the kind-specific fields into the object body.
    pub fn dump_json_content(&self, ctx: &mut dyn DumpCtx, body: &mut JsonMap<String, Jv>) {
        body.insert("payload".to_owned(), Jv::String(self.kind_name().to_owned()));
        match self {
            Self::Space(_) => {}
            Self::Symbol(symbol) => {
                body.insert("symb_name".to_owned(), Jv::String(symbol.name().to_owned()));
                body.insert("symb_weak".to_owned(), Jv::Bool(symbol.is_weak()));
                if let Some(value) = symbol.value() {
                    let jv = ctx.json_value(value);
                    if !jv.is_null() {
                        body.insert("symb_val".to_owned(), jv);
                    }
                }
            }
            Self::ClassInfo(info) => {
                body.insert("class_super".to_owned(), ctx.json_object_ref(info.superclass()));
                if !info.symbol().is_null() {
                    body.insert("class_symb".to_owned(), ctx.json_object_ref(info.symbol()));
                }
                let mut dict = Vec::with_capacity(info.methods().len());
                for (selector, closure) in info.methods() {
                    if !ctx.is_dumpable_oid(*selector) {
                        continue;
                    }
                    let mut entry = JsonMap::new();
                    entry.insert("methosel".to_owned(), Jv::String(selector.to_string()));
                    entry.insert("methclos".to_owned(), ctx.json_value(closure));
                    dict.push(Jv::Object(entry));
                }
                body.insert("class_methodict".to_owned(), Jv::Array(dict));
                if let Some(attrset) = info.attrset() {
                    let elems: Vec<Jv> = attrset
                        .elems()
                        .iter()
                        .filter(|oid| ctx.is_dumpable_oid(**oid))
                        .map(|oid| Jv::String(oid.to_string()))
                        .collect();
                    let mut set = JsonMap::new();
                    set.insert("vtype".to_owned(), Jv::String("set".to_owned()));
                    set.insert("elem".to_owned(), Jv::Array(elems));
                    body.insert("class_attrset".to_owned(), Jv::Object(set));
                }
            }
            Self::SetOb(set) => {
                let elems: Vec<Jv> = set
                    .iter()
                    .filter(|oid| ctx.is_dumpable_oid(*oid))
                    .map(|oid| Jv::String(oid.to_string()))
                    .collect();
                body.insert("setob".to_owned(), Jv::Array(elems));
            }
            Self::VectOb(vect) => {
                let elems: Vec<Jv> = vect.elems().iter().map(|r| ctx.json_object_ref(*r)).collect();
                body.insert("vectob".to_owned(), Jv::Array(elems));
            }
            Self::VectVal(vect) => {
                let comps: Vec<Jv> = vect.comps().iter().map(|value| ctx.json_value(value)).collect();
                body.insert("vectval".to_owned(), Jv::Array(comps));
            }
            Self::Extension(ext) => (ext.hooks.dump)(ext.state.as_ref(), ctx, body),
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Payload::{}", self.kind_name())
    }
}
