//! The object model: identified, classed, spaced, timestamped carriers of
//! attributes, components and an optional payload.
//!
//! Objects live in the registry's arena and reference one another through
//! [`ObjectRef`], a nullable `Copy` handle holding the referent's id.
//! Because the registry is the single owner and handles carry only ids,
//! cyclic object graphs are expressed without ownership cycles; mutation
//! goes through `&mut` access obtained from the registry.
//!
//! Three call-site contracts are exposed: the `loader_*` methods used while
//! a heap is being reconstituted, the `dump_scan`/body-emission hooks used
//! by the dumper, and the plain accessors used by runtime code.

use std::{collections::BTreeMap, fmt, time::SystemTime};

use crate::{
    error::PersistError,
    oid::Oid,
    payload::Payload,
    symtab::{ApplyingFn, MagicGetterFn},
    value::Value,
};

/// A nullable, `Copy` handle to an object, dereferenced through the
/// registry.
///
/// Ordering puts the null reference first, then ascending id order, so
/// sorting handles agrees with sorting ids.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectRef(Option<Oid>);

impl ObjectRef {
    /// The null reference.
    pub const NULL: Self = Self(None);

    /// Wraps an id into a non-null handle.
    #[must_use]
    pub fn from_oid(oid: Oid) -> Self {
        Self(Some(oid))
    }

    /// The referent's id, or `None` for the null reference.
    #[must_use]
    pub fn oid(self) -> Option<Oid> {
        self.0
    }

    /// `true` for the null reference.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0.is_none()
    }
}

impl From<Oid> for ObjectRef {
    fn from(oid: Oid) -> Self {
        Self(Some(oid))
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(oid) => write!(f, "{oid}"),
            None => f.write_str("__"),
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({self})")
    }
}

/// Seconds since the Unix epoch, as the floating-point clock objects are
/// stamped with.
#[must_use]
pub fn wallclock_now() -> f64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// A heap object: id, class, space, modification time, attribute map,
/// component sequence, optional native bindings, optional payload.
///
/// A null space marks the object *transient*: it is excluded from dump
/// output and owes its lifetime entirely to the running process.
pub struct Object {
    oid: Oid,
    class: ObjectRef,
    space: ObjectRef,
    mtime: f64,
    attrs: BTreeMap<Oid, Value>,
    comps: Vec<Value>,
    magic_getter: Option<MagicGetterFn>,
    applying: Option<ApplyingFn>,
    payload: Option<Payload>,
}

impl Object {
    pub(crate) fn new(oid: Oid) -> Self {
        Self {
            oid,
            class: ObjectRef::NULL,
            space: ObjectRef::NULL,
            mtime: 0.0,
            attrs: BTreeMap::new(),
            comps: Vec::new(),
            magic_getter: None,
            applying: None,
            payload: None,
        }
    }

    /// This object's id.
    #[must_use]
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// The class object, null only before loading completes.
    #[must_use]
    pub fn class(&self) -> ObjectRef {
        self.class
    }

    /// The class object; the hook where lazily computed classes would
    /// resolve. Loaded objects always carry their class directly.
    #[must_use]
    pub fn get_or_compute_class(&self) -> ObjectRef {
        self.class
    }

    /// The space object, or the null reference for transient objects.
    #[must_use]
    pub fn space(&self) -> ObjectRef {
        self.space
    }

    /// `true` when the object belongs to no space and is therefore
    /// excluded from persistence.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.space.is_null()
    }

    /// Seconds-since-epoch modification timestamp.
    #[must_use]
    pub fn mtime(&self) -> f64 {
        self.mtime
    }

    /// Bumps the modification timestamp to the current wall clock.
    pub fn touch(&mut self) {
        self.mtime = wallclock_now();
    }

    // -- loader-facing contract --------------------------------------------

    /// Sets the class during load.
    pub fn loader_set_class(&mut self, class: ObjectRef) {
        self.class = class;
    }

    /// Sets the owning space during load.
    pub fn loader_set_space(&mut self, space: ObjectRef) {
        self.space = space;
    }

    /// Sets the modification timestamp during load.
    pub fn loader_set_mtime(&mut self, mtime: f64) {
        self.mtime = mtime;
    }

    /// Pre-allocates the component vector.
    pub fn loader_reserve_comps(&mut self, n: usize) {
        self.comps.reserve(n);
    }

    /// Appends one component during load.
    pub fn loader_add_comp(&mut self, value: Value) {
        self.comps.push(value);
    }

    /// Installs one attribute during load.
    pub fn loader_put_attr(&mut self, attr: Oid, value: Value) {
        self.attrs.insert(attr, value);
    }

    /// Binds the magic attribute getter resolved from dynamic symbols.
    pub fn loader_put_magic_getter(&mut self, getter: MagicGetterFn) {
        self.magic_getter = Some(getter);
    }

    /// Binds the applying function resolved from dynamic symbols.
    pub fn loader_put_applying_fn(&mut self, applying: ApplyingFn) {
        self.applying = Some(applying);
    }

    /// Attaches the payload.
    ///
    /// # Errors
    /// `PayloadAlreadyPresent` when a payload is already installed;
    /// replacement requires an explicit [`Object::reset_payload`].
    pub fn install_payload(&mut self, payload: Payload) -> Result<(), PersistError> {
        if self.payload.is_some() {
            return Err(PersistError::PayloadAlreadyPresent { oid: self.oid });
        }
        self.payload = Some(payload);
        Ok(())
    }

    /// Removes and returns the payload, making room for a replacement.
    pub fn reset_payload(&mut self) -> Option<Payload> {
        self.payload.take()
    }

    // -- runtime-facing contract -------------------------------------------

    /// Looks up a physical attribute; magic getters are the caller's
    /// concern.
    #[must_use]
    pub fn get_attr(&self, attr: Oid) -> Option<&Value> {
        self.attrs.get(&attr)
    }

    /// Installs or replaces an attribute and bumps the timestamp.
    pub fn put_attr(&mut self, attr: Oid, value: Value) {
        self.attrs.insert(attr, value);
        self.touch();
    }

    /// Removes an attribute, returning its prior value.
    pub fn remove_attr(&mut self, attr: Oid) -> Option<Value> {
        let prior = self.attrs.remove(&attr);
        if prior.is_some() {
            self.touch();
        }
        prior
    }

    /// The attribute rows in ascending attribute-id order.
    pub fn attrs(&self) -> impl Iterator<Item = (Oid, &Value)> {
        self.attrs.iter().map(|(oid, value)| (*oid, value))
    }

    /// Number of attributes.
    #[must_use]
    pub fn n_attrs(&self) -> usize {
        self.attrs.len()
    }

    /// Appends a component and bumps the timestamp.
    pub fn append_comp(&mut self, value: Value) {
        self.comps.push(value);
        self.touch();
    }

    /// Reads the component at `index`.
    #[must_use]
    pub fn comp(&self, index: usize) -> Option<&Value> {
        self.comps.get(index)
    }

    /// The component sequence.
    #[must_use]
    pub fn comps(&self) -> &[Value] {
        &self.comps
    }

    /// The bound magic attribute getter, if any.
    #[must_use]
    pub fn magic_getter(&self) -> Option<MagicGetterFn> {
        self.magic_getter
    }

    /// The bound applying function, if any.
    #[must_use]
    pub fn applying_fn(&self) -> Option<ApplyingFn> {
        self.applying
    }

    /// The payload, if any.
    #[must_use]
    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    /// Mutable access to the payload, if any.
    pub fn payload_mut(&mut self) -> Option<&mut Payload> {
        self.payload.as_mut()
    }

    // -- dumper-facing contract --------------------------------------------

    /// Calls `visit` with every object id reachable in one step from this
    /// object: class, attribute keys and values, components, payload
    /// contents, and value metaobjects. The owning space is the dumper's
    /// concern.
    pub fn dump_scan(&self, visit: &mut dyn FnMut(Oid)) {
        if let Some(class) = self.class.oid() {
            visit(class);
        }
        for (attr, value) in &self.attrs {
            visit(*attr);
            value.walk_references(visit);
        }
        for value in &self.comps {
            value.walk_references(visit);
        }
        if let Some(payload) = &self.payload {
            payload.dump_scan(visit);
        }
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("oid", &self.oid)
            .field("class", &self.class)
            .field("space", &self.space)
            .field("mtime", &self.mtime)
            .field("attrs", &self.attrs.len())
            .field("comps", &self.comps.len())
            .field("payload", &self.payload.as_ref().map(Payload::kind_name))
            .finish()
    }
}
