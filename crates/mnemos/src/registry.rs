//! The process-wide object tables: canonical identity, roots, named
//! symbols, and the slots hardwired into the host program.
//!
//! The registry is a single owned value handed explicitly from the
//! top-level calls (`load_from`, `dump_into`) down to every helper, never a
//! hidden global; tests therefore stay deterministic and two registries can
//! coexist in one process. Exclusive mutation is expressed through `&mut`
//! access to the arena, and a phase flag keeps loading, dumping and
//! collection mutually exclusive.

use std::{collections::BTreeMap, collections::BTreeSet, fmt};

use ahash::AHashMap;

use crate::{
    object::{wallclock_now, Object, ObjectRef},
    oid::Oid,
};

/// Which bulk operation currently owns the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    /// Ordinary runtime mutation.
    #[default]
    Idle,
    /// A loader is populating the registry.
    Loading,
    /// A dumper is traversing the registry.
    Dumping,
}

/// The compile-time slot tables of the host program.
///
/// These are the Rust-side image of the generated headers the host compiles
/// in: the root slots, the named-root slots, the constant slots, and the
/// class whose instances get best-effort applying-function bindings. The
/// loader verifies its bound totals against these lengths.
#[derive(Debug, Clone, Default)]
pub struct Hardwired {
    /// Ids of the hardwired root slots, one per generated root line.
    pub roots: Vec<Oid>,
    /// Id/name pairs of the hardwired named-root slots.
    pub named_roots: Vec<(Oid, String)>,
    /// Ids of the hardwired constant slots.
    pub constants: Vec<Oid>,
    /// The class of routine objects; its members get oid-suffix applying
    /// symbols resolved on load, missing ones only warned about.
    pub routine_class: Option<Oid>,
}

/// Aggregate counts over a registry, in the shape of a displayable report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStats {
    /// Total number of objects in the arena.
    pub live_objects: usize,
    /// Number of transient objects (no space).
    pub transient_objects: usize,
    /// Number of registered roots.
    pub roots: usize,
    /// Number of registered symbol names (weak and strong).
    pub symbols: usize,
    /// Live objects per payload kind name.
    pub payloads_by_kind: BTreeMap<String, usize>,
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RegistryStats: {} objects ({} transient), {} roots, {} symbols",
            self.live_objects, self.transient_objects, self.roots, self.symbols
        )?;
        for (kind, count) in &self.payloads_by_kind {
            write!(f, "\n  {kind}: {count}")?;
        }
        Ok(())
    }
}

/// The canonical identity table plus roots, symbols and hardwired slots.
pub struct Registry {
    objects: AHashMap<Oid, Object>,
    roots: BTreeSet<Oid>,
    symbols: AHashMap<String, Oid>,
    root_slots: AHashMap<Oid, ObjectRef>,
    named_slots: AHashMap<String, ObjectRef>,
    constant_slots: AHashMap<Oid, ObjectRef>,
    plugins: Vec<Oid>,
    load_start: f64,
    phase: Phase,
}

impl Registry {
    /// Creates an empty registry stamped with the current wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: AHashMap::new(),
            roots: BTreeSet::new(),
            symbols: AHashMap::new(),
            root_slots: AHashMap::new(),
            named_slots: AHashMap::new(),
            constant_slots: AHashMap::new(),
            plugins: Vec::new(),
            load_start: wallclock_now(),
            phase: Phase::Idle,
        }
    }

    // -- phase -------------------------------------------------------------

    /// Enters a bulk phase; loading, dumping and collection are mutually
    /// exclusive.
    ///
    /// # Panics
    /// When a bulk phase is already active; that is a driver bug, not a
    /// recoverable condition.
    pub fn enter_phase(&mut self, phase: Phase) {
        assert_eq!(self.phase, Phase::Idle, "bulk phases must not nest");
        self.phase = phase;
    }

    /// Leaves the current bulk phase.
    pub fn leave_phase(&mut self) {
        self.phase = Phase::Idle;
    }

    /// The active phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Wall clock at the start of the last load (or registry creation).
    #[must_use]
    pub fn load_start(&self) -> f64 {
        self.load_start
    }

    pub(crate) fn set_load_start(&mut self, clock: f64) {
        self.load_start = clock;
    }

    // -- identity ----------------------------------------------------------

    /// Returns the object with `oid`, allocating an empty one when absent.
    pub fn intern_by_id(&mut self, oid: Oid) -> ObjectRef {
        self.objects.entry(oid).or_insert_with(|| Object::new(oid));
        ObjectRef::from_oid(oid)
    }

    /// Allocates an empty object with `oid`; `false` when the id is already
    /// taken.
    pub fn insert_new(&mut self, oid: Oid) -> bool {
        if self.objects.contains_key(&oid) {
            return false;
        }
        self.objects.insert(oid, Object::new(oid));
        true
    }

    /// Looks up an object by id.
    #[must_use]
    pub fn find_by_id(&self, oid: Oid) -> Option<ObjectRef> {
        self.objects.contains_key(&oid).then(|| ObjectRef::from_oid(oid))
    }

    /// `true` when `oid` names an object in this registry.
    #[must_use]
    pub fn contains(&self, oid: Oid) -> bool {
        self.objects.contains_key(&oid)
    }

    /// Dereferences an id to its object.
    #[must_use]
    pub fn get(&self, oid: Oid) -> Option<&Object> {
        self.objects.get(&oid)
    }

    /// Dereferences an id to its object, mutably.
    pub fn get_mut(&mut self, oid: Oid) -> Option<&mut Object> {
        self.objects.get_mut(&oid)
    }

    /// Dereferences a handle to its object.
    #[must_use]
    pub fn deref(&self, r: ObjectRef) -> Option<&Object> {
        self.objects.get(&r.oid()?)
    }

    /// Creates a fresh object with a random unused id, stamped now.
    pub fn create_object(&mut self, class: ObjectRef, space: ObjectRef) -> Oid {
        let oid = loop {
            let candidate = Oid::random();
            if !self.objects.contains_key(&candidate) {
                break candidate;
            }
        };
        let mut object = Object::new(oid);
        object.loader_set_class(class);
        object.loader_set_space(space);
        object.touch();
        self.objects.insert(oid, object);
        oid
    }

    /// Removes an object from the arena. Only the collector calls this,
    /// after proving unreachability from roots and constants.
    pub fn remove_object(&mut self, oid: Oid) -> Option<Object> {
        self.roots.remove(&oid);
        self.objects.remove(&oid)
    }

    /// Number of objects in the arena.
    #[must_use]
    pub fn n_objects(&self) -> usize {
        self.objects.len()
    }

    /// Iterates every object id in the arena, in no particular order.
    pub fn object_ids(&self) -> impl Iterator<Item = Oid> + '_ {
        self.objects.keys().copied()
    }

    // -- roots -------------------------------------------------------------

    /// Adds a root; idempotent, `false` when already a root.
    pub fn add_root(&mut self, oid: Oid) -> bool {
        self.roots.insert(oid)
    }

    /// Removes a root; `false` when it was not one.
    pub fn remove_root(&mut self, oid: Oid) -> bool {
        self.roots.remove(&oid)
    }

    /// `true` when `oid` is a registered root.
    #[must_use]
    pub fn is_root(&self, oid: Oid) -> bool {
        self.roots.contains(&oid)
    }

    /// Calls `visitor` with every root, in ascending id order.
    pub fn each_root(&self, mut visitor: impl FnMut(Oid)) {
        for &oid in &self.roots {
            visitor(oid);
        }
    }

    /// Number of registered roots.
    #[must_use]
    pub fn n_roots(&self) -> usize {
        self.roots.len()
    }

    // -- symbols -----------------------------------------------------------

    /// Binds `name` to `oid` in the global name table (weak and strong
    /// symbols alike).
    pub fn register_symbol(&mut self, name: impl Into<String>, oid: Oid) {
        self.symbols.insert(name.into(), oid);
    }

    /// Unbinds `name`; `false` when it was not bound.
    pub fn unregister_symbol(&mut self, name: &str) -> bool {
        self.symbols.remove(name).is_some()
    }

    /// Resolves a symbol name to its object.
    #[must_use]
    pub fn find_symbol(&self, name: &str) -> Option<ObjectRef> {
        self.symbols.get(name).map(|&oid| ObjectRef::from_oid(oid))
    }

    /// Number of registered symbol names.
    #[must_use]
    pub fn n_symbols(&self) -> usize {
        self.symbols.len()
    }

    // -- hardwired slots ---------------------------------------------------

    /// Binds a hardwired root slot.
    pub fn bind_hardcoded_root_slot(&mut self, oid: Oid, bound: ObjectRef) {
        self.root_slots.insert(oid, bound);
    }

    /// Reads a bound hardwired root slot.
    #[must_use]
    pub fn root_slot(&self, oid: Oid) -> Option<ObjectRef> {
        self.root_slots.get(&oid).copied()
    }

    /// Binds a hardwired named-root slot.
    pub fn bind_hardcoded_named_slot(&mut self, name: impl Into<String>, bound: ObjectRef) {
        self.named_slots.insert(name.into(), bound);
    }

    /// Reads a bound hardwired named-root slot.
    #[must_use]
    pub fn named_slot(&self, name: &str) -> Option<ObjectRef> {
        self.named_slots.get(name).copied()
    }

    /// Binds a hardwired constant slot.
    pub fn bind_hardcoded_constant_slot(&mut self, oid: Oid, bound: ObjectRef) {
        self.constant_slots.insert(oid, bound);
    }

    /// Reads a bound hardwired constant slot.
    #[must_use]
    pub fn constant_slot(&self, oid: Oid) -> Option<ObjectRef> {
        self.constant_slots.get(&oid).copied()
    }

    // -- plugins -----------------------------------------------------------

    /// Plugin ids recorded by the last load, re-emitted by the dumper.
    #[must_use]
    pub fn plugins(&self) -> &[Oid] {
        &self.plugins
    }

    pub(crate) fn set_plugins(&mut self, plugins: Vec<Oid>) {
        self.plugins = plugins;
    }

    // -- reporting ---------------------------------------------------------

    /// Aggregate counts for monitoring and tests.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let mut payloads_by_kind = BTreeMap::new();
        let mut transient_objects = 0;
        for object in self.objects.values() {
            if object.is_transient() {
                transient_objects += 1;
            }
            if let Some(payload) = object.payload() {
                *payloads_by_kind.entry(payload.kind_name().to_owned()).or_insert(0) += 1;
            }
        }
        RegistryStats {
            live_objects: self.objects.len(),
            transient_objects,
            roots: self.roots.len(),
            symbols: self.symbols.len(),
            payloads_by_kind,
        }
    }

}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("objects", &self.objects.len())
            .field("roots", &self.roots.len())
            .field("symbols", &self.symbols.len())
            .field("phase", &self.phase)
            .finish()
    }
}
