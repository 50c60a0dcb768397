//! Dynamic-symbol resolution behind an abstract trait.
//!
//! The persisted corpus names native functions symbolically: a magic
//! attribute getter is `rpsget` + oid, an applying function is `rpsapply` +
//! oid, and a `loadrout` entry names its routine directly. The core never
//! names a concrete lookup mechanism; hosts plug one in through
//! [`SymbolTable`] (a `dlsym`-backed table, a static registry, or the
//! [`MapSymbols`] test double shipped here).

use crate::{object::ObjectRef, registry::Registry, value::Value};

/// Symbol-name prefix for magic attribute getters (`rpsget` + oid).
pub const GETTER_FN_PREFIX: &str = "rpsget";

/// Symbol-name prefix for applying functions (`rpsapply` + oid).
pub const APPLYING_FN_PREFIX: &str = "rpsapply";

/// Symbol-name prefix for payload deserializers (`rpsldpy_` + kind).
pub const PAYLOAD_FN_PREFIX: &str = "rpsldpy_";

/// A dynamically resolved getter supplying a virtual attribute's value.
pub type MagicGetterFn = fn(&Registry, owner: ObjectRef, attr: ObjectRef) -> Value;

/// A dynamically resolved function invoked when an object is applied.
pub type ApplyingFn = fn(&mut Registry, receiver: ObjectRef, args: &[Value]) -> Value;

/// An extra post-load routine named by a `loadrout` entry.
///
/// Receives the registry under construction, the owning object, and the
/// object's body JSON.
pub type LoadRoutineFn = fn(&mut Registry, ObjectRef, &serde_json::Value);

/// A resolved native function, discriminated by the role the loader asked
/// for. Resolving a name to the wrong role counts as a missing symbol.
#[derive(Clone, Copy)]
pub enum SymbolAddr {
    /// A magic attribute getter.
    MagicGetter(MagicGetterFn),
    /// An applying function.
    Applying(ApplyingFn),
    /// A named post-load routine.
    LoadRoutine(LoadRoutineFn),
}

impl std::fmt::Debug for SymbolAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MagicGetter(_) => f.write_str("SymbolAddr::MagicGetter(..)"),
            Self::Applying(_) => f.write_str("SymbolAddr::Applying(..)"),
            Self::LoadRoutine(_) => f.write_str("SymbolAddr::LoadRoutine(..)"),
        }
    }
}

/// Resolution of symbolic names to native functions.
///
/// The sole operation mirrors `dlsym`: a name either resolves or it does
/// not. Whether a missing symbol is fatal depends on the call site (the
/// loader treats `magicattr`/`applying` symbols as required and routine
/// bindings as best-effort).
pub trait SymbolTable {
    /// Resolves `name`, or `None` when the running program exports no such
    /// symbol.
    fn resolve(&self, name: &str) -> Option<SymbolAddr>;
}

/// A symbol table that resolves nothing.
///
/// The right default for heaps that persist no native bindings.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSymbols;

impl SymbolTable for NullSymbols {
    fn resolve(&self, _name: &str) -> Option<SymbolAddr> {
        None
    }
}

/// An in-memory symbol table, for hosts and tests.
#[derive(Default)]
pub struct MapSymbols {
    entries: ahash::AHashMap<String, SymbolAddr>,
}

impl MapSymbols {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `addr` under `name`, replacing any previous entry.
    pub fn insert(&mut self, name: impl Into<String>, addr: SymbolAddr) {
        self.entries.insert(name.into(), addr);
    }
}

impl SymbolTable for MapSymbols {
    fn resolve(&self, name: &str) -> Option<SymbolAddr> {
        self.entries.get(name).copied()
    }
}
