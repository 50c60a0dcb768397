//! mnemos: a reflective persistent object heap.
//!
//! An in-memory graph of typed, globally identified objects, each carrying
//! attributes, components, an optional payload and a class pointer, that
//! serializes to a directory of line-oriented text files and reconstitutes
//! into a semantically identical graph on the next run.
//!
//! The crate is organized leaves-first:
//!
//! - [`oid`]: 96-bit object ids with a base-62 textual form;
//! - [`value`]: the immutable value algebra (scalars, sets, tuples,
//!   closures, instances, embedded JSON);
//! - [`object`] / [`payload`]: the object model and its open payload
//!   kinds;
//! - [`registry`]: the canonical identity table, roots, symbols, and the
//!   host's hardwired slots;
//! - [`loader`]: the two-pass loader with its deferred-task queue;
//! - [`dumper`]: the mark-scan dumper with atomic renames.
//!
//! External collaborators (inference engine, REPL, web display) operate on
//! the [`Registry`] returned by [`load_from`] and hand it back to
//! [`dump_into`]; nothing in here is a hidden global.

mod dumper;
mod error;
mod loader;
mod object;
mod oid;
mod payload;
mod registry;
mod symtab;
mod value;

pub use crate::{
    dumper::{dump_into, DumpOutcome, DumpParams, CONSTANT_OB_PREFIX},
    error::{PersistError, Warning},
    loader::{
        initial_space_id, load_from, space_file_path, LoadOutcome, LoadParams, INITIAL_SPACE_ID, MANIFEST_FILE,
        MANIFEST_FORMAT, MAX_DEFERRED_TASKS, OBJECT_BEGIN_MARKER, OBJECT_END_MARKER, PREVIOUS_MANIFEST_FORMAT,
    },
    object::{wallclock_now, Object, ObjectRef},
    oid::{Oid, B62_DIGITS, OID_NB_CHARS, OID_NB_DIGITS},
    payload::{
        ClassInfoPayload, DumpCtx, ExtDumpFn, ExtLoadFn, ExtScanFn, ExtensionPayload, LoadResolver, Payload,
        PayloadHooks, PayloadKind, PayloadKinds, SetObPayload, SpacePayload, SymbolPayload, VectObPayload,
        VectValPayload,
    },
    registry::{Hardwired, Phase, Registry, RegistryStats},
    symtab::{
        ApplyingFn, LoadRoutineFn, MagicGetterFn, MapSymbols, NullSymbols, SymbolAddr, SymbolTable,
        APPLYING_FN_PREFIX, GETTER_FN_PREFIX, PAYLOAD_FN_PREFIX,
    },
    value::{Closure, Instance, JsonDoc, MetaData, ObjSet, ObjTuple, Value, ValueKind},
};
