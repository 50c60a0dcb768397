//! The two-pass loader: directory of text files in, populated registry out.
//!
//! Loading reads the manifest, then makes two passes over every space file.
//! The first pass validates framing and allocates one empty object per
//! `//+ob` marker, so that by the time any body is parsed every persisted
//! id is already interned and forward references cost nothing. The second
//! pass fills classes, spaces, timestamps, attributes, components, native
//! bindings and payloads. Work that cannot complete yet (an instance whose
//! class's attribute set is not materialized) goes onto a FIFO deferred
//! queue drained between spaces and after all of them.
//!
//! The loader runs on a single driver thread and owns the registry it is
//! populating; every fatal error carries the space id, line number and
//! object id nearest the defect.

use std::{
    collections::{BTreeSet, VecDeque},
    fs,
    path::{Path, PathBuf},
};

use serde_json::{Map as JsonMap, Value as Jv};
use smallvec::SmallVec;

use crate::{
    error::{PersistError, Warning},
    object::{wallclock_now, ObjectRef},
    oid::Oid,
    payload::{
        ClassInfoPayload, ExtensionPayload, LoadResolver, Payload, PayloadKind, PayloadKinds, SetObPayload,
        SpacePayload, SymbolPayload, VectObPayload, VectValPayload,
    },
    registry::{Hardwired, Phase, Registry},
    symtab::{NullSymbols, SymbolAddr, SymbolTable, APPLYING_FN_PREFIX, GETTER_FN_PREFIX, PAYLOAD_FN_PREFIX},
    value::{MetaData, Value},
};

/// Current on-disk format tag, written by the dumper.
pub const MANIFEST_FORMAT: &str = "MnemosFormat2025A";

/// The one previous format tag still accepted on load.
pub const PREVIOUS_MANIFEST_FORMAT: &str = "MnemosFormat2024B";

/// Manifest file name inside a heap directory.
pub const MANIFEST_FILE: &str = "rps_manifest.json";

/// Well-known id of the initial space.
pub const INITIAL_SPACE_ID: &str = "_13v4yoPU9fZ000003sIQQH";

/// Marker opening an object body inside a space file.
pub const OBJECT_BEGIN_MARKER: &str = "//+ob";

/// Marker closing an object body inside a space file.
pub const OBJECT_END_MARKER: &str = "//-ob";

/// Hard cap on deferred tasks for one load.
pub const MAX_DEFERRED_TASKS: usize = 1 << 20;

/// How often one task may re-enqueue itself before the loader concludes it
/// is not making progress.
const MAX_TASK_RETRIES: u32 = 64;

/// The id of the initial space.
///
/// # Panics
/// Never: the literal is a valid id.
#[must_use]
pub fn initial_space_id() -> Oid {
    Oid::parse(INITIAL_SPACE_ID).expect("well-known initial space id")
}

/// Relative path of a space file below the heap directory.
#[must_use]
pub fn space_file_path(spacid: Oid) -> String {
    format!("persistore/sp{spacid}-rps.json")
}

/// Everything a load needs besides the directory: the host's hardwired
/// slot tables, its dynamic-symbol resolution, its registered payload
/// kinds, and version metadata for skew warnings.
pub struct LoadParams {
    /// Compile-time slot tables of the host program.
    pub hardwired: Hardwired,
    /// Dynamic-symbol resolution for `magicattr`/`applying`/`loadrout`.
    pub symbols: Box<dyn SymbolTable>,
    /// Registered extension payload kinds.
    pub payload_kinds: PayloadKinds,
    /// Optional per-user manifest with extra roots and plugins.
    pub user_manifest: Option<PathBuf>,
    /// Major version of the running program, for skew warnings.
    pub major_version: u32,
    /// Minor version of the running program, for skew warnings.
    pub minor_version: u32,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            hardwired: Hardwired::default(),
            symbols: Box::new(NullSymbols),
            payload_kinds: PayloadKinds::new(),
            user_manifest: None,
            major_version: 0,
            minor_version: 2,
        }
    }
}

/// A completed load: the populated registry plus its diagnostics.
#[derive(Debug)]
pub struct LoadOutcome {
    /// The reconstituted registry.
    pub registry: Registry,
    /// Recoverable diagnostics collected along the way.
    pub warnings: Vec<Warning>,
    /// Number of objects allocated by the first passes.
    pub loaded_objects: usize,
    /// Number of space files read.
    pub spaces: usize,
}

/// Loads a heap from `dir`, reconstituting a registry.
///
/// # Errors
/// Every fatal condition of the persistence format: bad manifest, bad
/// prologue, duplicate or unresolved ids, object-count mismatches,
/// non-UTF-8 input, missing dynamic symbols, deferred-queue overflow, and
/// root/symbol count mismatches at the end.
pub fn load_from(dir: impl AsRef<Path>, params: LoadParams) -> Result<LoadOutcome, PersistError> {
    let mut loader = Loader::new(dir.as_ref().to_path_buf(), params);
    loader.registry.enter_phase(Phase::Loading);
    let result = loader.run();
    loader.registry.leave_phase();
    result?;
    let spaces = loader.spaceset.len();
    let loaded_objects = loader.registry.n_objects();
    Ok(LoadOutcome {
        registry: loader.registry,
        warnings: loader.warnings,
        loaded_objects,
        spaces,
    })
}

/// Position the loader is currently reading, attached to every diagnostic.
#[derive(Debug, Clone, Copy, Default)]
struct LoadPos {
    space: Option<Oid>,
    line: u32,
    object: Option<Oid>,
}

enum TaskOutcome {
    Done,
    Retry,
}

struct TodoTask {
    retries: u32,
    run: Box<dyn FnMut(&mut Loader) -> Result<TaskOutcome, PersistError>>,
}

#[derive(serde::Deserialize)]
struct ManifestDoc {
    format: String,
    #[serde(default)]
    rpsmajorversion: Option<i64>,
    #[serde(default)]
    rpsminorversion: Option<i64>,
    spaceset: Vec<String>,
    globalroots: Vec<String>,
    #[serde(default)]
    plugins: Vec<String>,
}

#[derive(serde::Deserialize)]
struct UserManifestDoc {
    format: String,
    #[serde(default)]
    user_roots: Vec<String>,
    #[serde(default)]
    user_plugins: Vec<String>,
}

#[derive(serde::Deserialize)]
struct PrologueDoc {
    format: String,
    spaceid: String,
    nbobjects: usize,
    #[serde(default)]
    rpsmajorversion: Option<i64>,
    #[serde(default)]
    rpsminorversion: Option<i64>,
}

/// The in-flight state of one load.
pub(crate) struct Loader {
    topdir: PathBuf,
    hardwired: Hardwired,
    symbols: Box<dyn SymbolTable>,
    payload_kinds: PayloadKinds,
    user_manifest: Option<PathBuf>,
    major_version: u32,
    minor_version: u32,
    registry: Registry,
    start_clock: f64,
    spaceset: BTreeSet<Oid>,
    globroots: BTreeSet<Oid>,
    plugins: Vec<Oid>,
    todo: VecDeque<TodoTask>,
    todo_count: usize,
    warnings: Vec<Warning>,
    pos: LoadPos,
}

impl Loader {
    fn new(topdir: PathBuf, params: LoadParams) -> Self {
        let start_clock = wallclock_now();
        let mut registry = Registry::new();
        registry.set_load_start(start_clock);
        Self {
            topdir,
            hardwired: params.hardwired,
            symbols: params.symbols,
            payload_kinds: params.payload_kinds,
            user_manifest: params.user_manifest,
            major_version: params.major_version,
            minor_version: params.minor_version,
            registry,
            start_clock,
            spaceset: BTreeSet::new(),
            globroots: BTreeSet::new(),
            plugins: Vec::new(),
            todo: VecDeque::new(),
            todo_count: 0,
            warnings: Vec::new(),
            pos: LoadPos::default(),
        }
    }

    fn run(&mut self) -> Result<(), PersistError> {
        self.parse_manifest_file()?;
        if let Some(user_manifest) = self.user_manifest.clone() {
            self.parse_user_manifest(&user_manifest)?;
        }
        // first pass: the initial space leads when present, then the rest
        let mut order: Vec<Oid> = Vec::with_capacity(self.spaceset.len());
        let initial = initial_space_id();
        if self.spaceset.contains(&initial) {
            order.push(initial);
        }
        order.extend(self.spaceset.iter().copied().filter(|&s| s != initial));
        for &spacid in &order {
            self.first_pass_space(spacid)?;
        }
        self.initialize_constant_objects();
        self.bind_root_slots();
        for &spacid in &order {
            self.run_some_todos()?;
            self.second_pass_space(spacid)?;
        }
        while self.run_some_todos()? > 0 {}
        self.install_roots_and_symbols()?;
        Ok(())
    }

    fn warn(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    fn warn_here(&mut self, message: impl Into<String>) {
        let pos = self.pos;
        let mut warning = Warning::new(message);
        warning.space = pos.space;
        warning.line = (pos.line > 0).then_some(pos.line);
        warning.object = pos.object;
        self.warnings.push(warning);
    }

    // -- manifest ----------------------------------------------------------

    fn parse_manifest_file(&mut self) -> Result<(), PersistError> {
        let path = self.topdir.join(MANIFEST_FILE);
        let text = read_utf8_text(&path)?;
        let doc: ManifestDoc = serde_json::from_str(&strip_comment_lines(&text)).map_err(|e| {
            PersistError::BadManifest {
                path: path.clone(),
                detail: e.to_string(),
            }
        })?;
        if doc.format != MANIFEST_FORMAT && doc.format != PREVIOUS_MANIFEST_FORMAT {
            return Err(PersistError::FormatVersionRejected { found: doc.format });
        }
        self.check_version_skew(&path, doc.rpsmajorversion, doc.rpsminorversion);
        for text_id in &doc.spaceset {
            let spacid = Oid::parse(text_id).map_err(|e| PersistError::BadManifest {
                path: path.clone(),
                detail: format!("bad space id: {e}"),
            })?;
            self.spaceset.insert(spacid);
        }
        for text_id in &doc.globalroots {
            let rootid = Oid::parse(text_id).map_err(|e| PersistError::BadManifest {
                path: path.clone(),
                detail: format!("bad root id: {e}"),
            })?;
            self.globroots.insert(rootid);
        }
        if doc.globalroots.len() != self.hardwired.roots.len() {
            self.warn(Warning::new(format!(
                "manifest lists {} global roots, program hardwires {}",
                doc.globalroots.len(),
                self.hardwired.roots.len()
            )));
        }
        for text_id in &doc.plugins {
            let plugid = Oid::parse(text_id).map_err(|e| PersistError::BadManifest {
                path: path.clone(),
                detail: format!("bad plugin id: {e}"),
            })?;
            self.plugins.push(plugid);
        }
        Ok(())
    }

    fn parse_user_manifest(&mut self, path: &Path) -> Result<(), PersistError> {
        let text = read_utf8_text(path)?;
        let doc: UserManifestDoc = serde_json::from_str(&strip_comment_lines(&text)).map_err(|e| {
            PersistError::BadManifest {
                path: path.to_path_buf(),
                detail: e.to_string(),
            }
        })?;
        if doc.format != MANIFEST_FORMAT {
            return Err(PersistError::FormatVersionRejected { found: doc.format });
        }
        for text_id in &doc.user_roots {
            let rootid = Oid::parse(text_id).map_err(|e| PersistError::BadManifest {
                path: path.to_path_buf(),
                detail: format!("bad user root id: {e}"),
            })?;
            self.globroots.insert(rootid);
        }
        for text_id in &doc.user_plugins {
            let plugid = Oid::parse(text_id).map_err(|e| PersistError::BadManifest {
                path: path.to_path_buf(),
                detail: format!("bad user plugin id: {e}"),
            })?;
            self.plugins.push(plugid);
        }
        Ok(())
    }

    fn check_version_skew(&mut self, path: &Path, major: Option<i64>, minor: Option<i64>) {
        let (major, minor) = (major.unwrap_or(-1), minor.unwrap_or(-1));
        if major != i64::from(self.major_version) || minor != i64::from(self.minor_version) {
            self.warn(
                Warning::new(format!(
                    "dumped by version {major}.{minor}, loaded by {}.{}",
                    self.major_version, self.minor_version
                ))
                .at(path, 1),
            );
        }
    }

    // -- first pass --------------------------------------------------------

    fn first_pass_space(&mut self, spacid: Oid) -> Result<(), PersistError> {
        let relpath = space_file_path(spacid);
        let path = self.topdir.join(&relpath);
        let lines = read_utf8_lines(&path)?;
        self.pos = LoadPos {
            space: Some(spacid),
            line: 0,
            object: None,
        };
        let mut prolog = String::new();
        let mut prolog_seen = false;
        let mut obcnt: usize = 0;
        let mut expected: usize = 0;
        for (ix, line) in lines.iter().enumerate() {
            let lineno = u32::try_from(ix + 1).unwrap_or(u32::MAX);
            self.pos.line = lineno;
            if obcnt == 0 && !prolog_seen {
                if let Some(oid) = self.object_starting_line(line) {
                    expected = self.parse_prologue(spacid, lineno, &prolog)?;
                    prolog_seen = true;
                    self.allocate_loaded(spacid, lineno, oid)?;
                    obcnt = 1;
                } else {
                    prolog.push_str(line);
                    prolog.push('\n');
                }
            } else if let Some(oid) = self.object_starting_line(line) {
                self.allocate_loaded(spacid, lineno, oid)?;
                obcnt += 1;
            }
        }
        if !prolog_seen {
            // a space may legitimately hold zero objects
            expected = self.parse_prologue(spacid, self.pos.line, &prolog)?;
        }
        if obcnt != expected {
            return Err(PersistError::ObjectCountMismatch {
                space: spacid,
                declared: expected,
                found: obcnt,
            });
        }
        Ok(())
    }

    fn parse_prologue(&mut self, spacid: Oid, lineno: u32, prolog: &str) -> Result<usize, PersistError> {
        let doc: PrologueDoc = serde_json::from_str(&strip_comment_lines(prolog)).map_err(|e| {
            PersistError::BadPrologue {
                space: spacid,
                line: lineno,
                detail: e.to_string(),
            }
        })?;
        if doc.format != MANIFEST_FORMAT && doc.format != PREVIOUS_MANIFEST_FORMAT {
            return Err(PersistError::FormatVersionRejected { found: doc.format });
        }
        if doc.spaceid != spacid.to_string() {
            return Err(PersistError::BadPrologue {
                space: spacid,
                line: lineno,
                detail: format!("prologue names space {}, file names {spacid}", doc.spaceid),
            });
        }
        let path = self.topdir.join(space_file_path(spacid));
        self.check_version_skew(&path, doc.rpsmajorversion, doc.rpsminorversion);
        Ok(doc.nbobjects)
    }

    fn allocate_loaded(&mut self, spacid: Oid, lineno: u32, oid: Oid) -> Result<(), PersistError> {
        if !self.registry.insert_new(oid) {
            return Err(PersistError::DuplicateObject {
                oid,
                space: spacid,
                line: lineno,
            });
        }
        Ok(())
    }

    /// Recognizes an object-begin marker and extracts the id; trailing
    /// content after the id is ignored. A marker-shaped line with a broken
    /// id is reported as a warning and treated as ordinary content.
    fn object_starting_line(&mut self, line: &str) -> Option<Oid> {
        let rest = line.strip_prefix(OBJECT_BEGIN_MARKER)?;
        if !rest.starts_with('_') {
            return None;
        }
        if rest.len() < crate::oid::OID_NB_CHARS {
            self.warn_here("truncated object starting line");
            return None;
        }
        let (id_text, trailing) = rest.split_at(crate::oid::OID_NB_CHARS);
        if !trailing.is_empty() && !trailing.starts_with(|c: char| c.is_whitespace() || c == ':') {
            self.warn_here("overlong id in object starting line");
            return None;
        }
        match Oid::parse(id_text) {
            Ok(oid) => Some(oid),
            Err(_) => {
                self.warn_here(format!("bad id {id_text:?} in object starting line"));
                None
            }
        }
    }

    // -- slot binding ------------------------------------------------------

    fn initialize_constant_objects(&mut self) {
        for oid in self.hardwired.constants.clone() {
            match self.registry.find_by_id(oid) {
                Some(bound) => self.registry.bind_hardcoded_constant_slot(oid, bound),
                None => self.warn(Warning::new(format!("failed to fetch constant {oid}")).on_object(oid)),
            }
        }
    }

    fn bind_root_slots(&mut self) {
        for oid in self.hardwired.roots.clone() {
            if let Some(bound) = self.registry.find_by_id(oid) {
                self.registry.bind_hardcoded_root_slot(oid, bound);
            }
        }
    }

    fn install_roots_and_symbols(&mut self) -> Result<(), PersistError> {
        for rootid in self.globroots.clone() {
            if self.registry.contains(rootid) {
                self.registry.add_root(rootid);
            } else {
                return Err(PersistError::UnresolvedId {
                    oid: rootid,
                    space: None,
                    line: 0,
                });
            }
        }
        let mut bound_roots = 0;
        for oid in self.hardwired.roots.clone() {
            match self.registry.find_by_id(oid) {
                Some(bound) => {
                    self.registry.bind_hardcoded_root_slot(oid, bound);
                    bound_roots += 1;
                }
                None => self.warn(Warning::new(format!("failed to install root {oid}")).on_object(oid)),
            }
        }
        if bound_roots != self.hardwired.roots.len() || self.registry.n_roots() != self.hardwired.roots.len() {
            return Err(PersistError::RootCountMismatch {
                expected: self.hardwired.roots.len(),
                found: self.registry.n_roots(),
            });
        }
        let mut bound_named = 0;
        for (oid, name) in self.hardwired.named_roots.clone() {
            match self.registry.find_by_id(oid) {
                Some(bound) => {
                    self.registry.bind_hardcoded_named_slot(name, bound);
                    bound_named += 1;
                }
                None => {
                    self.warn(Warning::new(format!("failed to install symbol {name} ({oid})")).on_object(oid));
                }
            }
        }
        if bound_named != self.hardwired.named_roots.len() {
            return Err(PersistError::SymbolCountMismatch {
                expected: self.hardwired.named_roots.len(),
                found: bound_named,
            });
        }
        self.registry.set_plugins(std::mem::take(&mut self.plugins));
        Ok(())
    }

    // -- deferred tasks ----------------------------------------------------

    fn add_todo(
        &mut self,
        run: Box<dyn FnMut(&mut Self) -> Result<TaskOutcome, PersistError>>,
    ) -> Result<(), PersistError> {
        self.todo_count += 1;
        if self.todo_count > MAX_DEFERRED_TASKS {
            return Err(PersistError::DeferredOverflow { tasks: self.todo_count });
        }
        self.todo.push_back(TodoTask { retries: 0, run });
        Ok(())
    }

    /// Runs one FIFO cycle over the deferred queue; tasks enqueued during
    /// the cycle wait for the next one. Returns how many tasks remain.
    fn run_some_todos(&mut self) -> Result<usize, PersistError> {
        let batch = self.todo.len();
        for _ in 0..batch {
            let Some(mut task) = self.todo.pop_front() else { break };
            match (task.run)(self)? {
                TaskOutcome::Done => {}
                TaskOutcome::Retry => {
                    task.retries += 1;
                    if task.retries > MAX_TASK_RETRIES {
                        return Err(PersistError::DeferredOverflow { tasks: self.todo_count });
                    }
                    self.todo_count += 1;
                    if self.todo_count > MAX_DEFERRED_TASKS {
                        return Err(PersistError::DeferredOverflow { tasks: self.todo_count });
                    }
                    self.todo.push_back(task);
                }
            }
        }
        Ok(self.todo.len())
    }

    // -- second pass -------------------------------------------------------

    fn second_pass_space(&mut self, spacid: Oid) -> Result<(), PersistError> {
        let relpath = space_file_path(spacid);
        let path = self.topdir.join(&relpath);
        let lines = read_utf8_lines(&path)?;
        self.pos = LoadPos {
            space: Some(spacid),
            line: 0,
            object: None,
        };
        let mut body = String::new();
        let mut current: Option<(Oid, u32)> = None;
        for (ix, line) in lines.iter().enumerate() {
            let lineno = u32::try_from(ix + 1).unwrap_or(u32::MAX);
            self.pos.line = lineno;
            if line.starts_with('#') {
                continue;
            }
            if let Some(oid) = self.object_starting_line(line) {
                if let Some((prev_oid, prev_line)) = current.take() {
                    self.parse_object_body(spacid, prev_line, prev_oid, &body)?;
                }
                body.clear();
                body.push_str(line);
                body.push('\n');
                current = Some((oid, lineno));
            } else if current.is_some() {
                body.push_str(line);
                body.push('\n');
            }
        }
        if let Some((prev_oid, prev_line)) = current.take() {
            self.parse_object_body(spacid, prev_line, prev_oid, &body)?;
        }
        Ok(())
    }

    fn parse_object_body(&mut self, spacid: Oid, lineno: u32, oid: Oid, body_text: &str) -> Result<(), PersistError> {
        self.pos = LoadPos {
            space: Some(spacid),
            line: lineno,
            object: Some(oid),
        };
        let body: Jv =
            serde_json::from_str(&strip_comment_lines(body_text)).map_err(|e| PersistError::BadObjectBody {
                space: spacid,
                line: lineno,
                oid,
                detail: e.to_string(),
            })?;
        let Jv::Object(body) = body else {
            return Err(self.bad_body(oid, "object body is not a JSON object"));
        };
        if body.get("oid").and_then(Jv::as_str) != Some(oid.to_string().as_str()) {
            return Err(self.bad_body(oid, "oid field disagrees with framing"));
        }
        let class_ref = self.ref_from_json(body.get("class").unwrap_or(&Jv::Null))?;
        if class_ref.is_null() {
            return Err(self.bad_body(oid, "missing or null class"));
        }
        let space_ref = self
            .registry
            .find_by_id(spacid)
            .ok_or(PersistError::UnresolvedId {
                oid: spacid,
                space: Some(spacid),
                line: lineno,
            })?;
        let mut mtime = body.get("mtime").and_then(Jv::as_f64).unwrap_or(0.0);
        let horizon = self.start_clock + 300.0;
        if mtime > horizon {
            self.warn_here(format!("mtime {mtime} too far in the future, clamped to {horizon}"));
            mtime = horizon;
        }
        {
            let object = self.registry.get_mut(oid).ok_or(PersistError::UnresolvedId {
                oid,
                space: Some(spacid),
                line: lineno,
            })?;
            object.loader_set_class(class_ref);
            object.loader_set_space(space_ref);
            object.loader_set_mtime(mtime);
        }
        if let Some(comps) = body.get("comps") {
            if let Jv::Array(items) = comps {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.value_from_json(item)?);
                }
                let object = self.registry.get_mut(oid).expect("interned in first pass");
                object.loader_reserve_comps(values.len());
                for value in values {
                    object.loader_add_comp(value);
                }
            } else {
                self.warn_here("comps is not an array");
            }
        }
        if let Some(attrs) = body.get("attrs") {
            if let Jv::Array(entries) = attrs {
                let mut rows = Vec::with_capacity(entries.len());
                for entry in entries {
                    let (Some(at), Some(va)) = (entry.get("at"), entry.get("va")) else {
                        self.warn_here("attribute entry lacks at/va");
                        continue;
                    };
                    let attr = self.ref_from_json(at)?;
                    let Some(attr) = attr.oid() else {
                        self.warn_here("null attribute key skipped");
                        continue;
                    };
                    let value = self.value_from_json(va)?;
                    rows.push((attr, value));
                }
                let object = self.registry.get_mut(oid).expect("interned in first pass");
                for (attr, value) in rows {
                    object.loader_put_attr(attr, value);
                }
            } else {
                self.warn_here("attrs is not an array");
            }
        }
        if body.get("magicattr").and_then(Jv::as_bool) == Some(true) {
            let symbol = format!("{GETTER_FN_PREFIX}{oid}");
            let Some(SymbolAddr::MagicGetter(getter)) = self.symbols.resolve(&symbol) else {
                return Err(PersistError::MissingDynamicSymbol {
                    symbol,
                    oid,
                    space: spacid,
                    line: lineno,
                });
            };
            self.registry
                .get_mut(oid)
                .expect("interned in first pass")
                .loader_put_magic_getter(getter);
        }
        if body.get("applying").and_then(Jv::as_bool) == Some(true) {
            let symbol = format!("{APPLYING_FN_PREFIX}{oid}");
            let Some(SymbolAddr::Applying(applying)) = self.symbols.resolve(&symbol) else {
                return Err(PersistError::MissingDynamicSymbol {
                    symbol,
                    oid,
                    space: spacid,
                    line: lineno,
                });
            };
            self.registry
                .get_mut(oid)
                .expect("interned in first pass")
                .loader_put_applying_fn(applying);
        }
        if let Some(token) = body.get("payload") {
            let Some(token) = token.as_str() else {
                return Err(self.bad_body(oid, "payload token is not a string"));
            };
            self.load_payload(spacid, lineno, oid, token, &body)?;
        }
        if self.hardwired.routine_class.is_some_and(|cl| class_ref.oid() == Some(cl)) {
            let symbol = format!("{APPLYING_FN_PREFIX}{oid}");
            match self.symbols.resolve(&symbol) {
                Some(SymbolAddr::Applying(applying)) => {
                    self.registry
                        .get_mut(oid)
                        .expect("interned in first pass")
                        .loader_put_applying_fn(applying);
                }
                _ => self.warn_here(format!("cannot resolve {symbol} for routine object")),
            }
        }
        if let Some(loadrout) = body.get("loadrout") {
            let name = loadrout.as_str().unwrap_or("");
            if name.is_empty() {
                self.warn_here("empty loadrout entry");
            } else {
                match self.symbols.resolve(name) {
                    Some(SymbolAddr::LoadRoutine(routine)) => {
                        let body_value = Jv::Object(body.clone());
                        routine(&mut self.registry, ObjectRef::from_oid(oid), &body_value);
                    }
                    _ => self.warn_here(format!("cannot resolve load routine {name}")),
                }
            }
        }
        Ok(())
    }

    fn bad_body(&self, oid: Oid, detail: &str) -> PersistError {
        PersistError::BadObjectBody {
            space: self.pos.space.unwrap_or_else(|| initial_space_id()),
            line: self.pos.line,
            oid,
            detail: detail.to_owned(),
        }
    }

    // -- payloads ----------------------------------------------------------

    fn load_payload(
        &mut self,
        spacid: Oid,
        lineno: u32,
        oid: Oid,
        token: &str,
        body: &JsonMap<String, Jv>,
    ) -> Result<(), PersistError> {
        let first = token.chars().next().unwrap_or('\0');
        if first.is_ascii_alphabetic() {
            let payload = if let Ok(kind) = token.parse::<PayloadKind>() {
                self.load_builtin_payload(kind, oid, body)?
            } else if let Some(hooks) = self.payload_kinds.get(token).cloned() {
                let state = (hooks.load)(self, oid, &Jv::Object(body.clone()))?;
                Payload::Extension(ExtensionPayload::new(token, hooks, state))
            } else {
                return Err(PersistError::MissingDynamicSymbol {
                    symbol: format!("{PAYLOAD_FN_PREFIX}{token}"),
                    oid,
                    space: spacid,
                    line: lineno,
                });
            };
            // symbol payloads register their name globally
            let symbol_name = payload.as_symbol().map(|s| s.name().to_owned());
            let object = self.registry.get_mut(oid).expect("interned in first pass");
            object.install_payload(payload)?;
            if let Some(name) = symbol_name {
                self.registry.register_symbol(name, oid);
            }
            Ok(())
        } else if first == '_' {
            match Oid::parse(token) {
                Ok(_) => {
                    self.warn_here(format!("payload token {token} names an object, skipped"));
                    Ok(())
                }
                Err(_) => Err(PersistError::UnknownPayloadKind {
                    kind: token.to_owned(),
                    oid,
                    space: spacid,
                    line: lineno,
                }),
            }
        } else {
            Err(PersistError::UnknownPayloadKind {
                kind: token.to_owned(),
                oid,
                space: spacid,
                line: lineno,
            })
        }
    }

    fn load_builtin_payload(
        &mut self,
        kind: PayloadKind,
        oid: Oid,
        body: &JsonMap<String, Jv>,
    ) -> Result<Payload, PersistError> {
        match kind {
            PayloadKind::Space => Ok(Payload::Space(SpacePayload)),
            PayloadKind::Symbol => self.load_payload_symbol(oid, body),
            PayloadKind::Classinfo => self.load_payload_classinfo(oid, body),
            PayloadKind::Setob => self.load_payload_setob(oid, body),
            PayloadKind::Vectob => self.load_payload_vectob(oid, body),
            PayloadKind::Vectval => self.load_payload_vectval(oid, body),
        }
    }

    fn load_payload_symbol(&mut self, oid: Oid, body: &JsonMap<String, Jv>) -> Result<Payload, PersistError> {
        let Some(name) = body.get("symb_name").and_then(Jv::as_str) else {
            return Err(self.bad_body(oid, "symbol payload lacks symb_name"));
        };
        let weak = body.get("symb_weak").and_then(Jv::as_bool).unwrap_or(false);
        let Some(mut symbol) = SymbolPayload::new(name, weak) else {
            return Err(self.bad_body(oid, "malformed symbol name"));
        };
        if let Some(jval) = body.get("symb_val") {
            if !jval.is_null() {
                symbol.put_value(self.value_from_json(jval)?);
            }
        }
        Ok(Payload::Symbol(symbol))
    }

    fn load_payload_classinfo(&mut self, oid: Oid, body: &JsonMap<String, Jv>) -> Result<Payload, PersistError> {
        let (Some(jsuper), Some(jdict)) = (body.get("class_super"), body.get("class_methodict")) else {
            return Err(self.bad_body(oid, "classinfo payload is incomplete"));
        };
        let superclass = self.ref_from_json(jsuper)?;
        if superclass.is_null() {
            return Err(self.bad_body(oid, "classinfo has null superclass"));
        }
        let mut info = ClassInfoPayload::new(superclass);
        if let Some(jsymb) = body.get("class_symb") {
            let symbol = self.ref_from_json(jsymb)?;
            if symbol.is_null() {
                return Err(self.bad_body(oid, "classinfo has bad class_symb"));
            }
            info.put_symbol(symbol);
        }
        let Jv::Array(entries) = jdict else {
            return Err(self.bad_body(oid, "class_methodict is not an array"));
        };
        for entry in entries {
            let (Some(jsel), Some(jclo)) = (entry.get("methosel"), entry.get("methclos")) else {
                return Err(self.bad_body(oid, "methodict entry needs methosel and methclos"));
            };
            let selector = self
                .ref_from_json(jsel)?
                .oid()
                .ok_or_else(|| self.bad_body(oid, "methodict entry has null selector"))?;
            let closure = self.value_from_json(jclo)?;
            if closure.as_closure().is_err() {
                return Err(self.bad_body(oid, "methodict entry value is not a closure"));
            }
            info.put_method(selector, closure);
        }
        if let Some(jattrset) = body.get("class_attrset") {
            let value = self.value_from_json(jattrset)?;
            match value {
                Value::Set(set) => info.put_attrset(set),
                Value::Empty => {}
                _ => return Err(self.bad_body(oid, "class_attrset is not a set")),
            }
        }
        Ok(Payload::ClassInfo(info))
    }

    fn load_payload_setob(&mut self, oid: Oid, body: &JsonMap<String, Jv>) -> Result<Payload, PersistError> {
        let Some(Jv::Array(items)) = body.get("setob") else {
            return Err(self.bad_body(oid, "setob payload lacks its array"));
        };
        let mut set = SetObPayload::new();
        for item in items {
            if let Some(elem) = self.ref_from_json(item)?.oid() {
                set.add(elem);
            }
        }
        Ok(Payload::SetOb(set))
    }

    fn load_payload_vectob(&mut self, oid: Oid, body: &JsonMap<String, Jv>) -> Result<Payload, PersistError> {
        let Some(Jv::Array(items)) = body.get("vectob") else {
            return Err(self.bad_body(oid, "vectob payload lacks its array"));
        };
        let mut vect = VectObPayload::new();
        vect.reserve(items.len());
        for item in items {
            let elem = self.ref_from_json(item)?;
            vect.push(elem);
        }
        Ok(Payload::VectOb(vect))
    }

    fn load_payload_vectval(&mut self, oid: Oid, body: &JsonMap<String, Jv>) -> Result<Payload, PersistError> {
        let Some(Jv::Array(items)) = body.get("vectval") else {
            return Err(self.bad_body(oid, "vectval payload lacks its array"));
        };
        let mut vect = VectValPayload::new();
        vect.reserve(items.len());
        for item in items {
            let value = self.value_from_json(item)?;
            vect.push(value);
        }
        Ok(Payload::VectVal(vect))
    }

    // -- values ------------------------------------------------------------

    /// Parses a JSON datum as an object reference: JSON null is the null
    /// reference, an id-shaped string resolves through the registry.
    fn ref_from_json(&mut self, jv: &Jv) -> Result<ObjectRef, PersistError> {
        match jv {
            Jv::Null => Ok(ObjectRef::NULL),
            Jv::String(text) => {
                let oid = Oid::parse(text)?;
                match self.registry.find_by_id(oid) {
                    Some(r) => Ok(r),
                    None => Err(PersistError::UnresolvedId {
                        oid,
                        space: self.pos.space,
                        line: self.pos.line,
                    }),
                }
            }
            _ => Err(PersistError::UnknownValueShape {
                space: self.pos.space.unwrap_or_else(initial_space_id),
                line: self.pos.line,
            }),
        }
    }

    /// Parses a JSON datum as a value, per the persisted value shapes.
    fn value_from_json(&mut self, jv: &Jv) -> Result<Value, PersistError> {
        match jv {
            Jv::Null => Ok(Value::Empty),
            Jv::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Ok(Value::Int(i))
                } else {
                    // JSON numbers are never NaN
                    Ok(Value::Double(n.as_f64().unwrap_or(0.0)))
                }
            }
            Jv::String(text) => {
                if Oid::looks_like_id(text) {
                    if let Ok(oid) = Oid::parse(text) {
                        return match self.registry.find_by_id(oid) {
                            Some(r) => Ok(Value::ObjectRef(r)),
                            None => Err(PersistError::UnresolvedId {
                                oid,
                                space: self.pos.space,
                                line: self.pos.line,
                            }),
                        };
                    }
                }
                Ok(Value::string(text.as_str()))
            }
            Jv::Object(map) => self.composite_from_json(map),
            Jv::Bool(_) | Jv::Array(_) => {
                self.warn_here("unrecognized value shape, treated as empty");
                Ok(Value::Empty)
            }
        }
    }

    fn composite_from_json(&mut self, map: &JsonMap<String, Jv>) -> Result<Value, PersistError> {
        if map.len() == 1 {
            if let Some(Jv::String(text)) = map.get("string") {
                return Ok(Value::string(text.as_str()));
            }
        }
        let Some(Jv::String(vtype)) = map.get("vtype") else {
            self.warn_here("unrecognized value shape, treated as empty");
            return Ok(Value::Empty);
        };
        match vtype.as_str() {
            "set" => {
                let Some(Jv::Array(items)) = map.get("elem") else {
                    self.warn_here("set value lacks elem array, treated as empty");
                    return Ok(Value::Empty);
                };
                let mut ids = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(oid) = self.ref_from_json(item)?.oid() {
                        ids.push(oid);
                    }
                }
                Ok(Value::set(ids))
            }
            "tuple" => {
                let Some(Jv::Array(items)) = map.get("comp") else {
                    self.warn_here("tuple value lacks comp array, treated as empty");
                    return Ok(Value::Empty);
                };
                let mut refs = Vec::with_capacity(items.len());
                for item in items {
                    refs.push(self.ref_from_json(item)?);
                }
                Ok(Value::tuple(refs))
            }
            "closure" => {
                let (Some(jfn), Some(jenv)) = (map.get("fn"), map.get("env")) else {
                    self.warn_here("closure value lacks fn/env, treated as empty");
                    return Ok(Value::Empty);
                };
                let Some(connective) = self.ref_from_json(jfn)?.oid() else {
                    self.warn_here("closure with null connective, treated as empty");
                    return Ok(Value::Empty);
                };
                let Jv::Array(jenv) = jenv else {
                    self.warn_here("closure env is not an array, treated as empty");
                    return Ok(Value::Empty);
                };
                let mut env = Vec::with_capacity(jenv.len());
                for item in jenv {
                    env.push(self.value_from_json(item)?);
                }
                let meta = self.meta_from_json(map)?;
                Ok(Value::closure(connective, env, meta))
            }
            "instance" => self.instance_from_json(map),
            "json" => match map.get("json") {
                Some(doc) => Ok(Value::json(doc.clone())),
                None => {
                    self.warn_here("json value lacks its document, treated as empty");
                    Ok(Value::Empty)
                }
            },
            _ => {
                self.warn_here(format!("unknown vtype {vtype:?}, treated as empty"));
                Ok(Value::Empty)
            }
        }
    }

    fn meta_from_json(&mut self, map: &JsonMap<String, Jv>) -> Result<Option<MetaData>, PersistError> {
        let Some(jmeta) = map.get("metaobj") else {
            return Ok(None);
        };
        let Some(object) = self.ref_from_json(jmeta)?.oid() else {
            return Ok(None);
        };
        let rank = map
            .get("metarank")
            .and_then(Jv::as_i64)
            .and_then(|r| i32::try_from(r).ok())
            .unwrap_or(0);
        Ok(Some(MetaData { object, rank }))
    }

    fn instance_from_json(&mut self, map: &JsonMap<String, Jv>) -> Result<Value, PersistError> {
        let Some(jclass) = map.get("class") else {
            self.warn_here("instance value lacks its class, treated as empty");
            return Ok(Value::Empty);
        };
        let Some(class) = self.ref_from_json(jclass)?.oid() else {
            self.warn_here("instance with null class, treated as empty");
            return Ok(Value::Empty);
        };
        let mut rows: SmallVec<[(Oid, Value); 4]> = SmallVec::new();
        if let Some(Jv::Array(jattrs)) = map.get("iattrs") {
            for entry in jattrs {
                let (Some(jat), Some(jva)) = (entry.get("iat"), entry.get("iva")) else {
                    continue;
                };
                let Some(attr) = self.ref_from_json(jat)?.oid() else {
                    continue;
                };
                rows.push((attr, self.value_from_json(jva)?));
            }
        }
        let mut comps = Vec::new();
        if let Some(Jv::Array(jcomps)) = map.get("icomps") {
            comps.reserve(jcomps.len());
            for entry in jcomps {
                comps.push(self.value_from_json(entry)?);
            }
        }
        let meta = self.meta_from_json(map)?;
        let attr_oids: Vec<Oid> = rows.iter().map(|(attr, _)| *attr).collect();
        let value = Value::Instance(std::sync::Arc::new(crate::value::Instance::new(class, meta, rows, comps)));
        // the class's declared attribute set bounds the rows; when its
        // classinfo is not materialized yet, validation is deferred
        if self.classinfo_ready(class, attr_oids.is_empty()) {
            self.validate_instance_attrs(class, &attr_oids)?;
        } else {
            let pos = self.pos;
            self.add_todo(Box::new(move |loader: &mut Self| {
                if !loader.classinfo_ready(class, attr_oids.is_empty()) {
                    return Ok(TaskOutcome::Retry);
                }
                loader.pos = pos;
                loader.validate_instance_attrs(class, &attr_oids)?;
                Ok(TaskOutcome::Done)
            }))?;
        }
        Ok(value)
    }

    fn classinfo_ready(&self, class: Oid, attrs_empty: bool) -> bool {
        let Some(info) = self
            .registry
            .get(class)
            .and_then(|o| o.payload())
            .and_then(Payload::as_classinfo)
        else {
            return false;
        };
        attrs_empty || info.attrset().is_some()
    }

    fn validate_instance_attrs(&self, class: Oid, attrs: &[Oid]) -> Result<(), PersistError> {
        if attrs.is_empty() {
            return Ok(());
        }
        let attrset = self
            .registry
            .get(class)
            .and_then(|o| o.payload())
            .and_then(Payload::as_classinfo)
            .and_then(|info| info.attrset().cloned());
        let owner = self.pos.object.unwrap_or(class);
        let Some(attrset) = attrset else {
            return Err(self.bad_body(owner, "instance class declares no attribute set"));
        };
        for attr in attrs {
            if !attrset.contains(*attr) {
                return Err(self.bad_body(owner, "instance carries an attribute outside its class set"));
            }
        }
        Ok(())
    }
}

impl LoadResolver for Loader {
    fn object_by_id(&self, oid: Oid) -> Option<ObjectRef> {
        self.registry.find_by_id(oid)
    }

    fn ref_from_json(&mut self, jv: &Jv) -> Result<ObjectRef, PersistError> {
        Self::ref_from_json(self, jv)
    }

    fn value_from_json(&mut self, jv: &Jv) -> Result<Value, PersistError> {
        Self::value_from_json(self, jv)
    }

    fn warn(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }
}

// -- file helpers -----------------------------------------------------------

/// Reads a whole file, validating UTF-8 line by line so the diagnostic can
/// name the offending line.
fn read_utf8_lines(path: &Path) -> Result<Vec<String>, PersistError> {
    let bytes = fs::read(path).map_err(|e| PersistError::io(path, e))?;
    let mut lines = Vec::new();
    for (ix, raw) in bytes.split(|&b| b == b'\n').enumerate() {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let text = std::str::from_utf8(raw).map_err(|_| PersistError::NonUtf8Line {
            path: path.to_path_buf(),
            line: u32::try_from(ix + 1).unwrap_or(u32::MAX),
        })?;
        lines.push(text.to_owned());
    }
    // drop the phantom line after a trailing newline
    if lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    Ok(lines)
}

fn read_utf8_text(path: &Path) -> Result<String, PersistError> {
    Ok(read_utf8_lines(path)?.join("\n"))
}

/// Drops `//`- and `#`-prefixed comment lines so the remainder is plain
/// JSON. The persisted files are line-oriented; no JSON line ever begins
/// with either marker.
fn strip_comment_lines(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !(trimmed.starts_with("//") || trimmed.starts_with('#'))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_space_id_is_well_formed() {
        let oid = initial_space_id();
        assert_eq!(oid.to_string(), INITIAL_SPACE_ID);
    }

    #[test]
    fn space_file_paths_embed_the_id() {
        let spacid = initial_space_id();
        assert_eq!(
            space_file_path(spacid),
            format!("persistore/sp{INITIAL_SPACE_ID}-rps.json")
        );
    }

    #[test]
    fn comment_stripping_keeps_json() {
        let text = "//// header\n{\n \"a\": 1\n}\n# trailing";
        assert_eq!(strip_comment_lines(text), "{\n \"a\": 1\n}");
    }
}
