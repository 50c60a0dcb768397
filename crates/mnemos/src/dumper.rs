//! The mark-scan dumper: registry in, directory of text files out.
//!
//! Dumping runs in two phases. The scan phase seeds a queue with every
//! root, adds every constant discovered by scanning the host's source
//! files for the `rpskob` sentinel prefix, and drains the queue by letting
//! each reached object enumerate its outgoing references; transient
//! objects stop the traversal. The write phase partitions the reached
//! objects by space and emits one space file per non-empty space, the
//! three generated headers the host compiles in, and the manifest.
//!
//! Every output file is written under a per-run random temporary suffix
//! and renamed onto its final name only after the whole dump succeeded,
//! rotating prior finals to `~` backups. A failed dump leaves the
//! temporaries behind for postmortem inspection.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fs,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use ahash::AHashSet;
use indexmap::IndexSet;
use regex::Regex;
use serde_json::{Map as JsonMap, Value as Jv};

use crate::{
    error::{PersistError, Warning},
    loader::{space_file_path, MANIFEST_FILE, MANIFEST_FORMAT, OBJECT_BEGIN_MARKER, OBJECT_END_MARKER},
    object::{Object, ObjectRef},
    oid::{Oid, OID_NB_DIGITS},
    payload::{DumpCtx, Payload},
    registry::{Phase, Registry},
    value::Value,
};

/// Sentinel prefix marking a constant object id in host source code.
pub const CONSTANT_OB_PREFIX: &str = "rpskob";

static CONSTANT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("{CONSTANT_OB_PREFIX}(_[0-9A-Za-z]{{{OID_NB_DIGITS}}})")).expect("constant scan pattern")
});

/// Everything a dump needs besides the registry: the source files to scan
/// for constants and the program metadata stamped into the outputs.
#[derive(Debug, Clone)]
pub struct DumpParams {
    /// Source files scanned for `rpskob`-prefixed ids. Files under a
    /// `generated/` or `attic/` directory are skipped.
    pub source_files: Vec<PathBuf>,
    /// Major version stamped into prologues and the manifest.
    pub major_version: u32,
    /// Minor version stamped into prologues and the manifest.
    pub minor_version: u32,
    /// Program name stamped into the manifest.
    pub progname: String,
}

impl Default for DumpParams {
    fn default() -> Self {
        Self {
            source_files: Vec::new(),
            major_version: 0,
            minor_version: 2,
            progname: "mnemos".to_owned(),
        }
    }
}

/// A completed dump: counters plus the diagnostics collected on the way.
#[derive(Debug)]
pub struct DumpOutcome {
    /// Recoverable diagnostics (skipped transients, unknown constants).
    pub warnings: Vec<Warning>,
    /// Number of objects reached by the scan.
    pub scanned_objects: usize,
    /// Objects whose mtime postdates the load that built this registry.
    pub new_objects: usize,
    /// Number of space files written.
    pub spaces_written: usize,
    /// Number of constants discovered in source files.
    pub constants: usize,
}

/// Dumps the registry into `dir`, creating it and its `persistore/` and
/// `generated/` subdirectories as needed.
///
/// # Errors
/// I/O failures, duplicate output paths, and rename failures; on error the
/// temporary files are left in place.
pub fn dump_into(registry: &mut Registry, dir: impl AsRef<Path>, params: &DumpParams) -> Result<DumpOutcome, PersistError> {
    registry.enter_phase(Phase::Dumping);
    let result = run_dump(registry, dir.as_ref(), params);
    registry.leave_phase();
    result
}

fn run_dump(registry: &Registry, dir: &Path, params: &DumpParams) -> Result<DumpOutcome, PersistError> {
    for sub in ["persistore", "generated"] {
        let subdir = dir.join(sub);
        fs::create_dir_all(&subdir).map_err(|e| PersistError::io(subdir.clone(), e))?;
    }
    let mut dumper = Dumper::new(registry, dir.to_path_buf(), params);
    dumper.scan_roots();
    dumper.scan_source_files()?;
    dumper.scan_loop();
    dumper.write_all_space_files()?;
    dumper.write_generated_roots_file()?;
    dumper.write_generated_names_file()?;
    dumper.write_generated_constants_file()?;
    dumper.write_manifest_file()?;
    dumper.rename_opened_files()?;
    Ok(DumpOutcome {
        scanned_objects: dumper.scanned.len(),
        new_objects: dumper.new_obcount,
        spaces_written: dumper.spaces.len(),
        constants: dumper.constants.len(),
        warnings: dumper.warnings,
    })
}

struct Dumper<'a> {
    registry: &'a Registry,
    topdir: PathBuf,
    params: &'a DumpParams,
    temp_suffix: String,
    scanned: AHashSet<Oid>,
    queue: VecDeque<Oid>,
    spaces: BTreeMap<Oid, BTreeSet<Oid>>,
    constants: IndexSet<Oid>,
    opened: IndexSet<String>,
    new_obcount: usize,
    warnings: Vec<Warning>,
}

impl<'a> Dumper<'a> {
    fn new(registry: &'a Registry, topdir: PathBuf, params: &'a DumpParams) -> Self {
        let rid = Oid::random().to_string();
        let temp_suffix = format!("{}-p{}%", &rid[..7], std::process::id());
        Self {
            registry,
            topdir,
            params,
            temp_suffix,
            scanned: AHashSet::new(),
            queue: VecDeque::new(),
            spaces: BTreeMap::new(),
            constants: IndexSet::new(),
            opened: IndexSet::new(),
            new_obcount: 0,
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, warning: Warning) {
        self.warnings.push(warning);
    }

    // -- phase 1: scan -----------------------------------------------------

    fn scan_roots(&mut self) {
        let registry = self.registry;
        let mut roots = Vec::with_capacity(registry.n_roots());
        registry.each_root(|oid| roots.push(oid));
        for oid in roots {
            self.scan_object(oid);
        }
    }

    /// Enqueues an object unless it is unknown, transient, or already
    /// reached.
    fn scan_object(&mut self, oid: Oid) {
        if self.scanned.contains(&oid) {
            return;
        }
        let Some(object) = self.registry.get(oid) else { return };
        if object.is_transient() {
            return;
        }
        self.scanned.insert(oid);
        if object.mtime() > self.registry.load_start() {
            self.new_obcount += 1;
        }
        self.queue.push_back(oid);
    }

    fn scan_loop(&mut self) {
        while let Some(oid) = self.queue.pop_front() {
            self.scan_object_contents(oid);
        }
    }

    fn scan_object_contents(&mut self, oid: Oid) {
        let registry = self.registry;
        let Some(object) = registry.get(oid) else { return };
        if let Some(space) = object.space().oid() {
            self.spaces.entry(space).or_default().insert(oid);
            self.scan_object(space);
        }
        object.dump_scan(&mut |target| self.scan_object(target));
    }

    /// Scans one source file for `rpskob`-prefixed ids; every id naming a
    /// known object becomes a constant and a scan seed.
    fn scan_source_file(&mut self, path: &Path) -> Result<(), PersistError> {
        let bytes = fs::read(path).map_err(|e| PersistError::io(path, e))?;
        for (ix, raw) in bytes.split(|&b| b == b'\n').enumerate() {
            let lineno = u32::try_from(ix + 1).unwrap_or(u32::MAX);
            let Ok(line) = std::str::from_utf8(raw) else {
                self.warn(Warning::new("non UTF-8 line skipped by constant scan").at(path, lineno));
                continue;
            };
            for found in CONSTANT_RE.captures_iter(line) {
                let id_text = &found[1];
                let Ok(oid) = Oid::parse(id_text) else { continue };
                if self.registry.contains(oid) {
                    self.constants.insert(oid);
                    self.scan_object(oid);
                } else {
                    self.warn(
                        Warning::new(format!("unknown object {oid} named by source"))
                            .at(path, lineno)
                            .on_object(oid),
                    );
                }
            }
        }
        Ok(())
    }

    fn scan_source_files(&mut self) -> Result<(), PersistError> {
        let files: Vec<PathBuf> = self
            .params
            .source_files
            .iter()
            .filter(|path| {
                !path
                    .components()
                    .any(|c| c.as_os_str() == "generated" || c.as_os_str() == "attic")
            })
            .cloned()
            .collect();
        for path in files {
            self.scan_source_file(&path)?;
        }
        Ok(())
    }

    // -- dumpability -------------------------------------------------------

    fn dumpable_oid(&self, oid: Oid) -> bool {
        if self.scanned.contains(&oid) {
            return true;
        }
        self.registry.get(oid).is_some_and(|o| !o.is_transient())
    }

    fn dumpable_value(&self, value: &Value) -> bool {
        match value {
            Value::Empty | Value::Int(_) | Value::String(_) | Value::Set(_) | Value::Tuple(_) | Value::Json(_) => true,
            Value::Double(d) => d.is_finite(),
            Value::ObjectRef(r) => match r.oid() {
                Some(oid) => self.dumpable_oid(oid),
                None => true,
            },
            Value::Closure(c) => self.dumpable_oid(c.connective),
            Value::Instance(i) => self.dumpable_oid(i.class),
        }
    }

    // -- value emission ----------------------------------------------------

    fn emit_object_ref(&mut self, r: ObjectRef) -> Jv {
        let Some(oid) = r.oid() else { return Jv::Null };
        if self.dumpable_oid(oid) {
            Jv::String(oid.to_string())
        } else {
            self.warn(Warning::new("transient reference dropped from dump").on_object(oid));
            Jv::Null
        }
    }

    fn emit_value(&mut self, value: &Value) -> Jv {
        if !self.dumpable_value(value) {
            match value {
                // emit_object_ref records the warning with the id
                Value::ObjectRef(r) => return self.emit_object_ref(*r),
                Value::Closure(c) => {
                    self.warn(Warning::new("transient closure dropped from dump").on_object(c.connective));
                }
                Value::Instance(i) => {
                    self.warn(Warning::new("transient instance dropped from dump").on_object(i.class));
                }
                _ => self.warn(Warning::new("undumpable value dropped from dump")),
            }
            return Jv::Null;
        }
        match value {
            Value::Empty => Jv::Null,
            Value::Int(i) => Jv::from(*i),
            Value::Double(d) => Jv::from(*d),
            Value::String(s) => {
                if Oid::looks_like_id(s) {
                    // keep id-shaped strings from reloading as references
                    let mut wrapped = JsonMap::new();
                    wrapped.insert("string".to_owned(), Jv::String(s.to_string()));
                    Jv::Object(wrapped)
                } else {
                    Jv::String(s.to_string())
                }
            }
            Value::ObjectRef(r) => self.emit_object_ref(*r),
            Value::Set(set) => {
                let elems: Vec<Jv> = set
                    .elems()
                    .iter()
                    .filter(|oid| self.dumpable_oid(**oid))
                    .map(|oid| Jv::String(oid.to_string()))
                    .collect();
                let mut out = JsonMap::new();
                out.insert("vtype".to_owned(), Jv::String("set".to_owned()));
                out.insert("elem".to_owned(), Jv::Array(elems));
                Jv::Object(out)
            }
            Value::Tuple(tuple) => {
                let mut comps = Vec::with_capacity(tuple.len());
                for r in tuple.comps() {
                    match r.oid() {
                        Some(oid) if !self.dumpable_oid(oid) => {
                            self.warn(Warning::new("transient tuple component dropped from dump").on_object(oid));
                        }
                        _ => comps.push(self.emit_object_ref(*r)),
                    }
                }
                let mut out = JsonMap::new();
                out.insert("vtype".to_owned(), Jv::String("tuple".to_owned()));
                out.insert("comp".to_owned(), Jv::Array(comps));
                Jv::Object(out)
            }
            Value::Closure(closure) => {
                let mut out = JsonMap::new();
                out.insert("vtype".to_owned(), Jv::String("closure".to_owned()));
                out.insert("fn".to_owned(), Jv::String(closure.connective.to_string()));
                let env: Vec<Jv> = closure.env.iter().map(|v| self.emit_value(v)).collect();
                out.insert("env".to_owned(), Jv::Array(env));
                if let Some(meta) = closure.meta {
                    if self.dumpable_oid(meta.object) {
                        out.insert("metaobj".to_owned(), Jv::String(meta.object.to_string()));
                        out.insert("metarank".to_owned(), Jv::from(meta.rank));
                    }
                }
                Jv::Object(out)
            }
            Value::Instance(instance) => {
                let mut out = JsonMap::new();
                out.insert("vtype".to_owned(), Jv::String("instance".to_owned()));
                out.insert("class".to_owned(), Jv::String(instance.class.to_string()));
                out.insert("isize".to_owned(), Jv::from(instance.width()));
                let mut iattrs = Vec::with_capacity(instance.attrs().len());
                for (attr, attr_value) in instance.attrs() {
                    if !self.dumpable_oid(*attr) {
                        self.warn(Warning::new("transient instance attribute dropped from dump").on_object(*attr));
                        continue;
                    }
                    let mut entry = JsonMap::new();
                    entry.insert("iat".to_owned(), Jv::String(attr.to_string()));
                    entry.insert("iva".to_owned(), self.emit_value(attr_value));
                    iattrs.push(Jv::Object(entry));
                }
                out.insert("iattrs".to_owned(), Jv::Array(iattrs));
                let icomps: Vec<Jv> = instance.comps().iter().map(|v| self.emit_value(v)).collect();
                out.insert("icomps".to_owned(), Jv::Array(icomps));
                if let Some(meta) = instance.meta {
                    if self.dumpable_oid(meta.object) {
                        out.insert("metaobj".to_owned(), Jv::String(meta.object.to_string()));
                        out.insert("metarank".to_owned(), Jv::from(meta.rank));
                    }
                }
                Jv::Object(out)
            }
            Value::Json(doc) => {
                let mut out = JsonMap::new();
                out.insert("vtype".to_owned(), Jv::String("json".to_owned()));
                out.insert("json".to_owned(), doc.doc().clone());
                Jv::Object(out)
            }
        }
    }

    fn emit_object_body(&mut self, object: &Object) -> Jv {
        let mut body = JsonMap::new();
        body.insert("oid".to_owned(), Jv::String(object.oid().to_string()));
        body.insert("class".to_owned(), self.emit_object_ref(object.class()));
        body.insert("mtime".to_owned(), Jv::from(object.mtime()));
        if !object.comps().is_empty() {
            let comps: Vec<Jv> = object.comps().iter().map(|v| self.emit_value(v)).collect();
            body.insert("comps".to_owned(), Jv::Array(comps));
        }
        if object.n_attrs() > 0 {
            let mut rows = Vec::with_capacity(object.n_attrs());
            for (attr, value) in object.attrs() {
                if !self.dumpable_oid(attr) {
                    self.warn(Warning::new("transient attribute dropped from dump").on_object(attr));
                    continue;
                }
                let mut entry = JsonMap::new();
                entry.insert("at".to_owned(), Jv::String(attr.to_string()));
                entry.insert("va".to_owned(), self.emit_value(value));
                rows.push(Jv::Object(entry));
            }
            body.insert("attrs".to_owned(), Jv::Array(rows));
        }
        if object.magic_getter().is_some() {
            body.insert("magicattr".to_owned(), Jv::Bool(true));
        }
        if object.applying_fn().is_some() {
            body.insert("applying".to_owned(), Jv::Bool(true));
        }
        if let Some(payload) = object.payload() {
            // the payload emits its own fields through the DumpCtx services
            let mut staged = JsonMap::new();
            payload.dump_json_content(&mut StagedCtx { dumper: self }, &mut staged);
            for (key, jv) in staged {
                body.insert(key, jv);
            }
        }
        Jv::Object(body)
    }

    // -- phase 2: write ----------------------------------------------------

    fn write_output_file(&mut self, relpath: &str, content: &str) -> Result<(), PersistError> {
        if !self.opened.insert(relpath.to_owned()) {
            return Err(PersistError::io(
                self.topdir.join(relpath),
                std::io::Error::new(std::io::ErrorKind::AlreadyExists, "duplicate opened dump file"),
            ));
        }
        let temp = self.topdir.join(format!("{relpath}{}", self.temp_suffix));
        fs::write(&temp, content).map_err(|e| PersistError::io(temp.clone(), e))
    }

    fn generated_header(&self, relpath: &str) -> String {
        format!(
            "//: GENERATED file {relpath} / DO NOT EDIT\n\
             //: emitted by {} {}.{} when dumping the heap\n",
            self.params.progname, self.params.major_version, self.params.minor_version
        )
    }

    /// The symbol name attached to an object's class, for readability
    /// comments.
    fn class_symbol_name(&self, oid: Oid) -> Option<String> {
        let object = self.registry.get(oid)?;
        let class = self.registry.deref(object.class())?;
        let info = class.payload()?.as_classinfo()?;
        let symbol = self.registry.deref(info.symbol())?;
        Some(symbol.payload()?.as_symbol()?.name().to_owned())
    }

    /// An object's own display name: its symbol name, or its classinfo's
    /// symbol name.
    fn object_display_name(&self, oid: Oid) -> Option<String> {
        let object = self.registry.get(oid)?;
        match object.payload()? {
            Payload::Symbol(symbol) => Some(symbol.name().to_owned()),
            Payload::ClassInfo(info) => {
                let symbol = self.registry.deref(info.symbol())?;
                Some(symbol.payload()?.as_symbol()?.name().to_owned())
            }
            _ => None,
        }
    }

    fn write_space_file(&mut self, spacid: Oid) -> Result<(), PersistError> {
        let members: Vec<Oid> = self
            .spaces
            .get(&spacid)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        let relpath = space_file_path(spacid);
        let mut out = self.generated_header(&relpath);
        out.push('\n');
        out.push_str("///!!! prologue of space file:\n");
        let mut prologue = JsonMap::new();
        prologue.insert("format".to_owned(), Jv::String(MANIFEST_FORMAT.to_owned()));
        prologue.insert("spaceid".to_owned(), Jv::String(spacid.to_string()));
        prologue.insert("nbobjects".to_owned(), Jv::from(members.len()));
        prologue.insert("rpsmajorversion".to_owned(), Jv::from(self.params.major_version));
        prologue.insert("rpsminorversion".to_owned(), Jv::from(self.params.minor_version));
        out.push_str(&pretty_json(&Jv::Object(prologue)));
        out.push('\n');
        for oid in members {
            out.push_str("\n\n");
            out.push_str(OBJECT_BEGIN_MARKER);
            out.push_str(&oid.to_string());
            out.push('\n');
            if let Some(name) = self.class_symbol_name(oid) {
                out.push_str("//\u{2208}"); // ELEMENT OF
                out.push_str(&name);
                out.push('\n');
            }
            let body = {
                let registry = self.registry;
                let Some(object) = registry.get(oid) else { continue };
                self.emit_object_body(object)
            };
            out.push_str(&pretty_json(&body));
            out.push('\n');
            out.push_str(OBJECT_END_MARKER);
            out.push_str(&oid.to_string());
            out.push('\n');
        }
        out.push_str("\n\n");
        out.push_str(&format!("//// end of space file {relpath}\n"));
        self.write_output_file(&relpath, &out)
    }

    fn write_all_space_files(&mut self) -> Result<(), PersistError> {
        let space_ids: Vec<Oid> = self.spaces.keys().copied().collect();
        for spacid in space_ids {
            self.write_space_file(spacid)?;
        }
        Ok(())
    }

    fn write_generated_roots_file(&mut self) -> Result<(), PersistError> {
        let relpath = "generated/rps-roots.hh";
        let mut out = self.generated_header(relpath);
        out.push_str(
            "\n#ifndef RPS_INSTALL_ROOT_OB\n\
             #error RPS_INSTALL_ROOT_OB(Oid) macro undefined\n\
             #endif /*undefined RPS_INSTALL_ROOT_OB*/\n\n",
        );
        let mut roots = Vec::with_capacity(self.registry.n_roots());
        self.registry.each_root(|oid| roots.push(oid));
        let mut rootcnt = 0usize;
        for oid in roots {
            out.push_str(&format!("RPS_INSTALL_ROOT_OB({oid})"));
            let name = self.object_display_name(oid);
            let class = self.class_symbol_name(oid);
            match (name, class) {
                (Some(name), Some(class)) => out.push_str(&format!(" //{name}\u{2208}{class}")),
                (Some(name), None) => out.push_str(&format!(" //{name}")),
                (None, Some(class)) => out.push_str(&format!(" //\u{2208}{class}")),
                (None, None) => {}
            }
            out.push('\n');
            rootcnt += 1;
        }
        out.push_str(&format!(
            "\n#undef RPS_NB_ROOT_OB\n#define RPS_NB_ROOT_OB {rootcnt}\n\n#undef RPS_INSTALL_ROOT_OB\n\
             /// end of roots file {relpath}\n"
        ));
        self.write_output_file(relpath, &out)
    }

    fn write_generated_names_file(&mut self) -> Result<(), PersistError> {
        let relpath = "generated/rps-names.hh";
        let mut out = self.generated_header(relpath);
        out.push_str(
            "\n#ifndef RPS_INSTALL_NAMED_ROOT_OB\n\
             #error RPS_INSTALL_NAMED_ROOT_OB(Oid,Name) macro undefined\n\
             #endif /*undefined RPS_INSTALL_NAMED_ROOT_OB*/\n\n",
        );
        let mut namecnt = 0usize;
        let mut lines = Vec::new();
        self.registry.each_root(|oid| {
            let Some(object) = self.registry.get(oid) else { return };
            let Some(symbol) = object.payload().and_then(Payload::as_symbol) else {
                return;
            };
            if symbol.is_weak() {
                return;
            }
            lines.push(format!("RPS_INSTALL_NAMED_ROOT_OB({oid},{})\n", symbol.name()));
        });
        for line in lines {
            out.push_str(&line);
            namecnt += 1;
        }
        out.push_str(&format!(
            "\n#undef RPS_NB_NAMED_ROOT_OB\n#define RPS_NB_NAMED_ROOT_OB {namecnt}\n\n\
             #undef RPS_INSTALL_NAMED_ROOT_OB\n/// end of names file {relpath}\n"
        ));
        self.write_output_file(relpath, &out)
    }

    fn write_generated_constants_file(&mut self) -> Result<(), PersistError> {
        let relpath = "generated/rps-constants.hh";
        let mut out = self.generated_header(relpath);
        out.push_str(&format!(
            "\n/// collection of constant objects, mentioned in source files,\n\
             /// prefixed with '{CONSTANT_OB_PREFIX}' followed by an oid.\n\n\
             #ifndef RPS_INSTALL_CONSTANT_OB\n\
             #error RPS_INSTALL_CONSTANT_OB(Oid) macro undefined\n\
             #endif /*undefined RPS_INSTALL_CONSTANT_OB*/\n\n"
        ));
        let mut constcnt = 0usize;
        for oid in self.constants.iter() {
            if constcnt % 10 == 0 {
                out.push('\n');
            }
            out.push_str(&format!("RPS_INSTALL_CONSTANT_OB({oid})\n"));
            constcnt += 1;
        }
        out.push_str(&format!(
            "\n#undef RPS_INSTALL_CONSTANT_OB\n\n#undef RPS_NB_CONSTANT_OB\n\
             #define RPS_NB_CONSTANT_OB {constcnt}\n\n/// end of constants file {relpath}\n"
        ));
        self.write_output_file(relpath, &out)
    }

    fn write_manifest_file(&mut self) -> Result<(), PersistError> {
        let mut manifest = JsonMap::new();
        manifest.insert("format".to_owned(), Jv::String(MANIFEST_FORMAT.to_owned()));
        manifest.insert("rpsmajorversion".to_owned(), Jv::from(self.params.major_version));
        manifest.insert("rpsminorversion".to_owned(), Jv::from(self.params.minor_version));
        let spaceset: Vec<Jv> = self.spaces.keys().map(|oid| Jv::String(oid.to_string())).collect();
        manifest.insert("spaceset".to_owned(), Jv::Array(spaceset));
        let mut globalroots = Vec::with_capacity(self.registry.n_roots());
        self.registry
            .each_root(|oid| globalroots.push(Jv::String(oid.to_string())));
        manifest.insert("globalroots".to_owned(), Jv::Array(globalroots));
        let constset: Vec<Jv> = self.constants.iter().map(|oid| Jv::String(oid.to_string())).collect();
        manifest.insert("constset".to_owned(), Jv::Array(constset));
        let plugins: Vec<Jv> = self
            .registry
            .plugins()
            .iter()
            .map(|oid| Jv::String(oid.to_string()))
            .collect();
        manifest.insert("plugins".to_owned(), Jv::Array(plugins));
        let mut globalnames = Vec::new();
        self.registry.each_root(|oid| {
            let Some(object) = self.registry.get(oid) else { return };
            let Some(symbol) = object.payload().and_then(Payload::as_symbol) else {
                return;
            };
            if symbol.is_weak() {
                return;
            }
            let mut naming = JsonMap::new();
            naming.insert("nam".to_owned(), Jv::String(symbol.name().to_owned()));
            naming.insert("obj".to_owned(), Jv::String(oid.to_string()));
            globalnames.push(Jv::Object(naming));
        });
        manifest.insert("globalnames".to_owned(), Jv::Array(globalnames));
        let dumpdate = chrono::Utc::now().format("%Y %b %d").to_string();
        manifest.insert("dumpdate".to_owned(), Jv::String(dumpdate));
        manifest.insert("progname".to_owned(), Jv::String(self.params.progname.clone()));
        let mut out = format!("//!! manifest file {MANIFEST_FILE} / DO NOT EDIT\n");
        out.push_str(&pretty_json(&Jv::Object(manifest)));
        out.push_str("\n\n//// end of manifest file\n");
        self.write_output_file(MANIFEST_FILE, &out)
    }

    // -- atomic rename -----------------------------------------------------

    fn rename_opened_files(&mut self) -> Result<(), PersistError> {
        let opened: Vec<String> = self.opened.iter().cloned().collect();
        for relpath in opened {
            let current = self.topdir.join(&relpath);
            if current.exists() {
                let backup = sibling_with_suffix(&current, "~");
                if backup.exists() {
                    let older = sibling_with_suffix(&backup, "~");
                    let _ = fs::rename(&backup, &older);
                }
                if let Err(e) = fs::rename(&current, &backup) {
                    self.warn(Warning::new(format!(
                        "failed to rotate {} to backup: {e}",
                        current.display()
                    )));
                }
            }
            let temp = self.topdir.join(format!("{relpath}{}", self.temp_suffix));
            fs::rename(&temp, &current).map_err(|e| PersistError::RenameFailed {
                from: temp.clone(),
                to: current.clone(),
                source: e,
            })?;
        }
        self.opened.clear();
        Ok(())
    }
}

/// A thin adapter giving payload emission the dumper's services.
struct StagedCtx<'d, 'a> {
    dumper: &'d mut Dumper<'a>,
}

impl DumpCtx for StagedCtx<'_, '_> {
    fn is_dumpable_oid(&self, oid: Oid) -> bool {
        self.dumper.dumpable_oid(oid)
    }

    fn json_object_ref(&mut self, r: ObjectRef) -> Jv {
        self.dumper.emit_object_ref(r)
    }

    fn json_value(&mut self, v: &Value) -> Jv {
        self.dumper.emit_value(v)
    }
}

fn pretty_json(jv: &Jv) -> String {
    serde_json::to_string_pretty(jv).unwrap_or_else(|_| "null".to_owned())
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}
