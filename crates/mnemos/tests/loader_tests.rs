//! Loader scenarios over hand-written heap directories: framing, error
//! model, native-symbol binding, payload dispatch and deferred work.

use std::{fs, path::Path, path::PathBuf};

use mnemos::{
    initial_space_id, load_from, space_file_path, Hardwired, LoadParams, MapSymbols, ObjectRef, Oid, PayloadHooks,
    PayloadKinds, PersistError, Registry, SymbolAddr, Value, APPLYING_FN_PREFIX, GETTER_FN_PREFIX, MANIFEST_FILE,
    MANIFEST_FORMAT,
};

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mnemos_ld_{name}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(dir.join("persistore")).expect("create scratch dir");
    dir
}

fn oid(n: u64) -> Oid {
    Oid::from_parts(n, 1).expect("nonzero halves")
}

fn write_manifest(dir: &Path, spaces: &[Oid], roots: &[Oid]) {
    let doc = serde_json::json!({
        "format": MANIFEST_FORMAT,
        "rpsmajorversion": 0,
        "rpsminorversion": 2,
        "spaceset": spaces.iter().map(Oid::to_string).collect::<Vec<_>>(),
        "globalroots": roots.iter().map(Oid::to_string).collect::<Vec<_>>(),
        "plugins": [],
    });
    let text = format!("//!! test manifest\n{}\n", serde_json::to_string_pretty(&doc).unwrap());
    fs::write(dir.join(MANIFEST_FILE), text).expect("write manifest");
}

fn space_header(spacid: Oid, nbobjects: usize) -> String {
    let prologue = serde_json::json!({
        "format": MANIFEST_FORMAT,
        "spaceid": spacid.to_string(),
        "nbobjects": nbobjects,
        "rpsmajorversion": 0,
        "rpsminorversion": 2,
    });
    format!(
        "//// test space file\n\n///!!! prologue:\n{}\n",
        serde_json::to_string_pretty(&prologue).unwrap()
    )
}

fn object_block(oid: Oid, body: &serde_json::Value) -> String {
    format!(
        "\n\n//+ob{oid}\n{}\n//-ob{oid}\n",
        serde_json::to_string_pretty(body).unwrap()
    )
}

/// The body every fixture object shares: self-classed, stamped in the
/// past.
fn plain_body(id: Oid, class: Oid) -> serde_json::Value {
    serde_json::json!({
        "oid": id.to_string(),
        "class": class.to_string(),
        "mtime": 1000.0,
    })
}

/// A space-object body carrying the `space` payload.
fn space_body(spacid: Oid, class: Oid) -> serde_json::Value {
    serde_json::json!({
        "oid": spacid.to_string(),
        "class": class.to_string(),
        "mtime": 1000.0,
        "payload": "space",
    })
}

fn write_space(dir: &Path, spacid: Oid, blocks: &[String]) {
    let mut text = space_header(spacid, blocks.len());
    for block in blocks {
        text.push_str(block);
    }
    text.push_str("\n//// end of test space file\n");
    fs::write(dir.join(space_file_path(spacid)), text).expect("write space file");
}

fn params_with_roots(roots: &[Oid]) -> LoadParams {
    LoadParams {
        hardwired: Hardwired {
            roots: roots.to_vec(),
            ..Hardwired::default()
        },
        ..LoadParams::default()
    }
}

// =============================================================================
// 1. Framing and manifests
// =============================================================================

/// A manifest naming one space whose file holds only a prologue loads into
/// an empty registry when no root slots are hardwired.
#[test]
fn empty_space_loads() {
    let dir = scratch("empty");
    let spacid = initial_space_id();
    write_manifest(&dir, &[spacid], &[]);
    write_space(&dir, spacid, &[]);
    let outcome = load_from(&dir, LoadParams::default()).expect("empty space should load");
    assert_eq!(outcome.loaded_objects, 0);
    assert_eq!(outcome.registry.n_roots(), 0);
}

/// The same empty heap fails with a root-count mismatch when the program
/// hardwires root slots.
#[test]
fn empty_space_with_hardwired_roots_fails() {
    let dir = scratch("empty_roots");
    let spacid = initial_space_id();
    write_manifest(&dir, &[spacid], &[]);
    write_space(&dir, spacid, &[]);
    let err = load_from(&dir, params_with_roots(&[oid(5)])).unwrap_err();
    assert!(matches!(err, PersistError::RootCountMismatch { expected: 1, .. }));
}

/// A manifest with an unknown format tag is rejected.
#[test]
fn unknown_manifest_format_is_rejected() {
    let dir = scratch("badformat");
    let doc = serde_json::json!({
        "format": "SomethingElse2031Z",
        "spaceset": [],
        "globalroots": [],
    });
    fs::write(dir.join(MANIFEST_FILE), serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    let err = load_from(&dir, LoadParams::default()).unwrap_err();
    assert!(matches!(err, PersistError::FormatVersionRejected { .. }));
}

/// A missing manifest surfaces as an I/O error naming the path.
#[test]
fn missing_manifest_is_io_error() {
    let dir = scratch("nomanifest");
    let err = load_from(&dir, LoadParams::default()).unwrap_err();
    assert!(matches!(err, PersistError::Io { .. }));
}

/// A prologue naming a different space than its file is fatal.
#[test]
fn prologue_space_mismatch_is_fatal() {
    let dir = scratch("prologue");
    let spacid = initial_space_id();
    write_manifest(&dir, &[spacid], &[]);
    let mut text = space_header(oid(999), 1);
    text.push_str(&object_block(oid(1), &plain_body(oid(1), oid(1))));
    fs::write(dir.join(space_file_path(spacid)), text).unwrap();
    let err = load_from(&dir, LoadParams::default()).unwrap_err();
    assert!(matches!(err, PersistError::BadPrologue { .. }));
}

/// Version skew between dumper and loader is a warning, not a failure.
#[test]
fn version_skew_warns() {
    let dir = scratch("skew");
    let spacid = initial_space_id();
    let doc = serde_json::json!({
        "format": MANIFEST_FORMAT,
        "rpsmajorversion": 9,
        "rpsminorversion": 9,
        "spaceset": [spacid.to_string()],
        "globalroots": [],
        "plugins": [],
    });
    fs::write(dir.join(MANIFEST_FILE), serde_json::to_string_pretty(&doc).unwrap()).unwrap();
    write_space(&dir, spacid, &[]);
    let outcome = load_from(&dir, LoadParams::default()).expect("skewed heap should still load");
    assert!(outcome.warnings.iter().any(|w| w.message.contains("dumped by version")));
}

/// A per-user manifest may add roots beyond the global manifest.
#[test]
fn user_manifest_adds_roots() {
    let dir = scratch("usermanifest");
    let spacid = initial_space_id();
    let x = oid(7);
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(x, &plain_body(x, x)),
            object_block(spacid, &space_body(spacid, x)),
        ],
    );
    let user = serde_json::json!({
        "format": MANIFEST_FORMAT,
        "user_roots": [x.to_string()],
        "user_plugins": [],
    });
    let user_path = dir.join("user_manifest.json");
    fs::write(&user_path, serde_json::to_string_pretty(&user).unwrap()).unwrap();
    let params = LoadParams {
        user_manifest: Some(user_path),
        ..params_with_roots(&[x])
    };
    let outcome = load_from(&dir, params).expect("user manifest should load");
    assert!(outcome.registry.is_root(x));
}

// =============================================================================
// 2. First-pass errors
// =============================================================================

/// The same id twice in one space file is a fatal duplicate naming the
/// offending line.
#[test]
fn duplicate_id_is_fatal() {
    let dir = scratch("duplicate");
    let spacid = initial_space_id();
    let x = oid(3);
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(spacid, &space_body(spacid, x)),
            object_block(x, &plain_body(x, x)),
            object_block(x, &plain_body(x, x)),
        ],
    );
    let err = load_from(&dir, LoadParams::default()).unwrap_err();
    match err {
        PersistError::DuplicateObject { oid: dup, line, .. } => {
            assert_eq!(dup, x);
            assert!(line > 0);
        }
        other => panic!("expected DuplicateObject, got {other}"),
    }
}

/// A declared object count that disagrees with the markers is fatal.
#[test]
fn object_count_mismatch_is_fatal() {
    let dir = scratch("count");
    let spacid = initial_space_id();
    let x = oid(3);
    let mut text = space_header(spacid, 5);
    text.push_str(&object_block(spacid, &space_body(spacid, x)));
    text.push_str(&object_block(x, &plain_body(x, x)));
    write_manifest(&dir, &[spacid], &[]);
    fs::write(dir.join(space_file_path(spacid)), text).unwrap();
    let err = load_from(&dir, LoadParams::default()).unwrap_err();
    assert!(matches!(
        err,
        PersistError::ObjectCountMismatch { declared: 5, found: 2, .. }
    ));
}

/// Non-UTF-8 bytes in a space file are fatal with the line number.
#[test]
fn non_utf8_line_is_fatal() {
    let dir = scratch("utf8");
    let spacid = initial_space_id();
    write_manifest(&dir, &[spacid], &[]);
    let mut bytes = space_header(spacid, 0).into_bytes();
    bytes.extend_from_slice(b"\xff\xfe broken\n");
    fs::write(dir.join(space_file_path(spacid)), bytes).unwrap();
    let err = load_from(&dir, LoadParams::default()).unwrap_err();
    assert!(matches!(err, PersistError::NonUtf8Line { .. }));
}

// =============================================================================
// 3. Second-pass behavior
// =============================================================================

/// An object textually before its referent still resolves: the first pass
/// interned both before any body was read.
#[test]
fn forward_reference_resolves() {
    let dir = scratch("forward");
    let spacid = initial_space_id();
    let p = oid(100);
    let q = oid(200);
    let p_body = serde_json::json!({
        "oid": p.to_string(),
        "class": p.to_string(),
        "mtime": 1000.0,
        "attrs": [ { "at": q.to_string(), "va": q.to_string() } ],
    });
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(p, &p_body),
            object_block(q, &plain_body(q, q)),
            object_block(spacid, &space_body(spacid, p)),
        ],
    );
    let registry = load_from(&dir, LoadParams::default()).expect("forward reference should load").registry;
    let value = registry.get(p).unwrap().get_attr(q).unwrap();
    assert_eq!(value.as_object_ref().unwrap().oid(), Some(q));
}

/// An id referenced by a body but interned nowhere is fatal.
#[test]
fn dangling_reference_is_fatal() {
    let dir = scratch("dangling");
    let spacid = initial_space_id();
    let p = oid(100);
    let ghost = oid(4242);
    let p_body = serde_json::json!({
        "oid": p.to_string(),
        "class": p.to_string(),
        "mtime": 1000.0,
        "comps": [ ghost.to_string() ],
    });
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(p, &p_body),
            object_block(spacid, &space_body(spacid, p)),
        ],
    );
    let err = load_from(&dir, LoadParams::default()).unwrap_err();
    assert!(matches!(err, PersistError::UnresolvedId { oid: got, .. } if got == ghost));
}

/// A far-future mtime is clamped to load start plus grace, with a warning
/// naming the object.
#[test]
fn future_mtime_is_clamped() {
    let dir = scratch("mtime");
    let spacid = initial_space_id();
    let x = oid(3);
    let far_future = 4.0e12; // well past any plausible load clock
    let body = serde_json::json!({
        "oid": x.to_string(),
        "class": x.to_string(),
        "mtime": far_future,
    });
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(x, &body),
            object_block(spacid, &space_body(spacid, x)),
        ],
    );
    let outcome = load_from(&dir, LoadParams::default()).expect("future mtime should load");
    let loaded = outcome.registry.get(x).unwrap().mtime();
    assert!(loaded < far_future);
    assert!(loaded <= mnemos::wallclock_now() + 300.0);
    assert!(outcome.warnings.iter().any(|w| w.object == Some(x)));
}

/// An unrecognized value shape degrades to empty with a warning.
#[test]
fn unknown_value_shape_warns() {
    let dir = scratch("valueshape");
    let spacid = initial_space_id();
    let x = oid(3);
    let body = serde_json::json!({
        "oid": x.to_string(),
        "class": x.to_string(),
        "mtime": 1000.0,
        "comps": [ { "vtype": "frobnicator", "stuff": 1 } ],
    });
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(x, &body),
            object_block(spacid, &space_body(spacid, x)),
        ],
    );
    let outcome = load_from(&dir, LoadParams::default()).expect("unknown shape should load");
    assert_eq!(outcome.registry.get(x).unwrap().comps(), &[Value::Empty]);
    assert!(outcome.warnings.iter().any(|w| w.message.contains("frobnicator")));
}

// =============================================================================
// 4. Native-symbol binding
// =============================================================================

fn test_getter(_registry: &Registry, _owner: ObjectRef, _attr: ObjectRef) -> Value {
    Value::Int(7)
}

fn test_applying(_registry: &mut Registry, _receiver: ObjectRef, _args: &[Value]) -> Value {
    Value::Empty
}

fn test_loadrout(registry: &mut Registry, owner: ObjectRef, _body: &serde_json::Value) {
    if let Some(object) = owner.oid().and_then(|o| registry.get_mut(o)) {
        object.append_comp(Value::Int(99));
    }
}

/// `magicattr` and `applying` bind through the symbol table.
#[test]
fn magicattr_and_applying_bind() {
    let dir = scratch("native");
    let spacid = initial_space_id();
    let x = oid(3);
    let body = serde_json::json!({
        "oid": x.to_string(),
        "class": x.to_string(),
        "mtime": 1000.0,
        "magicattr": true,
        "applying": true,
    });
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(x, &body),
            object_block(spacid, &space_body(spacid, x)),
        ],
    );
    let mut symbols = MapSymbols::new();
    symbols.insert(format!("{GETTER_FN_PREFIX}{x}"), SymbolAddr::MagicGetter(test_getter));
    symbols.insert(format!("{APPLYING_FN_PREFIX}{x}"), SymbolAddr::Applying(test_applying));
    let params = LoadParams {
        symbols: Box::new(symbols),
        ..LoadParams::default()
    };
    let registry = load_from(&dir, params).expect("native bindings should load").registry;
    let object = registry.get(x).unwrap();
    assert!(object.magic_getter().is_some());
    assert!(object.applying_fn().is_some());
}

/// A `magicattr` whose getter symbol is missing is fatal.
#[test]
fn missing_magic_getter_is_fatal() {
    let dir = scratch("nomagic");
    let spacid = initial_space_id();
    let x = oid(3);
    let body = serde_json::json!({
        "oid": x.to_string(),
        "class": x.to_string(),
        "mtime": 1000.0,
        "magicattr": true,
    });
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(x, &body),
            object_block(spacid, &space_body(spacid, x)),
        ],
    );
    let err = load_from(&dir, LoadParams::default()).unwrap_err();
    assert!(matches!(err, PersistError::MissingDynamicSymbol { .. }));
}

/// A `loadrout` entry invokes the named routine with the object and its
/// body; a missing routine only warns.
#[test]
fn loadrout_runs_named_routine() {
    let dir = scratch("loadrout");
    let spacid = initial_space_id();
    let x = oid(3);
    let body = serde_json::json!({
        "oid": x.to_string(),
        "class": x.to_string(),
        "mtime": 1000.0,
        "loadrout": "finish_x",
    });
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(x, &body),
            object_block(spacid, &space_body(spacid, x)),
        ],
    );
    let mut symbols = MapSymbols::new();
    symbols.insert("finish_x", SymbolAddr::LoadRoutine(test_loadrout));
    let params = LoadParams {
        symbols: Box::new(symbols),
        ..LoadParams::default()
    };
    let registry = load_from(&dir, params).expect("loadrout should run").registry;
    assert_eq!(registry.get(x).unwrap().comps(), &[Value::Int(99)]);

    // same heap without the routine: a warning, not a failure
    let outcome = load_from(&dir, LoadParams::default()).expect("missing routine is non-fatal");
    assert!(outcome.warnings.iter().any(|w| w.message.contains("finish_x")));
}

/// Objects of the configured routine class get a best-effort applying
/// binding; a missing symbol only warns.
#[test]
fn routine_class_binds_applying() {
    let dir = scratch("routineclass");
    let spacid = initial_space_id();
    let routine_class = oid(11);
    let x = oid(33);
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(routine_class, &plain_body(routine_class, routine_class)),
            object_block(x, &plain_body(x, routine_class)),
            object_block(spacid, &space_body(spacid, routine_class)),
        ],
    );
    let mut symbols = MapSymbols::new();
    symbols.insert(format!("{APPLYING_FN_PREFIX}{x}"), SymbolAddr::Applying(test_applying));
    let params = LoadParams {
        hardwired: Hardwired {
            routine_class: Some(routine_class),
            ..Hardwired::default()
        },
        symbols: Box::new(symbols),
        ..LoadParams::default()
    };
    let registry = load_from(&dir, params).expect("routine class should load").registry;
    assert!(registry.get(x).unwrap().applying_fn().is_some());

    let params = LoadParams {
        hardwired: Hardwired {
            routine_class: Some(routine_class),
            ..Hardwired::default()
        },
        ..LoadParams::default()
    };
    let outcome = load_from(&dir, params).expect("missing routine symbol is non-fatal");
    assert!(outcome.warnings.iter().any(|w| w.message.contains("routine")));
}

// =============================================================================
// 5. Payload dispatch
// =============================================================================

/// An alphabetic payload token with no registered kind is fatal.
#[test]
fn unknown_payload_kind_is_fatal() {
    let dir = scratch("unknownpayload");
    let spacid = initial_space_id();
    let x = oid(3);
    let body = serde_json::json!({
        "oid": x.to_string(),
        "class": x.to_string(),
        "mtime": 1000.0,
        "payload": "frobnicator",
    });
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(x, &body),
            object_block(spacid, &space_body(spacid, x)),
        ],
    );
    let err = load_from(&dir, LoadParams::default()).unwrap_err();
    assert!(matches!(err, PersistError::MissingDynamicSymbol { .. }));
}

/// An id-shaped payload token is validated and then skipped with a
/// warning.
#[test]
fn id_shaped_payload_token_is_skipped() {
    let dir = scratch("idpayload");
    let spacid = initial_space_id();
    let x = oid(3);
    let body = serde_json::json!({
        "oid": x.to_string(),
        "class": x.to_string(),
        "mtime": 1000.0,
        "payload": oid(555).to_string(),
    });
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(x, &body),
            object_block(spacid, &space_body(spacid, x)),
        ],
    );
    let outcome = load_from(&dir, LoadParams::default()).expect("id payload token should load");
    assert!(outcome.registry.get(x).unwrap().payload().is_none());
    assert!(outcome.warnings.iter().any(|w| w.message.contains("payload token")));
}

fn tally_load(
    _resolver: &mut dyn mnemos::LoadResolver,
    _owner: Oid,
    body: &serde_json::Value,
) -> Result<Box<dyn std::any::Any + Send + Sync>, PersistError> {
    let count = body.get("tally_count").and_then(serde_json::Value::as_i64).unwrap_or(0);
    Ok(Box::new(count))
}

fn tally_scan(_state: &(dyn std::any::Any + Send + Sync), _visit: &mut dyn FnMut(Oid)) {}

fn tally_dump(
    state: &(dyn std::any::Any + Send + Sync),
    _ctx: &mut dyn mnemos::DumpCtx,
    body: &mut serde_json::Map<String, serde_json::Value>,
) {
    let count = state.downcast_ref::<i64>().copied().unwrap_or(0);
    body.insert("tally_count".to_owned(), serde_json::Value::from(count));
}

/// A registered extension payload kind deserializes through its hooks.
#[test]
fn registered_extension_payload_loads() {
    let dir = scratch("extension");
    let spacid = initial_space_id();
    let x = oid(3);
    let body = serde_json::json!({
        "oid": x.to_string(),
        "class": x.to_string(),
        "mtime": 1000.0,
        "payload": "tally",
        "tally_count": 5,
    });
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(x, &body),
            object_block(spacid, &space_body(spacid, x)),
        ],
    );
    let mut kinds = PayloadKinds::new();
    assert!(kinds.register(
        "tally",
        PayloadHooks {
            load: tally_load,
            scan: tally_scan,
            dump: tally_dump,
        },
    ));
    let params = LoadParams {
        payload_kinds: kinds,
        ..LoadParams::default()
    };
    let registry = load_from(&dir, params).expect("extension payload should load").registry;
    let payload = registry.get(x).unwrap().payload().unwrap();
    let extension = payload.as_extension("tally").unwrap();
    assert_eq!(extension.state::<i64>(), Some(&5));
}

// =============================================================================
// 6. Deferred work
// =============================================================================

/// An instance whose class never materializes a classinfo keeps
/// re-enqueuing its validation until the loader declares overflow.
#[test]
fn stalled_instance_validation_overflows() {
    let dir = scratch("stalled");
    let spacid = initial_space_id();
    let class_c = oid(11);
    let attr_a = oid(22);
    let x = oid(33);
    let body = serde_json::json!({
        "oid": x.to_string(),
        "class": x.to_string(),
        "mtime": 1000.0,
        "comps": [ {
            "vtype": "instance",
            "class": class_c.to_string(),
            "isize": 1,
            "iattrs": [ { "iat": attr_a.to_string(), "iva": 1 } ],
            "icomps": [],
        } ],
    });
    write_manifest(&dir, &[spacid], &[]);
    write_space(
        &dir,
        spacid,
        &[
            object_block(class_c, &plain_body(class_c, class_c)),
            object_block(attr_a, &plain_body(attr_a, class_c)),
            object_block(x, &body),
            object_block(spacid, &space_body(spacid, class_c)),
        ],
    );
    let err = load_from(&dir, LoadParams::default()).unwrap_err();
    assert!(matches!(err, PersistError::DeferredOverflow { .. }));
}
