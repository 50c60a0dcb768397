//! Round-trip laws: a dumped heap reloads into an equal registry, and
//! re-dumping a freshly loaded registry reproduces the same files.

use std::{fs, path::PathBuf};

use mnemos::{
    dump_into, initial_space_id, load_from, space_file_path, ClassInfoPayload, DumpParams, Hardwired, LoadParams,
    MetaData, ObjSet, ObjectRef, Oid, Payload, Registry, SetObPayload, SpacePayload, SymbolPayload, Value,
    VectObPayload, VectValPayload,
};
use pretty_assertions::assert_eq;

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mnemos_rt_{name}_{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

fn oid(n: u64) -> Oid {
    Oid::from_parts(n, 1).expect("nonzero halves")
}

fn load_params(roots: &[Oid]) -> LoadParams {
    LoadParams {
        hardwired: Hardwired {
            roots: roots.to_vec(),
            ..Hardwired::default()
        },
        ..LoadParams::default()
    }
}

/// A registry with the initial space, one metacircular class, one named
/// attribute object, and one root object carrying `attr -> 42` and a
/// string component.
fn build_small_heap() -> (Registry, Oid, Oid, Oid) {
    let space = initial_space_id();
    let class_c = oid(10);
    let attr_a = oid(20);
    let obj_o = oid(30);
    let mut registry = Registry::new();
    for id in [space, class_c, attr_a, obj_o] {
        assert!(registry.insert_new(id));
    }
    let sref = ObjectRef::from_oid(space);
    let cref = ObjectRef::from_oid(class_c);
    {
        let object = registry.get_mut(space).unwrap();
        object.loader_set_class(cref);
        object.loader_set_space(sref);
        object.loader_set_mtime(1000.0);
        object.install_payload(Payload::Space(SpacePayload)).unwrap();
    }
    {
        let object = registry.get_mut(class_c).unwrap();
        object.loader_set_class(cref);
        object.loader_set_space(sref);
        object.loader_set_mtime(1001.0);
    }
    {
        let object = registry.get_mut(attr_a).unwrap();
        object.loader_set_class(cref);
        object.loader_set_space(sref);
        object.loader_set_mtime(1002.0);
    }
    {
        let object = registry.get_mut(obj_o).unwrap();
        object.loader_set_class(cref);
        object.loader_set_space(sref);
        object.loader_set_mtime(1003.0);
        object.loader_put_attr(attr_a, Value::Int(42));
        object.loader_add_comp(Value::string("true-string"));
    }
    registry.add_root(obj_o);
    (registry, class_c, attr_a, obj_o)
}

// =============================================================================
// 1. Single-object round-trip
// =============================================================================

/// Dumping one root object with a class, an attribute and a component,
/// then reloading, preserves identity, rootness, attributes and
/// components.
#[test]
fn single_object_round_trip() {
    let dir = scratch("single");
    let (mut registry, class_c, attr_a, obj_o) = build_small_heap();
    dump_into(&mut registry, &dir, &DumpParams::default()).expect("dump should succeed");

    let outcome = load_from(&dir, load_params(&[obj_o])).expect("load should succeed");
    let loaded = outcome.registry;
    assert!(loaded.is_root(obj_o));
    assert_eq!(loaded.find_by_id(obj_o), Some(ObjectRef::from_oid(obj_o)));
    let object = loaded.get(obj_o).unwrap();
    assert_eq!(object.class(), ObjectRef::from_oid(class_c));
    assert_eq!(object.get_attr(attr_a), Some(&Value::Int(42)));
    assert_eq!(object.comps(), &[Value::string("true-string")]);
    assert!((object.mtime() - 1003.0).abs() < f64::EPSILON);
}

/// The class-of-classes points at itself after reload.
#[test]
fn metacircular_class_survives() {
    let dir = scratch("metacircular");
    let (mut registry, class_c, _, obj_o) = build_small_heap();
    dump_into(&mut registry, &dir, &DumpParams::default()).expect("dump should succeed");

    let loaded = load_from(&dir, load_params(&[obj_o])).expect("load should succeed").registry;
    let class = loaded.get(class_c).unwrap();
    assert_eq!(class.class(), ObjectRef::from_oid(class_c));
}

// =============================================================================
// 2. Value shapes survive round-trip
// =============================================================================

/// A set built from unsorted, duplicated ids reloads in strict ascending
/// id order without duplicates.
#[test]
fn set_ordering_round_trip() {
    let dir = scratch("setorder");
    let (mut registry, _, attr_a, obj_o) = build_small_heap();
    let (id1, id2, id3) = (oid(10), oid(20), oid(30));
    registry
        .get_mut(obj_o)
        .unwrap()
        .loader_put_attr(attr_a, Value::set(vec![id2, id1, id3, id1]));
    dump_into(&mut registry, &dir, &DumpParams::default()).expect("dump should succeed");

    let loaded = load_from(&dir, load_params(&[obj_o])).expect("load should succeed").registry;
    let object = loaded.get(obj_o).unwrap();
    let set = object.get_attr(attr_a).unwrap().as_set().unwrap();
    assert_eq!(set.elems(), &[id1, id2, id3]);
}

/// Doubles, id-shaped strings, tuples, embedded JSON and empty values all
/// reload equal to what was dumped.
#[test]
fn scalar_and_composite_values_round_trip() {
    let dir = scratch("values");
    let (mut registry, class_c, attr_a, obj_o) = build_small_heap();
    let id_shaped = oid(77).to_string();
    {
        let object = registry.get_mut(obj_o).unwrap();
        object.loader_add_comp(Value::Double(2.5));
        object.loader_add_comp(Value::string(id_shaped.as_str()));
        object.loader_add_comp(Value::tuple(vec![
            ObjectRef::from_oid(class_c),
            ObjectRef::from_oid(class_c),
        ]));
        object.loader_add_comp(Value::json(serde_json::json!({"k": [1, 2, {"n": null}]})));
        object.loader_add_comp(Value::Empty);
        object.loader_put_attr(attr_a, Value::Int(-7));
    }
    dump_into(&mut registry, &dir, &DumpParams::default()).expect("dump should succeed");

    let loaded = load_from(&dir, load_params(&[obj_o])).expect("load should succeed").registry;
    let comps = loaded.get(obj_o).unwrap().comps();
    assert_eq!(comps[0], Value::string("true-string"));
    assert_eq!(comps[1], Value::Double(2.5));
    // an id-shaped string must come back as a string, not a reference
    assert_eq!(comps[2], Value::string(id_shaped.as_str()));
    let tuple = comps[3].as_tuple().unwrap();
    assert_eq!(tuple.comps(), &[ObjectRef::from_oid(class_c), ObjectRef::from_oid(class_c)]);
    assert_eq!(comps[4], Value::json(serde_json::json!({"k": [1, 2, {"n": null}]})));
    assert_eq!(comps[5], Value::Empty);
}

/// Closures keep their connective, environment and metadata.
#[test]
fn closure_round_trip_with_metadata() {
    let dir = scratch("closure");
    let (mut registry, class_c, attr_a, obj_o) = build_small_heap();
    let meta = MetaData {
        object: class_c,
        rank: -3,
    };
    let closure = Value::closure(obj_o, [Value::Int(1), Value::string("env")], Some(meta));
    registry.get_mut(obj_o).unwrap().loader_put_attr(attr_a, closure.clone());
    dump_into(&mut registry, &dir, &DumpParams::default()).expect("dump should succeed");

    let loaded = load_from(&dir, load_params(&[obj_o])).expect("load should succeed").registry;
    let reloaded = loaded.get(obj_o).unwrap().get_attr(attr_a).unwrap();
    assert_eq!(reloaded, &closure);
    assert!(!reloaded.as_closure().unwrap().is_meta_transient());
}

/// Instances keep class, attribute rows and components; the class's
/// declared attribute set admits them.
#[test]
fn instance_round_trip() {
    let dir = scratch("instance");
    let (mut registry, class_c, attr_a, obj_o) = build_small_heap();
    {
        let mut info = ClassInfoPayload::new(ObjectRef::from_oid(class_c));
        info.put_attrset(std::sync::Arc::new(ObjSet::from_ids(vec![attr_a])));
        registry
            .get_mut(class_c)
            .unwrap()
            .install_payload(Payload::ClassInfo(info))
            .unwrap();
    }
    let instance = Value::instance(
        class_c,
        None,
        vec![(attr_a, Value::Int(5))],
        vec![Value::string("tail")],
    );
    registry.get_mut(obj_o).unwrap().loader_put_attr(attr_a, instance.clone());
    dump_into(&mut registry, &dir, &DumpParams::default()).expect("dump should succeed");

    let loaded = load_from(&dir, load_params(&[obj_o])).expect("load should succeed").registry;
    let reloaded = loaded.get(obj_o).unwrap().get_attr(attr_a).unwrap();
    assert_eq!(reloaded, &instance);
}

// =============================================================================
// 3. Payload round-trips
// =============================================================================

/// Symbol payloads keep name, weakness and value, and re-register in the
/// global name table.
#[test]
fn symbol_payload_round_trip() {
    let dir = scratch("symbol");
    let (mut registry, _, _, obj_o) = build_small_heap();
    let sym_ob = oid(40);
    registry.insert_new(sym_ob);
    {
        let (cref, sref) = (registry.get(obj_o).unwrap().class(), registry.get(obj_o).unwrap().space());
        let object = registry.get_mut(sym_ob).unwrap();
        object.loader_set_class(cref);
        object.loader_set_space(sref);
        object.loader_set_mtime(1004.0);
        let mut symbol = SymbolPayload::new("the_answer", false).unwrap();
        symbol.put_value(Value::Int(42));
        object.install_payload(Payload::Symbol(symbol)).unwrap();
    }
    registry.add_root(sym_ob);
    dump_into(&mut registry, &dir, &DumpParams::default()).expect("dump should succeed");

    let loaded = load_from(&dir, load_params(&[obj_o, sym_ob]))
        .expect("load should succeed")
        .registry;
    assert_eq!(loaded.find_symbol("the_answer"), Some(ObjectRef::from_oid(sym_ob)));
    let symbol = loaded.get(sym_ob).unwrap().payload().unwrap().as_symbol().unwrap().clone();
    assert_eq!(symbol.name(), "the_answer");
    assert!(!symbol.is_weak());
    assert_eq!(symbol.value(), Some(&Value::Int(42)));
}

/// Classinfo payloads keep superclass, naming symbol, method dictionary
/// and attribute set.
#[test]
fn classinfo_payload_round_trip() {
    let dir = scratch("classinfo");
    let (mut registry, class_c, attr_a, obj_o) = build_small_heap();
    let selector = oid(50);
    registry.insert_new(selector);
    {
        let object = registry.get_mut(selector).unwrap();
        object.loader_set_class(ObjectRef::from_oid(class_c));
        object.loader_set_space(ObjectRef::from_oid(initial_space_id()));
        object.loader_set_mtime(1005.0);
    }
    let method = Value::closure(obj_o, [Value::Int(9)], None);
    {
        let mut info = ClassInfoPayload::new(ObjectRef::from_oid(class_c));
        info.put_method(selector, method.clone());
        info.put_attrset(std::sync::Arc::new(ObjSet::from_ids(vec![attr_a])));
        registry
            .get_mut(class_c)
            .unwrap()
            .install_payload(Payload::ClassInfo(info))
            .unwrap();
    }
    dump_into(&mut registry, &dir, &DumpParams::default()).expect("dump should succeed");

    let loaded = load_from(&dir, load_params(&[obj_o])).expect("load should succeed").registry;
    let class = loaded.get(class_c).unwrap();
    let info = class.payload().unwrap().as_classinfo().unwrap();
    assert_eq!(info.superclass(), ObjectRef::from_oid(class_c));
    assert_eq!(info.methods().get(&selector), Some(&method));
    assert_eq!(info.attrset().unwrap().elems(), &[attr_a]);
}

/// The mutable container payloads keep their contents and order.
#[test]
fn container_payloads_round_trip() {
    let dir = scratch("containers");
    let (mut registry, class_c, _, obj_o) = build_small_heap();
    let (set_ob, vect_ob, vals_ob) = (oid(60), oid(61), oid(62));
    for id in [set_ob, vect_ob, vals_ob] {
        registry.insert_new(id);
        let object = registry.get_mut(id).unwrap();
        object.loader_set_class(ObjectRef::from_oid(class_c));
        object.loader_set_space(ObjectRef::from_oid(initial_space_id()));
        object.loader_set_mtime(1006.0);
    }
    {
        let mut set = SetObPayload::new();
        set.add(obj_o);
        set.add(class_c);
        registry.get_mut(set_ob).unwrap().install_payload(Payload::SetOb(set)).unwrap();
    }
    {
        let mut vect = VectObPayload::new();
        vect.push(ObjectRef::from_oid(obj_o));
        vect.push(ObjectRef::NULL);
        vect.push(ObjectRef::from_oid(obj_o));
        registry
            .get_mut(vect_ob)
            .unwrap()
            .install_payload(Payload::VectOb(vect))
            .unwrap();
    }
    {
        let mut vals = VectValPayload::new();
        vals.push(Value::Int(1));
        vals.push(Value::string("two"));
        registry
            .get_mut(vals_ob)
            .unwrap()
            .install_payload(Payload::VectVal(vals))
            .unwrap();
    }
    for id in [set_ob, vect_ob, vals_ob] {
        registry.add_root(id);
    }
    dump_into(&mut registry, &dir, &DumpParams::default()).expect("dump should succeed");

    let loaded = load_from(&dir, load_params(&[obj_o, set_ob, vect_ob, vals_ob]))
        .expect("load should succeed")
        .registry;
    let set = loaded.get(set_ob).unwrap().payload().unwrap().as_setob().unwrap().clone();
    assert_eq!(set.iter().collect::<Vec<_>>(), vec![class_c, obj_o]);
    let vect = loaded.get(vect_ob).unwrap().payload().unwrap().as_vectob().unwrap().clone();
    assert_eq!(
        vect.elems(),
        &[ObjectRef::from_oid(obj_o), ObjectRef::NULL, ObjectRef::from_oid(obj_o)]
    );
    let vals = loaded.get(vals_ob).unwrap().payload().unwrap().as_vectval().unwrap().clone();
    assert_eq!(vals.comps(), &[Value::Int(1), Value::string("two")]);
}

// =============================================================================
// 4. Re-dump stability
// =============================================================================

/// Dumping, loading, and dumping again without mutation reproduces every
/// space file byte for byte, and the manifest up to its dump date.
#[test]
fn redump_is_stable() {
    let dir_a = scratch("stable_a");
    let dir_b = scratch("stable_b");
    let (mut registry, _, _, obj_o) = build_small_heap();
    dump_into(&mut registry, &dir_a, &DumpParams::default()).expect("first dump should succeed");

    let mut loaded = load_from(&dir_a, load_params(&[obj_o]))
        .expect("load should succeed")
        .registry;
    dump_into(&mut loaded, &dir_b, &DumpParams::default()).expect("second dump should succeed");

    let relpath = space_file_path(initial_space_id());
    let space_a = fs::read_to_string(dir_a.join(&relpath)).unwrap();
    let space_b = fs::read_to_string(dir_b.join(&relpath)).unwrap();
    assert_eq!(space_a, space_b);

    let strip_date = |text: String| -> serde_json::Value {
        let json: String = text
            .lines()
            .filter(|l| !l.trim_start().starts_with("//"))
            .collect::<Vec<_>>()
            .join("\n");
        let mut doc: serde_json::Value = serde_json::from_str(&json).unwrap();
        doc.as_object_mut().unwrap().remove("dumpdate");
        doc
    };
    let manifest_a = strip_date(fs::read_to_string(dir_a.join("rps_manifest.json")).unwrap());
    let manifest_b = strip_date(fs::read_to_string(dir_b.join("rps_manifest.json")).unwrap());
    assert_eq!(manifest_a, manifest_b);
}

/// Transient objects vanish from dumps; references to them degrade to
/// null with a warning.
#[test]
fn transient_objects_are_excluded() {
    let dir = scratch("transient");
    let (mut registry, class_c, attr_a, obj_o) = build_small_heap();
    let ghost = oid(90);
    registry.insert_new(ghost);
    {
        let object = registry.get_mut(ghost).unwrap();
        object.loader_set_class(ObjectRef::from_oid(class_c));
        // no space: transient
        object.loader_set_mtime(1010.0);
    }
    registry
        .get_mut(obj_o)
        .unwrap()
        .loader_put_attr(attr_a, Value::object(ghost));
    let outcome = dump_into(&mut registry, &dir, &DumpParams::default()).expect("dump should succeed");
    assert!(outcome.warnings.iter().any(|w| w.object == Some(ghost)));

    let loaded = load_from(&dir, load_params(&[obj_o])).expect("load should succeed").registry;
    assert!(loaded.find_by_id(ghost).is_none());
    let reloaded = loaded.get(obj_o).unwrap().get_attr(attr_a).unwrap();
    assert_eq!(reloaded, &Value::Empty);
}
