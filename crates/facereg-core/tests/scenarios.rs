use facereg_core::{
    DescriptorStore, FaceRegistry, FileStorage, MemoryStorage, RegistryConfig, SqliteStorage,
    Storage, Verdict, DEFAULT_DESCRIPTOR_DIM, DEFAULT_STORAGE_KEY,
};

fn descriptor(seed: f32) -> Vec<f32> {
    (0..DEFAULT_DESCRIPTOR_DIM)
        .map(|i| ((i as f32 + 1.0) * seed).sin() * 0.1)
        .collect()
}

fn memory_registry() -> (MemoryStorage, FaceRegistry) {
    let storage = MemoryStorage::new();
    let registry = FaceRegistry::open(Box::new(storage.clone()), RegistryConfig::default()).unwrap();
    (storage, registry)
}

#[test]
fn register_alice_then_classify() {
    let (_, mut registry) = memory_registry();
    let a = descriptor(1.0);

    registry.register_face("Alice", a.clone()).unwrap();

    let sets = registry.store().as_slice();
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].label, "Alice");
    assert_eq!(sets[0].descriptors, vec![a.clone()]);
    assert_eq!(
        registry.classify(&a).unwrap(),
        Verdict::Match { label: "Alice".into(), distance: 0.0 }
    );
}

#[test]
fn re_registering_alice_appends() {
    let (_, mut registry) = memory_registry();
    let a = descriptor(1.0);
    let a2 = descriptor(1.01);

    registry.register_face("Alice", a.clone()).unwrap();
    let set = registry.register_face("Alice", a2.clone()).unwrap();

    assert_eq!(set.descriptors, vec![a, a2]);
    assert_eq!(registry.store().len(), 1);
}

#[test]
fn new_labels_keep_registration_order() {
    let (_, mut registry) = memory_registry();
    registry.register_face("Carol", descriptor(3.0)).unwrap();
    registry.register_face("Alice", descriptor(1.0)).unwrap();
    registry.register_face("Carol", descriptor(3.5)).unwrap();
    registry.register_face("Bob", descriptor(2.0)).unwrap();

    let labels: Vec<_> = registry.store().labels().collect();
    assert_eq!(labels, vec!["Carol", "Alice", "Bob"]);
}

#[test]
fn every_registered_descriptor_classifies_as_its_label() {
    let (_, mut registry) = memory_registry();
    let faces = [("Alice", 1.0), ("Bob", 2.0), ("Carol", 3.0), ("Alice", 1.7)];
    for (label, seed) in faces {
        registry.register_face(label, descriptor(seed)).unwrap();
        let verdict = registry.classify(&descriptor(seed)).unwrap();
        assert_eq!(verdict.label(), label);
        assert_eq!(verdict.distance(), 0.0);
    }
}

#[test]
fn malformed_storage_initializes_empty() {
    let storage = MemoryStorage::new();
    storage.set(DEFAULT_STORAGE_KEY, "not json at all").unwrap();

    let registry = FaceRegistry::open(Box::new(storage), RegistryConfig::default()).unwrap();

    assert!(registry.store().is_empty());
    assert_eq!(registry.classify(&descriptor(1.0)).unwrap(), Verdict::unknown());
}

#[test]
fn export_is_independent_of_later_clear() {
    let (_, mut registry) = memory_registry();
    registry.register_face("Alice", descriptor(1.0)).unwrap();
    registry.register_face("Bob", descriptor(2.0)).unwrap();

    let exported = registry.export_all().unwrap();
    registry.clear_all().unwrap();

    let value: serde_json::Value = serde_json::from_str(&exported).unwrap();
    let entries = value.as_array().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["label"], "Alice");
    assert_eq!(entries[1]["label"], "Bob");
    assert_eq!(entries[1]["descriptors"].as_array().unwrap().len(), 1);

    let reloaded = DescriptorStore::load(Some(&exported), DEFAULT_DESCRIPTOR_DIM).unwrap();
    assert_eq!(reloaded.find_by_label("Bob").unwrap().descriptors[0], descriptor(2.0));
    assert!(registry.store().is_empty());
}

#[test]
fn clear_twice_on_file_storage() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FileStorage::open(dir.path()).unwrap();
    let path = storage.path_for(DEFAULT_STORAGE_KEY);
    let mut registry = FaceRegistry::open(Box::new(storage), RegistryConfig::default()).unwrap();

    registry.register_face("Alice", descriptor(1.0)).unwrap();
    assert!(path.exists());

    registry.clear_all().unwrap();
    assert!(!path.exists());
    registry.clear_all().unwrap();
    assert!(registry.store().is_empty());
}

#[test]
fn sqlite_backed_registry_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("faces.db");

    {
        let storage = SqliteStorage::open(&db).unwrap();
        let mut registry = FaceRegistry::open(Box::new(storage), RegistryConfig::default()).unwrap();
        registry.register_face("Alice", descriptor(1.0)).unwrap();
        registry.register_face("Bob", descriptor(2.0)).unwrap();
    }

    let storage = SqliteStorage::open(&db).unwrap();
    let registry = FaceRegistry::open(Box::new(storage), RegistryConfig::default()).unwrap();
    assert_eq!(registry.store().labels().collect::<Vec<_>>(), vec!["Alice", "Bob"]);
    assert_eq!(registry.classify(&descriptor(2.0)).unwrap().label(), "Bob");
}

#[test]
fn equidistant_labels_resolve_to_first_registered() {
    let (_, mut registry) = memory_registry();
    let mut left = vec![0.0; DEFAULT_DESCRIPTOR_DIM];
    let mut right = vec![0.0; DEFAULT_DESCRIPTOR_DIM];
    left[0] = -0.25;
    right[0] = 0.25;

    registry.register_face("Right", right).unwrap();
    registry.register_face("Left", left).unwrap();

    let origin = vec![0.0; DEFAULT_DESCRIPTOR_DIM];
    for _ in 0..5 {
        let verdict = registry.classify(&origin).unwrap();
        assert_eq!(verdict.label(), "Right");
        assert_eq!(verdict.distance(), 0.25);
    }
}
