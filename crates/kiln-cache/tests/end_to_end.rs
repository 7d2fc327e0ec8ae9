use std::fs;

use kiln_cache::{
    CacheConfig, CacheError, CompilationCache, CompilationInputs, LocateOutcome, PopulateOutcome,
    ProjectIdentity,
};
use kiln_test_utils::{Access, AssemblyImage, MethodDefinition, ProjectFixture, TypeDefinition};
use pretty_assertions::assert_eq;

fn config(fixture: &ProjectFixture) -> CacheConfig {
    let mut config = CacheConfig::new(fixture.cache_dir());
    config.parallelism = Some(2);
    config
}

fn inputs(fixture: &ProjectFixture, extra: &[(&str, &str)]) -> CompilationInputs {
    let mut properties = vec![
        ("Sources", "Program.cs;Util.cs"),
        ("TargetType", "exe"),
        ("OutputAssembly", "obj/App.dll"),
        ("PdbFile", "obj/App.pdb"),
        ("Optimize", "true"),
    ];
    properties.extend_from_slice(extra);
    CompilationInputs {
        project: ProjectIdentity::new(fixture.path("App.csproj")),
        properties: properties
            .into_iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
        outputs: Vec::new(),
    }
}

/// Stands in for the compiler: the outputs depend on the sources.
fn compile(fixture: &ProjectFixture) {
    let source = [fixture.read("Program.cs"), fixture.read("Util.cs")].concat();
    let mut il = vec![0x00; source.len() % 64];
    il.push(0x2A);
    AssemblyImage::new("App")
        .with_type(
            TypeDefinition::class("App", "Program")
                .method(MethodDefinition::new("Main", Access::Public).as_static().body(il)),
        )
        .write_to(&fixture.path("obj/App.dll"))
        .expect("write assembly");
    fixture.write("obj/App.pdb", [b"pdb:".as_slice(), &source].concat());
}

fn project() -> ProjectFixture {
    let fixture = ProjectFixture::new("App");
    fixture.write("Program.cs", "class Program { static void Main() {} }");
    fixture.write("Util.cs", "static class Util {}");
    fixture
}

#[test]
fn second_build_is_served_from_the_cache() {
    let fixture = project();
    let cache = CompilationCache::new(config(&fixture)).unwrap();

    let first = cache.locate(&inputs(&fixture, &[])).unwrap();
    assert_eq!(first.outcome, LocateOutcome::CacheMiss);
    assert!(first.run_compilation());
    assert!(first.populate_needed());
    let first_key = first.cache_key.clone().expect("supported inputs have a key");

    compile(&fixture);
    let built_dll = fixture.read("obj/App.dll");
    let built_pdb = fixture.read("obj/App.pdb");
    assert_eq!(cache.populate(first.session).unwrap(), PopulateOutcome::Stored);

    fixture.remove("obj/App.dll");
    fixture.remove("obj/App.pdb");

    let second = cache.locate(&inputs(&fixture, &[])).unwrap();
    assert_eq!(second.outcome, LocateOutcome::CacheUsed);
    assert!(!second.run_compilation());
    assert_eq!(second.cache_key.as_ref(), Some(&first_key));
    assert_eq!(fixture.read("obj/App.dll"), built_dll);
    assert_eq!(fixture.read("obj/App.pdb"), built_pdb);
    assert_eq!(cache.populate(second.session).unwrap(), PopulateOutcome::Verified);

    assert_eq!(cache.results().entries().unwrap(), vec![first_key]);
}

#[test]
fn edits_miss_then_hit_again() {
    let fixture = project();
    let cache = CompilationCache::new(config(&fixture)).unwrap();

    let first = cache.locate(&inputs(&fixture, &[])).unwrap();
    compile(&fixture);
    cache.populate(first.session).unwrap();

    fixture.write("Program.cs", "class Program { static void Main() { Run(); } }");
    let edited = cache.locate(&inputs(&fixture, &[])).unwrap();
    assert_eq!(edited.outcome, LocateOutcome::CacheMiss);
    assert_ne!(edited.cache_key, first.cache_key);
    compile(&fixture);
    let rebuilt = fixture.read("obj/App.dll");
    assert_eq!(cache.populate(edited.session).unwrap(), PopulateOutcome::Stored);

    // A fresh instance only has the on-disk tiers to go on.
    let restarted = CompilationCache::new(config(&fixture)).unwrap();
    fixture.remove("obj/App.dll");
    let again = restarted.locate(&inputs(&fixture, &[])).unwrap();
    assert_eq!(again.outcome, LocateOutcome::CacheUsed);
    assert_eq!(again.cache_key, edited.cache_key);
    assert_eq!(fixture.read("obj/App.dll"), rebuilt);
    assert_eq!(cache.results().entries().unwrap().len(), 2);
}

fn recorded_references(fixture: &ProjectFixture) -> Vec<String> {
    fs::read_dir(fixture.cache_dir().join(".refcache"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn produced_assemblies_are_recorded_as_references() {
    let fixture = project();
    let cache = CompilationCache::new(config(&fixture)).unwrap();
    let located = cache.locate(&inputs(&fixture, &[])).unwrap();
    compile(&fixture);
    cache.populate(located.session).unwrap();

    let recorded = recorded_references(&fixture);
    assert_eq!(recorded.len(), 1, "{recorded:?}");
    assert!(recorded[0].starts_with("App_") && recorded[0].ends_with(".json"));
}

#[test]
fn unsupported_settings_bypass_the_cache() {
    let fixture = project();
    let cache = CompilationCache::new(config(&fixture)).unwrap();

    let located = cache.locate(&inputs(&fixture, &[("ErrorLog", "errors.sarif")])).unwrap();
    assert_eq!(located.outcome, LocateOutcome::CacheNotSupported);
    assert_eq!(located.cache_key, None);
    assert!(located.run_compilation());
    assert!(!located.populate_needed());
    assert!(located.unsupported_reasons[0].contains("ErrorLog"));

    compile(&fixture);
    assert_eq!(cache.populate(located.session).unwrap(), PopulateOutcome::NotApplicable);
    assert!(cache.results().entries().unwrap().is_empty());
}

#[test]
fn unknown_properties_fail_the_call() {
    let fixture = project();
    let cache = CompilationCache::new(config(&fixture)).unwrap();
    let err = cache.locate(&inputs(&fixture, &[("Telepathy", "on")])).unwrap_err();
    assert!(matches!(err, CacheError::UnknownProperty { .. }), "{err}");
}

#[test]
fn inputs_changed_during_compilation_are_not_cached() {
    let fixture = project();
    let cache = CompilationCache::new(config(&fixture)).unwrap();

    let located = cache.locate(&inputs(&fixture, &[])).unwrap();
    fixture.write("Util.cs", "static class Util { static int X; }");
    compile(&fixture);
    assert_eq!(
        cache.populate(located.session).unwrap(),
        PopulateOutcome::SkippedInputsChanged
    );
    assert!(cache.results().entries().unwrap().is_empty());

    let recorded = recorded_references(&fixture);
    assert_eq!(recorded.len(), 1, "{recorded:?}");
    assert!(recorded[0].starts_with("App_"));
}

#[test]
fn inputs_changed_after_a_hit_are_fatal() {
    let fixture = project();
    let cache = CompilationCache::new(config(&fixture)).unwrap();
    let first = cache.locate(&inputs(&fixture, &[])).unwrap();
    compile(&fixture);
    cache.populate(first.session).unwrap();

    let hit = cache.locate(&inputs(&fixture, &[])).unwrap();
    assert_eq!(hit.outcome, LocateOutcome::CacheUsed);
    fixture.write("Util.cs", "static class Util { static int Y; }");

    let err = cache.populate(hit.session).unwrap_err();
    assert!(matches!(err, CacheError::InputsChangedAfterHit { .. }), "{err}");
}

#[test]
fn verify_only_always_compiles_and_populates() {
    let fixture = project();
    let mut config = config(&fixture);
    config.verify_only = true;
    let cache = CompilationCache::new(config).unwrap();

    let first = cache.locate(&inputs(&fixture, &[])).unwrap();
    assert_eq!(first.outcome, LocateOutcome::OnlyPopulateCache);
    assert!(first.run_compilation());
    compile(&fixture);
    assert_eq!(cache.populate(first.session).unwrap(), PopulateOutcome::Stored);

    let second = cache.locate(&inputs(&fixture, &[])).unwrap();
    assert_eq!(second.outcome, LocateOutcome::OnlyPopulateCache);
    compile(&fixture);
    assert_eq!(cache.populate(second.session).unwrap(), PopulateOutcome::AlreadyCached);
}

#[test]
fn malformed_references_fail_the_call() {
    let fixture = project();
    fixture.write("lib/Broken.dll", "MZ but nothing else of a PE image");
    let cache = CompilationCache::new(config(&fixture)).unwrap();

    let err = cache
        .locate(&inputs(&fixture, &[("References", "lib/Broken.dll")]))
        .unwrap_err();
    match err {
        CacheError::MalformedAssembly { path, .. } => {
            assert_eq!(path, fixture.path("lib/Broken.dll"))
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn corrupt_entries_are_not_treated_as_misses() {
    let fixture = project();
    let cache = CompilationCache::new(config(&fixture)).unwrap();
    let first = cache.locate(&inputs(&fixture, &[])).unwrap();
    let key = first.cache_key.clone().unwrap();
    compile(&fixture);
    cache.populate(first.session).unwrap();

    let dir = cache.results().entry_dir(&key);
    fs::write(dir.join("stray.zip"), b"second bundle").unwrap();

    let err = cache.locate(&inputs(&fixture, &[])).unwrap_err();
    assert!(matches!(err, CacheError::Corruption { .. }), "{err}");
}
