use std::fs;
use std::path::Path;
use std::time::SystemTime;

use kiln_cache::{
    write_bundle, Bundle, CacheError, CacheKey, DeclaredOutput, FullExtract, HashAlgorithm,
    InstallOutcome, PropertyExtract, ResultsCache, RetryPolicy, FULL_EXTRACT_FORMAT_VERSION,
};
use pretty_assertions::assert_eq;

fn extract() -> FullExtract {
    FullExtract {
        format_version: FULL_EXTRACT_FORMAT_VERSION,
        project: "Lib.csproj".into(),
        assembly_name: Some("Lib".into()),
        files: Vec::new(),
        references: Vec::new(),
        properties: vec![PropertyExtract {
            name: "TargetType".into(),
            value: "library".into(),
        }],
        outputs: Vec::new(),
    }
}

fn outputs(dir: &Path) -> Vec<DeclaredOutput> {
    fs::create_dir_all(dir).unwrap();
    fs::write(dir.join("Lib.dll"), b"MZ... assembly").unwrap();
    fs::write(dir.join("Lib.xml"), b"<doc/>").unwrap();
    vec![
        DeclaredOutput {
            name: "OutputAssembly".into(),
            path: dir.join("Lib.dll"),
            cache_file_name: "OutputAssembly.dll".into(),
        },
        DeclaredOutput {
            name: "DocumentationFile".into(),
            path: dir.join("Lib.xml"),
            cache_file_name: "DocumentationFile.xml".into(),
        },
    ]
}

struct Setup {
    _temp: tempfile::TempDir,
    cache: ResultsCache,
    key: CacheKey,
    bundle: std::path::PathBuf,
    outputs: Vec<DeclaredOutput>,
    root: std::path::PathBuf,
}

fn setup() -> Setup {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path().to_path_buf();
    let outputs = outputs(&root.join("obj"));
    let fingerprint = extract().fingerprint(HashAlgorithm::Xxh3).unwrap();
    let key = CacheKey::new("Lib.csproj", fingerprint);
    let staged = write_bundle(
        &root.join("staging"),
        &key.bundle_file_name(),
        HashAlgorithm::Xxh3,
        &extract(),
        &outputs,
    )
    .unwrap();
    Setup {
        cache: ResultsCache::new(root.join("cache"), RetryPolicy::default()),
        key,
        bundle: staged.path,
        outputs,
        root,
        _temp: temp,
    }
}

fn listing(dir: &Path) -> Vec<(String, Vec<u8>)> {
    let mut files: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let entry = entry.unwrap();
            (
                entry.file_name().to_string_lossy().into_owned(),
                fs::read(entry.path()).unwrap(),
            )
        })
        .collect();
    files.sort();
    files
}

#[test]
fn round_trip_restores_identical_files() {
    let setup = setup();
    assert_eq!(
        setup.cache.set(&setup.key, &extract(), &setup.bundle).unwrap(),
        InstallOutcome::Installed
    );
    assert!(setup.cache.exists(&setup.key).unwrap());

    let entry = setup.cache.get(&setup.key).unwrap().expect("committed entry");
    assert_eq!(
        entry.bundle_path,
        setup.cache.entry_dir(&setup.key).join(setup.key.bundle_file_name())
    );

    let restored_dir = setup.root.join("restored");
    let targets: Vec<DeclaredOutput> = setup
        .outputs
        .iter()
        .map(|output| DeclaredOutput {
            path: restored_dir.join(output.path.file_name().unwrap()),
            ..output.clone()
        })
        .collect();
    let mut bundle = Bundle::open(&entry.bundle_path, setup.key.to_string()).unwrap();
    bundle
        .restore(&targets, HashAlgorithm::Xxh3, SystemTime::now(), &RetryPolicy::default())
        .unwrap();

    for (original, restored) in setup.outputs.iter().zip(&targets) {
        assert_eq!(fs::read(&restored.path).unwrap(), fs::read(&original.path).unwrap());
    }
    let mut names = bundle.output_names();
    names.sort();
    assert_eq!(names, vec!["DocumentationFile.xml", "OutputAssembly.dll"]);
}

#[test]
fn second_set_is_a_no_op() {
    let setup = setup();
    setup.cache.set(&setup.key, &extract(), &setup.bundle).unwrap();
    let dir = setup.cache.entry_dir(&setup.key);
    let before = listing(&dir);

    assert_eq!(
        setup.cache.set(&setup.key, &extract(), &setup.bundle).unwrap(),
        InstallOutcome::AlreadyPresent
    );
    assert_eq!(listing(&dir), before);
    assert_eq!(before.len(), 2);
}

#[test]
fn two_bundles_are_corruption() {
    let setup = setup();
    setup.cache.set(&setup.key, &extract(), &setup.bundle).unwrap();
    fs::copy(&setup.bundle, setup.cache.entry_dir(&setup.key).join("copy.zip")).unwrap();

    assert!(matches!(
        setup.cache.get(&setup.key),
        Err(CacheError::Corruption { .. })
    ));
}

#[test]
fn missing_bundle_is_corruption() {
    let setup = setup();
    setup.cache.set(&setup.key, &extract(), &setup.bundle).unwrap();
    fs::remove_file(setup.cache.entry_dir(&setup.key).join(setup.key.bundle_file_name())).unwrap();

    assert!(matches!(
        setup.cache.get(&setup.key),
        Err(CacheError::Corruption { .. })
    ));
}

#[test]
fn uncommitted_entries_are_misses() {
    let setup = setup();
    let dir = setup.cache.entry_dir(&setup.key);
    fs::create_dir_all(&dir).unwrap();
    fs::copy(&setup.bundle, dir.join(setup.key.bundle_file_name())).unwrap();

    assert_eq!(setup.cache.get(&setup.key).unwrap(), None);
    assert!(setup.cache.entries().unwrap().is_empty());
}

#[test]
fn entries_and_extracts_can_be_inspected() {
    let setup = setup();
    setup.cache.set(&setup.key, &extract(), &setup.bundle).unwrap();
    fs::create_dir_all(setup.cache.root().join(".refcache")).unwrap();

    assert_eq!(setup.cache.entries().unwrap(), vec![setup.key.clone()]);
    assert_eq!(setup.cache.read_extract(&setup.key).unwrap(), Some(extract()));

    let on_disk =
        fs::read_to_string(setup.cache.entry_dir(&setup.key).join("extract.json")).unwrap();
    assert!(on_disk.contains("\n  \"format_version\": 1"), "{on_disk}");
}

#[test]
fn incomplete_bundles_fail_verification() {
    let setup = setup();
    // A bundle holding fewer outputs than the ones being restored.
    let mut outputs = setup.outputs.clone();
    outputs.truncate(1);
    let staged = write_bundle(
        &setup.root.join("staging-2"),
        "partial.zip",
        HashAlgorithm::Xxh3,
        &extract(),
        &outputs,
    )
    .unwrap();

    let mut bundle = Bundle::open(&staged.path, "k").unwrap();
    let err = bundle
        .restore(&setup.outputs, HashAlgorithm::Xxh3, SystemTime::now(), &RetryPolicy::default())
        .unwrap_err();
    assert!(matches!(err, CacheError::Corruption { .. }), "{err}");
}
