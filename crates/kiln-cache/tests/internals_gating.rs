use std::fs;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use kiln_cache::{
    CacheConfig, CacheKey, CompilationCache, CompilationInputs, LocateResult, ProjectIdentity,
};
use kiln_test_utils::{
    Access, AssemblyImage, MethodDefinition, ProjectFixture, SigType, TypeDefinition,
};

/// Assembly `X`, which grants internals access to `Y` only.
struct X {
    public_param: SigType,
    internal_return: SigType,
    private_body: Vec<u8>,
}

impl Default for X {
    fn default() -> Self {
        Self {
            public_param: SigType::Int32,
            internal_return: SigType::Void,
            private_body: vec![0x2A],
        }
    }
}

impl X {
    fn image(&self) -> AssemblyImage {
        AssemblyImage::new("X")
            .internals_visible_to("Y, PublicKey=0024000004800000940000000602")
            .with_type(
                TypeDefinition::class("X", "Api")
                    .method(
                        MethodDefinition::new("Do", Access::Public)
                            .param("value", self.public_param.clone()),
                    )
                    .method(
                        MethodDefinition::new("Secret", Access::Internal)
                            .returns(self.internal_return.clone()),
                    )
                    .method(
                        MethodDefinition::new("Helper", Access::Private)
                            .body(self.private_body.clone()),
                    ),
            )
    }
}

struct Graph {
    fixture: ProjectFixture,
    cache: CompilationCache,
    writes: i64,
}

impl Graph {
    fn new() -> Self {
        let fixture = ProjectFixture::new("Y");
        fixture.write("Y.cs", "class UsesInternals {}");
        fs::create_dir_all(fixture.root().join("Z")).unwrap();
        fs::write(fixture.root().join("Z/Z.cs"), "class UsesPublicOnly {}").unwrap();
        let cache = CompilationCache::new(CacheConfig::new(fixture.cache_dir())).unwrap();
        let mut graph = Self {
            fixture,
            cache,
            writes: 0,
        };
        graph.write_x(&X::default());
        graph
    }

    fn x_path(&self) -> PathBuf {
        self.fixture.root().join("lib/X.dll")
    }

    /// Rewrites `X.dll` with a timestamp no earlier write has used.
    fn write_x(&mut self, x: &X) {
        let path = self.x_path();
        x.image().write_to(&path).unwrap();
        self.writes += 1;
        let stamp = FileTime::from_unix_time(1_600_000_000 + self.writes, 0);
        filetime::set_file_mtime(&path, stamp).unwrap();
    }

    fn locate(&self, project_dir: &Path, name: &str) -> LocateResult {
        let inputs = CompilationInputs {
            project: ProjectIdentity::new(project_dir.join(format!("{name}.csproj"))),
            properties: vec![
                ("Sources".into(), format!("{name}.cs")),
                ("TargetType".into(), "library".into()),
                ("References".into(), self.x_path().display().to_string()),
                ("OutputAssembly".into(), format!("obj/{name}.dll")),
            ],
            outputs: Vec::new(),
        };
        self.cache.locate(&inputs).unwrap()
    }

    fn keys(&self) -> (CacheKey, CacheKey) {
        let y = self.locate(self.fixture.project_dir(), "Y");
        let z = self.locate(&self.fixture.root().join("Z"), "Z");
        (y.cache_key.unwrap(), z.cache_key.unwrap())
    }
}

#[test]
fn only_friends_see_internal_changes() {
    let mut graph = Graph::new();
    let (y_before, z_before) = graph.keys();

    graph.write_x(&X {
        internal_return: SigType::Bool,
        ..X::default()
    });
    let (y_after, z_after) = graph.keys();

    assert_ne!(y_after, y_before);
    assert_eq!(z_after, z_before);
}

#[test]
fn public_changes_reach_every_consumer() {
    let mut graph = Graph::new();
    let (y_before, z_before) = graph.keys();

    graph.write_x(&X {
        public_param: SigType::String,
        ..X::default()
    });
    let (y_after, z_after) = graph.keys();

    assert_ne!(y_after, y_before);
    assert_ne!(z_after, z_before);
}

#[test]
fn private_implementation_changes_reach_no_one() {
    let mut graph = Graph::new();
    let before_bytes = fs::read(graph.x_path()).unwrap();
    let (y_before, z_before) = graph.keys();

    graph.write_x(&X {
        private_body: vec![0x17, 0x26, 0x2A],
        ..X::default()
    });
    assert_ne!(fs::read(graph.x_path()).unwrap(), before_bytes);
    let (y_after, z_after) = graph.keys();

    assert_eq!(y_after, y_before);
    assert_eq!(z_after, z_before);
}

#[test]
fn hash_variant_is_chosen_per_consumer() {
    let graph = Graph::new();
    let y = graph.locate(graph.fixture.project_dir(), "Y");
    let z = graph.locate(&graph.fixture.root().join("Z"), "Z");

    let y_ref = &y.session.local_inputs().unwrap().extract.references[0];
    let z_ref = &z.session.local_inputs().unwrap().extract.references[0];
    assert!(y_ref.internals);
    assert!(!z_ref.internals);
    assert_ne!(y_ref.hash, z_ref.hash);
    assert_eq!(y_ref.name, "X.dll");
}
