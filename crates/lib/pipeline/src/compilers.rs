// Copyright (C) 2023 gigablaster

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::{collections::HashMap, path::Path, sync::Arc};

use log::{debug, error, warn};
use quarry_assetdb::OptionsValue;
use quarry_common::{fingerprint32, ChunkPool, Guid, TypeRef};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::AssetPlatform;

/// Outcome of one compiler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerStatus {
    Success,
    FatalError,
    UnsupportedPlatform,
    InvalidSourceFormat,
    Unknown,
}

/// One typed output buffer produced during a compile.
#[derive(Debug)]
pub struct ArtifactBuffer {
    pub type_hash: TypeRef,
    pub data: Vec<u8>,
}

/// Everything a compiler gets to see while it runs: the target platform,
/// the source location, its own options, scratch memory, and the output
/// builder collecting artifact buffers and dependencies.
pub struct CompilerContext<'a> {
    platform: AssetPlatform,
    location: &'a Path,
    cache_dir: &'a Path,
    options: &'a OptionsValue,
    scratch: ChunkPool,
    artifacts: Vec<ArtifactBuffer>,
    main_artifact: Option<usize>,
    dependencies: Vec<Guid>,
}

impl<'a> CompilerContext<'a> {
    pub(crate) fn new(
        platform: AssetPlatform,
        location: &'a Path,
        cache_dir: &'a Path,
        options: &'a OptionsValue,
    ) -> Self {
        Self {
            platform,
            location,
            cache_dir,
            options,
            scratch: ChunkPool::new(),
            artifacts: Vec::new(),
            main_artifact: None,
            dependencies: Vec::new(),
        }
    }

    pub fn platform(&self) -> AssetPlatform {
        self.platform
    }

    pub fn location(&self) -> &Path {
        self.location
    }

    pub fn cache_directory(&self) -> &Path {
        self.cache_dir
    }

    pub fn raw_options(&self) -> &OptionsValue {
        self.options
    }

    /// Options decoded into the compiler's own type, if the payload
    /// parses as one.
    pub fn options<T: DeserializeOwned>(&self) -> Option<T> {
        parse_options(self.options)
    }

    /// Per-compile scratch memory, dropped wholesale when the compile
    /// finishes.
    pub fn scratch(&mut self) -> &mut ChunkPool {
        &mut self.scratch
    }

    pub fn add_artifact(&mut self, type_hash: TypeRef) -> usize {
        self.artifacts.push(ArtifactBuffer {
            type_hash,
            data: Vec::new(),
        });

        self.artifacts.len() - 1
    }

    pub fn artifact_mut(&mut self, index: usize) -> &mut Vec<u8> {
        &mut self.artifacts[index].data
    }

    pub fn set_main(&mut self, index: usize) {
        if index >= self.artifacts.len() {
            error!("Invalid artifact index - must have been created using add_artifact");
            return;
        }
        self.main_artifact = Some(index);
    }

    pub fn add_dependency(&mut self, guid: Guid) {
        if self.dependencies.contains(&guid) {
            error!("Asset already has a dependency with GUID {}", guid);
            return;
        }
        self.dependencies.push(guid);
    }

    pub(crate) fn finish(self) -> (Vec<ArtifactBuffer>, Option<usize>, Vec<Guid>) {
        (self.artifacts, self.main_artifact, self.dependencies)
    }
}

/// A compiler plugin: turns sources of the extensions it declares into
/// typed artifact buffers.
pub trait AssetCompiler: Send + Sync {
    fn name(&self) -> &str;

    fn supported_extensions(&self) -> &[&str];

    /// Type tag of this compiler's options, zero when it has none.
    fn options_type(&self) -> u32 {
        0
    }

    fn default_options(&self) -> OptionsValue {
        OptionsValue::none()
    }

    fn init(&self, _worker_count: usize) {}

    fn compile(&self, worker_index: usize, ctx: &mut CompilerContext) -> CompilerStatus;
}

struct CompilerEntry {
    name_hash: u32,
    compiler: Arc<dyn AssetCompiler>,
    extensions: Vec<u32>,
}

/// Maps file extensions to the ordered list of compilers that handle
/// them. Registration is idempotent per compiler name.
#[derive(Default)]
pub struct CompilerRegistry {
    compilers: Vec<CompilerEntry>,
    by_extension: HashMap<u32, Vec<usize>>,
}

/// Hash of a lowercase extension without its leading dot.
pub fn extension_hash(extension: &str) -> u32 {
    let extension = extension.strip_prefix('.').unwrap_or(extension);

    fingerprint32(extension.to_ascii_lowercase().as_bytes())
}

impl CompilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, compiler: Arc<dyn AssetCompiler>, worker_count: usize) {
        let name_hash = fingerprint32(compiler.name().as_bytes());
        if self.compilers.iter().any(|entry| entry.name_hash == name_hash) {
            debug!("Asset compiler \"{}\" is already registered", compiler.name());
            return;
        }

        let index = self.compilers.len();
        let mut extensions = Vec::new();
        for extension in compiler.supported_extensions() {
            let hash = extension_hash(extension);
            if extensions.contains(&hash) {
                warn!(
                    "Asset compiler \"{}\" defines the same file extension ({}) multiple times",
                    compiler.name(),
                    extension
                );
                continue;
            }
            self.by_extension.entry(hash).or_default().push(index);
            extensions.push(hash);
        }

        compiler.init(worker_count);
        self.compilers.push(CompilerEntry {
            name_hash,
            compiler,
            extensions,
        });
    }

    pub fn unregister(&mut self, name: &str) -> bool {
        let name_hash = fingerprint32(name.as_bytes());
        let Some(index) = self
            .compilers
            .iter()
            .position(|entry| entry.name_hash == name_hash)
        else {
            error!("No asset compiler registered with name \"{}\"", name);
            return false;
        };

        self.compilers.remove(index);

        // Entry indices shifted, rebuild the extension map.
        self.by_extension.clear();
        for (index, entry) in self.compilers.iter().enumerate() {
            for hash in &entry.extensions {
                self.by_extension.entry(*hash).or_default().push(index);
            }
        }

        true
    }

    /// Compilers for an extension, in registration order.
    pub fn compilers_for_extension(&self, extension: &str) -> Vec<Arc<dyn AssetCompiler>> {
        self.by_extension
            .get(&extension_hash(extension))
            .map(|indices| {
                indices
                    .iter()
                    .map(|index| self.compilers[*index].compiler.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.compilers.is_empty()
    }
}

/// Builds a typed options payload: the value's fields plus a `__type`
/// tag, serialized canonically so hashing it is stable.
pub fn make_options<T: Serialize + 'static>(value: &T) -> OptionsValue {
    let type_hash = TypeRef::of::<T>().hash;
    let mut map = match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    map.insert("__type".to_owned(), Value::String(format!("{:08x}", type_hash)));

    OptionsValue::new(type_hash, Value::Object(map).to_string())
}

pub fn parse_options<T: DeserializeOwned>(options: &OptionsValue) -> Option<T> {
    serde_json::from_str(&options.json).ok()
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use quarry_assetdb::OptionsValue;
    use quarry_common::TypeRef;
    use serde::{Deserialize, Serialize};

    use super::{
        extension_hash, make_options, parse_options, AssetCompiler, CompilerContext,
        CompilerRegistry, CompilerStatus,
    };

    struct NullCompiler {
        name: &'static str,
        extensions: Vec<&'static str>,
    }

    impl AssetCompiler for NullCompiler {
        fn name(&self) -> &str {
            self.name
        }

        fn supported_extensions(&self) -> &[&str] {
            &self.extensions
        }

        fn compile(&self, _worker_index: usize, _ctx: &mut CompilerContext) -> CompilerStatus {
            CompilerStatus::Success
        }
    }

    #[test]
    fn extension_hash_ignores_dot_and_case() {
        assert_eq!(extension_hash("png"), extension_hash(".png"));
        assert_eq!(extension_hash("png"), extension_hash("PNG"));
        assert_ne!(extension_hash("png"), extension_hash("jpg"));
    }

    #[test]
    fn register_and_resolve() {
        let mut registry = CompilerRegistry::new();
        registry.register(
            Arc::new(NullCompiler {
                name: "png",
                extensions: vec!["png"],
            }),
            1,
        );
        registry.register(
            Arc::new(NullCompiler {
                name: "textures",
                extensions: vec!["png", "tga"],
            }),
            1,
        );

        assert_eq!(2, registry.compilers_for_extension("png").len());
        assert_eq!(1, registry.compilers_for_extension(".tga").len());
        assert!(registry.compilers_for_extension("wav").is_empty());
    }

    #[test]
    fn registration_is_idempotent_per_name() {
        let mut registry = CompilerRegistry::new();
        for _ in 0..2 {
            registry.register(
                Arc::new(NullCompiler {
                    name: "png",
                    extensions: vec!["png"],
                }),
                1,
            );
        }
        assert_eq!(1, registry.compilers_for_extension("png").len());
    }

    #[test]
    fn unregister_removes_mappings() {
        let mut registry = CompilerRegistry::new();
        registry.register(
            Arc::new(NullCompiler {
                name: "first",
                extensions: vec!["png"],
            }),
            1,
        );
        registry.register(
            Arc::new(NullCompiler {
                name: "second",
                extensions: vec!["png"],
            }),
            1,
        );

        assert!(registry.unregister("first"));
        assert!(!registry.unregister("first"));
        let remaining = registry.compilers_for_extension("png");
        assert_eq!(1, remaining.len());
        assert_eq!("second", remaining[0].name());
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct QualityOptions {
        quality: u32,
    }

    #[test]
    fn options_roundtrip() {
        let options = make_options(&QualityOptions { quality: 50 });
        assert_eq!(TypeRef::of::<QualityOptions>().hash, options.type_hash);
        assert_eq!(
            Some(QualityOptions { quality: 50 }),
            parse_options::<QualityOptions>(&options)
        );
        assert!(parse_options::<QualityOptions>(&OptionsValue::none()).is_none());
    }

    #[test]
    fn context_output_builder() {
        let options = OptionsValue::none();
        let source = std::path::PathBuf::from("a.png");
        let cache = std::path::PathBuf::from(".cache");
        let mut ctx = CompilerContext::new(crate::AssetPlatform::current(), &source, &cache, &options);

        let index = ctx.add_artifact(TypeRef::of::<u32>());
        ctx.artifact_mut(index).extend_from_slice(b"bytes");
        ctx.set_main(index);

        let scratch = ctx.scratch().allocate(16).unwrap();
        assert_eq!(16, scratch.size());

        let guid = quarry_common::Guid::generate();
        ctx.add_dependency(guid);
        ctx.add_dependency(guid);

        let (artifacts, main, dependencies) = ctx.finish();
        assert_eq!(1, artifacts.len());
        assert_eq!(b"bytes".as_slice(), artifacts[0].data.as_slice());
        assert_eq!(Some(0), main);
        assert_eq!(vec![guid], dependencies);
    }
}
