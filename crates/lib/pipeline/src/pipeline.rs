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

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use log::{debug, error, warn};
use normalize_path::NormalizePath;
use parking_lot::RwLock;
use quarry_assetdb::{AssetArtifact, AssetDatabase, AssetRecord, OptionsValue};
use quarry_common::{fingerprint128, fingerprint32, ContentHash, DependencyCache, Guid, JobSystem};

use crate::{
    content_hash, file_mtime, generic_path, is_sidecar_path, sidecar_path_for, AssetCompiler,
    AssetPlatform, CompilerContext, CompilerRegistry, CompilerStatus, Error, Sidecar,
};

const WATCH_INTERVAL: Duration = Duration::from_millis(200);

/// What to remove when deleting an asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteKind {
    AssetOnly,
    AssetAndSource,
}

pub struct PipelineInfo {
    pub platform: AssetPlatform,
    pub project_root: PathBuf,
    pub cache_directory: PathBuf,
    pub db_name: String,
    pub worker_count: usize,
}

pub(crate) struct PipelineShared {
    pub platform: RwLock<AssetPlatform>,
    pub project_root: PathBuf,
    pub cache_root: PathBuf,
    pub db: AssetDatabase,
    pub compilers: RwLock<CompilerRegistry>,
    pub jobs: Arc<JobSystem>,
    pub deps: DependencyCache,
}

/// The offline half of the asset system: watches source directories,
/// reconciles the database against what is on disk, and dispatches
/// compile jobs. One pipeline owns one project.
pub struct AssetPipeline {
    shared: Arc<PipelineShared>,
    watcher: crate::DirectoryWatcher,
}

impl AssetPipeline {
    pub fn new(info: PipelineInfo) -> Result<Self, Error> {
        if info.platform.is_unknown() {
            return Err(Error::InvalidInput("platform must not be unknown".to_owned()));
        }
        if !info.project_root.exists() {
            return Err(Error::InvalidInput(format!(
                "project root {:?} does not exist",
                info.project_root
            )));
        }

        let cache_root = if info.cache_directory.is_absolute() {
            info.cache_directory.clone()
        } else {
            info.project_root.join(&info.cache_directory)
        };
        if !cache_root.exists() {
            fs::create_dir_all(&cache_root)?;
        }

        let db = AssetDatabase::open(&cache_root, &info.db_name)?;
        let jobs = Arc::new(JobSystem::new(info.worker_count));
        let deps = DependencyCache::new(jobs.clone());

        Ok(Self {
            shared: Arc::new(PipelineShared {
                platform: RwLock::new(info.platform),
                project_root: info.project_root,
                cache_root,
                db,
                compilers: RwLock::new(CompilerRegistry::new()),
                jobs,
                deps,
            }),
            watcher: crate::DirectoryWatcher::new(WATCH_INTERVAL),
        })
    }

    pub fn database(&self) -> &AssetDatabase {
        &self.shared.db
    }

    pub fn platform(&self) -> AssetPlatform {
        *self.shared.platform.read()
    }

    /// Changing the target platform waits for every in-flight job first.
    pub fn set_platform(&self, platform: AssetPlatform) -> Result<(), Error> {
        if platform.is_unknown() {
            return Err(Error::InvalidInput("platform must not be unknown".to_owned()));
        }
        self.shared.deps.wait_all();
        *self.shared.platform.write() = platform;

        Ok(())
    }

    pub fn register_compiler(&self, compiler: Arc<dyn AssetCompiler>) {
        let worker_count = self.shared.jobs.worker_count();
        self.shared.compilers.write().register(compiler, worker_count);
    }

    pub fn unregister_compiler(&self, name: &str) -> bool {
        self.shared.compilers.write().unregister(name)
    }

    /// Adds a source root: it is watched from now on and refreshed once
    /// immediately, which imports anything new inside it.
    pub fn add_asset_directory(&self, path: &Path) -> Result<(), Error> {
        if !path.exists() {
            error!("The asset root path {:?} does not exist", path);
            return Err(Error::NotFound);
        }
        self.watcher.add_directory(path);

        self.refresh_path(path)
    }

    pub fn remove_asset_directory(&self, path: &Path) {
        self.watcher.remove_directory(path);
    }

    pub fn asset_directories(&self) -> Vec<PathBuf> {
        self.watcher.watched_directories()
    }

    pub fn start_watching(&mut self) {
        self.watcher.start();
    }

    pub fn stop_watching(&mut self) {
        self.watcher.stop();
    }

    /// Drains watcher events and refreshes each changed path. One bad
    /// file logs and moves on; it never stops the loop.
    pub fn refresh(&self) {
        for path in self.watcher.pop_events() {
            if let Err(err) = self.refresh_path(&path) {
                error!("Failed to refresh {:?} - {:?}", path, err);
            }
        }
        self.shared.deps.trim();
    }

    /// Reconciles one path against the database: imports new or changed
    /// sources, forgets deleted ones, recurses into directories.
    pub fn refresh_path(&self, path: &Path) -> Result<(), Error> {
        let is_sidecar = is_sidecar_path(path);

        let mut sidecar_doc = None;
        let src_path = if is_sidecar {
            if path.exists() {
                let doc = Sidecar::read(path)?;
                let src = self.shared.project_root.join(&doc.source).normalize();
                sidecar_doc = Some(doc);
                src
            } else {
                path.with_extension("")
            }
        } else {
            path.to_path_buf()
        };

        let uri = self.uri_of(&src_path)?;
        // Observe any import in flight for this source before reading.
        self.shared.deps.wait_write(fingerprint32(uri.as_bytes()));

        let mut record = {
            let txn = self.shared.db.read();
            self.shared.db.get_asset_by_path(&txn, &uri).ok()
        };

        if !src_path.exists() {
            if record.is_some() {
                self.delete_asset_at_uri(&uri, DeleteKind::AssetOnly)?;
            }
            return Ok(());
        }

        let sidecar_path = if is_sidecar {
            path.to_path_buf()
        } else {
            sidecar_path_for(&src_path)
        };
        let sidecar_exists = sidecar_path.exists();
        let src_timestamp = file_mtime(&src_path)?;
        let sidecar_timestamp = if sidecar_exists {
            file_mtime(&sidecar_path)?
        } else {
            0
        };

        if let Some(stored) = &record {
            if !sidecar_exists {
                // The metadata was deleted by hand: forget the asset and
                // fall through to a fresh import.
                self.delete_asset_at_uri(&uri, DeleteKind::AssetOnly)?;
                record = None;
            } else if stored.src_timestamp == src_timestamp
                && stored.sidecar_timestamp == sidecar_timestamp
            {
                return Ok(());
            }
        }

        if !is_sidecar && sidecar_exists && sidecar_doc.is_none() {
            sidecar_doc = Some(Sidecar::read(&sidecar_path)?);
        }

        if let Some(stored) = &record {
            let options = sidecar_doc
                .as_ref()
                .map(|doc| doc.options.clone())
                .unwrap_or_else(OptionsValue::none);
            let hash = content_hash(&src_path, options_bytes(&options))?;

            if hash == stored.source_hash {
                // Content is unchanged: refresh the stored timestamps so
                // the next pass takes the fast path, and carry over the
                // user-editable sidecar fields.
                let mut updated = stored.clone();
                updated.src_timestamp = src_timestamp;
                updated.sidecar_timestamp = sidecar_timestamp;
                if let Some(doc) = &sidecar_doc {
                    updated.name = doc.name.clone();
                }
                let mut txn = self.shared.db.write();
                self.shared.db.put_asset(&mut txn, &updated)?;
                txn.commit()?;
                return Ok(());
            }
        }

        if src_path.is_file() {
            self.import(&src_path)
        } else {
            self.import_directory(&src_path, &sidecar_path, uri, sidecar_doc, record, !is_sidecar)
        }
    }

    /// Queues a compile for one source file. Resolution of compilers,
    /// GUID and options happens now; the compile itself runs as a write
    /// job keyed by the source so imports of one asset never overlap.
    pub fn import(&self, source: &Path) -> Result<(), Error> {
        let uri = self.uri_of(source)?;
        let sidecar_path = sidecar_path_for(source);

        let extension = source.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        let compilers = self.shared.compilers.read().compilers_for_extension(extension);
        if compilers.is_empty() {
            // A known asset whose filetype lost its compilers keeps its
            // artifacts; a new source is still tracked, just without any.
            let already_tracked = {
                let txn = self.shared.db.read();
                self.shared.db.get_asset_by_path(&txn, &uri).is_ok()
            };
            if already_tracked {
                warn!("No compiler found for filetype \"{}\" - skipping {:?}", extension, source);
                return Ok(());
            }
            warn!(
                "No compiler found for filetype \"{}\" - {:?} is tracked without artifacts",
                extension, source
            );
        }

        if let Some(parent) = sidecar_path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let existing = if sidecar_path.exists() {
            Some(Sidecar::read(&sidecar_path)?)
        } else {
            None
        };
        let (guid, name, mut options) = match &existing {
            Some(sidecar) => (sidecar.guid, sidecar.name.clone(), sidecar.options.clone()),
            None => (Guid::generate(), None, OptionsValue::none()),
        };
        if options.is_none() {
            if let Some(first) = compilers.first() {
                options = first.default_options();
            }
        }

        let source_hash = content_hash(source, options_bytes(&options))?;

        debug!("Importing {:?}", source);

        let shared = self.shared.clone();
        let source = source.to_path_buf();
        let key = fingerprint32(uri.as_bytes());
        self.shared.deps.schedule_write(key, None, move |worker| {
            let request = ImportRequest {
                source,
                sidecar_path,
                uri,
                guid,
                name,
                options,
                source_hash,
                compilers,
            };
            if let Err(err) = import_job(&shared, worker, request) {
                error!("Failed to import asset - {:?}", err);
            }
        });

        Ok(())
    }

    fn import_directory(
        &self,
        src_path: &Path,
        sidecar_path: &Path,
        uri: String,
        sidecar_doc: Option<Sidecar>,
        record: Option<AssetRecord>,
        recurse: bool,
    ) -> Result<(), Error> {
        let reimport = record.is_some();
        let guid = record
            .as_ref()
            .map(|record| record.guid)
            .or_else(|| sidecar_doc.as_ref().map(|doc| doc.guid))
            .unwrap_or_else(Guid::generate);
        let name = sidecar_doc
            .as_ref()
            .and_then(|doc| doc.name.clone())
            .or_else(|| record.as_ref().and_then(|record| record.name.clone()));
        let source_hash = content_hash(src_path, None)?;

        debug!(
            "{} directory {:?}",
            if reimport { "Reimporting" } else { "Importing" },
            src_path
        );

        let sidecar = Sidecar {
            guid,
            source: uri.clone(),
            options: OptionsValue::none(),
            name: name.clone(),
            is_directory: true,
            artifacts: Vec::new(),
            source_hash,
        };
        let sidecar_timestamp = sidecar.write(sidecar_path)?;

        let record = AssetRecord {
            guid,
            uri,
            name,
            is_directory: true,
            main_artifact: AssetArtifact::default(),
            options: OptionsValue::none(),
            src_timestamp: file_mtime(src_path)?,
            sidecar_timestamp,
            source_hash,
        };

        let mut txn = self.shared.db.write();
        self.shared.db.put_asset(&mut txn, &record)?;
        txn.commit()?;

        if recurse {
            for entry in fs::read_dir(src_path)? {
                let child = entry?.path();
                if let Err(err) = self.refresh_path(&child) {
                    error!("Failed to refresh {:?} - {:?}", child, err);
                }
            }
        }

        Ok(())
    }

    pub fn delete_asset(&self, guid: Guid, kind: DeleteKind) -> Result<(), Error> {
        debug!("Deleting asset {}", guid);

        let record = {
            let txn = self.shared.db.read();
            self.shared.db.get_asset(&txn, guid).map_err(|_| Error::NotFound)?
        };

        let src_path = self.shared.project_root.join(&record.uri);
        // Let any import of this source finish before tearing it down.
        self.shared.deps.wait(fingerprint32(record.uri.as_bytes()));

        if kind == DeleteKind::AssetAndSource {
            if !src_path.exists() {
                error!("Failed to delete asset: invalid source path {:?}", src_path);
                return Err(Error::SourceUnavailable(src_path));
            }
            if record.is_directory {
                fs::remove_dir_all(&src_path)?;
            } else {
                fs::remove_file(&src_path)?;
            }
        }

        let mut txn = self.shared.db.write();
        self.shared.db.delete_asset(&mut txn, guid)?;
        txn.commit()?;

        let sidecar_path = sidecar_path_for(&src_path);
        if sidecar_path.exists() {
            if let Err(err) = fs::remove_file(&sidecar_path) {
                error!("Failed to delete sidecar {:?} - {:?}", sidecar_path, err);
            }
        }

        Ok(())
    }

    /// Forces a fresh compile of an already-tracked asset.
    pub fn reimport(&self, guid: Guid) -> Result<(), Error> {
        let record = {
            let txn = self.shared.db.read();
            self.shared.db.get_asset(&txn, guid).map_err(|_| Error::NotFound)?
        };

        let src_path = self.shared.project_root.join(&record.uri);
        if !src_path.exists() {
            return Err(Error::SourceUnavailable(src_path));
        }
        if record.is_directory {
            return self.refresh_path(&src_path);
        }

        self.import(&src_path)
    }

    pub fn delete_asset_at_path(&self, path: &Path, kind: DeleteKind) -> Result<(), Error> {
        let uri = self.uri_of(path)?;

        self.delete_asset_at_uri(&uri, kind)
    }

    /// Deletes the asset carrying a friendly name, if any does.
    pub fn delete_asset_with_name(&self, name: &str, kind: DeleteKind) -> Result<(), Error> {
        let guid = {
            let txn = self.shared.db.read();
            self.shared
                .db
                .find_asset_by_name(&txn, name)
                .map_err(|_| Error::NotFound)?
                .guid
        };

        self.delete_asset(guid, kind)
    }

    fn delete_asset_at_uri(&self, uri: &str, kind: DeleteKind) -> Result<(), Error> {
        let guid = {
            let txn = self.shared.db.read();
            self.shared
                .db
                .get_asset_by_path(&txn, uri)
                .map_err(|_| Error::NotFound)?
                .guid
        };

        self.delete_asset(guid, kind)
    }

    /// Blocks until every queued compile has finished.
    pub fn wait_idle(&self) {
        self.shared.deps.wait_all();
    }

    pub(crate) fn shared(&self) -> &Arc<PipelineShared> {
        &self.shared
    }

    fn uri_of(&self, path: &Path) -> Result<String, Error> {
        let normalized = path.normalize();
        let relative = normalized
            .strip_prefix(self.shared.project_root.normalize())
            .map_err(|_| {
                Error::InvalidInput(format!("{:?} is outside the project root", path))
            })?;

        Ok(generic_path(relative))
    }
}

impl Drop for AssetPipeline {
    fn drop(&mut self) {
        self.shared.deps.wait_all();
        self.watcher.stop();
    }
}

struct ImportRequest {
    source: PathBuf,
    sidecar_path: PathBuf,
    uri: String,
    guid: Guid,
    name: Option<String>,
    options: OptionsValue,
    source_hash: ContentHash,
    compilers: Vec<Arc<dyn AssetCompiler>>,
}

fn import_job(shared: &PipelineShared, worker: usize, request: ImportRequest) -> Result<(), Error> {
    if !request.source.exists() {
        return Err(Error::SourceUnavailable(request.source.clone()));
    }

    let platform = *shared.platform.read();
    let mut ctx = CompilerContext::new(platform, &request.source, &shared.cache_root, &request.options);

    for compiler in &request.compilers {
        let status = compiler.compile(worker, &mut ctx);
        if status != CompilerStatus::Success {
            error!(
                "Failed to import asset {:?}: compiler \"{}\" returned {:?}",
                request.source,
                compiler.name(),
                status
            );
            return Err(Error::CompileFailed(status));
        }
    }

    let (buffers, main_index, dependencies) = ctx.finish();

    // Hash the artifact buffers and fix a deterministic storage order.
    let mut artifacts = buffers
        .into_iter()
        .enumerate()
        .map(|(index, buffer)| {
            let artifact = AssetArtifact::new(fingerprint128(&buffer.data), buffer.type_hash);
            (artifact, buffer.data, main_index == Some(index))
        })
        .collect::<Vec<_>>();
    artifacts.sort_by(|(a, ..), (b, ..)| a.content_hash.cmp(&b.content_hash));

    let main_artifact = artifacts
        .iter()
        .find(|(_, _, is_main)| *is_main)
        .or_else(|| artifacts.first())
        .map(|(artifact, ..)| *artifact)
        .unwrap_or_default();

    let mut txn = shared.db.write();

    // Artifacts of a previous import that this one no longer produces
    // lose their reference here.
    for stale in shared.db.artifacts_of(&txn, request.guid) {
        let still_produced = artifacts
            .iter()
            .any(|(new, ..)| new.content_hash == stale.content_hash);
        if !still_produced {
            shared.db.delete_artifact(&mut txn, request.guid, stale.content_hash)?;
        }
    }

    for (artifact, data, _) in &artifacts {
        shared.db.put_artifact(&mut txn, request.guid, *artifact, data);
    }

    shared.db.set_dependencies(&mut txn, request.guid, &dependencies);

    // Sidecar goes to disk first so the record stores its fresh mtime,
    // all inside the same transaction scope.
    let sidecar = Sidecar {
        guid: request.guid,
        source: request.uri.clone(),
        options: request.options.clone(),
        name: request.name.clone(),
        is_directory: false,
        artifacts: artifacts.iter().map(|(artifact, ..)| artifact.content_hash).collect(),
        source_hash: request.source_hash,
    };
    let sidecar_timestamp = sidecar.write(&request.sidecar_path)?;

    let record = AssetRecord {
        guid: request.guid,
        uri: request.uri.clone(),
        name: request.name.clone(),
        is_directory: false,
        main_artifact,
        options: request.options.clone(),
        src_timestamp: file_mtime(&request.source)?,
        sidecar_timestamp,
        source_hash: request.source_hash,
    };
    shared.db.put_asset(&mut txn, &record)?;

    txn.commit()?;

    debug!("Imported {:?} as {}", request.source, request.guid);

    Ok(())
}

fn options_bytes(options: &OptionsValue) -> Option<&[u8]> {
    if options.is_none() {
        None
    } else {
        Some(options.hash_bytes())
    }
}
