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
    fs::File,
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    sync::{atomic::Ordering, Arc},
    thread,
};

use log::error;
use parking_lot::{Mutex, RwLock};
use quarry_common::{
    fingerprint32, BinaryDeserialization, BinarySerialization, DependencyCache, Guid, JobSystem,
    TypeRef, WaitGroup,
};

use crate::{
    cache::{AssetCache, AssetState},
    AssetId, AssetLoader, AssetLocation, AssetLocator, AssetStatus, AssetStream, Error, LoadArg,
    LoaderContext, Manifest, LOAD_ARG_CAPACITY,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadMode {
    /// Drop one reference; the entry survives while others remain.
    Release,
    /// Unload now regardless of the reference count.
    Destroy,
}

struct RegisteredLoader {
    loader: Arc<dyn AssetLoader>,
    parameter_type: TypeRef,
    supported: Vec<TypeRef>,
}

#[derive(Default)]
struct RegistryShared {
    // Loader slots keep their index for the lifetime of the registry so
    // cache entries can refer to them by position.
    loaders: RwLock<Vec<Option<RegisteredLoader>>>,
    type_to_loader: RwLock<std::collections::HashMap<u32, usize>>,
    locators: RwLock<Vec<Arc<dyn AssetLocator>>>,
    cache: AssetCache,
}

/// Runtime asset registry: resolves GUIDs through the locator chain,
/// drives typed loaders, and caches loaded assets with reference counts.
/// All loader activity for one GUID is serialized through the dependency
/// cache; distinct GUIDs load in parallel.
pub struct AssetRegistry {
    jobs: Arc<JobSystem>,
    deps: DependencyCache,
    shared: Arc<RegistryShared>,
    manifests: RwLock<Vec<Arc<Mutex<Manifest>>>>,
}

impl AssetRegistry {
    pub fn new(jobs: Arc<JobSystem>) -> Self {
        Self {
            deps: DependencyCache::new(jobs.clone()),
            jobs,
            shared: Arc::new(RegistryShared::default()),
            manifests: RwLock::new(Vec::new()),
        }
    }

    pub fn jobs(&self) -> &Arc<JobSystem> {
        &self.jobs
    }

    /// Loads an asset, or takes another reference if it is already
    /// resident or in flight. Without a wait group the call blocks until
    /// the load job has finished; the outcome is on the entry's status
    /// either way.
    pub fn load(
        &self,
        guid: Guid,
        asset_type: TypeRef,
        arg: &LoadArg,
        wait: Option<&WaitGroup>,
    ) -> Result<AssetId, Error> {
        loop {
            if let Some((_, _, state)) = self.shared.cache.find(guid) {
                let state = state.lock();
                if state.asset_type != asset_type {
                    error!(
                        "Invalid asset type given for asset {}: requested {} but expected {}",
                        guid, asset_type, state.asset_type
                    );
                    return Err(Error::InvalidInput);
                }
            }

            let Some((loader_index, loader, parameter_type)) = self.find_loader(asset_type) else {
                error!("Failed to find a loader for assets of type {}", asset_type);
                return Err(Error::NotFound);
            };

            if arg.type_hash() != parameter_type {
                error!(
                    "Invalid argument for asset {}: expected type {} but got {}",
                    guid,
                    parameter_type,
                    arg.type_hash()
                );
                return Err(Error::InvalidInput);
            }

            let (id, refcount, state, existing) =
                self.shared.cache.find_or_insert(guid, || AssetState {
                    status: AssetStatus::Unloaded,
                    loader: loader_index,
                    asset_type,
                    parameter_type,
                    argument: Default::default(),
                    payload: None,
                });

            {
                let mut state = state.lock();
                if existing && state.asset_type != asset_type {
                    error!(
                        "Invalid asset type given for asset {}: requested {} but expected {}",
                        guid, asset_type, state.asset_type
                    );
                    return Err(Error::InvalidInput);
                }
                state.loader = loader_index;
                state.parameter_type = parameter_type;

                // In-flight or resident: just take a reference.
                if matches!(state.status, AssetStatus::Loaded | AssetStatus::Loading) {
                    let previous = refcount.fetch_add(1, Ordering::AcqRel);
                    // A loaded entry whose refcount was observed at zero
                    // is one a release has already claimed for teardown:
                    // the load job publishes its increment before the
                    // entry lock is released, so the count cannot be
                    // zero here otherwise. Back out, let the unload
                    // finish, and start over.
                    if state.status == AssetStatus::Loaded && previous == 0 {
                        refcount.fetch_sub(1, Ordering::AcqRel);
                        drop(state);
                        self.deps.wait_write(fingerprint32(guid.as_bytes()));
                        thread::yield_now();
                        continue;
                    }
                    return Ok(id);
                }

                state.argument.clear();
                state
                    .argument
                    .try_extend_from_slice(arg.bytes())
                    .expect("Load argument exceeds inline capacity");
                if state.payload.is_none() {
                    state.payload = Some(loader.allocate(asset_type));
                }
                state.status = AssetStatus::Loading;
            }

            let shared = self.shared.clone();
            let job = move |_worker: usize| {
                load_job(&shared, guid, &loader, &refcount, &state);
            };

            let key = fingerprint32(guid.as_bytes());
            match wait {
                Some(group) => self.deps.schedule_write(key, Some(group), job),
                None => {
                    let group = WaitGroup::new();
                    self.deps.schedule_write(key, Some(&group), job);
                    group.wait();
                }
            }

            return Ok(id);
        }
    }

    /// Resolves a name through the manifests, then loads as usual.
    pub fn load_by_name(
        &self,
        name: &str,
        asset_type: TypeRef,
        arg: &LoadArg,
        wait: Option<&WaitGroup>,
    ) -> Result<AssetId, Error> {
        let Some(guid) = self.resolve_name(name) else {
            error!("No manifest entry for asset name \"{}\"", name);
            return Err(Error::NotFound);
        };

        self.load(guid, asset_type, arg, wait)
    }

    pub fn unload(&self, id: AssetId, mode: UnloadMode) {
        let Some((guid, refcount, state)) = self.shared.cache.get(id) else {
            error!("No such asset with id {}", id);
            return;
        };

        if mode == UnloadMode::Release {
            // Only the holder of the last reference tears the entry
            // down; any other outcome just drops one reference.
            match refcount.compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => {}
                Err(_) => {
                    refcount.fetch_sub(1, Ordering::SeqCst);
                    return;
                }
            }
        } else {
            refcount.store(0, Ordering::SeqCst);
        }

        let shared = self.shared.clone();
        let group = WaitGroup::new();
        self.deps.schedule_write(
            fingerprint32(guid.as_bytes()),
            Some(&group),
            move |_worker| {
                let mut state = state.lock();
                let loader = {
                    let loaders = shared.loaders.read();
                    loaders.get(state.loader).and_then(|slot| slot.as_ref()).map(|l| l.loader.clone())
                };
                let Some(loader) = loader else {
                    error!("Asset {} has no loader to unload with", guid);
                    return;
                };

                let argument = state.argument.clone();
                let mut ctx = LoaderContext {
                    asset_type: state.asset_type,
                    parameter_type: state.parameter_type,
                    argument: &argument,
                    payload: &mut state.payload,
                };
                let status = loader.unload(&mut ctx);
                state.status = status;
                drop(state);

                if status == AssetStatus::Unloaded {
                    shared.cache.erase(id);
                }
            },
        );
        group.wait();
    }

    pub fn status(&self, id: AssetId) -> Option<AssetStatus> {
        self.shared.cache.get(id).map(|(_, _, state)| state.lock().status)
    }

    pub fn refcount(&self, id: AssetId) -> Option<i32> {
        self.shared
            .cache
            .get(id)
            .map(|(_, refcount, _)| refcount.load(Ordering::SeqCst))
    }

    /// Runs `f` against the loaded asset value, if the entry is resident
    /// and of the requested type.
    pub fn with_asset<T: 'static, R>(&self, id: AssetId, f: impl FnOnce(&T) -> R) -> Option<R> {
        let (_, _, state) = self.shared.cache.get(id)?;
        let state = state.lock();
        let payload = state.payload.as_ref()?;

        payload.downcast_ref().map(f)
    }

    pub fn add_loader(&self, loader: Arc<dyn AssetLoader>) -> Result<(), Error> {
        let parameter_type = loader.parameter_type();
        if parameter_type.size as usize > LOAD_ARG_CAPACITY {
            error!("Failed to add loader: parameter type is too large");
            return Err(Error::InvalidInput);
        }

        let supported = loader.supported_types().to_vec();
        if supported.is_empty() {
            error!("Asset loaders must declare at least one supported type");
            return Err(Error::InvalidInput);
        }

        self.deps.wait_all();

        let mut loaders = self.shared.loaders.write();
        let mut types = self.shared.type_to_loader.write();

        if loaders
            .iter()
            .flatten()
            .any(|registered| Arc::ptr_eq(&registered.loader, &loader))
        {
            error!("Asset loader was added multiple times to the registry");
            return Err(Error::DuplicateRegistration);
        }

        for supported_type in &supported {
            if types.contains_key(&supported_type.hash) {
                error!("A loader is already registered for type {}", supported_type);
                return Err(Error::DuplicateRegistration);
            }
        }

        let index = loaders.len();
        for supported_type in &supported {
            types.insert(supported_type.hash, index);
        }
        loaders.push(Some(RegisteredLoader {
            loader,
            parameter_type,
            supported,
        }));

        Ok(())
    }

    pub fn remove_loader(&self, loader: &Arc<dyn AssetLoader>) -> Result<(), Error> {
        self.deps.wait_all();

        let mut loaders = self.shared.loaders.write();
        let mut types = self.shared.type_to_loader.write();

        let Some(index) = loaders.iter().position(|slot| {
            slot.as_ref()
                .map(|registered| Arc::ptr_eq(&registered.loader, loader))
                .unwrap_or(false)
        }) else {
            error!("Asset loader was not previously added to the registry");
            return Err(Error::NotFound);
        };

        if let Some(registered) = loaders[index].take() {
            for supported_type in &registered.supported {
                types.remove(&supported_type.hash);
            }
        }

        Ok(())
    }

    pub fn add_locator(&self, locator: Arc<dyn AssetLocator>) -> Result<(), Error> {
        self.deps.wait_all();

        let mut locators = self.shared.locators.write();
        if locators.iter().any(|existing| Arc::ptr_eq(existing, &locator)) {
            error!("Asset locator was added multiple times to the registry");
            return Err(Error::DuplicateRegistration);
        }
        locators.push(locator);

        Ok(())
    }

    pub fn remove_locator(&self, locator: &Arc<dyn AssetLocator>) -> Result<(), Error> {
        self.deps.wait_all();

        let mut locators = self.shared.locators.write();
        let Some(index) = locators.iter().position(|existing| Arc::ptr_eq(existing, locator)) else {
            error!("Asset locator was not previously added to the registry");
            return Err(Error::NotFound);
        };
        locators.remove(index);

        Ok(())
    }

    /// Gets or creates the named manifest.
    pub fn add_manifest(&self, name: &str) -> Arc<Mutex<Manifest>> {
        let mut manifests = self.manifests.write();
        if let Some(manifest) = manifests.iter().find(|m| m.lock().name() == name) {
            return manifest.clone();
        }

        let manifest = Arc::new(Mutex::new(Manifest::new(name)));
        manifests.push(manifest.clone());

        manifest
    }

    pub fn get_manifest(&self, name: &str) -> Option<Arc<Mutex<Manifest>>> {
        self.manifests
            .read()
            .iter()
            .find(|m| m.lock().name() == name)
            .cloned()
    }

    pub fn remove_manifest(&self, name: &str) {
        self.manifests.write().retain(|m| m.lock().name() != name);
    }

    pub fn serialize_manifests(&self, w: &mut impl Write) -> io::Result<()> {
        let manifests = self
            .manifests
            .read()
            .iter()
            .map(|m| m.lock().clone())
            .collect::<Vec<_>>();

        manifests.serialize(w)
    }

    pub fn deserialize_manifests(&self, r: &mut impl Read) -> io::Result<()> {
        let manifests = Vec::<Manifest>::deserialize(r)?;
        *self.manifests.write() = manifests
            .into_iter()
            .map(|m| Arc::new(Mutex::new(m)))
            .collect();

        Ok(())
    }

    pub fn wait_idle(&self) {
        self.deps.wait_all();
    }

    pub fn resident_count(&self) -> usize {
        self.shared.cache.len()
    }

    fn resolve_name(&self, name: &str) -> Option<Guid> {
        let name_hash = fingerprint32(name.as_bytes());
        if let Some(guid) = self.shared.cache.lookup_name(name_hash) {
            return Some(guid);
        }

        for manifest in self.manifests.read().iter() {
            if let Some(guid) = manifest.lock().get_hash(name_hash) {
                self.shared.cache.remember_name(name_hash, guid);
                return Some(guid);
            }
        }

        None
    }

    fn find_loader(&self, asset_type: TypeRef) -> Option<(usize, Arc<dyn AssetLoader>, TypeRef)> {
        let index = {
            let types = self.shared.type_to_loader.read();
            *types.get(&asset_type.hash)?
        };
        let loaders = self.shared.loaders.read();
        let registered = loaders.get(index)?.as_ref()?;

        Some((index, registered.loader.clone(), registered.parameter_type))
    }
}

impl Drop for AssetRegistry {
    fn drop(&mut self) {
        self.deps.wait_all();

        for slot in self.shared.cache.drain() {
            let mut state = slot.state.lock();
            if state.payload.is_none() {
                continue;
            }
            let loader = {
                let loaders = self.shared.loaders.read();
                loaders.get(state.loader).and_then(|l| l.as_ref()).map(|l| l.loader.clone())
            };
            if let Some(loader) = loader {
                let argument = state.argument.clone();
                let mut ctx = LoaderContext {
                    asset_type: state.asset_type,
                    parameter_type: state.parameter_type,
                    argument: &argument,
                    payload: &mut state.payload,
                };
                loader.unload(&mut ctx);
            }
        }
    }
}

fn load_job(
    shared: &RegistryShared,
    guid: Guid,
    loader: &Arc<dyn AssetLoader>,
    refcount: &std::sync::atomic::AtomicI32,
    state: &Mutex<AssetState>,
) {
    let locators = shared.locators.read().clone();
    let mut location = AssetLocation::default();
    let mut located_by = None;
    for locator in &locators {
        location.clear();
        if locator.locate(guid, &mut location) {
            located_by = Some(locator.name().to_owned());
            break;
        }
    }

    let mut state = state.lock();

    if located_by.is_none() {
        state.status = AssetStatus::LoadingFailed;
        error!("Failed to find a location for asset {}", guid);
        return;
    }

    if location.asset_type != state.asset_type {
        state.status = AssetStatus::LoadingFailed;
        error!(
            "Locator \"{}\" found asset {} but the located type {} doesn't match the expected type {}",
            located_by.unwrap_or_default(),
            guid,
            location.asset_type,
            state.asset_type
        );
        return;
    }

    let mut streams = Vec::with_capacity(location.streams.len());
    for info in &location.streams {
        let stream: Box<dyn crate::ReadSeek> = match &info.source {
            crate::StreamSource::File(path) => {
                let mut file = match File::open(path) {
                    Ok(file) => file,
                    Err(err) => {
                        state.status = AssetStatus::LoadingFailed;
                        error!("Failed to open stream {:?} for asset {} - {:?}", path, guid, err);
                        return;
                    }
                };
                if let Err(err) = file.seek(SeekFrom::Start(info.offset)) {
                    state.status = AssetStatus::LoadingFailed;
                    error!("Failed to seek stream {:?} for asset {} - {:?}", path, guid, err);
                    return;
                }
                Box::new(file)
            }
            crate::StreamSource::Buffer(buffer) => {
                let mut cursor = Cursor::new(buffer.clone());
                cursor.set_position(info.offset);
                Box::new(cursor)
            }
        };
        streams.push(AssetStream {
            asset_type: info.asset_type,
            stream,
        });
    }

    let argument = state.argument.clone();
    let asset_type = state.asset_type;
    let parameter_type = state.parameter_type;
    let mut ctx = LoaderContext {
        asset_type,
        parameter_type,
        argument: &argument,
        payload: &mut state.payload,
    };
    let status = loader.load(&mut ctx, &mut streams);
    drop(streams);

    state.status = status;

    match status {
        AssetStatus::Loaded => {
            refcount.fetch_add(1, Ordering::AcqRel);
        }
        AssetStatus::LoadingFailed => {
            error!("Failed to load {} asset {}", asset_type, guid);
        }
        _ => {}
    }
}

#[cfg(test)]
mod test {
    use std::{
        io::Read,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        thread,
    };

    use quarry_common::{Guid, JobSystem, TypeRef};

    use crate::{
        AssetLoader, AssetLocation, AssetLocator, AssetRegistry, AssetStatus, AssetStream, Error,
        LoadArg, LoaderContext, StreamInfo, StreamSource, UnloadMode,
    };

    struct BlobAsset {
        bytes: Vec<u8>,
    }

    #[derive(Clone, Copy)]
    struct BlobParams {
        trim: usize,
    }

    struct BlobLoader {
        types: Vec<TypeRef>,
        parameter: TypeRef,
        loads: AtomicUsize,
    }

    impl BlobLoader {
        fn new() -> Self {
            Self {
                types: vec![TypeRef::of::<BlobAsset>()],
                parameter: TypeRef::none(),
                loads: AtomicUsize::new(0),
            }
        }

        fn with_params() -> Self {
            Self {
                parameter: TypeRef::of::<BlobParams>(),
                ..Self::new()
            }
        }
    }

    impl AssetLoader for BlobLoader {
        fn supported_types(&self) -> &[TypeRef] {
            &self.types
        }

        fn parameter_type(&self) -> TypeRef {
            self.parameter
        }

        fn allocate(&self, _asset_type: TypeRef) -> Box<dyn std::any::Any + Send + Sync> {
            Box::new(BlobAsset { bytes: Vec::new() })
        }

        fn load(&self, ctx: &mut LoaderContext, streams: &mut [AssetStream]) -> AssetStatus {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let trim = ctx.argument::<BlobParams>().map(|p| p.trim);
            let mut bytes = Vec::new();
            for stream in streams {
                if stream.stream.read_to_end(&mut bytes).is_err() {
                    return AssetStatus::LoadingFailed;
                }
            }
            if let Some(trim) = trim {
                bytes.truncate(trim);
            }
            let Some(asset) = ctx.asset_mut::<BlobAsset>() else {
                return AssetStatus::LoadingFailed;
            };
            asset.bytes = bytes;

            AssetStatus::Loaded
        }

        fn unload(&self, ctx: &mut LoaderContext) -> AssetStatus {
            ctx.take_payload();

            AssetStatus::Unloaded
        }
    }

    struct BufferLocator {
        guid: Guid,
        asset_type: TypeRef,
        data: Arc<[u8]>,
    }

    impl AssetLocator for BufferLocator {
        fn name(&self) -> &str {
            "buffer"
        }

        fn locate(&self, guid: Guid, location: &mut AssetLocation) -> bool {
            if guid != self.guid {
                return false;
            }
            location.asset_type = self.asset_type;
            location.streams.push(StreamInfo {
                asset_type: self.asset_type,
                offset: 0,
                source: StreamSource::Buffer(self.data.clone()),
            });

            true
        }
    }

    fn registry() -> AssetRegistry {
        AssetRegistry::new(Arc::new(JobSystem::new(4)))
    }

    fn blob_type() -> TypeRef {
        TypeRef::of::<BlobAsset>()
    }

    #[test]
    fn load_through_buffer_locator() {
        let registry = registry();
        let loader = Arc::new(BlobLoader::new());
        registry.add_loader(loader.clone()).unwrap();

        let guid = Guid::generate();
        registry
            .add_locator(Arc::new(BufferLocator {
                guid,
                asset_type: blob_type(),
                data: Arc::from(b"payload".as_slice()),
            }))
            .unwrap();

        let id = registry.load(guid, blob_type(), &LoadArg::none(), None).unwrap();
        assert_eq!(Some(AssetStatus::Loaded), registry.status(id));
        assert_eq!(Some(1), registry.refcount(id));
        assert_eq!(
            Some(b"payload".to_vec()),
            registry.with_asset::<BlobAsset, _>(id, |asset| asset.bytes.clone())
        );

        registry.unload(id, UnloadMode::Release);
        assert_eq!(None, registry.status(id));
        assert_eq!(0, registry.resident_count());
    }

    #[test]
    fn load_without_locator_fails_but_entry_remains() {
        let registry = registry();
        registry.add_loader(Arc::new(BlobLoader::new())).unwrap();

        let id = registry
            .load(Guid::generate(), blob_type(), &LoadArg::none(), None)
            .unwrap();
        assert_eq!(Some(AssetStatus::LoadingFailed), registry.status(id));
        assert_eq!(Some(0), registry.refcount(id));
        assert_eq!(1, registry.resident_count());
    }

    #[test]
    fn load_without_loader_is_an_error() {
        let registry = registry();
        assert_eq!(
            Err(Error::NotFound),
            registry.load(Guid::generate(), blob_type(), &LoadArg::none(), None)
        );
    }

    #[test]
    fn typed_argument_reaches_loader() {
        let registry = registry();
        registry.add_loader(Arc::new(BlobLoader::with_params())).unwrap();

        let guid = Guid::generate();
        registry
            .add_locator(Arc::new(BufferLocator {
                guid,
                asset_type: blob_type(),
                data: Arc::from(b"payload".as_slice()),
            }))
            .unwrap();

        let arg = LoadArg::new(&BlobParams { trim: 3 });
        let id = registry.load(guid, blob_type(), &arg, None).unwrap();
        assert_eq!(
            Some(b"pay".to_vec()),
            registry.with_asset::<BlobAsset, _>(id, |asset| asset.bytes.clone())
        );
    }

    #[test]
    fn mismatched_argument_type_is_rejected() {
        let registry = registry();
        registry.add_loader(Arc::new(BlobLoader::with_params())).unwrap();
        assert_eq!(
            Err(Error::InvalidInput),
            registry.load(Guid::generate(), blob_type(), &LoadArg::none(), None)
        );
    }

    #[test]
    fn concurrent_loads_share_one_job() {
        let registry = Arc::new(registry());
        let loader = Arc::new(BlobLoader::new());
        registry.add_loader(loader.clone()).unwrap();

        let guid = Guid::generate();
        registry
            .add_locator(Arc::new(BufferLocator {
                guid,
                asset_type: blob_type(),
                data: Arc::from(b"payload".as_slice()),
            }))
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..2 {
            let registry = registry.clone();
            handles.push(thread::spawn(move || {
                registry.load(guid, blob_type(), &LoadArg::none(), None).unwrap()
            }));
        }
        let ids = handles.into_iter().map(|h| h.join().unwrap()).collect::<Vec<_>>();
        registry.wait_idle();

        assert_eq!(ids[0], ids[1]);
        assert_eq!(1, loader.loads.load(Ordering::SeqCst));
        assert_eq!(Some(AssetStatus::Loaded), registry.status(ids[0]));
        assert_eq!(Some(2), registry.refcount(ids[0]));
    }

    #[test]
    fn release_keeps_referenced_entries() {
        let registry = registry();
        registry.add_loader(Arc::new(BlobLoader::new())).unwrap();

        let guid = Guid::generate();
        registry
            .add_locator(Arc::new(BufferLocator {
                guid,
                asset_type: blob_type(),
                data: Arc::from(b"payload".as_slice()),
            }))
            .unwrap();

        let id = registry.load(guid, blob_type(), &LoadArg::none(), None).unwrap();
        let again = registry.load(guid, blob_type(), &LoadArg::none(), None).unwrap();
        assert_eq!(id, again);
        assert_eq!(Some(2), registry.refcount(id));

        registry.unload(id, UnloadMode::Release);
        assert_eq!(Some(AssetStatus::Loaded), registry.status(id));
        assert_eq!(Some(1), registry.refcount(id));

        registry.unload(id, UnloadMode::Release);
        assert_eq!(None, registry.status(id));
    }

    #[test]
    fn release_racing_a_load_never_strands_the_loader() {
        let registry = Arc::new(registry());
        registry.add_loader(Arc::new(BlobLoader::new())).unwrap();

        let guid = Guid::generate();
        registry
            .add_locator(Arc::new(BufferLocator {
                guid,
                asset_type: blob_type(),
                data: Arc::from(b"payload".as_slice()),
            }))
            .unwrap();

        for _ in 0..200 {
            // one live reference, then race a release against a load
            let id = registry.load(guid, blob_type(), &LoadArg::none(), None).unwrap();
            assert_eq!(Some(1), registry.refcount(id));

            let unloader = {
                let registry = registry.clone();
                thread::spawn(move || registry.unload(id, UnloadMode::Release))
            };
            let loader = {
                let registry = registry.clone();
                thread::spawn(move || {
                    registry.load(guid, blob_type(), &LoadArg::none(), None).unwrap()
                })
            };

            unloader.join().unwrap();
            let survivor = loader.join().unwrap();
            registry.wait_idle();

            // whichever side won, the handle the load returned is a live
            // reference and its entry was not torn down underneath it
            assert_eq!(Some(AssetStatus::Loaded), registry.status(survivor));
            assert!(registry.refcount(survivor).unwrap() > 0);

            registry.unload(survivor, UnloadMode::Destroy);
            assert_eq!(None, registry.status(survivor));
        }
    }

    #[test]
    fn destroy_ignores_refcount() {
        let registry = registry();
        registry.add_loader(Arc::new(BlobLoader::new())).unwrap();

        let guid = Guid::generate();
        registry
            .add_locator(Arc::new(BufferLocator {
                guid,
                asset_type: blob_type(),
                data: Arc::from(b"payload".as_slice()),
            }))
            .unwrap();

        let id = registry.load(guid, blob_type(), &LoadArg::none(), None).unwrap();
        registry.load(guid, blob_type(), &LoadArg::none(), None).unwrap();
        registry.unload(id, UnloadMode::Destroy);
        assert_eq!(None, registry.status(id));
    }

    #[test]
    fn requesting_wrong_type_for_cached_entry() {
        let registry = registry();
        registry.add_loader(Arc::new(BlobLoader::new())).unwrap();

        struct OtherAsset;
        struct OtherLoader {
            types: Vec<TypeRef>,
        }
        impl AssetLoader for OtherLoader {
            fn supported_types(&self) -> &[TypeRef] {
                &self.types
            }
            fn allocate(&self, _t: TypeRef) -> Box<dyn std::any::Any + Send + Sync> {
                Box::new(OtherAsset)
            }
            fn load(&self, _ctx: &mut LoaderContext, _streams: &mut [AssetStream]) -> AssetStatus {
                AssetStatus::Loaded
            }
            fn unload(&self, _ctx: &mut LoaderContext) -> AssetStatus {
                AssetStatus::Unloaded
            }
        }
        registry
            .add_loader(Arc::new(OtherLoader {
                types: vec![TypeRef::of::<OtherAsset>()],
            }))
            .unwrap();

        let guid = Guid::generate();
        registry
            .add_locator(Arc::new(BufferLocator {
                guid,
                asset_type: blob_type(),
                data: Arc::from(b"payload".as_slice()),
            }))
            .unwrap();

        registry.load(guid, blob_type(), &LoadArg::none(), None).unwrap();
        assert_eq!(
            Err(Error::InvalidInput),
            registry.load(guid, TypeRef::of::<OtherAsset>(), &LoadArg::none(), None)
        );
    }

    #[test]
    fn duplicate_loader_type_is_rejected() {
        let registry = registry();
        registry.add_loader(Arc::new(BlobLoader::new())).unwrap();
        assert_eq!(
            Err(Error::DuplicateRegistration),
            registry.add_loader(Arc::new(BlobLoader::new()))
        );
    }

    #[test]
    fn manifests_resolve_names() {
        let registry = registry();
        registry.add_loader(Arc::new(BlobLoader::new())).unwrap();

        let guid = Guid::generate();
        registry
            .add_locator(Arc::new(BufferLocator {
                guid,
                asset_type: blob_type(),
                data: Arc::from(b"payload".as_slice()),
            }))
            .unwrap();

        let manifest = registry.add_manifest("boot");
        manifest.lock().add("textures/logo", guid);

        let id = registry
            .load_by_name("textures/logo", blob_type(), &LoadArg::none(), None)
            .unwrap();
        assert_eq!(Some(AssetStatus::Loaded), registry.status(id));

        assert_eq!(
            Err(Error::NotFound),
            registry.load_by_name("textures/missing", blob_type(), &LoadArg::none(), None)
        );
    }

    #[test]
    fn manifest_serialization_roundtrip() {
        let reg = registry();
        let manifest = reg.add_manifest("boot");
        let guid = Guid::generate();
        manifest.lock().add("a", guid);

        let mut buffer = Vec::new();
        reg.serialize_manifests(&mut buffer).unwrap();

        let other = registry();
        other
            .deserialize_manifests(&mut std::io::Cursor::new(buffer))
            .unwrap();
        let loaded = other.get_manifest("boot").unwrap();
        assert_eq!(Some(guid), loaded.lock().get("a"));
        assert_eq!("boot", loaded.lock().name());
    }
}
