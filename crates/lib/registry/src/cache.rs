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
    any::Any,
    collections::HashMap,
    sync::{atomic::AtomicI32, Arc},
};

use parking_lot::Mutex;
use quarry_common::{Guid, Handle, Pool, TypeRef};

use crate::{loader::ArgBytes, AssetStatus};

/// Versioned handle to a cached asset.
pub type AssetId = Handle<AssetSlot>;

/// Mutable part of a cache entry. Guarded by its own mutex so loader
/// callbacks never run under the table lock; per-GUID job ordering means
/// there is no contention on it in practice.
pub(crate) struct AssetState {
    pub status: AssetStatus,
    pub loader: usize,
    pub asset_type: TypeRef,
    pub parameter_type: TypeRef,
    pub argument: ArgBytes,
    pub payload: Option<Box<dyn Any + Send + Sync>>,
}

impl std::fmt::Debug for AssetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssetState")
            .field("status", &self.status)
            .field("loader", &self.loader)
            .field("asset_type", &self.asset_type)
            .field("parameter_type", &self.parameter_type)
            .field("argument", &self.argument)
            .field("payload", &self.payload.is_some())
            .finish()
    }
}

/// Cache slot: identity plus the shared pieces jobs hold on to while the
/// table lock is released. The refcount is atomic and never needs the
/// lock.
#[derive(Debug)]
pub struct AssetSlot {
    pub(crate) guid: Guid,
    pub(crate) refcount: Arc<AtomicI32>,
    pub(crate) state: Arc<Mutex<AssetState>>,
}

#[derive(Default)]
struct CacheInner {
    entries: Pool<AssetSlot>,
    guid_to_id: HashMap<Guid, AssetId>,
    name_to_guid: HashMap<u32, Guid>,
}

/// Handle table plus auxiliary maps behind one leaf mutex. Nothing is
/// called back while it is held.
#[derive(Default)]
pub(crate) struct AssetCache {
    inner: Mutex<CacheInner>,
}

impl AssetCache {
    pub fn find(&self, guid: Guid) -> Option<(AssetId, Arc<AtomicI32>, Arc<Mutex<AssetState>>)> {
        let inner = self.inner.lock();
        let id = *inner.guid_to_id.get(&guid)?;
        let slot = inner.entries.get(id)?;

        Some((id, slot.refcount.clone(), slot.state.clone()))
    }

    pub fn get(&self, id: AssetId) -> Option<(Guid, Arc<AtomicI32>, Arc<Mutex<AssetState>>)> {
        let inner = self.inner.lock();
        let slot = inner.entries.get(id)?;

        Some((slot.guid, slot.refcount.clone(), slot.state.clone()))
    }

    pub fn insert(
        &self,
        guid: Guid,
        state: AssetState,
    ) -> (AssetId, Arc<AtomicI32>, Arc<Mutex<AssetState>>) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.guid_to_id.contains_key(&guid));

        let refcount = Arc::new(AtomicI32::new(0));
        let state = Arc::new(Mutex::new(state));
        let id = inner.entries.push(AssetSlot {
            guid,
            refcount: refcount.clone(),
            state: state.clone(),
        });
        inner.guid_to_id.insert(guid, id);

        (id, refcount, state)
    }

    /// Atomic lookup-or-create so two racing loads of the same GUID end
    /// up sharing one entry. The returned flag tells whether the entry
    /// already existed.
    pub fn find_or_insert(
        &self,
        guid: Guid,
        make: impl FnOnce() -> AssetState,
    ) -> (AssetId, Arc<AtomicI32>, Arc<Mutex<AssetState>>, bool) {
        let mut inner = self.inner.lock();

        if let Some(id) = inner.guid_to_id.get(&guid).copied() {
            if let Some(slot) = inner.entries.get(id) {
                return (id, slot.refcount.clone(), slot.state.clone(), true);
            }
        }

        let refcount = Arc::new(AtomicI32::new(0));
        let state = Arc::new(Mutex::new(make()));
        let id = inner.entries.push(AssetSlot {
            guid,
            refcount: refcount.clone(),
            state: state.clone(),
        });
        inner.guid_to_id.insert(guid, id);

        (id, refcount, state, false)
    }

    pub fn erase(&self, id: AssetId) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.entries.remove(id) {
            inner.guid_to_id.remove(&slot.guid);
        }
    }

    pub fn lookup_name(&self, name_hash: u32) -> Option<Guid> {
        self.inner.lock().name_to_guid.get(&name_hash).copied()
    }

    pub fn remember_name(&self, name_hash: u32, guid: Guid) {
        self.inner.lock().name_to_guid.insert(name_hash, guid);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Takes every slot out of the table, leaving it empty. Used on
    /// destroy to unload whatever is still resident.
    pub fn drain(&self) -> Vec<AssetSlot> {
        let mut inner = self.inner.lock();
        inner.guid_to_id.clear();
        inner.name_to_guid.clear();
        inner.entries.drain().collect()
    }
}
