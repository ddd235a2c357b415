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
    io::{Read, Seek},
    mem,
};

use arrayvec::ArrayVec;
use quarry_common::{any_as_u8_slice, TypeRef};

/// Lifecycle of a cached asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetStatus {
    Unloaded,
    Loading,
    LoadingFailed,
    Loaded,
}

pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// One opened stream handed to a loader, already positioned at the
/// offset its location declared.
pub struct AssetStream {
    pub asset_type: TypeRef,
    pub stream: Box<dyn ReadSeek>,
}

pub const LOAD_ARG_CAPACITY: usize = 128;

pub(crate) type ArgBytes = ArrayVec<u8, LOAD_ARG_CAPACITY>;

/// Typed load parameter, stored inline in the cache entry. Loaders
/// declare the parameter type they accept; anything larger than
/// [`LOAD_ARG_CAPACITY`] bytes is rejected when the loader registers.
#[derive(Clone, Default)]
pub struct LoadArg {
    type_hash: TypeRef,
    bytes: ArgBytes,
}

impl LoadArg {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new<T: Copy + 'static>(value: &T) -> Self {
        assert!(
            mem::size_of::<T>() <= LOAD_ARG_CAPACITY,
            "Load argument type is too large"
        );
        let mut bytes = ArgBytes::new();
        bytes.try_extend_from_slice(unsafe { any_as_u8_slice(value) }).unwrap();

        Self {
            type_hash: TypeRef::of::<T>(),
            bytes,
        }
    }

    pub fn type_hash(&self) -> TypeRef {
        self.type_hash
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// View of a cache entry handed to loader callbacks.
pub struct LoaderContext<'a> {
    pub(crate) asset_type: TypeRef,
    pub(crate) parameter_type: TypeRef,
    pub(crate) argument: &'a [u8],
    pub(crate) payload: &'a mut Option<Box<dyn Any + Send + Sync>>,
}

impl LoaderContext<'_> {
    pub fn asset_type(&self) -> TypeRef {
        self.asset_type
    }

    pub fn parameter_type(&self) -> TypeRef {
        self.parameter_type
    }

    pub fn asset_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.payload.as_mut()?.downcast_mut()
    }

    /// Drops the asset payload, releasing whatever `allocate` produced.
    pub fn take_payload(&mut self) -> Option<Box<dyn Any + Send + Sync>> {
        self.payload.take()
    }

    pub fn argument<T: Copy + 'static>(&self) -> Option<T> {
        if TypeRef::of::<T>() != self.parameter_type || self.argument.len() != mem::size_of::<T>() {
            return None;
        }

        Some(unsafe { std::ptr::read_unaligned(self.argument.as_ptr() as *const T) })
    }
}

/// Constructs in-memory asset values of the types it declares. One
/// loader owns each asset type; the registry rejects overlaps.
pub trait AssetLoader: Send + Sync {
    fn supported_types(&self) -> &[TypeRef];

    fn parameter_type(&self) -> TypeRef {
        TypeRef::none()
    }

    fn allocate(&self, asset_type: TypeRef) -> Box<dyn Any + Send + Sync>;

    fn load(&self, ctx: &mut LoaderContext, streams: &mut [AssetStream]) -> AssetStatus;

    fn unload(&self, ctx: &mut LoaderContext) -> AssetStatus;
}
