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

use std::{path::PathBuf, sync::Arc};

use arrayvec::ArrayVec;
use quarry_common::{Guid, TypeRef};

pub const MAX_LOCATION_STREAMS: usize = 8;

/// Where one stream of asset data comes from: a file on disk or a buffer
/// already in memory.
#[derive(Debug, Clone)]
pub enum StreamSource {
    File(PathBuf),
    Buffer(Arc<[u8]>),
}

#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub asset_type: TypeRef,
    pub offset: u64,
    pub source: StreamSource,
}

/// What a locator reports for a GUID: the expected top-level type and an
/// ordered list of streams the loader will receive.
#[derive(Debug, Default, Clone)]
pub struct AssetLocation {
    pub asset_type: TypeRef,
    pub streams: ArrayVec<StreamInfo, MAX_LOCATION_STREAMS>,
}

impl AssetLocation {
    pub fn clear(&mut self) {
        self.asset_type = TypeRef::none();
        self.streams.clear();
    }
}

/// Maps GUIDs to stream locations. Locators form an ordered chain; the
/// first one that reports a location wins.
pub trait AssetLocator: Send + Sync {
    fn name(&self) -> &str;

    fn locate(&self, guid: Guid, location: &mut AssetLocation) -> bool;
}
