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

use std::sync::Arc;

use log::warn;
use quarry_common::Guid;
use quarry_registry::{AssetLocation, AssetLocator, StreamInfo, StreamSource};

use crate::{pipeline::PipelineShared, AssetPipeline};

/// Locator backed by the asset database: resolves a GUID to its compiled
/// artifact blobs, main artifact first. This is what the editor plugs
/// into the runtime registry so it can load straight out of the cache.
pub struct DatabaseLocator {
    shared: Arc<PipelineShared>,
}

impl AssetPipeline {
    pub fn locator(&self) -> DatabaseLocator {
        DatabaseLocator {
            shared: self.shared().clone(),
        }
    }
}

impl AssetLocator for DatabaseLocator {
    fn name(&self) -> &str {
        "assetdb"
    }

    fn locate(&self, guid: Guid, location: &mut AssetLocation) -> bool {
        let txn = self.shared.db.read();
        let Ok(record) = self.shared.db.get_asset(&txn, guid) else {
            return false;
        };

        let artifacts = self.shared.db.artifacts_of(&txn, guid);
        if artifacts.is_empty() {
            return false;
        }

        location.asset_type = record.main_artifact.type_hash;

        let main = record.main_artifact;
        let ordered = artifacts
            .iter()
            .filter(|artifact| artifact.content_hash == main.content_hash)
            .chain(artifacts.iter().filter(|artifact| artifact.content_hash != main.content_hash));
        for artifact in ordered {
            let stream = StreamInfo {
                asset_type: artifact.type_hash,
                offset: 0,
                source: StreamSource::File(self.shared.db.artifact_path(artifact.content_hash)),
            };
            if location.streams.try_push(stream).is_err() {
                warn!("Asset {} has more artifact streams than a location can carry", guid);
                break;
            }
        }

        true
    }
}
