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
    fs::{self, File},
    io::BufReader,
    path::{Path, PathBuf},
};

use quarry_assetdb::OptionsValue;
use quarry_common::{ContentHash, Guid};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{file_mtime, Error};

pub const SIDECAR_EXT: &str = "asset";

/// The `.asset` metadata document kept next to each source file. This is
/// the user-editable mirror of the asset record; the GUID stored here is
/// what keeps identity stable across renames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sidecar {
    pub guid: Guid,
    pub source: String,
    pub options: OptionsValue,
    pub name: Option<String>,
    pub is_directory: bool,
    pub artifacts: Vec<ContentHash>,
    pub source_hash: ContentHash,
}

#[derive(Serialize, Deserialize)]
struct SidecarDoc {
    guid: String,
    source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    options: Option<serde_json::Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default)]
    is_directory: bool,
    #[serde(default)]
    artifacts: Vec<String>,
    #[serde(default)]
    source_hash: String,
}

impl Sidecar {
    /// Reads and validates a sidecar document. Structural problems are
    /// reported as errors, never papered over with defaults.
    pub fn read(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        let doc: SidecarDoc =
            serde_json::from_reader(BufReader::new(file)).map_err(|err| Error::InvalidSidecar {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;

        let guid = Guid::parse(&doc.guid)
            .filter(|guid| !guid.is_nil())
            .ok_or_else(|| invalid(path, "bad guid"))?;

        let options = match doc.options {
            None => OptionsValue::none(),
            Some(map) => {
                let type_hash = map
                    .get("__type")
                    .and_then(|value| value.as_str())
                    .and_then(|text| u32::from_str_radix(text, 16).ok())
                    .ok_or_else(|| invalid(path, "options are missing a valid __type tag"))?;
                let json = Value::Object(map).to_string();
                OptionsValue::new(type_hash, json)
            }
        };

        let mut artifacts = Vec::with_capacity(doc.artifacts.len());
        for text in &doc.artifacts {
            artifacts.push(ContentHash::parse(text).ok_or_else(|| invalid(path, "bad artifact hash"))?);
        }

        let source_hash = if doc.source_hash.is_empty() {
            ContentHash::default()
        } else {
            ContentHash::parse(&doc.source_hash).ok_or_else(|| invalid(path, "bad source hash"))?
        };

        Ok(Self {
            guid,
            source: doc.source,
            options,
            name: doc.name,
            is_directory: doc.is_directory,
            artifacts,
            source_hash,
        })
    }

    /// Writes the document and returns the resulting file mtime, which is
    /// the timestamp the asset record stores.
    pub fn write(&self, path: &Path) -> Result<u64, Error> {
        let options = if self.options.is_none() {
            None
        } else {
            let map = serde_json::from_str::<serde_json::Map<String, Value>>(&self.options.json)
                .map_err(|err| Error::InvalidSidecar {
                    path: path.to_path_buf(),
                    reason: err.to_string(),
                })?;
            Some(map)
        };

        let doc = SidecarDoc {
            guid: self.guid.to_string(),
            source: self.source.replace('\\', "/"),
            options,
            name: self.name.clone(),
            is_directory: self.is_directory,
            artifacts: self.artifacts.iter().map(|hash| hash.to_string()).collect(),
            source_hash: if self.source_hash.is_zero() {
                String::new()
            } else {
                self.source_hash.to_string()
            },
        };

        let text = serde_json::to_string_pretty(&doc).map_err(|err| Error::InvalidSidecar {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        fs::write(path, text)?;

        Ok(file_mtime(path)?)
    }
}

fn invalid(path: &Path, reason: &str) -> Error {
    Error::InvalidSidecar {
        path: path.to_path_buf(),
        reason: reason.to_owned(),
    }
}

pub fn is_sidecar_path(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(SIDECAR_EXT)
}

/// `foo.png` -> `foo.png.asset`.
pub fn sidecar_path_for(source: &Path) -> PathBuf {
    let mut os = source.as_os_str().to_owned();
    os.push(".");
    os.push(SIDECAR_EXT);

    PathBuf::from(os)
}
