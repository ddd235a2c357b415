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
    collections::HashMap,
    io::{self, Read, Write},
};

use quarry_common::{fingerprint32, BinaryDeserialization, BinarySerialization, Guid};

/// Named map from string-name hashes to GUIDs. Manifests are how higher
/// layers refer to assets by stable name instead of GUID.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Manifest {
    name: String,
    entries: HashMap<u32, Guid>,
}

impl Manifest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns false when the name is already taken.
    pub fn add(&mut self, name: &str, guid: Guid) -> bool {
        self.add_hash(fingerprint32(name.as_bytes()), guid)
    }

    pub fn add_hash(&mut self, name_hash: u32, guid: Guid) -> bool {
        if self.entries.contains_key(&name_hash) {
            return false;
        }
        self.entries.insert(name_hash, guid);

        true
    }

    pub fn get(&self, name: &str) -> Option<Guid> {
        self.get_hash(fingerprint32(name.as_bytes()))
    }

    pub fn get_hash(&self, name_hash: u32) -> Option<Guid> {
        self.entries.get(&name_hash).copied()
    }

    pub fn remove(&mut self, name: &str) -> Option<Guid> {
        self.entries.remove(&fingerprint32(name.as_bytes()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl BinarySerialization for Manifest {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        self.name.serialize(w)?;
        self.entries.serialize(w)?;

        Ok(())
    }
}

impl BinaryDeserialization for Manifest {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            name: String::deserialize(r)?,
            entries: HashMap::deserialize(r)?,
        })
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use quarry_common::{BinaryDeserialization, BinarySerialization, Guid};

    use super::Manifest;

    #[test]
    fn add_and_get() {
        let mut manifest = Manifest::new("boot");
        let guid = Guid::generate();
        assert!(manifest.add("textures/logo", guid));
        assert!(!manifest.add("textures/logo", Guid::generate()));
        assert_eq!(Some(guid), manifest.get("textures/logo"));
        assert_eq!(None, manifest.get("textures/missing"));
    }

    #[test]
    fn roundtrip() {
        let mut manifest = Manifest::new("boot");
        manifest.add("a", Guid::generate());
        manifest.add("b", Guid::generate());

        let mut buffer = Vec::new();
        manifest.serialize(&mut buffer).unwrap();
        let decoded = Manifest::deserialize(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(manifest, decoded);
    }
}
