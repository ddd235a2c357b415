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

use std::io::{self, Read, Write};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use quarry_common::{BinaryDeserialization, BinarySerialization, ContentHash, Guid, TypeRef};

/// One compiled output of an asset, addressed by the hash of its bytes
/// and typed so the runtime can route it to a loader.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AssetArtifact {
    pub content_hash: ContentHash,
    pub type_hash: TypeRef,
}

pub const ARTIFACT_KEY_LEN: usize = 28;

impl AssetArtifact {
    pub fn new(content_hash: ContentHash, type_hash: TypeRef) -> Self {
        Self {
            content_hash,
            type_hash,
        }
    }

    /// Key encoding for the artifact tables: content hash first so byte
    /// order equals content-hash order.
    pub fn to_key_bytes(&self) -> [u8; ARTIFACT_KEY_LEN] {
        let mut key = [0u8; ARTIFACT_KEY_LEN];
        key[..16].copy_from_slice(&self.content_hash.to_key_bytes());
        key[16..20].copy_from_slice(&self.type_hash.hash.to_be_bytes());
        key[20..24].copy_from_slice(&self.type_hash.size.to_be_bytes());
        key[24..28].copy_from_slice(&self.type_hash.align.to_be_bytes());
        key
    }

    pub fn from_key_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != ARTIFACT_KEY_LEN {
            return None;
        }
        let mut hash = [0u8; 16];
        hash.copy_from_slice(&bytes[..16]);
        let mut r = &bytes[16..];

        Some(Self {
            content_hash: ContentHash::from_key_bytes(hash),
            type_hash: TypeRef {
                hash: r.read_u32::<BigEndian>().ok()?,
                size: r.read_u32::<BigEndian>().ok()?,
                align: r.read_u32::<BigEndian>().ok()?,
            },
        })
    }
}

impl BinarySerialization for AssetArtifact {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        self.content_hash.serialize(w)?;
        self.type_hash.serialize(w)?;

        Ok(())
    }
}

impl BinaryDeserialization for AssetArtifact {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            content_hash: ContentHash::deserialize(r)?,
            type_hash: TypeRef::deserialize(r)?,
        })
    }
}

/// Compile options as stored next to an asset: a type tag plus the
/// serialized document the owning compiler knows how to read. The
/// pipeline itself never interprets the payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OptionsValue {
    pub type_hash: u32,
    pub json: String,
}

impl OptionsValue {
    pub fn new(type_hash: u32, json: impl Into<String>) -> Self {
        Self {
            type_hash,
            json: json.into(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_none(&self) -> bool {
        self.type_hash == 0 && self.json.is_empty()
    }

    /// Bytes that go into the source content hash.
    pub fn hash_bytes(&self) -> &[u8] {
        self.json.as_bytes()
    }
}

impl BinarySerialization for OptionsValue {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.type_hash)?;
        self.json.serialize(w)?;

        Ok(())
    }
}

impl BinaryDeserialization for OptionsValue {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            type_hash: r.read_u32::<LittleEndian>()?,
            json: String::deserialize(r)?,
        })
    }
}

/// The canonical per-asset row. Everything the pipeline knows about one
/// imported source, minus the artifact set which lives in its own table.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    pub guid: Guid,
    pub uri: String,
    pub name: Option<String>,
    pub is_directory: bool,
    pub main_artifact: AssetArtifact,
    pub options: OptionsValue,
    pub src_timestamp: u64,
    pub sidecar_timestamp: u64,
    pub source_hash: ContentHash,
}

impl BinarySerialization for AssetRecord {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        self.guid.serialize(w)?;
        self.uri.serialize(w)?;
        self.name.serialize(w)?;
        self.is_directory.serialize(w)?;
        self.main_artifact.serialize(w)?;
        self.options.serialize(w)?;
        w.write_u64::<LittleEndian>(self.src_timestamp)?;
        w.write_u64::<LittleEndian>(self.sidecar_timestamp)?;
        self.source_hash.serialize(w)?;

        Ok(())
    }
}

impl BinaryDeserialization for AssetRecord {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            guid: Guid::deserialize(r)?,
            uri: String::deserialize(r)?,
            name: Option::<String>::deserialize(r)?,
            is_directory: bool::deserialize(r)?,
            main_artifact: AssetArtifact::deserialize(r)?,
            options: OptionsValue::deserialize(r)?,
            src_timestamp: r.read_u64::<LittleEndian>()?,
            sidecar_timestamp: r.read_u64::<LittleEndian>()?,
            source_hash: ContentHash::deserialize(r)?,
        })
    }
}

#[cfg(test)]
mod test {
    use std::io::Cursor;

    use quarry_common::{BinaryDeserialization, BinarySerialization, ContentHash, Guid, TypeRef};

    use super::{AssetArtifact, AssetRecord, OptionsValue};

    #[test]
    fn artifact_key_roundtrip() {
        let artifact = AssetArtifact::new(ContentHash::new(0xABCD), TypeRef::of::<u32>());
        let key = artifact.to_key_bytes();
        assert_eq!(Some(artifact), AssetArtifact::from_key_bytes(&key));
        assert_eq!(None, AssetArtifact::from_key_bytes(&key[1..]));
    }

    #[test]
    fn artifact_keys_order_by_content_hash() {
        let small = AssetArtifact::new(ContentHash::new(1), TypeRef::of::<u64>());
        let large = AssetArtifact::new(ContentHash::new(0x0100_0000), TypeRef::of::<u8>());
        assert!(small.to_key_bytes() < large.to_key_bytes());
    }

    #[test]
    fn record_roundtrip() {
        let record = AssetRecord {
            guid: Guid::generate(),
            uri: "images/logo.png".to_owned(),
            name: Some("logo".to_owned()),
            is_directory: false,
            main_artifact: AssetArtifact::new(ContentHash::new(42), TypeRef::of::<u32>()),
            options: OptionsValue::new(7, "{\"quality\":50}"),
            src_timestamp: 100,
            sidecar_timestamp: 200,
            source_hash: ContentHash::new(0xF00D),
        };

        let mut buffer = Vec::new();
        record.serialize(&mut buffer).unwrap();
        let decoded = AssetRecord::deserialize(&mut Cursor::new(buffer)).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn empty_options_roundtrip() {
        let options = OptionsValue::none();
        assert!(options.is_none());
        let mut buffer = Vec::new();
        options.serialize(&mut buffer).unwrap();
        assert_eq!(options, OptionsValue::deserialize(&mut Cursor::new(buffer)).unwrap());
    }
}
