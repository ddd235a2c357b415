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
    fmt::{self, Display},
    hash::Hasher,
    io::{self, Read, Write},
    mem,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use siphasher::sip128::Hasher128;
use uuid::Uuid;

use crate::{BinaryDeserialization, BinarySerialization};

/// Stable identity of a logical asset. Minted once when a source is first
/// seen and preserved across renames through the sidecar file.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid(Uuid);

impl Guid {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::try_parse(value).ok().map(Self)
    }
}

impl Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl BinarySerialization for Guid {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(self.0.as_bytes())
    }
}

impl BinaryDeserialization for Guid {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        let mut buf = [0u8; 16];
        r.read_exact(&mut buf)?;

        Ok(Self(Uuid::from_bytes(buf)))
    }
}

/// 128-bit fingerprint of asset content. Artifacts are addressed and
/// deduplicated by this value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(u128);

impl ContentHash {
    pub fn new(value: u128) -> Self {
        Self(value)
    }

    pub fn as_u128(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn parse(value: &str) -> Option<Self> {
        u128::from_str_radix(value, 16).ok().map(Self)
    }

    /// Byte representation that sorts the same way the numeric value does.
    pub fn to_key_bytes(&self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_key_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl BinarySerialization for ContentHash {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u128::<LittleEndian>(self.0)
    }
}

impl BinaryDeserialization for ContentHash {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        Ok(Self(r.read_u128::<LittleEndian>()?))
    }
}

/// Stable reference to a reflected type: a 32-bit hash of the type's full
/// name plus its size and alignment. The pipeline never looks inside the
/// types it routes, it only matches refs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef {
    pub hash: u32,
    pub size: u32,
    pub align: u32,
}

impl TypeRef {
    pub fn of<T: 'static>() -> Self {
        Self {
            hash: fingerprint32(std::any::type_name::<T>().as_bytes()),
            size: mem::size_of::<T>() as u32,
            align: mem::align_of::<T>() as u32,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_none(&self) -> bool {
        self.hash == 0
    }
}

impl Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.hash)
    }
}

impl BinarySerialization for TypeRef {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.hash)?;
        w.write_u32::<LittleEndian>(self.size)?;
        w.write_u32::<LittleEndian>(self.align)?;

        Ok(())
    }
}

impl BinaryDeserialization for TypeRef {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            hash: r.read_u32::<LittleEndian>()?,
            size: r.read_u32::<LittleEndian>()?,
            align: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// 32-bit fingerprint for ordering keys (dependency cache, extension and
/// name lookups).
pub fn fingerprint32(bytes: &[u8]) -> u32 {
    let mut hasher = siphasher::sip::SipHasher::default();
    hasher.write(bytes);
    let hash = hasher.finish();

    (hash ^ (hash >> 32)) as u32
}

/// 128-bit fingerprint for content addressing.
pub fn fingerprint128(bytes: &[u8]) -> ContentHash {
    let mut hasher = siphasher::sip128::SipHasher::default();
    hasher.write(bytes);

    ContentHash::new(hasher.finish128().as_u128())
}

#[cfg(test)]
mod test {
    use crate::{fingerprint128, fingerprint32, ContentHash, Guid, TypeRef};

    #[test]
    fn guid_roundtrip() {
        let guid = Guid::generate();
        let text = guid.to_string();
        assert_eq!(32, text.len());
        assert_eq!(Some(guid), Guid::parse(&text));
    }

    #[test]
    fn guids_are_unique() {
        assert_ne!(Guid::generate(), Guid::generate());
    }

    #[test]
    fn content_hash_text() {
        let hash = ContentHash::new(0xF00D);
        let text = hash.to_string();
        assert_eq!(32, text.len());
        assert_eq!(Some(hash), ContentHash::parse(&text));
    }

    #[test]
    fn content_hash_key_order() {
        let a = ContentHash::new(1);
        let b = ContentHash::new(0x0100);
        assert!(a.to_key_bytes() < b.to_key_bytes());
    }

    #[test]
    fn fingerprints_are_deterministic() {
        assert_eq!(fingerprint32(b"images/logo.png"), fingerprint32(b"images/logo.png"));
        assert_eq!(fingerprint128(b"payload"), fingerprint128(b"payload"));
        assert_ne!(fingerprint128(b"payload"), fingerprint128(b"payload2"));
    }

    #[test]
    fn type_refs_differ_by_type() {
        let a = TypeRef::of::<u32>();
        let b = TypeRef::of::<u64>();
        assert_ne!(a, b);
        assert_eq!(4, a.size);
        assert_eq!(8, b.size);
    }
}
