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
    hash::Hash,
    io::{self, Read, Write},
    path::PathBuf,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use uuid::Uuid;

pub trait BinaryDeserialization: Sized {
    fn deserialize(r: &mut impl Read) -> io::Result<Self>;
}

pub trait BinarySerialization {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()>;
}

impl BinarySerialization for u8 {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u8(*self)
    }
}

impl BinaryDeserialization for u8 {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        r.read_u8()
    }
}

impl BinarySerialization for bool {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u8(*self as u8)
    }
}

impl BinaryDeserialization for bool {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        Ok(r.read_u8()? != 0)
    }
}

impl BinarySerialization for u32 {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(*self)
    }
}

impl BinaryDeserialization for u32 {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        r.read_u32::<LittleEndian>()
    }
}

impl BinarySerialization for u64 {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u64::<LittleEndian>(*self)
    }
}

impl BinaryDeserialization for u64 {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        r.read_u64::<LittleEndian>()
    }
}

impl BinarySerialization for u128 {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u128::<LittleEndian>(*self)
    }
}

impl BinaryDeserialization for u128 {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        r.read_u128::<LittleEndian>()
    }
}

impl BinarySerialization for String {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        let bytes = self.as_bytes();
        if bytes.len() >= u16::MAX as usize {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "String is too long"));
        }
        w.write_u16::<LittleEndian>(bytes.len() as _)?;
        w.write_all(bytes)?;

        Ok(())
    }
}

impl BinaryDeserialization for String {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        let count = r.read_u16::<LittleEndian>()?;
        let mut buffer = vec![0; count as _];
        r.read_exact(&mut buffer)?;

        String::from_utf8(buffer)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "UTF8 conversion failed"))
    }
}

impl BinarySerialization for Option<String> {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        match self {
            Some(string) => string.serialize(w),
            None => w.write_u16::<LittleEndian>(u16::MAX),
        }
    }
}

impl BinaryDeserialization for Option<String> {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        let count = r.read_u16::<LittleEndian>()?;
        if count != u16::MAX {
            let mut buffer = vec![0; count as _];
            r.read_exact(&mut buffer)?;

            Ok(Some(String::from_utf8(buffer).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "UTF8 conversion failed")
            })?))
        } else {
            Ok(None)
        }
    }
}

impl BinarySerialization for PathBuf {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        if let Some(str) = self.to_str() {
            str.to_owned().serialize(w)
        } else {
            "".to_owned().serialize(w)
        }
    }
}

impl BinaryDeserialization for PathBuf {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        let path = String::deserialize(r)?;

        Ok(PathBuf::from(path))
    }
}

impl BinarySerialization for Uuid {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(self.as_bytes())
    }
}

impl BinaryDeserialization for Uuid {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        let mut buf = [0u8; 16];
        r.read_exact(&mut buf)?;

        Ok(Uuid::from_bytes(buf))
    }
}

impl<T: BinarySerialization> BinarySerialization for Vec<T> {
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.len() as _)?;
        for item in self {
            item.serialize(w)?;
        }

        Ok(())
    }
}

impl<T: BinaryDeserialization> BinaryDeserialization for Vec<T> {
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        let count = r.read_u32::<LittleEndian>()?;
        let mut result = Vec::with_capacity(count as _);
        for _ in 0..count {
            result.push(T::deserialize(r)?);
        }

        Ok(result)
    }
}

impl<K, V> BinarySerialization for HashMap<K, V>
where
    K: BinarySerialization,
    V: BinarySerialization,
{
    fn serialize(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_u32::<LittleEndian>(self.len() as _)?;
        for (key, value) in self {
            key.serialize(w)?;
            value.serialize(w)?;
        }

        Ok(())
    }
}

impl<K, V> BinaryDeserialization for HashMap<K, V>
where
    K: BinaryDeserialization + Eq + Hash,
    V: BinaryDeserialization,
{
    fn deserialize(r: &mut impl Read) -> io::Result<Self> {
        let count = r.read_u32::<LittleEndian>()?;
        let mut result = HashMap::with_capacity(count as _);
        for _ in 0..count {
            let key = K::deserialize(r)?;
            let value = V::deserialize(r)?;
            result.insert(key, value);
        }

        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashMap, io::Cursor};

    use uuid::Uuid;

    use crate::{BinaryDeserialization, BinarySerialization};

    fn roundtrip<T: BinarySerialization + BinaryDeserialization>(value: &T) -> T {
        let mut buffer = Vec::new();
        value.serialize(&mut buffer).unwrap();
        T::deserialize(&mut Cursor::new(buffer)).unwrap()
    }

    #[test]
    fn strings() {
        assert_eq!("hello".to_owned(), roundtrip(&"hello".to_owned()));
        assert_eq!("".to_owned(), roundtrip(&"".to_owned()));
        assert_eq!(None, roundtrip(&Option::<String>::None));
        assert_eq!(Some("x".to_owned()), roundtrip(&Some("x".to_owned())));
    }

    #[test]
    fn numbers() {
        assert_eq!(42u32, roundtrip(&42u32));
        assert_eq!(u64::MAX, roundtrip(&u64::MAX));
        assert_eq!(0xF00D_F00Du128 << 64, roundtrip(&(0xF00D_F00Du128 << 64)));
    }

    #[test]
    fn uuids() {
        let uuid = Uuid::new_v4();
        assert_eq!(uuid, roundtrip(&uuid));
    }

    #[test]
    fn collections() {
        let list = vec!["a".to_owned(), "b".to_owned()];
        assert_eq!(list, roundtrip(&list));

        let mut map = HashMap::new();
        map.insert(1u32, "one".to_owned());
        map.insert(2u32, "two".to_owned());
        assert_eq!(map, roundtrip(&map));
    }
}
