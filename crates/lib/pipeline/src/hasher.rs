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

use std::{fs::File, hash::Hasher, io, io::Read, path::Path};

use quarry_common::ContentHash;
use siphasher::sip128::Hasher128;

use crate::generic_path;

const HASH_BLOCK_SIZE: usize = 4096;

/// Fingerprint of `(source bytes, serialized compile options)`. Files are
/// streamed block by block; directories hash their generic path instead
/// of any contents.
pub fn content_hash(path: &Path, options: Option<&[u8]>) -> io::Result<ContentHash> {
    let mut hasher = siphasher::sip128::SipHasher::default();

    if path.is_file() {
        let mut file = File::open(path)?;
        let mut buffer = [0u8; HASH_BLOCK_SIZE];
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.write(&buffer[..read]);
        }
    } else {
        hasher.write(generic_path(path).as_bytes());
    }

    if let Some(options) = options {
        hasher.write(options);
    }

    Ok(ContentHash::new(hasher.finish128().as_u128()))
}

#[cfg(test)]
mod test {
    use std::fs;

    use super::content_hash;

    #[test]
    fn deterministic_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"payload").unwrap();

        let first = content_hash(&path, None).unwrap();
        let second = content_hash(&path, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn options_change_the_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"payload").unwrap();

        let plain = content_hash(&path, None).unwrap();
        let with_options = content_hash(&path, Some(b"{\"quality\":50}")).unwrap();
        assert_ne!(plain, with_options);
    }

    #[test]
    fn content_change_changes_the_hash() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"payload").unwrap();
        let before = content_hash(&path, None).unwrap();
        fs::write(&path, b"other payload").unwrap();
        let after = content_hash(&path, None).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn directories_hash_their_path() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("textures");
        fs::create_dir(&sub).unwrap();

        let empty = content_hash(&sub, None).unwrap();
        fs::write(sub.join("a.png"), b"x").unwrap();
        let with_child = content_hash(&sub, None).unwrap();
        assert_eq!(empty, with_child);
    }
}
