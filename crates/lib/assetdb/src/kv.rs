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
    collections::BTreeMap,
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use four_cc::FourCC;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::DbError;

const MAGICK: FourCC = FourCC(*b"qadb");
const VERSION: u32 = 1;

const EMPTY_VALUES: &[Vec<u8>] = &[];

/// The six logical tables of the asset database. Keys and values are raw
/// bytes ordered by byte comparison, so every encoder that feeds a table
/// must produce bytes whose order matches the intended key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableId {
    GuidToAsset,
    GuidToDependencies,
    GuidToArtifact,
    ArtifactToGuid,
    PathToGuid,
    TypeToGuid,
}

impl TableId {
    pub const COUNT: usize = 6;

    pub const ALL: [TableId; TableId::COUNT] = [
        TableId::GuidToAsset,
        TableId::GuidToDependencies,
        TableId::GuidToArtifact,
        TableId::ArtifactToGuid,
        TableId::PathToGuid,
        TableId::TypeToGuid,
    ];

    /// Multi-value tables keep a sorted, deduplicated set of values per
    /// key. The rest hold exactly one value.
    pub fn is_multi_value(self) -> bool {
        matches!(
            self,
            TableId::GuidToDependencies
                | TableId::GuidToArtifact
                | TableId::ArtifactToGuid
                | TableId::TypeToGuid
        )
    }

    fn index(self) -> usize {
        self as usize
    }
}

type Rows = BTreeMap<Vec<u8>, Vec<Vec<u8>>>;

#[derive(Debug, Default, Clone)]
struct Snapshot {
    tables: [Rows; TableId::COUNT],
}

/// Read access shared by read and write transactions.
pub trait Txn {
    fn get(&self, table: TableId, key: &[u8]) -> Option<&[u8]>;

    fn get_all(&self, table: TableId, key: &[u8]) -> &[Vec<u8>];

    /// First row whose key starts with `prefix`, in key order.
    fn first_with_prefix(&self, table: TableId, prefix: &[u8]) -> Option<(&[u8], &[Vec<u8>])>;

    /// Every row of a table, in key byte order.
    fn rows(&self, table: TableId) -> Vec<(&[u8], &[Vec<u8>])>;

    fn contains(&self, table: TableId, key: &[u8]) -> bool {
        !self.get_all(table, key).is_empty()
    }
}

fn rows_get<'a>(rows: &'a Rows, key: &[u8]) -> Option<&'a [u8]> {
    rows.get(key).and_then(|values| values.first()).map(|v| v.as_slice())
}

fn rows_get_all<'a>(rows: &'a Rows, key: &[u8]) -> &'a [Vec<u8>] {
    rows.get(key).map(|values| values.as_slice()).unwrap_or(EMPTY_VALUES)
}

fn rows_first_with_prefix<'a>(rows: &'a Rows, prefix: &[u8]) -> Option<(&'a [u8], &'a [Vec<u8>])> {
    rows.range(prefix.to_vec()..)
        .next()
        .filter(|(key, _)| key.starts_with(prefix))
        .map(|(key, values)| (key.as_slice(), values.as_slice()))
}

/// Embedded ordered KV store behind the asset database: six named tables
/// in one file, snapshot-isolated readers and a single writer.
///
/// A write transaction works on a private copy and publishes it as the
/// new snapshot on commit, after the file has been atomically replaced.
/// Readers keep whatever snapshot was current when they began.
pub struct Store {
    path: PathBuf,
    snapshot: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl Store {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DbError> {
        let path = path.into();
        let snapshot = if path.exists() {
            let mut r = BufReader::new(File::open(&path)?);
            load_snapshot(&mut r)?
        } else {
            Snapshot::default()
        };

        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(snapshot)),
            writer: Mutex::new(()),
        })
    }

    pub fn location(&self) -> &Path {
        &self.path
    }

    pub fn begin_read(&self) -> ReadTxn {
        ReadTxn {
            snapshot: self.snapshot.read().clone(),
        }
    }

    pub fn begin_write(&self) -> WriteTxn {
        let guard = self.writer.lock();
        let working = (**self.snapshot.read()).clone();

        WriteTxn {
            store: self,
            _guard: guard,
            working,
        }
    }
}

/// Snapshot of the store at the time the transaction began. Concurrent
/// commits do not affect it.
pub struct ReadTxn {
    snapshot: Arc<Snapshot>,
}

impl ReadTxn {
    /// Rows of a table in key byte order.
    pub fn iter(&self, table: TableId) -> impl Iterator<Item = (&[u8], &[Vec<u8>])> {
        self.snapshot.tables[table.index()]
            .iter()
            .map(|(key, values)| (key.as_slice(), values.as_slice()))
    }
}

impl Txn for ReadTxn {
    fn get(&self, table: TableId, key: &[u8]) -> Option<&[u8]> {
        rows_get(&self.snapshot.tables[table.index()], key)
    }

    fn get_all(&self, table: TableId, key: &[u8]) -> &[Vec<u8>] {
        rows_get_all(&self.snapshot.tables[table.index()], key)
    }

    fn first_with_prefix(&self, table: TableId, prefix: &[u8]) -> Option<(&[u8], &[Vec<u8>])> {
        rows_first_with_prefix(&self.snapshot.tables[table.index()], prefix)
    }

    fn rows(&self, table: TableId) -> Vec<(&[u8], &[Vec<u8>])> {
        self.iter(table).collect()
    }
}

/// Exclusive write transaction. Mutations stay private until [`commit`];
/// dropping the transaction without committing aborts it.
///
/// [`commit`]: WriteTxn::commit
pub struct WriteTxn<'a> {
    store: &'a Store,
    _guard: MutexGuard<'a, ()>,
    working: Snapshot,
}

impl<'a> WriteTxn<'a> {
    /// Rows of a table in key byte order, including uncommitted changes.
    pub fn iter(&self, table: TableId) -> impl Iterator<Item = (&[u8], &[Vec<u8>])> {
        self.working.tables[table.index()]
            .iter()
            .map(|(key, values)| (key.as_slice(), values.as_slice()))
    }

    pub fn put(&mut self, table: TableId, key: &[u8], value: &[u8]) {
        let rows = &mut self.working.tables[table.index()];
        if table.is_multi_value() {
            let values = rows.entry(key.to_vec()).or_default();
            if let Err(slot) = values.binary_search_by(|existing| existing.as_slice().cmp(value)) {
                values.insert(slot, value.to_vec());
            }
        } else {
            rows.insert(key.to_vec(), vec![value.to_vec()]);
        }
    }

    /// Removes a whole row, values and all.
    pub fn delete(&mut self, table: TableId, key: &[u8]) -> bool {
        self.working.tables[table.index()].remove(key).is_some()
    }

    /// Removes a single value from a multi-value row; the row goes away
    /// with its last value.
    pub fn delete_value(&mut self, table: TableId, key: &[u8], value: &[u8]) -> bool {
        let rows = &mut self.working.tables[table.index()];
        let Some(values) = rows.get_mut(key) else {
            return false;
        };
        let Ok(slot) = values.binary_search_by(|existing| existing.as_slice().cmp(value)) else {
            return false;
        };
        values.remove(slot);
        if values.is_empty() {
            rows.remove(key);
        }

        true
    }

    /// Persists the working copy and publishes it as the new snapshot.
    /// Nothing is visible to readers until both steps succeed.
    pub fn commit(self) -> Result<(), DbError> {
        let tmp = self.store.path.with_extension("tmp");
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            save_snapshot(&mut w, &self.working)?;
            w.flush()?;
        }
        fs::rename(&tmp, &self.store.path)?;

        *self.store.snapshot.write() = Arc::new(self.working);

        Ok(())
    }
}

impl Txn for WriteTxn<'_> {
    fn get(&self, table: TableId, key: &[u8]) -> Option<&[u8]> {
        rows_get(&self.working.tables[table.index()], key)
    }

    fn get_all(&self, table: TableId, key: &[u8]) -> &[Vec<u8>] {
        rows_get_all(&self.working.tables[table.index()], key)
    }

    fn first_with_prefix(&self, table: TableId, prefix: &[u8]) -> Option<(&[u8], &[Vec<u8>])> {
        rows_first_with_prefix(&self.working.tables[table.index()], prefix)
    }

    fn rows(&self, table: TableId) -> Vec<(&[u8], &[Vec<u8>])> {
        self.iter(table).collect()
    }
}

fn load_snapshot(r: &mut impl Read) -> Result<Snapshot, DbError> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if FourCC(magic) != MAGICK {
        return Err(DbError::InvalidFormat);
    }
    if r.read_u32::<LittleEndian>()? > VERSION {
        return Err(DbError::InvalidVersion);
    }

    let mut snapshot = Snapshot::default();
    for table in &mut snapshot.tables {
        let row_count = r.read_u32::<LittleEndian>()?;
        for _ in 0..row_count {
            let key = read_bytes(r)?;
            let value_count = r.read_u32::<LittleEndian>()?;
            let mut values = Vec::with_capacity(value_count as usize);
            for _ in 0..value_count {
                values.push(read_bytes(r)?);
            }
            table.insert(key, values);
        }
    }

    Ok(snapshot)
}

fn save_snapshot(w: &mut impl Write, snapshot: &Snapshot) -> Result<(), DbError> {
    w.write_all(&MAGICK.0)?;
    w.write_u32::<LittleEndian>(VERSION)?;
    for table in &snapshot.tables {
        w.write_u32::<LittleEndian>(table.len() as u32)?;
        for (key, values) in table {
            write_bytes(w, key)?;
            w.write_u32::<LittleEndian>(values.len() as u32)?;
            for value in values {
                write_bytes(w, value)?;
            }
        }
    }

    Ok(())
}

fn read_bytes(r: &mut impl Read) -> Result<Vec<u8>, DbError> {
    let len = r.read_u32::<LittleEndian>()?;
    let mut buffer = vec![0u8; len as usize];
    r.read_exact(&mut buffer)?;

    Ok(buffer)
}

fn write_bytes(w: &mut impl Write, bytes: &[u8]) -> Result<(), DbError> {
    w.write_u32::<LittleEndian>(bytes.len() as u32)?;
    w.write_all(bytes)?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::{Store, TableId, Txn};

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_delete() {
        let (_dir, store) = temp_store();
        let mut txn = store.begin_write();
        txn.put(TableId::PathToGuid, b"images/logo.png", b"guid");
        assert_eq!(Some(b"guid".as_slice()), txn.get(TableId::PathToGuid, b"images/logo.png"));
        assert!(txn.delete(TableId::PathToGuid, b"images/logo.png"));
        assert_eq!(None, txn.get(TableId::PathToGuid, b"images/logo.png"));
    }

    #[test]
    fn unique_table_replaces() {
        let (_dir, store) = temp_store();
        let mut txn = store.begin_write();
        txn.put(TableId::PathToGuid, b"a", b"one");
        txn.put(TableId::PathToGuid, b"a", b"two");
        assert_eq!(Some(b"two".as_slice()), txn.get(TableId::PathToGuid, b"a"));
        assert_eq!(1, txn.get_all(TableId::PathToGuid, b"a").len());
    }

    #[test]
    fn multi_value_sorted_dedup() {
        let (_dir, store) = temp_store();
        let mut txn = store.begin_write();
        txn.put(TableId::TypeToGuid, b"t", b"ccc");
        txn.put(TableId::TypeToGuid, b"t", b"aaa");
        txn.put(TableId::TypeToGuid, b"t", b"bbb");
        txn.put(TableId::TypeToGuid, b"t", b"aaa");
        let values = txn.get_all(TableId::TypeToGuid, b"t");
        assert_eq!(3, values.len());
        assert_eq!(b"aaa".as_slice(), values[0].as_slice());
        assert_eq!(b"bbb".as_slice(), values[1].as_slice());
        assert_eq!(b"ccc".as_slice(), values[2].as_slice());
    }

    #[test]
    fn delete_value_drops_empty_row() {
        let (_dir, store) = temp_store();
        let mut txn = store.begin_write();
        txn.put(TableId::TypeToGuid, b"t", b"aaa");
        txn.put(TableId::TypeToGuid, b"t", b"bbb");
        assert!(txn.delete_value(TableId::TypeToGuid, b"t", b"aaa"));
        assert!(!txn.delete_value(TableId::TypeToGuid, b"t", b"aaa"));
        assert!(txn.contains(TableId::TypeToGuid, b"t"));
        assert!(txn.delete_value(TableId::TypeToGuid, b"t", b"bbb"));
        assert!(!txn.contains(TableId::TypeToGuid, b"t"));
    }

    #[test]
    fn snapshot_isolation() {
        let (_dir, store) = temp_store();

        let mut txn = store.begin_write();
        txn.put(TableId::PathToGuid, b"a", b"one");
        txn.commit().unwrap();

        let before = store.begin_read();
        let mut txn = store.begin_write();
        txn.put(TableId::PathToGuid, b"a", b"two");

        // the writer sees its own change, the reader does not
        assert_eq!(Some(b"two".as_slice()), txn.get(TableId::PathToGuid, b"a"));
        assert_eq!(Some(b"one".as_slice()), before.get(TableId::PathToGuid, b"a"));

        txn.commit().unwrap();

        // a reader opened before the commit keeps the old state
        assert_eq!(Some(b"one".as_slice()), before.get(TableId::PathToGuid, b"a"));
        let after = store.begin_read();
        assert_eq!(Some(b"two".as_slice()), after.get(TableId::PathToGuid, b"a"));
    }

    #[test]
    fn drop_without_commit_aborts() {
        let (_dir, store) = temp_store();
        {
            let mut txn = store.begin_write();
            txn.put(TableId::PathToGuid, b"a", b"one");
        }
        let txn = store.begin_read();
        assert_eq!(None, txn.get(TableId::PathToGuid, b"a"));
    }

    #[test]
    fn reopen_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = Store::open(&path).unwrap();
            let mut txn = store.begin_write();
            txn.put(TableId::PathToGuid, b"a", b"one");
            txn.put(TableId::TypeToGuid, b"t", b"bbb");
            txn.put(TableId::TypeToGuid, b"t", b"aaa");
            txn.commit().unwrap();
        }

        let store = Store::open(&path).unwrap();
        let txn = store.begin_read();
        assert_eq!(Some(b"one".as_slice()), txn.get(TableId::PathToGuid, b"a"));
        assert_eq!(2, txn.get_all(TableId::TypeToGuid, b"t").len());
        assert_eq!(b"aaa".as_slice(), txn.get_all(TableId::TypeToGuid, b"t")[0].as_slice());
    }

    #[test]
    fn rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        std::fs::write(&path, b"not a database at all").unwrap();
        assert!(matches!(Store::open(&path), Err(crate::DbError::InvalidFormat)));
    }

    #[test]
    fn iteration_is_key_ordered() {
        let (_dir, store) = temp_store();
        let mut txn = store.begin_write();
        txn.put(TableId::PathToGuid, b"b", b"2");
        txn.put(TableId::PathToGuid, b"a", b"1");
        txn.put(TableId::PathToGuid, b"c", b"3");
        txn.commit().unwrap();

        let txn = store.begin_read();
        let keys = txn
            .iter(TableId::PathToGuid)
            .map(|(key, _)| key.to_vec())
            .collect::<Vec<_>>();
        assert_eq!(vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()], keys);
    }

    #[test]
    fn prefix_scan_finds_first_row() {
        let (_dir, store) = temp_store();
        let mut txn = store.begin_write();
        txn.put(TableId::ArtifactToGuid, b"aaaa-suffix1", b"g1");
        txn.put(TableId::ArtifactToGuid, b"bbbb-suffix2", b"g2");
        let (key, values) = txn.first_with_prefix(TableId::ArtifactToGuid, b"bbbb").unwrap();
        assert_eq!(b"bbbb-suffix2".as_slice(), key);
        assert_eq!(1, values.len());
        assert!(txn.first_with_prefix(TableId::ArtifactToGuid, b"cccc").is_none());
    }
}
