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
    io::Cursor,
    path::{Path, PathBuf},
};

use log::error;
use quarry_common::{BinaryDeserialization, BinarySerialization, ContentHash, Guid, TypeRef};

use crate::{
    kv::{self, TableId, Txn},
    AssetArtifact, AssetRecord, DbError,
};

const ARTIFACTS_DIRNAME: &str = "Artifacts";

/// Content-addressed asset database: six KV tables plus a blob store on
/// disk, sharded by the first hash byte. All table mutations happen
/// inside a single-writer transaction; blob file effects are staged on
/// the transaction and applied at commit so an abort never leaves the
/// blob directory disagreeing with the tables.
pub struct AssetDatabase {
    store: kv::Store,
    artifacts_root: PathBuf,
}

/// Write transaction over the database. Tables are copied-on-write and
/// blob writes/deletes are queued until [`commit`].
///
/// [`commit`]: WriteTxn::commit
pub struct WriteTxn<'a> {
    kv: kv::WriteTxn<'a>,
    artifacts_root: PathBuf,
    blob_writes: Vec<(ContentHash, Vec<u8>)>,
    blob_deletes: Vec<ContentHash>,
}

impl Txn for WriteTxn<'_> {
    fn get(&self, table: TableId, key: &[u8]) -> Option<&[u8]> {
        self.kv.get(table, key)
    }

    fn get_all(&self, table: TableId, key: &[u8]) -> &[Vec<u8>] {
        self.kv.get_all(table, key)
    }

    fn first_with_prefix(&self, table: TableId, prefix: &[u8]) -> Option<(&[u8], &[Vec<u8>])> {
        self.kv.first_with_prefix(table, prefix)
    }

    fn rows(&self, table: TableId) -> Vec<(&[u8], &[Vec<u8>])> {
        self.kv.rows(table)
    }
}

impl WriteTxn<'_> {
    pub fn commit(self) -> Result<(), DbError> {
        let mut created = Vec::new();
        for (hash, bytes) in &self.blob_writes {
            let path = artifact_path(&self.artifacts_root, *hash);
            if path.exists() {
                continue;
            }
            if let Err(err) = write_blob(&path, bytes) {
                for path in &created {
                    let _ = fs::remove_file(path);
                }
                return Err(err.into());
            }
            created.push(path);
        }

        if let Err(err) = self.kv.commit() {
            for path in &created {
                let _ = fs::remove_file(path);
            }
            return Err(err);
        }

        for hash in &self.blob_deletes {
            let path = artifact_path(&self.artifacts_root, *hash);
            if path.exists() {
                if let Err(err) = fs::remove_file(&path) {
                    error!("Failed to remove artifact blob {:?} - {:?}", path, err);
                }
            }
        }

        Ok(())
    }
}

fn write_blob(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, bytes)
}

fn artifact_path(root: &Path, hash: ContentHash) -> PathBuf {
    let hex = hash.to_string();
    root.join(&hex[..2]).join(hex)
}

impl AssetDatabase {
    pub fn open(directory: &Path, name: &str) -> Result<Self, DbError> {
        if !directory.exists() {
            return Err(DbError::NotFound);
        }

        let artifacts_root = directory.join(ARTIFACTS_DIRNAME);
        if !artifacts_root.exists() {
            fs::create_dir_all(&artifacts_root)?;
        }

        Ok(Self {
            store: kv::Store::open(directory.join(name))?,
            artifacts_root,
        })
    }

    pub fn location(&self) -> &Path {
        self.store.location()
    }

    pub fn read(&self) -> kv::ReadTxn {
        self.store.begin_read()
    }

    pub fn write(&self) -> WriteTxn {
        WriteTxn {
            kv: self.store.begin_write(),
            artifacts_root: self.artifacts_root.clone(),
            blob_writes: Vec::new(),
            blob_deletes: Vec::new(),
        }
    }

    /// Writes the canonical row for an asset and keeps the path and type
    /// indices consistent with it: a renamed asset loses its old
    /// `path→guid` row, a retyped one loses its old `type→guid` row.
    pub fn put_asset(&self, txn: &mut WriteTxn, record: &AssetRecord) -> Result<(), DbError> {
        let mut buffer = Vec::new();
        record.serialize(&mut buffer)?;

        if let Ok(old) = self.get_asset(txn, record.guid) {
            if old.uri != record.uri {
                txn.kv.delete(TableId::PathToGuid, old.uri.as_bytes());
            }
            if old.main_artifact.type_hash != record.main_artifact.type_hash {
                txn.kv.delete_value(
                    TableId::TypeToGuid,
                    &old.main_artifact.type_hash.hash.to_be_bytes(),
                    record.guid.as_bytes(),
                );
            }
        }

        txn.kv.put(TableId::GuidToAsset, record.guid.as_bytes(), &buffer);
        txn.kv
            .put(TableId::PathToGuid, record.uri.as_bytes(), record.guid.as_bytes());
        txn.kv.put(
            TableId::TypeToGuid,
            &record.main_artifact.type_hash.hash.to_be_bytes(),
            record.guid.as_bytes(),
        );

        Ok(())
    }

    /// Removes the asset and every index row that references it. Each of
    /// its artifacts is dereferenced; blobs with no remaining owner are
    /// deleted at commit.
    pub fn delete_asset(&self, txn: &mut WriteTxn, guid: Guid) -> Result<(), DbError> {
        let record = self.get_asset(txn, guid)?;

        for artifact in self.artifacts_of(txn, guid) {
            self.delete_artifact(txn, guid, artifact.content_hash)?;
        }

        txn.kv.delete(TableId::PathToGuid, record.uri.as_bytes());
        txn.kv.delete_value(
            TableId::TypeToGuid,
            &record.main_artifact.type_hash.hash.to_be_bytes(),
            guid.as_bytes(),
        );
        txn.kv.delete(TableId::GuidToDependencies, guid.as_bytes());
        txn.kv.delete(TableId::GuidToAsset, guid.as_bytes());

        Ok(())
    }

    pub fn get_asset<T: Txn>(&self, txn: &T, guid: Guid) -> Result<AssetRecord, DbError> {
        let bytes = txn
            .get(TableId::GuidToAsset, guid.as_bytes())
            .ok_or(DbError::NotFound)?;

        AssetRecord::deserialize(&mut Cursor::new(bytes)).map_err(|_| DbError::Corrupted)
    }

    pub fn get_asset_by_path<T: Txn>(&self, txn: &T, uri: &str) -> Result<AssetRecord, DbError> {
        let bytes = txn
            .get(TableId::PathToGuid, uri.as_bytes())
            .ok_or(DbError::NotFound)?;
        let guid = decode_guid(bytes).ok_or(DbError::Corrupted)?;

        self.get_asset(txn, guid)
    }

    pub fn has_asset<T: Txn>(&self, txn: &T, guid: Guid) -> bool {
        txn.contains(TableId::GuidToAsset, guid.as_bytes())
    }

    /// Every asset row, in GUID byte order. Rows that fail to decode are
    /// skipped.
    pub fn assets<T: Txn>(&self, txn: &T) -> Vec<AssetRecord> {
        txn.rows(TableId::GuidToAsset)
            .iter()
            .filter_map(|(_, values)| {
                let bytes = values.first()?;
                AssetRecord::deserialize(&mut Cursor::new(bytes)).ok()
            })
            .collect()
    }

    /// First asset carrying the given friendly name.
    pub fn find_asset_by_name<T: Txn>(&self, txn: &T, name: &str) -> Result<AssetRecord, DbError> {
        self.assets(txn)
            .into_iter()
            .find(|record| record.name.as_deref() == Some(name))
            .ok_or(DbError::NotFound)
    }

    pub fn guids_by_type<T: Txn>(&self, txn: &T, type_hash: TypeRef) -> Vec<Guid> {
        txn.get_all(TableId::TypeToGuid, &type_hash.hash.to_be_bytes())
            .iter()
            .filter_map(|bytes| decode_guid(bytes))
            .collect()
    }

    /// Replaces the whole dependency set for an asset.
    pub fn set_dependencies(&self, txn: &mut WriteTxn, guid: Guid, dependencies: &[Guid]) {
        txn.kv.delete(TableId::GuidToDependencies, guid.as_bytes());
        for dependency in dependencies {
            txn.kv.put(
                TableId::GuidToDependencies,
                guid.as_bytes(),
                dependency.as_bytes(),
            );
        }
    }

    pub fn dependencies<T: Txn>(&self, txn: &T, guid: Guid) -> Vec<Guid> {
        txn.get_all(TableId::GuidToDependencies, guid.as_bytes())
            .iter()
            .filter_map(|bytes| decode_guid(bytes))
            .collect()
    }

    /// Associates an artifact with an asset and stages the blob write.
    /// Content addressing makes this idempotent: a blob that already
    /// exists on disk is left alone.
    pub fn put_artifact(&self, txn: &mut WriteTxn, guid: Guid, artifact: AssetArtifact, bytes: &[u8]) {
        let key = artifact.to_key_bytes();
        txn.kv.put(TableId::ArtifactToGuid, &key, guid.as_bytes());
        txn.kv.put(TableId::GuidToArtifact, guid.as_bytes(), &key);
        txn.blob_writes.push((artifact.content_hash, bytes.to_vec()));
    }

    /// Drops one asset's reference to an artifact. The blob itself is
    /// deleted at commit only when the last reference went away in this
    /// transaction.
    pub fn delete_artifact(
        &self,
        txn: &mut WriteTxn,
        guid: Guid,
        hash: ContentHash,
    ) -> Result<(), DbError> {
        let key = txn
            .first_with_prefix(TableId::ArtifactToGuid, &hash.to_key_bytes())
            .map(|(key, _)| key.to_vec())
            .ok_or(DbError::NotFound)?;

        if !txn.kv.delete_value(TableId::ArtifactToGuid, &key, guid.as_bytes()) {
            return Err(DbError::NotFound);
        }
        txn.kv.delete_value(TableId::GuidToArtifact, guid.as_bytes(), &key);

        if txn.kv.get_all(TableId::ArtifactToGuid, &key).is_empty() {
            txn.blob_deletes.push(hash);
        }

        Ok(())
    }

    pub fn has_artifact<T: Txn>(&self, txn: &T, hash: ContentHash) -> bool {
        txn.first_with_prefix(TableId::ArtifactToGuid, &hash.to_key_bytes())
            .is_some()
    }

    /// Looks up an artifact and opens its blob for reading. Existence in
    /// the table is checked before anything is copied out.
    pub fn get_artifact<T: Txn>(
        &self,
        txn: &T,
        hash: ContentHash,
    ) -> Result<(AssetArtifact, File), DbError> {
        let artifact = txn
            .first_with_prefix(TableId::ArtifactToGuid, &hash.to_key_bytes())
            .and_then(|(key, _)| AssetArtifact::from_key_bytes(key))
            .ok_or(DbError::NotFound)?;

        let file = File::open(self.artifact_path(hash))?;

        Ok((artifact, file))
    }

    /// Artifacts owned by an asset, ordered by content hash.
    pub fn artifacts_of<T: Txn>(&self, txn: &T, guid: Guid) -> Vec<AssetArtifact> {
        txn.get_all(TableId::GuidToArtifact, guid.as_bytes())
            .iter()
            .filter_map(|bytes| AssetArtifact::from_key_bytes(bytes))
            .collect()
    }

    /// Assets referencing an artifact, ordered by GUID.
    pub fn guids_of_artifact<T: Txn>(&self, txn: &T, hash: ContentHash) -> Vec<Guid> {
        txn.first_with_prefix(TableId::ArtifactToGuid, &hash.to_key_bytes())
            .map(|(_, values)| values.iter().filter_map(|bytes| decode_guid(bytes)).collect())
            .unwrap_or_default()
    }

    pub fn artifact_path(&self, hash: ContentHash) -> PathBuf {
        artifact_path(&self.artifacts_root, hash)
    }
}

fn decode_guid(bytes: &[u8]) -> Option<Guid> {
    let bytes: [u8; 16] = bytes.try_into().ok()?;

    Some(Guid::from_bytes(bytes))
}
