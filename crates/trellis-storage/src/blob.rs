//! Fragmented blob storage
//!
//! Large opaque payloads ride next to their node, keyed by
//! `dataId = H(nodeId1 || clientPublicKey)` and split into fragments of
//! exactly `BLOB_FRAGMENT_SIZE` bytes (the final fragment may be short).
//! Intermediate writes may arrive out of order and overwrite each other;
//! finalization verifies the total length and the BLAKE2b digest over the
//! fragments in ascending index order, then freezes them write-once.

use std::time::Duration;

use tracing::debug;
use trellis_crypto::{hash_parts, HashPart, Hasher};

use crate::config::StorageSettings;
use crate::db::{DbClient, SqlParam};
use crate::error::{Result, StorageError};

/// Fragment size in bytes (compile-time constant)
pub const BLOB_FRAGMENT_SIZE: usize = 64 * 1024;

/// Derive the blob data id for a node/uploader pair
pub fn derive_data_id(node_id1: &[u8; 32], client_public_key: &[u8; 32]) -> [u8; 32] {
    hash_parts(&[
        HashPart::Bytes(node_id1),
        HashPart::Bytes(client_public_key),
    ])
}

/// The blob driver over one SQL connection
pub struct BlobStorage {
    db: DbClient,
    settings: StorageSettings,
}

impl BlobStorage {
    pub fn new(db: DbClient, settings: StorageSettings) -> Self {
        Self { db, settings }
    }

    /// Idempotent schema install
    pub async fn create_tables(&mut self) -> Result<()> {
        let bytes = self.db.bytes_type();
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS blob_data (
                    dataId {bytes} NOT NULL,
                    fragmentIndex BIGINT NOT NULL,
                    fragment {bytes} NOT NULL,
                    finalized BOOLEAN NOT NULL DEFAULT FALSE,
                    PRIMARY KEY (dataId, fragmentIndex)
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS blob_finalized (
                    nodeId1 {bytes} PRIMARY KEY,
                    dataId {bytes} NOT NULL,
                    length BIGINT NOT NULL,
                    hash {bytes} NOT NULL,
                    storageTime BIGINT NOT NULL
                )"
            ),
            "CREATE INDEX IF NOT EXISTS idx_blob_finalized_data ON blob_finalized (dataId)"
                .to_string(),
        ];
        for sql in &statements {
            self.db.exec(sql).await?;
        }
        Ok(())
    }

    // === Intermediate writes ===

    /// Write bytes at an absolute position, assembling the affected
    /// fragment range
    ///
    /// Middle fragments fully covered by `data` are replaced verbatim;
    /// start and end fragments are read-modify-write. Writing past the end
    /// of a short or missing fragment zero-fills the gap.
    pub async fn write_blob(&mut self, data_id: &[u8; 32], pos: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.db.begin_write().await?;
        let result = self.write_blob_tx(data_id, pos, data).await;
        match result {
            Ok(()) => self.db.commit().await,
            Err(err) => {
                self.db.rollback().await.ok();
                Err(err)
            }
        }
    }

    async fn write_blob_tx(&mut self, data_id: &[u8; 32], pos: u64, data: &[u8]) -> Result<()> {
        let fragment_size = BLOB_FRAGMENT_SIZE as u64;
        let end = pos + data.len() as u64;
        let first = pos / fragment_size;
        let last = (end - 1) / fragment_size;

        for index in first..=last {
            let fragment_start = index * fragment_size;
            let slice_start = pos.max(fragment_start);
            let slice_end = end.min(fragment_start + fragment_size);
            let slice = &data[(slice_start - pos) as usize..(slice_end - pos) as usize];
            let offset = (slice_start - fragment_start) as usize;
            self.patch_fragment(data_id, index, offset, slice).await?;
        }
        Ok(())
    }

    /// Replace one whole fragment; oversize fragments are rejected
    pub async fn write_blob_fragment(
        &mut self,
        data_id: &[u8; 32],
        fragment: &[u8],
        index: u32,
    ) -> Result<()> {
        if fragment.len() > BLOB_FRAGMENT_SIZE {
            return Err(StorageError::FragmentTooLarge(fragment.len()));
        }
        self.db.begin_write().await?;
        let result = self.patch_fragment(data_id, index as u64, 0, fragment).await;
        match result {
            Ok(()) => self.db.commit().await,
            Err(err) => {
                self.db.rollback().await.ok();
                Err(err)
            }
        }
    }

    /// Read-modify-write one fragment; finalized fragments are write-once
    /// and silently left untouched
    async fn patch_fragment(
        &mut self,
        data_id: &[u8; 32],
        index: u64,
        offset: usize,
        slice: &[u8],
    ) -> Result<()> {
        let select = format!(
            "SELECT fragment, finalized FROM blob_data WHERE dataId = {} AND fragmentIndex = {}",
            self.db.placeholder(1),
            self.db.placeholder(2)
        );
        let key = [
            SqlParam::Bytes(data_id.to_vec()),
            SqlParam::Int(index as i64),
        ];
        let existing = self.db.get(&select, &key).await?;

        let mut buffer = match &existing {
            Some(row) => {
                if row.bool("finalized")? {
                    debug!(index, "skipping write into finalized fragment");
                    return Ok(());
                }
                row.bytes("fragment")?
            }
            None => Vec::new(),
        };
        if buffer.len() < offset {
            buffer.resize(offset, 0);
        }
        if buffer.len() < offset + slice.len() {
            buffer.resize(offset + slice.len(), 0);
        }
        buffer[offset..offset + slice.len()].copy_from_slice(slice);

        if existing.is_some() {
            let update = format!(
                "UPDATE blob_data SET fragment = {} WHERE dataId = {} AND fragmentIndex = {}",
                self.db.placeholder(1),
                self.db.placeholder(2),
                self.db.placeholder(3)
            );
            self.db
                .run(
                    &update,
                    &[
                        SqlParam::Bytes(buffer),
                        SqlParam::Bytes(data_id.to_vec()),
                        SqlParam::Int(index as i64),
                    ],
                )
                .await?;
        } else {
            let insert = format!(
                "INSERT INTO blob_data (dataId, fragmentIndex, fragment, finalized) \
                 VALUES ({}, {}, {}, FALSE)",
                self.db.placeholder(1),
                self.db.placeholder(2),
                self.db.placeholder(3)
            );
            self.db
                .run(
                    &insert,
                    &[
                        SqlParam::Bytes(data_id.to_vec()),
                        SqlParam::Int(index as i64),
                        SqlParam::Bytes(buffer),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Sum of stored fragment lengths, for resumable uploads
    pub async fn read_blob_intermediary_length(&mut self, data_id: &[u8; 32]) -> Result<u64> {
        let sql = format!(
            "SELECT SUM(LENGTH(fragment)) AS total FROM blob_data WHERE dataId = {}",
            self.db.placeholder(1)
        );
        let row = self
            .db
            .get(&sql, &[SqlParam::Bytes(data_id.to_vec())])
            .await?;
        Ok(row
            .and_then(|row| row.opt_int("total").ok().flatten())
            .unwrap_or(0) as u64)
    }

    // === Finalization ===

    /// Verify and freeze a blob
    ///
    /// Preconditions: the stored fragments sum to `length`, every fragment
    /// but the last is exactly the fragment size, and BLAKE2b over the
    /// fragments in ascending index order equals `hash`. On mismatch the
    /// intermediate fragments are purged and `BlobHashMismatch` raised.
    /// Verification and installation are one transaction.
    pub async fn finalize_write_blob(
        &mut self,
        node_id1: &[u8; 32],
        data_id: &[u8; 32],
        length: u64,
        hash: &[u8; 32],
        now: u64,
    ) -> Result<()> {
        let timeout = self.settings.call_timeout_ms;
        let result = with_deadline(
            timeout,
            self.finalize_write_blob_inner(node_id1, data_id, length, hash, now),
        )
        .await;
        if matches!(result, Err(StorageError::Timeout)) {
            self.db.rollback().await.ok();
        }
        result
    }

    async fn finalize_write_blob_inner(
        &mut self,
        node_id1: &[u8; 32],
        data_id: &[u8; 32],
        length: u64,
        hash: &[u8; 32],
        now: u64,
    ) -> Result<()> {
        self.db.begin_write().await?;

        let select = format!(
            "SELECT fragmentIndex, fragment FROM blob_data WHERE dataId = {} \
             ORDER BY fragmentIndex ASC",
            self.db.placeholder(1)
        );
        let key = [SqlParam::Bytes(data_id.to_vec())];
        let rows = match self.db.all(&select, &key).await {
            Ok(rows) => rows,
            Err(err) => {
                self.db.rollback().await.ok();
                return Err(err);
            }
        };

        let verified = (|| -> Result<(u64, [u8; 32], bool)> {
            let mut total = 0u64;
            let mut hasher = Hasher::new();
            let mut well_formed = true;
            let count = rows.len();
            for (position, row) in rows.iter().enumerate() {
                let index = row.int("fragmentIndex")?;
                let fragment = row.bytes("fragment")?;
                if index != position as i64 {
                    well_formed = false;
                }
                if position + 1 < count && fragment.len() != BLOB_FRAGMENT_SIZE {
                    well_formed = false;
                }
                total += fragment.len() as u64;
                hasher.update(&fragment);
            }
            Ok((total, hasher.finalize(), well_formed))
        })();
        let (total, digest, well_formed) = match verified {
            Ok(verified) => verified,
            Err(err) => {
                self.db.rollback().await.ok();
                return Err(err);
            }
        };

        if !well_formed || total != length || digest != *hash {
            debug!(
                expected = length,
                stored = total,
                "blob finalization mismatch, purging fragments"
            );
            let purge = format!(
                "DELETE FROM blob_data WHERE dataId = {}",
                self.db.placeholder(1)
            );
            let purge_result = self.db.run(&purge, &key).await;
            match purge_result {
                Ok(_) => self.db.commit().await?,
                Err(_) => {
                    self.db.rollback().await.ok();
                }
            }
            return Err(StorageError::BlobHashMismatch);
        }

        let freeze = format!(
            "UPDATE blob_data SET finalized = TRUE WHERE dataId = {}",
            self.db.placeholder(1)
        );
        let install = format!(
            "INSERT INTO blob_finalized (nodeId1, dataId, length, hash, storageTime) \
             VALUES ({})",
            self.db.placeholders(5, 1)
        );
        let install_params = [
            SqlParam::Bytes(node_id1.to_vec()),
            SqlParam::Bytes(data_id.to_vec()),
            SqlParam::Int(length as i64),
            SqlParam::Bytes(hash.to_vec()),
            SqlParam::time(now),
        ];
        let result = async {
            self.db.run(&freeze, &key).await?;
            self.db.run(&install, &install_params).await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => self.db.commit().await,
            Err(err) => {
                self.db.rollback().await.ok();
                Err(err)
            }
        }
    }

    // === Reads ===

    /// Ranged read from a finalized blob; absent when not finalized
    ///
    /// Returns up to `min(len, finalized_length - pos)` bytes, crossing
    /// fragment boundaries transparently.
    pub async fn read_blob(
        &mut self,
        node_id1: &[u8; 32],
        pos: u64,
        len: u64,
    ) -> Result<Option<Vec<u8>>> {
        let select = format!(
            "SELECT dataId, length FROM blob_finalized WHERE nodeId1 = {}",
            self.db.placeholder(1)
        );
        let row = self
            .db
            .get(&select, &[SqlParam::Bytes(node_id1.to_vec())])
            .await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let data_id = row.bytes("dataId")?;
        let length = row.int("length")? as u64;

        let available = length.saturating_sub(pos);
        let wanted = len.min(available);
        if wanted == 0 {
            return Ok(Some(Vec::new()));
        }

        let fragment_size = BLOB_FRAGMENT_SIZE as u64;
        let first = pos / fragment_size;
        let last = (pos + wanted - 1) / fragment_size;
        let sql = format!(
            "SELECT fragmentIndex, fragment FROM blob_data \
             WHERE dataId = {} AND fragmentIndex BETWEEN {} AND {} \
             ORDER BY fragmentIndex ASC",
            self.db.placeholder(1),
            self.db.placeholder(2),
            self.db.placeholder(3)
        );
        let rows = self
            .db
            .all(
                &sql,
                &[
                    SqlParam::Bytes(data_id),
                    SqlParam::Int(first as i64),
                    SqlParam::Int(last as i64),
                ],
            )
            .await?;

        let mut out = Vec::with_capacity(wanted as usize);
        for row in rows {
            let index = row.int("fragmentIndex")? as u64;
            let fragment = row.bytes("fragment")?;
            let fragment_start = index * fragment_size;
            let from = pos.saturating_sub(fragment_start).min(fragment.len() as u64) as usize;
            let until = ((pos + wanted).saturating_sub(fragment_start) as usize)
                .min(fragment.len());
            if from < until {
                out.extend_from_slice(&fragment[from..until]);
            }
        }
        Ok(Some(out))
    }

    // === Copy and delete ===

    /// Duplicate a finalized row onto another node, sharing the fragments
    ///
    /// Returns `false` when the source is not finalized.
    pub async fn copy_blob(
        &mut self,
        src_node_id1: &[u8; 32],
        dst_node_id1: &[u8; 32],
        now: u64,
    ) -> Result<bool> {
        let select = format!(
            "SELECT dataId, length, hash FROM blob_finalized WHERE nodeId1 = {}",
            self.db.placeholder(1)
        );
        let row = self
            .db
            .get(&select, &[SqlParam::Bytes(src_node_id1.to_vec())])
            .await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(false),
        };
        let insert = format!(
            "INSERT INTO blob_finalized (nodeId1, dataId, length, hash, storageTime) \
             VALUES ({})",
            self.db.placeholders(5, 1)
        );
        self.db
            .run(
                &insert,
                &[
                    SqlParam::Bytes(dst_node_id1.to_vec()),
                    SqlParam::Bytes(row.bytes("dataId")?),
                    SqlParam::Int(row.int("length")?),
                    SqlParam::Bytes(row.bytes("hash")?),
                    SqlParam::time(now),
                ],
            )
            .await?;
        Ok(true)
    }

    /// Delete finalized rows and garbage-collect fragments no longer
    /// referenced by any finalized blob
    pub async fn delete_blobs(&mut self, node_id1s: &[[u8; 32]]) -> Result<()> {
        if node_id1s.is_empty() {
            return Ok(());
        }
        self.db.begin_write().await?;
        let result = self.delete_blobs_tx(node_id1s).await;
        match result {
            Ok(()) => self.db.commit().await,
            Err(err) => {
                self.db.rollback().await.ok();
                Err(err)
            }
        }
    }

    async fn delete_blobs_tx(&mut self, node_id1s: &[[u8; 32]]) -> Result<()> {
        let params: Vec<SqlParam> = node_id1s
            .iter()
            .map(|id| SqlParam::Bytes(id.to_vec()))
            .collect();
        let list = self.db.placeholders(params.len(), 1);

        let select = format!("SELECT dataId FROM blob_finalized WHERE nodeId1 IN ({list})");
        let mut data_ids: Vec<Vec<u8>> = Vec::new();
        for row in self.db.all(&select, &params).await? {
            let data_id = row.bytes("dataId")?;
            if !data_ids.contains(&data_id) {
                data_ids.push(data_id);
            }
        }

        let delete = format!("DELETE FROM blob_finalized WHERE nodeId1 IN ({list})");
        self.db.run(&delete, &params).await?;

        for data_id in data_ids {
            let count_sql = format!(
                "SELECT COUNT(*) AS n FROM blob_finalized WHERE dataId = {}",
                self.db.placeholder(1)
            );
            let key = [SqlParam::Bytes(data_id.clone())];
            let remaining = self
                .db
                .get(&count_sql, &key)
                .await?
                .map(|row| row.int("n"))
                .transpose()?
                .unwrap_or(0);
            if remaining == 0 {
                let gc = format!(
                    "DELETE FROM blob_data WHERE dataId = {}",
                    self.db.placeholder(1)
                );
                self.db.run(&gc, &key).await?;
            }
        }
        Ok(())
    }
}

/// Run a future under an optional deadline
async fn with_deadline<T, F>(timeout_ms: Option<u64>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), fut)
            .await
            .map_err(|_| StorageError::Timeout)?,
        None => fut.await,
    }
}
