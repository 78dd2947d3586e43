//! The node storage driver
//!
//! Persists nodes inside a single write transaction per `store` call,
//! maintains the achilles/licensing/destroy/friend-cert index tables,
//! enforces uniqueness, and keeps the parent trail's freshness timestamps
//! monotone. Reads are permission-aware: `fetch_single_node` consults the
//! licensing index, `get_root_node` enforces root eligibility.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use tracing::debug;
use trellis_node::{Node, ValidateLevel};

use crate::config::StorageSettings;
use crate::db::{DbClient, SqlParam};
use crate::error::{Result, StorageError};

const REFUSAL_NOT_FOUND: &str = "The root node is not found but expected to exist.";
const REFUSAL_NO_ACCESS: &str = "Access to requested root node is not allowed.";
const REFUSAL_LICENSED: &str = "Licensed node cannot be used as root node.";
const REFUSAL_RESTRICTIVE: &str =
    "Begin restrictive writer mode node cannot be used as root node.";
const REFUSAL_RIGHTS_BY_ASSOCIATION: &str = "Root node cannot use hasRightsByAssociation.";

/// Rights-by-association chains are walked at most this deep
const MAX_ASSOCIATION_DEPTH: u32 = 8;

/// A root resolution request
///
/// Root eligibility only consults the requester's own key: a private root
/// is refused for anyone but its owner, and licensed roots are refused
/// outright, so no licensing lookup (and no source key) is involved.
#[derive(Clone, Debug)]
pub struct RootQuery {
    pub root_id1: [u8; 32],
    /// The requester's public key
    pub target_public_key: [u8; 32],
    /// ISO 3166 region limit, when the fetcher is region-bound
    pub region: Option<String>,
    /// ISO 3166 jurisdiction limit
    pub jurisdiction: Option<String>,
}

/// One candidate surviving the store pipeline
struct Candidate {
    node: Node,
    id1: [u8; 32],
    id: [u8; 32],
    parent_id: [u8; 32],
    creation_time: u64,
    shared_hash: [u8; 32],
    transient_hash: [u8; 32],
    image: Vec<u8>,
    update_in_place: bool,
}

/// The node storage driver over one SQL connection
pub struct Storage {
    db: DbClient,
    settings: StorageSettings,
}

/// Run a future under an optional deadline
async fn with_deadline<T, F>(timeout_ms: Option<u64>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout_ms {
        Some(ms) => tokio::time::timeout(Duration::from_millis(ms), fut)
            .await
            .map_err(|_| StorageError::Timeout)?,
        None => fut.await,
    }
}

impl Storage {
    pub fn new(db: DbClient, settings: StorageSettings) -> Self {
        Self { db, settings }
    }

    pub fn settings(&self) -> &StorageSettings {
        &self.settings
    }

    /// Idempotent schema install
    pub async fn create_tables(&mut self) -> Result<()> {
        let bytes = self.db.bytes_type();
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS nodes (
                    id1 {bytes} PRIMARY KEY,
                    id2 {bytes},
                    id {bytes} NOT NULL,
                    parentId {bytes} NOT NULL,
                    creationTime BIGINT NOT NULL,
                    expireTime BIGINT,
                    storageTime BIGINT NOT NULL,
                    updateTime BIGINT NOT NULL,
                    trailUpdateTime BIGINT NOT NULL,
                    sharedHash {bytes} NOT NULL UNIQUE,
                    transientHash {bytes} NOT NULL,
                    bumpHash {bytes} NOT NULL,
                    image {bytes} NOT NULL
                )"
            ),
            "CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes (parentId)".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_nodes_id ON nodes (id)".to_string(),
            "CREATE INDEX IF NOT EXISTS idx_nodes_bump ON nodes (bumpHash)".to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS achilles_hashes (
                    id1 {bytes} NOT NULL,
                    hash {bytes} NOT NULL,
                    PRIMARY KEY (id1, hash)
                )"
            ),
            "CREATE INDEX IF NOT EXISTS idx_achilles_hash ON achilles_hashes (hash)".to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS licensing_hashes (
                    id1 {bytes} NOT NULL,
                    hash {bytes} NOT NULL,
                    disallowRetroLicensing BOOLEAN NOT NULL,
                    parentPathHash {bytes},
                    restrictiveModeWriter BOOLEAN NOT NULL,
                    restrictiveModeManager BOOLEAN NOT NULL,
                    creationTime BIGINT NOT NULL,
                    expireTime BIGINT NOT NULL,
                    PRIMARY KEY (id1, hash)
                )"
            ),
            "CREATE INDEX IF NOT EXISTS idx_licensing_hash ON licensing_hashes (hash)".to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS destroy_hashes (
                    id1 {bytes} NOT NULL,
                    hash {bytes} NOT NULL,
                    PRIMARY KEY (id1, hash)
                )"
            ),
            "CREATE INDEX IF NOT EXISTS idx_destroy_hash ON destroy_hashes (hash)".to_string(),
            format!(
                "CREATE TABLE IF NOT EXISTS friend_certs (
                    id1 {bytes} NOT NULL,
                    issuer {bytes} NOT NULL,
                    constraints {bytes},
                    image {bytes} NOT NULL,
                    PRIMARY KEY (id1, issuer)
                )"
            ),
        ];
        for sql in &statements {
            self.db.exec(sql).await?;
        }
        Ok(())
    }

    // === Store ===

    /// Persist a batch of nodes in one transaction
    ///
    /// Returns the id1s actually persisted and the deduplicated parent ids
    /// whose trails were freshened. Nodes already present are skipped; when
    /// `preserve_transient` is set, a present node whose stored transient
    /// hash differs is updated in place instead.
    pub async fn store(
        &mut self,
        nodes: &[Node],
        now: u64,
        preserve_transient: bool,
    ) -> Result<(Vec<[u8; 32]>, Vec<[u8; 32]>)> {
        let timeout = self.settings.call_timeout_ms;
        let result =
            with_deadline(timeout, self.store_with_retry(nodes, now, preserve_transient)).await;
        if matches!(result, Err(StorageError::Timeout)) {
            self.db.rollback().await.ok();
        }
        result
    }

    async fn store_with_retry(
        &mut self,
        nodes: &[Node],
        now: u64,
        preserve_transient: bool,
    ) -> Result<(Vec<[u8; 32]>, Vec<[u8; 32]>)> {
        let mut unique_retried = false;
        let mut busy_attempts = 0u32;
        loop {
            self.db.begin_write().await?;
            match self.store_tx(nodes, now, preserve_transient).await {
                Ok(result) => {
                    self.db.commit().await?;
                    return Ok(result);
                }
                Err(err) => {
                    self.db.rollback().await.ok();
                    match err {
                        // A race between sessions can slip past filterUnique;
                        // one retry re-runs the filters against the winner.
                        StorageError::UniqueViolation if !unique_retried => {
                            debug!("unique violation during store, retrying once");
                            unique_retried = true;
                        }
                        StorageError::Busy | StorageError::LockTimeout
                            if busy_attempts < self.settings.busy_retries =>
                        {
                            busy_attempts += 1;
                            tokio::time::sleep(Duration::from_millis(
                                self.settings.busy_backoff_ms,
                            ))
                            .await;
                        }
                        StorageError::Busy | StorageError::LockTimeout => {
                            return Err(StorageError::Temporary);
                        }
                        other => return Err(other),
                    }
                }
            }
        }
    }

    async fn store_tx(
        &mut self,
        nodes: &[Node],
        now: u64,
        preserve_transient: bool,
    ) -> Result<(Vec<[u8; 32]>, Vec<[u8; 32]>)> {
        let mut candidates = Vec::with_capacity(nodes.len());
        for node in nodes {
            node.validate(ValidateLevel::Full, Some(now))
                .map_err(trellis_node::NodeError::Validation)?;
            // The driver's configured distance bound may be tighter than
            // the model-level maximum.
            let max_distance = self.settings.max_license_distance as u64;
            if node.base().license_max_distance().unwrap_or(0) > max_distance {
                return Err(StorageError::Node(trellis_node::NodeError::Validation(
                    trellis_node::ValidationError::new("licenseMaxDistance exceeds maximum"),
                )));
            }
            candidates.push(self.candidate(node, preserve_transient)?);
        }

        let candidates = self.filter_existing(candidates, preserve_transient).await?;
        let candidates = self.filter_destroyed(candidates).await?;
        let candidates = self.filter_unique(candidates).await?;

        let mut inserted = Vec::with_capacity(candidates.len());
        let mut parents: Vec<[u8; 32]> = Vec::new();
        let mut license_bumps: Vec<[u8; 32]> = Vec::new();

        for candidate in &candidates {
            if candidate.update_in_place {
                self.update_node_image(candidate, now).await?;
            } else {
                self.insert_node(candidate, now).await?;
                self.insert_achilles_hashes(candidate).await?;
                self.insert_licensing_hashes(candidate).await?;
                self.insert_destroy_hashes(candidate).await?;
                self.insert_friend_certs(candidate).await?;
                if let Some(license) = candidate.node.as_license() {
                    if let (Some(parent), Some(node_id1)) =
                        (license.base().parent_id(), license.node_id1())
                    {
                        license_bumps.push(target_bump_hash(&parent, &node_id1));
                    }
                }
            }
            inserted.push(candidate.id1);
            if !parents.contains(&candidate.parent_id) {
                parents.push(candidate.parent_id);
            }
        }

        self.freshen_parent_trail_tx(&parents, now).await?;

        // Newly arrived licenses freshen the nodes they license.
        if !license_bumps.is_empty() {
            for parent in self.bump_nodes_tx(&license_bumps, now).await? {
                if !parents.contains(&parent) {
                    parents.push(parent);
                }
            }
        }
        Ok((inserted, parents))
    }

    fn candidate(&self, node: &Node, preserve_transient: bool) -> Result<Candidate> {
        let base = node.base();
        let id1 = base
            .id1()
            .ok_or(trellis_node::NodeError::MissingField("id1"))?;
        let id = base
            .id()
            .ok_or(trellis_node::NodeError::MissingField("id1"))?;
        let parent_id = base
            .parent_id()
            .ok_or(trellis_node::NodeError::MissingField("parentId"))?;
        let creation_time = base
            .creation_time()
            .ok_or(trellis_node::NodeError::MissingField("creationTime"))?;
        Ok(Candidate {
            id1,
            id,
            parent_id,
            creation_time,
            shared_hash: base.shared_hash(),
            transient_hash: base.transient_hash(),
            image: node.export(preserve_transient)?,
            node: node.clone(),
            update_in_place: false,
        })
    }

    /// Drop candidates whose images already exist; keep differing-transient
    /// rows for in-place update when requested
    async fn filter_existing(
        &mut self,
        candidates: Vec<Candidate>,
        preserve_transient: bool,
    ) -> Result<Vec<Candidate>> {
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let params: Vec<SqlParam> = candidates
            .iter()
            .map(|c| SqlParam::Bytes(c.id1.to_vec()))
            .collect();
        let sql = format!(
            "SELECT id1, transientHash FROM nodes WHERE id1 IN ({})",
            self.db.placeholders(params.len(), 1)
        );
        let mut existing: HashMap<[u8; 32], [u8; 32]> = HashMap::new();
        for row in self.db.all(&sql, &params).await? {
            existing.insert(row.id32("id1")?, row.id32("transientHash")?);
        }

        let mut kept = Vec::with_capacity(candidates.len());
        for mut candidate in candidates {
            match existing.get(&candidate.id1) {
                None => kept.push(candidate),
                Some(stored_transient) => {
                    if preserve_transient && *stored_transient != candidate.transient_hash {
                        candidate.update_in_place = true;
                        kept.push(candidate);
                    } else {
                        debug!(id1 = %hex::encode(candidate.id1), "skipping existing node");
                    }
                }
            }
        }
        Ok(kept)
    }

    /// Drop candidates whose achilles hashes intersect the destroy index
    async fn filter_destroyed(&mut self, candidates: Vec<Candidate>) -> Result<Vec<Candidate>> {
        let mut all_hashes: Vec<[u8; 32]> = Vec::new();
        for candidate in &candidates {
            all_hashes.extend(candidate.node.achilles_hashes());
        }
        if all_hashes.is_empty() {
            return Ok(candidates);
        }
        let destroyed = self.matching_destroy_hashes(&all_hashes).await?;
        if destroyed.is_empty() {
            return Ok(candidates);
        }
        Ok(candidates
            .into_iter()
            .filter(|candidate| {
                let dead = candidate
                    .node
                    .achilles_hashes()
                    .iter()
                    .any(|hash| destroyed.contains(hash));
                if dead {
                    debug!(id1 = %hex::encode(candidate.id1), "dropping destroyed candidate");
                }
                !dead
            })
            .collect())
    }

    async fn matching_destroy_hashes(
        &mut self,
        hashes: &[[u8; 32]],
    ) -> Result<HashSet<[u8; 32]>> {
        if hashes.is_empty() {
            return Ok(HashSet::new());
        }
        let params: Vec<SqlParam> = hashes
            .iter()
            .map(|hash| SqlParam::Bytes(hash.to_vec()))
            .collect();
        let sql = format!(
            "SELECT hash FROM destroy_hashes WHERE hash IN ({})",
            self.db.placeholders(params.len(), 1)
        );
        let mut matched = HashSet::new();
        for row in self.db.all(&sql, &params).await? {
            matched.insert(row.id32("hash")?);
        }
        Ok(matched)
    }

    /// Collapse unique candidates by shared hash and drop ones whose shared
    /// hash is already persisted
    async fn filter_unique(&mut self, candidates: Vec<Candidate>) -> Result<Vec<Candidate>> {
        // In-batch collapse: earliest creationTime wins, ties by id1.
        let mut best: BTreeMap<[u8; 32], usize> = BTreeMap::new();
        for (index, candidate) in candidates.iter().enumerate() {
            if candidate.update_in_place || !candidate.node.base().is_unique() {
                continue;
            }
            match best.get(&candidate.shared_hash) {
                None => {
                    best.insert(candidate.shared_hash, index);
                }
                Some(&winner) => {
                    let other = &candidates[winner];
                    let replaces = (candidate.creation_time, candidate.id1)
                        < (other.creation_time, other.id1);
                    if replaces {
                        best.insert(candidate.shared_hash, index);
                    }
                }
            }
        }
        let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.into_iter().enumerate() {
            let unique = candidate.node.base().is_unique() && !candidate.update_in_place;
            if unique && best.get(&candidate.shared_hash) != Some(&index) {
                debug!(id1 = %hex::encode(candidate.id1), "dropping in-batch unique duplicate");
                continue;
            }
            kept.push(candidate);
        }

        // Existing rows win over candidates.
        let hashes: Vec<SqlParam> = kept
            .iter()
            .filter(|c| !c.update_in_place)
            .map(|c| SqlParam::Bytes(c.shared_hash.to_vec()))
            .collect();
        if hashes.is_empty() {
            return Ok(kept);
        }
        let sql = format!(
            "SELECT sharedHash FROM nodes WHERE sharedHash IN ({})",
            self.db.placeholders(hashes.len(), 1)
        );
        let mut present: HashSet<[u8; 32]> = HashSet::new();
        for row in self.db.all(&sql, &hashes).await? {
            present.insert(row.id32("sharedHash")?);
        }
        Ok(kept
            .into_iter()
            .filter(|candidate| {
                let duplicate =
                    !candidate.update_in_place && present.contains(&candidate.shared_hash);
                if duplicate {
                    debug!(id1 = %hex::encode(candidate.id1), "dropping stored unique duplicate");
                }
                !duplicate
            })
            .collect())
    }

    async fn insert_node(&mut self, candidate: &Candidate, now: u64) -> Result<()> {
        let base = candidate.node.base();
        let sql = format!(
            "INSERT INTO nodes (id1, id2, id, parentId, creationTime, expireTime, storageTime, \
             updateTime, trailUpdateTime, sharedHash, transientHash, bumpHash, image) \
             VALUES ({})",
            self.db.placeholders(13, 1)
        );
        let bump_hash = base
            .bump_hash()
            .ok_or(trellis_node::NodeError::MissingField("id1"))?;
        let params = [
            SqlParam::Bytes(candidate.id1.to_vec()),
            match base.id2() {
                Some(id2) => SqlParam::Bytes(id2.to_vec()),
                None => SqlParam::NullBytes,
            },
            SqlParam::Bytes(candidate.id.to_vec()),
            SqlParam::Bytes(candidate.parent_id.to_vec()),
            SqlParam::time(candidate.creation_time),
            match base.expire_time() {
                Some(expire) => SqlParam::time(expire),
                None => SqlParam::NullInt,
            },
            SqlParam::time(now),
            SqlParam::time(now),
            SqlParam::time(now),
            SqlParam::Bytes(candidate.shared_hash.to_vec()),
            SqlParam::Bytes(candidate.transient_hash.to_vec()),
            SqlParam::Bytes(bump_hash.to_vec()),
            SqlParam::Bytes(candidate.image.clone()),
        ];
        self.db.run(&sql, &params).await?;
        Ok(())
    }

    async fn update_node_image(&mut self, candidate: &Candidate, now: u64) -> Result<()> {
        let sql = format!(
            "UPDATE nodes SET image = {}, transientHash = {}, updateTime = {} WHERE id1 = {}",
            self.db.placeholder(1),
            self.db.placeholder(2),
            self.db.placeholder(3),
            self.db.placeholder(4)
        );
        self.db
            .run(
                &sql,
                &[
                    SqlParam::Bytes(candidate.image.clone()),
                    SqlParam::Bytes(candidate.transient_hash.to_vec()),
                    SqlParam::time(now),
                    SqlParam::Bytes(candidate.id1.to_vec()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn insert_achilles_hashes(&mut self, candidate: &Candidate) -> Result<()> {
        let sql = format!(
            "INSERT INTO achilles_hashes (id1, hash) VALUES ({})",
            self.db.placeholders(2, 1)
        );
        for hash in candidate.node.achilles_hashes() {
            self.db
                .run(
                    &sql,
                    &[
                        SqlParam::Bytes(candidate.id1.to_vec()),
                        SqlParam::Bytes(hash.to_vec()),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    /// Licensing rows carry the license's policy flags and lifetime so the
    /// matcher can enforce them without decoding the node image
    async fn insert_licensing_hashes(&mut self, candidate: &Candidate) -> Result<()> {
        let license = match candidate.node.as_license() {
            Some(license) => license,
            None => return Ok(()),
        };
        let sql = format!(
            "INSERT INTO licensing_hashes (id1, hash, disallowRetroLicensing, parentPathHash, \
             restrictiveModeWriter, restrictiveModeManager, creationTime, expireTime) \
             VALUES ({})",
            self.db.placeholders(8, 1)
        );
        for hash in license.licensee_hashes() {
            let params = [
                SqlParam::Bytes(candidate.id1.to_vec()),
                SqlParam::Bytes(hash.to_vec()),
                SqlParam::Bool(license.disallows_retro_licensing()),
                match license.parent_path_hash() {
                    Some(path) => SqlParam::Bytes(path.to_vec()),
                    None => SqlParam::NullBytes,
                },
                SqlParam::Bool(license.is_restrictive_writer()),
                SqlParam::Bool(license.is_restrictive_manager()),
                SqlParam::time(candidate.creation_time),
                SqlParam::time(license.base().expire_time().unwrap_or(0)),
            ];
            self.db.run(&sql, &params).await?;
        }
        Ok(())
    }

    async fn insert_destroy_hashes(&mut self, candidate: &Candidate) -> Result<()> {
        let sql = format!(
            "INSERT INTO destroy_hashes (id1, hash) VALUES ({})",
            self.db.placeholders(2, 1)
        );
        for hash in candidate.node.destroy_hashes() {
            self.db
                .run(
                    &sql,
                    &[
                        SqlParam::Bytes(candidate.id1.to_vec()),
                        SqlParam::Bytes(hash.to_vec()),
                    ],
                )
                .await?;
        }
        Ok(())
    }

    async fn insert_friend_certs(&mut self, candidate: &Candidate) -> Result<()> {
        let license = match candidate.node.as_license() {
            Some(license) => license,
            None => return Ok(()),
        };
        let certs = [license.friend_cert_a()?, license.friend_cert_b()?];
        let sql = format!(
            "INSERT INTO friend_certs (id1, issuer, constraints, image) VALUES ({})",
            self.db.placeholders(4, 1)
        );
        for cert in certs.into_iter().flatten() {
            let image = cert.export().map_err(StorageError::Node)?;
            let issuer = cert
                .issuer_public_key()
                .ok_or(trellis_node::NodeError::MissingField("issuer"))?;
            let params = [
                SqlParam::Bytes(candidate.id1.to_vec()),
                SqlParam::Bytes(issuer.to_vec()),
                match cert.constraints() {
                    Some(constraints) => SqlParam::Bytes(constraints.to_vec()),
                    None => SqlParam::NullBytes,
                },
                SqlParam::Bytes(image),
            ];
            self.db.run(&sql, &params).await?;
        }
        Ok(())
    }

    // === Deletion ===

    /// Remove nodes and every auxiliary row keyed on their id1
    pub async fn delete_nodes(&mut self, id1s: &[[u8; 32]]) -> Result<()> {
        if id1s.is_empty() {
            return Ok(());
        }
        let timeout = self.settings.call_timeout_ms;
        let result = with_deadline(timeout, self.delete_nodes_inner(id1s)).await;
        if matches!(result, Err(StorageError::Timeout)) {
            self.db.rollback().await.ok();
        }
        result
    }

    async fn delete_nodes_inner(&mut self, id1s: &[[u8; 32]]) -> Result<()> {
        let params: Vec<SqlParam> = id1s
            .iter()
            .map(|id| SqlParam::Bytes(id.to_vec()))
            .collect();
        let list = self.db.placeholders(params.len(), 1);
        self.db.begin_write().await?;
        let tables = [
            "nodes",
            "achilles_hashes",
            "licensing_hashes",
            "destroy_hashes",
            "friend_certs",
        ];
        for table in tables {
            let sql = format!("DELETE FROM {table} WHERE id1 IN ({list})");
            if let Err(err) = self.db.run(&sql, &params).await {
                self.db.rollback().await.ok();
                return Err(err);
            }
        }
        self.db.commit().await
    }

    // === Reads ===

    /// Decode one stored node, transient fields included
    pub async fn get_node_by_id1(&mut self, id1: &[u8; 32], now: u64) -> Result<Option<Node>> {
        let sql = format!(
            "SELECT image, expireTime FROM nodes WHERE id1 = {}",
            self.db.placeholder(1)
        );
        let row = self
            .db
            .get(&sql, &[SqlParam::Bytes(id1.to_vec())])
            .await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        if let Some(expire) = row.opt_int("expireTime")? {
            if now as i64 >= expire {
                return Ok(None);
            }
        }
        let image = row.bytes("image")?;
        Ok(Some(Node::load(&image, true)?))
    }

    /// Batched reads, output preserving request order
    pub async fn get_nodes_by_id1(
        &mut self,
        id1s: &[[u8; 32]],
        now: u64,
    ) -> Result<Vec<Option<Node>>> {
        if id1s.is_empty() {
            return Ok(Vec::new());
        }
        let params: Vec<SqlParam> = id1s
            .iter()
            .map(|id| SqlParam::Bytes(id.to_vec()))
            .collect();
        let sql = format!(
            "SELECT id1, image, expireTime FROM nodes WHERE id1 IN ({})",
            self.db.placeholders(params.len(), 1)
        );
        let mut found: HashMap<[u8; 32], Node> = HashMap::new();
        for row in self.db.all(&sql, &params).await? {
            if let Some(expire) = row.opt_int("expireTime")? {
                if now as i64 >= expire {
                    continue;
                }
            }
            let image = row.bytes("image")?;
            found.insert(row.id32("id1")?, Node::load(&image, true)?);
        }
        Ok(id1s.iter().map(|id| found.remove(id)).collect())
    }

    /// Permission-aware single-node read
    ///
    /// Returns the node iff it is public, owned by the target key, covered
    /// by a stored license for `(source, target)`, or reachable through a
    /// rights-by-association chain that is. Destroyed nodes are absent.
    pub async fn fetch_single_node(
        &mut self,
        id1: &[u8; 32],
        now: u64,
        source_public_key: &[u8; 32],
        target_public_key: &[u8; 32],
    ) -> Result<Option<Node>> {
        let timeout = self.settings.call_timeout_ms;
        with_deadline(
            timeout,
            self.fetch_single_node_inner(id1, now, source_public_key, target_public_key),
        )
        .await
    }

    async fn fetch_single_node_inner(
        &mut self,
        id1: &[u8; 32],
        now: u64,
        source_public_key: &[u8; 32],
        target_public_key: &[u8; 32],
    ) -> Result<Option<Node>> {
        let node = match self.load_live_node(id1, now).await? {
            Some(node) => node,
            None => return Ok(None),
        };
        if self.is_destroyed(&node).await? {
            return Ok(None);
        }
        if self
            .node_permitted(node.clone(), *source_public_key, *target_public_key, now)
            .await?
        {
            Ok(Some(node))
        } else {
            Ok(None)
        }
    }

    /// Load a node that is alive at `now` under the grace window
    async fn load_live_node(&mut self, id1: &[u8; 32], now: u64) -> Result<Option<Node>> {
        let sql = format!(
            "SELECT image, creationTime, expireTime FROM nodes WHERE id1 = {}",
            self.db.placeholder(1)
        );
        let row = self
            .db
            .get(&sql, &[SqlParam::Bytes(id1.to_vec())])
            .await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let tolerance = self.settings.now_tolerance_ms;
        if let Some(expire) = row.opt_int("expireTime")? {
            if (expire as u64).saturating_add(tolerance) <= now {
                return Ok(None);
            }
        }
        let creation = row.int("creationTime")? as u64;
        if creation > now.saturating_add(tolerance) {
            return Ok(None);
        }
        let image = row.bytes("image")?;
        Ok(Some(Node::load(&image, true)?))
    }

    async fn is_destroyed(&mut self, node: &Node) -> Result<bool> {
        let achilles = node.achilles_hashes();
        if achilles.is_empty() {
            return Ok(false);
        }
        Ok(!self.matching_destroy_hashes(&achilles).await?.is_empty())
    }

    /// The §fetch permission matrix, walking rights-by-association chains
    /// iteratively
    async fn node_permitted(
        &mut self,
        node: Node,
        source: [u8; 32],
        target: [u8; 32],
        now: u64,
    ) -> Result<bool> {
        let mut current = node;
        let mut depth = MAX_ASSOCIATION_DEPTH;
        loop {
            let base = current.base();
            if base.is_public() {
                return Ok(true);
            }
            if base.owner() == Some(target) {
                return Ok(true);
            }
            if base.is_licensed() && self.license_grants(&current, &source, &target, now).await? {
                return Ok(true);
            }
            if base.is_private() && base.has_rights_by_association() && depth > 0 {
                depth -= 1;
                let ref_id = match base.ref_id() {
                    Some(ref_id) => ref_id,
                    None => return Ok(false),
                };
                match self.load_live_node(&ref_id, now).await? {
                    Some(next) => {
                        current = next;
                        continue;
                    }
                    None => return Ok(false),
                }
            }
            return Ok(false);
        }
    }

    /// Whether a stored license row grants `(source, target)` access to the
    /// node, honoring retro-licensing and restrictive-mode flags
    async fn license_grants(
        &mut self,
        node: &Node,
        source: &[u8; 32],
        target: &[u8; 32],
        now: u64,
    ) -> Result<bool> {
        let hashes = node.base().licensee_match_hashes(source, target);
        if hashes.is_empty() {
            return Ok(false);
        }
        let params: Vec<SqlParam> = hashes
            .iter()
            .map(|hash| SqlParam::Bytes(hash.to_vec()))
            .collect();
        let sql = format!(
            "SELECT disallowRetroLicensing, restrictiveModeWriter, restrictiveModeManager, \
             creationTime, expireTime FROM licensing_hashes WHERE hash IN ({})",
            self.db.placeholders(params.len(), 1)
        );
        let node_creation = node.base().creation_time().unwrap_or(0);
        let tolerance = self.settings.now_tolerance_ms;
        for row in self.db.all(&sql, &params).await? {
            // Restrictive-mode rows parameterize write gating, not reads.
            if row.bool("restrictiveModeWriter")? || row.bool("restrictiveModeManager")? {
                continue;
            }
            let expire = row.int("expireTime")? as u64;
            if expire.saturating_add(tolerance) <= now {
                continue;
            }
            if row.bool("disallowRetroLicensing")? {
                let license_creation = row.int("creationTime")? as u64;
                if node_creation < license_creation {
                    continue;
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Resolve a traversal root, refusing ineligible nodes with a
    /// structured reason the fetcher surfaces verbatim
    pub async fn get_root_node(
        &mut self,
        query: &RootQuery,
        now: u64,
    ) -> Result<(Option<Node>, Option<String>)> {
        let refuse = |reason: &str| Ok((None, Some(reason.to_string())));

        let node = match self.load_live_node(&query.root_id1, now).await? {
            Some(node) => node,
            None => return refuse(REFUSAL_NOT_FOUND),
        };
        if self.is_destroyed(&node).await? {
            return refuse(REFUSAL_NOT_FOUND);
        }

        let base = node.base();
        if let (Some(node_region), Some(query_region)) = (base.region(), query.region.as_deref()) {
            if node_region != query_region {
                return refuse(REFUSAL_NO_ACCESS);
            }
        }
        if let (Some(node_jur), Some(query_jur)) =
            (base.jurisdiction(), query.jurisdiction.as_deref())
        {
            if node_jur != query_jur {
                return refuse(REFUSAL_NO_ACCESS);
            }
        }
        if base.is_private() && base.owner() != Some(query.target_public_key) {
            return refuse(REFUSAL_NO_ACCESS);
        }
        if base.is_licensed() {
            return refuse(REFUSAL_LICENSED);
        }
        if base.begins_restrictive_write() {
            return refuse(REFUSAL_RESTRICTIVE);
        }
        if base.has_rights_by_association() {
            return refuse(REFUSAL_RIGHTS_BY_ASSOCIATION);
        }
        Ok((Some(node), None))
    }

    // === Freshness ===

    /// Advance `updateTime` for rows matching the bump hashes and freshen
    /// their ancestor trails; returns the affected parent ids
    pub async fn bump_nodes(
        &mut self,
        bump_hashes: &[[u8; 32]],
        now: u64,
    ) -> Result<Vec<[u8; 32]>> {
        if bump_hashes.is_empty() {
            return Ok(Vec::new());
        }
        let timeout = self.settings.call_timeout_ms;
        let result = with_deadline(timeout, self.bump_nodes_outer(bump_hashes, now)).await;
        if matches!(result, Err(StorageError::Timeout)) {
            self.db.rollback().await.ok();
        }
        result
    }

    async fn bump_nodes_outer(
        &mut self,
        bump_hashes: &[[u8; 32]],
        now: u64,
    ) -> Result<Vec<[u8; 32]>> {
        self.db.begin_write().await?;
        match self.bump_nodes_tx(bump_hashes, now).await {
            Ok(parents) => {
                self.db.commit().await?;
                Ok(parents)
            }
            Err(err) => {
                self.db.rollback().await.ok();
                Err(err)
            }
        }
    }

    async fn bump_nodes_tx(
        &mut self,
        bump_hashes: &[[u8; 32]],
        now: u64,
    ) -> Result<Vec<[u8; 32]>> {
        let params: Vec<SqlParam> = bump_hashes
            .iter()
            .map(|hash| SqlParam::Bytes(hash.to_vec()))
            .collect();
        let list = self.db.placeholders(params.len(), 1);

        let select = format!("SELECT parentId FROM nodes WHERE bumpHash IN ({list})");
        let mut parents: Vec<[u8; 32]> = Vec::new();
        for row in self.db.all(&select, &params).await? {
            let parent = row.id32("parentId")?;
            if !parents.contains(&parent) {
                parents.push(parent);
            }
        }
        if parents.is_empty() {
            return Ok(parents);
        }

        // Monotone: an older `now` never rewinds the clocks.
        let update = format!(
            "UPDATE nodes SET updateTime = {}, trailUpdateTime = {} \
             WHERE bumpHash IN ({}) AND updateTime < {}",
            self.db.placeholder(1),
            self.db.placeholder(2),
            self.db.placeholders(params.len(), 3),
            self.db.placeholder(3 + params.len())
        );
        let mut update_params = vec![SqlParam::time(now), SqlParam::time(now)];
        update_params.extend(params.iter().cloned());
        update_params.push(SqlParam::time(now));
        self.db.run(&update, &update_params).await?;

        self.freshen_parent_trail_tx(&parents, now).await?;
        Ok(parents)
    }

    /// Set `trailUpdateTime := now` for each id and its ancestors, monotone
    /// and idempotent
    pub async fn freshen_parent_trail(
        &mut self,
        parent_ids: &[[u8; 32]],
        now: u64,
    ) -> Result<()> {
        if parent_ids.is_empty() {
            return Ok(());
        }
        self.db.begin_write().await?;
        match self.freshen_parent_trail_tx(parent_ids, now).await {
            Ok(()) => self.db.commit().await,
            Err(err) => {
                self.db.rollback().await.ok();
                Err(err)
            }
        }
    }

    async fn freshen_parent_trail_tx(
        &mut self,
        parent_ids: &[[u8; 32]],
        now: u64,
    ) -> Result<()> {
        let mut current: Vec<[u8; 32]> = parent_ids.to_vec();
        let mut visited: HashSet<[u8; 32]> = HashSet::new();

        while !current.is_empty() {
            current.retain(|id| visited.insert(*id));
            if current.is_empty() {
                break;
            }
            let params: Vec<SqlParam> = current
                .iter()
                .map(|id| SqlParam::Bytes(id.to_vec()))
                .collect();
            let list = self.db.placeholders(params.len(), 1);

            let update = format!(
                "UPDATE nodes SET trailUpdateTime = {} \
                 WHERE id IN ({}) AND trailUpdateTime < {}",
                self.db.placeholder(1),
                self.db.placeholders(params.len(), 2),
                self.db.placeholder(2 + params.len())
            );
            let mut update_params = vec![SqlParam::time(now)];
            update_params.extend(params.iter().cloned());
            update_params.push(SqlParam::time(now));
            self.db.run(&update, &update_params).await?;

            let select = format!("SELECT parentId FROM nodes WHERE id IN ({list})");
            let mut next: Vec<[u8; 32]> = Vec::new();
            for row in self.db.all(&select, &params).await? {
                let parent = row.id32("parentId")?;
                if !visited.contains(&parent) && !next.contains(&parent) {
                    next.push(parent);
                }
            }
            current = next;
        }
        Ok(())
    }

    // === Maintenance ===

    /// Number of stored nodes
    pub async fn node_count(&mut self) -> Result<i64> {
        let row = self
            .db
            .get("SELECT COUNT(*) AS n FROM nodes", &[])
            .await?
            .ok_or_else(|| StorageError::Db("count returned no row".to_string()))?;
        row.int("n")
    }

    /// A stored row's freshness clocks, for tests and operators
    pub async fn node_times(&mut self, id1: &[u8; 32]) -> Result<Option<(u64, u64)>> {
        let sql = format!(
            "SELECT updateTime, trailUpdateTime FROM nodes WHERE id1 = {}",
            self.db.placeholder(1)
        );
        let row = self
            .db
            .get(&sql, &[SqlParam::Bytes(id1.to_vec())])
            .await?;
        Ok(match row {
            Some(row) => Some((
                row.int("updateTime")? as u64,
                row.int("trailUpdateTime")? as u64,
            )),
            None => None,
        })
    }
}

/// The bump hash a license aims at its licensed node
pub(crate) fn target_bump_hash(parent_id: &[u8; 32], node_id1: &[u8; 32]) -> [u8; 32] {
    use trellis_crypto::{hash_parts, HashPart};
    use trellis_node::schema::tags;
    hash_parts(&[
        HashPart::Bytes(tags::BUMP),
        HashPart::Bytes(parent_id),
        HashPart::Bytes(node_id1),
    ])
}
