//! Content-addressed object store with two-phase uploads.
//!
//! An object starts `reserved` on first contact and accumulates chunks until
//! the upload is complete. Completion is signalled by `is_final` or by
//! reaching the declared size. The concatenated bytes are then hashed and
//! the object becomes `committed` only if the digest equals its ID. Metadata
//! lives in `objects`; raw bytes live in `object_chunks`, one row per
//! appended chunk.
//!
//! Internal tree nodes are stored as committed objects of kind `tree` holding
//! their canonical encoding, so message trees can be rebuilt from the arena
//! and shared between messages. Which IDs are expanded on rebuild comes from
//! the message, not from the stored kind.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::ObjectId;
use fleet_proto::{
    decode_children, ObjectChunk, ObjectInfo, ObjectKind, ObjectRange, ObjectState, ObjectTree,
    ObjectTreeEntry, PullObjectResponse,
};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::FleetSettings;
use crate::db::{self, millis, StoreError};
use crate::fleet::FleetError;

/// Result of applying one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Stored {
        state: ObjectState,
        received_bytes: u64,
    },
    /// Verification failed and the partial bytes were dropped.
    Discarded { reason: String },
}

#[derive(Debug, Clone)]
struct ObjectRow {
    kind: ObjectKind,
    state: ObjectState,
    declared_size: Option<u64>,
    received_bytes: u64,
    ref_count: u64,
}

#[derive(Debug, Clone)]
pub struct ObjectStore {
    max_chunk_bytes: usize,
    reservation_timeout: Duration,
    unreferenced_grace: Duration,
    not_ready_retry: Duration,
}

impl ObjectStore {
    pub fn new(settings: &FleetSettings) -> Self {
        Self {
            max_chunk_bytes: settings.max_chunk_bytes,
            reservation_timeout: settings.reservation_timeout,
            unreferenced_grace: settings.unreferenced_object_grace,
            not_ready_retry: settings.not_ready_retry,
        }
    }

    /// Makes sure a leaf exists, reserving it if unknown. Returns its state.
    pub fn preregister_leaf(
        &self,
        conn: &Connection,
        object_id: ObjectId,
        now: DateTime<Utc>,
    ) -> Result<ObjectState, FleetError> {
        conn.execute(
            r#"
            INSERT OR IGNORE INTO objects (object_id, kind, state, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            "#,
            params![
                object_id.to_hex(),
                ObjectKind::Blob.as_str(),
                ObjectState::Reserved.as_str(),
                millis(now),
            ],
        )?;

        let row = self
            .row(conn, object_id)?
            .ok_or_else(|| FleetError::not_found(format!("object {object_id}")))?;
        Ok(row.state)
    }

    /// Stores an internal tree node as a committed object.
    pub fn put_tree_node(
        &self,
        conn: &Connection,
        object_id: ObjectId,
        content: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), FleetError> {
        if !object_id.matches(content) {
            return Err(FleetError::invalid(format!(
                "tree node {object_id} does not match its encoding"
            )));
        }

        match self.row(conn, object_id)? {
            Some(row) if row.state == ObjectState::Committed => {
                // Committed bytes already hash to the ID, so they are this encoding.
                if row.kind != ObjectKind::Tree {
                    conn.execute(
                        "UPDATE objects SET kind = ?2, updated_at = ?3 WHERE object_id = ?1",
                        params![object_id.to_hex(), ObjectKind::Tree.as_str(), millis(now)],
                    )?;
                    debug!(object_id = %object_id, "Committed blob marked as tree node");
                }
                return Ok(());
            }
            Some(_) => {
                conn.execute(
                    "DELETE FROM object_chunks WHERE object_id = ?1",
                    params![object_id.to_hex()],
                )?;
            }
            None => {
                conn.execute(
                    r#"
                    INSERT INTO objects (object_id, kind, state, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?4)
                    "#,
                    params![
                        object_id.to_hex(),
                        ObjectKind::Tree.as_str(),
                        ObjectState::Reserved.as_str(),
                        millis(now),
                    ],
                )?;
            }
        }

        insert_chunk(conn, object_id, 0, content)?;
        let size = content.len() as i64;
        conn.execute(
            r#"
            UPDATE objects
            SET kind = ?2, state = ?3, declared_size = ?4, received_bytes = ?4, updated_at = ?5
            WHERE object_id = ?1
            "#,
            params![
                object_id.to_hex(),
                ObjectKind::Tree.as_str(),
                ObjectState::Committed.as_str(),
                size,
                millis(now),
            ],
        )?;

        debug!(object_id = %object_id, size, "Tree node stored");
        Ok(())
    }

    /// Applies one upload chunk.
    ///
    /// Chunks append at the received length. A chunk lying inside bytes that
    /// were already received must match them and is skipped, which makes
    /// retries and racing identical uploads harmless.
    pub fn push_chunk(
        &self,
        conn: &Connection,
        chunk: &ObjectChunk,
        now: DateTime<Utc>,
    ) -> Result<ChunkOutcome, FleetError> {
        let object_id = chunk.object_id;
        let len = chunk.content.len() as u64;

        if chunk.content.len() > self.max_chunk_bytes {
            return Err(FleetError::invalid(format!(
                "chunk of {len} bytes exceeds the {} byte limit",
                self.max_chunk_bytes
            )));
        }

        let row = match self.row(conn, object_id)? {
            Some(row) => row,
            None => {
                self.preregister_leaf(conn, object_id, now)?;
                self.row(conn, object_id)?
                    .ok_or_else(|| FleetError::not_found(format!("object {object_id}")))?
            }
        };

        if row.state == ObjectState::Committed {
            return Ok(ChunkOutcome::Stored {
                state: ObjectState::Committed,
                received_bytes: row.received_bytes,
            });
        }

        let mut declared = row.declared_size;
        if let Some(total) = chunk.total_size {
            match declared {
                Some(existing) if existing != total => {
                    return Err(FleetError::invalid(format!(
                        "object {object_id} was declared as {existing} bytes, not {total}"
                    )));
                }
                _ => declared = Some(total),
            }
        }

        let received = row.received_bytes;
        let offset = chunk.offset.unwrap_or(received);
        if offset > received {
            return Err(FleetError::invalid(format!(
                "chunk at offset {offset} leaves a gap after {received} received bytes"
            )));
        }

        let end = offset + len;
        if offset < received {
            let overlap_end = end.min(received);
            let stored = read_range(conn, object_id, offset, overlap_end - offset)?;
            if stored[..] != chunk.content[..(overlap_end - offset) as usize] {
                return Err(FleetError::invalid(format!(
                    "chunk at offset {offset} conflicts with bytes already received"
                )));
            }
        }

        let mut now_received = received;
        if end > received {
            let tail = &chunk.content[(received - offset) as usize..];
            insert_chunk(conn, object_id, received, tail)?;
            now_received = end;
        }

        if let Some(total) = declared {
            if now_received > total {
                let reason = format!("received {now_received} bytes, declared {total}");
                return self.discard(conn, object_id, &row, reason, now);
            }
        }

        let complete = chunk.is_final || declared == Some(now_received);
        if !complete {
            conn.execute(
                r#"
                UPDATE objects SET declared_size = ?2, received_bytes = ?3, updated_at = ?4
                WHERE object_id = ?1
                "#,
                params![
                    object_id.to_hex(),
                    declared.map(|d| d as i64),
                    now_received as i64,
                    millis(now),
                ],
            )?;
            return Ok(ChunkOutcome::Stored {
                state: ObjectState::Reserved,
                received_bytes: now_received,
            });
        }

        if let Some(total) = declared {
            if total != now_received {
                let reason = format!("upload finished at {now_received} bytes, declared {total}");
                return self.discard(conn, object_id, &row, reason, now);
            }
        }

        let digest = hash_chunks(conn, object_id)?;
        if digest != object_id {
            let reason = format!("content hashes to {digest}");
            return self.discard(conn, object_id, &row, reason, now);
        }

        conn.execute(
            r#"
            UPDATE objects
            SET state = ?2, declared_size = ?3, received_bytes = ?3, updated_at = ?4
            WHERE object_id = ?1
            "#,
            params![
                object_id.to_hex(),
                ObjectState::Committed.as_str(),
                now_received as i64,
                millis(now),
            ],
        )?;

        info!(object_id = %object_id, size = now_received, "Object committed");
        Ok(ChunkOutcome::Stored {
            state: ObjectState::Committed,
            received_bytes: now_received,
        })
    }

    fn discard(
        &self,
        conn: &Connection,
        object_id: ObjectId,
        row: &ObjectRow,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<ChunkOutcome, FleetError> {
        reset_or_delete(conn, object_id, row.ref_count, now)?;
        warn!(object_id = %object_id, reason = %reason, "Object upload discarded");
        Ok(ChunkOutcome::Discarded { reason })
    }

    /// Reads a slice of a committed object, capped at the chunk limit.
    pub fn pull_range(
        &self,
        conn: &Connection,
        range: &ObjectRange,
    ) -> Result<PullObjectResponse, FleetError> {
        let object_id = range.object_id;
        let row = self
            .row(conn, object_id)?
            .ok_or_else(|| FleetError::not_found(format!("object {object_id}")))?;

        if row.state != ObjectState::Committed {
            return Err(FleetError::NotReady {
                object_id,
                retry_after: self.not_ready_retry,
            });
        }

        let size = row.received_bytes;
        if range.offset > size {
            return Err(FleetError::invalid(format!(
                "offset {} is past the end of a {size} byte object",
                range.offset
            )));
        }

        let available = size - range.offset;
        let len = range
            .length
            .unwrap_or(available)
            .min(available)
            .min(self.max_chunk_bytes as u64);
        let content = read_range(conn, object_id, range.offset, len)?;

        Ok(PullObjectResponse {
            content,
            is_final: range.offset + len == size,
            total_size: size,
        })
    }

    pub fn get_meta(
        &self,
        conn: &Connection,
        object_id: ObjectId,
    ) -> Result<Option<ObjectInfo>, FleetError> {
        let info = conn
            .query_row(
                r#"
                SELECT kind, state, declared_size, received_bytes, ref_count, created_at, updated_at
                FROM objects WHERE object_id = ?1
                "#,
                params![object_id.to_hex()],
                |row| {
                    let declared: Option<i64> = row.get(2)?;
                    Ok(ObjectInfo {
                        object_id,
                        kind: db::get_enum(row, 0)?,
                        state: db::get_enum(row, 1)?,
                        declared_size: declared.map(|d| d as u64),
                        received_bytes: db::get_u64(row, 3)?,
                        ref_count: db::get_u64(row, 4)?,
                        created_at: db::get_time(row, 5)?,
                        updated_at: db::get_time(row, 6)?,
                    })
                },
            )
            .optional()?;
        Ok(info)
    }

    /// Adds one message reference.
    pub fn retain(
        &self,
        conn: &Connection,
        object_id: ObjectId,
        now: DateTime<Utc>,
    ) -> Result<(), FleetError> {
        let updated = conn.execute(
            "UPDATE objects SET ref_count = ref_count + 1, updated_at = ?2 WHERE object_id = ?1",
            params![object_id.to_hex(), millis(now)],
        )?;
        if updated == 0 {
            return Err(FleetError::not_found(format!("object {object_id}")));
        }
        Ok(())
    }

    /// Drops one message reference.
    pub fn release(
        &self,
        conn: &Connection,
        object_id: ObjectId,
        now: DateTime<Utc>,
    ) -> Result<(), FleetError> {
        conn.execute(
            r#"
            UPDATE objects SET ref_count = MAX(ref_count - 1, 0), updated_at = ?2
            WHERE object_id = ?1
            "#,
            params![object_id.to_hex(), millis(now)],
        )?;
        Ok(())
    }

    /// True once no message, acknowledged or not, still holds a reference.
    pub fn is_collectible(&self, conn: &Connection, object_id: ObjectId) -> Result<bool, FleetError> {
        let collectible: Option<bool> = conn
            .query_row(
                r#"
                SELECT o.ref_count = 0 AND NOT EXISTS (
                    SELECT 1 FROM message_objects mo
                    JOIN messages m ON m.message_id = mo.message_id
                    WHERE mo.object_id = o.object_id AND m.acknowledged_at IS NULL
                )
                FROM objects o WHERE o.object_id = ?1
                "#,
                params![object_id.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(collectible.unwrap_or(false))
    }

    /// Drops partial bytes of reservations nobody touched within the timeout.
    pub fn reclaim_abandoned(
        &self,
        conn: &Connection,
        now: DateTime<Utc>,
    ) -> Result<Vec<ObjectId>, FleetError> {
        let cutoff = cutoff(now, self.reservation_timeout);
        let mut stmt = conn.prepare(
            r#"
            SELECT object_id, ref_count FROM objects
            WHERE state = ?1 AND updated_at < ?2 AND (ref_count = 0 OR received_bytes > 0)
            ORDER BY object_id
            "#,
        )?;
        let stale = stmt
            .query_map(params![ObjectState::Reserved.as_str(), millis(cutoff)], |row| {
                Ok((db::get_object_id(row, 0)?, db::get_u64(row, 1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for (object_id, ref_count) in &stale {
            reset_or_delete(conn, *object_id, *ref_count, now)?;
            debug!(object_id = %object_id, ref_count, "Abandoned reservation reclaimed");
        }

        Ok(stale.into_iter().map(|(id, _)| id).collect())
    }

    /// Deletes committed objects that have been unreferenced for the grace period.
    pub fn collect_garbage(
        &self,
        conn: &Connection,
        now: DateTime<Utc>,
    ) -> Result<Vec<ObjectId>, FleetError> {
        let cutoff = cutoff(now, self.unreferenced_grace);
        let mut stmt = conn.prepare(
            r#"
            SELECT o.object_id FROM objects o
            WHERE o.state = ?1 AND o.ref_count = 0 AND o.updated_at < ?2
              AND NOT EXISTS (
                SELECT 1 FROM message_objects mo
                JOIN messages m ON m.message_id = mo.message_id
                WHERE mo.object_id = o.object_id AND m.acknowledged_at IS NULL
              )
            ORDER BY o.object_id
            "#,
        )?;
        let garbage = stmt
            .query_map(params![ObjectState::Committed.as_str(), millis(cutoff)], |row| {
                db::get_object_id(row, 0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        for object_id in &garbage {
            delete_object(conn, *object_id)?;
            debug!(object_id = %object_id, "Unreferenced object collected");
        }

        Ok(garbage)
    }

    /// Rebuilds the tree rooted at `root` from stored tree nodes.
    ///
    /// Only IDs in `internal` are expanded; everything else is a leaf, whatever
    /// its stored kind. The set is the shape the message was pushed with.
    pub fn load_tree(
        &self,
        conn: &Connection,
        root: ObjectId,
        internal: &BTreeSet<ObjectId>,
        max_depth: usize,
    ) -> Result<ObjectTree, FleetError> {
        let mut memo = HashMap::new();
        self.load_subtree(conn, root, internal, 1, max_depth, &mut memo)
    }

    fn load_subtree(
        &self,
        conn: &Connection,
        object_id: ObjectId,
        internal: &BTreeSet<ObjectId>,
        depth: usize,
        max_depth: usize,
        memo: &mut HashMap<ObjectId, ObjectTree>,
    ) -> Result<ObjectTree, FleetError> {
        if let Some(tree) = memo.get(&object_id) {
            return Ok(tree.clone());
        }
        if depth > max_depth {
            return Err(StoreError::Corrupt(format!("tree under {object_id} is too deep")).into());
        }
        if !internal.contains(&object_id) {
            return Ok(ObjectTree::leaf(object_id));
        }

        let row = self
            .row(conn, object_id)?
            .filter(|row| row.state == ObjectState::Committed)
            .ok_or_else(|| StoreError::Corrupt(format!("tree node {object_id} is not stored")))?;

        let content = read_range(conn, object_id, 0, row.received_bytes)?;
        let listing = decode_children(&content).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let mut children = Vec::with_capacity(listing.len());
        for (name, child) in listing {
            let subtree = self.load_subtree(conn, child, internal, depth + 1, max_depth, memo)?;
            children.push(ObjectTreeEntry::new(name, subtree));
        }
        let tree = ObjectTree {
            object_id,
            children,
        };

        memo.insert(object_id, tree.clone());
        Ok(tree)
    }

    fn row(&self, conn: &Connection, object_id: ObjectId) -> Result<Option<ObjectRow>, FleetError> {
        let row = conn
            .query_row(
                r#"
                SELECT kind, state, declared_size, received_bytes, ref_count
                FROM objects WHERE object_id = ?1
                "#,
                params![object_id.to_hex()],
                |row| {
                    let declared: Option<i64> = row.get(2)?;
                    Ok(ObjectRow {
                        kind: db::get_enum(row, 0)?,
                        state: db::get_enum(row, 1)?,
                        declared_size: declared.map(|d| d as u64),
                        received_bytes: db::get_u64(row, 3)?,
                        ref_count: db::get_u64(row, 4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn insert_chunk(
    conn: &Connection,
    object_id: ObjectId,
    offset: u64,
    data: &[u8],
) -> Result<(), FleetError> {
    if data.is_empty() {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO object_chunks (object_id, chunk_offset, data) VALUES (?1, ?2, ?3)",
        params![object_id.to_hex(), offset as i64, data],
    )?;
    Ok(())
}

fn read_range(
    conn: &Connection,
    object_id: ObjectId,
    start: u64,
    len: u64,
) -> Result<Vec<u8>, FleetError> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let end = start + len;

    let mut stmt = conn.prepare(
        r#"
        SELECT chunk_offset, data FROM object_chunks
        WHERE object_id = ?1 AND chunk_offset < ?3 AND chunk_offset + length(data) > ?2
        ORDER BY chunk_offset
        "#,
    )?;
    let mut rows = stmt.query(params![object_id.to_hex(), start as i64, end as i64])?;

    let mut out = Vec::with_capacity(len as usize);
    while let Some(row) = rows.next()? {
        let offset = db::get_u64(row, 0)?;
        let data: Vec<u8> = row.get(1)?;
        let from = (start.max(offset) - offset) as usize;
        let to = (end.min(offset + data.len() as u64) - offset) as usize;
        out.extend_from_slice(&data[from..to]);
    }

    if out.len() as u64 != len {
        return Err(StoreError::Corrupt(format!(
            "object {object_id} is missing bytes in [{start}, {end})"
        ))
        .into());
    }
    Ok(out)
}

fn hash_chunks(conn: &Connection, object_id: ObjectId) -> Result<ObjectId, FleetError> {
    let mut stmt = conn
        .prepare("SELECT data FROM object_chunks WHERE object_id = ?1 ORDER BY chunk_offset")?;
    let mut rows = stmt.query(params![object_id.to_hex()])?;

    let mut hasher = Sha256::new();
    while let Some(row) = rows.next()? {
        let data: Vec<u8> = row.get(0)?;
        hasher.update(&data);
    }
    Ok(ObjectId::from_digest(hasher.finalize().into()))
}

/// Drops partial bytes. Unreferenced records go away; referenced ones become
/// an empty reservation so the owning message can still be completed.
fn reset_or_delete(
    conn: &Connection,
    object_id: ObjectId,
    ref_count: u64,
    now: DateTime<Utc>,
) -> Result<(), FleetError> {
    if ref_count == 0 {
        return delete_object(conn, object_id);
    }

    conn.execute(
        "DELETE FROM object_chunks WHERE object_id = ?1",
        params![object_id.to_hex()],
    )?;
    conn.execute(
        r#"
        UPDATE objects SET state = ?2, declared_size = NULL, received_bytes = 0, updated_at = ?3
        WHERE object_id = ?1
        "#,
        params![
            object_id.to_hex(),
            ObjectState::Reserved.as_str(),
            millis(now)
        ],
    )?;
    Ok(())
}

fn delete_object(conn: &Connection, object_id: ObjectId) -> Result<(), FleetError> {
    conn.execute(
        "DELETE FROM object_chunks WHERE object_id = ?1",
        params![object_id.to_hex()],
    )?;
    conn.execute(
        "DELETE FROM objects WHERE object_id = ?1",
        params![object_id.to_hex()],
    )?;
    Ok(())
}
