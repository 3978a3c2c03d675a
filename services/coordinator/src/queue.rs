//! Per-node message queue.
//!
//! Messages stay queued until the destination acknowledges them or their TTL
//! runs out. Pulling is a read: the same message is returned again until it
//! is confirmed. A message is only deliverable once every object in its tree
//! is committed.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::{MessageId, NodeId, ObjectId};
use fleet_proto::{FlatTree, Message, ObjectState};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::config::FleetSettings;
use crate::db::{self, millis, sql_id};
use crate::fleet::FleetError;
use crate::objects::ObjectStore;

const MESSAGE_COLUMNS: &str = "m.seq, m.message_id, m.run_id, m.src_node_id, m.dst_node_id, \
     m.message_type, m.reply_to, m.group_id, m.root_object_id, m.created_at, m.ttl_ms, \
     m.expires_at, m.delivered_at, m.acknowledged_at";

/// Unacknowledged, unexpired, and every referenced object committed.
const DELIVERABLE: &str = r#"
    m.dst_node_id = ?1
    AND m.acknowledged_at IS NULL
    AND m.expires_at > ?2
    AND NOT EXISTS (
        SELECT 1 FROM message_objects mo
        LEFT JOIN objects o ON o.object_id = mo.object_id
        WHERE mo.message_id = m.message_id AND (o.state IS NULL OR o.state <> ?3)
    )
"#;

/// A queued message with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    /// `created_at` and `ttl` are always set.
    pub message: Message,
    pub root_object_id: ObjectId,
    pub ttl: Duration,
    pub expires_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    /// True if `message` is a retry of this one rather than a different
    /// message reusing the ID.
    pub fn same_content(&self, message: &Message, ttl: Duration, root: ObjectId) -> bool {
        let stored = &self.message;
        stored.run_id == message.run_id
            && stored.src_node_id == message.src_node_id
            && stored.dst_node_id == message.dst_node_id
            && stored.message_type == message.message_type
            && stored.reply_to_message_id == message.reply_to_message_id
            && stored.group_id == message.group_id
            && self.root_object_id == root
            && db::duration_millis(self.ttl) == db::duration_millis(ttl)
    }
}

#[derive(Debug, Clone)]
pub struct MessageQueue {
    default_ttl: Duration,
    max_ttl: Duration,
    max_pull: usize,
}

impl MessageQueue {
    pub fn new(settings: &FleetSettings) -> Self {
        Self {
            default_ttl: settings.default_message_ttl,
            max_ttl: settings.max_message_ttl,
            max_pull: settings.max_pull_messages,
        }
    }

    /// Resolves a requested TTL. `None` means the request is malformed.
    pub fn resolve_ttl(&self, ttl: Option<f64>) -> Option<Duration> {
        match ttl {
            None => Some(self.default_ttl),
            Some(secs) if secs.is_finite() && secs > 0.0 => Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|ttl| *ttl <= self.max_ttl),
            Some(_) => None,
        }
    }

    /// Stores a new message and takes one reference on each object it uses.
    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &self,
        conn: &Connection,
        objects: &ObjectStore,
        message: &Message,
        ttl: Duration,
        tree: &FlatTree,
        now: DateTime<Utc>,
    ) -> Result<(), FleetError> {
        let root = tree.root().object_id;
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        conn.execute(
            r#"
            INSERT INTO messages (
                message_id, run_id, src_node_id, dst_node_id, message_type, reply_to, group_id,
                root_object_id, created_at, ttl_ms, expires_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
            params![
                message.message_id.to_string(),
                sql_id(message.run_id.get()),
                sql_id(message.src_node_id.get()),
                sql_id(message.dst_node_id.get()),
                message.message_type,
                message.reply_to_message_id.map(|id| id.to_string()),
                message.group_id,
                root.to_hex(),
                millis(now),
                db::duration_millis(ttl),
                millis(expires_at),
            ],
        )?;

        for node in tree.nodes() {
            conn.execute(
                "INSERT INTO message_objects (message_id, object_id, is_leaf) VALUES (?1, ?2, ?3)",
                params![
                    message.message_id.to_string(),
                    node.object_id.to_hex(),
                    node.is_leaf()
                ],
            )?;
            objects.retain(conn, node.object_id, now)?;
        }

        info!(
            message_id = %message.message_id,
            run_id = %message.run_id,
            src_node_id = %message.src_node_id,
            dst_node_id = %message.dst_node_id,
            message_type = %message.message_type,
            objects = tree.nodes().len(),
            "Message accepted"
        );
        Ok(())
    }

    pub fn get(
        &self,
        conn: &Connection,
        message_id: MessageId,
    ) -> Result<Option<StoredMessage>, FleetError> {
        let stored = conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.message_id = ?1"),
                params![message_id.to_string()],
                |row| map_message(row).map(|(_, stored)| stored),
            )
            .optional()?;
        Ok(stored)
    }

    /// Objects pushed as internal tree nodes of `message_id`.
    pub fn internal_objects(
        &self,
        conn: &Connection,
        message_id: MessageId,
    ) -> Result<BTreeSet<ObjectId>, FleetError> {
        let mut stmt = conn.prepare(
            "SELECT object_id FROM message_objects WHERE message_id = ?1 AND is_leaf = 0",
        )?;
        let ids = stmt
            .query_map(params![message_id.to_string()], |row| db::get_object_id(row, 0))?
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(ids)
    }

    /// Returns deliverable messages for `dst`, oldest first.
    ///
    /// An empty `message_ids` means everything deliverable up to the pull
    /// limit; otherwise only the listed messages that are deliverable.
    pub fn pull(
        &self,
        conn: &Connection,
        dst: NodeId,
        message_ids: &[MessageId],
        now: DateTime<Utc>,
    ) -> Result<Vec<StoredMessage>, FleetError> {
        let committed = ObjectState::Committed.as_str();
        let mut found: Vec<(i64, StoredMessage)> = Vec::new();

        if message_ids.is_empty() {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m WHERE {DELIVERABLE} \
                 ORDER BY m.created_at, m.seq LIMIT ?4"
            ))?;
            found = stmt
                .query_map(
                    params![
                        sql_id(dst.get()),
                        millis(now),
                        committed,
                        self.max_pull as i64
                    ],
                    map_message,
                )?
                .collect::<Result<Vec<_>, _>>()?;
        } else {
            let wanted: BTreeSet<MessageId> = message_ids.iter().copied().collect();
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages m WHERE {DELIVERABLE} AND m.message_id = ?4"
            ))?;
            for message_id in wanted {
                let hit = stmt
                    .query_row(
                        params![
                            sql_id(dst.get()),
                            millis(now),
                            committed,
                            message_id.to_string()
                        ],
                        map_message,
                    )
                    .optional()?;
                found.extend(hit);
            }
            found.sort_by_key(|(seq, stored)| (stored.message.created_at, *seq));
            found.truncate(self.max_pull);
        }

        let mut messages = Vec::with_capacity(found.len());
        for (_, mut stored) in found {
            if stored.delivered_at.is_none() {
                conn.execute(
                    "UPDATE messages SET delivered_at = ?2 WHERE message_id = ?1",
                    params![stored.message.message_id.to_string(), millis(now)],
                )?;
                stored.delivered_at = Some(now);
            }
            messages.push(stored);
        }

        debug!(node_id = %dst, count = messages.len(), "Messages pulled");
        Ok(messages)
    }

    /// Acknowledges a message and releases its object references.
    /// Confirming twice is a no-op.
    pub fn confirm(
        &self,
        conn: &Connection,
        objects: &ObjectStore,
        dst: NodeId,
        message_id: MessageId,
        now: DateTime<Utc>,
    ) -> Result<(), FleetError> {
        let stored = self
            .get(conn, message_id)?
            .filter(|stored| stored.message.dst_node_id == dst)
            .ok_or_else(|| FleetError::not_found(format!("message {message_id}")))?;

        if stored.acknowledged_at.is_some() {
            return Ok(());
        }
        if stored.expires_at <= now {
            return Err(FleetError::not_found(format!("message {message_id}")));
        }

        conn.execute(
            "UPDATE messages SET acknowledged_at = ?2 WHERE message_id = ?1",
            params![message_id.to_string(), millis(now)],
        )?;
        for object_id in referenced_objects(conn, message_id)? {
            objects.release(conn, object_id, now)?;
        }

        info!(message_id = %message_id, node_id = %dst, "Message acknowledged");
        Ok(())
    }

    /// Drops unacknowledged messages whose TTL has run out.
    pub fn expire(
        &self,
        conn: &Connection,
        objects: &ObjectStore,
        now: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, FleetError> {
        let mut stmt = conn.prepare(
            r#"
            SELECT message_id FROM messages
            WHERE acknowledged_at IS NULL AND expires_at <= ?1
            ORDER BY seq
            "#,
        )?;
        let expired = stmt
            .query_map(params![millis(now)], |row| db::get_message_id(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;

        for message_id in &expired {
            for object_id in referenced_objects(conn, *message_id)? {
                objects.release(conn, object_id, now)?;
            }
            delete_message(conn, *message_id)?;
            info!(message_id = %message_id, "Message expired before acknowledgment");
        }

        Ok(expired)
    }

    /// Deletes acknowledged messages. Returns how many were removed.
    pub fn purge_acknowledged(&self, conn: &Connection) -> Result<usize, FleetError> {
        conn.execute(
            r#"
            DELETE FROM message_objects WHERE message_id IN (
                SELECT message_id FROM messages WHERE acknowledged_at IS NOT NULL
            )
            "#,
            [],
        )?;
        let purged = conn.execute("DELETE FROM messages WHERE acknowledged_at IS NOT NULL", [])?;
        Ok(purged)
    }
}

fn referenced_objects(conn: &Connection, message_id: MessageId) -> Result<Vec<ObjectId>, FleetError> {
    let mut stmt = conn.prepare("SELECT object_id FROM message_objects WHERE message_id = ?1")?;
    let ids = stmt
        .query_map(params![message_id.to_string()], |row| {
            db::get_object_id(row, 0)
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn delete_message(conn: &Connection, message_id: MessageId) -> Result<(), FleetError> {
    conn.execute(
        "DELETE FROM message_objects WHERE message_id = ?1",
        params![message_id.to_string()],
    )?;
    conn.execute(
        "DELETE FROM messages WHERE message_id = ?1",
        params![message_id.to_string()],
    )?;
    Ok(())
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<(i64, StoredMessage)> {
    let ttl_ms: i64 = row.get(10)?;
    let ttl = Duration::from_millis(u64::try_from(ttl_ms).unwrap_or(0));
    let created_at = db::get_time(row, 9)?;

    let message = Message {
        message_id: db::get_message_id(row, 1)?,
        run_id: db::get_run_id(row, 2)?,
        src_node_id: db::get_node_id(row, 3)?,
        dst_node_id: db::get_node_id(row, 4)?,
        message_type: row.get(5)?,
        reply_to_message_id: db::get_opt_message_id(row, 6)?,
        group_id: row.get(7)?,
        created_at: Some(created_at),
        ttl: Some(ttl.as_secs_f64()),
    };

    Ok((
        row.get(0)?,
        StoredMessage {
            message,
            root_object_id: db::get_object_id(row, 8)?,
            ttl,
            expires_at: db::get_time(row, 11)?,
            delivered_at: db::get_opt_time(row, 12)?,
            acknowledged_at: db::get_opt_time(row, 13)?,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use fleet_id::RunId;
    use fleet_proto::{ObjectChunk, ObjectTree, TreeLimits};
    use rstest::rstest;

    struct Fixture {
        store: Store,
        queue: MessageQueue,
        objects: ObjectStore,
        now: DateTime<Utc>,
    }

    fn fixture() -> Fixture {
        let settings = FleetSettings::default();
        Fixture {
            store: Store::open_in_memory().unwrap(),
            queue: MessageQueue::new(&settings),
            objects: ObjectStore::new(&settings),
            now: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
        }
    }

    fn leaf_tree(id: ObjectId) -> FlatTree {
        FlatTree::from_tree(&ObjectTree::leaf(id), &TreeLimits::default()).unwrap()
    }

    fn message(dst: u64) -> Message {
        Message {
            message_id: MessageId::new(),
            run_id: RunId::new(1).unwrap(),
            src_node_id: NodeId::COORDINATOR,
            dst_node_id: NodeId::new(dst).unwrap(),
            message_type: "train".to_string(),
            reply_to_message_id: None,
            group_id: None,
            created_at: None,
            ttl: None,
        }
    }

    impl Fixture {
        fn enqueue(&self, message: &Message, content: &[u8], at: DateTime<Utc>) -> ObjectId {
            let id = ObjectId::from_content(content);
            let ttl = self.queue.resolve_ttl(message.ttl).unwrap();
            self.store
                .write(|tx| {
                    self.objects.preregister_leaf(tx, id, at)?;
                    self.queue.push(tx, &self.objects, message, ttl, &leaf_tree(id), at)
                })
                .unwrap();
            id
        }

        fn commit(&self, content: &[u8]) {
            let chunk = ObjectChunk {
                object_id: ObjectId::from_content(content),
                content: content.to_vec(),
                offset: None,
                total_size: None,
                is_final: true,
            };
            self.store
                .write(|tx| self.objects.push_chunk(tx, &chunk, self.now))
                .unwrap();
        }

        fn pull(&self, dst: u64, ids: &[MessageId], at: DateTime<Utc>) -> Vec<StoredMessage> {
            self.store
                .write(|tx| self.queue.pull(tx, NodeId::new(dst).unwrap(), ids, at))
                .unwrap()
        }

        fn confirm(&self, dst: u64, id: MessageId, at: DateTime<Utc>) -> Result<(), FleetError> {
            self.store.write(|tx| {
                self.queue
                    .confirm(tx, &self.objects, NodeId::new(dst).unwrap(), id, at)
            })
        }
    }

    #[test]
    fn test_uncommitted_messages_are_held_back() {
        let f = fixture();
        let m = message(7);
        f.enqueue(&m, b"payload", f.now);

        assert!(f.pull(7, &[], f.now).is_empty());
        assert!(f.pull(7, &[m.message_id], f.now).is_empty());

        f.commit(b"payload");
        let pulled = f.pull(7, &[], f.now);
        assert_eq!(pulled.len(), 1);
        assert_eq!(pulled[0].message.message_id, m.message_id);
        assert_eq!(pulled[0].message.created_at, Some(f.now));
    }

    #[test]
    fn test_pull_is_idempotent_until_confirmed() {
        let f = fixture();
        let m = message(7);
        f.enqueue(&m, b"payload", f.now);
        f.commit(b"payload");

        let first = f.pull(7, &[], f.now);
        let second = f.pull(7, &[], f.now + chrono::Duration::seconds(1));
        assert_eq!(first, second);
        assert_eq!(first[0].delivered_at, Some(f.now));

        f.confirm(7, m.message_id, f.now).unwrap();
        assert!(f.pull(7, &[], f.now).is_empty());
    }

    #[test]
    fn test_pull_orders_oldest_first_and_caps() {
        let f = fixture();
        let mut ids = Vec::new();
        for i in 0..70 {
            let m = message(7);
            let at = f.now + chrono::Duration::milliseconds(i);
            // Insert in reverse time order to prove ordering is by created_at.
            let at = f.now + chrono::Duration::milliseconds(100) - (at - f.now);
            f.enqueue(&m, b"shared", at);
            ids.push((at, m.message_id));
        }
        f.commit(b"shared");

        let pulled = f.pull(7, &[], f.now + chrono::Duration::seconds(1));
        assert_eq!(pulled.len(), 64);
        ids.sort();
        let expected: Vec<MessageId> = ids.iter().take(64).map(|(_, id)| *id).collect();
        let got: Vec<MessageId> = pulled.iter().map(|s| s.message.message_id).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn test_pull_only_returns_own_messages() {
        let f = fixture();
        let m = message(7);
        f.enqueue(&m, b"payload", f.now);
        f.commit(b"payload");

        assert!(f.pull(8, &[], f.now).is_empty());
        assert!(f.pull(8, &[m.message_id], f.now).is_empty());
        assert!(matches!(
            f.confirm(8, m.message_id, f.now),
            Err(FleetError::NotFound(_))
        ));
    }

    #[test]
    fn test_confirm_twice_is_ok() {
        let f = fixture();
        let m = message(7);
        f.enqueue(&m, b"payload", f.now);
        f.commit(b"payload");

        f.confirm(7, m.message_id, f.now).unwrap();
        f.confirm(7, m.message_id, f.now).unwrap();

        let id = ObjectId::from_content(b"payload");
        let meta = f
            .store
            .read(|conn| f.objects.get_meta(conn, id))
            .unwrap()
            .unwrap();
        assert_eq!(meta.ref_count, 0);
    }

    #[test]
    fn test_confirm_unknown_message_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.confirm(7, MessageId::new(), f.now),
            Err(FleetError::NotFound(_))
        ));
    }

    #[test]
    fn test_shared_object_survives_first_ack() {
        let f = fixture();
        let a = message(7);
        let b = message(8);
        let id = f.enqueue(&a, b"broadcast", f.now);
        f.enqueue(&b, b"broadcast", f.now);
        f.commit(b"broadcast");

        f.confirm(7, a.message_id, f.now).unwrap();
        assert!(!f.store.read(|conn| f.objects.is_collectible(conn, id)).unwrap());

        f.confirm(8, b.message_id, f.now).unwrap();
        assert!(f.store.read(|conn| f.objects.is_collectible(conn, id)).unwrap());
    }

    #[test]
    fn test_expired_messages_are_dropped() {
        let f = fixture();
        let mut m = message(7);
        m.ttl = Some(10.0);
        let id = f.enqueue(&m, b"payload", f.now);
        f.commit(b"payload");

        let later = f.now + chrono::Duration::seconds(10);
        assert!(f.pull(7, &[], later).is_empty());
        assert!(matches!(
            f.confirm(7, m.message_id, later),
            Err(FleetError::NotFound(_))
        ));

        let expired = f
            .store
            .write(|tx| f.queue.expire(tx, &f.objects, later))
            .unwrap();
        assert_eq!(expired, vec![m.message_id]);
        assert!(f.store.read(|conn| f.queue.get(conn, m.message_id)).unwrap().is_none());
        assert!(f.store.read(|conn| f.objects.is_collectible(conn, id)).unwrap());
    }

    #[test]
    fn test_purge_removes_only_acknowledged() {
        let f = fixture();
        let acked = message(7);
        let pending = message(7);
        f.enqueue(&acked, b"a", f.now);
        f.enqueue(&pending, b"b", f.now);
        f.commit(b"a");
        f.confirm(7, acked.message_id, f.now).unwrap();

        let purged = f
            .store
            .write(|tx| f.queue.purge_acknowledged(tx))
            .unwrap();
        assert_eq!(purged, 1);
        assert!(f.store.read(|conn| f.queue.get(conn, acked.message_id)).unwrap().is_none());
        assert!(f.store.read(|conn| f.queue.get(conn, pending.message_id)).unwrap().is_some());
    }

    #[test]
    fn test_same_content_detects_retries() {
        let f = fixture();
        let m = message(7);
        let root = f.enqueue(&m, b"payload", f.now);
        let stored = f
            .store
            .read(|conn| f.queue.get(conn, m.message_id))
            .unwrap()
            .unwrap();

        let ttl = f.queue.resolve_ttl(None).unwrap();
        assert!(stored.same_content(&m, ttl, root));

        let mut other = m.clone();
        other.message_type = "evaluate".to_string();
        assert!(!stored.same_content(&other, ttl, root));
    }

    #[rstest]
    #[case(None, Some(3600.0))]
    #[case(Some(30.0), Some(30.0))]
    #[case(Some(86_400.0), Some(86_400.0))]
    #[case(Some(86_401.0), None)]
    #[case(Some(0.0), None)]
    #[case(Some(-5.0), None)]
    #[case(Some(f64::NAN), None)]
    fn test_resolve_ttl(#[case] requested: Option<f64>, #[case] expected: Option<f64>) {
        let queue = MessageQueue::new(&FleetSettings::default());
        assert_eq!(
            queue.resolve_ttl(requested).map(|d| d.as_secs_f64()),
            expected
        );
    }
}
