//! Node registry: identity allocation, heartbeat deadlines and eviction.
//!
//! Liveness is deadline based. Each heartbeat sets
//! `heartbeat_deadline = now + interval * grace_factor`; a node whose deadline
//! has passed is gone for good. Retired IDs are tombstoned so they are never
//! handed out again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::NodeId;
use fleet_proto::NodeInfo;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::config::FleetSettings;
use crate::db::{self, millis, sql_id, StoreError};
use crate::fleet::FleetError;

const ALLOCATION_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetireReason {
    Deleted,
    Expired,
}

impl RetireReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Deleted => "deleted",
            Self::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeRegistry {
    grace_factor: f64,
    min_interval: Duration,
    max_interval: Duration,
}

impl NodeRegistry {
    pub fn new(settings: &FleetSettings) -> Self {
        Self {
            grace_factor: settings.heartbeat_grace_factor,
            min_interval: settings.min_heartbeat_interval,
            max_interval: settings.max_heartbeat_interval,
        }
    }

    /// Converts a requested interval in seconds, clamped to the configured bounds.
    pub fn normalize_interval(&self, secs: f64) -> Result<Duration, FleetError> {
        if !secs.is_finite() || secs <= 0.0 {
            return Err(FleetError::invalid(format!(
                "heartbeat_interval must be a positive number of seconds, got {secs}"
            )));
        }
        let interval = Duration::try_from_secs_f64(secs).unwrap_or(self.max_interval);
        Ok(interval.clamp(self.min_interval, self.max_interval))
    }

    fn deadline(&self, now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
        let grace = Duration::try_from_secs_f64(interval.as_secs_f64() * self.grace_factor)
            .unwrap_or(Duration::MAX);
        chrono::Duration::from_std(grace)
            .ok()
            .and_then(|grace| now.checked_add_signed(grace))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Registers a node under a fresh, never used identifier.
    pub fn create_node(
        &self,
        conn: &Connection,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<NodeInfo, FleetError> {
        let deadline = self.deadline(now, interval);

        for _ in 0..ALLOCATION_ATTEMPTS {
            let candidate: u64 = rand::random();
            if !NodeId::is_allocatable(candidate) || id_in_use(conn, candidate)? {
                continue;
            }
            let node_id = NodeId::new(candidate).map_err(|e| StoreError::Corrupt(e.to_string()))?;

            conn.execute(
                r#"
                INSERT INTO nodes (node_id, registered_at, heartbeat_interval_ms, heartbeat_deadline)
                VALUES (?1, ?2, ?3, ?4)
                "#,
                params![
                    sql_id(candidate),
                    millis(now),
                    db::duration_millis(interval),
                    millis(deadline),
                ],
            )?;

            info!(
                node_id = %node_id,
                heartbeat_interval_secs = interval.as_secs_f64(),
                "Node registered"
            );

            return Ok(NodeInfo {
                node_id,
                registered_at: now,
                heartbeat_deadline: deadline,
                heartbeat_interval: interval.as_secs_f64(),
                last_heartbeat_at: None,
            });
        }

        Err(StoreError::Exhausted("node id").into())
    }

    /// Removes a registered node. Messages addressed to it are left to expire.
    pub fn delete_node(
        &self,
        conn: &Connection,
        node_id: NodeId,
        now: DateTime<Utc>,
    ) -> Result<(), FleetError> {
        if self.deadline_of(conn, node_id)?.is_none() {
            return Err(FleetError::not_found(format!("node {node_id}")));
        }
        retire(conn, node_id, now, RetireReason::Deleted)?;
        info!(node_id = %node_id, "Node deleted");
        Ok(())
    }

    /// Renews the deadline. Returns false if the node is unknown or already
    /// past its deadline, in which case it is retired.
    pub fn heartbeat(
        &self,
        conn: &Connection,
        node_id: NodeId,
        interval: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, FleetError> {
        let Some(deadline) = self.deadline_of(conn, node_id)? else {
            debug!(node_id = %node_id, "Heartbeat from unknown node");
            return Ok(false);
        };

        if now > deadline {
            retire(conn, node_id, now, RetireReason::Expired)?;
            info!(node_id = %node_id, deadline = %deadline, "Node expired on late heartbeat");
            return Ok(false);
        }

        let next = self.deadline(now, interval);
        conn.execute(
            r#"
            UPDATE nodes
            SET heartbeat_interval_ms = ?2, heartbeat_deadline = ?3, last_heartbeat_at = ?4
            WHERE node_id = ?1
            "#,
            params![
                sql_id(node_id.get()),
                db::duration_millis(interval),
                millis(next),
                millis(now),
            ],
        )?;

        debug!(node_id = %node_id, deadline = %next, "Heartbeat accepted");
        Ok(true)
    }

    /// Fails with `NodeExpired` unless the node is registered and within its deadline.
    pub fn ensure_active(
        &self,
        conn: &Connection,
        node_id: NodeId,
        now: DateTime<Utc>,
    ) -> Result<(), FleetError> {
        if self.is_registered(conn, node_id, now)? {
            Ok(())
        } else {
            Err(FleetError::NodeExpired(node_id))
        }
    }

    pub fn is_registered(
        &self,
        conn: &Connection,
        node_id: NodeId,
        now: DateTime<Utc>,
    ) -> Result<bool, FleetError> {
        Ok(self
            .deadline_of(conn, node_id)?
            .is_some_and(|deadline| now <= deadline))
    }

    /// Retires every node whose deadline has passed.
    pub fn evict_expired(
        &self,
        conn: &Connection,
        now: DateTime<Utc>,
    ) -> Result<Vec<NodeId>, FleetError> {
        let mut stmt =
            conn.prepare("SELECT node_id FROM nodes WHERE heartbeat_deadline < ?1 ORDER BY node_id")?;
        let expired = stmt
            .query_map(params![millis(now)], |row| db::get_node_id(row, 0))?
            .collect::<Result<Vec<_>, _>>()?;

        for node_id in &expired {
            retire(conn, *node_id, now, RetireReason::Expired)?;
            info!(node_id = %node_id, "Node evicted after missed deadline");
        }

        Ok(expired)
    }

    pub fn list_nodes(&self, conn: &Connection) -> Result<Vec<NodeInfo>, FleetError> {
        let mut stmt = conn.prepare(
            r#"
            SELECT node_id, registered_at, heartbeat_deadline, heartbeat_interval_ms, last_heartbeat_at
            FROM nodes
            ORDER BY registered_at, node_id
            "#,
        )?;

        let nodes = stmt
            .query_map([], |row| {
                let interval_ms: i64 = row.get(3)?;
                Ok(NodeInfo {
                    node_id: db::get_node_id(row, 0)?,
                    registered_at: db::get_time(row, 1)?,
                    heartbeat_deadline: db::get_time(row, 2)?,
                    heartbeat_interval: interval_ms as f64 / 1000.0,
                    last_heartbeat_at: db::get_opt_time(row, 4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(nodes)
    }

    fn deadline_of(
        &self,
        conn: &Connection,
        node_id: NodeId,
    ) -> Result<Option<DateTime<Utc>>, FleetError> {
        let deadline = conn
            .query_row(
                "SELECT heartbeat_deadline FROM nodes WHERE node_id = ?1",
                params![sql_id(node_id.get())],
                |row| db::get_time(row, 0),
            )
            .optional()?;
        Ok(deadline)
    }
}

fn id_in_use(conn: &Connection, candidate: u64) -> Result<bool, FleetError> {
    let in_use: bool = conn.query_row(
        r#"
        SELECT EXISTS(SELECT 1 FROM nodes WHERE node_id = ?1)
            OR EXISTS(SELECT 1 FROM retired_nodes WHERE node_id = ?1)
        "#,
        params![sql_id(candidate)],
        |row| row.get(0),
    )?;
    Ok(in_use)
}

fn retire(
    conn: &Connection,
    node_id: NodeId,
    now: DateTime<Utc>,
    reason: RetireReason,
) -> Result<(), FleetError> {
    conn.execute(
        "DELETE FROM nodes WHERE node_id = ?1",
        params![sql_id(node_id.get())],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO retired_nodes (node_id, retired_at, reason) VALUES (?1, ?2, ?3)",
        params![sql_id(node_id.get()), millis(now), reason.as_str()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;
    use rstest::rstest;

    fn setup() -> (Store, NodeRegistry, DateTime<Utc>) {
        let store = Store::open_in_memory().unwrap();
        let registry = NodeRegistry::new(&FleetSettings::default());
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        (store, registry, now)
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn after(t: DateTime<Utc>, n: i64) -> DateTime<Utc> {
        t + chrono::Duration::seconds(n)
    }

    #[test]
    fn test_create_node_sets_deadline_with_grace() {
        let (store, registry, now) = setup();
        let node = store
            .write(|tx| registry.create_node(tx, secs(5), now))
            .unwrap();

        assert!(NodeId::is_allocatable(node.node_id.get()));
        assert_eq!(node.heartbeat_deadline, after(now, 10));
        assert!(store
            .read(|conn| registry.is_registered(conn, node.node_id, now))
            .unwrap());
    }

    #[test]
    fn test_heartbeat_before_deadline_extends_it() {
        let (store, registry, now) = setup();
        let node = store
            .write(|tx| registry.create_node(tx, secs(5), now))
            .unwrap();

        let t = after(now, 8);
        let ok = store
            .write(|tx| registry.heartbeat(tx, node.node_id, secs(5), t))
            .unwrap();
        assert!(ok);

        // Still alive well past the original deadline.
        let later = after(now, 15);
        assert!(store
            .read(|conn| registry.is_registered(conn, node.node_id, later))
            .unwrap());
    }

    #[test]
    fn test_late_heartbeat_retires_node_for_good() {
        let (store, registry, now) = setup();
        let node = store
            .write(|tx| registry.create_node(tx, secs(5), now))
            .unwrap();

        let late = after(now, 11);
        let ok = store
            .write(|tx| registry.heartbeat(tx, node.node_id, secs(5), late))
            .unwrap();
        assert!(!ok);

        // A second attempt with the same identity also fails.
        let ok = store
            .write(|tx| registry.heartbeat(tx, node.node_id, secs(5), late))
            .unwrap();
        assert!(!ok);

        let err = store
            .read(|conn| registry.ensure_active(conn, node.node_id, late))
            .unwrap_err();
        assert!(matches!(err, FleetError::NodeExpired(id) if id == node.node_id));
    }

    #[test]
    fn test_ensure_active_is_deadline_based() {
        let (store, registry, now) = setup();
        let node = store
            .write(|tx| registry.create_node(tx, secs(5), now))
            .unwrap();

        store
            .read(|conn| registry.ensure_active(conn, node.node_id, after(now, 10)))
            .unwrap();
        assert!(store
            .read(|conn| registry.ensure_active(conn, node.node_id, after(now, 11)))
            .is_err());
    }

    #[test]
    fn test_delete_node_then_not_found() {
        let (store, registry, now) = setup();
        let node = store
            .write(|tx| registry.create_node(tx, secs(5), now))
            .unwrap();

        store
            .write(|tx| registry.delete_node(tx, node.node_id, now))
            .unwrap();
        let err = store
            .write(|tx| registry.delete_node(tx, node.node_id, now))
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
    }

    #[test]
    fn test_retired_ids_are_never_reissued() {
        let (store, registry, now) = setup();
        let node = store
            .write(|tx| registry.create_node(tx, secs(5), now))
            .unwrap();
        store
            .write(|tx| registry.delete_node(tx, node.node_id, now))
            .unwrap();

        let in_use = store
            .read(|conn| id_in_use(conn, node.node_id.get()))
            .unwrap();
        assert!(in_use);
    }

    #[test]
    fn test_evict_expired_only_takes_stale_nodes() {
        let (store, registry, now) = setup();
        let short = store
            .write(|tx| registry.create_node(tx, secs(1), now))
            .unwrap();
        let long = store
            .write(|tx| registry.create_node(tx, secs(60), now))
            .unwrap();

        let evicted = store
            .write(|tx| registry.evict_expired(tx, after(now, 5)))
            .unwrap();
        assert_eq!(evicted, vec![short.node_id]);

        let nodes = store.read(|conn| registry.list_nodes(conn)).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, long.node_id);
        assert_eq!(nodes[0].heartbeat_interval, 60.0);
    }

    #[rstest]
    #[case(0.0)]
    #[case(-1.0)]
    #[case(f64::NAN)]
    #[case(f64::INFINITY)]
    fn test_normalize_interval_rejects_nonsense(#[case] secs: f64) {
        let registry = NodeRegistry::new(&FleetSettings::default());
        assert!(matches!(
            registry.normalize_interval(secs),
            Err(FleetError::InvalidArgument(_))
        ));
    }

    #[rstest]
    #[case(0.1, 1.0)]
    #[case(30.0, 30.0)]
    #[case(1e9, 3600.0)]
    fn test_normalize_interval_clamps(#[case] requested: f64, #[case] expected: f64) {
        let registry = NodeRegistry::new(&FleetSettings::default());
        let interval = registry.normalize_interval(requested).unwrap();
        assert_eq!(interval.as_secs_f64(), expected);
    }
}
