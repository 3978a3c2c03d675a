//! Run and bundle directory.
//!
//! Runs are created and advanced by the admin API and only read by nodes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_id::RunId;
use fleet_proto::{BundleRef, CreateRunRequest, Run, RunStatus, UpdateRunStatusRequest};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use crate::db::{self, millis, sql_id, StoreError};
use crate::fleet::FleetError;

const ALLOCATION_ATTEMPTS: usize = 16;

/// Whether nodes may act on a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAccess {
    Allowed,
    Unknown,
    Finished,
}

const RUN_COLUMNS: &str = "run_id, fab_id, fab_version, fab_hash, bundle_uri, run_config, \
                           status, sub_status, details, created_at, updated_at";

#[derive(Debug, Clone, Default)]
pub struct RunDirectory;

impl RunDirectory {
    pub fn new() -> Self {
        Self
    }

    pub fn create_run(
        &self,
        conn: &Connection,
        req: &CreateRunRequest,
        now: DateTime<Utc>,
    ) -> Result<Run, FleetError> {
        for (field, value) in [
            ("fab_id", &req.fab_id),
            ("fab_version", &req.fab_version),
            ("fab_hash", &req.fab_hash),
            ("bundle_uri", &req.bundle_uri),
        ] {
            if value.trim().is_empty() {
                return Err(FleetError::invalid(format!("{field} cannot be empty")));
            }
        }

        let run_config = serde_json::to_string(&req.run_config).map_err(StoreError::from)?;

        for _ in 0..ALLOCATION_ATTEMPTS {
            let candidate: u64 = rand::random();
            let Ok(run_id) = RunId::new(candidate) else {
                continue;
            };

            let inserted = conn.execute(
                r#"
                INSERT OR IGNORE INTO runs
                    (run_id, fab_id, fab_version, fab_hash, bundle_uri, run_config, status, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                "#,
                params![
                    sql_id(candidate),
                    req.fab_id,
                    req.fab_version,
                    req.fab_hash,
                    req.bundle_uri,
                    run_config,
                    RunStatus::Pending.as_str(),
                    millis(now),
                ],
            )?;
            if inserted == 0 {
                continue;
            }

            info!(run_id = %run_id, fab_id = %req.fab_id, "Run created");
            return self.get_run(conn, run_id);
        }

        Err(StoreError::Exhausted("run id").into())
    }

    pub fn get_run(&self, conn: &Connection, run_id: RunId) -> Result<Run, FleetError> {
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
            params![sql_id(run_id.get())],
            map_run,
        )
        .optional()?
        .ok_or_else(|| FleetError::not_found(format!("run {run_id}")))
    }

    pub fn get_fab(&self, conn: &Connection, run_id: RunId) -> Result<BundleRef, FleetError> {
        let run = self.get_run(conn, run_id)?;
        Ok(BundleRef {
            fab_hash: run.fab_hash,
            uri: run.bundle_uri,
        })
    }

    pub fn list_runs(&self, conn: &Connection) -> Result<Vec<Run>, FleetError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at, run_id"
        ))?;
        let runs = stmt
            .query_map([], map_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    /// Moves a run forward. Backward moves and changes to finished runs are rejected.
    pub fn update_status(
        &self,
        conn: &Connection,
        run_id: RunId,
        req: &UpdateRunStatusRequest,
        now: DateTime<Utc>,
    ) -> Result<Run, FleetError> {
        let current = self.get_run(conn, run_id)?;
        if !current.status.can_transition_to(req.status) {
            return Err(FleetError::invalid(format!(
                "run {run_id} cannot move from {} to {}",
                current.status, req.status
            )));
        }

        conn.execute(
            r#"
            UPDATE runs
            SET status = ?2, sub_status = ?3, details = ?4, updated_at = ?5
            WHERE run_id = ?1
            "#,
            params![
                sql_id(run_id.get()),
                req.status.as_str(),
                req.sub_status,
                req.details,
                millis(now),
            ],
        )?;

        info!(
            run_id = %run_id,
            from = %current.status,
            to = %req.status,
            "Run status updated"
        );
        self.get_run(conn, run_id)
    }

    /// A node may act on a run iff it exists and is not finished.
    pub fn authorize(&self, conn: &Connection, run_id: RunId) -> Result<RunAccess, FleetError> {
        let status: Option<RunStatus> = conn
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![sql_id(run_id.get())],
                |row| db::get_enum(row, 0),
            )
            .optional()?;

        Ok(match status {
            None => RunAccess::Unknown,
            Some(status) if status.is_finished() => RunAccess::Finished,
            Some(_) => RunAccess::Allowed,
        })
    }
}

fn map_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let run_config: String = row.get(5)?;
    let run_config: BTreeMap<String, serde_json::Value> = serde_json::from_str(&run_config)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(Run {
        run_id: db::get_run_id(row, 0)?,
        fab_id: row.get(1)?,
        fab_version: row.get(2)?,
        fab_hash: row.get(3)?,
        bundle_uri: row.get(4)?,
        run_config,
        status: db::get_enum(row, 6)?,
        sub_status: row.get(7)?,
        details: row.get(8)?,
        created_at: db::get_time(row, 9)?,
        updated_at: db::get_time(row, 10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Store;

    fn create_request() -> CreateRunRequest {
        CreateRunRequest {
            fab_id: "acme/mnist".to_string(),
            fab_version: "1.0.0".to_string(),
            fab_hash: "f00d".to_string(),
            bundle_uri: "s3://bundles/mnist-1.0.0.fab".to_string(),
            run_config: BTreeMap::from([("rounds".to_string(), serde_json::json!(3))]),
        }
    }

    fn status(status: RunStatus) -> UpdateRunStatusRequest {
        UpdateRunStatusRequest {
            status,
            sub_status: None,
            details: None,
        }
    }

    #[test]
    fn test_create_and_get_run() {
        let store = Store::open_in_memory().unwrap();
        let runs = RunDirectory::new();
        let now = Utc::now();

        let run = store
            .write(|tx| runs.create_run(tx, &create_request(), now))
            .unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert_eq!(run.run_config["rounds"], serde_json::json!(3));

        let fetched = store.read(|conn| runs.get_run(conn, run.run_id)).unwrap();
        assert_eq!(fetched, run);

        let fab = store.read(|conn| runs.get_fab(conn, run.run_id)).unwrap();
        assert_eq!(fab.uri, "s3://bundles/mnist-1.0.0.fab");
        assert_eq!(fab.fab_hash, "f00d");
    }

    #[test]
    fn test_unknown_run_is_not_found() {
        let store = Store::open_in_memory().unwrap();
        let runs = RunDirectory::new();
        let err = store
            .read(|conn| runs.get_run(conn, RunId::new(77).unwrap()))
            .unwrap_err();
        assert!(matches!(err, FleetError::NotFound(_)));
        assert_eq!(
            store
                .read(|conn| runs.authorize(conn, RunId::new(77).unwrap()))
                .unwrap(),
            RunAccess::Unknown
        );
    }

    #[test]
    fn test_empty_fields_are_rejected() {
        let store = Store::open_in_memory().unwrap();
        let runs = RunDirectory::new();
        let mut req = create_request();
        req.bundle_uri = " ".to_string();
        let err = store
            .write(|tx| runs.create_run(tx, &req, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidArgument(_)));
    }

    #[test]
    fn test_finished_run_is_terminal() {
        let store = Store::open_in_memory().unwrap();
        let runs = RunDirectory::new();
        let now = Utc::now();
        let run = store
            .write(|tx| runs.create_run(tx, &create_request(), now))
            .unwrap();

        store
            .write(|tx| runs.update_status(tx, run.run_id, &status(RunStatus::Running), now))
            .unwrap();
        assert_eq!(
            store.read(|conn| runs.authorize(conn, run.run_id)).unwrap(),
            RunAccess::Allowed
        );

        store
            .write(|tx| runs.update_status(tx, run.run_id, &status(RunStatus::Finished), now))
            .unwrap();
        assert_eq!(
            store.read(|conn| runs.authorize(conn, run.run_id)).unwrap(),
            RunAccess::Finished
        );

        let err = store
            .write(|tx| runs.update_status(tx, run.run_id, &status(RunStatus::Running), now))
            .unwrap_err();
        assert!(matches!(err, FleetError::InvalidArgument(_)));

        // Finished runs stay readable.
        let fetched = store.read(|conn| runs.get_run(conn, run.run_id)).unwrap();
        assert_eq!(fetched.status, RunStatus::Finished);
    }

    #[test]
    fn test_list_runs() {
        let store = Store::open_in_memory().unwrap();
        let runs = RunDirectory::new();
        let now = Utc::now();
        for _ in 0..3 {
            store
                .write(|tx| runs.create_run(tx, &create_request(), now))
                .unwrap();
        }
        assert_eq!(store.read(|conn| runs.list_runs(conn)).unwrap().len(), 3);
    }
}
