//! Durable run storage over SQLite. A dedicated worker thread owns the one
//! connection; callers ship closures over a channel and await the reply, so
//! every read-modify-write is serialized through that thread and the atomic
//! `mutate` contract holds without row locks.

use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::oneshot;
use uuid::Uuid;

mod migrations;

use migrations::run_migrations;

use crate::error::SyncError;
use crate::models::{parse_utc, Run, RunConfig, Segment, SegmentDraft, SegmentRole};

use super::{MutateFn, MutateOutcome, RunStore};

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to store thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join store thread: {join_err:?}");
            }
        }
    }
}

fn parse_datetime(value: &str) -> Result<DateTime<Utc>> {
    parse_utc(value).map_err(|err| anyhow!(err))
}

fn role_from_str(value: &str) -> Result<SegmentRole> {
    match value {
        "Standard" => Ok(SegmentRole::Standard),
        "OfferingAnchor" => Ok(SegmentRole::OfferingAnchor),
        _ => Err(anyhow!("unknown segment role '{value}'")),
    }
}

#[derive(Clone)]
pub struct SqliteRunStore {
    inner: Arc<StoreInner>,
    db_path: Arc<PathBuf>,
}

impl SqliteRunStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("stagesync-store".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Run store thread shutting down");
            })
            .with_context(|| "failed to spawn store worker thread")?;

        ready_rx
            .recv()
            .context("store worker exited before signaling readiness")??;

        info!("Run store initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to store thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("store thread terminated unexpectedly"))?
    }
}

fn load_run(conn: &Connection, run_id: Uuid) -> Result<Option<Run>> {
    let key = run_id.to_string();
    let row = conn
        .query_row(
            "SELECT id, created_at, master_start_at, preteach_sec, walk_buffer_sec,
                    base_offering_sec, secondary_ended_at_sec, secondary_eta_sec,
                    secondary_eta_updated_at, offering_started_at_sec, next_segment_id
             FROM runs WHERE id = ?1",
            params![key],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                    row.get::<_, Option<i64>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<i64>>(9)?,
                    row.get::<_, i64>(10)?,
                ))
            },
        )
        .optional()
        .with_context(|| "failed to load run row")?;

    let Some((
        id,
        created_at,
        master_start_at,
        preteach_sec,
        walk_buffer_sec,
        base_offering_sec,
        secondary_ended_at_sec,
        secondary_eta_sec,
        secondary_eta_updated_at,
        offering_started_at_sec,
        next_segment_id,
    )) = row
    else {
        return Ok(None);
    };

    let mut run = Run {
        id: Uuid::parse_str(&id).with_context(|| format!("invalid run id '{id}'"))?,
        created_at: parse_datetime(&created_at)?,
        master_start_at: master_start_at.as_deref().map(parse_datetime).transpose()?,
        preteach_sec,
        walk_buffer_sec,
        base_offering_sec,
        secondary_ended_at_sec,
        secondary_eta_sec,
        secondary_eta_updated_at: secondary_eta_updated_at
            .as_deref()
            .map(parse_datetime)
            .transpose()?,
        offering_started_at_sec,
        segments: Vec::new(),
        next_segment_id,
    };

    let mut stmt = conn.prepare(
        "SELECT id, ord, name, role, planned_sec, actual_sec, drift_sec, completed
         FROM segments WHERE run_id = ?1 ORDER BY ord",
    )?;
    let mut rows = stmt.query(params![key])?;
    while let Some(row) = rows.next()? {
        run.segments.push(Segment {
            id: row.get(0)?,
            order: row.get(1)?,
            name: row.get(2)?,
            role: role_from_str(&row.get::<_, String>(3)?)?,
            planned_sec: row.get(4)?,
            actual_sec: row.get(5)?,
            drift_sec: row.get(6)?,
            completed: row.get::<_, i64>(7)? != 0,
        });
    }

    Ok(Some(run))
}

fn insert_run(conn: &Connection, run: &Run) -> Result<()> {
    conn.execute(
        "INSERT INTO runs (id, created_at, master_start_at, preteach_sec, walk_buffer_sec,
                           base_offering_sec, secondary_ended_at_sec, secondary_eta_sec,
                           secondary_eta_updated_at, offering_started_at_sec, next_segment_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            run.id.to_string(),
            run.created_at.to_rfc3339(),
            run.master_start_at.map(|dt| dt.to_rfc3339()),
            run.preteach_sec,
            run.walk_buffer_sec,
            run.base_offering_sec,
            run.secondary_ended_at_sec,
            run.secondary_eta_sec,
            run.secondary_eta_updated_at.map(|dt| dt.to_rfc3339()),
            run.offering_started_at_sec,
            run.next_segment_id,
        ],
    )
    .with_context(|| "failed to insert run")?;

    insert_segments(conn, run)?;
    Ok(())
}

fn insert_segments(conn: &Connection, run: &Run) -> Result<()> {
    let key = run.id.to_string();
    for seg in &run.segments {
        conn.execute(
            "INSERT INTO segments (run_id, id, ord, name, role, planned_sec, actual_sec,
                                   drift_sec, completed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                key,
                seg.id,
                seg.order,
                seg.name,
                seg.role.as_str(),
                seg.planned_sec,
                seg.actual_sec,
                seg.drift_sec,
                seg.completed as i64,
            ],
        )
        .with_context(|| "failed to insert segment")?;
    }
    Ok(())
}

/// Rewrites the run row and its segment set. Segment ids come from the
/// run's own allocator, so a full rewrite preserves identity.
fn persist_run(conn: &Connection, run: &Run) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE runs
             SET master_start_at = ?1,
                 secondary_ended_at_sec = ?2,
                 secondary_eta_sec = ?3,
                 secondary_eta_updated_at = ?4,
                 offering_started_at_sec = ?5,
                 next_segment_id = ?6
             WHERE id = ?7",
            params![
                run.master_start_at.map(|dt| dt.to_rfc3339()),
                run.secondary_ended_at_sec,
                run.secondary_eta_sec,
                run.secondary_eta_updated_at.map(|dt| dt.to_rfc3339()),
                run.offering_started_at_sec,
                run.next_segment_id,
                run.id.to_string(),
            ],
        )
        .with_context(|| "failed to update run")?;
    if updated == 0 {
        return Err(anyhow!("run {} vanished during mutation", run.id));
    }

    conn.execute(
        "DELETE FROM segments WHERE run_id = ?1",
        params![run.id.to_string()],
    )
    .with_context(|| "failed to clear segments")?;
    insert_segments(conn, run)?;
    Ok(())
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create(
        &self,
        config: RunConfig,
        segments: Vec<SegmentDraft>,
    ) -> Result<Uuid, SyncError> {
        let mut run = Run::new(config);
        for draft in segments {
            run.add_segment(draft);
        }
        let run_id = run.id;

        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open create transaction")?;
            insert_run(&tx, &run)?;
            tx.commit().context("failed to commit run creation")?;
            Ok(())
        })
        .await
        .map_err(SyncError::from)?;

        Ok(run_id)
    }

    async fn get(&self, run_id: Uuid) -> Result<Run, SyncError> {
        let loaded = self
            .execute(move |conn| load_run(conn, run_id))
            .await
            .map_err(SyncError::from)?;
        loaded.ok_or(SyncError::NotFound)
    }

    async fn mutate(&self, run_id: Uuid, apply: MutateFn) -> Result<MutateOutcome, SyncError> {
        self.execute(move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open mutate transaction")?;

            let Some(mut run) = load_run(&tx, run_id)? else {
                return Ok(Err(SyncError::NotFound));
            };

            let changed = match apply(&mut run) {
                Ok(changed) => changed,
                Err(err) => return Ok(Err(err)),
            };

            if changed {
                persist_run(&tx, &run)?;
            }
            tx.commit().context("failed to commit mutation")?;

            Ok(Ok(MutateOutcome { run, changed }))
        })
        .await
        .map_err(SyncError::from)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn drafts() -> Vec<SegmentDraft> {
        vec![
            SegmentDraft {
                name: "Welcome".into(),
                planned_sec: 120,
                role: SegmentRole::Standard,
            },
            SegmentDraft {
                name: "Offering".into(),
                planned_sec: 0,
                role: SegmentRole::OfferingAnchor,
            },
        ]
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let dir = tempdir().unwrap();
        let store = SqliteRunStore::new(dir.path().join("timing.sqlite3")).unwrap();

        let config = RunConfig {
            preteach_sec: 60,
            walk_buffer_sec: 30,
            base_offering_sec: 0, // coerced to the default
        };
        let run_id = store.create(config, drafts()).await.unwrap();

        let run = store.get(run_id).await.unwrap();
        assert_eq!(run.base_offering_sec, 300);
        assert_eq!(run.segments.len(), 2);
        assert_eq!(run.segments[0].name, "Welcome");
        assert_eq!(run.segments[1].role, SegmentRole::OfferingAnchor);
        assert_eq!(run.next_segment_id, 3);
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let dir = tempdir().unwrap();
        let store = SqliteRunStore::new(dir.path().join("timing.sqlite3")).unwrap();
        assert!(matches!(
            store.get(Uuid::new_v4()).await,
            Err(SyncError::NotFound)
        ));
    }

    #[tokio::test]
    async fn mutations_survive_a_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("timing.sqlite3");

        let run_id = {
            let store = SqliteRunStore::new(path.clone()).unwrap();
            let run_id = store.create(RunConfig::default(), drafts()).await.unwrap();
            let now = Utc::now();
            store
                .mutate(
                    run_id,
                    Box::new(move |run| {
                        run.master_start_at = Some(now);
                        let seg = run.segment_mut(1).unwrap();
                        seg.completed = true;
                        seg.actual_sec = Some(130);
                        seg.drift_sec = Some(-10);
                        Ok(true)
                    }),
                )
                .await
                .unwrap();
            run_id
        };

        let reopened = SqliteRunStore::new(path).unwrap();
        let run = reopened.get(run_id).await.unwrap();
        assert!(run.is_live());
        let seg = run.segment(1).unwrap();
        assert!(seg.completed);
        assert_eq!(seg.actual_sec, Some(130));
        assert_eq!(seg.drift_sec, Some(-10));
    }

    #[tokio::test]
    async fn failed_mutation_persists_nothing() {
        let dir = tempdir().unwrap();
        let store = SqliteRunStore::new(dir.path().join("timing.sqlite3")).unwrap();
        let run_id = store.create(RunConfig::default(), drafts()).await.unwrap();

        let result = store
            .mutate(
                run_id,
                Box::new(|run| {
                    run.master_start_at = Some(Utc::now());
                    Err(SyncError::InvalidState("rejected".into()))
                }),
            )
            .await;
        assert!(matches!(result, Err(SyncError::InvalidState(_))));

        let run = store.get(run_id).await.unwrap();
        assert!(!run.is_live());
    }
}
