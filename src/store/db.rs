//! Database-backed strand store.
//!
//! Append-only log over SQLite with the mutable subset confined to
//! cluster-slot consumption, tracking status, resonance, telemetry, scores
//! and `updated_at`. Optimizations:
//! - WAL mode for concurrent reads during writes
//! - Covering indexes for the hot query patterns
//! - Cluster membership in a dedicated slot table with a
//!   `(strand_id, cluster_type, cluster_key, braid_level)` primary key
//! - Batch transactions with `BEGIN IMMEDIATE`

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::errors::{CilError, CilResult};
use crate::models::{
    ClusterSlot, ClusterType, ResonanceState, Scores, Strand, StrandKind, Telemetry,
    TrackingStatus,
};
use crate::store::query::StrandFilter;

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;  -- 64MB cache
PRAGMA temp_store = MEMORY;

CREATE TABLE IF NOT EXISTS strands (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    braid_level INTEGER NOT NULL DEFAULT 1,
    symbol TEXT,
    timeframe TEXT,
    session_bucket TEXT,
    regime TEXT,
    content_json TEXT NOT NULL,
    group_signature TEXT,
    tags_json TEXT NOT NULL DEFAULT '[]',
    lesson TEXT,
    lineage_json TEXT NOT NULL,
    resonance_json TEXT NOT NULL,
    telemetry_json TEXT NOT NULL,
    scores_json TEXT NOT NULL,
    tracking_status TEXT,
    feature_version INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_strands_kind_created
    ON strands(kind, created_at DESC);

CREATE INDEX IF NOT EXISTS idx_strands_kind_scope
    ON strands(kind, symbol, timeframe);

CREATE INDEX IF NOT EXISTS idx_strands_signature
    ON strands(group_signature, symbol) WHERE group_signature IS NOT NULL;

CREATE INDEX IF NOT EXISTS idx_strands_status
    ON strands(tracking_status, kind) WHERE tracking_status IS NOT NULL;

CREATE TABLE IF NOT EXISTS cluster_slots (
    strand_id TEXT NOT NULL,
    cluster_type TEXT NOT NULL,
    cluster_key TEXT NOT NULL,
    braid_level INTEGER NOT NULL,
    consumed INTEGER NOT NULL DEFAULT 0,
    consumed_at TEXT,
    PRIMARY KEY (strand_id, cluster_type, cluster_key, braid_level)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_slots_family
    ON cluster_slots(cluster_type, cluster_key, braid_level, consumed);

CREATE TABLE IF NOT EXISTS strand_tags (
    strand_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (strand_id, seq)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_tags_tag ON strand_tags(tag, strand_id);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
) WITHOUT ROWID;
"#;

/// Broadcast payload for the subscription endpoint. Every successful append
/// is published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrandEvent {
    pub strand: Strand,
}

/// Aggregate view of one `(cluster_type, cluster_key, braid_level)` slot,
/// produced by the eligibility scan.
#[derive(Debug, Clone)]
pub struct SlotSummary {
    pub cluster_type: ClusterType,
    pub cluster_key: String,
    pub braid_level: u32,
    pub unconsumed_count: usize,
    pub oldest_created_at: DateTime<Utc>,
    /// Unscored members count 0.5 so young clusters are not starved.
    pub avg_selection: f64,
}

#[derive(Clone)]
pub struct StrandStore {
    conn: Arc<Mutex<Connection>>,
    events: broadcast::Sender<StrandEvent>,
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> CilResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CilError::StoreUnavailable(format!("bad timestamp {s}: {e}")))
}

impl StrandStore {
    pub fn new(db_path: &str) -> CilResult<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> CilResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> CilResult<Self> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| CilError::StoreUnavailable(format!("schema init: {e}")))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_else(|_| "unknown".to_string());
        if journal_mode.to_lowercase() != "wal" && journal_mode.to_lowercase() != "memory" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            events,
        })
    }

    /// Subscribe to the append feed.
    pub fn subscribe(&self) -> broadcast::Receiver<StrandEvent> {
        self.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Append
    // -----------------------------------------------------------------------

    /// Validate invariants and append. Returns the strand id.
    pub async fn append(&self, strand: &Strand) -> CilResult<String> {
        {
            let conn = self.conn.lock();
            conn.execute("BEGIN IMMEDIATE", [])?;
            if let Err(e) =
                Self::validate_new_strand(&conn, strand).and_then(|_| Self::insert_tx(&conn, strand))
            {
                conn.execute("ROLLBACK", []).ok();
                return Err(e);
            }
            conn.execute("COMMIT", [])?;
        }
        let _ = self.events.send(StrandEvent {
            strand: strand.clone(),
        });
        debug!(id = %strand.id, kind = strand.kind.as_str(), "strand appended");
        Ok(strand.id.clone())
    }

    /// Braid commit: consume exactly the matching slot on each parent and
    /// append the braid, in one transaction. Exactly-once: if any parent
    /// slot is missing or already consumed the whole commit is rolled back.
    pub async fn append_braid(
        &self,
        braid: &Strand,
        cluster_type: ClusterType,
        cluster_key: &str,
        source_level: u32,
    ) -> CilResult<String> {
        if braid.lineage.parent_ids.is_empty() {
            return Err(CilError::ValidationFailure(
                "braid must name its parents".to_string(),
            ));
        }
        {
            let conn = self.conn.lock();
            conn.execute("BEGIN IMMEDIATE", [])?;
            let consumed_at = ts(braid.created_at);
            for parent_id in &braid.lineage.parent_ids {
                let changed = match conn.execute(
                    "UPDATE cluster_slots SET consumed = 1, consumed_at = ?1
                     WHERE strand_id = ?2 AND cluster_type = ?3 AND cluster_key = ?4
                       AND braid_level = ?5 AND consumed = 0",
                    params![
                        consumed_at,
                        parent_id,
                        cluster_type.as_str(),
                        cluster_key,
                        source_level,
                    ],
                ) {
                    Ok(n) => n,
                    Err(e) => {
                        conn.execute("ROLLBACK", []).ok();
                        return Err(e.into());
                    }
                };
                if changed != 1 {
                    conn.execute("ROLLBACK", []).ok();
                    return Err(CilError::ValidationFailure(format!(
                        "parent {parent_id} has no unconsumed {}/{cluster_key} slot at level {source_level}",
                        cluster_type.as_str(),
                    )));
                }
            }
            if let Err(e) =
                Self::validate_new_strand(&conn, braid).and_then(|_| Self::insert_tx(&conn, braid))
            {
                conn.execute("ROLLBACK", []).ok();
                return Err(e);
            }
            conn.execute("COMMIT", [])?;
        }
        let _ = self.events.send(StrandEvent {
            strand: braid.clone(),
        });
        Ok(braid.id.clone())
    }

    fn insert_tx(conn: &Connection, strand: &Strand) -> CilResult<()> {
        let group_signature = strand
            .content
            .get("group_signature")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        conn.execute(
            "INSERT INTO strands (id, kind, braid_level, symbol, timeframe, session_bucket,
                regime, content_json, group_signature, tags_json, lesson, lineage_json,
                resonance_json, telemetry_json, scores_json, tracking_status,
                feature_version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                strand.id,
                strand.kind.as_str(),
                strand.braid_level,
                strand.symbol,
                strand.timeframe.map(|t| t.as_str()),
                strand.session_bucket,
                strand.regime,
                serde_json::to_string(&strand.content)?,
                group_signature,
                serde_json::to_string(&strand.tags)?,
                strand.lesson,
                serde_json::to_string(&strand.lineage)?,
                serde_json::to_string(&strand.resonance_state)?,
                serde_json::to_string(&strand.telemetry)?,
                serde_json::to_string(&strand.scores)?,
                strand.tracking_status.map(|s| s.as_str()),
                strand.feature_version,
                ts(strand.created_at),
                ts(strand.updated_at),
            ],
        )?;

        for slot in &strand.cluster_key {
            conn.execute(
                "INSERT INTO cluster_slots (strand_id, cluster_type, cluster_key, braid_level, consumed, consumed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    strand.id,
                    slot.cluster_type.as_str(),
                    slot.cluster_key,
                    slot.braid_level,
                    slot.consumed as i64,
                    slot.consumed_at.map(ts),
                ],
            )?;
        }

        for (seq, tag) in strand.tags.iter().enumerate() {
            conn.execute(
                "INSERT INTO strand_tags (strand_id, seq, tag) VALUES (?1, ?2, ?3)",
                params![strand.id, seq as i64, tag],
            )?;
        }

        Ok(())
    }

    fn validate_new_strand(conn: &Connection, strand: &Strand) -> CilResult<()> {
        if strand.id.trim().is_empty() {
            return Err(CilError::ValidationFailure("empty strand id".to_string()));
        }
        if strand.braid_level < 1 {
            return Err(CilError::ValidationFailure(
                "braid_level must be >= 1".to_string(),
            ));
        }

        // Slot uniqueness per (cluster_type, cluster_key, braid_level).
        for (i, a) in strand.cluster_key.iter().enumerate() {
            for b in strand.cluster_key.iter().skip(i + 1) {
                if a.cluster_type == b.cluster_type
                    && a.cluster_key == b.cluster_key
                    && a.braid_level == b.braid_level
                {
                    return Err(CilError::ValidationFailure(format!(
                        "duplicate cluster slot {}/{}@{}",
                        a.cluster_type.as_str(),
                        a.cluster_key,
                        a.braid_level
                    )));
                }
            }
        }

        // Braid lineage soundness: parents exist one level down and carry a
        // consumed slot matching the inherited cluster.
        if strand.braid_level > 1 {
            if strand.lineage.parent_ids.is_empty() {
                return Err(CilError::ValidationFailure(
                    "braided strand without parents".to_string(),
                ));
            }
            let inherited = strand
                .cluster_key
                .iter()
                .find(|s| s.braid_level == strand.braid_level)
                .ok_or_else(|| {
                    CilError::ValidationFailure(
                        "braided strand must inherit its cluster slot".to_string(),
                    )
                })?;
            for parent_id in &strand.lineage.parent_ids {
                let parent_level: u32 = conn
                    .query_row(
                        "SELECT braid_level FROM strands WHERE id = ?1",
                        params![parent_id],
                        |row| row.get(0),
                    )
                    .map_err(|_| {
                        CilError::ValidationFailure(format!("parent {parent_id} not found"))
                    })?;
                if parent_level + 1 != strand.braid_level {
                    return Err(CilError::ValidationFailure(format!(
                        "parent {parent_id} is at level {parent_level}, expected {}",
                        strand.braid_level - 1
                    )));
                }
                let consumed: i64 = conn
                    .query_row(
                        "SELECT consumed FROM cluster_slots
                         WHERE strand_id = ?1 AND cluster_type = ?2 AND cluster_key = ?3
                           AND braid_level = ?4",
                        params![
                            parent_id,
                            inherited.cluster_type.as_str(),
                            inherited.cluster_key,
                            strand.braid_level - 1,
                        ],
                        |row| row.get(0),
                    )
                    .map_err(|_| {
                        CilError::ValidationFailure(format!(
                            "parent {parent_id} lacks a {} slot",
                            inherited.cluster_type.as_str()
                        ))
                    })?;
                if consumed != 1 {
                    return Err(CilError::ValidationFailure(format!(
                        "parent {parent_id} slot not consumed for this braid"
                    )));
                }
            }
        }

        // A leaf review must reference a completed prediction.
        if strand.kind == StrandKind::PredictionReview && strand.braid_level == 1 {
            let prediction_id = strand
                .content
                .get("prediction_id")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            if prediction_id.is_empty() {
                return Err(CilError::ValidationFailure(
                    "prediction_review without prediction_id".to_string(),
                ));
            }
            let status: Option<String> = conn
                .query_row(
                    "SELECT tracking_status FROM strands WHERE id = ?1",
                    params![prediction_id],
                    |row| row.get(0),
                )
                .map_err(|_| {
                    CilError::ValidationFailure(format!("prediction {prediction_id} not found"))
                })?;
            if status.as_deref() != Some("completed") {
                return Err(CilError::ValidationFailure(format!(
                    "prediction {prediction_id} is not completed"
                )));
            }
        }

        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(&self, id: &str) -> CilResult<Strand> {
        let conn = self.conn.lock();
        let mut strand = conn
            .query_row("SELECT * FROM strands WHERE id = ?1", params![id], |row| {
                Self::row_to_strand(row)
            })
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => CilError::NotFound(id.to_string()),
                other => other.into(),
            })?;
        strand.cluster_key = Self::load_slots(&conn, id)?;
        Ok(strand)
    }

    pub async fn query(&self, filter: &StrandFilter) -> CilResult<Vec<Strand>> {
        let conn = self.conn.lock();

        let mut sql = String::from("SELECT * FROM strands WHERE 1=1");
        let mut args: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(kind) = filter.kind {
            sql.push_str(" AND kind = ?");
            args.push(kind.as_str().to_string().into());
        }
        if let Some(symbol) = &filter.symbol {
            sql.push_str(" AND symbol = ?");
            args.push(symbol.clone().into());
        }
        if let Some(tf) = filter.timeframe {
            sql.push_str(" AND timeframe = ?");
            args.push(tf.as_str().to_string().into());
        }
        if let Some(level) = filter.braid_level {
            sql.push_str(" AND braid_level = ?");
            args.push((level as i64).into());
        }
        if let Some(status) = filter.tracking_status {
            sql.push_str(" AND tracking_status = ?");
            args.push(status.as_str().to_string().into());
        }
        if let Some(signature) = &filter.group_signature {
            sql.push_str(" AND group_signature = ?");
            args.push(signature.clone().into());
        }
        if let Some(since) = filter.since {
            sql.push_str(" AND created_at >= ?");
            args.push(ts(since).into());
        }
        if let Some(until) = filter.until {
            sql.push_str(" AND created_at <= ?");
            args.push(ts(until).into());
        }
        if let Some(tag) = &filter.tag {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM strand_tags t
                   WHERE t.strand_id = strands.id AND t.tag = ?)",
            );
            args.push(tag.clone().into());
        }
        if let Some(cluster) = &filter.cluster {
            sql.push_str(
                " AND EXISTS (SELECT 1 FROM cluster_slots cs
                   WHERE cs.strand_id = strands.id AND cs.cluster_type = ?
                     AND cs.cluster_key = ? AND cs.braid_level = ?",
            );
            args.push(cluster.cluster_type.as_str().to_string().into());
            args.push(cluster.cluster_key.clone().into());
            args.push((cluster.braid_level as i64).into());
            if cluster.unconsumed_only {
                sql.push_str(" AND cs.consumed = 0");
            }
            sql.push(')');
        }

        sql.push_str(if filter.ascending {
            " ORDER BY created_at ASC"
        } else {
            " ORDER BY created_at DESC"
        });
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push((limit as i64).into());
        }

        let mut stmt = conn.prepare_cached(&sql)?;
        let mut strands: Vec<Strand> = stmt
            .query_map(params_from_iter(args), |row| Self::row_to_strand(row))?
            .collect::<Result<_, _>>()?;
        drop(stmt);

        for strand in &mut strands {
            strand.cluster_key = Self::load_slots(&conn, &strand.id)?;
        }
        Ok(strands)
    }

    fn row_to_strand(row: &rusqlite::Row<'_>) -> rusqlite::Result<Strand> {
        let bad = |e: String| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        };

        let kind_s: String = row.get("kind")?;
        let created_s: String = row.get("created_at")?;
        let updated_s: String = row.get("updated_at")?;
        let content_s: String = row.get("content_json")?;
        let tags_s: String = row.get("tags_json")?;
        let lineage_s: String = row.get("lineage_json")?;
        let resonance_s: String = row.get("resonance_json")?;
        let telemetry_s: String = row.get("telemetry_json")?;
        let scores_s: String = row.get("scores_json")?;
        let timeframe_s: Option<String> = row.get("timeframe")?;
        let status_s: Option<String> = row.get("tracking_status")?;

        Ok(Strand {
            id: row.get("id")?,
            created_at: parse_ts(&created_s).map_err(|e| bad(e.to_string()))?,
            updated_at: parse_ts(&updated_s).map_err(|e| bad(e.to_string()))?,
            kind: kind_s.parse().map_err(|e: CilError| bad(e.to_string()))?,
            braid_level: row.get::<_, i64>("braid_level")? as u32,
            symbol: row.get("symbol")?,
            timeframe: timeframe_s
                .map(|s| s.parse().map_err(|e: CilError| bad(e.to_string())))
                .transpose()?,
            session_bucket: row.get("session_bucket")?,
            regime: row.get("regime")?,
            content: serde_json::from_str(&content_s).map_err(|e| bad(e.to_string()))?,
            tags: serde_json::from_str(&tags_s).map_err(|e| bad(e.to_string()))?,
            cluster_key: Vec::new(), // loaded separately
            lesson: row.get("lesson")?,
            lineage: serde_json::from_str(&lineage_s).map_err(|e| bad(e.to_string()))?,
            resonance_state: serde_json::from_str(&resonance_s).map_err(|e| bad(e.to_string()))?,
            telemetry: serde_json::from_str(&telemetry_s).map_err(|e| bad(e.to_string()))?,
            scores: serde_json::from_str(&scores_s).map_err(|e| bad(e.to_string()))?,
            tracking_status: status_s
                .map(|s| s.parse().map_err(|e: CilError| bad(e.to_string())))
                .transpose()?,
            feature_version: row.get::<_, i64>("feature_version")? as u32,
        })
    }

    fn load_slots(conn: &Connection, strand_id: &str) -> CilResult<Vec<ClusterSlot>> {
        let mut stmt = conn.prepare_cached(
            "SELECT cluster_type, cluster_key, braid_level, consumed, consumed_at
             FROM cluster_slots WHERE strand_id = ?1
             ORDER BY cluster_type, cluster_key, braid_level",
        )?;
        let slots = stmt
            .query_map(params![strand_id], |row| {
                let ct: String = row.get(0)?;
                let consumed_at: Option<String> = row.get(4)?;
                Ok((
                    ct,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    consumed_at,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(slots.len());
        for (ct, key, level, consumed, consumed_at) in slots {
            out.push(ClusterSlot {
                cluster_type: ct.parse()?,
                cluster_key: key,
                braid_level: level as u32,
                consumed: consumed == 1,
                consumed_at: consumed_at.map(|s| parse_ts(&s)).transpose()?,
            });
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Mutable subset
    // -----------------------------------------------------------------------

    /// Flip one slot's consumption flag. Returns whether this call changed
    /// it (false = already consumed; safe to retry).
    pub async fn update_consumed(
        &self,
        id: &str,
        cluster_type: ClusterType,
        cluster_key: &str,
        braid_level: u32,
    ) -> CilResult<bool> {
        let conn = self.conn.lock();
        let now = ts(Utc::now());
        let changed = conn.execute(
            "UPDATE cluster_slots SET consumed = 1, consumed_at = ?1
             WHERE strand_id = ?2 AND cluster_type = ?3 AND cluster_key = ?4
               AND braid_level = ?5 AND consumed = 0",
            params![now, id, cluster_type.as_str(), cluster_key, braid_level],
        )?;
        if changed == 1 {
            Self::touch(&conn, id)?;
            return Ok(true);
        }
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM cluster_slots
             WHERE strand_id = ?1 AND cluster_type = ?2 AND cluster_key = ?3 AND braid_level = ?4",
            params![id, cluster_type.as_str(), cluster_key, braid_level],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(CilError::NotFound(format!(
                "{id} has no {}/{cluster_key}@{braid_level} slot",
                cluster_type.as_str()
            )));
        }
        Ok(false)
    }

    /// Idempotently add cluster slots to an existing strand. Returns how
    /// many were new.
    pub async fn assign_slots(&self, id: &str, slots: &[ClusterSlot]) -> CilResult<usize> {
        let conn = self.conn.lock();
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM strands WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(CilError::NotFound(id.to_string()));
        }
        let mut inserted = 0usize;
        for slot in slots {
            inserted += conn.execute(
                "INSERT OR IGNORE INTO cluster_slots
                 (strand_id, cluster_type, cluster_key, braid_level, consumed, consumed_at)
                 VALUES (?1, ?2, ?3, ?4, 0, NULL)",
                params![
                    id,
                    slot.cluster_type.as_str(),
                    slot.cluster_key,
                    slot.braid_level,
                ],
            )?;
        }
        if inserted > 0 {
            Self::touch(&conn, id)?;
        }
        Ok(inserted)
    }

    /// Monotonic status transition. Anything other than
    /// `active -> terminal` is rejected.
    pub async fn update_tracking(&self, id: &str, next: TrackingStatus) -> CilResult<()> {
        let conn = self.conn.lock();
        Self::update_tracking_tx(&conn, id, next)
    }

    fn update_tracking_tx(conn: &Connection, id: &str, next: TrackingStatus) -> CilResult<()> {
        let current: Option<String> = conn
            .query_row(
                "SELECT tracking_status FROM strands WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => CilError::NotFound(id.to_string()),
                other => other.into(),
            })?;
        let current: TrackingStatus = current
            .ok_or_else(|| {
                CilError::ValidationFailure(format!("strand {id} is not a tracked kind"))
            })?
            .parse()?;
        if !current.can_transition_to(next) {
            return Err(CilError::ValidationFailure(format!(
                "illegal status transition {} -> {} on {id}",
                current.as_str(),
                next.as_str()
            )));
        }
        conn.execute(
            "UPDATE strands SET tracking_status = ?1, updated_at = ?2 WHERE id = ?3",
            params![next.as_str(), ts(Utc::now()), id],
        )?;
        Ok(())
    }

    /// Resolve a prediction and append its review atomically: the status
    /// transition and the review append commit together.
    pub async fn resolve_prediction(
        &self,
        prediction_id: &str,
        next: TrackingStatus,
        review: Option<&Strand>,
    ) -> CilResult<Option<String>> {
        let id = {
            let conn = self.conn.lock();
            conn.execute("BEGIN IMMEDIATE", [])?;
            let result = (|| -> CilResult<Option<String>> {
                Self::update_tracking_tx(&conn, prediction_id, next)?;
                if let Some(review) = review {
                    Self::validate_new_strand(&conn, review)?;
                    Self::insert_tx(&conn, review)?;
                    Ok(Some(review.id.clone()))
                } else {
                    Ok(None)
                }
            })();
            match result {
                Ok(id) => {
                    conn.execute("COMMIT", [])?;
                    id
                }
                Err(e) => {
                    conn.execute("ROLLBACK", []).ok();
                    return Err(e);
                }
            }
        };
        if let Some(review) = review {
            let _ = self.events.send(StrandEvent {
                strand: review.clone(),
            });
        }
        Ok(id)
    }

    /// Generic field patch restricted to the mutable subset. Everything
    /// else fails with `ImmutableField`.
    pub async fn patch_field(
        &self,
        id: &str,
        field: &str,
        value: &serde_json::Value,
    ) -> CilResult<()> {
        match field {
            "tracking_status" => {
                let status: TrackingStatus = value
                    .as_str()
                    .ok_or_else(|| {
                        CilError::ValidationFailure("tracking_status must be a string".to_string())
                    })?
                    .parse()?;
                self.update_tracking(id, status).await
            }
            "resonance_state" => {
                let state: ResonanceState = serde_json::from_value(value.clone())?;
                self.update_resonance(id, &state).await
            }
            "telemetry" => {
                let telemetry: Telemetry = serde_json::from_value(value.clone())?;
                self.update_telemetry(id, &telemetry).await
            }
            "scores" => {
                let scores: Scores = serde_json::from_value(value.clone())?;
                self.update_scores(id, &scores).await
            }
            other => Err(CilError::ImmutableField(other.to_string())),
        }
    }

    pub async fn update_resonance(&self, id: &str, state: &ResonanceState) -> CilResult<()> {
        self.update_json_column(id, "resonance_json", serde_json::to_string(state)?)
    }

    pub async fn update_telemetry(&self, id: &str, telemetry: &Telemetry) -> CilResult<()> {
        self.update_json_column(id, "telemetry_json", serde_json::to_string(telemetry)?)
    }

    pub async fn update_scores(&self, id: &str, scores: &Scores) -> CilResult<()> {
        self.update_json_column(id, "scores_json", serde_json::to_string(scores)?)
    }

    fn update_json_column(&self, id: &str, column: &str, json: String) -> CilResult<()> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!("UPDATE strands SET {column} = ?1, updated_at = ?2 WHERE id = ?3"),
            params![json, ts(Utc::now()), id],
        )?;
        if changed == 0 {
            return Err(CilError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn touch(conn: &Connection, id: &str) -> CilResult<()> {
        conn.execute(
            "UPDATE strands SET updated_at = ?1 WHERE id = ?2",
            params![ts(Utc::now()), id],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Learning-loop scans
    // -----------------------------------------------------------------------

    /// Slots with at least `min_count` unconsumed reviews, with the
    /// aggregates the eligibility gates need.
    pub async fn eligible_slots(&self, min_count: usize) -> CilResult<Vec<SlotSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT cs.cluster_type, cs.cluster_key, cs.braid_level, COUNT(*),
                    MIN(s.created_at),
                    AVG(CASE WHEN json_extract(s.scores_json, '$.selection') > 0.0
                             THEN json_extract(s.scores_json, '$.selection')
                             ELSE 0.5 END)
             FROM cluster_slots cs
             JOIN strands s ON s.id = cs.strand_id
             WHERE cs.consumed = 0 AND s.kind = 'prediction_review'
             GROUP BY cs.cluster_type, cs.cluster_key, cs.braid_level
             HAVING COUNT(*) >= ?1",
        )?;
        let rows = stmt
            .query_map(params![min_count as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, f64>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (ct, key, level, count, oldest, avg_selection) in rows {
            out.push(SlotSummary {
                cluster_type: ct.parse()?,
                cluster_key: key,
                braid_level: level as u32,
                unconsumed_count: count as usize,
                oldest_created_at: parse_ts(&oldest)?,
                avg_selection,
            });
        }
        Ok(out)
    }

    /// Oldest-first unconsumed reviews at one slot.
    pub async fn unconsumed_members(
        &self,
        cluster_type: ClusterType,
        cluster_key: &str,
        braid_level: u32,
        limit: usize,
    ) -> CilResult<Vec<Strand>> {
        self.query(
            &StrandFilter::new()
                .kind(StrandKind::PredictionReview)
                .unconsumed_in_cluster(cluster_type, cluster_key, braid_level)
                .oldest_first()
                .limit(limit),
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Metadata / usage accounting
    // -----------------------------------------------------------------------

    pub async fn metadata_get(&self, key: &str) -> CilResult<Option<String>> {
        let conn = self.conn.lock();
        match conn.query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        ) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn metadata_set(&self, key: &str, value: &str) -> CilResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Per-day LLM call/token counters, keyed by UTC date.
    pub async fn record_llm_usage(&self, calls: u64, tokens: u64) -> CilResult<()> {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let conn = self.conn.lock();
        for (suffix, amount) in [("calls", calls), ("tokens", tokens)] {
            conn.execute(
                "INSERT INTO metadata (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET
                   value = CAST(CAST(value AS INTEGER) + CAST(excluded.value AS INTEGER) AS TEXT)",
                params![format!("llm_usage:{day}:{suffix}"), amount.to_string()],
            )?;
        }
        Ok(())
    }

    pub async fn llm_usage_today(&self) -> CilResult<(u64, u64)> {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let calls = self
            .metadata_get(&format!("llm_usage:{day}:calls"))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let tokens = self
            .metadata_get(&format!("llm_usage:{day}:tokens"))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok((calls, tokens))
    }
}
