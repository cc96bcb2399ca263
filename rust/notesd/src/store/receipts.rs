//! One receipt per (observation, guardian) pair tracks both "read" and
//! "viewed".
//!
//! * read is a flag with a timestamp: setting it twice is a no-op that
//!   reports `false`, clearing it keeps the row (and its view history).
//! * viewed is a counter: every call refreshes `viewed_at`, ip and user
//!   agent and bumps `view_count`.

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

use super::observations::{row_to_observation, Observation, OBSERVATION_COLUMNS, OBSERVATION_FROM};
use super::{new_id, parse_column, RelationType};
use crate::db::now_ts;
use crate::error::ServiceResult;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub observation_id: String,
    pub guardian_id: String,
    pub read_at: Option<String>,
    pub viewed_at: Option<String>,
    pub view_count: i64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Where a receipt action came from.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientInfo<'a> {
    pub ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

pub fn find(
    conn: &Connection,
    observation_id: &str,
    guardian_id: &str,
) -> ServiceResult<Option<Receipt>> {
    Ok(conn
        .query_row(
            "SELECT observation_id, guardian_id, read_at, viewed_at, view_count, ip_address, user_agent
             FROM observation_receipts
             WHERE observation_id = ? AND guardian_id = ?",
            (observation_id, guardian_id),
            |r| {
                Ok(Receipt {
                    observation_id: r.get(0)?,
                    guardian_id: r.get(1)?,
                    read_at: r.get(2)?,
                    viewed_at: r.get(3)?,
                    view_count: r.get(4)?,
                    ip_address: r.get(5)?,
                    user_agent: r.get(6)?,
                })
            },
        )
        .optional()?)
}

/// Returns true only when this call moved the pair from unread to read.
pub fn mark_as_read(
    conn: &Connection,
    observation_id: &str,
    guardian_id: &str,
    client: ClientInfo<'_>,
) -> ServiceResult<bool> {
    let n = conn.execute(
        "INSERT INTO observation_receipts(id, observation_id, guardian_id, read_at, viewed_at, view_count, ip_address, user_agent)
         VALUES(?1, ?2, ?3, ?4, NULL, 0, ?5, ?6)
         ON CONFLICT(observation_id, guardian_id) DO UPDATE SET
           read_at = excluded.read_at,
           ip_address = COALESCE(excluded.ip_address, observation_receipts.ip_address),
           user_agent = COALESCE(excluded.user_agent, observation_receipts.user_agent)
         WHERE observation_receipts.read_at IS NULL",
        rusqlite::params![
            new_id(),
            observation_id,
            guardian_id,
            now_ts(),
            client.ip,
            client.user_agent,
        ],
    )?;
    Ok(n > 0)
}

/// Returns true when the pair was read before this call.
pub fn mark_as_unread(
    conn: &Connection,
    observation_id: &str,
    guardian_id: &str,
) -> ServiceResult<bool> {
    let n = conn.execute(
        "UPDATE observation_receipts SET read_at = NULL
         WHERE observation_id = ? AND guardian_id = ? AND read_at IS NOT NULL",
        (observation_id, guardian_id),
    )?;
    Ok(n > 0)
}

/// Flips the read flag and returns the new state.
pub fn toggle_read(
    conn: &Connection,
    observation_id: &str,
    guardian_id: &str,
    client: ClientInfo<'_>,
) -> ServiceResult<bool> {
    let is_read = find(conn, observation_id, guardian_id)?
        .map(|r| r.read_at.is_some())
        .unwrap_or(false);
    if is_read {
        mark_as_unread(conn, observation_id, guardian_id)?;
        Ok(false)
    } else {
        mark_as_read(conn, observation_id, guardian_id, client)?;
        Ok(true)
    }
}

pub fn mark_as_viewed(
    conn: &Connection,
    observation_id: &str,
    guardian_id: &str,
    client: ClientInfo<'_>,
) -> ServiceResult<()> {
    conn.execute(
        "INSERT INTO observation_receipts(id, observation_id, guardian_id, read_at, viewed_at, view_count, ip_address, user_agent)
         VALUES(?1, ?2, ?3, NULL, ?4, 1, ?5, ?6)
         ON CONFLICT(observation_id, guardian_id) DO UPDATE SET
           viewed_at = excluded.viewed_at,
           view_count = observation_receipts.view_count + 1,
           ip_address = excluded.ip_address,
           user_agent = excluded.user_agent",
        rusqlite::params![
            new_id(),
            observation_id,
            guardian_id,
            now_ts(),
            client.ip,
            client.user_agent,
        ],
    )?;
    Ok(())
}

/// Same upsert as `mark_as_viewed` for every id, all or nothing.
pub fn bulk_mark_as_viewed(
    conn: &Connection,
    observation_ids: &[String],
    guardian_id: &str,
    client: ClientInfo<'_>,
) -> ServiceResult<usize> {
    let tx = conn.unchecked_transaction()?;
    for id in observation_ids {
        mark_as_viewed(&tx, id, guardian_id, client)?;
    }
    tx.commit()?;
    Ok(observation_ids.len())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianObservation {
    #[serde(flatten)]
    pub observation: Observation,
    pub is_read: bool,
    pub read_at: Option<String>,
    pub is_viewed: bool,
    pub viewed_at: Option<String>,
    pub view_count: i64,
}

/// Observations about students the guardian is actively linked to, newest
/// first, with that guardian's receipt state.
pub fn guardian_observations(
    conn: &Connection,
    guardian_id: &str,
    student_id: Option<&str>,
    unread_only: bool,
) -> ServiceResult<Vec<GuardianObservation>> {
    let sql = format!(
        "SELECT {}, r.read_at, r.viewed_at, COALESCE(r.view_count, 0)
         {}
         LEFT JOIN observation_receipts r
           ON r.observation_id = o.id AND r.guardian_id = ?1
         WHERE EXISTS (
           SELECT 1 FROM student_guardians sg
           WHERE sg.student_id = o.student_id AND sg.guardian_id = ?1 AND sg.active = 1
         )
           AND (?2 IS NULL OR o.student_id = ?2)
           AND (?3 = 0 OR r.read_at IS NULL)
         ORDER BY o.created_at DESC",
        OBSERVATION_COLUMNS, OBSERVATION_FROM
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map((guardian_id, student_id, unread_only as i64), |r| {
            let read_at: Option<String> = r.get(12)?;
            let viewed_at: Option<String> = r.get(13)?;
            Ok(GuardianObservation {
                observation: row_to_observation(r)?,
                is_read: read_at.is_some(),
                read_at,
                is_viewed: viewed_at.is_some(),
                viewed_at,
                view_count: r.get(14)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentView {
    pub observation_id: String,
    pub title: String,
    pub student_name: String,
    pub viewed_at: String,
    pub view_count: i64,
}

pub fn recent_views(
    conn: &Connection,
    guardian_id: &str,
    limit: i64,
) -> ServiceResult<Vec<RecentView>> {
    let mut stmt = conn.prepare(
        "SELECT o.id, o.title, trim(s.first_name || ' ' || s.last_name), r.viewed_at, r.view_count
         FROM observation_receipts r
         JOIN observations o ON o.id = r.observation_id
         JOIN students s ON s.id = o.student_id
         WHERE r.guardian_id = ? AND r.viewed_at IS NOT NULL
         ORDER BY r.viewed_at DESC
         LIMIT ?",
    )?;
    let rows = stmt
        .query_map((guardian_id, limit), |r| {
            Ok(RecentView {
                observation_id: r.get(0)?,
                title: r.get(1)?,
                student_name: r.get(2)?,
                viewed_at: r.get(3)?,
                view_count: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianReadingStatus {
    pub guardian_id: String,
    pub guardian_name: String,
    pub relation_type: RelationType,
    pub addressed: bool,
    pub read_at: Option<String>,
    pub viewed_at: Option<String>,
    pub view_count: i64,
}

/// Receipt state of every guardian currently linked to the observation's
/// student.
pub fn reading_status(
    conn: &Connection,
    observation_id: &str,
) -> ServiceResult<Vec<GuardianReadingStatus>> {
    let mut stmt = conn.prepare(
        "SELECT sg.guardian_id, trim(u.first_name || ' ' || u.last_name), sg.relation_type,
                COALESCE(o.guardian_id = sg.guardian_id, 0),
                r.read_at, r.viewed_at, COALESCE(r.view_count, 0)
         FROM observations o
         JOIN student_guardians sg ON sg.student_id = o.student_id AND sg.active = 1
         JOIN users u ON u.id = sg.guardian_id
         LEFT JOIN observation_receipts r
           ON r.observation_id = o.id AND r.guardian_id = sg.guardian_id
         WHERE o.id = ?
         ORDER BY CASE sg.relation_type WHEN 'principal' THEN 0 ELSE 1 END, sg.assigned_at",
    )?;
    let rows = stmt
        .query_map([observation_id], |r| {
            Ok(GuardianReadingStatus {
                guardian_id: r.get(0)?,
                guardian_name: r.get(1)?,
                relation_type: parse_column(2, r.get(2)?, RelationType::parse)?,
                addressed: r.get::<_, i64>(3)? != 0,
                read_at: r.get(4)?,
                viewed_at: r.get(5)?,
                view_count: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadingStats {
    pub total: i64,
    pub read: i64,
    pub unread: i64,
    pub viewed: i64,
    pub percentage: f64,
}

impl ReadingStats {
    fn from_counts(total: i64, read: i64, viewed: i64) -> Self {
        let percentage = if total > 0 {
            (read as f64 * 100.0 / total as f64 * 100.0).round() / 100.0
        } else {
            0.0
        };
        ReadingStats {
            total,
            read,
            unread: total - read,
            viewed,
            percentage,
        }
    }
}

/// Over the teacher's observations: read/viewed by at least one guardian.
pub fn teacher_stats(conn: &Connection, teacher_id: &str) -> ServiceResult<ReadingStats> {
    let (total, read, viewed) = conn.query_row(
        "SELECT
           COUNT(*),
           COALESCE(SUM(EXISTS (
             SELECT 1 FROM observation_receipts r
             WHERE r.observation_id = o.id AND r.read_at IS NOT NULL
           )), 0),
           COALESCE(SUM(EXISTS (
             SELECT 1 FROM observation_receipts r
             WHERE r.observation_id = o.id AND r.viewed_at IS NOT NULL
           )), 0)
         FROM observations o
         WHERE o.teacher_id = ?",
        [teacher_id],
        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?)),
    )?;
    Ok(ReadingStats::from_counts(total, read, viewed))
}

/// Over observations about the guardian's linked students: this guardian's
/// own receipts.
pub fn guardian_stats(conn: &Connection, guardian_id: &str) -> ServiceResult<ReadingStats> {
    let (total, read, viewed) = conn.query_row(
        "SELECT
           COUNT(*),
           COALESCE(SUM(EXISTS (
             SELECT 1 FROM observation_receipts r
             WHERE r.observation_id = o.id AND r.guardian_id = ?1 AND r.read_at IS NOT NULL
           )), 0),
           COALESCE(SUM(EXISTS (
             SELECT 1 FROM observation_receipts r
             WHERE r.observation_id = o.id AND r.guardian_id = ?1 AND r.viewed_at IS NOT NULL
           )), 0)
         FROM observations o
         WHERE EXISTS (
           SELECT 1 FROM student_guardians sg
           WHERE sg.student_id = o.student_id AND sg.guardian_id = ?1 AND sg.active = 1
         )",
        [guardian_id],
        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?)),
    )?;
    Ok(ReadingStats::from_counts(total, read, viewed))
}
