use crate::models::{ChatMessageRow, ConsentRow, ConsentUpdate, IssueRow, MergeOutcome, MergedMemberRow, UserRow};
use crate::{Database, format_timestamp};
use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::Connection;

impl Database {
    // -- Users --

    /// Returns `false` when the username is already taken.
    pub fn create_user(&self, id: &str, username: &str, password_hash: &str, role: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let inserted = conn.execute(
                "INSERT INTO users (id, username, password, role) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(username) DO NOTHING",
                (id, username, password_hash, role),
            )?;
            Ok(inserted == 1)
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "username", username))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    pub fn government_user_ids(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM users WHERE role = 'government'")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    // -- Issues --

    pub fn create_issue(&self, id: &str, reporter_id: &str, title: &str, description: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO issues (id, reporter_id, title, description) VALUES (?1, ?2, ?3, ?4)",
                (id, reporter_id, title, description),
            )?;
            Ok(())
        })
    }

    pub fn get_issue(&self, id: &str) -> Result<Option<IssueRow>> {
        self.with_conn(|conn| query_issue(conn, id))
    }

    /// Issues merged directly into `canonical_id`, with their reporter and
    /// consent state (if any).
    pub fn get_merged_members(&self, canonical_id: &str) -> Result<Vec<MergedMemberRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT i.id, i.reporter_id, c.state
                 FROM issues i
                 LEFT JOIN consent_records c ON c.issue_id = i.id
                 WHERE i.canonical_issue_id = ?1
                 ORDER BY i.created_at",
            )?;
            let rows = stmt
                .query_map([canonical_id], |row| {
                    Ok(MergedMemberRow {
                        issue_id: row.get(0)?,
                        reporter_id: row.get(1)?,
                        consent_state: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Merge `source_id` into the thread of `target_id` and, when
    /// `with_consent` is set, open a `pending` consent record in the same
    /// transaction. The target is resolved to its canonical issue under the
    /// write lock, and issues that were merged into the source are
    /// re-pointed at that canonical, so a thread is never more than one hop
    /// away.
    pub fn merge_issue(&self, source_id: &str, target_id: &str, with_consent: bool) -> Result<MergeOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let target: Option<Option<String>> = tx
                .query_row(
                    "SELECT canonical_issue_id FROM issues WHERE id = ?1",
                    [target_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(target_canonical) = target else {
                return Ok(MergeOutcome::UnknownTarget);
            };
            let canonical_id = target_canonical.unwrap_or_else(|| target_id.to_string());
            if canonical_id == source_id {
                return Ok(MergeOutcome::Cycle);
            }

            let updated = tx.execute(
                "UPDATE issues SET canonical_issue_id = ?2
                 WHERE id = ?1 AND canonical_issue_id IS NULL",
                (source_id, &canonical_id),
            )?;
            if updated == 0 {
                return Ok(MergeOutcome::AlreadyMerged);
            }

            tx.execute(
                "UPDATE issues SET canonical_issue_id = ?2 WHERE canonical_issue_id = ?1",
                (source_id, &canonical_id),
            )?;

            if with_consent {
                tx.execute(
                    "INSERT OR IGNORE INTO consent_records (issue_id, state) VALUES (?1, 'pending')",
                    [source_id],
                )?;
            }

            tx.commit()?;
            Ok(MergeOutcome::Merged(canonical_id))
        })
    }

    // -- Consent --

    pub fn get_consent(&self, issue_id: &str) -> Result<Option<ConsentRow>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT issue_id, state, created_at, responded_at FROM consent_records WHERE issue_id = ?1",
                [issue_id],
                |row| {
                    Ok(ConsentRow {
                        issue_id: row.get(0)?,
                        state: row.get(1)?,
                        created_at: row.get(2)?,
                        responded_at: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    /// Move a `pending` record to `new_state`. The read and the conditional
    /// write share one lock hold, so duplicate concurrent answers serialize.
    pub fn update_consent(&self, issue_id: &str, new_state: &str) -> Result<ConsentUpdate> {
        self.with_conn_mut(|conn| {
            let current: Option<String> = conn
                .query_row(
                    "SELECT state FROM consent_records WHERE issue_id = ?1",
                    [issue_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(current) = current else {
                return Ok(ConsentUpdate::Missing);
            };

            if current == new_state {
                return Ok(ConsentUpdate::Unchanged);
            }
            if current != "pending" {
                return Ok(ConsentUpdate::AlreadyDecided(current));
            }

            conn.execute(
                "UPDATE consent_records
                 SET state = ?2, responded_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                 WHERE issue_id = ?1 AND state = 'pending'",
                (issue_id, new_state),
            )?;
            Ok(ConsentUpdate::Applied)
        })
    }

    /// Issue ids reported by `reporter_id` that still await an answer.
    pub fn pending_consents_for(&self, reporter_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.issue_id
                 FROM consent_records c
                 JOIN issues i ON i.id = c.issue_id
                 WHERE i.reporter_id = ?1 AND c.state = 'pending'
                 ORDER BY c.created_at",
            )?;
            let ids = stmt
                .query_map([reporter_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    // -- Chat --

    /// Append a message to the log of `thread_id`. The stored timestamp is
    /// `max(now, newest in thread)` so timestamps never decrease in insertion
    /// order. Returns the stored `created_at`.
    pub fn insert_chat_message(
        &self,
        id: &str,
        thread_id: &str,
        author_id: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        self.with_conn_mut(|conn| {
            let sql = format!("SELECT MAX(created_at) FROM chat_messages m WHERE {}", THREAD_FILTER);
            let latest: Option<String> = conn.query_row(&sql, [thread_id], |row| row.get(0))?;

            let mut created_at = format_timestamp(now);
            if let Some(latest) = latest {
                if latest > created_at {
                    created_at = latest;
                }
            }

            conn.execute(
                "INSERT INTO chat_messages (id, issue_id, author_id, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, thread_id, author_id, body, created_at],
            )?;
            Ok(created_at)
        })
    }

    pub fn count_chat_messages(&self, thread_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let sql = format!("SELECT COUNT(*) FROM chat_messages m WHERE {}", THREAD_FILTER);
            let count: i64 = conn.query_row(&sql, [thread_id], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// One page of a thread counted from the newest message backwards,
    /// returned oldest-to-newest.
    pub fn get_chat_page(&self, thread_id: &str, limit: u32, offset: u64) -> Result<Vec<ChatMessageRow>> {
        self.with_conn(|conn| {
            let mut rows = query_chat_page(conn, thread_id, limit, offset)?;
            rows.reverse();
            Ok(rows)
        })
    }
}

/// A thread is the canonical issue's log plus the pre-merge logs of every
/// issue merged into it. Binds the thread id as `?1`.
const THREAD_FILTER: &str =
    "(m.issue_id = ?1 OR m.issue_id IN (SELECT id FROM issues WHERE canonical_issue_id = ?1))";

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let sql = format!(
        "SELECT id, username, password, role, created_at FROM users WHERE {} = ?1",
        column
    );
    let mut stmt = conn.prepare(&sql)?;

    let row = stmt
        .query_row([value], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                role: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_issue(conn: &Connection, id: &str) -> Result<Option<IssueRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, reporter_id, title, description, status, canonical_issue_id, created_at
         FROM issues WHERE id = ?1",
    )?;
    stmt.query_row([id], map_issue).optional()
}

fn map_issue(row: &rusqlite::Row<'_>) -> rusqlite::Result<IssueRow> {
    Ok(IssueRow {
        id: row.get(0)?,
        reporter_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        canonical_issue_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn query_chat_page(conn: &Connection, thread_id: &str, limit: u32, offset: u64) -> Result<Vec<ChatMessageRow>> {
    // JOIN users to fetch author name and role in a single query
    let sql = format!(
        "SELECT m.seq, m.id, m.issue_id, m.author_id, u.username, u.role, m.body, m.created_at
         FROM chat_messages m
         LEFT JOIN users u ON m.author_id = u.id
         WHERE {}
         ORDER BY m.created_at DESC, m.seq DESC
         LIMIT ?2 OFFSET ?3",
        THREAD_FILTER
    );
    let mut stmt = conn.prepare(&sql)?;

    let rows = stmt
        .query_map(rusqlite::params![thread_id, limit, offset as i64], |row| {
            Ok(ChatMessageRow {
                seq: row.get(0)?,
                id: row.get(1)?,
                issue_id: row.get(2)?,
                author_id: row.get(3)?,
                author_username: row.get::<_, Option<String>>(4)?.unwrap_or_else(|| "unknown".to_string()),
                author_role: row.get::<_, Option<String>>(5)?.unwrap_or_else(|| "citizen".to_string()),
                body: row.get(6)?,
                created_at: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
