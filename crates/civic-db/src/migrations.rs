use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub const CURRENT_VERSION: i64 = 1;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (users, issues, consent, chat)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id          TEXT PRIMARY KEY,
                username    TEXT NOT NULL UNIQUE,
                password    TEXT NOT NULL,
                role        TEXT NOT NULL CHECK (role IN ('citizen', 'government')),
                created_at  TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX idx_users_role ON users(role);

            CREATE TABLE issues (
                id                  TEXT PRIMARY KEY,
                reporter_id         TEXT NOT NULL REFERENCES users(id),
                title               TEXT NOT NULL,
                description         TEXT NOT NULL DEFAULT '',
                status              TEXT NOT NULL DEFAULT 'open',
                canonical_issue_id  TEXT REFERENCES issues(id),
                created_at          TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            );

            CREATE INDEX idx_issues_canonical ON issues(canonical_issue_id);
            CREATE INDEX idx_issues_reporter ON issues(reporter_id);

            -- One record per merged issue; never deleted.
            CREATE TABLE consent_records (
                issue_id      TEXT PRIMARY KEY REFERENCES issues(id),
                state         TEXT NOT NULL CHECK (state IN ('pending', 'granted', 'denied')),
                created_at    TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                responded_at  TEXT
            );

            CREATE TABLE chat_messages (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                id          TEXT NOT NULL UNIQUE,
                issue_id    TEXT NOT NULL REFERENCES issues(id),
                author_id   TEXT NOT NULL REFERENCES users(id),
                body        TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE INDEX idx_chat_messages_issue ON chat_messages(issue_id, seq);

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
