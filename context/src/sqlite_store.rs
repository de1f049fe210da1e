//! SQLite-backed [`PersistenceGateway`].
//!
//! One database holds every session. All child tables cascade from
//! `sessions`, and branch messages cascade from their branch, so deleting a
//! session leaves nothing behind.

use std::fs::OpenOptions;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, OptionalExtension, Row, params};

use parley_types::{
    BranchId, CheckpointId, FactCategory, FactRow, FactSheet, Message, Role, SessionId,
    StrategyKind,
};

use crate::store::{
    BranchRecord, Checkpoint, NewSession, PersistenceGateway, SessionRecord, StoreError,
};

pub struct SqliteStore {
    db: Connection,
}

impl SqliteStore {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            strategy TEXT NOT NULL,
            model TEXT NOT NULL,
            system_prompt TEXT,
            created_at INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            message_count INTEGER NOT NULL DEFAULT 0,
            cleared_messages INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY,
            session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            sequence INTEGER NOT NULL,
            role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
            content TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            UNIQUE (session_id, sequence)
        );

        CREATE TABLE IF NOT EXISTS sticky_facts (
            id INTEGER PRIMARY KEY,
            session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            category TEXT NOT NULL,
            key TEXT,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS checkpoints (
            id INTEGER PRIMARY KEY,
            session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            checkpoint_id TEXT NOT NULL,
            name TEXT NOT NULL,
            message_index INTEGER NOT NULL CHECK (message_index >= 0),
            source_branch_id TEXT,
            trunk_offset INTEGER NOT NULL DEFAULT 0 CHECK (trunk_offset >= 0),
            created_at INTEGER NOT NULL,
            UNIQUE (session_id, checkpoint_id)
        );

        CREATE TABLE IF NOT EXISTS branches (
            id INTEGER PRIMARY KEY,
            session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            branch_id TEXT NOT NULL,
            checkpoint_id TEXT NOT NULL,
            name TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE (session_id, branch_id),
            FOREIGN KEY (session_id, checkpoint_id)
                REFERENCES checkpoints(session_id, checkpoint_id) ON DELETE CASCADE
        );

        -- At most one active branch per session
        CREATE UNIQUE INDEX IF NOT EXISTS idx_branches_single_active
        ON branches(session_id) WHERE is_active = 1;

        CREATE TABLE IF NOT EXISTS branch_messages (
            id INTEGER PRIMARY KEY,
            session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            branch_id TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
            content TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            UNIQUE (session_id, branch_id, sequence),
            FOREIGN KEY (session_id, branch_id)
                REFERENCES branches(session_id, branch_id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_messages_session
        ON messages(session_id, sequence);

        CREATE INDEX IF NOT EXISTS idx_sticky_facts_session
        ON sticky_facts(session_id);

        CREATE INDEX IF NOT EXISTS idx_sessions_updated
        ON sessions(last_updated);
    ";

    /// Open or create the store at `path`.
    ///
    /// The parent directory is created owner-only (0700) and the database
    /// file owner-read/write (0600) on Unix.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        prepare_db_path(path)?;

        let db = Connection::open(path)
            .with_context(|| format!("Failed to open conversation store at {}", path.display()))?;
        Self::initialize(db)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let db =
            Connection::open_in_memory().context("Failed to open in-memory conversation store")?;
        Self::initialize(db)
    }

    fn initialize(db: Connection) -> Result<Self> {
        db.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL; PRAGMA foreign_keys=ON;",
        )
        .context("Failed to set conversation store pragmas")?;
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create conversation store schema")?;
        Ok(Self { db })
    }

    fn ensure_session(&self, id: SessionId) -> Result<(), StoreError> {
        let exists: Option<i64> = self
            .db
            .query_row(
                "SELECT 1 FROM sessions WHERE id = ?1",
                [id.value()],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to look up session")?;
        match exists {
            Some(_) => Ok(()),
            None => Err(StoreError::SessionNotFound(id)),
        }
    }

    fn load_message_rows(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<Message>> {
        let mut stmt = self
            .db
            .prepare(sql)
            .context("Failed to prepare message query")?;
        let rows = stmt
            .query_map(args, |row| {
                let role: String = row.get(0)?;
                let content: String = row.get(1)?;
                Ok((role, content))
            })
            .context("Failed to query messages")?;

        let mut messages = Vec::new();
        for row in rows {
            let (role, content) = row.context("Failed to read message row")?;
            let role: Role = role.parse()?;
            let message = Message::try_new(role, content)
                .map_err(|e| anyhow!("stored {role} message is invalid: {e}"))?;
            messages.push(message);
        }
        Ok(messages)
    }
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<(SessionRecord, String)> {
    let strategy: String = row.get(2)?;
    let record = SessionRecord {
        id: SessionId::new(row.get(0)?),
        name: row.get(1)?,
        strategy: StrategyKind::default(),
        model: row.get(3)?,
        system_prompt: row.get(4)?,
        created_at: row.get(5)?,
        last_updated: row.get(6)?,
        total_tokens: u64::try_from(row.get::<_, i64>(7)?).unwrap_or(0),
        message_count: u64::try_from(row.get::<_, i64>(8)?).unwrap_or(0),
        cleared_messages: u64::try_from(row.get::<_, i64>(9)?).unwrap_or(0),
    };
    Ok((record, strategy))
}

fn with_strategy((mut record, strategy): (SessionRecord, String)) -> Result<SessionRecord> {
    record.strategy = strategy
        .parse()
        .with_context(|| format!("Session {} has an invalid strategy", record.id))?;
    Ok(record)
}

const SESSION_COLUMNS: &str = "id, name, strategy, model, system_prompt, created_at, \
                               last_updated, total_tokens, message_count, cleared_messages";

impl PersistenceGateway for SqliteStore {
    fn create_session(&mut self, session: NewSession<'_>) -> Result<SessionId, StoreError> {
        let now = now_secs();
        self.db
            .execute(
                "INSERT INTO sessions (name, strategy, model, system_prompt, created_at, last_updated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    session.name,
                    session.strategy.as_str(),
                    session.model,
                    session.system_prompt,
                    now
                ],
            )
            .context("Failed to insert session")?;
        let id = SessionId::new(self.db.last_insert_rowid());
        tracing::debug!(session = %id, strategy = %session.strategy, "Created session");
        Ok(id)
    }

    fn load_session(&self, id: SessionId) -> Result<SessionRecord, StoreError> {
        let row = self
            .db
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                [id.value()],
                session_from_row,
            )
            .optional()
            .context("Failed to load session")?;
        match row {
            Some(row) => Ok(with_strategy(row)?),
            None => Err(StoreError::SessionNotFound(id)),
        }
    }

    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let mut stmt = self
            .db
            .prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY last_updated DESC, id DESC"
            ))
            .context("Failed to prepare list_sessions query")?;
        let rows = stmt
            .query_map([], session_from_row)
            .context("Failed to query sessions")?;

        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(with_strategy(row.context("Failed to read session row")?)?);
        }
        Ok(sessions)
    }

    fn delete_session(&mut self, id: SessionId) -> Result<bool, StoreError> {
        let deleted = self
            .db
            .execute("DELETE FROM sessions WHERE id = ?1", [id.value()])
            .context("Failed to delete session")?;
        Ok(deleted > 0)
    }

    fn rename_session(&mut self, id: SessionId, name: &str) -> Result<(), StoreError> {
        let updated = self
            .db
            .execute(
                "UPDATE sessions SET name = ?1, last_updated = ?2 WHERE id = ?3",
                params![name, now_secs(), id.value()],
            )
            .context("Failed to rename session")?;
        if updated == 0 {
            return Err(StoreError::SessionNotFound(id));
        }
        Ok(())
    }

    fn append_messages(
        &mut self,
        id: SessionId,
        messages: &[(&Message, u32)],
    ) -> Result<(), StoreError> {
        self.ensure_session(id)?;
        let now = now_secs();
        let tx = self
            .db
            .transaction()
            .context("Failed to start message transaction")?;

        let mut sequence: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence) + 1, 0) FROM messages WHERE session_id = ?1",
                [id.value()],
                |row| row.get(0),
            )
            .context("Failed to compute next message sequence")?;
        let mut tokens = 0_i64;
        for (message, token_count) in messages {
            tx.execute(
                "INSERT INTO messages (session_id, sequence, role, content, timestamp, token_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.value(),
                    sequence,
                    message.role_str(),
                    message.content(),
                    now,
                    i64::from(*token_count)
                ],
            )
            .with_context(|| format!("Failed to insert message {sequence}"))?;
            sequence += 1;
            tokens += i64::from(*token_count);
        }
        let added = i64::try_from(messages.len()).context("Too many messages")?;
        tx.execute(
            "UPDATE sessions
             SET last_updated = ?1, message_count = message_count + ?2,
                 total_tokens = total_tokens + ?3
             WHERE id = ?4",
            params![now, added, tokens, id.value()],
        )
        .context("Failed to update session counters")?;

        tx.commit().context("Failed to commit messages")?;
        Ok(())
    }

    fn load_messages(&self, id: SessionId) -> Result<Vec<Message>, StoreError> {
        Ok(self.load_message_rows(
            "SELECT role, content FROM messages WHERE session_id = ?1 ORDER BY sequence ASC",
            [id.value()],
        )?)
    }

    fn set_cleared_messages(&mut self, id: SessionId, count: u64) -> Result<(), StoreError> {
        let count = i64::try_from(count).context("Cleared message count overflows")?;
        let updated = self
            .db
            .execute(
                "UPDATE sessions SET cleared_messages = ?1, last_updated = ?2 WHERE id = ?3",
                params![count, now_secs(), id.value()],
            )
            .context("Failed to record history clear")?;
        if updated == 0 {
            return Err(StoreError::SessionNotFound(id));
        }
        Ok(())
    }

    fn touch_session(
        &mut self,
        id: SessionId,
        added_messages: u32,
        added_tokens: u32,
    ) -> Result<(), StoreError> {
        let updated = self
            .db
            .execute(
                "UPDATE sessions
                 SET last_updated = ?1, message_count = message_count + ?2,
                     total_tokens = total_tokens + ?3
                 WHERE id = ?4",
                params![
                    now_secs(),
                    i64::from(added_messages),
                    i64::from(added_tokens),
                    id.value()
                ],
            )
            .context("Failed to update session counters")?;
        if updated == 0 {
            return Err(StoreError::SessionNotFound(id));
        }
        Ok(())
    }

    fn save_facts(&mut self, id: SessionId, facts: &FactSheet) -> Result<(), StoreError> {
        self.ensure_session(id)?;
        let now = now_secs();
        let tx = self
            .db
            .transaction()
            .context("Failed to start facts transaction")?;

        tx.execute("DELETE FROM sticky_facts WHERE session_id = ?1", [id.value()])
            .context("Failed to clear facts")?;
        for row in facts.to_rows() {
            tx.execute(
                "INSERT INTO sticky_facts (session_id, category, key, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id.value(), row.category.as_str(), row.key, row.value, now],
            )
            .with_context(|| format!("Failed to insert {} fact", row.category))?;
        }

        tx.commit().context("Failed to commit facts")?;
        Ok(())
    }

    fn load_facts(&self, id: SessionId) -> Result<FactSheet, StoreError> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT category, key, value FROM sticky_facts
                 WHERE session_id = ?1 ORDER BY id ASC",
            )
            .context("Failed to prepare facts query")?;
        let rows = stmt
            .query_map([id.value()], |row| {
                let category: String = row.get(0)?;
                let key: Option<String> = row.get(1)?;
                let value: String = row.get(2)?;
                Ok((category, key, value))
            })
            .context("Failed to query facts")?;

        let mut facts = Vec::new();
        for row in rows {
            let (category, key, value) = row.context("Failed to read fact row")?;
            let Ok(category) = category.parse::<FactCategory>() else {
                tracing::warn!(%category, session = %id, "Skipping fact with unknown category");
                continue;
            };
            facts.push(FactRow {
                category,
                key,
                value,
            });
        }
        Ok(FactSheet::from_rows(facts))
    }

    fn save_checkpoint(
        &mut self,
        id: SessionId,
        checkpoint: &Checkpoint,
    ) -> Result<(), StoreError> {
        self.ensure_session(id)?;
        let message_index =
            i64::try_from(checkpoint.message_index).context("Checkpoint index overflows")?;
        let trunk_offset =
            i64::try_from(checkpoint.trunk_offset).context("Checkpoint trunk offset overflows")?;
        self.db
            .execute(
                "INSERT INTO checkpoints
                 (session_id, checkpoint_id, name, message_index, source_branch_id,
                  trunk_offset, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.value(),
                    checkpoint.id.as_str(),
                    checkpoint.name,
                    message_index,
                    checkpoint.source_branch.as_ref().map(BranchId::as_str),
                    trunk_offset,
                    now_secs()
                ],
            )
            .context("Failed to insert checkpoint")?;
        Ok(())
    }

    fn load_checkpoints(&self, id: SessionId) -> Result<Vec<Checkpoint>, StoreError> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT checkpoint_id, name, message_index, source_branch_id, trunk_offset
                 FROM checkpoints WHERE session_id = ?1 ORDER BY id ASC",
            )
            .context("Failed to prepare checkpoint query")?;
        let rows = stmt
            .query_map([id.value()], |row| {
                let checkpoint_id: String = row.get(0)?;
                let name: String = row.get(1)?;
                let message_index: i64 = row.get(2)?;
                let source: Option<String> = row.get(3)?;
                let trunk_offset: i64 = row.get(4)?;
                Ok((checkpoint_id, name, message_index, source, trunk_offset))
            })
            .context("Failed to query checkpoints")?;

        let mut checkpoints = Vec::new();
        for row in rows {
            let (checkpoint_id, name, message_index, source, trunk_offset) =
                row.context("Failed to read checkpoint row")?;
            checkpoints.push(Checkpoint {
                id: CheckpointId::parse(checkpoint_id)
                    .context("Stored checkpoint id is malformed")?,
                name,
                message_index: usize::try_from(message_index)
                    .context("Checkpoint has a negative message index")?,
                source_branch: source
                    .map(BranchId::parse)
                    .transpose()
                    .context("Stored source branch id is malformed")?,
                trunk_offset: usize::try_from(trunk_offset)
                    .context("Checkpoint has a negative trunk offset")?,
            });
        }
        Ok(checkpoints)
    }

    fn save_branch(&mut self, id: SessionId, branch: &BranchRecord) -> Result<(), StoreError> {
        self.ensure_session(id)?;
        let tx = self
            .db
            .transaction()
            .context("Failed to start branch transaction")?;
        if branch.is_active {
            tx.execute(
                "UPDATE branches SET is_active = 0 WHERE session_id = ?1",
                [id.value()],
            )
            .context("Failed to deactivate branches")?;
        }
        tx.execute(
            "INSERT INTO branches (session_id, branch_id, checkpoint_id, name, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                id.value(),
                branch.id.as_str(),
                branch.checkpoint_id.as_str(),
                branch.name,
                branch.is_active,
                now_secs()
            ],
        )
        .context("Failed to insert branch")?;
        tx.commit().context("Failed to commit branch")?;
        Ok(())
    }

    fn set_active_branch(
        &mut self,
        id: SessionId,
        branch: Option<&BranchId>,
    ) -> Result<(), StoreError> {
        let tx = self
            .db
            .transaction()
            .context("Failed to start active-branch transaction")?;
        tx.execute(
            "UPDATE branches SET is_active = 0 WHERE session_id = ?1",
            [id.value()],
        )
        .context("Failed to deactivate branches")?;
        if let Some(branch) = branch {
            let updated = tx
                .execute(
                    "UPDATE branches SET is_active = 1 WHERE session_id = ?1 AND branch_id = ?2",
                    params![id.value(), branch.as_str()],
                )
                .context("Failed to activate branch")?;
            if updated == 0 {
                return Err(anyhow!("branch {branch} is not stored for session {id}").into());
            }
        }
        tx.commit().context("Failed to commit active branch")?;
        Ok(())
    }

    fn load_branches(&self, id: SessionId) -> Result<Vec<BranchRecord>, StoreError> {
        let mut stmt = self
            .db
            .prepare(
                "SELECT branch_id, checkpoint_id, name, is_active
                 FROM branches WHERE session_id = ?1 ORDER BY id ASC",
            )
            .context("Failed to prepare branch query")?;
        let rows = stmt
            .query_map([id.value()], |row| {
                let branch_id: String = row.get(0)?;
                let checkpoint_id: String = row.get(1)?;
                let name: String = row.get(2)?;
                let is_active: bool = row.get(3)?;
                Ok((branch_id, checkpoint_id, name, is_active))
            })
            .context("Failed to query branches")?;

        let mut branches = Vec::new();
        for row in rows {
            let (branch_id, checkpoint_id, name, is_active) =
                row.context("Failed to read branch row")?;
            branches.push(BranchRecord {
                id: BranchId::parse(branch_id).context("Stored branch id is malformed")?,
                checkpoint_id: CheckpointId::parse(checkpoint_id)
                    .context("Stored branch checkpoint id is malformed")?,
                name,
                is_active,
            });
        }
        Ok(branches)
    }

    fn append_branch_message(
        &mut self,
        id: SessionId,
        branch: &BranchId,
        sequence: u32,
        message: &Message,
        token_count: u32,
    ) -> Result<(), StoreError> {
        self.db
            .execute(
                "INSERT INTO branch_messages
                 (session_id, branch_id, sequence, role, content, timestamp, token_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    id.value(),
                    branch.as_str(),
                    i64::from(sequence),
                    message.role_str(),
                    message.content(),
                    now_secs(),
                    i64::from(token_count)
                ],
            )
            .with_context(|| format!("Failed to insert message {sequence} of branch {branch}"))?;
        Ok(())
    }

    fn load_branch_messages(
        &self,
        id: SessionId,
        branch: &BranchId,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self.load_message_rows(
            "SELECT role, content FROM branch_messages
             WHERE session_id = ?1 AND branch_id = ?2 ORDER BY sequence ASC",
            params![id.value(), branch.as_str()],
        )?)
    }
}

// ── Secure database placement ───────────────────────────────────────────

/// Create the parent directory (0700) and the database file (0600) before
/// SQLite touches them, so the file never exists with default permissions.
fn prepare_db_path(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_private_dir(parent)?;
    }
    ensure_private_file(path)
}

fn ensure_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory: {}", dir.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::{MetadataExt, PermissionsExt};

        let metadata = std::fs::metadata(dir)
            .with_context(|| format!("Failed to read directory metadata: {}", dir.display()))?;
        // Shared directories we don't own (e.g. a custom path under /tmp) are left alone.
        let our_uid = unsafe { libc::getuid() };
        if metadata.uid() == our_uid && metadata.permissions().mode() & 0o077 != 0 {
            std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).with_context(
                || format!("Failed to set directory permissions: {}", dir.display()),
            )?;
        }
    }
    Ok(())
}

fn ensure_private_file(path: &Path) -> Result<()> {
    let mut options = OpenOptions::new();
    options.create(true).truncate(false).read(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .with_context(|| format!("Failed to create database file: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set database permissions: {}", path.display()))?;
        for suffix in ["-wal", "-shm"] {
            let mut sidecar = path.as_os_str().to_owned();
            sidecar.push(suffix);
            let sidecar = Path::new(&sidecar);
            if sidecar.exists() {
                let _ = std::fs::set_permissions(sidecar, std::fs::Permissions::from_mode(0o600));
            }
        }
    }
    Ok(())
}
