use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |r| r.get(0))?;

    if version < 1 {
        info!("Running migration v1 (messaging schema)");
        conn.execute_batch(
            "
            CREATE TABLE users (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id       INTEGER,
                parent_id       INTEGER REFERENCES users(id),
                name            TEXT NOT NULL,
                handle          TEXT NOT NULL,
                avatar          TEXT,
                email           TEXT,
                phone           TEXT,
                whatsapp        TEXT,
                is_super_admin  INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL
            );

            CREATE INDEX idx_users_tenant ON users(tenant_id);

            CREATE TABLE channels (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id   INTEGER NOT NULL,
                name        TEXT NOT NULL,
                description TEXT,
                visibility  TEXT NOT NULL,
                icon        TEXT,
                color       TEXT,
                is_active   INTEGER NOT NULL DEFAULT 1,
                created_by  INTEGER NOT NULL REFERENCES users(id),
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL,
                deleted_at  INTEGER
            );

            CREATE INDEX idx_channels_tenant ON channels(tenant_id);

            CREATE TABLE channel_members (
                channel_id   INTEGER NOT NULL REFERENCES channels(id),
                user_id      INTEGER NOT NULL REFERENCES users(id),
                role         TEXT NOT NULL,
                joined_at    INTEGER NOT NULL,
                last_read_at INTEGER,
                muted        INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (channel_id, user_id)
            );

            CREATE INDEX idx_channel_members_user ON channel_members(user_id);

            CREATE TABLE conversations (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id   INTEGER NOT NULL,
                name        TEXT,
                is_group    INTEGER NOT NULL DEFAULT 0,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            );

            CREATE TABLE conversation_participants (
                conversation_id INTEGER NOT NULL REFERENCES conversations(id),
                user_id         INTEGER NOT NULL REFERENCES users(id),
                joined_at       INTEGER NOT NULL,
                last_read_at    INTEGER,
                PRIMARY KEY (conversation_id, user_id)
            );

            CREATE INDEX idx_participants_user ON conversation_participants(user_id);

            CREATE TABLE messages (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id       INTEGER NOT NULL,
                channel_id      INTEGER REFERENCES channels(id),
                conversation_id INTEGER REFERENCES conversations(id),
                author_id       INTEGER NOT NULL REFERENCES users(id),
                content         TEXT NOT NULL,
                message_type    TEXT NOT NULL DEFAULT 'text',
                parent_id       INTEGER REFERENCES messages(id),
                is_edited       INTEGER NOT NULL DEFAULT 0,
                is_pinned       INTEGER NOT NULL DEFAULT 0,
                edited_at       INTEGER,
                pinned_at       INTEGER,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL,
                deleted_at      INTEGER,
                CHECK ((channel_id IS NULL) <> (conversation_id IS NULL))
            );

            CREATE INDEX idx_messages_channel ON messages(channel_id, id);
            CREATE INDEX idx_messages_conversation ON messages(conversation_id, id);
            CREATE INDEX idx_messages_parent ON messages(parent_id);

            CREATE TABLE attachments (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id   INTEGER NOT NULL REFERENCES messages(id),
                filename     TEXT NOT NULL,
                mime_type    TEXT NOT NULL,
                size         INTEGER NOT NULL,
                storage_path TEXT NOT NULL,
                metadata     TEXT,
                created_at   INTEGER NOT NULL
            );

            CREATE INDEX idx_attachments_message ON attachments(message_id);

            CREATE TABLE reactions (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id  INTEGER NOT NULL REFERENCES messages(id),
                user_id     INTEGER NOT NULL REFERENCES users(id),
                emoji       TEXT NOT NULL,
                created_at  INTEGER NOT NULL,
                UNIQUE(message_id, user_id, emoji)
            );

            CREATE INDEX idx_reactions_message ON reactions(message_id);

            CREATE TABLE notification_events (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                tenant_id     INTEGER NOT NULL,
                recipient_id  INTEGER NOT NULL REFERENCES users(id),
                kind          TEXT NOT NULL,
                reference     TEXT NOT NULL,
                payload       TEXT NOT NULL,
                scheduled_at  INTEGER NOT NULL,
                status        TEXT NOT NULL DEFAULT 'pending',
                created_at    INTEGER NOT NULL,
                updated_at    INTEGER NOT NULL
            );

            CREATE INDEX idx_notification_events_due ON notification_events(status, scheduled_at);

            CREATE TABLE notification_deliveries (
                id                INTEGER PRIMARY KEY AUTOINCREMENT,
                event_id          INTEGER NOT NULL REFERENCES notification_events(id),
                channel           TEXT NOT NULL,
                status            TEXT NOT NULL DEFAULT 'pending',
                attempts          INTEGER NOT NULL DEFAULT 0,
                provider_response TEXT,
                updated_at        INTEGER NOT NULL,
                UNIQUE(event_id, channel)
            );

            INSERT INTO schema_version (version) VALUES (1);
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
