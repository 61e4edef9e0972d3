//! v001 -- Initial schema.
//!
//! All ids are TEXT UUIDs, all timestamps fixed-width RFC3339 TEXT.
//! Soft deletion (`deleted_at`) mirrors the entities that can be removed
//! while their history must stay queryable for audit.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (stable external identities)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id               TEXT PRIMARY KEY NOT NULL,
    telegram_user_id INTEGER NOT NULL UNIQUE,
    username         TEXT,
    created_at       TEXT NOT NULL,
    deleted_at       TEXT
);

-- ----------------------------------------------------------------
-- ForwarderBots (tenants); token is AEAD ciphertext, never plaintext
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS bots (
    id         TEXT PRIMARY KEY NOT NULL,
    token      TEXT NOT NULL,
    name       TEXT NOT NULL,
    manager_id TEXT NOT NULL,
    created_at TEXT NOT NULL,
    deleted_at TEXT,

    FOREIGN KEY (manager_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_bots_manager ON bots(manager_id);

-- ----------------------------------------------------------------
-- Recipients (destination chats, scoped to a bot)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS recipients (
    id         TEXT PRIMARY KEY NOT NULL,
    bot_id     TEXT NOT NULL,
    kind       TEXT NOT NULL,              -- 'user' | 'group'
    chat_id    INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    deleted_at TEXT,

    FOREIGN KEY (bot_id) REFERENCES bots(id)
);

-- At most one live row per (bot, chat); tombstones don't collide.
CREATE UNIQUE INDEX IF NOT EXISTS idx_recipients_live
    ON recipients(bot_id, chat_id) WHERE deleted_at IS NULL;

-- ----------------------------------------------------------------
-- Guests (senders, auto-created on first contact)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS guests (
    id            TEXT PRIMARY KEY NOT NULL,
    bot_id        TEXT NOT NULL,
    guest_user_id INTEGER NOT NULL,
    created_at    TEXT NOT NULL,

    FOREIGN KEY (bot_id) REFERENCES bots(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_guests_bot_user
    ON guests(bot_id, guest_user_id);

-- ----------------------------------------------------------------
-- Blacklist (append-only moderation requests)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blacklist (
    id              TEXT PRIMARY KEY NOT NULL,
    bot_id          TEXT NOT NULL,
    guest_id        TEXT NOT NULL,
    request_kind    TEXT NOT NULL,         -- 'ban' | 'unban'
    status          TEXT NOT NULL DEFAULT 'pending',
    request_user_id TEXT NOT NULL,
    approved_at     TEXT,
    created_at      TEXT NOT NULL,
    deleted_at      TEXT,

    FOREIGN KEY (bot_id) REFERENCES bots(id),
    FOREIGN KEY (guest_id) REFERENCES guests(id),
    FOREIGN KEY (request_user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_blacklist_guest_created
    ON blacklist(bot_id, guest_id, created_at);
CREATE INDEX IF NOT EXISTS idx_blacklist_status ON blacklist(status);

-- ----------------------------------------------------------------
-- Approval messages (one per reviewer per blacklist entry)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS approval_messages (
    id           TEXT PRIMARY KEY NOT NULL,
    blacklist_id TEXT NOT NULL,
    user_id      TEXT NOT NULL,
    chat_id      INTEGER NOT NULL,
    message_id   INTEGER NOT NULL,
    created_at   TEXT NOT NULL,
    deleted_at   TEXT,

    FOREIGN KEY (blacklist_id) REFERENCES blacklist(id),
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_approval_messages_blacklist
    ON approval_messages(blacklist_id);

-- ----------------------------------------------------------------
-- Message mappings (immutable; the reply reverse-index)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS message_mappings (
    id                   TEXT PRIMARY KEY NOT NULL,
    bot_id               TEXT NOT NULL,
    guest_chat_id        INTEGER NOT NULL,
    guest_message_id     INTEGER NOT NULL,
    recipient_chat_id    INTEGER NOT NULL,
    recipient_message_id INTEGER NOT NULL,
    direction            TEXT NOT NULL,    -- 'inbound' | 'outbound'
    created_at           TEXT NOT NULL,

    FOREIGN KEY (bot_id) REFERENCES bots(id)
);

CREATE INDEX IF NOT EXISTS idx_mappings_guest_message
    ON message_mappings(bot_id, guest_chat_id, guest_message_id);
CREATE INDEX IF NOT EXISTS idx_mappings_recipient_message
    ON message_mappings(bot_id, recipient_chat_id, recipient_message_id);
CREATE INDEX IF NOT EXISTS idx_mappings_bot_created
    ON message_mappings(bot_id, created_at);

-- ----------------------------------------------------------------
-- Bot admins (delegated by the manager)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS bot_admins (
    id            TEXT PRIMARY KEY NOT NULL,
    bot_id        TEXT NOT NULL,
    admin_user_id TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    deleted_at    TEXT,

    FOREIGN KEY (bot_id) REFERENCES bots(id),
    FOREIGN KEY (admin_user_id) REFERENCES users(id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_bot_admins_live
    ON bot_admins(bot_id, admin_user_id) WHERE deleted_at IS NULL;

-- ----------------------------------------------------------------
-- Audit log (append-only, outlives every resource it describes)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS audit_log (
    id            TEXT PRIMARY KEY NOT NULL,
    user_id       TEXT,
    action        TEXT NOT NULL,
    resource_type TEXT NOT NULL,
    resource_id   TEXT NOT NULL,
    details       TEXT NOT NULL DEFAULT '{}',
    created_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action);
CREATE INDEX IF NOT EXISTS idx_audit_created ON audit_log(created_at);
"#;

pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
