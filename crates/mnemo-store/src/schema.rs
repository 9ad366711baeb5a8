use rusqlite::Connection;

/// Idempotent schema: tables, indexes, and triggers. Uses `IF NOT EXISTS`
/// throughout so it runs on every startup.
///
/// Embeddings are little-endian f32 BLOBs compared with
/// `vec_distance_cosine` from sqlite-vec; the dimension is enforced at the
/// adapter layer, not in DDL.
pub fn init_schema(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;

        CREATE TABLE IF NOT EXISTS core_memories (
            id            TEXT PRIMARY KEY,
            user_id       TEXT NOT NULL,
            key           TEXT NOT NULL,
            value         TEXT NOT NULL,
            importance    REAL NOT NULL DEFAULT 0.5,
            metadata      TEXT,
            access_count  INTEGER NOT NULL DEFAULT 0,
            last_accessed TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            UNIQUE(user_id, key)
        );
        CREATE INDEX IF NOT EXISTS idx_core_user
            ON core_memories(user_id, key);

        CREATE TABLE IF NOT EXISTS recall_memories (
            id            TEXT PRIMARY KEY,
            user_id       TEXT NOT NULL,
            content       TEXT NOT NULL,
            embedding     BLOB NOT NULL,
            importance    REAL NOT NULL DEFAULT 0.5,
            access_count  INTEGER NOT NULL DEFAULT 0,
            last_accessed TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_recall_user
            ON recall_memories(user_id, importance);

        CREATE TABLE IF NOT EXISTS archival_memories (
            id                 TEXT PRIMARY KEY,
            user_id            TEXT NOT NULL,
            content            TEXT NOT NULL,
            source             TEXT NOT NULL,
            metadata           TEXT,
            session_id         TEXT,
            compressed         INTEGER NOT NULL DEFAULT 0,
            compressed_into_id TEXT REFERENCES archival_memories(id),
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_archival_user
            ON archival_memories(user_id, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_archival_session
            ON archival_memories(session_id) WHERE session_id IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_archival_compressed
            ON archival_memories(compressed) WHERE compressed = 1;

        CREATE TABLE IF NOT EXISTS knowledge_nodes (
            id         TEXT PRIMARY KEY,
            user_id    TEXT NOT NULL,
            label      TEXT NOT NULL,
            node_type  TEXT,
            properties TEXT,
            embedding  BLOB,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_nodes_user
            ON knowledge_nodes(user_id, node_type);

        CREATE TABLE IF NOT EXISTS knowledge_edges (
            id         TEXT PRIMARY KEY,
            source_id  TEXT NOT NULL REFERENCES knowledge_nodes(id),
            target_id  TEXT NOT NULL REFERENCES knowledge_nodes(id),
            edge_type  TEXT NOT NULL,
            weight     REAL NOT NULL DEFAULT 1.0,
            properties TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(source_id, target_id, edge_type)
        );
        CREATE INDEX IF NOT EXISTS idx_edges_source ON knowledge_edges(source_id);
        CREATE INDEX IF NOT EXISTS idx_edges_target ON knowledge_edges(target_id);

        CREATE TABLE IF NOT EXISTS sessions (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            channel_id  TEXT NOT NULL,
            token_count INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL,
            UNIQUE(user_id, channel_id)
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            id         TEXT PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES sessions(id),
            user_id    TEXT NOT NULL,
            seq        INTEGER NOT NULL,
            role       TEXT NOT NULL,
            content    TEXT NOT NULL,
            status     TEXT NOT NULL DEFAULT 'complete',
            created_at TEXT NOT NULL,
            UNIQUE(session_id, seq)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id, seq);

        CREATE TRIGGER IF NOT EXISTS trg_core_updated
        AFTER UPDATE OF value, importance, metadata ON core_memories
        BEGIN
            UPDATE core_memories SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = NEW.id;
        END;

        CREATE TRIGGER IF NOT EXISTS trg_core_accessed
        AFTER UPDATE OF access_count ON core_memories
        BEGIN
            UPDATE core_memories SET last_accessed = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = NEW.id;
        END;

        CREATE TRIGGER IF NOT EXISTS trg_recall_accessed
        AFTER UPDATE OF access_count ON recall_memories
        BEGIN
            UPDATE recall_memories SET last_accessed = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = NEW.id;
        END;

        CREATE TRIGGER IF NOT EXISTS trg_archival_updated
        AFTER UPDATE OF compressed, compressed_into_id, metadata ON archival_memories
        BEGIN
            UPDATE archival_memories SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = NEW.id;
        END;

        CREATE TRIGGER IF NOT EXISTS trg_nodes_updated
        AFTER UPDATE OF label, node_type, properties, embedding ON knowledge_nodes
        BEGIN
            UPDATE knowledge_nodes SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
            WHERE id = NEW.id;
        END;",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> Connection {
        let mut conn = Connection::open_in_memory().expect("open");
        init_schema(&mut conn).expect("schema");
        conn
    }

    #[test]
    fn updated_at_trigger_fires_on_value_change() {
        let conn = open();
        conn.execute(
            "INSERT INTO core_memories (id, user_id, key, value, importance, created_at, updated_at)
             VALUES ('m1', 'u1', 'k', 'v', 0.5, '2020-01-01T00:00:00Z', '2020-01-01T00:00:00Z')",
            [],
        )
        .expect("insert");

        conn.execute("UPDATE core_memories SET value = 'v2' WHERE id = 'm1'", [])
            .expect("update");

        let updated: String = conn
            .query_row("SELECT updated_at FROM core_memories WHERE id = 'm1'", [], |r| r.get(0))
            .expect("select");
        assert_ne!(updated, "2020-01-01T00:00:00Z");
    }

    #[test]
    fn access_count_trigger_refreshes_last_accessed() {
        let conn = open();
        conn.execute(
            "INSERT INTO core_memories (id, user_id, key, value, importance, created_at, updated_at)
             VALUES ('m1', 'u1', 'k', 'v', 0.5, '2020-01-01T00:00:00Z', '2020-01-01T00:00:00Z')",
            [],
        )
        .expect("insert");

        conn.execute(
            "UPDATE core_memories SET access_count = access_count + 1 WHERE id = 'm1'",
            [],
        )
        .expect("bump");

        let last: Option<String> = conn
            .query_row("SELECT last_accessed FROM core_memories WHERE id = 'm1'", [], |r| {
                r.get(0)
            })
            .expect("select");
        assert!(last.is_some());
    }

    #[test]
    fn message_seq_unique_per_session() {
        let conn = open();
        conn.execute(
            "INSERT INTO sessions (id, user_id, channel_id, created_at, updated_at)
             VALUES ('s1', 'u1', 'c1', '2020-01-01T00:00:00Z', '2020-01-01T00:00:00Z')",
            [],
        )
        .expect("session");
        let insert = "INSERT INTO messages (id, session_id, user_id, seq, role, content, created_at)
             VALUES (?1, 's1', 'u1', 1, 'user', 'hi', '2020-01-01T00:00:00Z')";
        conn.execute(insert, ["a"]).expect("first");
        assert!(conn.execute(insert, ["b"]).is_err(), "duplicate seq must fail");
    }
}
