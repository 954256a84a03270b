//! Database schema initialization.

use super::{Repository, Result};

impl Repository {
    /// Initialize the database schema.
    pub(crate) fn init_schema(&self) -> Result<()> {
        let conn = self.connect()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                doc_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                workspace TEXT NOT NULL,
                doc_type TEXT NOT NULL,
                source_ref TEXT,
                file_name TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                file_path TEXT,
                content_hash TEXT NOT NULL UNIQUE,
                processing_status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (processing_status IN
                        ('pending', 'processing', 'completed', 'failed', 'canceled')),
                active_execution_id TEXT REFERENCES executions(execution_id),
                output_extract TEXT,
                output_visual TEXT,
                output_normalized TEXT,
                output_structured TEXT,
                output_synthesis TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS executions (
                execution_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL REFERENCES documents(doc_id),
                owner_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued'
                    CHECK (status IN ('queued', 'running', 'succeeded', 'failed', 'canceled')),
                model_version TEXT NOT NULL,
                prompt_hash TEXT NOT NULL,
                input_hash TEXT NOT NULL,
                normalized_hash TEXT NOT NULL,
                retry_of_execution_id TEXT REFERENCES executions(execution_id),
                error_code TEXT,
                error_message TEXT,
                result TEXT,
                duration_ms INTEGER,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS chunks (
                chunk_id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL REFERENCES documents(doc_id),
                execution_id TEXT NOT NULL REFERENCES executions(execution_id),
                owner_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                chunk_text TEXT NOT NULL,
                chunk_type TEXT NOT NULL DEFAULT 'body',
                embedding TEXT,
                UNIQUE (document_id, chunk_index)
            );

            CREATE TABLE IF NOT EXISTS processing_lock (
                doc_id TEXT PRIMARY KEY,
                worker_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                heartbeat_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS ops_requests (
                request_id TEXT PRIMARY KEY,
                request_type TEXT NOT NULL
                    CHECK (request_type IN
                        ('STOP', 'PAUSE', 'RESUME', 'RELEASE_LEASE', 'RESET_DOC',
                         'RESET_WORKSPACE', 'CLEAR_STAGES', 'RUN')),
                scope_type TEXT NOT NULL
                    CHECK (scope_type IN ('global', 'workspace', 'document')),
                scope_id TEXT,
                status TEXT NOT NULL DEFAULT 'queued'
                    CHECK (status IN ('queued', 'applied', 'failed')),
                payload TEXT,
                requested_by TEXT,
                failure_reason TEXT,
                created_at TEXT NOT NULL,
                applied_at TEXT
            );

            CREATE TABLE IF NOT EXISTS worker_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                stop_requested INTEGER NOT NULL DEFAULT 0,
                paused_workspaces TEXT NOT NULL DEFAULT '[]',
                paused_documents TEXT NOT NULL DEFAULT '[]',
                max_parallel INTEGER NOT NULL DEFAULT 8,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS progress (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                snapshot TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS run_executions (
                run_id TEXT PRIMARY KEY,
                requested_by TEXT,
                payload TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                success_count INTEGER,
                error_count INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_documents_status_created
                ON documents(processing_status, created_at);
            CREATE INDEX IF NOT EXISTS idx_documents_workspace
                ON documents(workspace);
            CREATE INDEX IF NOT EXISTS idx_executions_document
                ON executions(document_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_executions_input_hash
                ON executions(document_id, input_hash);
            CREATE INDEX IF NOT EXISTS idx_executions_status
                ON executions(status);
            CREATE INDEX IF NOT EXISTS idx_chunks_document
                ON chunks(document_id);
            CREATE INDEX IF NOT EXISTS idx_ops_requests_status_created
                ON ops_requests(status, created_at);
            CREATE INDEX IF NOT EXISTS idx_processing_lock_expires
                ON processing_lock(expires_at);

            -- Ops requests transition only queued -> {applied, failed};
            -- terminal rows are immutable.
            CREATE TRIGGER IF NOT EXISTS trg_ops_requests_forward_only
            BEFORE UPDATE OF status ON ops_requests
            FOR EACH ROW
            WHEN OLD.status <> 'queued' AND NEW.status <> OLD.status
            BEGIN
                SELECT RAISE(ABORT, 'ops_requests: terminal status is immutable');
            END;

            -- applied_at is stamped automatically on entry to a terminal status.
            CREATE TRIGGER IF NOT EXISTS trg_ops_requests_applied_at
            AFTER UPDATE OF status ON ops_requests
            FOR EACH ROW
            WHEN NEW.status IN ('applied', 'failed') AND NEW.applied_at IS NULL
            BEGIN
                UPDATE ops_requests
                SET applied_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
                WHERE request_id = NEW.request_id;
            END;
        "#,
        )?;

        Ok(())
    }
}
