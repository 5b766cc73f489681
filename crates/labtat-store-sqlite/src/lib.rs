use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use labtat_core::{
    resolve_fact_at, CompletionEvent, Encounter, FacilityGroup, FactId, Identifier, MetadataFact,
    MetadataSource, ResolvedMetadata, Shift, TestRecord, UnmatchedName, DATE_FORMAT,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::{Date, OffsetDateTime};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS encounters (
  identifier TEXT PRIMARY KEY,
  secondary_ref TEXT NOT NULL,
  encounter_date TEXT NOT NULL,
  source_tag TEXT NOT NULL,
  time_in TEXT NOT NULL,
  shift TEXT NOT NULL CHECK (shift IN ('day','night')),
  facility_group TEXT NOT NULL CHECK (facility_group IN ('annex','main')),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS test_metadata (
  test_name TEXT PRIMARY KEY,
  price_cents INTEGER NOT NULL,
  tat_minutes INTEGER NOT NULL CHECK (tat_minutes >= 0),
  section TEXT NOT NULL,
  is_default INTEGER NOT NULL DEFAULT 0 CHECK (is_default IN (0, 1)),
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS metadata_facts (
  fact_id TEXT PRIMARY KEY,
  test_name TEXT NOT NULL,
  price_cents INTEGER NOT NULL,
  tat_minutes INTEGER NOT NULL CHECK (tat_minutes >= 0),
  section TEXT NOT NULL,
  effective_from TEXT NOT NULL,
  effective_to TEXT
);

CREATE TABLE IF NOT EXISTS test_records (
  identifier TEXT NOT NULL,
  test_name TEXT NOT NULL,
  price_cents INTEGER NOT NULL,
  tat_minutes INTEGER NOT NULL,
  section TEXT NOT NULL,
  metadata_source TEXT NOT NULL CHECK (metadata_source IN ('interval','current')),
  fact_id TEXT,
  encounter_date TEXT NOT NULL,
  time_in TEXT NOT NULL,
  shift TEXT NOT NULL CHECK (shift IN ('day','night')),
  facility_group TEXT NOT NULL CHECK (facility_group IN ('annex','main')),
  completed_at TEXT,
  actual_tat_minutes INTEGER,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (identifier, test_name),
  FOREIGN KEY (identifier) REFERENCES encounters(identifier)
);

CREATE TABLE IF NOT EXISTS unmatched_tests (
  test_name TEXT NOT NULL,
  source TEXT NOT NULL,
  occurrence_count INTEGER NOT NULL DEFAULT 1 CHECK (occurrence_count >= 1),
  first_seen TEXT NOT NULL,
  last_seen TEXT NOT NULL,
  PRIMARY KEY (test_name, source)
);

CREATE INDEX IF NOT EXISTS idx_encounters_date ON encounters(encounter_date);
CREATE INDEX IF NOT EXISTS idx_metadata_facts_name ON metadata_facts(test_name, effective_from);
CREATE INDEX IF NOT EXISTS idx_test_records_date ON test_records(encounter_date);
CREATE INDEX IF NOT EXISTS idx_test_records_open ON test_records(identifier) WHERE completed_at IS NULL;
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// The current (non-interval) metadata projection for a test name. Acts as
/// the fallback when no dated interval covers a resolution date, and as the
/// placeholder row for seeded defaults awaiting pricing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurrentMetadata {
    pub test_name: String,
    pub price_cents: i64,
    pub tat_minutes: i64,
    pub section: String,
    pub is_default: bool,
}

/// One admin-side metadata change: close the open interval at `changed_at`,
/// open a new one, refresh the current projection. The only write path for
/// price/TAT/section — in-place edits would silently rewrite history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetadataChange {
    pub test_name: String,
    pub price_cents: i64,
    pub tat_minutes: i64,
    pub section: String,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed pipeline store and configure required runtime
    /// pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema
    /// version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step
    /// fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Run PRAGMA quick_check and foreign-key verification and report the
    /// schema status alongside.
    ///
    /// # Errors
    /// Returns an error when the underlying pragmas cannot be executed.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run quick_check")?;
        let quick_check_ok = quick_check_message == "ok";

        let mut stmt =
            self.conn.prepare("PRAGMA foreign_key_check").context("failed to run fk check")?;
        let mut rows = stmt.query([])?;
        let mut foreign_key_violations = Vec::new();
        while let Some(row) = rows.next()? {
            foreign_key_violations.push(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            });
        }

        Ok(IntegrityReport {
            quick_check_ok,
            quick_check_message,
            foreign_key_violations,
            schema_status: self.schema_status()?,
        })
    }

    /// Idempotent upsert keyed by identifier: insert on first sighting,
    /// last-write-wins overwrite of the mutable fields on re-sighting. The
    /// identifier column never changes.
    ///
    /// # Errors
    /// Returns an error when the transaction or either statement fails.
    pub fn upsert_encounter(&mut self, encounter: &Encounter) -> Result<UpsertOutcome> {
        let tx = self.conn.transaction().context("failed to start encounter transaction")?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM encounters WHERE identifier = ?1",
                params![encounter.identifier.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();

        tx.execute(
            "INSERT INTO encounters(
                identifier, secondary_ref, encounter_date, source_tag,
                time_in, shift, facility_group, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(identifier) DO UPDATE SET
                secondary_ref = excluded.secondary_ref,
                encounter_date = excluded.encounter_date,
                source_tag = excluded.source_tag,
                time_in = excluded.time_in,
                shift = excluded.shift,
                facility_group = excluded.facility_group,
                updated_at = excluded.updated_at",
            params![
                encounter.identifier.as_str(),
                encounter.secondary_ref,
                date_text(encounter.encounter_date)?,
                encounter.source_tag,
                rfc3339(encounter.time_in)?,
                encounter.shift.as_str(),
                encounter.facility_group.as_str(),
                now_rfc3339()?,
            ],
        )
        .context("failed to upsert encounter")?;

        tx.commit().context("failed to commit encounter transaction")?;
        Ok(if exists { UpsertOutcome::Updated } else { UpsertOutcome::Inserted })
    }

    /// Look up the one encounter for an identifier, if reconciled.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_encounter(&self, identifier: &Identifier) -> Result<Option<Encounter>> {
        let mut stmt = self.conn.prepare(
            "SELECT identifier, secondary_ref, encounter_date, source_tag,
                    time_in, shift, facility_group
             FROM encounters WHERE identifier = ?1",
        )?;
        let mut rows = stmt.query(params![identifier.as_str()])?;

        match rows.next()? {
            Some(row) => Ok(Some(decode_encounter_row(row)?)),
            None => Ok(None),
        }
    }

    /// Cheap existence probe used by the linker's integrity check.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn encounter_exists(&self, identifier: &Identifier) -> Result<bool> {
        let found = self
            .conn
            .query_row(
                "SELECT 1 FROM encounters WHERE identifier = ?1",
                params![identifier.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .context("failed to probe encounter existence")?;
        Ok(found.is_some())
    }

    /// Count of reconciled encounters, for summaries and tests.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn count_encounters(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM encounters", [], |row| row.get(0))
            .context("failed to count encounters")
    }

    /// Apply one metadata change through the close-interval/open-interval
    /// contract: the open fact (if any) gets `effective_to = changed_at`, a
    /// new open fact begins at `changed_at`, and the current projection is
    /// refreshed. Rejects changes that would create overlapping intervals.
    ///
    /// # Errors
    /// Returns an error when `changed_at` is at or before the open
    /// interval's start, or when any write fails.
    pub fn set_current_metadata(&mut self, change: &MetadataChange) -> Result<FactId> {
        let tx = self.conn.transaction().context("failed to start metadata transaction")?;

        let open_fact = tx
            .query_row(
                "SELECT fact_id, effective_from FROM metadata_facts
                 WHERE test_name = ?1 AND effective_to IS NULL",
                params![change.test_name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .context("failed to look up open metadata interval")?;

        let changed_at_text = rfc3339(change.changed_at)?;

        if let Some((open_fact_id, effective_from)) = open_fact {
            let open_from = parse_rfc3339(&effective_from)?;
            if change.changed_at <= open_from {
                return Err(anyhow!(
                    "metadata change for `{}` at {changed_at_text} would overlap the open interval starting {effective_from}",
                    change.test_name
                ));
            }
            tx.execute(
                "UPDATE metadata_facts SET effective_to = ?1 WHERE fact_id = ?2",
                params![changed_at_text, open_fact_id],
            )
            .context("failed to close open metadata interval")?;
        }

        let fact_id = FactId::new();
        tx.execute(
            "INSERT INTO metadata_facts(
                fact_id, test_name, price_cents, tat_minutes, section,
                effective_from, effective_to
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
            params![
                fact_id.to_string(),
                change.test_name,
                change.price_cents,
                change.tat_minutes,
                change.section,
                changed_at_text,
            ],
        )
        .context("failed to open new metadata interval")?;

        tx.execute(
            "INSERT INTO test_metadata(
                test_name, price_cents, tat_minutes, section, is_default, updated_at
            ) VALUES (?1, ?2, ?3, ?4, 0, ?5)
            ON CONFLICT(test_name) DO UPDATE SET
                price_cents = excluded.price_cents,
                tat_minutes = excluded.tat_minutes,
                section = excluded.section,
                is_default = 0,
                updated_at = excluded.updated_at",
            params![
                change.test_name,
                change.price_cents,
                change.tat_minutes,
                change.section,
                now_rfc3339()?,
            ],
        )
        .context("failed to refresh current metadata projection")?;

        tx.commit().context("failed to commit metadata transaction")?;
        Ok(fact_id)
    }

    /// Insert a placeholder current projection (price 0, TAT 1440, section
    /// PENDING) for a test name with no metadata yet, so rows keep flowing
    /// while operators price it from curation. No history interval is
    /// opened. Returns whether a row was inserted.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn seed_default_metadata(&mut self, test_name: &str) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO test_metadata(
                    test_name, price_cents, tat_minutes, section, is_default, updated_at
                ) VALUES (?1, 0, 1440, 'PENDING', 1, ?2)",
                params![test_name, now_rfc3339()?],
            )
            .context("failed to seed default metadata")?;
        Ok(changed == 1)
    }

    /// Read the current (non-interval) projection for a test name.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read.
    pub fn current_metadata(&self, test_name: &str) -> Result<Option<CurrentMetadata>> {
        self.conn
            .query_row(
                "SELECT test_name, price_cents, tat_minutes, section, is_default
                 FROM test_metadata WHERE test_name = ?1",
                params![test_name],
                |row| {
                    Ok(CurrentMetadata {
                        test_name: row.get(0)?,
                        price_cents: row.get(1)?,
                        tat_minutes: row.get(2)?,
                        section: row.get(3)?,
                        is_default: row.get::<_, i64>(4)? == 1,
                    })
                },
            )
            .optional()
            .context("failed to read current metadata")
    }

    /// Load the full dated history for a test name, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn metadata_facts_for(&self, test_name: &str) -> Result<Vec<MetadataFact>> {
        let mut stmt = self.conn.prepare(
            "SELECT fact_id, test_name, price_cents, tat_minutes, section,
                    effective_from, effective_to
             FROM metadata_facts WHERE test_name = ?1
             ORDER BY effective_from ASC, fact_id ASC",
        )?;
        let mut rows = stmt.query(params![test_name])?;
        let mut facts = Vec::new();

        while let Some(row) = rows.next()? {
            let fact_id_raw: String = row.get(0)?;
            let effective_from_raw: String = row.get(5)?;
            let effective_to_raw: Option<String> = row.get(6)?;
            facts.push(MetadataFact {
                fact_id: parse_fact_id(&fact_id_raw)?,
                test_name: row.get(1)?,
                price_cents: row.get(2)?,
                tat_minutes: row.get(3)?,
                section: row.get(4)?,
                effective_from: parse_rfc3339(&effective_from_raw)?,
                effective_to: effective_to_raw.as_deref().map(parse_rfc3339).transpose()?,
            });
        }

        Ok(facts)
    }

    /// Resolve the price/TAT/section in effect for `test_name` at `as_of`.
    /// Tries the dated interval history first; optionally falls back to the
    /// current projection. `Ok(None)` means no metadata exists — callers
    /// route that into the unmatched log, never into a batch failure.
    ///
    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn resolve_metadata(
        &self,
        test_name: &str,
        as_of: OffsetDateTime,
        fallback_to_current: bool,
    ) -> Result<Option<ResolvedMetadata>> {
        let facts = self.metadata_facts_for(test_name)?;
        if let Some(fact) = resolve_fact_at(&facts, as_of) {
            return Ok(Some(ResolvedMetadata {
                price_cents: fact.price_cents,
                tat_minutes: fact.tat_minutes,
                section: fact.section.clone(),
                fact_id: Some(fact.fact_id),
                source: MetadataSource::Interval,
            }));
        }

        if !fallback_to_current {
            return Ok(None);
        }

        Ok(self.current_metadata(test_name)?.map(|current| ResolvedMetadata {
            price_cents: current.price_cents,
            tat_minutes: current.tat_minutes,
            section: current.section,
            fact_id: None,
            source: MetadataSource::Current,
        }))
    }

    /// Upsert the snapshot keyed by (identifier, test name). On conflict
    /// only the snapshot and encounter-derived fields are refreshed;
    /// completion fields are never touched here.
    ///
    /// # Errors
    /// Returns an error when the transaction or either statement fails.
    pub fn upsert_test_record(&mut self, record: &TestRecord) -> Result<UpsertOutcome> {
        let tx = self.conn.transaction().context("failed to start test record transaction")?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM test_records WHERE identifier = ?1 AND test_name = ?2",
                params![record.identifier.as_str(), record.test_name],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();

        tx.execute(
            "INSERT INTO test_records(
                identifier, test_name, price_cents, tat_minutes, section,
                metadata_source, fact_id, encounter_date, time_in, shift,
                facility_group, completed_at, actual_tat_minutes, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, NULL, NULL, ?12)
            ON CONFLICT(identifier, test_name) DO UPDATE SET
                price_cents = excluded.price_cents,
                tat_minutes = excluded.tat_minutes,
                section = excluded.section,
                metadata_source = excluded.metadata_source,
                fact_id = excluded.fact_id,
                encounter_date = excluded.encounter_date,
                time_in = excluded.time_in,
                shift = excluded.shift,
                facility_group = excluded.facility_group,
                updated_at = excluded.updated_at",
            params![
                record.identifier.as_str(),
                record.test_name,
                record.price_cents,
                record.tat_minutes,
                record.section,
                record.metadata_source.as_str(),
                record.fact_id.map(|fact_id| fact_id.to_string()),
                date_text(record.encounter_date)?,
                rfc3339(record.time_in)?,
                record.shift.as_str(),
                record.facility_group.as_str(),
                now_rfc3339()?,
            ],
        )
        .context("failed to upsert test record")?;

        tx.commit().context("failed to commit test record transaction")?;
        Ok(if exists { UpsertOutcome::Updated } else { UpsertOutcome::Inserted })
    }

    /// Look up one snapshot by its composite key.
    ///
    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn get_test_record(
        &self,
        identifier: &Identifier,
        test_name: &str,
    ) -> Result<Option<TestRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT identifier, test_name, price_cents, tat_minutes, section,
                    metadata_source, fact_id, encounter_date, time_in, shift,
                    facility_group, completed_at, actual_tat_minutes
             FROM test_records WHERE identifier = ?1 AND test_name = ?2",
        )?;
        let mut rows = stmt.query(params![identifier.as_str(), test_name])?;

        match rows.next()? {
            Some(row) => Ok(Some(decode_test_record_row(row)?)),
            None => Ok(None),
        }
    }

    /// All persisted snapshots, ordered deterministically for export.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_test_records(&self) -> Result<Vec<TestRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT identifier, test_name, price_cents, tat_minutes, section,
                    metadata_source, fact_id, encounter_date, time_in, shift,
                    facility_group, completed_at, actual_tat_minutes
             FROM test_records
             ORDER BY encounter_date ASC, identifier ASC, test_name ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            records.push(decode_test_record_row(row)?);
        }

        Ok(records)
    }

    /// Open snapshots (completion still null) whose identifier equals the
    /// completion event's key.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn open_records_for(&self, key: &str) -> Result<Vec<TestRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT identifier, test_name, price_cents, tat_minutes, section,
                    metadata_source, fact_id, encounter_date, time_in, shift,
                    facility_group, completed_at, actual_tat_minutes
             FROM test_records
             WHERE identifier = ?1 AND completed_at IS NULL
             ORDER BY test_name ASC",
        )?;
        let mut rows = stmt.query(params![key])?;
        let mut records = Vec::new();

        while let Some(row) = rows.next()? {
            records.push(decode_test_record_row(row)?);
        }

        Ok(records)
    }

    /// Write completion onto one open snapshot. The `completed_at IS NULL`
    /// guard makes the Open → Completed transition terminal and replays
    /// idempotent: returns false when the record was already completed (or
    /// does not exist).
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn apply_completion(
        &mut self,
        identifier: &Identifier,
        test_name: &str,
        event: &CompletionEvent,
        actual_tat_minutes: i64,
    ) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE test_records
                 SET completed_at = ?1, actual_tat_minutes = ?2, updated_at = ?3
                 WHERE identifier = ?4 AND test_name = ?5 AND completed_at IS NULL",
                params![
                    rfc3339(event.completed_at)?,
                    actual_tat_minutes,
                    now_rfc3339()?,
                    identifier.as_str(),
                    test_name,
                ],
            )
            .context("failed to apply completion")?;
        Ok(changed == 1)
    }

    /// Accumulate one sighting of a test name with no resolvable metadata:
    /// first sighting inserts, repeats bump the occurrence counter and
    /// last-seen timestamp on the same row.
    ///
    /// # Errors
    /// Returns an error when the upsert fails.
    pub fn record_unmatched(
        &mut self,
        test_name: &str,
        source: &str,
        seen_at: OffsetDateTime,
    ) -> Result<()> {
        let seen_at_text = rfc3339(seen_at)?;
        self.conn
            .execute(
                "INSERT INTO unmatched_tests(
                    test_name, source, occurrence_count, first_seen, last_seen
                ) VALUES (?1, ?2, 1, ?3, ?3)
                ON CONFLICT(test_name, source) DO UPDATE SET
                    occurrence_count = occurrence_count + 1,
                    last_seen = excluded.last_seen",
                params![test_name, source, seen_at_text],
            )
            .context("failed to record unmatched test name")?;
        Ok(())
    }

    /// Pending unmatched names for the curation workflow, most frequent and
    /// most recent first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_unmatched(&self) -> Result<Vec<UnmatchedName>> {
        let mut stmt = self.conn.prepare(
            "SELECT test_name, source, occurrence_count, first_seen, last_seen
             FROM unmatched_tests
             ORDER BY occurrence_count DESC, last_seen DESC, test_name ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut names = Vec::new();

        while let Some(row) = rows.next()? {
            let first_seen_raw: String = row.get(3)?;
            let last_seen_raw: String = row.get(4)?;
            names.push(UnmatchedName {
                test_name: row.get(0)?,
                source: row.get(1)?,
                occurrence_count: row.get(2)?,
                first_seen: parse_rfc3339(&first_seen_raw)?,
                last_seen: parse_rfc3339(&last_seen_raw)?,
            });
        }

        Ok(names)
    }

    /// Export snapshots and unmatched names as deterministic NDJSON plus a
    /// digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or
    /// serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let records = self.list_test_records()?;
        let unmatched = self.list_unmatched()?;

        let records_path = out_dir.join("test_records.ndjson");
        let record_digest = write_ndjson_file(&records_path, &records)?;

        let unmatched_path = out_dir.join("unmatched_tests.ndjson");
        let unmatched_digest = write_ndjson_file(&unmatched_path, &unmatched)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: "test_records.ndjson".to_string(),
                    sha256: record_digest.0,
                    records: record_digest.1,
                },
                ExportFileDigest {
                    path: "unmatched_tests.ndjson".to_string(),
                    sha256: unmatched_digest.0,
                    records: unmatched_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    #[cfg(test)]
    fn raw_conn(&self) -> &Connection {
        &self.conn
    }
}

fn decode_encounter_row(row: &rusqlite::Row<'_>) -> Result<Encounter> {
    let identifier_raw: String = row.get(0)?;
    let encounter_date_raw: String = row.get(2)?;
    let time_in_raw: String = row.get(4)?;
    let shift_raw: String = row.get(5)?;
    let facility_raw: String = row.get(6)?;

    Ok(Encounter {
        identifier: parse_identifier(&identifier_raw)?,
        secondary_ref: row.get(1)?,
        encounter_date: parse_date_text(&encounter_date_raw)?,
        source_tag: row.get(3)?,
        time_in: parse_rfc3339(&time_in_raw)?,
        shift: Shift::parse(&shift_raw).ok_or_else(|| anyhow!("unknown shift: {shift_raw}"))?,
        facility_group: FacilityGroup::parse(&facility_raw)
            .ok_or_else(|| anyhow!("unknown facility group: {facility_raw}"))?,
    })
}

fn decode_test_record_row(row: &rusqlite::Row<'_>) -> Result<TestRecord> {
    let identifier_raw: String = row.get(0)?;
    let metadata_source_raw: String = row.get(5)?;
    let fact_id_raw: Option<String> = row.get(6)?;
    let encounter_date_raw: String = row.get(7)?;
    let time_in_raw: String = row.get(8)?;
    let shift_raw: String = row.get(9)?;
    let facility_raw: String = row.get(10)?;
    let completed_at_raw: Option<String> = row.get(11)?;

    Ok(TestRecord {
        identifier: parse_identifier(&identifier_raw)?,
        test_name: row.get(1)?,
        price_cents: row.get(2)?,
        tat_minutes: row.get(3)?,
        section: row.get(4)?,
        metadata_source: MetadataSource::parse(&metadata_source_raw)
            .ok_or_else(|| anyhow!("unknown metadata source: {metadata_source_raw}"))?,
        fact_id: fact_id_raw.as_deref().map(parse_fact_id).transpose()?,
        encounter_date: parse_date_text(&encounter_date_raw)?,
        time_in: parse_rfc3339(&time_in_raw)?,
        shift: Shift::parse(&shift_raw).ok_or_else(|| anyhow!("unknown shift: {shift_raw}"))?,
        facility_group: FacilityGroup::parse(&facility_raw)
            .ok_or_else(|| anyhow!("unknown facility group: {facility_raw}"))?,
        completed_at: completed_at_raw.as_deref().map(parse_rfc3339).transpose()?,
        actual_tat_minutes: row.get(12)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn date_text(value: Date) -> Result<String> {
    value.format(DATE_FORMAT).context("failed to format calendar date")
}

fn parse_date_text(value: &str) -> Result<Date> {
    Date::parse(value, DATE_FORMAT).with_context(|| format!("invalid calendar date: {value}"))
}

fn parse_identifier(raw: &str) -> Result<Identifier> {
    Identifier::parse(raw).with_context(|| format!("stored identifier is malformed: {raw}"))
}

fn parse_fact_id(raw: &str) -> Result<FactId> {
    let parsed = Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))?;
    Ok(FactId(parsed))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

#[cfg(test)]
mod tests {
    use labtat_core::RawRow;
    use time::macros::{date, datetime};

    use super::*;

    fn open_store() -> SqliteStore {
        let mut store = match SqliteStore::open(Path::new(":memory:")) {
            Ok(store) => store,
            Err(err) => panic!("in-memory store should open: {err}"),
        };
        if let Err(err) = store.migrate() {
            panic!("migration should succeed: {err}");
        }
        store
    }

    fn fixture_row(identifier: &str, test_name: &str) -> RawRow {
        RawRow {
            encounter_date: date!(2025-08-27),
            secondary_ref: "INV-1001".to_string(),
            identifier: identifier.to_string(),
            source_tag: "ANNEX".to_string(),
            test_name: test_name.to_string(),
        }
    }

    fn fixture_encounter(identifier: &str) -> Encounter {
        match Encounter::from_row(&fixture_row(identifier, "CBC")) {
            Ok(encounter) => encounter,
            Err(err) => panic!("fixture encounter should decode: {err}"),
        }
    }

    fn fixture_record(identifier: &str, test_name: &str) -> TestRecord {
        let encounter = fixture_encounter(identifier);
        TestRecord {
            identifier: encounter.identifier,
            test_name: test_name.to_string(),
            price_cents: 10_000,
            tat_minutes: 60,
            section: "HEMATOLOGY".to_string(),
            metadata_source: MetadataSource::Interval,
            fact_id: Some(FactId::new()),
            encounter_date: encounter.encounter_date,
            time_in: encounter.time_in,
            shift: encounter.shift,
            facility_group: encounter.facility_group,
            completed_at: None,
            actual_tat_minutes: None,
        }
    }

    fn must<T>(value: Result<T>) -> T {
        match value {
            Ok(value) => value,
            Err(err) => panic!("operation should succeed: {err}"),
        }
    }

    #[test]
    fn schema_constraints_reject_bad_rows() {
        let store = open_store();

        let bad_shift = store.raw_conn().execute(
            "INSERT INTO encounters(
                identifier, secondary_ref, encounter_date, source_tag,
                time_in, shift, facility_group, updated_at
            ) VALUES ('2708251322A', 'INV', '2025-08-27', 'ANNEX',
                      '2025-08-27T13:22:00Z', 'graveyard', 'annex',
                      '2025-08-27T13:22:00Z')",
            [],
        );
        assert!(bad_shift.is_err());

        let orphan_record = store.raw_conn().execute(
            "INSERT INTO test_records(
                identifier, test_name, price_cents, tat_minutes, section,
                metadata_source, fact_id, encounter_date, time_in, shift,
                facility_group, completed_at, actual_tat_minutes, updated_at
            ) VALUES ('9912312359X', 'CBC', 100, 60, 'HEMATOLOGY',
                      'interval', NULL, '2099-12-31', '2099-12-31T23:59:00Z',
                      'night', 'main', NULL, NULL, '2099-12-31T23:59:00Z')",
            [],
        );
        assert!(orphan_record.is_err());
    }

    #[test]
    fn encounter_upsert_is_idempotent_and_last_write_wins() {
        let mut store = open_store();
        let encounter = fixture_encounter("2708251322A");

        assert_eq!(must(store.upsert_encounter(&encounter)), UpsertOutcome::Inserted);
        assert_eq!(must(store.upsert_encounter(&encounter)), UpsertOutcome::Updated);
        assert_eq!(must(store.count_encounters()), 1);

        let mut resighted = encounter.clone();
        resighted.secondary_ref = "INV-2002".to_string();
        resighted.source_tag = "ICU".to_string();
        resighted.facility_group = FacilityGroup::classify("ICU");
        assert_eq!(must(store.upsert_encounter(&resighted)), UpsertOutcome::Updated);

        let stored = must(store.get_encounter(&encounter.identifier));
        let stored = match stored {
            Some(stored) => stored,
            None => panic!("encounter should exist after upsert"),
        };
        assert_eq!(stored.secondary_ref, "INV-2002");
        assert_eq!(stored.facility_group, FacilityGroup::Main);
        assert_eq!(stored.identifier, encounter.identifier);
    }

    #[test]
    fn metadata_changes_close_and_open_intervals() {
        let mut store = open_store();
        let first = MetadataChange {
            test_name: "CBC".to_string(),
            price_cents: 10_000,
            tat_minutes: 60,
            section: "HEMATOLOGY".to_string(),
            changed_at: datetime!(2025-01-01 00:00 UTC),
        };
        let second = MetadataChange {
            price_cents: 15_000,
            changed_at: datetime!(2025-03-01 00:00 UTC),
            ..first.clone()
        };

        must(store.set_current_metadata(&first));
        must(store.set_current_metadata(&second));

        let facts = must(store.metadata_facts_for("CBC"));
        assert_eq!(facts.len(), 2);
        assert_eq!(facts[0].effective_to, Some(datetime!(2025-03-01 00:00 UTC)));
        assert_eq!(facts[1].effective_to, None);

        let feb = must(store.resolve_metadata("CBC", datetime!(2025-02-15 00:00 UTC), true));
        let mar1 = must(store.resolve_metadata("CBC", datetime!(2025-03-01 00:00 UTC), true));
        let mar15 = must(store.resolve_metadata("CBC", datetime!(2025-03-15 00:00 UTC), true));

        assert_eq!(feb.map(|meta| meta.price_cents), Some(10_000));
        assert_eq!(mar1.as_ref().map(|meta| meta.price_cents), Some(15_000));
        assert_eq!(mar1.map(|meta| meta.source), Some(MetadataSource::Interval));
        assert_eq!(mar15.map(|meta| meta.price_cents), Some(15_000));
    }

    #[test]
    fn overlapping_metadata_changes_are_rejected() {
        let mut store = open_store();
        let first = MetadataChange {
            test_name: "CBC".to_string(),
            price_cents: 10_000,
            tat_minutes: 60,
            section: "HEMATOLOGY".to_string(),
            changed_at: datetime!(2025-03-01 00:00 UTC),
        };
        must(store.set_current_metadata(&first));

        let backdated = MetadataChange {
            price_cents: 5_000,
            changed_at: datetime!(2025-02-01 00:00 UTC),
            ..first.clone()
        };
        assert!(store.set_current_metadata(&backdated).is_err());

        let same_instant =
            MetadataChange { price_cents: 5_000, changed_at: first.changed_at, ..first };
        assert!(store.set_current_metadata(&same_instant).is_err());
    }

    #[test]
    fn resolution_falls_back_to_current_only_when_allowed() {
        let mut store = open_store();
        assert!(must(store.seed_default_metadata("OBSCURE PANEL")));
        assert!(!must(store.seed_default_metadata("OBSCURE PANEL")));

        let as_of = datetime!(2025-02-15 00:00 UTC);
        let with_fallback = must(store.resolve_metadata("OBSCURE PANEL", as_of, true));
        let with_fallback = match with_fallback {
            Some(resolved) => resolved,
            None => panic!("fallback resolution should find the seeded projection"),
        };
        assert_eq!(with_fallback.source, MetadataSource::Current);
        assert_eq!(with_fallback.tat_minutes, 1440);
        assert_eq!(with_fallback.fact_id, None);

        let strict = must(store.resolve_metadata("OBSCURE PANEL", as_of, false));
        assert_eq!(strict, None);

        let unknown = must(store.resolve_metadata("NEVER SEEN", as_of, true));
        assert_eq!(unknown, None);
    }

    #[test]
    fn test_record_upsert_refreshes_snapshot_but_not_completion() {
        let mut store = open_store();
        let encounter = fixture_encounter("2708251322A");
        must(store.upsert_encounter(&encounter));

        let record = fixture_record("2708251322A", "CBC");
        assert_eq!(must(store.upsert_test_record(&record)), UpsertOutcome::Inserted);

        let event = CompletionEvent {
            key: "2708251322A".to_string(),
            completed_at: datetime!(2025-08-27 14:50 UTC),
        };
        assert!(must(store.apply_completion(&record.identifier, "CBC", &event, 88)));

        let mut reprocessed = fixture_record("2708251322A", "CBC");
        reprocessed.price_cents = 12_000;
        assert_eq!(must(store.upsert_test_record(&reprocessed)), UpsertOutcome::Updated);

        let stored = must(store.get_test_record(&record.identifier, "CBC"));
        let stored = match stored {
            Some(stored) => stored,
            None => panic!("test record should exist after upsert"),
        };
        assert_eq!(stored.price_cents, 12_000);
        assert_eq!(stored.completed_at, Some(datetime!(2025-08-27 14:50 UTC)));
        assert_eq!(stored.actual_tat_minutes, Some(88));
    }

    #[test]
    fn snapshots_survive_later_metadata_edits() {
        let mut store = open_store();
        let encounter = fixture_encounter("2708251322A");
        must(store.upsert_encounter(&encounter));
        must(store.set_current_metadata(&MetadataChange {
            test_name: "CBC".to_string(),
            price_cents: 10_000,
            tat_minutes: 60,
            section: "HEMATOLOGY".to_string(),
            changed_at: datetime!(2025-01-01 00:00 UTC),
        }));

        let as_of = datetime!(2025-08-27 00:00 UTC);
        let resolved = match must(store.resolve_metadata("CBC", as_of, true)) {
            Some(resolved) => resolved,
            None => panic!("metadata should resolve"),
        };
        let mut record = fixture_record("2708251322A", "CBC");
        record.price_cents = resolved.price_cents;
        record.fact_id = resolved.fact_id;
        must(store.upsert_test_record(&record));

        // Later admin edit must not rewrite the persisted snapshot.
        must(store.set_current_metadata(&MetadataChange {
            test_name: "CBC".to_string(),
            price_cents: 99_000,
            tat_minutes: 30,
            section: "HEMATOLOGY".to_string(),
            changed_at: datetime!(2025-09-01 00:00 UTC),
        }));

        let stored = match must(store.get_test_record(&record.identifier, "CBC")) {
            Some(stored) => stored,
            None => panic!("test record should exist"),
        };
        assert_eq!(stored.price_cents, 10_000);
    }

    #[test]
    fn completion_applies_exactly_once() {
        let mut store = open_store();
        let encounter = fixture_encounter("2708251322A");
        must(store.upsert_encounter(&encounter));
        let record = fixture_record("2708251322A", "CBC");
        must(store.upsert_test_record(&record));

        let event = CompletionEvent {
            key: "2708251322A".to_string(),
            completed_at: datetime!(2025-08-27 14:50 UTC),
        };
        assert!(must(store.apply_completion(&record.identifier, "CBC", &event, 88)));

        let replay = CompletionEvent {
            key: "2708251322A".to_string(),
            completed_at: datetime!(2025-08-27 18:00 UTC),
        };
        assert!(!must(store.apply_completion(&record.identifier, "CBC", &replay, 278)));

        let stored = match must(store.get_test_record(&record.identifier, "CBC")) {
            Some(stored) => stored,
            None => panic!("test record should exist"),
        };
        assert_eq!(stored.completed_at, Some(datetime!(2025-08-27 14:50 UTC)));
        assert_eq!(stored.actual_tat_minutes, Some(88));
        assert!(must(store.open_records_for("2708251322A")).is_empty());
    }

    #[test]
    fn unmatched_names_accumulate_on_one_row() {
        let mut store = open_store();
        let seen = datetime!(2025-08-27 13:22 UTC);
        must(store.record_unmatched("MYSTERY TEST", "labfeed", seen));
        must(store.record_unmatched("MYSTERY TEST", "labfeed", seen + time::Duration::hours(1)));

        let unmatched = must(store.list_unmatched());
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].occurrence_count, 2);
        assert_eq!(unmatched[0].first_seen, seen);
        assert_eq!(unmatched[0].last_seen, seen + time::Duration::hours(1));
    }

    #[test]
    fn export_writes_digest_manifest() {
        let mut store = open_store();
        let encounter = fixture_encounter("2708251322A");
        must(store.upsert_encounter(&encounter));
        must(store.upsert_test_record(&fixture_record("2708251322A", "CBC")));
        must(store.record_unmatched("MYSTERY TEST", "labfeed", datetime!(2025-08-27 13:22 UTC)));

        let out_dir = std::env::temp_dir().join(format!("labtat-export-{}", Ulid::new()));
        let manifest = must(store.export_snapshot(&out_dir));

        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].records, 1);
        assert_eq!(manifest.files[1].records, 1);
        for file in &manifest.files {
            assert!(out_dir.join(&file.path).exists());
            assert_eq!(file.sha256.len(), 64);
        }
        if let Err(err) = fs::remove_dir_all(&out_dir) {
            panic!("failed to clean export dir: {err}");
        }
    }
}
