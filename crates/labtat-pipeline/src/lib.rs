//! Staged batch orchestration over the core model and the SQLite store:
//! encounter reconciliation, test record linking with as-of metadata
//! resolution, and completion matching. Row-level failures are logged and
//! counted; only store failures abort a batch.

use anyhow::{Context, Result};
use labtat_core::{
    actual_tat_minutes, BatchSummary, CompletionEvent, Encounter, Identifier, MetadataSource,
    RawRow, TestRecord,
};
use labtat_store_sqlite::{SqliteStore, UpsertOutcome};
use serde::{Deserialize, Serialize};

/// Knobs for the linking stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkPolicy {
    /// When no dated interval covers the resolution date, fall back to the
    /// current metadata projection instead of treating the name as
    /// unmatched.
    pub fallback_to_current: bool,
    /// Seed a placeholder projection (price 0, TAT 1440, section PENDING)
    /// for names with no metadata at all, so their rows keep flowing while
    /// operators price them.
    pub seed_unknown: bool,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self { fallback_to_current: true, seed_unknown: false }
    }
}

/// Counters for one completion-matching pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchSummary {
    pub matched: u64,
    pub on_time: u64,
    pub delayed: u64,
    pub already_completed: u64,
    pub unmatched_keys: u64,
}

/// Stage 1: reconcile every decodable row into its encounter. Malformed
/// identifiers are warned about and counted in `summary.errors`; valid rows
/// upsert one encounter per distinct identifier, last write wins.
///
/// # Errors
/// Returns an error only when the store itself fails.
pub fn reconcile_batch(
    store: &mut SqliteStore,
    rows: &[RawRow],
    summary: &mut BatchSummary,
) -> Result<()> {
    for row in rows {
        let encounter = match Encounter::from_row(row) {
            Ok(encounter) => encounter,
            Err(err) => {
                tracing::warn!(
                    identifier = %row.identifier,
                    test_name = %row.test_name,
                    error = %err,
                    "skipping row with malformed identifier"
                );
                summary.errors += 1;
                continue;
            }
        };

        match store.upsert_encounter(&encounter)? {
            UpsertOutcome::Inserted => summary.encounters_inserted += 1,
            UpsertOutcome::Updated => summary.encounters_updated += 1,
        }
    }

    Ok(())
}

/// Stage 2: link each decodable row to its snapshot. Runs after
/// [`reconcile_batch`] has finished for the same rows; a row whose encounter
/// is still missing at this point is a data-integrity error, warned and
/// counted, never fatal. Names with no resolvable metadata accumulate in the
/// unmatched log instead of producing records.
///
/// # Errors
/// Returns an error only when the store itself fails.
pub fn link_batch(
    store: &mut SqliteStore,
    rows: &[RawRow],
    policy: LinkPolicy,
    summary: &mut BatchSummary,
) -> Result<()> {
    for row in rows {
        // Malformed identifiers were already counted in stage 1.
        let Ok(encounter) = Encounter::from_row(row) else { continue };

        if !store.encounter_exists(&encounter.identifier)? {
            tracing::warn!(
                identifier = %encounter.identifier,
                test_name = %row.test_name,
                "row has no reconciled encounter; skipping link"
            );
            summary.errors += 1;
            continue;
        }

        link_row(store, row, &encounter, policy, summary)?;
    }

    Ok(())
}

fn link_row(
    store: &mut SqliteStore,
    row: &RawRow,
    encounter: &Encounter,
    policy: LinkPolicy,
    summary: &mut BatchSummary,
) -> Result<()> {
    // Resolution happens at the row's calendar date, not the
    // identifier-decoded time-in. The two can differ on late-registered rows.
    let as_of = row.encounter_date.midnight().assume_utc();

    let mut resolved =
        store.resolve_metadata(&row.test_name, as_of, policy.fallback_to_current)?;

    if resolved.is_none() && policy.seed_unknown {
        if store.seed_default_metadata(&row.test_name)? {
            tracing::info!(test_name = %row.test_name, "seeded placeholder metadata");
        }
        resolved = store.resolve_metadata(&row.test_name, as_of, policy.fallback_to_current)?;
    }

    let Some(metadata) = resolved else {
        store.record_unmatched(&row.test_name, &row.source_tag, as_of)?;
        summary.unmatched_count += 1;
        tracing::warn!(
            test_name = %row.test_name,
            source = %row.source_tag,
            "no metadata resolvable; routed to unmatched"
        );
        return Ok(());
    };

    debug_assert!(
        metadata.source == MetadataSource::Current || metadata.fact_id.is_some(),
        "interval resolutions carry a fact id"
    );

    let record = TestRecord {
        identifier: encounter.identifier.clone(),
        test_name: row.test_name.clone(),
        price_cents: metadata.price_cents,
        tat_minutes: metadata.tat_minutes,
        section: metadata.section,
        metadata_source: metadata.source,
        fact_id: metadata.fact_id,
        encounter_date: encounter.encounter_date,
        time_in: encounter.time_in,
        shift: encounter.shift,
        facility_group: encounter.facility_group,
        completed_at: None,
        actual_tat_minutes: None,
    };

    match store.upsert_test_record(&record)? {
        UpsertOutcome::Inserted => summary.records_inserted += 1,
        UpsertOutcome::Updated => summary.records_updated += 1,
    }

    Ok(())
}

/// Ingest one batch of raw rows end to end: reconcile every encounter
/// first, then link snapshots. The ordering guarantees a row never links
/// before its own encounter exists. Re-running the same batch converges on
/// the same state.
///
/// # Errors
/// Returns an error only when the store itself fails; malformed rows and
/// unresolvable names are counted, logged, and skipped.
pub fn ingest_rows(
    store: &mut SqliteStore,
    rows: &[RawRow],
    policy: LinkPolicy,
) -> Result<BatchSummary> {
    let mut summary = BatchSummary::default();

    reconcile_batch(store, rows, &mut summary)?;
    link_batch(store, rows, policy, &mut summary)?;

    tracing::info!(
        encounters_inserted = summary.encounters_inserted,
        encounters_updated = summary.encounters_updated,
        records_inserted = summary.records_inserted,
        records_updated = summary.records_updated,
        errors = summary.errors,
        unmatched = summary.unmatched_count,
        "ingest batch finished"
    );

    Ok(summary)
}

/// Stage 3: apply one batch of completion events. Each event's key is
/// decoded as an identifier, every still-open snapshot under that
/// identifier gets its completion stamped, and actual TAT is the truncated
/// whole-minute span from intake to completion. Replays are no-ops.
///
/// # Errors
/// Returns an error only when the store itself fails.
pub fn match_batch(store: &mut SqliteStore, events: &[CompletionEvent]) -> Result<MatchSummary> {
    let mut summary = MatchSummary::default();

    for event in events {
        // Stored identifiers are always decodable, so an undecodable key can
        // only ever be a no-match.
        let identifier = match Identifier::parse(&event.key) {
            Ok(identifier) => identifier,
            Err(err) => {
                tracing::warn!(key = %event.key, error = %err, "completion key is not a lab identifier");
                summary.unmatched_keys += 1;
                continue;
            }
        };

        let open = store
            .open_records_for(identifier.as_str())
            .with_context(|| format!("failed to load open records for {}", event.key))?;

        if open.is_empty() {
            if store.get_encounter(&identifier)?.is_some() {
                summary.already_completed += 1;
            } else {
                summary.unmatched_keys += 1;
                tracing::warn!(key = %event.key, "completion key matches no encounter");
            }
            continue;
        }

        for record in &open {
            let actual = actual_tat_minutes(record.time_in, event.completed_at);
            if store.apply_completion(&identifier, &record.test_name, event, actual)? {
                summary.matched += 1;
                if actual > record.tat_minutes {
                    summary.delayed += 1;
                } else {
                    summary.on_time += 1;
                }
            } else {
                summary.already_completed += 1;
            }
        }
    }

    tracing::info!(
        matched = summary.matched,
        on_time = summary.on_time,
        delayed = summary.delayed,
        already_completed = summary.already_completed,
        unmatched_keys = summary.unmatched_keys,
        "completion batch finished"
    );

    Ok(summary)
}
