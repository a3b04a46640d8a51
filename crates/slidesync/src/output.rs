//! Plain-text rendering for operator commands.

use chrono::{DateTime, Utc};
use slidesync_core::models::ConflictEntry;
use slidesync_core::sync::{CycleReport, EngineStatus, PassSummary};
use slidesync_core::util::Timestamp;

pub fn print_cycle(report: &CycleReport) {
    for destination in &report.unreachable {
        println!("UNREACHABLE {destination}");
    }
    if report.passes.is_empty() && report.failures.is_empty() {
        println!("Nothing to sync");
    }
    for pass in &report.passes {
        println!("{}", pass_line(pass));
        for error in &pass.errors {
            println!(
                "  error {}: {}",
                error.natural_key.as_deref().unwrap_or("-"),
                error.message
            );
        }
    }
    for failure in &report.failures {
        println!(
            "FAILED {} {}: {}",
            failure.entity_type, failure.direction, failure.message
        );
    }
}

fn pass_line(pass: &PassSummary) -> String {
    let mut line = format!(
        "{} {}: fetched {} applied {} skipped {} conflicts {} errors {}",
        pass.entity_type,
        pass.direction,
        pass.fetched,
        pass.applied,
        pass.skipped,
        pass.conflicts,
        pass.errors.len()
    );
    if let Some(deletions) = &pass.deletions {
        if deletions.guarded {
            line.push_str(" | deletions guarded (empty source)");
        } else {
            line.push_str(&format!(
                " | orphans {} deleted {} tombstoned {} resurrected {} unlinked {}",
                deletions.orphans,
                deletions.deleted,
                deletions.tombstoned,
                deletions.resurrected,
                deletions.unlinked
            ));
        }
    }
    line
}

pub fn print_status(status: &EngineStatus) {
    let destinations: Vec<String> = status
        .active_destinations
        .iter()
        .map(ToString::to_string)
        .collect();
    println!("Mode: {} ({})", status.mode, destinations.join(", "));
    if status.shutting_down {
        println!("Shutting down");
    }
    println!(
        "Hot entries: {}  Recovered keys pending: {}",
        status.hot_entries, status.pending_recovered_keys
    );

    for entity in &status.entities {
        let state = if entity.enabled { "" } else { " (disabled)" };
        println!(
            "{:<12} {:<10} last success {}  conflicts {}{}",
            entity.entity_type.as_str(),
            entity.tier.to_string(),
            format_ts(entity.last_success_at),
            entity.pending_conflict_count,
            state
        );
        for route in &entity.routes {
            let error = route
                .status
                .last_error
                .as_deref()
                .map(|error| format!("  last error: {error}"))
                .unwrap_or_default();
            println!(
                "    {:<22} {:?} last success {}{}",
                route.direction.to_string(),
                route.status.state,
                format_ts(route.status.last_success_at),
                error
            );
        }
    }
}

pub fn print_conflicts(entries: &[ConflictEntry]) {
    if entries.is_empty() {
        println!("No conflicts");
        return;
    }
    for entry in entries {
        let resolved = if entry.resolved { " [resolved]" } else { "" };
        println!(
            "#{} {} '{}' {} {} -> {} at {}{}",
            entry.id,
            entry.entity_type,
            entry.natural_key_attempted,
            entry.reason,
            entry.source_destination,
            entry.target_destination,
            format_ts(Some(entry.created_at)),
            resolved
        );
    }
}

#[allow(clippy::cast_possible_truncation)]
fn format_ts(ts: Option<Timestamp>) -> String {
    ts.and_then(|ts| DateTime::<Utc>::from_timestamp_millis((ts * 1000.0) as i64))
        .map_or_else(|| "never".to_string(), |at| at.format("%Y-%m-%d %H:%M:%S").to_string())
}
