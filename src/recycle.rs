//! Undo and redo logs for destructive edits.
//!
//! Both lists are bounded by count and by age. Undo pops an entry from
//! `items`, puts its records back and files a fresh entry under `redo`; redo
//! does the reverse. Every hop mints a new id, so a handle is single-use.

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Conflict, Result, StoreError};
use crate::model::{CandidateRow, Card, Document, RecycleEntry, RecyclePayload, RecycleState, WeekRecord};
use crate::ops::detach_columns;
use crate::util::{new_id, now_ms};

pub const DEFAULT_MAX_ITEMS: usize = 20;
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecyclePolicy {
    pub max_items: usize,
    #[serde(deserialize_with = "crate::config::secs")]
    pub ttl: Duration,
}

impl Default for RecyclePolicy {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            ttl: DEFAULT_TTL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleList {
    Undo,
    Redo,
}

impl RecycleState {
    fn list_mut(&mut self, which: RecycleList) -> &mut Vec<RecycleEntry> {
        match which {
            RecycleList::Undo => &mut self.items,
            RecycleList::Redo => &mut self.redo,
        }
    }

    pub fn list(&self, which: RecycleList) -> &[RecycleEntry] {
        match which {
            RecycleList::Undo => &self.items,
            RecycleList::Redo => &self.redo,
        }
    }

    pub fn push(&mut self, which: RecycleList, payload: RecyclePayload, policy: &RecyclePolicy) -> String {
        self.push_at(which, payload, policy, now_ms())
    }

    /// Stamps, appends and prunes. Returns the new entry id.
    pub fn push_at(
        &mut self,
        which: RecycleList,
        payload: RecyclePayload,
        policy: &RecyclePolicy,
        now: i64,
    ) -> String {
        let id = new_id();
        self.list_mut(which).push(RecycleEntry {
            id: id.clone(),
            deleted_at: now.to_string(),
            payload,
        });
        self.prune_at(policy, now);
        id
    }

    pub fn pop(&mut self, which: RecycleList, id: &str, policy: &RecyclePolicy) -> Option<RecycleEntry> {
        self.pop_at(which, id, policy, now_ms())
    }

    /// Removes and returns a live entry. Expired entries are gone first.
    pub fn pop_at(
        &mut self,
        which: RecycleList,
        id: &str,
        policy: &RecyclePolicy,
        now: i64,
    ) -> Option<RecycleEntry> {
        self.prune_at(policy, now);
        let list = self.list_mut(which);
        let idx = list.iter().position(|entry| entry.id == id)?;
        Some(list.remove(idx))
    }

    pub fn prune(&mut self, policy: &RecyclePolicy) {
        self.prune_at(policy, now_ms());
    }

    pub fn prune_at(&mut self, policy: &RecyclePolicy, now: i64) {
        let ttl_ms = i64::try_from(policy.ttl.as_millis()).unwrap_or(i64::MAX);
        for list in [&mut self.items, &mut self.redo] {
            list.retain(|entry| now.saturating_sub(entry.deleted_at_ms()) <= ttl_ms);
            if list.len() > policy.max_items {
                let excess = list.len() - policy.max_items;
                list.drain(..excess);
            }
        }
    }
}

fn id_set<'a>(existing: impl Iterator<Item = &'a str>) -> HashSet<String> {
    existing.map(str::to_string).collect()
}

/// Puts the snapshot's records back, skipping ids that already exist.
///
/// Cards whose column has since gone land at the end of the first column.
/// With no column left to hold them the restore fails with
/// [`Conflict::LastColumn`].
pub fn restore(doc: &mut Document, entry: &RecycleEntry) -> Result<()> {
    match &entry.payload {
        RecyclePayload::KanbanCards { cards, candidates } => {
            let existing = id_set(doc.kanban.cards.iter().map(|card| card.uuid.as_str()));
            let incoming: Vec<&Card> = cards
                .iter()
                .filter(|card| !card.uuid.is_empty() && !existing.contains(&card.uuid))
                .collect();
            let fallback = doc.sorted_columns().first().map(|column| column.id.clone());
            if !incoming.is_empty() && fallback.is_none() {
                return Err(Conflict::LastColumn.into());
            }
            for card in incoming {
                let mut card = card.clone();
                if doc.column(&card.column_id).is_none() {
                    if let Some(column_id) = &fallback {
                        card.order = doc.max_card_order(column_id) + 1;
                        card.column_id = column_id.clone();
                    }
                }
                doc.kanban.cards.push(card);
            }
            restore_rows(doc, candidates);
        }
        RecyclePayload::KanbanColumns { columns, cards } => {
            let existing = id_set(doc.kanban.columns.iter().map(|column| column.id.as_str()));
            doc.kanban.columns.extend(
                columns
                    .iter()
                    .filter(|column| !column.id.is_empty() && !existing.contains(&column.id))
                    .cloned(),
            );
            // Cards were moved, not deleted: swap the moved copies for the snapshot.
            let moved: HashSet<&str> = cards
                .iter()
                .map(|card| card.uuid.as_str())
                .filter(|id| !id.is_empty())
                .collect();
            doc.kanban
                .cards
                .retain(|card| !moved.contains(card.uuid.as_str()));
            doc.kanban
                .cards
                .extend(cards.iter().filter(|card| !card.uuid.is_empty()).cloned());
        }
        RecyclePayload::CandidateRows { candidates } => restore_rows(doc, candidates),
        RecyclePayload::WeeklyEntries { entries } => {
            for removed in entries {
                if removed.week_start.is_empty() {
                    continue;
                }
                let week = doc
                    .weekly
                    .entry(removed.week_start.clone())
                    .or_insert_with(|| WeekRecord {
                        week_start: removed.week_start.clone(),
                        week_end: removed.week_end.clone(),
                        ..WeekRecord::default()
                    });
                if week.week_end.is_empty() {
                    week.week_end = removed.week_end.clone();
                }
                week.entries
                    .entry(removed.day)
                    .or_insert_with(|| removed.payload.clone());
            }
        }
        RecyclePayload::Todos { todos } => {
            let existing = id_set(doc.todos.iter().map(|todo| todo.id.as_str()));
            doc.todos.extend(
                todos
                    .iter()
                    .filter(|todo| !todo.id.is_empty() && !existing.contains(&todo.id))
                    .cloned(),
            );
        }
    }    Ok(())
}

fn restore_rows(doc: &mut Document, rows: &[CandidateRow]) {
    let existing = id_set(doc.kanban.candidates.iter().map(|row| row.uuid.as_str()));
    doc.kanban.candidates.extend(
        rows.iter()
            .filter(|row| !row.uuid.is_empty() && !existing.contains(&row.uuid))
            .cloned(),
    );
}

/// Removes the snapshot's records again. Column snapshots go through the
/// same cascade as a live delete, so the last-column guard still applies.
pub fn reapply(doc: &mut Document, entry: &RecycleEntry) -> Result<()> {
    match &entry.payload {
        RecyclePayload::KanbanCards { cards, candidates } => {
            let card_ids: HashSet<&str> = cards.iter().map(|card| card.uuid.as_str()).collect();
            let row_ids: HashSet<&str> = candidates.iter().map(|row| row.uuid.as_str()).collect();
            doc.kanban
                .cards
                .retain(|card| !card_ids.contains(card.uuid.as_str()));
            doc.kanban
                .candidates
                .retain(|row| !row_ids.contains(row.uuid.as_str()));
        }
        RecyclePayload::KanbanColumns { columns, .. } => {
            let ids: HashSet<String> = columns
                .iter()
                .map(|column| column.id.clone())
                .filter(|id| !id.is_empty())
                .collect();
            if ids.is_empty() {
                return Err(StoreError::InvalidInput(
                    "Recycle entry has no columns.".to_string(),
                ));
            }
            detach_columns(doc, &ids)?;
        }
        RecyclePayload::CandidateRows { candidates } => {
            let ids: HashSet<&str> = candidates.iter().map(|row| row.uuid.as_str()).collect();
            doc.kanban
                .candidates
                .retain(|row| !ids.contains(row.uuid.as_str()));
        }
        RecyclePayload::WeeklyEntries { entries } => {
            for removed in entries {
                if let Some(week) = doc.weekly.get_mut(&removed.week_start) {
                    week.entries.remove(&removed.day);
                }
            }
        }
        RecyclePayload::Todos { todos } => {
            let ids: HashSet<&str> = todos.iter().map(|todo| todo.id.as_str()).collect();
            doc.todos.retain(|todo| !ids.contains(todo.id.as_str()));
        }
    }
    Ok(())
}

/// Undoes entry `id`; returns the id to redo it with.
///
/// A refused restore leaves the undo entry in place.
pub fn undo(doc: &mut Document, id: &str, policy: &RecyclePolicy) -> Result<String> {
    doc.recycle.prune(policy);
    let entry = doc
        .recycle
        .items
        .iter()
        .find(|entry| entry.id == id)
        .cloned()
        .ok_or_else(|| StoreError::not_found("undo entry", id))?;
    restore(doc, &entry)?;
    doc.recycle.items.retain(|item| item.id != id);
    let redo_id = doc.recycle.push(RecycleList::Redo, entry.payload, policy);
    tracing::info!(kind = doc_kind(&doc.recycle.redo), "undo applied");
    Ok(redo_id)
}

/// Redoes entry `id`; returns the id to undo it with again.
///
/// A refused reapply leaves the redo entry in place.
pub fn redo(doc: &mut Document, id: &str, policy: &RecyclePolicy) -> Result<String> {
    doc.recycle.prune(policy);
    let entry = doc
        .recycle
        .redo
        .iter()
        .find(|entry| entry.id == id)
        .cloned()
        .ok_or_else(|| StoreError::not_found("redo entry", id))?;
    reapply(doc, &entry)?;
    doc.recycle.redo.retain(|item| item.id != id);
    let undo_id = doc.recycle.push(RecycleList::Undo, entry.payload, policy);
    tracing::info!(kind = doc_kind(&doc.recycle.items), "redo applied");
    Ok(undo_id)
}

fn doc_kind(list: &[RecycleEntry]) -> &'static str {
    list.last().map(|entry| entry.payload.kind()).unwrap_or("none")
}
