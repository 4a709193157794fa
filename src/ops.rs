//! Document-level edits.
//!
//! Each function mutates the document in place and never touches disk; the
//! session wraps them and persists afterwards. Destructive edits file a
//! recycle entry and hand back its id as the undo handle.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Deserialize;

use crate::error::{Conflict, Result, StoreError};
use crate::model::{
    CandidateField, CandidateRow, Card, Column, Day, DayEntry, Document, RecyclePayload,
    RemovedDayEntry, Todo, WeekRecord, CANDIDATE_SHORT_MAX, CARD_CODE_MAX, CARD_NAME_MAX,
    CARD_PERSON_MAX, COLUMN_NAME_MAX, DAY_CONTENT_MAX, DAY_TIME_MAX, ID_MAX, TODO_TEXT_MAX,
    WEEK_KEY_MAX,
};
use crate::recycle::{RecycleList, RecyclePolicy};
use crate::util::{clamp_multiline, clamp_string, new_id, now_string};

const CONTACT_PHONE_MAX: usize = 32;
const CONTACT_EMAIL_MAX: usize = 120;

fn clamp_id(value: &str) -> String {
    clamp_string(value, ID_MAX, true)
}

fn clamp_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    ids.into_iter()
        .map(clamp_id)
        .filter(|id| !id.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Columns
// ---------------------------------------------------------------------------

pub fn add_column(doc: &mut Document, name: &str) -> Result<Column> {
    let name = clamp_string(name, COLUMN_NAME_MAX, true);
    if name.is_empty() {
        return Err(StoreError::InvalidInput("Column name is required.".to_string()));
    }
    let order = doc
        .kanban
        .columns
        .iter()
        .map(|column| column.order)
        .max()
        .unwrap_or(0)
        + 1;
    let now = now_string();
    let column = Column {
        id: new_id(),
        name,
        order,
        created_at: now.clone(),
        updated_at: now,
    };
    doc.kanban.columns.push(column.clone());
    Ok(column)
}

pub fn rename_column(doc: &mut Document, id: &str, name: &str) -> Result<()> {
    let id = clamp_id(id);
    let name = clamp_string(name, COLUMN_NAME_MAX, true);
    if name.is_empty() {
        return Err(StoreError::InvalidInput("Column name is required.".to_string()));
    }
    let column = doc
        .kanban
        .columns
        .iter_mut()
        .find(|column| column.id == id)
        .ok_or_else(|| StoreError::not_found("column", id.as_str()))?;
    column.name = name;
    column.updated_at = now_string();
    Ok(())
}

/// What removing a set of columns will do, computed before anything moves.
struct ColumnRemoval {
    ids: HashSet<String>,
    columns: Vec<Column>,
    cards: Vec<Card>,
    /// removed column id -> fallback column id
    fallback: HashMap<String, String>,
}

fn plan_column_removal(
    doc: &Document,
    ids: &HashSet<String>,
) -> std::result::Result<ColumnRemoval, Conflict> {
    let sorted = doc.sorted_columns();
    let remaining: Vec<&Column> = sorted
        .iter()
        .copied()
        .filter(|column| !ids.contains(&column.id))
        .collect();
    let columns: Vec<Column> = doc
        .kanban
        .columns
        .iter()
        .filter(|column| ids.contains(&column.id))
        .cloned()
        .collect();
    let cards: Vec<Card> = doc
        .kanban
        .cards
        .iter()
        .filter(|card| ids.contains(&card.column_id))
        .cloned()
        .collect();

    if remaining.is_empty() && !cards.is_empty() {
        return Err(Conflict::LastColumn);
    }

    let mut fallback = HashMap::new();
    for removed in &columns {
        let target = remaining
            .iter()
            .find(|column| column.order > removed.order)
            .or_else(|| remaining.iter().rev().find(|column| column.order < removed.order))
            .or_else(|| remaining.first());
        if let Some(target) = target {
            fallback.insert(removed.id.clone(), target.id.clone());
        }
    }

    Ok(ColumnRemoval {
        ids: ids.clone(),
        columns,
        cards,
        fallback,
    })
}

impl ColumnRemoval {
    fn apply(&self, doc: &mut Document) {
        let mut moving: Vec<usize> = doc
            .kanban
            .cards
            .iter()
            .enumerate()
            .filter(|(_, card)| self.ids.contains(&card.column_id))
            .map(|(idx, _)| idx)
            .collect();
        moving.sort_by_key(|&idx| doc.kanban.cards[idx].order);

        let now = now_string();
        let mut next_order: HashMap<String, i64> = HashMap::new();
        for idx in moving {
            let Some(target) = self.fallback.get(&doc.kanban.cards[idx].column_id).cloned() else {
                continue;
            };
            let order = next_order
                .entry(target.clone())
                .or_insert_with(|| doc.max_card_order(&target));
            *order += 1;
            let card = &mut doc.kanban.cards[idx];
            card.column_id = target;
            card.order = *order;
            card.updated_at = now.clone();
        }

        doc.kanban.columns.retain(|column| !self.ids.contains(&column.id));
    }
}

/// Removes columns and moves their cards aside without recording anything.
/// Returns the before-image of the removed columns and cards.
pub(crate) fn detach_columns(
    doc: &mut Document,
    ids: &HashSet<String>,
) -> std::result::Result<(Vec<Column>, Vec<Card>), Conflict> {
    let plan = plan_column_removal(doc, ids)?;
    plan.apply(doc);
    Ok((plan.columns, plan.cards))
}

/// Deletes columns, moving any cards to a fallback column.
///
/// Each removed column hands its cards to the next remaining column by
/// order, else the nearest preceding one, else the first remaining. Fails
/// with [`Conflict::LastColumn`] when no column would remain to hold cards,
/// leaving the document untouched.
pub fn remove_columns<'a>(
    doc: &mut Document,
    ids: impl IntoIterator<Item = &'a str>,
    policy: &RecyclePolicy,
) -> Result<Option<String>> {
    let ids = clamp_ids(ids);
    let plan = plan_column_removal(doc, &ids)?;
    if plan.columns.is_empty() {
        return Ok(None);
    }
    let undo_id = doc.recycle.push(
        RecycleList::Undo,
        RecyclePayload::KanbanColumns {
            columns: plan.columns.clone(),
            cards: plan.cards.clone(),
        },
        policy,
    );
    plan.apply(doc);
    tracing::info!(columns = plan.columns.len(), moved = plan.cards.len(), "removed kanban columns");
    Ok(Some(undo_id))
}

// ---------------------------------------------------------------------------
// Cards
// ---------------------------------------------------------------------------

/// Input for a new kanban card. Contact fields go to the candidate row only.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NewCard {
    pub column_id: String,
    pub candidate_name: String,
    pub icims_id: String,
    pub employee_id: String,
    pub job_id: String,
    pub req_id: String,
    pub job_name: String,
    pub job_location: String,
    pub manager: String,
    pub branch: String,
    pub contact_phone: String,
    pub contact_email: String,
}

/// Partial card edit; `None` leaves a field alone.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CardUpdate {
    pub column_id: Option<String>,
    pub order: Option<i64>,
    pub candidate_name: Option<String>,
    pub icims_id: Option<String>,
    pub employee_id: Option<String>,
    pub job_id: Option<String>,
    pub req_id: Option<String>,
    pub job_name: Option<String>,
    pub job_location: Option<String>,
    pub manager: Option<String>,
    pub branch: Option<String>,
    pub contact_phone: Option<String>,
    pub contact_email: Option<String>,
}

fn job_id_name(job_id: &str, job_name: &str) -> String {
    [job_id.trim(), job_name.trim()]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Copies the card's shared fields onto its candidate row.
fn sync_row_from_card(row: &mut CandidateRow, card: &Card) {
    row.set(CandidateField::CandidateName, card.candidate_name.as_str());
    row.set(CandidateField::IcimsId, card.icims_id.as_str());
    row.set(CandidateField::EmployeeId, card.employee_id.as_str());
    row.set(CandidateField::ReqId, card.req_id.as_str());
    row.set(
        CandidateField::JobIdName,
        job_id_name(&card.job_id, &card.job_name),
    );
    row.set(CandidateField::JobLocation, card.job_location.as_str());
    row.set(CandidateField::Manager, card.manager.as_str());
    row.set(CandidateField::Branch, card.branch.as_str());
}

fn set_contacts(row: &mut CandidateRow, phone: Option<&str>, email: Option<&str>) {
    if let Some(phone) = phone {
        row.set(
            CandidateField::ContactPhone,
            clamp_string(phone, CONTACT_PHONE_MAX, false),
        );
    }
    if let Some(email) = email {
        row.set(
            CandidateField::ContactEmail,
            clamp_string(email, CONTACT_EMAIL_MAX, false),
        );
    }
}

/// Adds a card at the bottom of its column together with its candidate row.
pub fn add_card(doc: &mut Document, input: &NewCard) -> Result<Card> {
    let column_id = clamp_id(&input.column_id);
    if doc.column(&column_id).is_none() {
        return Err(StoreError::InvalidInput("Invalid column.".to_string()));
    }
    let now = now_string();
    let card = Card {
        uuid: new_id(),
        order: doc.max_card_order(&column_id) + 1,
        column_id,
        candidate_name: clamp_string(&input.candidate_name, CARD_NAME_MAX, false),
        icims_id: clamp_string(&input.icims_id, CARD_CODE_MAX, false),
        employee_id: clamp_string(&input.employee_id, CARD_CODE_MAX, false),
        job_id: clamp_string(&input.job_id, CARD_CODE_MAX, false),
        req_id: clamp_string(&input.req_id, CARD_CODE_MAX, false),
        job_name: clamp_string(&input.job_name, CARD_NAME_MAX, false),
        job_location: clamp_string(&input.job_location, CARD_NAME_MAX, false),
        manager: clamp_string(&input.manager, CARD_PERSON_MAX, false),
        branch: clamp_string(&input.branch, CARD_PERSON_MAX, false),
        created_at: now.clone(),
        updated_at: now,
    };

    let mut row = CandidateRow::new(card.uuid.clone());
    sync_row_from_card(&mut row, &card);
    set_contacts(
        &mut row,
        Some(input.contact_phone.as_str()),
        Some(input.contact_email.as_str()),
    );
    doc.kanban.cards.push(card.clone());
    doc.kanban.candidates.push(row);
    Ok(card)
}

/// Applies a partial edit and mirrors it onto the candidate row.
///
/// A `column_id` naming a column that does not exist is ignored.
pub fn update_card(doc: &mut Document, uuid: &str, update: &CardUpdate) -> Result<Card> {
    let uuid = clamp_id(uuid);
    let valid_columns: HashSet<String> =
        doc.kanban.columns.iter().map(|column| column.id.clone()).collect();
    let card = doc
        .kanban
        .cards
        .iter_mut()
        .find(|card| card.uuid == uuid)
        .ok_or_else(|| StoreError::not_found("card", uuid.as_str()))?;

    let text_fields: [(&Option<String>, &mut String, usize); 9] = [
        (&update.candidate_name, &mut card.candidate_name, CARD_NAME_MAX),
        (&update.icims_id, &mut card.icims_id, CARD_CODE_MAX),
        (&update.employee_id, &mut card.employee_id, CARD_CODE_MAX),
        (&update.job_id, &mut card.job_id, CARD_CODE_MAX),
        (&update.req_id, &mut card.req_id, CARD_CODE_MAX),
        (&update.job_name, &mut card.job_name, CARD_NAME_MAX),
        (&update.job_location, &mut card.job_location, CARD_NAME_MAX),
        (&update.manager, &mut card.manager, CARD_PERSON_MAX),
        (&update.branch, &mut card.branch, CARD_PERSON_MAX),
    ];
    for (value, slot, max_len) in text_fields {
        if let Some(value) = value {
            *slot = clamp_string(value, max_len, false);
        }
    }
    if let Some(column_id) = &update.column_id {
        let column_id = clamp_id(column_id);
        if valid_columns.contains(&column_id) {
            card.column_id = column_id;
        }
    }
    if let Some(order) = update.order {
        card.order = order;
    }
    card.updated_at = now_string();
    let card = card.clone();

    let row = ensure_candidate_row(doc, &uuid)?;
    sync_row_from_card(row, &card);
    set_contacts(
        row,
        update.contact_phone.as_deref(),
        update.contact_email.as_deref(),
    );
    Ok(card)
}

/// Renumbers a column's cards from 1 following `ordered`. Unknown or repeated
/// ids are skipped; cards left out keep their relative order at the end.
pub fn reorder_column<'a>(
    doc: &mut Document,
    column_id: &str,
    ordered: impl IntoIterator<Item = &'a str>,
) -> Result<()> {
    let column_id = clamp_id(column_id);
    let mut in_column: Vec<(i64, String)> = doc
        .kanban
        .cards
        .iter()
        .filter(|card| card.column_id == column_id)
        .map(|card| (card.order, card.uuid.clone()))
        .collect();
    in_column.sort_by_key(|(order, _)| *order);
    let members: HashSet<&str> = in_column.iter().map(|(_, id)| id.as_str()).collect();

    let mut sequence: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for id in ordered {
        let id = clamp_id(id);
        if members.contains(id.as_str()) && seen.insert(id.clone()) {
            sequence.push(id);
        }
    }
    for (_, id) in &in_column {
        if !seen.contains(id) {
            sequence.push(id.clone());
        }
    }

    let positions: HashMap<String, i64> = sequence
        .into_iter()
        .zip(1_i64..)
        .collect();
    let now = now_string();
    for card in doc
        .kanban
        .cards
        .iter_mut()
        .filter(|card| card.column_id == column_id)
    {
        if let Some(order) = positions.get(&card.uuid) {
            card.order = *order;
            card.updated_at = now.clone();
        }
    }
    Ok(())
}

/// Deletes cards together with their candidate rows.
pub fn remove_cards<'a>(
    doc: &mut Document,
    uuids: impl IntoIterator<Item = &'a str>,
    policy: &RecyclePolicy,
) -> Option<String> {
    let ids = clamp_ids(uuids);
    let cards: Vec<Card> = doc
        .kanban
        .cards
        .iter()
        .filter(|card| ids.contains(&card.uuid))
        .cloned()
        .collect();
    let candidates: Vec<CandidateRow> = doc
        .kanban
        .candidates
        .iter()
        .filter(|row| ids.contains(&row.uuid))
        .cloned()
        .collect();
    if cards.is_empty() && candidates.is_empty() {
        return None;
    }
    doc.kanban.cards.retain(|card| !ids.contains(&card.uuid));
    doc.kanban.candidates.retain(|row| !ids.contains(&row.uuid));
    Some(doc.recycle.push(
        RecycleList::Undo,
        RecyclePayload::KanbanCards { cards, candidates },
        policy,
    ))
}

// ---------------------------------------------------------------------------
// Candidate rows
// ---------------------------------------------------------------------------

/// Returns the row for `uuid`, creating it from the matching card if needed.
fn ensure_candidate_row<'a>(doc: &'a mut Document, uuid: &str) -> Result<&'a mut CandidateRow> {
    if let Some(idx) = doc.kanban.candidates.iter().position(|row| row.uuid == uuid) {
        let row = &mut doc.kanban.candidates[idx];
        row.fill_missing();
        return Ok(row);
    }
    let card = doc
        .card(uuid)
        .cloned()
        .ok_or_else(|| StoreError::not_found("candidate", uuid))?;
    let mut row = CandidateRow::new(uuid);
    row.set(CandidateField::CandidateName, card.candidate_name);
    row.set(CandidateField::ReqId, card.req_id);
    doc.kanban.candidates.push(row);
    let idx = doc.kanban.candidates.len() - 1;
    Ok(&mut doc.kanban.candidates[idx])
}

/// Reads a candidate row, refreshing name and requisition from the card.
pub fn candidate_row(doc: &mut Document, uuid: &str) -> Result<CandidateRow> {
    let uuid = clamp_id(uuid);
    let card = doc.card(&uuid).cloned();
    let row = ensure_candidate_row(doc, &uuid)?;
    if let Some(card) = card {
        if !card.candidate_name.is_empty() {
            row.set(CandidateField::CandidateName, card.candidate_name);
        }
        if !card.req_id.is_empty() {
            row.set(CandidateField::ReqId, card.req_id);
        }
    }
    Ok(row.clone())
}

/// Writes the given fields onto a candidate row. The name is owned by the
/// card and is not editable here.
pub fn save_candidate_fields(
    doc: &mut Document,
    uuid: &str,
    fields: &BTreeMap<CandidateField, String>,
) -> Result<()> {
    let uuid = clamp_id(uuid);
    let row = ensure_candidate_row(doc, &uuid)?;
    for (field, value) in fields {
        if *field == CandidateField::CandidateName {
            continue;
        }
        let value = if field.max_len() > CANDIDATE_SHORT_MAX {
            clamp_multiline(value, field.max_len())
        } else {
            clamp_string(value, field.max_len(), false)
        };
        row.set(*field, value);
    }
    Ok(())
}

pub fn remove_candidate_rows<'a>(
    doc: &mut Document,
    ids: impl IntoIterator<Item = &'a str>,
    policy: &RecyclePolicy,
) -> Option<String> {
    let ids = clamp_ids(ids);
    let candidates: Vec<CandidateRow> = doc
        .kanban
        .candidates
        .iter()
        .filter(|row| ids.contains(&row.uuid))
        .cloned()
        .collect();
    if candidates.is_empty() {
        return None;
    }
    doc.kanban.candidates.retain(|row| !ids.contains(&row.uuid));
    Some(doc.recycle.push(
        RecycleList::Undo,
        RecyclePayload::CandidateRows { candidates },
        policy,
    ))
}

// ---------------------------------------------------------------------------
// Todos
// ---------------------------------------------------------------------------

pub fn add_todo(doc: &mut Document, text: &str) -> Result<Todo> {
    let text = clamp_string(text, TODO_TEXT_MAX, true);
    if text.is_empty() {
        return Err(StoreError::InvalidInput("Todo text is required.".to_string()));
    }
    let todo = Todo {
        id: new_id(),
        text,
        done: false,
        created_at: now_string(),
    };
    doc.todos.push(todo.clone());
    Ok(todo)
}

pub fn set_todo_done(doc: &mut Document, id: &str, done: bool) -> Result<()> {
    let id = clamp_id(id);
    let todo = doc
        .todos
        .iter_mut()
        .find(|todo| todo.id == id)
        .ok_or_else(|| StoreError::not_found("todo", id.as_str()))?;
    todo.done = done;
    Ok(())
}

pub fn remove_todos<'a>(
    doc: &mut Document,
    ids: impl IntoIterator<Item = &'a str>,
    policy: &RecyclePolicy,
) -> Option<String> {
    let ids = clamp_ids(ids);
    let todos: Vec<Todo> = doc
        .todos
        .iter()
        .filter(|todo| ids.contains(&todo.id))
        .cloned()
        .collect();
    if todos.is_empty() {
        return None;
    }
    doc.todos.retain(|todo| !ids.contains(&todo.id));
    Some(doc.recycle.push(RecycleList::Undo, RecyclePayload::Todos { todos }, policy))
}

// ---------------------------------------------------------------------------
// Weekly tracker
// ---------------------------------------------------------------------------

fn week_key(value: &str) -> Result<String> {
    let key = clamp_string(value, WEEK_KEY_MAX, true);
    if key.is_empty() {
        return Err(StoreError::InvalidInput("Missing week_start.".to_string()));
    }
    Ok(key)
}

/// Returns the week starting at `start`, creating an empty one if absent.
/// The flag reports whether the document changed.
pub fn week(doc: &mut Document, start: &str, end: &str) -> Result<(WeekRecord, bool)> {
    let start = week_key(start)?;
    let end = clamp_string(end, WEEK_KEY_MAX, true);
    let mut changed = false;
    let week = doc.weekly.entry(start.clone()).or_insert_with(|| {
        changed = true;
        WeekRecord {
            week_start: start.clone(),
            week_end: end.clone(),
            entries: BTreeMap::new(),
        }
    });
    if week.week_start.is_empty() {
        week.week_start = start;
        changed = true;
    }
    if week.week_end.is_empty() && !end.is_empty() {
        week.week_end = end;
        changed = true;
    }
    Ok((week.clone(), changed))
}

/// Replaces a week's day entries wholesale.
pub fn set_week(
    doc: &mut Document,
    start: &str,
    end: &str,
    entries: &BTreeMap<Day, DayEntry>,
) -> Result<()> {
    let start = week_key(start)?;
    let entries = entries
        .iter()
        .map(|(day, entry)| {
            (
                *day,
                DayEntry {
                    start: clamp_string(&entry.start, DAY_TIME_MAX, true),
                    end: clamp_string(&entry.end, DAY_TIME_MAX, true),
                    content: clamp_multiline(&entry.content, DAY_CONTENT_MAX),
                },
            )
        })
        .collect();
    doc.weekly.insert(
        start.clone(),
        WeekRecord {
            week_start: start,
            week_end: clamp_string(end, WEEK_KEY_MAX, true),
            entries,
        },
    );
    Ok(())
}

/// Identifier of one day entry as shown in table views.
pub fn weekly_row_id(week_start: &str, day: Day) -> String {
    format!("{week_start}-{day}")
}

/// Removes day entries by row id (`"{week_start}-{Day}"`).
pub fn remove_weekly_entries<'a>(
    doc: &mut Document,
    row_ids: impl IntoIterator<Item = &'a str>,
    policy: &RecyclePolicy,
) -> Option<String> {
    let ids = clamp_ids(row_ids);
    let mut removed = Vec::new();
    for week in doc.weekly.values_mut() {
        let days: Vec<Day> = week
            .entries
            .keys()
            .copied()
            .filter(|day| ids.contains(&weekly_row_id(&week.week_start, *day)))
            .collect();
        for day in days {
            if let Some(payload) = week.entries.remove(&day) {
                removed.push(RemovedDayEntry {
                    week_start: week.week_start.clone(),
                    week_end: week.week_end.clone(),
                    day,
                    payload,
                });
            }
        }
    }
    if removed.is_empty() {
        return None;
    }
    Some(doc.recycle.push(
        RecycleList::Undo,
        RecyclePayload::WeeklyEntries { entries: removed },
        policy,
    ))
}
