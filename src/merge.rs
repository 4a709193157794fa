//! Folding an imported database into the live one.
//!
//! Collisions are always resolved by relabelling the incoming record. Nothing
//! already in the target is overwritten or dropped.

use std::collections::{HashMap, HashSet};

use crate::model::{Document, WeekRecord};
use crate::util::{new_id, now_string};

/// Counts of records adopted from the incoming document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub columns: usize,
    pub cards: usize,
    pub candidates: usize,
    pub day_entries: usize,
    pub todos: usize,
    pub renamed: usize,
}

/// Returns `id` if it is free, otherwise a fresh id. Either way it is taken.
fn claim(taken: &mut HashSet<String>, id: &str, renamed: &mut usize) -> String {
    let next = if id.is_empty() || taken.contains(id) {
        *renamed += 1;
        new_id()
    } else {
        id.to_string()
    };
    taken.insert(next.clone());
    next
}

/// Merges `incoming` into `target`. The recycle bin of `incoming` is ignored.
pub fn merge(target: &mut Document, incoming: &Document) -> MergeSummary {
    let mut summary = MergeSummary::default();
    let now = now_string();

    // Columns go after the existing ones, keeping their relative order.
    let mut column_ids: HashSet<String> =
        target.kanban.columns.iter().map(|column| column.id.clone()).collect();
    let mut column_map: HashMap<String, String> = HashMap::new();
    let mut max_order = target
        .kanban
        .columns
        .iter()
        .map(|column| column.order)
        .max()
        .unwrap_or(0);
    for column in incoming.sorted_columns() {
        if column.id.is_empty() {
            continue;
        }
        let id = claim(&mut column_ids, &column.id, &mut summary.renamed);
        column_map.insert(column.id.clone(), id.clone());
        max_order += 1;
        let mut next = column.clone();
        next.id = id;
        next.order = max_order;
        next.updated_at = now.clone();
        target.kanban.columns.push(next);
        summary.columns += 1;
    }

    let first_column = target
        .sorted_columns()
        .first()
        .map(|column| column.id.clone())
        .unwrap_or_default();

    let mut card_ids: HashSet<String> =
        target.kanban.cards.iter().map(|card| card.uuid.clone()).collect();
    let mut card_map: HashMap<String, String> = HashMap::new();
    let mut order_by_column: HashMap<String, i64> = HashMap::new();
    for card in &target.kanban.cards {
        let slot = order_by_column.entry(card.column_id.clone()).or_insert(0);
        *slot = (*slot).max(card.order);
    }

    let mut incoming_cards: Vec<_> = incoming.kanban.cards.iter().collect();
    incoming_cards.sort_by_key(|card| card.order);
    for card in incoming_cards {
        if card.uuid.is_empty() {
            continue;
        }
        let uuid = claim(&mut card_ids, &card.uuid, &mut summary.renamed);
        let mapped = column_map
            .get(&card.column_id)
            .cloned()
            .unwrap_or_else(|| card.column_id.clone());
        let column_id = if !mapped.is_empty() && column_ids.contains(&mapped) {
            mapped
        } else if !first_column.is_empty() {
            first_column.clone()
        } else {
            mapped
        };
        let order = order_by_column.entry(column_id.clone()).or_insert(0);
        *order += 1;

        let mut next = card.clone();
        next.uuid = uuid.clone();
        next.column_id = column_id;
        next.order = *order;
        next.updated_at = now.clone();
        target.kanban.cards.push(next);
        card_map.insert(card.uuid.clone(), uuid);
        summary.cards += 1;
    }

    let mut row_ids: HashSet<String> = target
        .kanban
        .candidates
        .iter()
        .map(|row| row.uuid.clone())
        .collect();
    for row in &incoming.kanban.candidates {
        let wanted = card_map.get(&row.uuid).unwrap_or(&row.uuid);
        let uuid = claim(&mut row_ids, wanted, &mut summary.renamed);
        let mut next = row.clone();
        next.uuid = uuid;
        next.fill_missing();
        target.kanban.candidates.push(next);
        summary.candidates += 1;
    }

    for week in incoming.weekly.values() {
        if week.week_start.is_empty() {
            continue;
        }
        let slot = target
            .weekly
            .entry(week.week_start.clone())
            .or_insert_with(|| WeekRecord {
                week_start: week.week_start.clone(),
                week_end: week.week_end.clone(),
                ..WeekRecord::default()
            });
        for (day, entry) in &week.entries {
            if !slot.entries.contains_key(day) {
                slot.entries.insert(*day, entry.clone());
                summary.day_entries += 1;
            }
        }
    }

    let mut todo_ids: HashSet<String> = target.todos.iter().map(|todo| todo.id.clone()).collect();
    for todo in &incoming.todos {
        let mut next = todo.clone();
        next.id = claim(&mut todo_ids, &todo.id, &mut summary.renamed);
        target.todos.push(next);
        summary.todos += 1;
    }

    tracing::info!(
        columns = summary.columns,
        cards = summary.cards,
        candidates = summary.candidates,
        day_entries = summary.day_entries,
        todos = summary.todos,
        renamed = summary.renamed,
        "merged imported database"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CandidateField, CandidateRow, Card, Column, Day, DayEntry, Todo};

    fn column(id: &str, name: &str, order: i64) -> Column {
        Column {
            id: id.to_string(),
            name: name.to_string(),
            order,
            ..Column::default()
        }
    }

    fn card(uuid: &str, column_id: &str, order: i64) -> Card {
        Card {
            uuid: uuid.to_string(),
            column_id: column_id.to_string(),
            order,
            ..Card::default()
        }
    }

    #[test]
    fn colliding_column_is_renamed_and_cards_follow() {
        let mut target = Document::default();
        target.kanban.columns.push(column("A", "Target A", 1));
        target.kanban.cards.push(card("t1", "A", 1));

        let mut incoming = Document::default();
        incoming.kanban.columns.push(column("A", "Incoming A", 1));
        incoming.kanban.cards.push(card("i1", "A", 7));
        incoming.kanban.cards.push(card("i2", "A", 3));

        let summary = merge(&mut target, &incoming);

        assert_eq!(summary.columns, 1);
        assert_eq!(target.column("A").unwrap().name, "Target A");
        let renamed = target
            .kanban
            .columns
            .iter()
            .find(|column| column.name == "Incoming A")
            .unwrap();
        assert_ne!(renamed.id, "A");
        assert_eq!(renamed.order, 2);
        assert_eq!(target.card("t1").unwrap().column_id, "A");
        assert_eq!(target.card("i1").unwrap().column_id, renamed.id);
        assert_eq!(target.card("i2").unwrap().order, 1);
        assert_eq!(target.card("i1").unwrap().order, 2);
    }

    #[test]
    fn candidate_rows_follow_renamed_cards() {
        let mut target = Document::default();
        target.kanban.columns.push(column("c", "C", 1));
        target.kanban.cards.push(card("u1", "c", 1));
        target.kanban.candidates.push(CandidateRow::new("u1"));

        let mut incoming = Document::default();
        incoming.kanban.columns.push(column("d", "D", 1));
        incoming.kanban.cards.push(card("u1", "d", 1));
        let mut row = CandidateRow::default();
        row.uuid = "u1".to_string();
        row.set(CandidateField::CandidateName, "Imported");
        incoming.kanban.candidates.push(row);
        let mut orphan = CandidateRow::new("u1");
        orphan.set(CandidateField::Branch, "North");
        incoming.kanban.candidates.push(orphan);

        merge(&mut target, &incoming);

        let new_card = target.kanban.cards.last().unwrap();
        assert_ne!(new_card.uuid, "u1");
        assert_eq!(new_card.column_id, "d");
        let imported = target.candidate(&new_card.uuid).unwrap();
        assert_eq!(imported.get(CandidateField::CandidateName), "Imported");
        assert_eq!(imported.fields().count(), CandidateField::ALL.len());
        assert_eq!(target.kanban.candidates.len(), 3);
        let ids: HashSet<&str> = target
            .kanban
            .candidates
            .iter()
            .map(|row| row.uuid.as_str())
            .collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn cards_without_a_known_column_land_in_the_first_column() {
        let mut target = Document::default();
        target.kanban.columns.push(column("z", "Z", 5));
        target.kanban.columns.push(column("a", "A", 1));
        let mut incoming = Document::default();
        incoming.kanban.cards.push(card("x", "gone", 1));
        merge(&mut target, &incoming);
        assert_eq!(target.card("x").unwrap().column_id, "a");
    }

    #[test]
    fn weekly_entries_never_overwrite() {
        let entry = |content: &str| DayEntry {
            content: content.to_string(),
            ..DayEntry::default()
        };
        let mut target = Document::default();
        let mut week = WeekRecord {
            week_start: "w1".to_string(),
            week_end: "w1-end".to_string(),
            ..WeekRecord::default()
        };
        week.entries.insert(Day::Monday, entry("mine"));
        target.weekly.insert("w1".to_string(), week.clone());

        let mut incoming = Document::default();
        week.entries.insert(Day::Monday, entry("theirs"));
        week.entries.insert(Day::Tuesday, entry("new"));
        incoming.weekly.insert("w1".to_string(), week);

        let summary = merge(&mut target, &incoming);
        assert_eq!(summary.day_entries, 1);
        let merged = &target.weekly["w1"].entries;
        assert_eq!(merged[&Day::Monday].content, "mine");
        assert_eq!(merged[&Day::Tuesday].content, "new");
    }

    #[test]
    fn todos_are_relabelled_on_collision() {
        let todo = |id: &str, text: &str| Todo {
            id: id.to_string(),
            text: text.to_string(),
            ..Todo::default()
        };
        let mut target = Document::default();
        target.todos.push(todo("t1", "mine"));
        let mut incoming = Document::default();
        incoming.todos.push(todo("t1", "theirs"));
        incoming.todos.push(todo("t2", "other"));

        let summary = merge(&mut target, &incoming);
        assert_eq!(summary.renamed, 1);
        assert_eq!(target.todos.len(), 3);
        assert_eq!(target.todos[0].text, "mine");
        assert_ne!(target.todos[1].id, "t1");
        assert_eq!(target.todos[2].id, "t2");
    }
}
