use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use serde_json::json;
use tempfile::TempDir;
use workflow_store::auth::ThrottlePolicy;
use workflow_store::crypto::{encrypt_text, Envelope};
use workflow_store::meta::CURRENT_SOURCE;
use workflow_store::store::DATA_FILE;
use workflow_store::{
    Conflict, Document, ImportAction, LoadFailurePolicy, NewCard, Session, Store, StoreConfig,
    StoreError,
};

const PASSWORD: &str = "correct horse battery";
const ITERATIONS: u32 = 1_000;

fn config(dir: &Path) -> StoreConfig {
    StoreConfig {
        pbkdf2_iterations: ITERATIONS,
        ..StoreConfig::new(dir)
    }
}

fn set_up(dir: &TempDir) -> (Store, Session) {
    let mut store = Store::open(config(dir.path())).unwrap();
    let session = store.setup(PASSWORD).unwrap();
    (store, session)
}

fn seed_board(session: &mut Session) -> (String, String) {
    let column = session.add_column("Offer Accepted").unwrap();
    let card = session
        .add_card(&NewCard {
            column_id: column.id.clone(),
            candidate_name: "Jordan Lee".to_string(),
            job_id: "J-100".to_string(),
            job_name: "Driver".to_string(),
            ..NewCard::default()
        })
        .unwrap();
    (column.id, card.uuid)
}

fn export(doc: &Document, password: &str) -> String {
    encrypt_text(&serde_json::to_string(doc).unwrap(), password, ITERATIONS)
        .unwrap()
        .to_json()
        .unwrap()
}

/// Columns and card placements, independent of storage order.
fn board(doc: &Document) -> (Vec<(String, i64)>, Vec<(String, String, i64)>) {
    let mut columns: Vec<_> = doc
        .kanban
        .columns
        .iter()
        .map(|column| (column.id.clone(), column.order))
        .collect();
    let mut cards: Vec<_> = doc
        .kanban
        .cards
        .iter()
        .map(|card| (card.uuid.clone(), card.column_id.clone(), card.order))
        .collect();
    columns.sort();
    cards.sort();
    (columns, cards)
}

fn read_envelope(dir: &TempDir) -> Envelope {
    Envelope::from_json(&fs::read_to_string(dir.path().join(DATA_FILE)).unwrap()).unwrap()
}

#[test]
fn setup_then_unlock_with_the_same_password() {
    let dir = TempDir::new().unwrap();
    let mut store = Store::open(config(dir.path())).unwrap();
    assert!(!store.is_set_up().unwrap());
    store.setup(PASSWORD).unwrap().logout();
    assert!(store.is_set_up().unwrap());

    let err = store.setup("another").unwrap_err();
    assert!(matches!(err, StoreError::Conflict(Conflict::AlreadySetUp)));

    assert!(matches!(
        store.unlock("nope").unwrap_err(),
        StoreError::NotAuthenticated
    ));
    let mut session = store.unlock(PASSWORD).unwrap();
    assert_eq!(session.document().unwrap(), &Document::default());
}

#[test]
fn repeated_failures_lock_the_store() {
    let dir = TempDir::new().unwrap();
    let mut store = Store::open(StoreConfig {
        login: ThrottlePolicy {
            max_attempts: 2,
            window: Duration::from_secs(60),
            lockout: Duration::from_secs(30),
        },
        ..config(dir.path())
    })
    .unwrap();
    store.setup(PASSWORD).unwrap();

    let start = Instant::now();
    assert!(store.unlock_at("bad", start).is_err());
    assert!(store.unlock_at("bad", start + Duration::from_secs(1)).is_err());
    let err = store
        .unlock_at(PASSWORD, start + Duration::from_secs(2))
        .unwrap_err();
    assert!(matches!(err, StoreError::LockedOut { .. }));
    assert_eq!(err.code(), "locked");

    assert!(store
        .unlock_at(PASSWORD, start + Duration::from_secs(40))
        .is_ok());
}

#[test]
fn edits_persist_encrypted_across_sessions() {
    let dir = TempDir::new().unwrap();
    let (mut store, mut session) = set_up(&dir);
    let (column_id, uuid) = seed_board(&mut session);
    session.add_todo("Call references").unwrap();
    session.logout();

    let raw = fs::read_to_string(dir.path().join(DATA_FILE)).unwrap();
    assert!(!raw.contains("Jordan Lee"));
    assert!(!raw.contains("Call references"));

    let mut session = store.unlock(PASSWORD).unwrap();
    let doc = session.document().unwrap();
    assert_eq!(doc.card(&uuid).unwrap().column_id, column_id);
    assert_eq!(doc.card(&uuid).unwrap().candidate_name, "Jordan Lee");
    assert!(doc.candidate(&uuid).is_some());
    assert_eq!(doc.todos[0].text, "Call references");
    session.validate_current().unwrap();
}

#[test]
fn saving_a_whole_document_validates_it_first() {
    let dir = TempDir::new().unwrap();
    let (mut store, mut session) = set_up(&dir);
    let (column_id, uuid) = seed_board(&mut session);

    let mut doc = session.document().unwrap().clone();
    doc.kanban.columns[0].name = "Renamed".to_string();
    session.save_document(doc.clone()).unwrap();

    let mut dangling = doc.clone();
    dangling.kanban.cards[0].column_id = "gone".to_string();
    assert_eq!(session.save_document(dangling).unwrap_err().code(), "broken");
    session.logout();

    let mut session = store.unlock(PASSWORD).unwrap();
    let stored = session.document().unwrap();
    assert_eq!(stored.column(&column_id).unwrap().name, "Renamed");
    assert_eq!(stored.card(&uuid).unwrap().column_id, column_id);
}

#[test]
fn every_save_uses_a_fresh_salt_and_nonce() {
    let dir = TempDir::new().unwrap();
    let (mut store, mut session) = set_up(&dir);
    session.add_column("One").unwrap();
    let first = read_envelope(&dir);
    session.add_column("Two").unwrap();
    let second = read_envelope(&dir);
    assert_ne!(first.salt, second.salt);
    assert_ne!(first.iv, second.iv);
    assert_ne!(first.data, second.data);
    session.logout();

    let mut session = store.unlock(PASSWORD).unwrap();
    assert_eq!(session.document().unwrap().kanban.columns.len(), 2);
}

#[test]
fn todos_with_punctuation_survive_a_reload() {
    let dir = TempDir::new().unwrap();
    let (mut store, mut session) = set_up(&dir);
    session.add_column("Offer").unwrap();
    session.add_todo("Call Mon; -- confirm start").unwrap();
    session.add_todo("Buy boots").unwrap();
    session.logout();

    let mut session = store.unlock(PASSWORD).unwrap();
    let doc = session.document().unwrap();
    assert_eq!(doc.todos.len(), 2);
    assert_eq!(doc.todos[0].text, "Call Mon; -- confirm start");
    assert_eq!(doc.kanban.columns.len(), 1);
}

#[test]
fn undoing_a_card_after_its_column_went_keeps_the_board() {
    let dir = TempDir::new().unwrap();
    let (mut store, mut session) = set_up(&dir);
    let (first, uuid) = seed_board(&mut session);
    let second = session.add_column("Onboarded").unwrap();

    let card_undo = session.remove_cards([uuid.as_str()]).unwrap().unwrap();
    session.remove_columns([first.as_str()]).unwrap().unwrap();
    session.undo(&card_undo).unwrap();
    session.validate_current().unwrap();
    session.logout();

    let mut session = store.unlock(PASSWORD).unwrap();
    let doc = session.document().unwrap();
    assert_eq!(doc.kanban.columns.len(), 1);
    assert_eq!(doc.kanban.cards.len(), 1);
    assert_eq!(doc.card(&uuid).unwrap().column_id, second.id);
    assert!(doc.candidate(&uuid).is_some());
}

#[test]
fn unreadable_database_resets_by_default() {
    let dir = TempDir::new().unwrap();
    let (mut store, mut session) = set_up(&dir);
    seed_board(&mut session);
    session.logout();
    fs::write(dir.path().join(DATA_FILE), "{ garbage").unwrap();

    let mut session = store.unlock(PASSWORD).unwrap();
    assert_eq!(session.document().unwrap(), &Document::default());
    session.add_column("Fresh").unwrap();
    session.logout();

    let mut session = store.unlock(PASSWORD).unwrap();
    let doc = session.document().unwrap();
    assert_eq!(doc.kanban.columns.len(), 1);
    assert_eq!(doc.kanban.columns[0].name, "Fresh");
}

#[test]
fn unreadable_database_can_surface_the_error() {
    let dir = TempDir::new().unwrap();
    let (_store, mut session) = set_up(&dir);
    seed_board(&mut session);
    session.logout();

    let mut envelope = read_envelope(&dir);
    envelope.data = envelope.data.chars().rev().collect();
    fs::write(dir.path().join(DATA_FILE), envelope.to_json().unwrap()).unwrap();

    let mut store = Store::open(StoreConfig {
        load_failure: LoadFailurePolicy::Surface,
        ..config(dir.path())
    })
    .unwrap();
    let mut session = store.unlock(PASSWORD).unwrap();
    let err = session.document().unwrap_err();
    assert_eq!(err.code(), "crypto");
    assert!(session.add_column("Never").is_err());
}

#[test]
fn column_guard_and_undo_redo_go_through_the_session() {
    let dir = TempDir::new().unwrap();
    let (mut store, mut session) = set_up(&dir);
    let (first, uuid) = seed_board(&mut session);

    let err = session.remove_columns([first.as_str()]).unwrap_err();
    assert!(matches!(err, StoreError::Conflict(Conflict::LastColumn)));

    let second = session.add_column("Onboarded").unwrap();
    let before = session.document().unwrap().clone();
    let undo = session
        .remove_columns([first.as_str()])
        .unwrap()
        .unwrap();
    assert_eq!(
        session.document().unwrap().card(&uuid).unwrap().column_id,
        second.id
    );

    let redo = session.undo(&undo).unwrap();
    assert_eq!(board(session.document().unwrap()), board(&before));
    session.logout();

    let mut session = store.unlock(PASSWORD).unwrap();
    assert_eq!(board(session.document().unwrap()), board(&before));
    session.redo(&redo).unwrap();
    assert!(session.document().unwrap().column(&first).is_none());
    assert!(matches!(
        session.undo(&undo).unwrap_err(),
        StoreError::NotFound { .. }
    ));
}

#[test]
fn week_is_created_once() {
    let dir = TempDir::new().unwrap();
    let (_store, mut session) = set_up(&dir);
    let week = session.week("2024-06-03", "2024-06-09").unwrap();
    assert_eq!(week.week_start, "2024-06-03");
    let stamp = read_envelope(&dir).iv;
    session.week("2024-06-03", "2024-06-09").unwrap();
    assert_eq!(read_envelope(&dir).iv, stamp);
}

#[test]
fn append_import_merges_and_keeps_a_copy() {
    let dir = TempDir::new().unwrap();
    let (_store, mut session) = set_up(&dir);
    seed_board(&mut session);

    let other = TempDir::new().unwrap();
    let incoming = {
        let (_other_store, mut other_session) = set_up(&other);
        seed_board(&mut other_session);
        other_session.document().unwrap().clone()
    };
    let file = export(&incoming, PASSWORD);

    let outcome = session
        .import(&file, "branch-north.enc", ImportAction::Append)
        .unwrap();
    let merged = outcome.merged.unwrap();
    assert_eq!(merged.columns, 1);
    assert_eq!(merged.cards, 1);
    let doc = session.document().unwrap();
    assert_eq!(doc.kanban.columns.len(), 2);
    assert_eq!(doc.kanban.cards.len(), 2);

    let entry = outcome.view.unwrap();
    let sources = session.sources().unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[1].id, entry.id);
    assert_eq!(sources[1].name, "branch-north.enc");
    assert_eq!(session.load_source(&entry.id).unwrap().kanban, incoming.kanban);
}

#[test]
fn view_import_leaves_the_live_database_alone() {
    let dir = TempDir::new().unwrap();
    let (_store, mut session) = set_up(&dir);
    seed_board(&mut session);
    let before = session.document().unwrap().clone();

    let mut incoming = Document::default();
    incoming.todos.push(workflow_store::Todo {
        id: "t1".to_string(),
        text: "From elsewhere".to_string(),
        ..Default::default()
    });
    let outcome = session
        .import(&export(&incoming, PASSWORD), "", ImportAction::View)
        .unwrap();
    assert!(outcome.merged.is_none());
    assert_eq!(session.document().unwrap(), &before);

    let entry = outcome.view.unwrap();
    assert_eq!(session.set_active_source(&entry.id).unwrap(), entry.id);
    assert_eq!(session.active_source().unwrap(), entry.id);
    assert_eq!(session.load_source(&entry.id).unwrap().todos, incoming.todos);
    assert_eq!(
        session.load_source(CURRENT_SOURCE).unwrap().kanban,
        before.kanban
    );
    assert_eq!(session.set_active_source("ghost").unwrap(), CURRENT_SOURCE);
    assert!(matches!(
        session.load_source("ghost").unwrap_err(),
        StoreError::NotFound { .. }
    ));
}

#[test]
fn replace_import_overwrites_and_persists() {
    let dir = TempDir::new().unwrap();
    let (mut store, mut session) = set_up(&dir);
    seed_board(&mut session);

    let incoming = Document::default();
    session
        .import(&export(&incoming, PASSWORD), "empty.enc", ImportAction::Replace)
        .unwrap();
    assert!(session.sources().unwrap().len() == 1);
    session.logout();

    let mut session = store.unlock(PASSWORD).unwrap();
    assert_eq!(session.document().unwrap(), &incoming);
}

#[test]
fn fraudulent_import_is_rejected_before_any_write() {
    let dir = TempDir::new().unwrap();
    let (_store, mut session) = set_up(&dir);
    seed_board(&mut session);
    let before = session.document().unwrap().clone();

    let payload = json!({
        "version": 3,
        "kanban": { "columns": [], "cards": [], "candidates": [] },
        "weekly": {},
        "todos": [{ "id": "t1", "text": "x'; DROP TABLE candidates;--", "done": false }],
        "recycle": { "items": [], "redo": [] },
    });
    let file = encrypt_text(&payload.to_string(), PASSWORD, ITERATIONS)
        .unwrap()
        .to_json()
        .unwrap();

    let err = session
        .import(&file, "evil.enc", ImportAction::Append)
        .unwrap_err();
    assert!(err.is_fraud());
    assert_eq!(session.document().unwrap(), &before);
    assert_eq!(session.sources().unwrap().len(), 1);
}

#[test]
fn import_under_another_password_fails_closed() {
    let dir = TempDir::new().unwrap();
    let (_store, mut session) = set_up(&dir);
    let file = export(&Document::default(), "someone else");
    let err = session
        .import(&file, "theirs.enc", ImportAction::View)
        .unwrap_err();
    assert_eq!(err.code(), "crypto");
    assert!(session.sources().unwrap().len() == 1);
}

#[test]
fn password_change_reencrypts_everything() {
    let dir = TempDir::new().unwrap();
    let (mut store, mut session) = set_up(&dir);
    let (_, uuid) = seed_board(&mut session);
    let entry = session
        .import(
            &export(&Document::default(), PASSWORD),
            "copy.enc",
            ImportAction::View,
        )
        .unwrap()
        .view
        .unwrap();

    assert!(matches!(
        session.change_password("wrong", "next secret").unwrap_err(),
        StoreError::NotAuthenticated
    ));
    assert!(session.change_password(PASSWORD, "").is_err());
    session.change_password(PASSWORD, "next secret").unwrap();
    session.logout();

    assert!(store.unlock(PASSWORD).is_err());
    let mut session = store.unlock("next secret").unwrap();
    assert!(session.document().unwrap().card(&uuid).is_some());
    assert_eq!(
        session.load_source(&entry.id).unwrap(),
        Document::default()
    );
}
