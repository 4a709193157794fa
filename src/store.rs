//! Sessions over the encrypted database files.
//!
//! A [`Store`] owns a data directory and hands out [`Session`]s once the
//! master password checks out. The session holds the password, the derived
//! key for the live file and the lazily loaded [`Document`]; every mutating
//! call goes load, edit, encrypt, write before it returns.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;
use zeroize::Zeroizing;

use crate::auth::{self, AuthRecord, LoginThrottle};
use crate::config::{LoadFailurePolicy, StoreConfig};
use crate::crypto::{
    decrypt_envelope, decrypt_envelope_with_key, encrypt_text, encrypt_text_with_key, DerivedKey,
    Envelope,
};
use crate::error::{Conflict, Result, StoreError};
use crate::merge::{merge, MergeSummary};
use crate::meta::{imported_path, DatabaseEntry, Metadata, Source, CURRENT_SOURCE};
use crate::migrate::{migrate, stored_version};
use crate::model::{
    CandidateField, CandidateRow, Card, Column, Day, DayEntry, Document, Todo, WeekRecord,
    CURRENT_VERSION,
};
use crate::ops::{self, CardUpdate, NewCard};
use crate::recycle::{self, RecyclePolicy};
use crate::util::write_text_file;
use crate::validate::{validate, ValidationError};

pub const DATA_FILE: &str = "workflow.enc";

/// Parses decrypted JSON, upgrades it and checks it before it is trusted.
pub fn open_document(plaintext: &str) -> Result<Document> {
    let raw: Value = serde_json::from_str(plaintext)?;
    let migrated = migrate(raw);
    validate(&migrated)?;
    Ok(Document::from_value(migrated)?)
}

/// Reads the live database: parse, upgrade, done. Only a schema newer than
/// this build is refused; content checks are for files from elsewhere.
fn read_live_document(plaintext: &str) -> Result<Document> {
    let raw: Value = serde_json::from_str(plaintext)?;
    if stored_version(&raw) > i64::from(CURRENT_VERSION) {
        return Err(ValidationError::broken(
            "Database version is newer than this app supports.",
        )
        .into());
    }
    Ok(Document::from_value(migrate(raw))?)
}

pub struct Store {
    config: StoreConfig,
    throttle: LoginThrottle,
}

impl Store {
    #[tracing::instrument(skip_all, fields(dir = %config.data_dir.display()))]
    pub fn open(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        let throttle = LoginThrottle::new(config.login);
        Ok(Self { config, throttle })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn is_set_up(&self) -> Result<bool> {
        Ok(auth::read_record(&self.config.data_dir)?.is_some())
    }

    /// Stores the first master password and opens a session with it.
    #[tracing::instrument(skip_all)]
    pub fn setup(&mut self, password: &str) -> Result<Session> {
        self.throttle.check(Instant::now())?;
        if self.is_set_up()? {
            return Err(Conflict::AlreadySetUp.into());
        }
        let record = AuthRecord::create(password, self.config.pbkdf2_iterations)?;
        auth::write_record(&self.config.data_dir, &record, self.config.atomic_writes)?;
        tracing::info!("master password set up");
        Ok(Session::new(self.config.clone(), password))
    }

    pub fn unlock(&mut self, password: &str) -> Result<Session> {
        self.unlock_at(password, Instant::now())
    }

    #[tracing::instrument(skip_all)]
    pub fn unlock_at(&mut self, password: &str, now: Instant) -> Result<Session> {
        self.throttle.check(now)?;
        let verified = auth::read_record(&self.config.data_dir)?
            .is_some_and(|record| record.verify(password));
        if !verified {
            self.throttle.record_failure(now);
            tracing::warn!(
                remaining = self.throttle.remaining_attempts(),
                "unlock failed"
            );
            return Err(StoreError::NotAuthenticated);
        }
        self.throttle.record_success();
        tracing::info!("session unlocked");
        Ok(Session::new(self.config.clone(), password))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportAction {
    /// Merge into the live database and keep a read-only copy.
    Append,
    /// Keep a read-only copy only.
    View,
    /// Overwrite the live database.
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    pub action: ImportAction,
    pub view: Option<DatabaseEntry>,
    pub merged: Option<MergeSummary>,
}

pub struct Session {
    config: StoreConfig,
    password: Zeroizing<String>,
    key: Option<DerivedKey>,
    doc: Option<Document>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("data_dir", &self.config.data_dir)
            .field("loaded", &self.doc.is_some())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(config: StoreConfig, password: &str) -> Self {
        Self {
            config,
            password: Zeroizing::new(password.to_string()),
            key: None,
            doc: None,
        }
    }

    fn dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir().join(DATA_FILE)
    }

    fn iterations(&self) -> u32 {
        self.config.pbkdf2_iterations
    }

    /// The live document, loaded on first use.
    pub fn document(&mut self) -> Result<&Document> {
        Ok(self.live()?)
    }

    fn live(&mut self) -> Result<&mut Document> {
        let doc = match self.doc.take() {
            Some(doc) => doc,
            None => self.load()?,
        };
        Ok(self.doc.insert(doc))
    }

    /// Reads the live file, creating it when absent.
    ///
    /// Unreadable files follow [`LoadFailurePolicy`]. I/O errors always
    /// surface.
    #[tracing::instrument(skip_all)]
    fn load(&mut self) -> Result<Document> {
        let path = self.data_path();
        if !path.exists() {
            tracing::debug!("no database file yet, creating an empty one");
            let doc = Document::default();
            self.seal(&doc)?;
            return Ok(doc);
        }
        let raw = fs::read_to_string(&path)?;
        match self.open_live(&raw) {
            Ok(mut doc) => {
                doc.recycle.prune(&self.config.recycle);
                tracing::debug!(
                    columns = doc.kanban.columns.len(),
                    cards = doc.kanban.cards.len(),
                    "database loaded"
                );
                Ok(doc)
            }
            Err(err) => match self.config.load_failure {
                LoadFailurePolicy::ResetToDefault => {
                    tracing::warn!(
                        code = err.code(),
                        "database could not be read, continuing with an empty one"
                    );
                    self.key = None;
                    Ok(Document::default())
                }
                LoadFailurePolicy::Surface => Err(err),
            },
        }
    }

    fn open_live(&mut self, raw: &str) -> Result<Document> {
        let envelope = Envelope::from_json(raw)?;
        let salt = envelope.salt_bytes()?;
        let key = match self.key.take() {
            Some(key) if key.salt() == salt.as_slice() => key,
            _ => DerivedKey::derive(&self.password, &salt, self.iterations()),
        };
        let plaintext = Zeroizing::new(decrypt_envelope_with_key(&envelope, &key)?);
        self.key = Some(key);
        read_live_document(&plaintext)
    }

    /// Encrypts and writes `doc` to the live file under a fresh salt and
    /// nonce. The new key is kept so the next load skips the derivation.
    fn seal(&mut self, doc: &Document) -> Result<()> {
        let plaintext = Zeroizing::new(serde_json::to_string(doc)?);
        let key = DerivedKey::generate(&self.password, self.iterations());
        let envelope = encrypt_text_with_key(&plaintext, &key)?;
        write_text_file(
            &self.data_path(),
            &envelope.to_json()?,
            self.config.atomic_writes,
        )?;
        self.key = Some(key);
        tracing::debug!("database saved");
        Ok(())
    }

    /// Persists the loaded document. Nothing to do before the first load.
    #[tracing::instrument(skip_all)]
    pub fn save(&mut self) -> Result<()> {
        let Some(doc) = self.doc.take() else {
            return Ok(());
        };
        let result = self.seal(&doc);
        self.doc = Some(doc);
        result
    }

    /// Replaces the live document wholesale. It is validated first so a bad
    /// document never reaches disk.
    pub fn save_document(&mut self, doc: Document) -> Result<()> {
        validate(&doc.to_value()?)?;
        self.doc = Some(doc);
        self.save()
    }

    fn mutate<T>(
        &mut self,
        edit: impl FnOnce(&mut Document, &RecyclePolicy) -> Result<T>,
    ) -> Result<T> {
        let policy = self.config.recycle;
        let out = edit(self.live()?, &policy)?;
        self.save()?;
        Ok(out)
    }

    pub fn validate_current(&mut self) -> Result<()> {
        let value = self.live()?.to_value()?;
        validate(&value)?;
        Ok(())
    }

    // columns

    pub fn add_column(&mut self, name: &str) -> Result<Column> {
        self.mutate(|doc, _| ops::add_column(doc, name))
    }

    pub fn rename_column(&mut self, id: &str, name: &str) -> Result<()> {
        self.mutate(|doc, _| ops::rename_column(doc, id, name))
    }

    /// Returns the undo handle, `None` when nothing matched.
    pub fn remove_columns<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<Option<String>> {
        self.mutate(|doc, policy| ops::remove_columns(doc, ids, policy))
    }

    // cards

    pub fn add_card(&mut self, input: &NewCard) -> Result<Card> {
        self.mutate(|doc, _| ops::add_card(doc, input))
    }

    pub fn update_card(&mut self, uuid: &str, update: &CardUpdate) -> Result<Card> {
        self.mutate(|doc, _| ops::update_card(doc, uuid, update))
    }

    pub fn reorder_column<'a>(
        &mut self,
        column_id: &str,
        ordered: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        self.mutate(|doc, _| ops::reorder_column(doc, column_id, ordered))
    }

    pub fn remove_cards<'a>(
        &mut self,
        uuids: impl IntoIterator<Item = &'a str>,
    ) -> Result<Option<String>> {
        self.mutate(|doc, policy| Ok(ops::remove_cards(doc, uuids, policy)))
    }

    // candidate rows

    pub fn candidate_row(&mut self, uuid: &str) -> Result<CandidateRow> {
        self.mutate(|doc, _| ops::candidate_row(doc, uuid))
    }

    pub fn save_candidate_fields(
        &mut self,
        uuid: &str,
        fields: &BTreeMap<CandidateField, String>,
    ) -> Result<()> {
        self.mutate(|doc, _| ops::save_candidate_fields(doc, uuid, fields))
    }

    pub fn remove_candidate_rows<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<Option<String>> {
        self.mutate(|doc, policy| Ok(ops::remove_candidate_rows(doc, ids, policy)))
    }

    // todos

    pub fn add_todo(&mut self, text: &str) -> Result<Todo> {
        self.mutate(|doc, _| ops::add_todo(doc, text))
    }

    pub fn set_todo_done(&mut self, id: &str, done: bool) -> Result<()> {
        self.mutate(|doc, _| ops::set_todo_done(doc, id, done))
    }

    pub fn remove_todos<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<Option<String>> {
        self.mutate(|doc, policy| Ok(ops::remove_todos(doc, ids, policy)))
    }

    // weekly

    /// Gets or creates a week; only writes when it had to create one.
    pub fn week(&mut self, start: &str, end: &str) -> Result<WeekRecord> {
        let (week, changed) = ops::week(self.live()?, start, end)?;
        if changed {
            self.save()?;
        }
        Ok(week)
    }

    pub fn set_week(
        &mut self,
        start: &str,
        end: &str,
        entries: &BTreeMap<Day, DayEntry>,
    ) -> Result<()> {
        self.mutate(|doc, _| ops::set_week(doc, start, end, entries))
    }

    pub fn remove_weekly_entries<'a>(
        &mut self,
        row_ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<Option<String>> {
        self.mutate(|doc, policy| Ok(ops::remove_weekly_entries(doc, row_ids, policy)))
    }

    // recycle

    /// Undoes a destructive edit; returns the handle to redo it.
    pub fn undo(&mut self, id: &str) -> Result<String> {
        self.mutate(|doc, policy| recycle::undo(doc, id, policy))
    }

    /// Redoes an undone edit; returns the handle to undo it again.
    pub fn redo(&mut self, id: &str) -> Result<String> {
        self.mutate(|doc, policy| recycle::redo(doc, id, policy))
    }

    // imported databases

    /// Decrypts a foreign envelope with the session password and vets it.
    fn open_foreign(&self, file_text: &str) -> Result<Document> {
        let envelope = Envelope::from_json(file_text)?;
        let plaintext = Zeroizing::new(decrypt_envelope(
            &envelope,
            &self.password,
            self.iterations(),
        )?);
        open_document(&plaintext)
    }

    fn write_copy(&self, path: &Path, doc: &Document) -> Result<()> {
        let plaintext = Zeroizing::new(serde_json::to_string(doc)?);
        let envelope = encrypt_text(&plaintext, &self.password, self.iterations())?;
        write_text_file(path, &envelope.to_json()?, self.config.atomic_writes)?;
        Ok(())
    }

    fn store_copy(&self, doc: &Document, file_name: &str) -> Result<DatabaseEntry> {
        let mut meta = Metadata::read(self.dir())?;
        let entry = meta.register(file_name);
        self.write_copy(&imported_path(self.dir(), &entry.filename)?, doc)?;
        meta.write(self.dir(), self.config.atomic_writes)?;
        Ok(entry)
    }

    /// Imports an exported database file.
    ///
    /// The file is decrypted with the session password, migrated and
    /// validated before anything is written. Fraud rejects the whole import.
    #[tracing::instrument(skip_all, fields(action = ?action))]
    pub fn import(
        &mut self,
        file_text: &str,
        file_name: &str,
        action: ImportAction,
    ) -> Result<ImportOutcome> {
        let incoming = self.open_foreign(file_text).inspect_err(|err| {
            tracing::warn!(code = err.code(), "import rejected");
        })?;
        let mut outcome = ImportOutcome {
            action,
            view: None,
            merged: None,
        };
        match action {
            ImportAction::Append => {
                outcome.merged = Some(self.mutate(|doc, _| Ok(merge(doc, &incoming)))?);
                outcome.view = Some(self.store_copy(&incoming, file_name)?);
            }
            ImportAction::View => {
                outcome.view = Some(self.store_copy(&incoming, file_name)?);
            }
            ImportAction::Replace => {
                let mut doc = incoming;
                doc.recycle.prune(&self.config.recycle);
                self.doc = Some(doc);
                self.save()?;
            }
        }
        tracing::info!("database imported");
        Ok(outcome)
    }

    pub fn sources(&self) -> Result<Vec<Source>> {
        Ok(Metadata::read(self.dir())?.sources())
    }

    pub fn active_source(&self) -> Result<String> {
        Ok(Metadata::read(self.dir())?.active_source())
    }

    /// Persists the active source; unknown ids select `current`.
    pub fn set_active_source(&mut self, id: &str) -> Result<String> {
        let mut meta = Metadata::read(self.dir())?;
        let active = meta.set_active(id);
        meta.write(self.dir(), self.config.atomic_writes)?;
        Ok(active)
    }

    fn read_copy(&self, path: &Path) -> Result<Document> {
        let raw = fs::read_to_string(path)?;
        self.open_foreign(&raw)
    }

    /// Opens a source read-only. `current` yields a copy of the live document.
    #[tracing::instrument(skip_all)]
    pub fn load_source(&mut self, id: &str) -> Result<Document> {
        let id = id.trim();
        if id.is_empty() || id == CURRENT_SOURCE {
            return Ok(self.live()?.clone());
        }
        let meta = Metadata::read(self.dir())?;
        let entry = meta
            .entry(id)
            .ok_or_else(|| StoreError::not_found("database", id))?;
        self.read_copy(&imported_path(self.dir(), &entry.filename)?)
    }

    // lifecycle

    /// Rotates the master password and re-encrypts every database file.
    #[tracing::instrument(skip_all)]
    pub fn change_password(&mut self, current: &str, next: &str) -> Result<()> {
        let record = auth::read_record(self.dir())?.ok_or(StoreError::NotAuthenticated)?;
        if !record.verify(current) {
            return Err(StoreError::NotAuthenticated);
        }
        let next_record = AuthRecord::create(next, self.config.pbkdf2_iterations)?;
        self.live()?;

        let meta = Metadata::read(self.dir())?;
        let mut copies = Vec::new();
        for entry in &meta.databases {
            let path = imported_path(self.dir(), &entry.filename)?;
            match self.read_copy(&path) {
                Ok(doc) => copies.push((path, doc)),
                Err(err) => tracing::warn!(
                    id = %entry.id,
                    code = err.code(),
                    "imported copy unreadable, leaving it as is"
                ),
            }
        }

        self.password = Zeroizing::new(next.to_string());
        self.key = None;
        self.save()?;
        for (path, doc) in &copies {
            self.write_copy(path, doc)?;
        }
        auth::write_record(self.dir(), &next_record, self.config.atomic_writes)?;
        tracing::info!(copies = copies.len(), "master password changed");
        Ok(())
    }

    /// Ends the session; the password and key are wiped on drop.
    pub fn logout(self) {
        tracing::info!("session closed");
    }
}
