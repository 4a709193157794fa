//! Typed shape of the persisted workflow database.
//!
//! The on-disk JSON is the same one the desktop app has always written, so
//! every scalar is read leniently: numbers stored where text is expected are
//! kept as text, string orders are parsed back into integers. Candidate rows
//! are the one strict spot, their keys come from a closed field set.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CURRENT_VERSION: u32 = 3;

pub const ID_MAX: usize = 128;
pub const COLUMN_NAME_MAX: usize = 60;
pub const CARD_NAME_MAX: usize = 120;
pub const CARD_CODE_MAX: usize = 64;
pub const CARD_PERSON_MAX: usize = 80;
pub const TIMESTAMP_MAX: usize = 40;
pub const CANDIDATE_SHORT_MAX: usize = 200;
pub const CANDIDATE_NOTES_MAX: usize = 2000;
pub const TODO_TEXT_MAX: usize = 200;
pub const WEEK_KEY_MAX: usize = 40;
pub const DAY_TIME_MAX: usize = 16;
pub const DAY_CONTENT_MAX: usize = 2000;

pub const CANDIDATE_UUID_KEY: &str = "candidate UUID";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default = "current_version", deserialize_with = "lenient::version")]
    pub version: u32,
    #[serde(default)]
    pub kanban: KanbanState,
    #[serde(default)]
    pub weekly: BTreeMap<String, WeekRecord>,
    #[serde(default)]
    pub todos: Vec<Todo>,
    #[serde(default)]
    pub recycle: RecycleState,
}

fn current_version() -> u32 {
    CURRENT_VERSION
}

impl Default for Document {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            kanban: KanbanState::default(),
            weekly: BTreeMap::new(),
            todos: Vec::new(),
            recycle: RecycleState::default(),
        }
    }
}

impl Document {
    /// Converts an already migrated JSON value into the typed document.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn column(&self, id: &str) -> Option<&Column> {
        self.kanban.columns.iter().find(|column| column.id == id)
    }

    pub fn card(&self, uuid: &str) -> Option<&Card> {
        self.kanban.cards.iter().find(|card| card.uuid == uuid)
    }

    pub fn candidate(&self, uuid: &str) -> Option<&CandidateRow> {
        self.kanban.candidates.iter().find(|row| row.uuid == uuid)
    }

    /// Columns sorted by their `order`, ties keep storage order.
    pub fn sorted_columns(&self) -> Vec<&Column> {
        let mut columns: Vec<&Column> = self.kanban.columns.iter().collect();
        columns.sort_by_key(|column| column.order);
        columns
    }

    /// Highest card order in `column_id`, zero for an empty column.
    pub fn max_card_order(&self, column_id: &str) -> i64 {
        self.kanban
            .cards
            .iter()
            .filter(|card| card.column_id == column_id)
            .map(|card| card.order)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KanbanState {
    #[serde(default)]
    pub columns: Vec<Column>,
    #[serde(default)]
    pub cards: Vec<Card>,
    #[serde(default)]
    pub candidates: Vec<CandidateRow>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    #[serde(default, deserialize_with = "lenient::text")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub name: String,
    #[serde(default, deserialize_with = "lenient::integer")]
    pub order: i64,
    #[serde(default, deserialize_with = "lenient::text")]
    pub created_at: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub updated_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    #[serde(default, deserialize_with = "lenient::text")]
    pub uuid: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub column_id: String,
    #[serde(default, deserialize_with = "lenient::integer")]
    pub order: i64,
    #[serde(default, deserialize_with = "lenient::text")]
    pub candidate_name: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub icims_id: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub employee_id: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub job_id: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub req_id: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub job_name: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub job_location: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub manager: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub branch: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub created_at: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub updated_at: String,
}

/// Text fields of a card with their stored length limit.
pub const CARD_TEXT_LIMITS: [(&str, usize); 12] = [
    ("uuid", ID_MAX),
    ("column_id", ID_MAX),
    ("candidate_name", CARD_NAME_MAX),
    ("icims_id", CARD_CODE_MAX),
    ("employee_id", CARD_CODE_MAX),
    ("job_id", CARD_CODE_MAX),
    ("req_id", CARD_CODE_MAX),
    ("job_name", CARD_NAME_MAX),
    ("job_location", CARD_NAME_MAX),
    ("manager", CARD_PERSON_MAX),
    ("branch", CARD_PERSON_MAX),
    ("created_at", TIMESTAMP_MAX),
];

macro_rules! candidate_fields {
    ($($variant:ident => $name:literal,)+) => {
        /// Closed set of columns a candidate row may carry.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum CandidateField {
            $($variant,)+
        }

        impl CandidateField {
            pub const ALL: &'static [CandidateField] = &[$(CandidateField::$variant,)+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(CandidateField::$variant => $name,)+
                }
            }
        }

        impl FromStr for CandidateField {
            type Err = UnknownField;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($name => Ok(CandidateField::$variant),)+
                    _ => Err(UnknownField(value.to_string())),
                }
            }
        }
    };
}

candidate_fields! {
    CandidateName => "Candidate Name",
    HireDate => "Hire Date",
    IcimsId => "ICIMS ID",
    EmployeeId => "Employee ID",
    NeoArrivalTime => "Neo Arrival Time",
    NeoDepartureTime => "Neo Departure Time",
    TotalNeoHours => "Total Neo Hours",
    ReqId => "REQ ID",
    JobIdName => "Job ID Name",
    JobLocation => "Job Location",
    Manager => "Manager",
    Branch => "Branch",
    ContactPhone => "Contact Phone",
    ContactEmail => "Contact Email",
    BackgroundProvider => "Background Provider",
    BackgroundClearedDate => "Background Cleared Date",
    BackgroundMvrFlag => "Background MVR Flag",
    LicenseType => "License Type",
    MaCoriStatus => "MA CORI Status",
    MaCoriDate => "MA CORI Date",
    NhGcStatus => "NH GC Status",
    NhGcExpirationDate => "NH GC Expiration Date",
    NhGcIdNumber => "NH GC ID Number",
    MeGcStatus => "ME GC Status",
    MeGcExpirationDate => "ME GC Expiration Date",
    IdType => "ID Type",
    StateAbbreviation => "State Abbreviation",
    IdNumber => "ID Number",
    Dob => "DOB",
    Exp => "EXP",
    OtherIdType => "Other ID Type",
    Social => "Social",
    BankName => "Bank Name",
    AccountType => "Account Type",
    RoutingNumber => "Routing Number",
    AccountNumber => "Account Number",
    ShirtSize => "Shirt Size",
    Waist => "Waist",
    Inseam => "Inseam",
    IssuedShirtSize => "Issued Shirt Size",
    IssuedWaist => "Issued Waist",
    IssuedInseam => "Issued Inseam",
    IssuedPantsSize => "Issued Pants Size",
    IssuedShirtType => "Issued Shirt Type",
    IssuedShirtsGiven => "Issued Shirts Given",
    IssuedPantsType => "Issued Pants Type",
    IssuedPantsGiven => "Issued Pants Given",
    UniformsIssued => "Uniforms Issued",
    ShirtType => "Shirt Type",
    ShirtsGiven => "Shirts Given",
    PantsType => "Pants Type",
    PantsGiven => "Pants Given",
    PantsSize => "Pants Size",
    BootsSize => "Boots Size",
    EmergencyContactName => "Emergency Contact Name",
    EmergencyContactRelationship => "Emergency Contact Relationship",
    EmergencyContactPhone => "Emergency Contact Phone",
    AdditionalDetails => "Additional Details",
    AdditionalNotes => "Additional Notes",
}

impl CandidateField {
    pub fn max_len(self) -> usize {
        match self {
            CandidateField::AdditionalDetails | CandidateField::AdditionalNotes => {
                CANDIDATE_NOTES_MAX
            }
            _ => CANDIDATE_SHORT_MAX,
        }
    }
}

impl fmt::Display for CandidateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownField(pub String);

impl fmt::Display for UnknownField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown candidate field `{}`", self.0)
    }
}

impl std::error::Error for UnknownField {}

/// Wide onboarding record, usually sharing its id with a kanban card.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateRow {
    pub uuid: String,
    fields: BTreeMap<CandidateField, String>,
}

impl CandidateRow {
    /// A row with every known field present and empty.
    pub fn new(uuid: impl Into<String>) -> Self {
        let mut row = Self {
            uuid: uuid.into(),
            fields: BTreeMap::new(),
        };
        row.fill_missing();
        row
    }

    pub fn get(&self, field: CandidateField) -> &str {
        self.fields.get(&field).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, field: CandidateField, value: impl Into<String>) {
        self.fields.insert(field, value.into());
    }

    pub fn contains(&self, field: CandidateField) -> bool {
        self.fields.contains_key(&field)
    }

    pub fn fill_missing(&mut self) {
        for field in CandidateField::ALL {
            self.fields.entry(*field).or_default();
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (CandidateField, &str)> {
        self.fields.iter().map(|(field, value)| (*field, value.as_str()))
    }
}

impl Serialize for CandidateRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        for (field, value) in &self.fields {
            map.serialize_entry(field.as_str(), value)?;
        }
        map.serialize_entry(CANDIDATE_UUID_KEY, &self.uuid)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for CandidateRow {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RowVisitor;

        impl<'de> Visitor<'de> for RowVisitor {
            type Value = CandidateRow;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a candidate row object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<CandidateRow, A::Error> {
                let mut row = CandidateRow::default();
                while let Some(key) = access.next_key::<String>()? {
                    let value: Value = access.next_value()?;
                    if key == CANDIDATE_UUID_KEY {
                        row.uuid = value_text(&value);
                        continue;
                    }
                    let field = key.parse::<CandidateField>().map_err(de::Error::custom)?;
                    row.fields.insert(field, value_text(&value));
                }
                Ok(row)
            }
        }

        deserializer.deserialize_map(RowVisitor)
    }
}

/// The fixed set of weekday keys a week record may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Day {
    Friday,
    Saturday,
    Sunday,
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
}

impl Day {
    /// Tracker weeks run Friday through Thursday.
    pub const ALL: [Day; 7] = [
        Day::Friday,
        Day::Saturday,
        Day::Sunday,
        Day::Monday,
        Day::Tuesday,
        Day::Wednesday,
        Day::Thursday,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Day::Friday => "Friday",
            Day::Saturday => "Saturday",
            Day::Sunday => "Sunday",
            Day::Monday => "Monday",
            Day::Tuesday => "Tuesday",
            Day::Wednesday => "Wednesday",
            Day::Thursday => "Thursday",
        }
    }
}

impl FromStr for Day {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Day::ALL
            .into_iter()
            .find(|day| day.as_str() == value)
            .ok_or_else(|| format!("unknown day `{value}`"))
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayEntry {
    #[serde(default, deserialize_with = "lenient::text")]
    pub start: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub end: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekRecord {
    #[serde(default, deserialize_with = "lenient::text")]
    pub week_start: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub week_end: String,
    #[serde(default)]
    pub entries: BTreeMap<Day, DayEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    #[serde(default, deserialize_with = "lenient::text")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub text: String,
    #[serde(default, deserialize_with = "lenient::flag")]
    pub done: bool,
    #[serde(rename = "createdAt", default, deserialize_with = "lenient::text")]
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecycleState {
    #[serde(default, deserialize_with = "lenient::entries")]
    pub items: Vec<RecycleEntry>,
    #[serde(default, deserialize_with = "lenient::entries")]
    pub redo: Vec<RecycleEntry>,
}

/// A snapshot of records removed (or about to be re-removed) from the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecycleEntry {
    #[serde(default, deserialize_with = "lenient::text")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub deleted_at: String,
    #[serde(flatten)]
    pub payload: RecyclePayload,
}

impl RecycleEntry {
    /// Deletion time in unix milliseconds; unreadable stamps count as ancient.
    pub fn deleted_at_ms(&self) -> i64 {
        self.deleted_at.trim().parse::<i64>().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecyclePayload {
    KanbanCards {
        #[serde(default)]
        cards: Vec<Card>,
        #[serde(default)]
        candidates: Vec<CandidateRow>,
    },
    KanbanColumns {
        #[serde(default)]
        columns: Vec<Column>,
        #[serde(default)]
        cards: Vec<Card>,
    },
    CandidateRows {
        #[serde(default)]
        candidates: Vec<CandidateRow>,
    },
    WeeklyEntries {
        #[serde(default)]
        entries: Vec<RemovedDayEntry>,
    },
    Todos {
        #[serde(default)]
        todos: Vec<Todo>,
    },
}

impl RecyclePayload {
    pub fn kind(&self) -> &'static str {
        match self {
            RecyclePayload::KanbanCards { .. } => "kanban_cards",
            RecyclePayload::KanbanColumns { .. } => "kanban_columns",
            RecyclePayload::CandidateRows { .. } => "candidate_rows",
            RecyclePayload::WeeklyEntries { .. } => "weekly_entries",
            RecyclePayload::Todos { .. } => "todos",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovedDayEntry {
    #[serde(default, deserialize_with = "lenient::text")]
    pub week_start: String,
    #[serde(default, deserialize_with = "lenient::text")]
    pub week_end: String,
    pub day: Day,
    #[serde(default)]
    pub payload: DayEntry,
}

/// Renders a scalar the way the stored format treats it as text.
pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => String::new(),
    }
}

pub(crate) fn value_i64(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(number)) => {
            if let Some(num) = number.as_i64() {
                num
            } else if let Some(num) = number.as_u64() {
                i64::try_from(num).unwrap_or(i64::MAX)
            } else {
                number.as_f64().map(|num| num.round() as i64).unwrap_or(0)
            }
        }
        Some(Value::String(text)) => text.trim().parse::<i64>().unwrap_or(0),
        _ => 0,
    }
}

/// Reads a stored schema version. Numbers and numeric strings count; anything
/// else, and anything below 1, is version 1.
pub(crate) fn version_number(value: &Value) -> i64 {
    value_i64(Some(value)).max(1)
}

mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use super::{value_i64, value_text, version_number, RecycleEntry};

    pub fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(value_text(&value))
    }

    pub fn integer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(value_i64(Some(&value)))
    }

    pub fn version<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(u32::try_from(version_number(&value)).unwrap_or(u32::MAX))
    }

    pub fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(match value {
            Value::Bool(flag) => flag,
            Value::String(text) => text.trim().eq_ignore_ascii_case("true"),
            Value::Number(number) => number.as_i64().unwrap_or(0) != 0,
            _ => false,
        })
    }

    pub fn entries<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<RecycleEntry>, D::Error> {
        let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
        let mut out = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<RecycleEntry>(value) {
                Ok(entry) => out.push(entry),
                Err(err) => tracing::warn!(error = %err, "dropping unreadable recycle entry"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn candidate_row_rejects_unknown_keys() {
        let err = serde_json::from_value::<CandidateRow>(json!({
            "candidate UUID": "u1",
            "Favorite Color": "green",
        }))
        .unwrap_err();
        assert!(err.to_string().contains("Favorite Color"));
    }

    #[test]
    fn candidate_row_keeps_uuid_and_fields() {
        let row: CandidateRow = serde_json::from_value(json!({
            "candidate UUID": "u1",
            "Candidate Name": "Dana",
            "Shirts Given": 3,
        }))
        .unwrap();
        assert_eq!(row.uuid, "u1");
        assert_eq!(row.get(CandidateField::CandidateName), "Dana");
        assert_eq!(row.get(CandidateField::ShirtsGiven), "3");
        assert!(!row.contains(CandidateField::Social));

        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["candidate UUID"], "u1");
        assert_eq!(value["Candidate Name"], "Dana");
    }

    #[test]
    fn new_row_has_every_field() {
        let row = CandidateRow::new("u1");
        assert_eq!(row.fields().count(), CandidateField::ALL.len());
        assert_eq!(CandidateField::ALL.len(), 59);
    }

    #[test]
    fn legacy_scalars_are_read_leniently() {
        let doc = Document::from_value(json!({
            "version": "2",
            "kanban": {
                "columns": [{ "id": 7, "name": "New", "order": "3" }],
                "cards": [],
                "candidates": [],
            },
            "todos": [{ "id": "t1", "text": "call", "done": "true", "createdAt": 1700 }],
        }))
        .unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(
            Document::from_value(json!({ "version": "abc" })).unwrap().version,
            1
        );
        assert_eq!(doc.kanban.columns[0].id, "7");
        assert_eq!(doc.kanban.columns[0].order, 3);
        assert!(doc.todos[0].done);
        assert_eq!(doc.todos[0].created_at, "1700");
    }

    #[test]
    fn unknown_recycle_types_are_dropped() {
        let doc = Document::from_value(json!({
            "recycle": {
                "items": [
                    { "id": "r1", "deleted_at": "1", "type": "uniform_rows", "uniforms": [] },
                    { "id": "r2", "deleted_at": "2", "type": "todos", "todos": [] },
                ],
                "redo": [],
            }
        }))
        .unwrap();
        assert_eq!(doc.recycle.items.len(), 1);
        assert_eq!(doc.recycle.items[0].id, "r2");
        assert_eq!(doc.recycle.items[0].payload.kind(), "todos");
    }

    #[test]
    fn weekly_entries_use_day_names() {
        let doc = Document::from_value(json!({
            "weekly": {
                "2024-01-05": {
                    "week_start": "2024-01-05",
                    "week_end": "2024-01-11",
                    "entries": { "Monday": { "start": "0800", "end": "1630", "content": "NEO" } },
                }
            }
        }))
        .unwrap();
        let week = &doc.weekly["2024-01-05"];
        assert_eq!(week.entries[&Day::Monday].content, "NEO");
        let value = doc.to_value().unwrap();
        assert_eq!(value["weekly"]["2024-01-05"]["entries"]["Monday"]["end"], "1630");
    }
}
