//! Service actions
//!
//! Each action is declared once with its name, parameters, result shape and
//! handler. Hosts list the registry to build their surface and invoke actions
//! by name with loosely typed parameters, which are checked and defaulted here
//! before the handler runs.

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;
use voltage_alarm_store::{
    AckFilter, AlarmFilter, AlarmRecord, Note, OpenFilter, SortField, StoreError,
};

use crate::config::ClassConfig;
use crate::error::{invalid_input, not_found, Result};
use crate::logging;
use crate::service::{AlarmService, PageRequest, DEFAULT_PAGE_SIZE};
use crate::stream::AlarmSubscription;
use crate::time_range::TimeRange;

/// Columns of every alarm table and stream
pub const ALARM_COLUMNS: &[&str] = &[
    "UUID",
    "Source",
    "Class",
    "Created Time",
    "Type",
    "Normal Time",
    "Ack Time",
    "Ack User",
    "Message",
    "Open",
    "Ack Required",
];

pub const NOTE_COLUMNS: &[&str] = &["Timestamp", "User", "Note"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    String,
    Number,
    Bool,
    /// One of a fixed set of names, matched case-insensitively
    Enum(&'static [&'static str]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamType,
    pub default: Option<Value>,
    pub required: bool,
}

impl ParamSpec {
    fn new(name: &'static str, kind: ParamType) -> Self {
        Self {
            name,
            kind,
            default: None,
            required: false,
        }
    }

    pub fn string(name: &'static str) -> Self {
        Self::new(name, ParamType::String)
    }

    pub fn number(name: &'static str) -> Self {
        Self::new(name, ParamType::Number)
    }

    pub fn boolean(name: &'static str) -> Self {
        Self::new(name, ParamType::Bool)
    }

    pub fn choice(name: &'static str, names: &'static [&'static str]) -> Self {
        Self::new(name, ParamType::Enum(names))
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Check `value` against the declared type and normalize it
    fn coerce(&self, value: Value) -> Result<Value> {
        let mismatch = || invalid_input(format!("{} expects {:?}", self.name, self.kind));
        match (self.kind, value) {
            (ParamType::String, Value::String(s)) => Ok(Value::String(s)),
            (ParamType::String, Value::Number(n)) => Ok(Value::String(n.to_string())),
            (ParamType::String, Value::Bool(b)) => Ok(Value::String(b.to_string())),
            (ParamType::Number, Value::Number(n)) => Ok(Value::Number(n)),
            (ParamType::Number, Value::String(s)) => {
                let parsed: f64 = s.trim().parse().map_err(|_| mismatch())?;
                serde_json::Number::from_f64(parsed)
                    .map(Value::Number)
                    .ok_or_else(mismatch)
            }
            (ParamType::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (ParamType::Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            (ParamType::Enum(names), Value::String(s)) => names
                .iter()
                .find(|n| n.eq_ignore_ascii_case(s.trim()))
                .map(|n| Value::String((*n).to_string()))
                .ok_or_else(|| {
                    invalid_input(format!("{} must be one of {}", self.name, names.join(", ")))
                }),
            _ => Err(mismatch()),
        }
    }
}

/// What an action returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    None,
    Value,
    Table,
    Stream,
}

pub enum ActionOutput {
    None,
    Value(Value),
    Table {
        columns: &'static [&'static str],
        rows: Vec<Vec<Value>>,
    },
    /// Snapshot rows followed, for live subscriptions, by updates
    Stream {
        columns: &'static [&'static str],
        subscription: AlarmSubscription,
    },
}

impl ActionOutput {
    pub fn shape(&self) -> ResultShape {
        match self {
            ActionOutput::None => ResultShape::None,
            ActionOutput::Value(_) => ResultShape::Value,
            ActionOutput::Table { .. } => ResultShape::Table,
            ActionOutput::Stream { .. } => ResultShape::Stream,
        }
    }
}

/// Named parameters of one invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionParams(Map<String, Value>);

impl ActionParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.0.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    fn required_str(&self, name: &str) -> Result<&str> {
        self.str(name)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| invalid_input(format!("{} is required", name)))
    }

    fn usize(&self, name: &str) -> Result<usize> {
        let value = self
            .0
            .get(name)
            .ok_or_else(|| invalid_input(format!("{} is required", name)))?;
        value
            .as_u64()
            .or_else(|| {
                value
                    .as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                    .map(|f| f as u64)
            })
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| invalid_input(format!("{} must be a non-negative integer", name)))
    }

    fn bool(&self, name: &str) -> Result<bool> {
        self.0
            .get(name)
            .and_then(Value::as_bool)
            .ok_or_else(|| invalid_input(format!("{} is required", name)))
    }

    fn uuid(&self, name: &str) -> Result<Uuid> {
        let text = self.required_str(name)?;
        Uuid::parse_str(text.trim()).map_err(|_| invalid_input(format!("invalid {}: {}", name, text)))
    }

    fn parse<T>(&self, name: &str) -> Result<T>
    where
        T: FromStr<Err = StoreError> + Default,
    {
        match self.str(name) {
            Some(text) => Ok(text.parse::<T>()?),
            None => Ok(T::default()),
        }
    }
}

pub type ActionHandler =
    Arc<dyn Fn(Arc<AlarmService>, ActionParams) -> BoxFuture<'static, Result<ActionOutput>> + Send + Sync>;

fn handler<F, Fut>(f: F) -> ActionHandler
where
    F: Fn(Arc<AlarmService>, ActionParams) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ActionOutput>> + Send + 'static,
{
    Arc::new(move |service, params| f(service, params).boxed())
}

pub struct ActionSpec {
    pub name: &'static str,
    pub params: Vec<ParamSpec>,
    pub result: ResultShape,
    handler: ActionHandler,
}

impl ActionSpec {
    fn new(
        name: &'static str,
        params: Vec<ParamSpec>,
        result: ResultShape,
        handler: ActionHandler,
    ) -> Self {
        Self {
            name,
            params,
            result,
            handler,
        }
    }

    /// Apply defaults and type checks; undeclared parameters are dropped
    pub fn resolve(&self, mut params: ActionParams) -> Result<ActionParams> {
        let mut resolved = ActionParams::new();
        for spec in &self.params {
            let value = match params.0.remove(spec.name) {
                Some(Value::Null) | None => spec.default.clone(),
                Some(value) => Some(value),
            };
            match value {
                Some(value) => {
                    resolved.0.insert(spec.name.to_string(), spec.coerce(value)?);
                }
                None if spec.required => {
                    return Err(invalid_input(format!("{} is required", spec.name)));
                }
                None => {}
            }
        }
        Ok(resolved)
    }
}

impl std::fmt::Debug for ActionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionSpec")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("result", &self.result)
            .finish()
    }
}

/// The service's action table
pub struct ActionRegistry {
    actions: Vec<ActionSpec>,
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionRegistry {
    pub fn new() -> Self {
        let uuid = || ParamSpec::string("UUID").required();
        let user = || ParamSpec::string("User").default_value("");
        let range = || ParamSpec::string("Time Range").default_value("today");
        let filters = || {
            vec![
                ParamSpec::choice("Ack State", AckFilter::NAMES).default_value("Any"),
                ParamSpec::choice("Alarm State", AlarmFilter::NAMES).default_value("Any"),
                ParamSpec::choice("Open State", OpenFilter::NAMES).default_value("Any"),
            ]
        };

        let mut page_params = vec![
            range(),
            ParamSpec::number("Page").default_value(0),
            ParamSpec::number("Page Size").default_value(DEFAULT_PAGE_SIZE),
        ];
        page_params.extend(filters());
        page_params.push(ParamSpec::choice("Sort By", SortField::NAMES).default_value("Created Time"));
        page_params.push(ParamSpec::boolean("Ascending").default_value(true));

        let mut count_params = vec![
            range(),
            ParamSpec::number("Page Size").default_value(DEFAULT_PAGE_SIZE),
        ];
        count_params.extend(filters());

        let actions = vec![
            ActionSpec::new(
                "Acknowledge",
                vec![ParamSpec::string("UUIDs").required(), user()],
                ResultShape::None,
                handler(acknowledge),
            ),
            ActionSpec::new("Acknowledge All", vec![user()], ResultShape::Value, handler(acknowledge_all)),
            ActionSpec::new(
                "Add Alarm Class",
                vec![
                    ParamSpec::string("Name").required(),
                    ParamSpec::number("Max Records").default_value(0),
                    ParamSpec::number("Max Age Days").default_value(0),
                    ParamSpec::boolean("Ack Required").default_value(false),
                ],
                ResultShape::Value,
                handler(add_alarm_class),
            ),
            ActionSpec::new(
                "Add Note",
                vec![uuid(), user(), ParamSpec::string("Note").required()],
                ResultShape::None,
                handler(add_note),
            ),
            ActionSpec::new("Delete All Records", vec![], ResultShape::Value, handler(delete_all_records)),
            ActionSpec::new("Delete Record", vec![uuid()], ResultShape::None, handler(delete_record)),
            ActionSpec::new(
                "Edit Alarm Class",
                vec![
                    ParamSpec::string("Class").required(),
                    ParamSpec::number("Max Records"),
                    ParamSpec::number("Max Age Days"),
                    ParamSpec::boolean("Ack Required"),
                ],
                ResultShape::None,
                handler(edit_alarm_class),
            ),
            ActionSpec::new("Get Alarm", vec![uuid()], ResultShape::Table, handler(get_alarm)),
            ActionSpec::new("Get Alarms", vec![range()], ResultShape::Stream, handler(get_alarms)),
            ActionSpec::new(
                "Get Open Alarms",
                vec![
                    ParamSpec::string("Class").default_value(""),
                    ParamSpec::boolean("Stream Updates").default_value(true),
                ],
                ResultShape::Stream,
                handler(get_open_alarms),
            ),
            ActionSpec::new("Get Alarm Page", page_params, ResultShape::Table, handler(get_alarm_page)),
            ActionSpec::new(
                "Get Alarm Page Count",
                count_params,
                ResultShape::Value,
                handler(get_alarm_page_count),
            ),
            ActionSpec::new("Get Notes", vec![uuid()], ResultShape::Table, handler(get_notes)),
            ActionSpec::new("Return To Normal", vec![uuid()], ResultShape::None, handler(return_to_normal)),
            ActionSpec::new("Update Counts", vec![], ResultShape::Value, handler(update_counts)),
            ActionSpec::new(
                "Set Log Level",
                vec![ParamSpec::string("Level").required()],
                ResultShape::None,
                handler(set_log_level),
            ),
            ActionSpec::new(
                "Set External Access",
                vec![ParamSpec::boolean("Enabled").required()],
                ResultShape::None,
                handler(set_external_access),
            ),
        ];
        Self { actions }
    }

    pub fn get(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.iter().find(|a| a.name == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.actions.iter().map(|a| a.name).collect()
    }

    pub fn specs(&self) -> &[ActionSpec] {
        &self.actions
    }

    pub async fn invoke(
        &self,
        service: &Arc<AlarmService>,
        name: &str,
        params: ActionParams,
    ) -> Result<ActionOutput> {
        let spec = self
            .get(name)
            .ok_or_else(|| not_found(format!("action {}", name)))?;
        let params = spec.resolve(params)?;
        debug!("Invoking action {}", name);
        (spec.handler)(service.clone(), params).await
    }
}

// ========== Encoding ==========

fn timestamp(t: DateTime<Utc>) -> Value {
    Value::String(t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn optional_timestamp(t: Option<DateTime<Utc>>) -> Value {
    t.map(timestamp).unwrap_or(Value::Null)
}

/// One row in [`ALARM_COLUMNS`] order
pub fn alarm_row(record: &AlarmRecord, class_name: Option<&str>) -> Vec<Value> {
    vec![
        Value::String(record.uuid().to_string()),
        Value::String(record.source_path().to_string()),
        class_name.map(|n| Value::String(n.to_string())).unwrap_or(Value::Null),
        timestamp(record.created_time()),
        Value::String(record.alarm_type().to_string()),
        optional_timestamp(record.normal_time()),
        optional_timestamp(record.ack_time()),
        record
            .ack_user()
            .map(|u| Value::String(u.to_string()))
            .unwrap_or(Value::Null),
        Value::String(record.message().to_string()),
        Value::Bool(record.is_open()),
        Value::Bool(record.is_ack_required()),
    ]
}

/// Row for `record` with its class resolved to a name
pub fn encode_alarm(service: &AlarmService, record: &AlarmRecord) -> Vec<Value> {
    let class = record.alarm_class().and_then(|h| service.class(h).ok());
    alarm_row(record, class.as_ref().map(|c| c.name()))
}

fn note_row(note: &Note) -> Vec<Value> {
    vec![
        timestamp(note.timestamp),
        Value::String(note.user.clone()),
        Value::String(note.text.clone()),
    ]
}

fn page_request(params: &ActionParams) -> Result<PageRequest> {
    let mut request = PageRequest::new(TimeRange::parse(params.str("Time Range"))?);
    request.page_size = params.usize("Page Size")?;
    if params.get("Page").is_some() {
        request.page = params.usize("Page")?;
    }
    request.ack = params.parse("Ack State")?;
    request.alarm = params.parse("Alarm State")?;
    request.open = params.parse("Open State")?;
    request.sort_by = params.parse("Sort By")?;
    if params.get("Ascending").is_some() {
        request.ascending = params.bool("Ascending")?;
    }
    Ok(request)
}

// ========== Handlers ==========

async fn acknowledge(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    let user = params.str("User").unwrap_or_default();
    service.acknowledge(params.required_str("UUIDs")?, user).await?;
    Ok(ActionOutput::None)
}

async fn acknowledge_all(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    let user = params.str("User").unwrap_or_default();
    let count = service.acknowledge_all_open(user).await?;
    Ok(ActionOutput::Value(json!(count)))
}

async fn add_alarm_class(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    let mut config = ClassConfig::new(params.required_str("Name")?.trim());
    config.max_records = params.usize("Max Records")?;
    config.max_age_days = max_age_days(&params)?;
    config.ack_required = params.bool("Ack Required")?;
    let class = service.add_class(config)?;
    Ok(ActionOutput::Value(json!(class.handle().0)))
}

fn max_age_days(params: &ActionParams) -> Result<u32> {
    u32::try_from(params.usize("Max Age Days")?)
        .map_err(|_| invalid_input("Max Age Days is too large"))
}

/// Change the given settings of a class; omitted ones keep their value
async fn edit_alarm_class(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    let name = params.required_str("Class")?.trim();
    let class = service
        .class_by_name(name)
        .ok_or_else(|| not_found(format!("alarm class {}", name)))?;
    let mut settings = class.settings();
    if params.get("Max Records").is_some() {
        settings.max_records = params.usize("Max Records")?;
    }
    if params.get("Max Age Days").is_some() {
        settings.max_age_days = max_age_days(&params)?;
    }
    if params.get("Ack Required").is_some() {
        settings.ack_required = params.bool("Ack Required")?;
    }
    service.set_class_settings(class.handle(), settings)?;
    Ok(ActionOutput::None)
}

async fn add_note(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    let user = params.str("User").unwrap_or_default();
    service
        .add_note(params.uuid("UUID")?, user, params.required_str("Note")?)
        .await?;
    Ok(ActionOutput::None)
}

async fn delete_all_records(service: Arc<AlarmService>, _params: ActionParams) -> Result<ActionOutput> {
    let deleted = service.delete_all_records().await?;
    Ok(ActionOutput::Value(json!(deleted)))
}

async fn delete_record(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    service.delete_record(params.uuid("UUID")?).await?;
    Ok(ActionOutput::None)
}

async fn get_alarm(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    let record = service.get_alarm(params.uuid("UUID")?).await?;
    Ok(ActionOutput::Table {
        columns: ALARM_COLUMNS,
        rows: vec![encode_alarm(&service, &record)],
    })
}

async fn get_alarms(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    let range = TimeRange::parse(params.str("Time Range"))?;
    let rows = service.get_alarms(range).await?.collect_remaining();
    Ok(ActionOutput::Stream {
        columns: ALARM_COLUMNS,
        subscription: AlarmSubscription::snapshot(rows),
    })
}

async fn get_open_alarms(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    let class = match params.str("Class").map(str::trim).filter(|s| !s.is_empty()) {
        Some(name) => Some(
            service
                .class_by_name(name)
                .ok_or_else(|| not_found(format!("alarm class {}", name)))?
                .handle(),
        ),
        None => None,
    };
    let subscription = service
        .get_open_alarms(class, params.bool("Stream Updates")?)
        .await?;
    Ok(ActionOutput::Stream {
        columns: ALARM_COLUMNS,
        subscription,
    })
}

async fn get_alarm_page(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    let request = page_request(&params)?;
    let mut cursor = service.get_alarm_page(&request).await?;
    let mut rows = Vec::new();
    while cursor.advance() {
        if let Some(record) = cursor.record() {
            rows.push(encode_alarm(&service, record));
        }
    }
    cursor.close();
    Ok(ActionOutput::Table {
        columns: ALARM_COLUMNS,
        rows,
    })
}

async fn get_alarm_page_count(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    let request = page_request(&params)?;
    let pages = service.get_alarm_page_count(&request).await?;
    Ok(ActionOutput::Value(json!(pages)))
}

async fn get_notes(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    let rows = service
        .get_notes(params.uuid("UUID")?)
        .await?
        .map(|note| note_row(&note))
        .collect();
    Ok(ActionOutput::Table {
        columns: NOTE_COLUMNS,
        rows,
    })
}

async fn return_to_normal(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    service.return_to_normal(params.uuid("UUID")?).await?;
    Ok(ActionOutput::None)
}

async fn update_counts(service: Arc<AlarmService>, _params: ActionParams) -> Result<ActionOutput> {
    service.update_counts(true).await?;
    let counts = serde_json::to_value(service.counts())
        .map_err(|e| invalid_input(format!("counts not encodable: {}", e)))?;
    Ok(ActionOutput::Value(counts))
}

async fn set_log_level(_service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    logging::set_log_level(params.required_str("Level")?.trim())?;
    Ok(ActionOutput::None)
}

async fn set_external_access(service: Arc<AlarmService>, params: ActionParams) -> Result<ActionOutput> {
    service.set_external_access(params.bool("Enabled")?).await?;
    Ok(ActionOutput::None)
}
