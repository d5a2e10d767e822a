use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::{Sink, SinkExt, stream};
use pgwire::api::auth::StartupHandler;
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::response::NotificationResponse;
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::warn;

use crate::calendar::WeekDates;
use crate::directory::NameCache;
use crate::engine::{BookingEngine, EngineError};
use crate::model::*;
use crate::observability::{self, QUERIES_TOTAL};
use crate::scheduler::{FireOutcome, ResetScheduler, SchedulerError};
use crate::sql::{self, Command, SqlError};

const WEEK_CHANNEL: &str = "week";

/// Shared state every connection's handler works against.
pub struct WireContext {
    pub engine: Arc<BookingEngine>,
    pub scheduler: Arc<ResetScheduler>,
    pub names: Arc<NameCache>,
}

/// Per-connection LISTEN state.
#[derive(Default)]
struct Subscriptions {
    days: Vec<(Day, broadcast::Receiver<SlotChanged>)>,
    week: Option<broadcast::Receiver<WeekOpened>>,
}

impl Subscriptions {
    /// Everything received since the last drain, as `(channel, payload)`.
    fn drain(&mut self) -> Vec<(String, String)> {
        let mut pending = Vec::new();
        for (day, rx) in &mut self.days {
            let channel = day.name().to_lowercase();
            while let Some(change) = next_message(rx, &channel) {
                pending.push((channel.clone(), slot_payload(&change)));
            }
        }
        if let Some(rx) = &mut self.week {
            while let Some(opened) = next_message(rx, WEEK_CHANNEL) {
                pending.push((WEEK_CHANNEL.to_string(), week_payload(&opened)));
            }
        }
        pending
    }
}

fn next_message<T: Clone>(rx: &mut broadcast::Receiver<T>, channel: &str) -> Option<T> {
    loop {
        match rx.try_recv() {
            Ok(msg) => return Some(msg),
            Err(TryRecvError::Lagged(n)) => {
                warn!("listener on {channel} fell behind, {n} notifications dropped");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
        }
    }
}

fn slot_payload(change: &SlotChanged) -> String {
    serde_json::json!({
        "day": change.slot.day.name(),
        "resource": change.slot.resource,
        "owner": change.owner,
    })
    .to_string()
}

fn week_payload(opened: &WeekOpened) -> String {
    serde_json::json!({
        "epoch": opened.epoch,
        "monday": opened.dates.map(|d| d.monday().to_string()),
        "friday": opened.dates.map(|d| d.friday().to_string()),
    })
    .to_string()
}

pub struct WeekdeskHandler {
    ctx: Arc<WireContext>,
    query_parser: Arc<WeekdeskQueryParser>,
    subscriptions: Mutex<Subscriptions>,
}

impl WeekdeskHandler {
    pub fn new(ctx: Arc<WireContext>) -> Self {
        Self {
            ctx,
            query_parser: Arc::new(WeekdeskQueryParser),
            subscriptions: Mutex::new(Subscriptions::default()),
        }
    }

    fn subscriptions(&self) -> std::sync::MutexGuard<'_, Subscriptions> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flush queued notifications to the client ahead of the next response.
    async fn deliver_notifications<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let pending = self.subscriptions().drain();
        for (channel, payload) in pending {
            client
                .feed(PgWireBackendMessage::NotificationResponse(
                    NotificationResponse::new(0, channel, payload),
                ))
                .await?;
        }
        client.flush().await?;
        Ok(())
    }

    async fn run_query(&self, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(|e| {
            metrics::counter!(QUERIES_TOTAL, "command" => "unparsed", "status" => "error")
                .increment(1);
            sql_err(e)
        })?;
        let label = observability::command_label(&cmd);
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::SelectWeek => {
                let grid = self.ctx.engine.snapshot().await.map_err(engine_err)?;
                let dates = self.ctx.scheduler.current_dates();
                let schema = Arc::new(week_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&(grid.epoch as i64))?;
                encoder.encode_field(&dates.map(|d| d.monday().to_string()))?;
                encoder.encode_field(&dates.map(|d| d.friday().to_string()))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectBookings { day, owner } => {
                let dates = self.ctx.scheduler.current_dates();
                let rows = match owner {
                    Some(owner) => self.owned_rows(day.as_deref(), &owner, dates).await?,
                    None => self.grid_rows(day.as_deref(), dates).await?,
                };

                let schema = Arc::new(bookings_schema());
                let mut encoded = Vec::with_capacity(rows.len());
                for row in &rows {
                    let owner_name = match &row.owner {
                        Some(actor) => Some(self.ctx.names.display_or_raw(actor).await),
                        None => None,
                    };
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&row.day.name())?;
                    encoder.encode_field(&row.date.map(|d| d.to_string()))?;
                    encoder.encode_field(&dates.map(|d| d.label(row.day)))?;
                    encoder.encode_field(&row.resource)?;
                    encoder.encode_field(&row.label)?;
                    encoder.encode_field(&row.owner)?;
                    encoder.encode_field(&owner_name)?;
                    encoded.push(Ok(encoder.take_row()));
                }
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(encoded),
                ))])
            }
            Command::Toggle {
                day,
                resource,
                actor,
            } => {
                let engine = &self.ctx.engine;
                let outcome = engine
                    .toggle(&day, &resource, &actor)
                    .await
                    .map_err(engine_err)?;
                let slot = engine.resolve_slot(&day, &resource).map_err(engine_err)?;
                let owner = match &outcome {
                    ToggleOutcome::Booked => Some(actor),
                    ToggleOutcome::Unbooked => None,
                    ToggleOutcome::Conflict { owner } => Some(owner.clone()),
                };

                let schema = Arc::new(toggle_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&outcome.label())?;
                encoder.encode_field(&slot.day.name())?;
                encoder.encode_field(&slot.resource)?;
                encoder.encode_field(&owner)?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::ResetWeek => match self.ctx.scheduler.fire().await {
                Ok(FireOutcome::Opened(_)) => {
                    Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(0))])
                }
                Ok(FireOutcome::AlreadyRunning) => Err(user_error(
                    "55P03",
                    "a weekly reset is already in progress".into(),
                )),
                Err(SchedulerError::ResetFailed(e)) => Err(engine_err(e)),
            },
            Command::Listen { channel } => {
                let mut subs = self.subscriptions();
                if channel == WEEK_CHANNEL {
                    if subs.week.is_none() {
                        subs.week = Some(self.ctx.engine.notify().subscribe_week());
                    }
                } else {
                    let day = self.listen_day(&channel)?;
                    if !subs.days.iter().any(|(d, _)| *d == day) {
                        let rx = self.ctx.engine.notify().subscribe_day(day);
                        subs.days.push((day, rx));
                    }
                }
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { channel } => {
                let mut subs = self.subscriptions();
                match channel.as_deref() {
                    None => *subs = Subscriptions::default(),
                    Some(WEEK_CHANNEL) => subs.week = None,
                    Some(name) => {
                        let day = self.listen_day(name)?;
                        subs.days.retain(|(d, _)| *d != day);
                    }
                }
                Ok(vec![Response::Execution(Tag::new("UNLISTEN"))])
            }
        }
    }

    /// Every slot of the week, or of one day, in layout order.
    async fn grid_rows(
        &self,
        day: Option<&str>,
        dates: Option<WeekDates>,
    ) -> PgWireResult<Vec<BookingRow>> {
        let engine = &self.ctx.engine;
        let days = match day {
            Some(day) => {
                let mut row = engine.day_view(day).await.map_err(engine_err)?;
                if let Some(dates) = &dates {
                    row.attach_date(dates);
                }
                vec![row]
            }
            None => {
                let mut grid = engine.snapshot().await.map_err(engine_err)?;
                if let Some(dates) = &dates {
                    grid.attach_dates(dates);
                }
                grid.days
            }
        };
        Ok(days
            .into_iter()
            .flat_map(|row| {
                let (day, date) = (row.day, row.date);
                row.slots.into_iter().map(move |view| BookingRow {
                    day,
                    date,
                    resource: view.resource,
                    label: view.label,
                    owner: view.owner,
                })
            })
            .collect())
    }

    /// Slots held by `owner`, optionally on one day only.
    async fn owned_rows(
        &self,
        day: Option<&str>,
        owner: &str,
        dates: Option<WeekDates>,
    ) -> PgWireResult<Vec<BookingRow>> {
        let engine = &self.ctx.engine;
        let day = day
            .map(|d| engine.resolve_day(d))
            .transpose()
            .map_err(engine_err)?;
        let held = engine.bookings_for(owner).await.map_err(engine_err)?;
        Ok(held
            .into_iter()
            .filter(|slot| day.is_none_or(|d| slot.day == d))
            .map(|slot| BookingRow {
                day: slot.day,
                date: dates.map(|d| d.date_of(slot.day)),
                label: engine
                    .layout()
                    .resource(&slot.resource)
                    .map(|r| r.label.clone())
                    .unwrap_or_default(),
                resource: slot.resource,
                owner: Some(owner.to_string()),
            })
            .collect())
    }

    fn listen_day(&self, channel: &str) -> PgWireResult<Day> {
        Day::parse(channel)
            .filter(|d| self.ctx.engine.layout().days().contains(d))
            .ok_or_else(|| {
                user_error(
                    "42000",
                    format!("invalid channel: {channel} (expected a configured weekday or week)"),
                )
            })
    }
}

/// One `bookings` result row before display names are resolved.
struct BookingRow {
    day: Day,
    date: Option<NaiveDate>,
    resource: String,
    label: String,
    owner: Option<String>,
}

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("day", Type::VARCHAR),
        text_field("date", Type::VARCHAR),
        text_field("date_label", Type::VARCHAR),
        text_field("resource", Type::VARCHAR),
        text_field("label", Type::VARCHAR),
        text_field("owner", Type::VARCHAR),
        text_field("owner_name", Type::VARCHAR),
    ]
}

fn week_schema() -> Vec<FieldInfo> {
    vec![
        text_field("epoch", Type::INT8),
        text_field("monday", Type::VARCHAR),
        text_field("friday", Type::VARCHAR),
    ]
}

fn toggle_schema() -> Vec<FieldInfo> {
    vec![
        text_field("outcome", Type::VARCHAR),
        text_field("day", Type::VARCHAR),
        text_field("resource", Type::VARCHAR),
        text_field("owner", Type::VARCHAR),
    ]
}

/// Result columns for a statement that may still hold `$N` placeholders.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("INSERT") && upper.contains("TOGGLES") {
        toggle_schema()
    } else if upper.starts_with("SELECT") && upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.starts_with("SELECT") && upper.contains("WEEK") {
        week_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for WeekdeskHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.deliver_notifications(client).await?;
        self.run_query(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct WeekdeskQueryParser;

#[async_trait]
impl QueryParser for WeekdeskQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for WeekdeskHandler {
    type Statement = String;
    type QueryParser = WeekdeskQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.deliver_notifications(client).await?;
        let sql = substitute_params(portal);
        let mut responses = self.run_query(&sql).await?;
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Substitute `$1, $2, ...` with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<&[u8]>> = portal.parameters.iter().map(|p| p.as_deref()).collect();
    substitute(&portal.statement.statement, &params)
}

/// One left-to-right pass over `sql`: placeholders inside substituted values
/// are never expanded. Unbound placeholders are left as written.
fn substitute(sql: &str, params: &[Option<&[u8]>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(u8::is_ascii_digit).count();
        let bound = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match bound {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes).replace('\'', "''");
                result.push('\'');
                result.push_str(&text);
                result.push('\'');
            }
            Some(None) => result.push_str("NULL"),
            None => result.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    result.push_str(rest);
    result
}

// ── Factory ──────────────────────────────────────────────────────

/// One per connection; LISTEN state lives in the handler.
pub struct WeekdeskFactory {
    handler: Arc<WeekdeskHandler>,
    noop: Arc<NoopHandler>,
}

impl WeekdeskFactory {
    pub fn new(ctx: Arc<WireContext>) -> Self {
        Self {
            handler: Arc::new(WeekdeskHandler::new(ctx)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for WeekdeskFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.noop.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects. No TLS, no authentication.
pub async fn process_connection(socket: TcpStream, ctx: Arc<WireContext>) -> std::io::Result<()> {
    let factory = Arc::new(WeekdeskFactory::new(ctx));
    pgwire::tokio::process_socket(socket, None, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = match e {
        EngineError::InvalidSlot { .. } | EngineError::InvalidActor(_) => "22023",
        EngineError::StoreUnavailable(_) => "58030",
    };
    user_error(code, e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM week"), 0);
        assert_eq!(count_params("INSERT INTO toggles VALUES ($1, $3, $2)"), 3);
        assert_eq!(count_params("SELECT '$' FROM week"), 0);
    }

    #[test]
    fn substitute_binds_each_placeholder_once() {
        let sql = "INSERT INTO toggles (day, resource, actor) VALUES ($1, $2, $3)";
        let params = [
            Some(&b"Thursday"[..]),
            Some(&b"small_2"[..]),
            Some(&b"team$1"[..]),
        ];
        assert_eq!(
            substitute(sql, &params),
            "INSERT INTO toggles (day, resource, actor) VALUES ('Thursday', 'small_2', 'team$1')"
        );
    }

    #[test]
    fn substitute_quotes_nulls_and_double_digits() {
        let params: Vec<Option<&[u8]>> = (1..=10)
            .map(|i| if i == 10 { Some(&b"O'Brien"[..]) } else { None })
            .collect();
        assert_eq!(substitute("$10 $1 $", &params), "'O''Brien' NULL $");
        assert_eq!(substitute("$11", &params), "$11");
    }

    #[test]
    fn result_schema_follows_command() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql)
                .iter()
                .map(|f| f.name().to_string())
                .collect()
        };
        assert_eq!(
            names("INSERT INTO toggles VALUES ($1, $2, $3)"),
            ["outcome", "day", "resource", "owner"]
        );
        assert_eq!(names("select * from bookings where day = $1").len(), 7);
        assert_eq!(names("SELECT * FROM week"), ["epoch", "monday", "friday"]);
        assert!(names("DELETE FROM bookings").is_empty());
    }

    #[test]
    fn notification_payloads_are_json() {
        let change = SlotChanged {
            slot: Slot::new(Day::Tuesday, "large_2"),
            owner: None,
        };
        let parsed: serde_json::Value = serde_json::from_str(&slot_payload(&change)).unwrap();
        assert_eq!(parsed["day"], "Tuesday");
        assert_eq!(parsed["resource"], "large_2");
        assert!(parsed["owner"].is_null());

        let opened = WeekOpened {
            epoch: 4,
            dates: Some(WeekDates::starting(
                NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
            )),
        };
        let parsed: serde_json::Value = serde_json::from_str(&week_payload(&opened)).unwrap();
        assert_eq!(parsed["epoch"], 4);
        assert_eq!(parsed["friday"], "2026-10-23");
    }

    #[tokio::test]
    async fn drain_collects_subscribed_days_only() {
        let hub = crate::notify::NotifyHub::new();
        let mut subs = Subscriptions::default();
        subs.days.push((Day::Monday, hub.subscribe_day(Day::Monday)));
        subs.week = Some(hub.subscribe_week());

        hub.send_slot(&SlotChanged {
            slot: Slot::new(Day::Monday, "small_1"),
            owner: Some("U1".into()),
        });
        hub.send_slot(&SlotChanged {
            slot: Slot::new(Day::Friday, "small_1"),
            owner: Some("U1".into()),
        });
        hub.send_week(&WeekOpened {
            epoch: 1,
            dates: None,
        });

        let pending = subs.drain();
        let channels: Vec<&str> = pending.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(channels, ["monday", "week"]);
        assert!(subs.drain().is_empty());
    }
}
