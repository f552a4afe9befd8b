use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::InnkeepAuthSource;
use crate::engine::{Engine, EngineError};
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct InnkeepHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<InnkeepQueryParser>,
}

impl InnkeepHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(InnkeepQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    /// Run one command, recording its outcome and latency.
    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = dispatch(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        result
    }
}

async fn dispatch(engine: &Engine, cmd: Command) -> PgWireResult<Response> {
    match cmd {
        Command::InsertRoomType { id, name, units } => {
            engine.create_room_type(id, name, units).await.map_err(engine_err)?;
            Ok(executed("INSERT"))
        }
        Command::DeleteRoomType { id } => {
            engine.delete_room_type(id).await.map_err(engine_err)?;
            Ok(executed("DELETE"))
        }
        Command::InsertRatePlan { plan } => {
            engine.add_rate_plan(plan).await.map_err(engine_err)?;
            Ok(executed("INSERT"))
        }
        Command::DeleteRatePlan { id } => {
            engine.remove_rate_plan(id).await.map_err(engine_err)?;
            Ok(executed("DELETE"))
        }
        Command::InsertHold {
            id,
            room_type_id,
            check_in,
            check_out,
            expires_at,
        } => {
            engine
                .place_hold(id, room_type_id, check_in, check_out, expires_at)
                .await
                .map_err(engine_err)?;
            Ok(executed("INSERT"))
        }
        Command::DeleteHold { id } => {
            engine.release_hold(id).await.map_err(engine_err)?;
            Ok(executed("DELETE"))
        }
        Command::InsertBooking {
            id,
            room_type_id,
            check_in,
            check_out,
            label,
        } => {
            engine
                .confirm_booking(id, room_type_id, check_in, check_out, label)
                .await
                .map_err(engine_err)?;
            Ok(executed("INSERT"))
        }
        Command::DeleteBooking { id } => {
            engine.cancel_booking(id).await.map_err(engine_err)?;
            Ok(executed("DELETE"))
        }
        Command::SelectRoomTypes => {
            let schema = Arc::new(room_types_schema());
            let rows: Vec<PgWireResult<_>> = engine
                .list_room_types()
                .await
                .into_iter()
                .map(|rt| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&rt.id.to_string())?;
                    encoder.encode_field(&rt.name)?;
                    encoder.encode_field(&i64::from(rt.units))?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectRatePlans { room_type_id } => {
            let schema = Arc::new(rate_plans_schema());
            let rows: Vec<PgWireResult<_>> = engine
                .get_rate_plans(room_type_id)
                .await
                .into_iter()
                .map(|plan| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&plan.id.to_string())?;
                    encoder.encode_field(&plan.room_type_id.to_string())?;
                    encoder.encode_field(&plan.start_date.to_string())?;
                    encoder.encode_field(&plan.end_date.to_string())?;
                    encoder.encode_field(&i16::from(plan.dow_mask))?;
                    encoder.encode_field(&plan.closed)?;
                    encoder.encode_field(&plan.priority)?;
                    encoder.encode_field(&plan.base_rate)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectHolds { room_type_id } => {
            let schema = Arc::new(holds_schema());
            let rows: Vec<PgWireResult<_>> = engine
                .get_holds(room_type_id)
                .await
                .into_iter()
                .map(|hold| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&hold.id.to_string())?;
                    encoder.encode_field(&hold.room_type_id.to_string())?;
                    encoder.encode_field(&hold.stay.check_in.to_string())?;
                    encoder.encode_field(&hold.stay.check_out.to_string())?;
                    encoder.encode_field(&hold.total)?;
                    encoder.encode_field(&hold.expires_at)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectBookings { room_type_id } => {
            let schema = Arc::new(bookings_schema());
            let rows: Vec<PgWireResult<_>> = engine
                .get_bookings(room_type_id)
                .await
                .into_iter()
                .map(|booking| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&booking.id.to_string())?;
                    encoder.encode_field(&booking.room_type_id.to_string())?;
                    encoder.encode_field(&booking.stay.check_in.to_string())?;
                    encoder.encode_field(&booking.stay.check_out.to_string())?;
                    encoder.encode_field(&booking.total)?;
                    encoder.encode_field(&booking.label)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectNightlyRates {
            room_type_id,
            check_in,
            check_out,
        } => {
            let nights = engine
                .nightly_rates(room_type_id, check_in, check_out)
                .await
                .map_err(engine_err)?;
            let schema = Arc::new(nightly_rates_schema());
            let rows: Vec<PgWireResult<_>> = nights
                .into_iter()
                .map(|(night, rate)| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&night.to_string())?;
                    encoder.encode_field(&rate.rate_plan_id().map(|id| id.to_string()))?;
                    encoder.encode_field(&rate.base_rate())?;
                    encoder.encode_field(&rate.total_rate())?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectQuote {
            room_type_id,
            check_in,
            check_out,
        } => {
            let quote = engine
                .quote(room_type_id, check_in, check_out)
                .await
                .map_err(engine_err)?;
            let breakdown = serde_json::to_string(&quote.nights)
                .map_err(|e| user_error("XX000", format!("breakdown encoding failed: {e}")))?;

            let schema = Arc::new(quote_schema());
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&quote.room_type_id.to_string())?;
            encoder.encode_field(&quote.stay.check_in.to_string())?;
            encoder.encode_field(&quote.stay.check_out.to_string())?;
            encoder.encode_field(&(quote.nights.len() as i64))?;
            encoder.encode_field(&quote.total)?;
            encoder.encode_field(&breakdown)?;
            let rows: Vec<PgWireResult<_>> = vec![Ok(encoder.take_row())];
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Command::SelectAvailability {
            room_type_id,
            check_in,
            check_out,
        } => {
            let nights = engine
                .availability(room_type_id, check_in, check_out)
                .await
                .map_err(engine_err)?;
            let schema = Arc::new(availability_schema());
            let rt_str = room_type_id.to_string();
            let rows: Vec<PgWireResult<_>> = nights
                .into_iter()
                .map(|n| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&rt_str)?;
                    encoder.encode_field(&n.night.to_string())?;
                    encoder.encode_field(&i64::from(n.available))?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
    }
}

fn executed(tag: &str) -> Response {
    Response::Execution(Tag::new(tag).with_rows(1))
}

// ── Result schemas ───────────────────────────────────────────────

fn text(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn room_types_schema() -> Vec<FieldInfo> {
    vec![text("id"), text("name"), int8("units")]
}

fn rate_plans_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("room_type_id"),
        text("start_date"),
        text("end_date"),
        FieldInfo::new("dow_mask".into(), None, None, Type::INT2, FieldFormat::Text),
        FieldInfo::new("closed".into(), None, None, Type::BOOL, FieldFormat::Text),
        FieldInfo::new("priority".into(), None, None, Type::INT4, FieldFormat::Text),
        int8("base_rate"),
    ]
}

fn holds_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("room_type_id"),
        text("check_in"),
        text("check_out"),
        int8("total"),
        int8("expires_at"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text("id"),
        text("room_type_id"),
        text("check_in"),
        text("check_out"),
        int8("total"),
        text("label"),
    ]
}

fn nightly_rates_schema() -> Vec<FieldInfo> {
    vec![text("night"), text("rate_plan_id"), int8("base_rate"), int8("total_rate")]
}

fn quote_schema() -> Vec<FieldInfo> {
    vec![
        text("room_type_id"),
        text("check_in"),
        text("check_out"),
        int8("nights"),
        int8("total"),
        text("breakdown"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text("room_type_id"), text("night"), int8("available")]
}

/// Result columns for a statement, decided from its table name so that
/// statements with unbound `$n` placeholders can still be described.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    if !lower.trim_start().starts_with("select") {
        return vec![];
    }
    let table = lower
        .split_once(" from ")
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .map(|t| t.trim_matches(|c: char| c == ';' || c == '"'));
    match table {
        Some("room_types") => room_types_schema(),
        Some("rate_plans") => rate_plans_schema(),
        Some("holds") => holds_schema(),
        Some("bookings") => bookings_schema(),
        Some("nightly_rates") => nightly_rates_schema(),
        Some("quote") => quote_schema(),
        Some("availability") => availability_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for InnkeepHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute_command(&engine, cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InnkeepQueryParser;

#[async_trait]
impl QueryParser for InnkeepQueryParser {
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
impl ExtendedQueryHandler for InnkeepHandler {
    type Statement = String;
    type QueryParser = InnkeepQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute_command(&engine, cmd).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Byte ranges of `$N` placeholders outside single-quoted literals, with N.
/// A doubled `''` inside a literal toggles out and back in.
fn placeholders(sql: &str) -> Vec<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                if let Ok(n) = sql[start..end].parse::<usize>() {
                    found.push((i, end, n));
                }
                i = end.max(start);
            }
            _ => i += 1,
        }
    }
    found
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).into_iter().map(|(_, _, n)| n).max().unwrap_or(0)
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let params: Vec<Option<String>> = portal
        .parameters
        .iter()
        .map(|p| p.as_ref().map(|bytes| String::from_utf8_lossy(bytes).into_owned()))
        .collect();
    substitute_text_params(&portal.statement.statement, &params)
}

/// One pass over the statement: bound values are never rescanned, and `$N`
/// inside a literal or without a matching parameter is left as written.
fn substitute_text_params(sql: &str, params: &[Option<String>]) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut copied = 0;
    for (start, end, n) in placeholders(sql) {
        let Some(param) = n.checked_sub(1).and_then(|i| params.get(i)) else {
            continue;
        };
        result.push_str(&sql[copied..start]);
        match param {
            Some(text) => {
                result.push('\'');
                result.push_str(&text.replace('\'', "''"));
                result.push('\'');
            }
            None => result.push_str("NULL"),
        }
        copied = end;
    }
    result.push_str(&sql[copied..]);
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct InnkeepFactory {
    handler: Arc<InnkeepHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<InnkeepAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl InnkeepFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = InnkeepAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(InnkeepHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InnkeepFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = InnkeepFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error("P0001", e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
