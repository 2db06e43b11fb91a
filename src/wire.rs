use std::fmt::Debug;
use std::io;
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
use tracing::debug;

use crate::auth::LendLogAuthSource;
use crate::engine::{ClaimInfo, Engine, EngineError, Evidence, PendingRating, RatingSummary};
use crate::model::*;
use crate::notify::Notification;
use crate::observability;
use crate::sql::{self, Command};

pub struct LendLogHandler {
    engine: Arc<Engine>,
    query_parser: Arc<LendLogQueryParser>,
}

impl LendLogHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(LendLogQueryParser),
        }
    }

    /// Every statement acts on behalf of the user who authenticated the session.
    fn session_user<C: ClientInfo>(&self, client: &C) -> PgWireResult<String> {
        client
            .metadata()
            .get("user")
            .filter(|u| !u.is_empty())
            .cloned()
            .ok_or_else(|| engine_err(EngineError::Unauthenticated))
    }

    async fn run(&self, user: &str, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        debug!(user, command = label, "executing");

        let started = Instant::now();
        let result = self.execute_command(user, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, user: &str, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertItem {
                id,
                name,
                giveaway,
                bounds,
            } => {
                engine
                    .list_item(id, user, name, giveaway, bounds)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteItem { id } => {
                engine.delist_item(id, user).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertUnavailability {
                id,
                start,
                end,
                note,
            } => {
                engine
                    .add_unavailability(id, user, Span { start, end }, note)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteUnavailability { id } => {
                engine
                    .remove_unavailability(id, user)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertClaim {
                id,
                item_id,
                start,
                end,
            } => {
                engine
                    .request_claim(id, item_id, user, Span { start, end })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteClaim { id } => {
                engine.cancel_claim(id, user).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertActivity {
                claim_id,
                kind,
                window_start,
                proposal_id,
                note,
                photos,
            } => {
                self.record_activity(user, claim_id, kind, window_start, proposal_id, Evidence { note, photos })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertAlert { item_id } => {
                engine
                    .set_availability_alert(item_id, user, true)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteAlert { item_id } => {
                engine
                    .set_availability_alert(item_id, user, false)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::DeleteNotifications { id } => {
                let removed = engine.dismiss_notifications(user, id).map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(removed))])
            }
            Command::InsertRating {
                claim_id,
                stars,
                comment,
            } => {
                engine
                    .rate_claim(claim_id, user, stars, comment)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SelectItems => {
                let items = engine.list_items().await;
                let schema = Arc::new(items_schema());
                let rows: Vec<PgWireResult<_>> = items
                    .into_iter()
                    .map(|item| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&item.id.to_string())?;
                        encoder.encode_field(&item.owner_id)?;
                        encoder.encode_field(&item.name)?;
                        encoder.encode_field(&item.giveaway)?;
                        encoder.encode_field(&item.bounds.min_days.map(i64::from))?;
                        encoder.encode_field(&item.bounds.max_days.map(i64::from))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectClaims { item_id } => {
                let claims = match item_id {
                    Some(item_id) => engine.claims_for_item(item_id, user).await,
                    None => engine.claims_for_claimer(user).await,
                }
                .map_err(engine_err)?;
                let schema = Arc::new(claims_schema());
                let rows: Vec<PgWireResult<_>> = claims
                    .into_iter()
                    .map(|info| encode_claim(&schema, info))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectActivity { claim_id } => {
                let activity = engine.lease_activity(claim_id, user).await.map_err(engine_err)?;
                let schema = Arc::new(activity_schema());
                let rows: Vec<PgWireResult<_>> = activity
                    .into_iter()
                    .map(|a| {
                        let photos = serde_json::to_string(&a.photos)
                            .map_err(|e| PgWireError::ApiError(Box::new(e)))?;
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.claim_id.to_string())?;
                        encoder.encode_field(&a.kind.as_str())?;
                        encoder.encode_field(&a.actor_id)?;
                        encoder.encode_field(&a.created_at)?;
                        encoder.encode_field(&a.proposal_id.map(|p| p.to_string()))?;
                        encoder.encode_field(&a.window.map(|w| w.start))?;
                        encoder.encode_field(&a.window.map(|w| w.end))?;
                        encoder.encode_field(&a.note)?;
                        encoder.encode_field(&photos)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAvailability { item_id } => {
                let busy = engine.availability(item_id).await.map_err(engine_err)?;
                Ok(vec![span_rows(item_id, busy)])
            }
            Command::SelectFreeSlots {
                item_id,
                start,
                end,
            } => {
                let free = engine
                    .free_slots(item_id, Span { start, end })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![span_rows(item_id, free)])
            }
            Command::SelectUnavailability => {
                let blocks = engine.owner_unavailability(user).await;
                let schema = Arc::new(unavailability_schema());
                let rows: Vec<PgWireResult<_>> = blocks
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.span.start)?;
                        encoder.encode_field(&b.span.end)?;
                        encoder.encode_field(&b.note)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectNotifications => {
                let inbox = engine.notifications(user).map_err(engine_err)?;
                let schema = Arc::new(notifications_schema());
                let rows: Vec<PgWireResult<_>> = inbox
                    .into_iter()
                    .map(|n| encode_notification(&schema, n))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectRatings { user_id, role } => {
                let ratings = engine.ratings_for_user(user_id.as_deref().unwrap_or(user), role);
                let schema = Arc::new(ratings_schema());
                let rows: Vec<PgWireResult<_>> = ratings
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.claim_id.to_string())?;
                        encoder.encode_field(&r.item_id.to_string())?;
                        encoder.encode_field(&r.from_user_id)?;
                        encoder.encode_field(&r.to_user_id)?;
                        encoder.encode_field(&r.role.as_str())?;
                        encoder.encode_field(&i64::from(r.stars))?;
                        encoder.encode_field(&r.comment)?;
                        encoder.encode_field(&r.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectRatingSummary { user_id } => {
                let summary = engine.rating_summary(user_id.as_deref().unwrap_or(user));
                let schema = Arc::new(rating_summary_schema());
                let rows = vec![encode_rating_summary(&schema, summary)];
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectPendingRatings => {
                let pending = engine.pending_ratings(user).await.map_err(engine_err)?;
                let schema = Arc::new(pending_ratings_schema());
                let rows: Vec<PgWireResult<_>> = pending
                    .into_iter()
                    .map(|p| encode_pending_rating(&schema, p))
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }

    /// Route a `lease_activity` row to the transition it names. Rows the
    /// server writes on its own behalf cannot be inserted by clients.
    async fn record_activity(
        &self,
        user: &str,
        claim_id: ulid::Ulid,
        kind: ActivityKind,
        window_start: Option<Ms>,
        proposal_id: Option<ProposalId>,
        evidence: Evidence,
    ) -> Result<(), EngineError> {
        let engine = &self.engine;
        let require_window = || window_start.ok_or(EngineError::Invalid("window_start is required"));
        match kind {
            ActivityKind::Approved => engine.approve_claim(claim_id, user).await,
            ActivityKind::Rejected => engine.reject_claim(claim_id, user).await,
            ActivityKind::PickupProposed => engine
                .propose_pickup_window(claim_id, user, require_window()?)
                .await
                .map(drop),
            ActivityKind::ReturnProposed => engine
                .propose_return_window(claim_id, user, require_window()?)
                .await
                .map(drop),
            ActivityKind::PickupApproved => engine.approve_pickup_window(claim_id, user, proposal_id).await,
            ActivityKind::ReturnApproved => engine.approve_return_window(claim_id, user, proposal_id).await,
            ActivityKind::PickedUp => engine.confirm_pickup(claim_id, user, evidence).await,
            ActivityKind::Returned => engine.confirm_return(claim_id, user, evidence).await,
            ActivityKind::Expired => engine.mark_expired(claim_id, user, evidence.note).await,
            ActivityKind::Missing => engine.mark_missing(claim_id, user, evidence.note).await,
            ActivityKind::Requested | ActivityKind::Transferred => {
                Err(EngineError::Invalid("activity type is recorded by the server"))
            }
        }
    }
}

fn encode_claim(schema: &Arc<Vec<FieldInfo>>, info: ClaimInfo) -> PgWireResult<pgwire::messages::data::DataRow> {
    let actions: Vec<&str> = info.actions.iter().map(|a| a.as_str()).collect();
    let c = &info.claim;
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&c.id.to_string())?;
    encoder.encode_field(&c.item_id.to_string())?;
    encoder.encode_field(&c.claimer_id)?;
    encoder.encode_field(&c.status.as_str())?;
    encoder.encode_field(&c.span.start)?;
    encoder.encode_field(&c.span.end)?;
    encoder.encode_field(&info.state)?;
    encoder.encode_field(&actions.join(","))?;
    encoder.encode_field(&c.caches.picked_up_at)?;
    encoder.encode_field(&c.caches.returned_at)?;
    Ok(encoder.take_row())
}

fn encode_notification(
    schema: &Arc<Vec<FieldInfo>>,
    n: Notification,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&n.id.to_string())?;
    encoder.encode_field(&n.kind.as_str())?;
    encoder.encode_field(&n.item_id.to_string())?;
    encoder.encode_field(&n.claim_id.map(|c| c.to_string()))?;
    encoder.encode_field(&n.window.map(|w| w.start))?;
    encoder.encode_field(&n.window.map(|w| w.end))?;
    encoder.encode_field(&n.created_at)?;
    Ok(encoder.take_row())
}

fn encode_rating_summary(
    schema: &Arc<Vec<FieldInfo>>,
    s: RatingSummary,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let count = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&s.user_id)?;
    encoder.encode_field(&count(s.total))?;
    encoder.encode_field(&s.average)?;
    encoder.encode_field(&count(s.as_lender.count))?;
    encoder.encode_field(&s.as_lender.average)?;
    encoder.encode_field(&count(s.as_borrower.count))?;
    encoder.encode_field(&s.as_borrower.average)?;
    Ok(encoder.take_row())
}

fn encode_pending_rating(
    schema: &Arc<Vec<FieldInfo>>,
    p: PendingRating,
) -> PgWireResult<pgwire::messages::data::DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&p.claim_id.to_string())?;
    encoder.encode_field(&p.item_id.to_string())?;
    encoder.encode_field(&p.item_name)?;
    encoder.encode_field(&p.target_role.as_str())?;
    encoder.encode_field(&p.target_user_id)?;
    encoder.encode_field(&p.span.start)?;
    encoder.encode_field(&p.span.end)?;
    Ok(encoder.take_row())
}

fn span_rows(item_id: ulid::Ulid, spans: Vec<Span>) -> Response {
    let schema = Arc::new(spans_schema());
    let id_str = item_id.to_string();
    let rows: Vec<PgWireResult<_>> = spans
        .into_iter()
        .map(|span| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&id_str)?;
            encoder.encode_field(&span.start)?;
            encoder.encode_field(&span.end)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn items_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("owner_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("giveaway", Type::BOOL),
        field("min_lease_days", Type::INT8),
        field("max_lease_days", Type::INT8),
    ]
}

fn claims_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("item_id", Type::VARCHAR),
        field("claimer_id", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("state", Type::VARCHAR),
        field("actions", Type::VARCHAR),
        field("picked_up_at", Type::INT8),
        field("returned_at", Type::INT8),
    ]
}

fn activity_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("claim_id", Type::VARCHAR),
        field("type", Type::VARCHAR),
        field("actor_id", Type::VARCHAR),
        field("created_at", Type::INT8),
        field("proposal_id", Type::VARCHAR),
        field("window_start", Type::INT8),
        field("window_end", Type::INT8),
        field("note", Type::VARCHAR),
        field("photos", Type::VARCHAR),
    ]
}

fn spans_schema() -> Vec<FieldInfo> {
    vec![
        field("item_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn unavailability_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
        field("note", Type::VARCHAR),
    ]
}

fn notifications_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("item_id", Type::VARCHAR),
        field("claim_id", Type::VARCHAR),
        field("window_start", Type::INT8),
        field("window_end", Type::INT8),
        field("created_at", Type::INT8),
    ]
}

fn ratings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("claim_id", Type::VARCHAR),
        field("item_id", Type::VARCHAR),
        field("from_user_id", Type::VARCHAR),
        field("to_user_id", Type::VARCHAR),
        field("role", Type::VARCHAR),
        field("stars", Type::INT8),
        field("comment", Type::VARCHAR),
        field("created_at", Type::INT8),
    ]
}

fn rating_summary_schema() -> Vec<FieldInfo> {
    vec![
        field("user_id", Type::VARCHAR),
        field("total_ratings", Type::INT8),
        field("average_stars", Type::FLOAT8),
        field("lender_count", Type::INT8),
        field("lender_average", Type::FLOAT8),
        field("borrower_count", Type::INT8),
        field("borrower_average", Type::FLOAT8),
    ]
}

fn pending_ratings_schema() -> Vec<FieldInfo> {
    vec![
        field("claim_id", Type::VARCHAR),
        field("item_id", Type::VARCHAR),
        field("item_name", Type::VARCHAR),
        field("target_role", Type::VARCHAR),
        field("target_user_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

/// Result columns of a statement, judged from the table it selects from.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match select_table(sql).as_deref() {
        Some("items") => items_schema(),
        Some("claims") => claims_schema(),
        Some("lease_activity") => activity_schema(),
        Some("availability") | Some("free_slots") => spans_schema(),
        Some("unavailability") => unavailability_schema(),
        Some("notifications") => notifications_schema(),
        Some("ratings") => ratings_schema(),
        Some("rating_summary") => rating_summary_schema(),
        Some("pending_ratings") => pending_ratings_schema(),
        _ => vec![],
    }
}

fn select_table(sql: &str) -> Option<String> {
    let lower = sql.trim_start().to_lowercase();
    if !lower.starts_with("select") {
        return None;
    }
    let mut tokens = lower.split_whitespace();
    tokens.find(|t| *t == "from")?;
    tokens
        .next()
        .map(|t| t.trim_matches(|c| c == '"' || c == ';').to_string())
}

#[async_trait]
impl SimpleQueryHandler for LendLogHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let user = self.session_user(client)?;
        self.run(&user, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct LendLogQueryParser;

#[async_trait]
impl QueryParser for LendLogQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for LendLogHandler {
    type Statement = String;
    type QueryParser = LendLogQueryParser;

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
        let user = self.session_user(client)?;
        let sql = substitute_params(portal);
        let mut responses = self.run(&user, &sql).await?;
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

/// Highest `$N` placeholder in the statement.
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

/// Inline bound text parameters as quoted literals. Higher numbers go
/// first so `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct LendLogFactory {
    handler: Arc<LendLogHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<LendLogAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl LendLogFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(LendLogHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                LendLogAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for LendLogFactory {
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

/// Serve one client socket until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(LendLogFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory)
        .await
        .map_err(|e| io::Error::other(e.to_string()))
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
