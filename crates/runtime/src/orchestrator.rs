//! Workflow orchestrator.
//!
//! Drives the full pipeline per session: understanding -> join inference
//! -> SQL generation/validation/execution -> completion. Ambiguity is a
//! suspend point (the session parks in AwaitingCorrection), statement
//! failures feed a bounded refinement loop, and fatal or exhausted
//! external faults park the session in Interrupted for later resumption.
//!
//! Intra-session execution is strictly sequential: the session object is
//! exclusively owned by the running workflow, and checkpoint saves are the
//! only synchronization with the outside world.

use crate::llm::RetryingLlmClient;
use crate::retry::{Checkpointer, RetryContext, RetryCoordinator, RetryError};
use nlq_core::{
    AttemptResult, Correction, EngineError, ExecutionResult, FailureSummary, InvalidTransition,
    LlmClient, LlmError, MessageRole, NlqConfig, Phase, QueryEngine, Schema, Session,
    SessionStatus,
};
use nlq_persistence::{RetentionPolicy, SessionStore, SessionSummary, StoreError};
use nlq_reasoning::{
    InferenceOutcome, JoinInference, QueryUnderstanding, ReasoningError, SqlGenerator,
    UnderstandingOutcome,
};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, info, warn};

/// Discriminated error kind returned to callers. No unstructured errors
/// cross this boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Ambiguity,
    InferenceError,
    MaxIterations,
    MaxCorrections,
    RetryExhausted,
    LlmFailure,
    EngineFailure,
    ValidationFailed,
    ProcessingFailed,
    SessionNotFound,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Ambiguity => "ambiguity",
            ErrorKind::InferenceError => "inference_error",
            ErrorKind::MaxIterations => "max_iterations",
            ErrorKind::MaxCorrections => "max_corrections",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::LlmFailure => "llm_failure",
            ErrorKind::EngineFailure => "engine_failure",
            ErrorKind::ValidationFailed => "validation_failed",
            ErrorKind::ProcessingFailed => "processing_failed",
            ErrorKind::SessionNotFound => "session_not_found",
        };
        f.write_str(name)
    }
}

/// Response shape for `submit` and `resume`.
#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub success: bool,
    pub session_id: String,
    pub sql: Option<String>,
    pub results: Option<ExecutionResult>,
    pub error: Option<ErrorKind>,
    pub message: Option<String>,
    /// Populated only for ambiguity.
    pub options: Option<Vec<String>>,
    pub failure_summary: Option<FailureSummary>,
}

impl QueryResponse {
    fn completed(session_id: String, sql: String, results: Option<ExecutionResult>) -> Self {
        Self {
            success: true,
            session_id,
            sql: Some(sql),
            results,
            error: None,
            message: None,
            options: None,
            failure_summary: None,
        }
    }

    fn failed(session_id: String, error: ErrorKind, message: String) -> Self {
        Self {
            success: false,
            session_id,
            sql: None,
            results: None,
            error: Some(error),
            message: Some(message),
            options: None,
            failure_summary: None,
        }
    }
}

/// Internal workflow failure, mapped onto `ErrorKind` at the boundary.
#[derive(Debug, Error)]
enum WorkflowError {
    #[error("no tables identified for the request")]
    NoTables,

    #[error("maximum iterations ({0}) reached")]
    MaxIterations(u32),

    #[error(transparent)]
    Inference(ReasoningError),

    #[error("statement failed after {attempts} attempts: {last_error}")]
    StatementExhausted { attempts: u32, last_error: String },

    #[error(transparent)]
    Llm(LlmError),

    #[error(transparent)]
    Engine(EngineError),

    #[error("engine retry attempts exhausted after {attempts} attempts: {message}")]
    EngineExhausted { attempts: u32, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

/// Successful or suspended workflow run.
enum WorkflowOutcome {
    Done {
        sql: String,
        results: Option<ExecutionResult>,
    },
    Ambiguous {
        message: String,
        options: Vec<String>,
    },
}

/// Engine call failures split by whether refining the statement can help.
enum EngineFailure {
    Statement(String),
    Fault(WorkflowError),
}

/// Persists the session around every retried external call, and records
/// in-flight retry notices as system messages.
struct SessionCheckpointer {
    session: Arc<Mutex<Session>>,
    store: Arc<dyn SessionStore>,
}

#[async_trait::async_trait]
impl Checkpointer for SessionCheckpointer {
    async fn checkpoint(&self, ctx: &RetryContext) {
        let snapshot = {
            let mut session = self.session.lock().unwrap();
            if let Some(last_error) = &ctx.last_error {
                let notice = if ctx.finished {
                    format!(
                        "{} failed after {} attempt(s): {}",
                        ctx.operation, ctx.attempt, last_error
                    )
                } else {
                    format!(
                        "{} failed (attempt {}): {}. Retrying...",
                        ctx.operation,
                        ctx.attempt - 1,
                        last_error
                    )
                };
                session.add_message(MessageRole::System, notice);
            }
            session.touch();
            session.clone()
        };

        if let Err(e) = self.store.save(&snapshot).await {
            error!(error = %e, "checkpoint save failed");
        }
    }
}

pub struct Orchestrator {
    schema: Arc<Schema>,
    llm: Arc<dyn LlmClient>,
    engine: Arc<dyn QueryEngine>,
    store: Arc<dyn SessionStore>,
    config: NlqConfig,
    coordinator: RetryCoordinator,
    understanding: QueryUnderstanding,
    inference: JoinInference,
    generator: SqlGenerator,
}

impl Orchestrator {
    pub fn new(
        schema: Arc<Schema>,
        llm: Arc<dyn LlmClient>,
        engine: Arc<dyn QueryEngine>,
        store: Arc<dyn SessionStore>,
        config: &NlqConfig,
    ) -> Self {
        Self {
            understanding: QueryUnderstanding::new(schema.clone(), &config.agent),
            inference: JoinInference::new(schema.clone(), config.agent.confidence_threshold),
            generator: SqlGenerator::new(schema.clone()),
            coordinator: RetryCoordinator::new(config.retry.clone()),
            schema,
            llm,
            engine,
            store,
            config: config.clone(),
        }
    }

    /// Process a natural-language request end to end.
    pub async fn submit(&self, request: &str, execute: bool) -> QueryResponse {
        info!(request = request, "processing query");

        let session = match self.store.create(request).await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "failed to create session");
                return QueryResponse::failed(
                    String::new(),
                    ErrorKind::ProcessingFailed,
                    e.to_string(),
                );
            }
        };
        let session_id = session.session_id.clone();
        let session = Arc::new(Mutex::new(session));

        {
            let mut s = session.lock().unwrap();
            s.schema_snapshot = serde_json::to_value(self.schema.as_ref()).ok();
            s.add_message(MessageRole::User, request);
        }
        self.checkpoint(&session).await;

        let result = self.run_workflow(&session, execute).await;
        self.conclude(session, session_id, result).await
    }

    /// Resume a suspended session with a user correction.
    pub async fn resume(&self, session_id: &str, correction: &str, execute: bool) -> QueryResponse {
        info!(session_id = session_id, "resuming session with correction");

        let mut session = match self.store.load(session_id).await {
            Ok(session) => session,
            Err(StoreError::SessionNotFound(id)) => {
                return QueryResponse::failed(
                    session_id.to_string(),
                    ErrorKind::SessionNotFound,
                    format!("session not found: {}", id),
                );
            }
            Err(e) => {
                return QueryResponse::failed(
                    session_id.to_string(),
                    ErrorKind::ProcessingFailed,
                    e.to_string(),
                );
            }
        };

        let max_corrections = self.config.agent.max_correction_attempts;
        if session.correction_attempt >= max_corrections {
            return QueryResponse::failed(
                session_id.to_string(),
                ErrorKind::MaxCorrections,
                format!("maximum correction attempts ({}) reached", max_corrections),
            );
        }

        if session.state_machine.is_terminal() {
            return QueryResponse::failed(
                session_id.to_string(),
                ErrorKind::ProcessingFailed,
                format!("session is already {}", session.status()),
            );
        }

        let parsed = Correction::parse(correction);
        session.add_message(MessageRole::User, correction);
        session.add_correction(parsed);
        session.increment_correction_attempt();

        if let Err(e) = session.state_machine.transition_to(
            Phase::QueryUnderstanding,
            Some("restarting with user correction".to_string()),
            HashMap::new(),
        ) {
            return QueryResponse::failed(
                session_id.to_string(),
                ErrorKind::ProcessingFailed,
                e.to_string(),
            );
        }
        // A correction restarts the pipeline from scratch.
        session.iteration_count = 0;
        session.touch();

        let session = Arc::new(Mutex::new(session));
        self.checkpoint(&session).await;

        let result = self.run_workflow(&session, execute).await;
        self.conclude(session, session_id.to_string(), result).await
    }

    /// List stored sessions, newest first.
    pub async fn list_sessions(
        &self,
        status_filter: Option<SessionStatus>,
        limit: usize,
    ) -> Result<Vec<SessionSummary>, StoreError> {
        self.store.list(status_filter, limit).await
    }

    /// Delete terminal sessions past their retention age.
    pub async fn sweep_expired(&self) -> Result<usize, StoreError> {
        self.store
            .cleanup(RetentionPolicy::from(&self.config.storage))
            .await
    }

    async fn run_workflow(
        &self,
        session: &Arc<Mutex<Session>>,
        execute: bool,
    ) -> Result<WorkflowOutcome, WorkflowError> {
        let (query, phase, iterations) = {
            let s = session.lock().unwrap();
            (
                s.original_query.clone(),
                s.state_machine.current(),
                s.iteration_count,
            )
        };

        if iterations >= self.config.agent.max_iterations {
            return Err(WorkflowError::MaxIterations(
                self.config.agent.max_iterations,
            ));
        }

        if phase == Phase::Initializing {
            self.transition(session, Phase::SchemaLoading, "loading relation catalog")
                .await?;
        }
        if self.current_phase(session) == Phase::SchemaLoading {
            self.transition(session, Phase::QueryUnderstanding, "analyzing user query")
                .await?;
        }

        let checkpointer: Arc<dyn Checkpointer> = Arc::new(SessionCheckpointer {
            session: session.clone(),
            store: self.store.clone(),
        });
        let llm = RetryingLlmClient::new(
            self.llm.clone(),
            self.coordinator.clone(),
            checkpointer.clone(),
        );

        // Step 1: query understanding
        let constraints = session.lock().unwrap().hard_constraints.clone();
        let understanding = match self.understanding.analyze(&llm, &query, &constraints).await {
            UnderstandingOutcome::Ready(understanding) => understanding,
            UnderstandingOutcome::AmbiguousTables { term, options } => {
                self.transition(session, Phase::AwaitingCorrection, "ambiguous table reference")
                    .await?;
                return Ok(WorkflowOutcome::Ambiguous {
                    message: format!("table reference '{}' matches several tables", term),
                    options,
                });
            }
        };

        {
            let mut s = session.lock().unwrap();
            s.identified_tables = understanding.tables.clone();
        }
        self.checkpoint(session).await;

        if understanding.tables.is_empty() {
            return Err(WorkflowError::NoTables);
        }
        info!(tables = ?understanding.tables, "identified tables");

        // Step 2: join inference for every unordered table pair
        let mut joins = Vec::new();
        if understanding.joins_needed && understanding.tables.len() >= 2 {
            self.transition(session, Phase::JoinInference, "determining table relationships")
                .await?;

            let tables = &understanding.tables;
            for i in 0..tables.len() {
                for j in (i + 1)..tables.len() {
                    match self
                        .inference
                        .infer(&llm, &tables[i], &tables[j], &constraints)
                        .await
                    {
                        Ok(InferenceOutcome::Resolved(mut found)) => {
                            if let Some(top) = found.first() {
                                info!(join = %top, "found join");
                            }
                            joins.append(&mut found);
                        }
                        Ok(InferenceOutcome::Ambiguous { options, .. }) => {
                            // Suspend point: never retried, never resolved
                            // automatically.
                            self.transition(
                                session,
                                Phase::AwaitingCorrection,
                                "ambiguity requires user clarification",
                            )
                            .await?;
                            return Ok(WorkflowOutcome::Ambiguous {
                                message: format!(
                                    "multiple possible joins found between {} and {}",
                                    tables[i], tables[j]
                                ),
                                options,
                            });
                        }
                        Err(ReasoningError::Llm(e)) => return Err(WorkflowError::Llm(e)),
                        Err(e) => return Err(WorkflowError::Inference(e)),
                    }
                }
            }

            {
                let mut s = session.lock().unwrap();
                s.inferred_joins = joins.clone();
            }
            self.checkpoint(session).await;
        }

        // Step 3: bounded generation/validation/execution loop
        self.transition(session, Phase::GeneratingSql, "creating SQL statement")
            .await?;
        {
            let mut s = session.lock().unwrap();
            s.increment_iteration();
        }

        let max_attempts = self.config.agent.max_sql_attempts;
        let tables = understanding.tables.clone();
        let mut last_sql: Option<String> = None;
        let mut last_error: Option<String> = None;

        for attempt in 1..=max_attempts {
            info!(attempt = attempt, max_attempts = max_attempts, "SQL attempt");

            if self.current_phase(session) == Phase::ExecutingQuery {
                self.transition(session, Phase::GeneratingSql, "refining after error")
                    .await?;
            }

            let generated = match (&last_sql, &last_error) {
                (Some(previous), Some(error)) => {
                    self.generator
                        .refine(
                            &llm,
                            &query,
                            &tables,
                            previous,
                            error,
                            attempt,
                            &joins,
                            &constraints,
                        )
                        .await
                }
                _ => {
                    self.generator
                        .generate(&llm, &query, &tables, &joins, &constraints)
                        .await
                }
            };

            let sql = match generated {
                Ok(sql) => sql,
                Err(ReasoningError::Llm(e)) => match e {
                    // A malformed response is a generation-quality problem:
                    // record the attempt and refine.
                    LlmError::InvalidResponse { message } => {
                        self.record_failed_attempt(session, "GENERATION_FAILED", &message)
                            .await;
                        last_error = Some(message);
                        continue;
                    }
                    other => return Err(WorkflowError::Llm(other)),
                },
                Err(ReasoningError::SqlExtraction { snippet }) => {
                    let message = format!("could not extract SQL: {}", snippet);
                    self.record_failed_attempt(session, "GENERATION_FAILED", &message)
                        .await;
                    last_error = Some(message);
                    continue;
                }
                Err(e) => return Err(WorkflowError::Inference(e)),
            };

            if !execute {
                {
                    let mut s = session.lock().unwrap();
                    s.add_sql_attempt(&sql, true, None, None);
                }
                self.transition(session, Phase::ExecutingQuery, "execution not requested")
                    .await?;
                self.transition(session, Phase::Completed, "SQL generated")
                    .await?;
                return Ok(WorkflowOutcome::Done { sql, results: None });
            }

            self.transition(
                session,
                Phase::ExecutingQuery,
                &format!("running query (attempt {})", attempt),
            )
            .await?;

            // Validate (side-effect-free dry run) before executing.
            match self
                .engine_call(checkpointer.as_ref(), "engine_validate", || {
                    self.engine.validate(&sql)
                })
                .await
            {
                Ok(report) => {
                    info!(bytes_scanned = report.bytes_scanned, "statement validated");
                }
                Err(EngineFailure::Statement(message)) => {
                    let message = format!("Validation: {}", message);
                    warn!(error = %message, "validation failed");
                    self.record_failed_attempt(session, &sql, &message).await;
                    last_sql = Some(sql);
                    last_error = Some(message);
                    continue;
                }
                Err(EngineFailure::Fault(e)) => return Err(e),
            }

            match self
                .engine_call(checkpointer.as_ref(), "engine_execute", || {
                    self.engine.execute(&sql, None)
                })
                .await
            {
                Ok(results) => {
                    {
                        let mut s = session.lock().unwrap();
                        s.add_sql_attempt(
                            &sql,
                            true,
                            None,
                            Some(AttemptResult {
                                row_count: results.row_count,
                                bytes_scanned: results.bytes_scanned,
                            }),
                        );
                    }
                    self.transition(
                        session,
                        Phase::Completed,
                        "successfully generated and executed SQL",
                    )
                    .await?;
                    info!(row_count = results.row_count, "query completed");
                    return Ok(WorkflowOutcome::Done {
                        sql,
                        results: Some(results),
                    });
                }
                Err(EngineFailure::Statement(message)) => {
                    let message = format!("Execution: {}", message);
                    warn!(error = %message, "execution failed");
                    self.record_failed_attempt(session, &sql, &message).await;
                    last_sql = Some(sql);
                    last_error = Some(message);
                    continue;
                }
                Err(EngineFailure::Fault(e)) => return Err(e),
            }
        }

        Err(WorkflowError::StatementExhausted {
            attempts: max_attempts,
            last_error: last_error.unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    /// Map the workflow result onto the response shape, applying terminal
    /// transitions and failure summaries.
    async fn conclude(
        &self,
        session: Arc<Mutex<Session>>,
        session_id: String,
        result: Result<WorkflowOutcome, WorkflowError>,
    ) -> QueryResponse {
        match result {
            Ok(WorkflowOutcome::Done { sql, results }) => {
                self.checkpoint(&session).await;
                QueryResponse::completed(session_id, sql, results)
            }
            Ok(WorkflowOutcome::Ambiguous { message, options }) => {
                self.checkpoint(&session).await;
                let mut response =
                    QueryResponse::failed(session_id, ErrorKind::Ambiguity, message);
                response.options = Some(options);
                response
            }
            Err(e) => {
                let message = e.to_string();
                let (kind, target) = match &e {
                    WorkflowError::NoTables => (ErrorKind::ProcessingFailed, Phase::Failed),
                    WorkflowError::MaxIterations(_) => (ErrorKind::MaxIterations, Phase::Failed),
                    WorkflowError::Inference(ReasoningError::NoJoinFound { .. }) => {
                        (ErrorKind::InferenceError, Phase::Failed)
                    }
                    WorkflowError::Inference(_) => (ErrorKind::ProcessingFailed, Phase::Failed),
                    WorkflowError::StatementExhausted { .. } => {
                        (ErrorKind::ValidationFailed, Phase::Failed)
                    }
                    WorkflowError::Llm(LlmError::RetryExhausted { .. }) => {
                        (ErrorKind::RetryExhausted, Phase::Interrupted)
                    }
                    WorkflowError::Llm(_) => (ErrorKind::LlmFailure, Phase::Interrupted),
                    WorkflowError::Engine(_) => (ErrorKind::EngineFailure, Phase::Interrupted),
                    WorkflowError::EngineExhausted { .. } => {
                        (ErrorKind::RetryExhausted, Phase::Interrupted)
                    }
                    WorkflowError::Store(_) => (ErrorKind::ProcessingFailed, Phase::Failed),
                    WorkflowError::Transition(_) => (ErrorKind::ProcessingFailed, Phase::Failed),
                };

                error!(kind = %kind, error = %message, "workflow failed");

                let summary = {
                    let mut s = session.lock().unwrap();
                    if let Err(te) = s.state_machine.transition_to(
                        target,
                        Some(message.clone()),
                        HashMap::new(),
                    ) {
                        warn!(error = %te, "could not record terminal transition");
                    }
                    if target == Phase::Failed {
                        let summary = self.failure_summary(&s, &message);
                        s.set_failure_summary(summary.clone());
                        Some(summary)
                    } else {
                        s.touch();
                        None
                    }
                };
                self.checkpoint(&session).await;

                let mut response = QueryResponse::failed(session_id, kind, message);
                response.failure_summary = summary;
                response
            }
        }
    }

    fn failure_summary(&self, session: &Session, error: &str) -> FailureSummary {
        FailureSummary {
            user_query: session.original_query.clone(),
            identified_tables: session.identified_tables.clone(),
            attempted_iterations: session.iteration_count,
            correction_attempts: session.correction_attempt,
            error: error.to_string(),
            sql_attempts: session.sql_attempts.len(),
            recommendations: self.recommendations(session, error),
        }
    }

    /// Textual recommendations derived from simple error classification.
    fn recommendations(&self, session: &Session, error: &str) -> Vec<String> {
        let error_lower = error.to_lowercase();
        let mut recommendations = Vec::new();

        if error_lower.contains("ambigu") {
            recommendations
                .push("Provide clarification on the ambiguous tables or joins".to_string());
        }
        if session.identified_tables.is_empty() {
            recommendations.push(
                "Try rephrasing the query with more specific table or entity names".to_string(),
            );
        }
        if session.correction_attempt >= self.config.agent.max_correction_attempts {
            recommendations.push("Consider writing the SQL query manually".to_string());
        }
        if error_lower.contains("validation") {
            recommendations.push("Check SQL syntax and table/column names".to_string());
        }

        recommendations
    }

    /// Run an engine call under the retry policy and split the failure by
    /// whether refinement can help.
    async fn engine_call<T, Op, Fut>(
        &self,
        checkpointer: &dyn Checkpointer,
        operation: &str,
        op: Op,
    ) -> Result<T, EngineFailure>
    where
        Op: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, EngineError>> + Send,
    {
        match self.coordinator.execute(operation, checkpointer, op).await {
            Ok(value) => Ok(value),
            Err(RetryError::Fatal(e)) if e.is_statement_fault() => {
                Err(EngineFailure::Statement(e.to_string()))
            }
            Err(RetryError::Fatal(e)) => Err(EngineFailure::Fault(WorkflowError::Engine(e))),
            Err(RetryError::Exhausted { attempts, last }) => {
                Err(EngineFailure::Fault(WorkflowError::EngineExhausted {
                    attempts,
                    message: last.to_string(),
                }))
            }
        }
    }

    async fn record_failed_attempt(
        &self,
        session: &Arc<Mutex<Session>>,
        sql: &str,
        error: &str,
    ) {
        {
            let mut s = session.lock().unwrap();
            s.add_sql_attempt(sql, false, Some(error.to_string()), None);
        }
        self.checkpoint(session).await;
    }

    fn current_phase(&self, session: &Arc<Mutex<Session>>) -> Phase {
        session.lock().unwrap().state_machine.current()
    }

    /// Record a transition and persist the session.
    async fn transition(
        &self,
        session: &Arc<Mutex<Session>>,
        target: Phase,
        reason: &str,
    ) -> Result<(), WorkflowError> {
        let snapshot = {
            let mut s = session.lock().unwrap();
            s.state_machine
                .transition_to(target, Some(reason.to_string()), HashMap::new())?;
            s.touch();
            s.clone()
        };
        self.store.save(&snapshot).await?;
        Ok(())
    }

    /// Best-effort persistence of the current session state.
    async fn checkpoint(&self, session: &Arc<Mutex<Session>>) {
        let snapshot = session.lock().unwrap().clone();
        if let Err(e) = self.store.save(&snapshot).await {
            error!(error = %e, "failed to persist session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nlq_core::{
        Column, ColumnType, LlmError, Message, RetrySettings, Table, ValidationReport,
    };
    use nlq_persistence::JsonSessionStore;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MockLlm {
        structured: Mutex<VecDeque<Result<serde_json::Value, LlmError>>>,
        completions: Mutex<VecDeque<Result<String, LlmError>>>,
    }

    impl MockLlm {
        fn new() -> Self {
            Self {
                structured: Mutex::new(VecDeque::new()),
                completions: Mutex::new(VecDeque::new()),
            }
        }

        fn push_structured(&self, value: serde_json::Value) {
            self.structured.lock().unwrap().push_back(Ok(value));
        }

        fn push_completion(&self, result: Result<String, LlmError>) {
            self.completions.lock().unwrap().push_back(result);
        }
    }

    #[async_trait::async_trait]
    impl LlmClient for MockLlm {
        async fn complete(
            &self,
            _messages: &[Message],
            _temperature: Option<f32>,
        ) -> Result<String, LlmError> {
            self.completions
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected complete call")
        }

        async fn complete_structured(
            &self,
            _schema: &serde_json::Value,
            _messages: &[Message],
        ) -> Result<serde_json::Value, LlmError> {
            self.structured
                .lock()
                .unwrap()
                .pop_front()
                .expect("unexpected complete_structured call")
        }
    }

    struct MockEngine {
        validate_failures: AtomicU32,
        row_count: u64,
    }

    impl MockEngine {
        fn new(validate_failures: u32, row_count: u64) -> Self {
            Self {
                validate_failures: AtomicU32::new(validate_failures),
                row_count,
            }
        }
    }

    #[async_trait::async_trait]
    impl QueryEngine for MockEngine {
        async fn validate(&self, _sql: &str) -> Result<ValidationReport, EngineError> {
            if self.validate_failures.load(Ordering::SeqCst) > 0 {
                self.validate_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(EngineError::InvalidQuery {
                    message: "unknown column `bad`".to_string(),
                });
            }
            Ok(ValidationReport { bytes_scanned: 512 })
        }

        async fn execute(
            &self,
            _sql: &str,
            _max_rows: Option<u64>,
        ) -> Result<ExecutionResult, EngineError> {
            Ok(ExecutionResult {
                rows: Vec::new(),
                row_count: self.row_count,
                bytes_scanned: 512,
            })
        }
    }

    fn test_schema() -> Schema {
        let mut schema = Schema::new();

        let mut customers = Table::new("customers");
        let mut id = Column::new("customer_id", ColumnType::Integer);
        id.is_primary = true;
        customers.add_column(id);
        customers.add_column(Column::new("name", ColumnType::String));
        schema.add_table(customers);

        let mut orders = Table::new("orders");
        // Names chosen so no heuristic pair clears the 0.5 floor: the
        // reasoning service decides the join.
        orders.add_column(Column::new("buyer_ref", ColumnType::Integer));
        orders.add_column(Column::new("total", ColumnType::Float));
        schema.add_table(orders);

        schema
    }

    fn test_config() -> NlqConfig {
        let mut config = NlqConfig::default();
        config.retry = RetrySettings {
            max_attempts: 2,
            base_delay_secs: 0.0,
            max_delay_secs: 0.0,
            multiplier: 2.0,
            jitter: false,
        };
        config
    }

    async fn build(
        llm: Arc<MockLlm>,
        engine: MockEngine,
        config: NlqConfig,
    ) -> (tempfile::TempDir, Arc<JsonSessionStore>, Orchestrator) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            JsonSessionStore::new(dir.path().join("sessions"))
                .await
                .unwrap(),
        );
        let orchestrator = Orchestrator::new(
            Arc::new(test_schema()),
            llm,
            Arc::new(engine),
            store.clone(),
            &config,
        );
        (dir, store, orchestrator)
    }

    fn single_table_understanding() -> serde_json::Value {
        json!({
            "tables": ["customers"],
            "columns": ["customers.name"],
            "joins_needed": false
        })
    }

    fn two_table_understanding() -> serde_json::Value {
        json!({
            "tables": ["customers", "orders"],
            "columns": [],
            "joins_needed": true
        })
    }

    #[tokio::test]
    async fn test_submit_happy_path() {
        let llm = Arc::new(MockLlm::new());
        llm.push_structured(single_table_understanding());
        llm.push_completion(Ok("```sql\nSELECT name FROM customers\n```".to_string()));

        let (_dir, store, orchestrator) = build(llm, MockEngine::new(0, 7), test_config()).await;
        let response = orchestrator.submit("list customer names", true).await;

        assert!(response.success, "response: {:?}", response.message);
        assert_eq!(response.sql.as_deref(), Some("SELECT name\nFROM customers"));
        assert_eq!(response.results.unwrap().row_count, 7);
        assert!(response.error.is_none());

        let session = store.load(&response.session_id).await.unwrap();
        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.final_sql(), Some("SELECT name\nFROM customers"));
        assert_eq!(session.identified_tables, vec!["customers"]);
        assert_eq!(session.iteration_count, 1);
        assert!(session.schema_snapshot.is_some());
        // Full transition history was recorded and persisted.
        let phases: Vec<Phase> = session
            .state_machine
            .transitions()
            .iter()
            .map(|t| t.to)
            .collect();
        assert_eq!(
            phases,
            vec![
                Phase::SchemaLoading,
                Phase::QueryUnderstanding,
                Phase::GeneratingSql,
                Phase::ExecutingQuery,
                Phase::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn test_generate_only_mode() {
        let llm = Arc::new(MockLlm::new());
        llm.push_structured(single_table_understanding());
        llm.push_completion(Ok("SELECT name FROM customers".to_string()));

        let (_dir, store, orchestrator) = build(llm, MockEngine::new(0, 0), test_config()).await;
        let response = orchestrator.submit("list customer names", false).await;

        assert!(response.success);
        assert!(response.results.is_none());

        let session = store.load(&response.session_id).await.unwrap();
        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.sql_attempts.len(), 1);
        assert!(session.sql_attempts[0].success);
    }

    #[tokio::test]
    async fn test_ambiguous_joins_suspend_session() {
        let llm = Arc::new(MockLlm::new());
        llm.push_structured(two_table_understanding());
        // No heuristic candidate clears the floor, so the service is
        // consulted and reports two rivals within the ambiguity window.
        llm.push_structured(json!({
            "found_joins": true,
            "joins": [
                {"left_column": "customer_id", "right_column": "buyer_ref", "confidence": 0.82},
                {"left_column": "customer_id", "right_column": "total", "confidence": 0.79}
            ]
        }));

        let (_dir, store, orchestrator) = build(llm, MockEngine::new(0, 0), test_config()).await;
        let response = orchestrator.submit("revenue per customer", true).await;

        assert!(!response.success);
        assert_eq!(response.error, Some(ErrorKind::Ambiguity));
        let options = response.options.unwrap();
        assert_eq!(options.len(), 2);

        let session = store.load(&response.session_id).await.unwrap();
        assert_eq!(session.status(), SessionStatus::AwaitingCorrection);
        // Ambiguity is a pause, not a failure.
        assert!(session.failure_summary.is_none());
    }

    #[tokio::test]
    async fn test_resume_with_correction_restarts_pipeline() {
        let llm = Arc::new(MockLlm::new());
        llm.push_structured(two_table_understanding());
        llm.push_structured(json!({
            "found_joins": true,
            "joins": [
                {"left_column": "customer_id", "right_column": "buyer_ref", "confidence": 0.82},
                {"left_column": "customer_id", "right_column": "total", "confidence": 0.79}
            ]
        }));

        let (_dir, store, orchestrator) = build(llm.clone(), MockEngine::new(0, 3), test_config()).await;
        let suspended = orchestrator.submit("revenue per customer", true).await;
        assert_eq!(suspended.error, Some(ErrorKind::Ambiguity));

        // The corrected rerun: constraint forces the service, which now
        // returns a single confident join.
        llm.push_structured(two_table_understanding());
        llm.push_structured(json!({
            "found_joins": true,
            "joins": [
                {"left_column": "customer_id", "right_column": "buyer_ref", "confidence": 0.95}
            ]
        }));
        llm.push_completion(Ok(
            "SELECT c.name, SUM(o.total) FROM customers c JOIN orders o ON c.customer_id = o.buyer_ref GROUP BY c.name"
                .to_string(),
        ));

        let response = orchestrator
            .resume(
                &suspended.session_id,
                "join customers.customer_id with orders.buyer_ref",
                true,
            )
            .await;

        assert!(response.success, "response: {:?}", response.message);

        let session = store.load(&response.session_id).await.unwrap();
        assert_eq!(session.status(), SessionStatus::Completed);
        assert_eq!(session.correction_attempt, 1);
        assert_eq!(session.corrections.len(), 1);
        // The iteration counter was reset before the rerun.
        assert_eq!(session.iteration_count, 1);
        assert!(session
            .hard_constraints
            .iter()
            .any(|c| c.contains("customers.customer_id = orders.buyer_ref")));
        // The restart transition is on record.
        assert!(session
            .state_machine
            .transitions()
            .iter()
            .any(|t| t.from == Phase::AwaitingCorrection && t.to == Phase::QueryUnderstanding));
        assert_eq!(session.inferred_joins.len(), 1);
    }

    #[tokio::test]
    async fn test_table_selection_correction_constraint() {
        let llm = Arc::new(MockLlm::new());
        llm.push_structured(two_table_understanding());
        llm.push_structured(json!({
            "found_joins": true,
            "joins": [
                {"left_column": "customer_id", "right_column": "buyer_ref", "confidence": 0.82},
                {"left_column": "customer_id", "right_column": "total", "confidence": 0.79}
            ]
        }));

        let (_dir, store, orchestrator) = build(llm.clone(), MockEngine::new(0, 0), test_config()).await;
        let suspended = orchestrator.submit("revenue per customer", true).await;

        llm.push_structured(single_table_understanding());
        llm.push_completion(Ok("SELECT name FROM customers".to_string()));

        let response = orchestrator
            .resume(&suspended.session_id, "use customers instead of orders", true)
            .await;
        assert!(response.success);

        let session = store.load(&response.session_id).await.unwrap();
        // Choosing customers over orders appends a constraint naming the
        // selected table, resets the iteration counter, and restarted the
        // pipeline at query understanding.
        assert!(session
            .hard_constraints
            .iter()
            .any(|c| c.contains("Use table 'customers'") && c.contains("DO NOT use: orders")));
    }

    #[tokio::test]
    async fn test_no_plausible_join_is_inference_error() {
        let llm = Arc::new(MockLlm::new());
        llm.push_structured(two_table_understanding());
        llm.push_structured(json!({"found_joins": false, "joins": []}));

        let (_dir, store, orchestrator) = build(llm, MockEngine::new(0, 0), test_config()).await;
        let response = orchestrator.submit("revenue per customer", true).await;

        assert!(!response.success);
        assert_eq!(response.error, Some(ErrorKind::InferenceError));

        let session = store.load(&response.session_id).await.unwrap();
        assert_eq!(session.status(), SessionStatus::Failed);
        assert!(session.inferred_joins.is_empty());
        assert!(session.failure_summary.is_some());
    }

    #[tokio::test]
    async fn test_validation_failure_feeds_refinement() {
        let llm = Arc::new(MockLlm::new());
        llm.push_structured(single_table_understanding());
        llm.push_completion(Ok("SELECT bad FROM customers".to_string()));
        llm.push_completion(Ok("SELECT name FROM customers".to_string()));

        // First validation fails, second succeeds.
        let (_dir, store, orchestrator) = build(llm, MockEngine::new(1, 2), test_config()).await;
        let response = orchestrator.submit("list customer names", true).await;

        assert!(response.success, "response: {:?}", response.message);
        assert_eq!(response.sql.as_deref(), Some("SELECT name\nFROM customers"));

        let session = store.load(&response.session_id).await.unwrap();
        assert_eq!(session.sql_attempts.len(), 2);
        assert!(!session.sql_attempts[0].success);
        assert!(session.sql_attempts[0]
            .error
            .as_deref()
            .unwrap()
            .starts_with("Validation:"));
        assert!(session.sql_attempts[1].success);
        // The loop re-entered generation from the execution phase.
        assert!(session
            .state_machine
            .transitions()
            .iter()
            .any(|t| t.from == Phase::ExecutingQuery && t.to == Phase::GeneratingSql));
    }

    #[tokio::test]
    async fn test_attempt_bound_exhaustion_is_terminal() {
        let mut config = test_config();
        config.agent.max_sql_attempts = 2;

        let llm = Arc::new(MockLlm::new());
        llm.push_structured(single_table_understanding());
        llm.push_completion(Ok("SELECT bad FROM customers".to_string()));
        llm.push_completion(Ok("SELECT bad2 FROM customers".to_string()));

        let (_dir, store, orchestrator) = build(llm, MockEngine::new(5, 0), config).await;
        let response = orchestrator.submit("list customer names", true).await;

        assert!(!response.success);
        assert_eq!(response.error, Some(ErrorKind::ValidationFailed));

        let session = store.load(&response.session_id).await.unwrap();
        assert_eq!(session.status(), SessionStatus::Failed);
        assert_eq!(session.sql_attempts.len(), 2);

        let summary = response.failure_summary.unwrap();
        assert_eq!(summary.sql_attempts, 2);
        assert!(summary
            .recommendations
            .iter()
            .any(|r| r.contains("Check SQL syntax")));
    }

    #[tokio::test]
    async fn test_fatal_llm_error_interrupts_session() {
        let llm = Arc::new(MockLlm::new());
        llm.push_structured(single_table_understanding());
        llm.push_completion(Err(LlmError::Auth {
            message: "invalid API key".to_string(),
        }));

        let (_dir, store, orchestrator) = build(llm, MockEngine::new(0, 0), test_config()).await;
        let response = orchestrator.submit("list customer names", true).await;

        assert!(!response.success);
        assert_eq!(response.error, Some(ErrorKind::LlmFailure));

        let session = store.load(&response.session_id).await.unwrap();
        // Interrupted, not failed: the session stays resumable.
        assert_eq!(session.status(), SessionStatus::Interrupted);
        assert!(session.failure_summary.is_none());
    }

    #[tokio::test]
    async fn test_empty_understanding_is_terminal_failure() {
        let llm = Arc::new(MockLlm::new());
        llm.push_structured(json!({"tables": [], "columns": [], "joins_needed": false}));

        let (_dir, store, orchestrator) = build(llm, MockEngine::new(0, 0), test_config()).await;
        let response = orchestrator.submit("gibberish", true).await;

        assert!(!response.success);
        assert_eq!(response.error, Some(ErrorKind::ProcessingFailed));

        let session = store.load(&response.session_id).await.unwrap();
        assert_eq!(session.status(), SessionStatus::Failed);
        let summary = response.failure_summary.unwrap();
        assert!(summary
            .recommendations
            .iter()
            .any(|r| r.contains("rephrasing")));
    }

    #[tokio::test]
    async fn test_resume_rejected_after_max_corrections() {
        let llm = Arc::new(MockLlm::new());
        let (_dir, store, orchestrator) = build(llm, MockEngine::new(0, 0), test_config()).await;

        let mut session = store.create("query").await.unwrap();
        session.correction_attempt = 3;
        store.save(&session).await.unwrap();

        let response = orchestrator
            .resume(&session.session_id, "some correction", true)
            .await;

        assert!(!response.success);
        assert_eq!(response.error, Some(ErrorKind::MaxCorrections));
    }

    #[tokio::test]
    async fn test_resume_unknown_session() {
        let llm = Arc::new(MockLlm::new());
        let (_dir, _store, orchestrator) = build(llm, MockEngine::new(0, 0), test_config()).await;

        let response = orchestrator.resume("no-such-id", "fix it", true).await;
        assert!(!response.success);
        assert_eq!(response.error, Some(ErrorKind::SessionNotFound));
    }

    #[tokio::test]
    async fn test_resume_terminal_session_rejected() {
        let llm = Arc::new(MockLlm::new());
        llm.push_structured(single_table_understanding());
        llm.push_completion(Ok("SELECT name FROM customers".to_string()));

        let (_dir, _store, orchestrator) = build(llm, MockEngine::new(0, 0), test_config()).await;
        let response = orchestrator.submit("list customer names", true).await;
        assert!(response.success);

        let rejected = orchestrator
            .resume(&response.session_id, "try again", true)
            .await;
        assert!(!rejected.success);
        assert_eq!(rejected.error, Some(ErrorKind::ProcessingFailed));
    }

    #[tokio::test]
    async fn test_list_sessions() {
        let llm = Arc::new(MockLlm::new());
        llm.push_structured(single_table_understanding());
        llm.push_completion(Ok("SELECT name FROM customers".to_string()));

        let (_dir, _store, orchestrator) = build(llm, MockEngine::new(0, 0), test_config()).await;
        let response = orchestrator.submit("list customer names", true).await;

        let all = orchestrator.list_sessions(None, 10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].session_id, response.session_id);
        assert_eq!(all[0].status, SessionStatus::Completed);

        let interrupted = orchestrator
            .list_sessions(Some(SessionStatus::Interrupted), 10)
            .await
            .unwrap();
        assert!(interrupted.is_empty());
    }
}
