//! Pull orchestration: dispatch by kind, replace policies and the
//! "every repository/team" streaming drivers.
//!
//! Buffered targets walk every page first and swap the stored rows in one
//! transaction afterwards. Relation kinds pulled without a scope stream each
//! page into the store as it arrives, one parent scope after another, so an
//! interrupted run keeps everything it already wrote.
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::db::{self, Pool};
use crate::error::{ApiError, SyncError};
use crate::fetch::{
    fetch_pages, FetchRequest, Fetched, LogProgress, Page, PageProgress, PageRequest, PageSink,
    PartialFetch, ProgressSink, DEFAULT_PAGE_SIZE,
};
use crate::github::DirectoryApi;
use crate::model::{
    Metadata, ReplacePolicy, RepoUser, SyncKind, SyncTarget, TableRow, META_REPO,
    META_REPO_INDEX, META_TEAM, META_TEAM_INDEX,
};
use crate::permission;
use crate::resume::{prepare_resume, PullOptions, StartPoint};
use crate::session::{PullSession, SessionError, SessionStore};

/// Outcome of one pull.
#[derive(Debug, Default)]
pub struct PullReport {
    /// Rows fetched by this invocation.
    pub fetched: u64,
    /// Rows written to the store.
    pub stored: u64,
    /// Parent scopes walked by a streaming driver.
    pub scopes: usize,
    /// Fetched rows as JSON, only when stdout output was requested.
    pub items: Vec<serde_json::Value>,
    /// Informational notes, e.g. discarded resume metadata.
    pub messages: Vec<String>,
}

impl PullReport {
    fn absorb(&mut self, other: PullReport) {
        self.fetched += other.fetched;
        self.stored += other.stored;
        self.scopes += other.scopes;
        self.items.extend(other.items);
        self.messages.extend(other.messages);
    }
}

type SessionRef<'a> = Option<(&'a SessionStore, &'a str)>;

/// Logs each streamed page and, for session-backed pulls, records it as the
/// resume point. Streamed pages are already stored when they get here.
struct PullProgress<'a> {
    session: SessionRef<'a>,
    table_cleared: bool,
}

#[async_trait]
impl<'a> ProgressSink for PullProgress<'a> {
    async fn on_page(&self, progress: &PageProgress) -> Result<(), SyncError> {
        LogProgress.on_page(progress).await?;
        if let Some((store, key)) = self.session {
            store
                .record_progress(key, progress, self.table_cleared)
                .await?;
        }
        Ok(())
    }
}

/// Writes streamed pages of one scope. The first stored page of a fresh
/// scope also removes the scope's previous rows.
struct ScopeSink<'a, T> {
    pool: &'a Pool,
    scope: &'a str,
    clear_first: bool,
    stored: u64,
    _row: PhantomData<fn(T)>,
}

impl<'a, T> ScopeSink<'a, T> {
    fn new(pool: &'a Pool, scope: &'a str, clear_first: bool) -> Self {
        Self {
            pool,
            scope,
            clear_first,
            stored: 0,
            _row: PhantomData,
        }
    }
}

#[async_trait]
impl<'a, T: TableRow> PageSink<T> for ScopeSink<'a, T> {
    async fn store_page(&mut self, items: &[T]) -> Result<(), SyncError> {
        self.stored += db::store_scope_page(self.pool, self.scope, items, self.clear_first).await?;
        self.clear_first = false;
        Ok(())
    }
}

pub struct Syncer<'a> {
    api: &'a dyn DirectoryApi,
    pool: &'a Pool,
    sessions: Option<&'a SessionStore>,
    cancel: CancellationToken,
    page_size: u32,
}

impl<'a> Syncer<'a> {
    pub fn new(api: &'a dyn DirectoryApi, pool: &'a Pool) -> Self {
        Self {
            api,
            pool,
            sessions: None,
            cancel: CancellationToken::new(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_sessions(mut self, sessions: &'a SessionStore) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Pulls `target` without session tracking. A resume state in `options`
    /// is still honored.
    pub async fn pull(
        &self,
        target: &SyncTarget,
        options: PullOptions,
    ) -> Result<PullReport, SyncError> {
        self.run(target, options, None).await
    }

    /// Pulls `target` under the session `key`.
    ///
    /// A new key is recorded before the first request; an existing one must
    /// describe the same target and the pull continues after its last
    /// recorded page. The session is removed once the pull completes and kept
    /// on cancellation or failure.
    #[instrument(skip_all, fields(key = %key, pull = %target))]
    pub async fn pull_session(
        &self,
        key: &str,
        target: &SyncTarget,
        mut options: PullOptions,
    ) -> Result<PullReport, SyncError> {
        let sessions = self
            .sessions
            .ok_or_else(|| SyncError::InvalidTarget("no session store configured".into()))?;

        match sessions.load(key).await {
            Ok(existing) => {
                let recorded = existing.sync_target();
                if recorded != *target {
                    return Err(SyncError::InvalidTarget(format!(
                        "session '{}' belongs to {}, not {}",
                        key, recorded, target
                    )));
                }
                options.resume = existing.resume_state();
                info!(
                    last_page = existing.last_page,
                    count = existing.fetched_count,
                    "resuming session"
                );
            }
            Err(SessionError::NotFound(_)) => {
                options.resume.clear();
                sessions
                    .save(&PullSession::new(key, target, &options))
                    .await?;
                info!("session created");
            }
            Err(err) => return Err(err.into()),
        }

        let result = self.run(target, options, Some((sessions, key))).await;
        match &result {
            Ok(report) => {
                sessions.remove(key).await?;
                info!(fetched = report.fetched, stored = report.stored, "session completed");
            }
            Err(err) if err.is_cancelled() => {
                info!("pull interrupted; session kept for resume");
            }
            Err(err) => {
                warn!(error = %err, "pull failed; session kept for resume");
            }
        }
        result
    }

    #[instrument(skip_all, fields(pull = %target))]
    async fn run(
        &self,
        target: &SyncTarget,
        options: PullOptions,
        session: SessionRef<'_>,
    ) -> Result<PullReport, SyncError> {
        validate_target(target)?;
        let api = self.api;
        let kind = target.kind;
        let endpoint = kind.endpoint();
        let metadata = target.metadata();
        let repo = scope_of(&target.repo_name);
        let team = scope_of(&target.team_slug);
        let streaming = match kind {
            SyncKind::ReposUsers | SyncKind::ReposTeams => repo.is_none(),
            SyncKind::TeamsUsers => team.is_none(),
            _ => false,
        };
        let scope = match kind.policy() {
            ReplacePolicy::Full => None,
            ReplacePolicy::Scoped => repo.or(team),
        };
        info!(
            resumed = !options.resume.is_empty(),
            store = options.store,
            streaming,
            "pull started"
        );

        let report = match (kind, repo, team) {
            (SyncKind::Users, _, _) => {
                let list = move |req: PageRequest| api.list_members(req);
                self.buffered(list, endpoint, metadata, scope, &options, session)
                    .await?
            }
            (SyncKind::Teams, _, _) => {
                let list = move |req: PageRequest| api.list_teams(req);
                self.buffered(list, endpoint, metadata, scope, &options, session)
                    .await?
            }
            (SyncKind::Repos, _, _) => {
                let list = move |req: PageRequest| api.list_repos(req);
                self.buffered(list, endpoint, metadata, scope, &options, session)
                    .await?
            }
            (SyncKind::OutsideUsers, _, _) => {
                let list = move |req: PageRequest| api.list_outside_collaborators(req);
                self.buffered(list, endpoint, metadata, scope, &options, session)
                    .await?
            }
            (SyncKind::ReposUsers, Some(repo), _) => {
                let inherited = db::team_permissions_for_repo(self.pool, repo).await?;
                let inherited = &inherited;
                let list = move |req: PageRequest| collaborators(api, repo, inherited, req);
                self.buffered(list, endpoint, metadata, scope, &options, session)
                    .await?
            }
            (SyncKind::ReposTeams, Some(repo), _) => {
                let list = move |req: PageRequest| api.list_repo_teams(repo, req);
                self.buffered(list, endpoint, metadata, scope, &options, session)
                    .await?
            }
            (SyncKind::TeamsUsers, _, Some(team)) => {
                let list = move |req: PageRequest| api.list_team_members(team, req);
                self.buffered(list, endpoint, metadata, scope, &options, session)
                    .await?
            }
            (SyncKind::TokenPermission, _, _) => {
                self.pull_token_permission(target, metadata, &options, session)
                    .await?
            }
            (SyncKind::ReposUsers | SyncKind::ReposTeams | SyncKind::TeamsUsers, _, _) => {
                let progress = PullProgress {
                    session,
                    table_cleared: options.store,
                };
                self.pull_every_scope(kind, options, &progress).await?
            }
        };

        info!(
            fetched = report.fetched,
            stored = report.stored,
            scopes = report.scopes,
            "pull finished"
        );
        Ok(report)
    }

    fn request(
        &self,
        endpoint: &str,
        metadata: Metadata,
        start: StartPoint,
        options: &PullOptions,
    ) -> FetchRequest {
        FetchRequest::new(endpoint, metadata)
            .starting_at(start)
            .page_size(self.page_size)
            .interval(options.interval)
    }

    /// Walks every page into memory. Nothing is persisted here.
    async fn walk<T, F, Fut>(
        &self,
        list: F,
        endpoint: &str,
        metadata: Metadata,
        options: &PullOptions,
    ) -> (FetchRequest, Result<Fetched<T>, PartialFetch<T>>)
    where
        T: TableRow,
        F: FnMut(PageRequest) -> Fut,
        Fut: Future<Output = Result<Page<T>, ApiError>>,
    {
        let (_, start) = options.for_endpoint(endpoint, &metadata);
        let request = self.request(endpoint, metadata, start, options);
        let result = fetch_pages(list, &request, None, Some(&LogProgress), &self.cancel).await;
        (request, result)
    }

    /// Swaps the stored rows for `rows`: the whole table when `scope` is
    /// `None`, otherwise only that scope. A resumed walk only holds the pages
    /// after the resume point, and its first generation already replaced the
    /// old rows, so it upserts instead.
    async fn persist<T: TableRow>(
        &self,
        rows: &[T],
        scope: Option<&str>,
        start: StartPoint,
        options: &PullOptions,
    ) -> Result<u64, SyncError> {
        if !options.store {
            return Ok(0);
        }
        if start.is_resumed() {
            return db::upsert_rows(self.pool, rows).await;
        }
        match scope {
            None => db::replace_all(self.pool, rows).await,
            Some(scope) => db::replace_scope(self.pool, scope, rows).await,
        }
    }

    /// Handles a buffered walk that stopped early.
    ///
    /// With a session, the pages fetched so far are persisted under the
    /// normal replace policy and only then does the session move its resume
    /// point past them, marked `table_cleared`. Without a session, or with
    /// store disabled, nothing is written and the stored rows stay as they
    /// were.
    async fn keep_partial<T: TableRow>(
        &self,
        partial: PartialFetch<T>,
        request: &FetchRequest,
        scope: Option<&str>,
        options: &PullOptions,
        session: SessionRef<'_>,
    ) -> SyncError {
        let Some((sessions, key)) = session else {
            return partial.into_error();
        };
        if !options.store || partial.fetched.items.is_empty() {
            return partial.into_error();
        }

        let rows = &partial.fetched.items;
        let kept = match self.persist(rows, scope, request.start, options).await {
            Ok(kept) => kept,
            Err(err) => {
                warn!(error = %err, "could not keep fetched pages; session left unchanged");
                return err;
            }
        };
        let checkpoint = PageProgress {
            endpoint: request.endpoint.clone(),
            metadata: request.metadata.clone(),
            page: partial.fetched.last_page,
            count: partial.fetched.count,
        };
        if let Err(err) = sessions.record_progress(key, &checkpoint, true).await {
            warn!(error = %err, "kept fetched pages but could not record the session");
            return err.into();
        }
        info!(
            endpoint = %request.endpoint,
            kept,
            page = checkpoint.page,
            "kept pages fetched before the pull stopped"
        );
        partial.into_error()
    }

    async fn buffered<T, F, Fut>(
        &self,
        list: F,
        endpoint: &str,
        metadata: Metadata,
        scope: Option<&str>,
        options: &PullOptions,
        session: SessionRef<'_>,
    ) -> Result<PullReport, SyncError>
    where
        T: TableRow,
        F: FnMut(PageRequest) -> Fut,
        Fut: Future<Output = Result<Page<T>, ApiError>>,
    {
        let (request, result) = self.walk(list, endpoint, metadata, options).await;
        match result {
            Ok(fetched) => {
                let stored = self.persist(&fetched.items, scope, request.start, options).await?;
                report(fetched, request.start, stored, options)
            }
            Err(partial) => {
                Err(self.keep_partial(partial, &request, scope, options, session).await)
            }
        }
    }

    /// Token scopes are stored under the token owner's login. A login given
    /// on the target must name that owner.
    async fn pull_token_permission(
        &self,
        target: &SyncTarget,
        metadata: Metadata,
        options: &PullOptions,
        session: SessionRef<'_>,
    ) -> Result<PullReport, SyncError> {
        let api = self.api;
        let endpoint = SyncKind::TokenPermission.endpoint();
        let expected = scope_of(&target.user_login);
        let list = move |req: PageRequest| api.token_permissions(req);
        let (request, result) = self.walk(list, endpoint, metadata, options).await;
        let fetched = match result {
            Ok(fetched) => fetched,
            Err(partial) => {
                let owner = partial.fetched.items.first().map(|row| row.login.clone());
                let scope = owner.as_deref().or(expected);
                return Err(self.keep_partial(partial, &request, scope, options, session).await);
            }
        };

        let owner = fetched.items.first().map(|row| row.login.clone());
        if let (Some(expected), Some(owner)) = (expected, owner.as_deref()) {
            if expected != owner {
                return Err(SyncError::InvalidTarget(format!(
                    "token belongs to {}, not {}",
                    owner, expected
                )));
            }
        }

        let stored = match owner.as_deref().or(expected) {
            Some(login) => {
                self.persist(&fetched.items, Some(login), request.start, options)
                    .await?
            }
            None => 0,
        };
        report(fetched, request.start, stored, options)
    }

    /// Walks one parent scope, storing each page as it arrives.
    #[allow(clippy::too_many_arguments)]
    async fn stream_scope<T, F, Fut>(
        &self,
        list: F,
        endpoint: &str,
        scope: &str,
        metadata: Metadata,
        start: StartPoint,
        options: &PullOptions,
        progress: &PullProgress<'_>,
    ) -> Result<PullReport, SyncError>
    where
        T: TableRow,
        F: FnMut(PageRequest) -> Fut,
        Fut: Future<Output = Result<Page<T>, ApiError>>,
    {
        let request = self.request(endpoint, metadata, start, options);
        let mut sink = ScopeSink::<T>::new(self.pool, scope, !start.is_resumed());
        let sink_ref: Option<&mut dyn PageSink<T>> = if options.store {
            Some(&mut sink as &mut dyn PageSink<T>)
        } else {
            None
        };
        let fetched = fetch_pages(list, &request, sink_ref, Some(progress), &self.cancel)
            .await
            .map_err(|partial| partial.into_error())?;

        // A scope that came back empty still loses its previous rows.
        if options.store && sink.clear_first {
            db::clear_scope::<T>(self.pool, scope).await?;
        }
        let mut part = report(fetched, start, sink.stored, options)?;
        part.scopes = 1;
        Ok(part)
    }

    /// Streams a relation kind across every repository (or team) known to
    /// the local store, in name order.
    #[instrument(skip_all, fields(kind = %kind))]
    async fn pull_every_scope(
        &self,
        kind: SyncKind,
        mut options: PullOptions,
        progress: &PullProgress<'_>,
    ) -> Result<PullReport, SyncError> {
        let api = self.api;
        let endpoint = kind.endpoint();
        let (candidates, name_key, index_key, label) = match kind {
            SyncKind::TeamsUsers => (
                db::list_team_slugs(self.pool).await?,
                META_TEAM,
                META_TEAM_INDEX,
                "team",
            ),
            _ => (
                db::list_repo_names(self.pool).await?,
                META_REPO,
                META_REPO_INDEX,
                "repository",
            ),
        };

        let position = prepare_resume(
            &candidates,
            &mut options.resume,
            endpoint,
            name_key,
            index_key,
            label,
            api.organization(),
        );
        let mut total = PullReport::default();
        if let Some(message) = position.message.clone() {
            warn!("{}", message);
            total.messages.push(message);
        }
        if candidates.is_empty() {
            info!(label, "no local {} to walk; pull the parent list first", label);
        }

        for (index, scope) in candidates.iter().enumerate() {
            if position.skips(index) {
                continue;
            }
            let scope = scope.as_str();
            let mut metadata = Metadata::new();
            metadata.insert(name_key.to_string(), scope.to_string());
            metadata.insert(index_key.to_string(), index.to_string());

            let (next, start) = options.for_endpoint(endpoint, &metadata);
            options = next;
            // Past the resume point every scope starts from its first page.
            options.resume.clear();

            let part = match kind {
                SyncKind::ReposUsers => {
                    let inherited = db::team_permissions_for_repo(self.pool, scope).await?;
                    let inherited = &inherited;
                    self.stream_scope(
                        move |req: PageRequest| collaborators(api, scope, inherited, req),
                        endpoint,
                        scope,
                        metadata,
                        start,
                        &options,
                        progress,
                    )
                    .await?
                }
                SyncKind::ReposTeams => {
                    self.stream_scope(
                        move |req: PageRequest| api.list_repo_teams(scope, req),
                        endpoint,
                        scope,
                        metadata,
                        start,
                        &options,
                        progress,
                    )
                    .await?
                }
                _ => {
                    self.stream_scope(
                        move |req: PageRequest| api.list_team_members(scope, req),
                        endpoint,
                        scope,
                        metadata,
                        start,
                        &options,
                        progress,
                    )
                    .await?
                }
            };
            info!(scope, fetched = part.fetched, "scope complete");
            total.absorb(part);
        }
        Ok(total)
    }
}

/// Collaborator page with team-derived grants merged into the effective
/// permission.
async fn collaborators(
    api: &dyn DirectoryApi,
    repo: &str,
    inherited: &BTreeMap<String, String>,
    req: PageRequest,
) -> Result<Page<RepoUser>, ApiError> {
    let page = api.list_repo_collaborators(repo, req).await?;
    let direct: BTreeMap<String, String> = page
        .items
        .iter()
        .map(|row| (row.login.clone(), row.permission.clone()))
        .collect();
    let effective = permission::merge_effective(&direct, inherited);
    Ok(page.map(|mut row| {
        if let Some(merged) = effective.get(&row.login) {
            row.effective_permission = merged.clone();
        }
        row
    }))
}

fn report<T: Serialize>(
    fetched: Fetched<T>,
    start: StartPoint,
    stored: u64,
    options: &PullOptions,
) -> Result<PullReport, SyncError> {
    let mut report = PullReport {
        fetched: fetched.count.saturating_sub(start.count),
        stored,
        ..PullReport::default()
    };
    if options.stdout {
        report.items = fetched
            .items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<_, _>>()?;
    }
    Ok(report)
}

fn scope_of(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

/// Rejects scoping fields the kind does not use.
pub fn validate_target(target: &SyncTarget) -> Result<(), SyncError> {
    let repo = scope_of(&target.repo_name).is_some();
    let team = scope_of(&target.team_slug).is_some();
    let user = scope_of(&target.user_login).is_some();
    let allowed = match target.kind {
        SyncKind::Users | SyncKind::Teams | SyncKind::Repos | SyncKind::OutsideUsers => {
            !repo && !team && !user
        }
        SyncKind::ReposUsers | SyncKind::ReposTeams => !team && !user,
        SyncKind::TeamsUsers => !repo && !user,
        SyncKind::TokenPermission => !repo && !team,
    };
    if allowed {
        Ok(())
    } else {
        Err(SyncError::InvalidTarget(format!(
            "{} does not accept the scoping given in {}",
            target.kind, target
        )))
    }
}
