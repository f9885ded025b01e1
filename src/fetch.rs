//! Generic page walker.
//!
//! A listing function is called page after page until the API stops
//! reporting a next page. Each non-empty page can be handed to a sink as it
//! arrives (streaming persistence) and is reported to a progress sink. Pages
//! are paced by a fixed interval and every wait races the cancellation token.
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ApiError, SyncError};
use crate::model::Metadata;
use crate::resume::StartPoint;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
}

/// One page of a listing. `next_page` is `None` (or 0) on the last page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_page: Option<u32>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next_page: Option<u32>) -> Self {
        Self { items, next_page }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self::new(items, None)
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            next_page: self.next_page,
        }
    }
}

/// Progress after a non-empty page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageProgress {
    pub endpoint: String,
    pub metadata: Metadata,
    pub page: u32,
    pub count: u64,
}

/// Receives each non-empty page right after it is fetched.
#[async_trait]
pub trait PageSink<T: Sync>: Send {
    async fn store_page(&mut self, items: &[T]) -> Result<(), SyncError>;
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// An error stops the walk after the page it reports.
    async fn on_page(&self, progress: &PageProgress) -> Result<(), SyncError>;
}

/// Progress sink that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

#[async_trait]
impl ProgressSink for LogProgress {
    async fn on_page(&self, progress: &PageProgress) -> Result<(), SyncError> {
        info!(
            endpoint = %progress.endpoint,
            metadata = ?progress.metadata,
            page = progress.page,
            count = progress.count,
            "fetched page"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub endpoint: String,
    pub metadata: Metadata,
    pub start: StartPoint,
    pub page_size: u32,
    pub interval: Duration,
}

impl FetchRequest {
    pub fn new(endpoint: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            endpoint: endpoint.into(),
            metadata,
            start: StartPoint::FIRST,
            page_size: DEFAULT_PAGE_SIZE,
            interval: Duration::ZERO,
        }
    }

    pub fn starting_at(mut self, start: StartPoint) -> Self {
        self.start = start;
        self
    }

    pub fn page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// Items collected by a page walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched<T> {
    pub items: Vec<T>,
    /// Last page that was requested successfully; `start.page - 1` when none was.
    pub last_page: u32,
    /// Running count, including the count carried over from a resume.
    pub count: u64,
}

/// A walk that stopped early. `fetched` holds every page received before
/// the error so the caller can still persist partial progress.
#[derive(Debug)]
pub struct PartialFetch<T> {
    pub fetched: Fetched<T>,
    pub error: SyncError,
}

impl<T> PartialFetch<T> {
    pub fn is_cancelled(&self) -> bool {
        self.error.is_cancelled()
    }

    pub fn into_error(self) -> SyncError {
        self.error
    }
}

/// Walks a paginated listing from `request.start` to its last page.
pub async fn fetch_pages<T, F, Fut>(
    mut list: F,
    request: &FetchRequest,
    mut sink: Option<&mut (dyn PageSink<T> + '_)>,
    progress: Option<&dyn ProgressSink>,
    cancel: &CancellationToken,
) -> Result<Fetched<T>, PartialFetch<T>>
where
    T: Sync,
    F: FnMut(PageRequest) -> Fut,
    Fut: Future<Output = Result<Page<T>, ApiError>>,
{
    let mut page = request.start.page.max(1);
    let mut fetched = Fetched {
        items: Vec::new(),
        last_page: page - 1,
        count: request.start.count,
    };

    loop {
        if cancel.is_cancelled() {
            return Err(PartialFetch {
                fetched,
                error: SyncError::Cancelled,
            });
        }

        let page_request = PageRequest {
            page,
            page_size: request.page_size,
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(PartialFetch { fetched, error: SyncError::Cancelled });
            }
            result = list(page_request) => result,
        };

        let listed = match result {
            Ok(listed) => listed,
            Err(source) => {
                warn!(endpoint = %request.endpoint, page, error = %source, "listing failed");
                return Err(PartialFetch {
                    fetched,
                    error: SyncError::Api {
                        endpoint: request.endpoint.clone(),
                        page,
                        source,
                    },
                });
            }
        };
        fetched.last_page = page;

        if !listed.items.is_empty() {
            fetched.count += listed.items.len() as u64;
            let stored = match sink.as_mut() {
                Some(sink) => sink.store_page(&listed.items).await,
                None => Ok(()),
            };
            fetched.items.extend(listed.items);
            if let Err(error) = stored {
                return Err(PartialFetch { fetched, error });
            }
            if let Some(progress) = progress {
                let reported = progress
                    .on_page(&PageProgress {
                        endpoint: request.endpoint.clone(),
                        metadata: request.metadata.clone(),
                        page,
                        count: fetched.count,
                    })
                    .await;
                if let Err(error) = reported {
                    return Err(PartialFetch { fetched, error });
                }
            }
        }

        match listed.next_page.filter(|next| *next > 0) {
            Some(next) => page = next,
            None => break,
        }

        if !request.interval.is_zero() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(endpoint = %request.endpoint, page, "pacing sleep interrupted");
                    return Err(PartialFetch { fetched, error: SyncError::Cancelled });
                }
                _ = tokio::time::sleep(request.interval) => {}
            }
        }
    }

    debug!(
        endpoint = %request.endpoint,
        pages = fetched.last_page,
        count = fetched.count,
        "listing complete"
    );
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScopeDiagnostic;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    /// Serves `pages[p - 1]` for page `p`, recording requested page numbers.
    fn lister(
        pages: Vec<Page<u32>>,
        calls: Arc<Mutex<Vec<u32>>>,
    ) -> impl FnMut(PageRequest) -> std::future::Ready<Result<Page<u32>, ApiError>> {
        move |req: PageRequest| {
            calls.lock().unwrap().push(req.page);
            let page = pages
                .get(req.page as usize - 1)
                .cloned()
                .ok_or_else(|| ApiError::new(Some(404), "no such page"));
            std::future::ready(page)
        }
    }

    fn three_pages() -> Vec<Page<u32>> {
        vec![
            Page::new(vec![1, 2], Some(2)),
            Page::new(vec![3, 4], Some(3)),
            Page::last(vec![5]),
        ]
    }

    #[derive(Default)]
    struct RecordingSink {
        pages: Vec<Vec<u32>>,
        fail_on: Option<usize>,
    }

    #[async_trait]
    impl PageSink<u32> for RecordingSink {
        async fn store_page(&mut self, items: &[u32]) -> Result<(), SyncError> {
            if self.fail_on == Some(self.pages.len()) {
                return Err(SyncError::InvalidTarget("sink refused".into()));
            }
            self.pages.push(items.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        seen: Mutex<Vec<(u32, u64)>>,
    }

    #[async_trait]
    impl ProgressSink for RecordingProgress {
        async fn on_page(&self, progress: &PageProgress) -> Result<(), SyncError> {
            self.seen.lock().unwrap().push((progress.page, progress.count));
            Ok(())
        }
    }

    #[tokio::test]
    async fn walks_every_page_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let request = FetchRequest::new("users", Metadata::new());
        let progress = RecordingProgress::default();
        let fetched = fetch_pages(
            lister(three_pages(), calls.clone()),
            &request,
            None,
            Some(&progress),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(fetched.items, vec![1, 2, 3, 4, 5]);
        assert_eq!(fetched.count, 5);
        assert_eq!(fetched.last_page, 3);
        assert_eq!(*calls.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(*progress.seen.lock().unwrap(), vec![(1, 2), (2, 4), (3, 5)]);
    }

    struct RejectingProgress;

    #[async_trait]
    impl ProgressSink for RejectingProgress {
        async fn on_page(&self, _progress: &PageProgress) -> Result<(), SyncError> {
            Err(SyncError::InvalidTarget("session vanished".into()))
        }
    }

    #[tokio::test]
    async fn progress_failure_stops_after_the_reported_page() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let request = FetchRequest::new("users", Metadata::new());
        let partial = fetch_pages(
            lister(three_pages(), calls.clone()),
            &request,
            None,
            Some(&RejectingProgress),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(partial.error, SyncError::InvalidTarget(_)));
        assert_eq!(partial.fetched.items, vec![1, 2]);
        assert_eq!(partial.fetched.last_page, 1);
        assert_eq!(*calls.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn streams_each_page_to_sink() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let request = FetchRequest::new("repos-users", Metadata::new());
        let mut sink = RecordingSink::default();
        fetch_pages(
            lister(three_pages(), calls),
            &request,
            Some(&mut sink),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(sink.pages, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test]
    async fn resumes_from_start_point() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let request = FetchRequest::new("users", Metadata::new())
            .starting_at(StartPoint { page: 2, count: 2 });
        let fetched = fetch_pages(
            lister(three_pages(), calls.clone()),
            &request,
            None,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(fetched.items, vec![3, 4, 5]);
        assert_eq!(fetched.count, 5);
        assert_eq!(*calls.lock().unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn empty_page_with_next_marker_continues() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let pages = vec![Page::new(vec![], Some(2)), Page::new(vec![9], Some(0))];
        let progress = RecordingProgress::default();
        let fetched = fetch_pages(
            lister(pages, calls),
            &FetchRequest::new("teams", Metadata::new()),
            None,
            Some(&progress),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(fetched.items, vec![9]);
        assert_eq!(*progress.seen.lock().unwrap(), vec![(2, 1)]);
    }

    #[tokio::test]
    async fn cancelled_before_start_issues_no_request() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let partial = fetch_pages(
            lister(three_pages(), calls.clone()),
            &FetchRequest::new("users", Metadata::new()),
            None,
            None,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(partial.is_cancelled());
        assert!(partial.fetched.items.is_empty());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_interrupts_pacing_sleep() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let request = FetchRequest::new("users", Metadata::new()).interval(Duration::from_secs(30));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let partial = fetch_pages(
            lister(three_pages(), calls.clone()),
            &request,
            None,
            None,
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(partial.error, SyncError::Cancelled));
        assert_eq!(partial.fetched.items, vec![1, 2]);
        assert_eq!(partial.fetched.last_page, 1);
        assert_eq!(*calls.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn listing_error_is_wrapped_with_page_and_diagnostic() {
        let request = FetchRequest::new("teams", Metadata::new());
        let diag = ScopeDiagnostic {
            accepted_scopes: vec!["read:org".into()],
            granted_scopes: vec!["repo".into()],
            accepted_permissions: vec![],
        };
        let list = |req: PageRequest| {
            let diag = diag.clone();
            async move {
                if req.page == 1 {
                    Ok(Page::new(vec![7u32], Some(2)))
                } else {
                    Err(ApiError::new(Some(403), "forbidden").with_diagnostic(Some(diag)))
                }
            }
        };
        let partial = fetch_pages(list, &request, None, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(partial.fetched.items, vec![7]);
        match &partial.error {
            SyncError::Api { endpoint, page, .. } => {
                assert_eq!(endpoint, "teams");
                assert_eq!(*page, 2);
            }
            other => panic!("unexpected error {other:?}"),
        }
        let hint = partial.error.scope_diagnostic().unwrap();
        assert_eq!(hint.missing_scopes(), vec!["read:org"]);
    }

    #[tokio::test]
    async fn sink_failure_stops_the_walk() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut sink = RecordingSink {
            fail_on: Some(1),
            ..Default::default()
        };
        let partial = fetch_pages(
            lister(three_pages(), calls.clone()),
            &FetchRequest::new("users", Metadata::new()),
            Some(&mut sink),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(partial.error, SyncError::InvalidTarget(_)));
        assert_eq!(sink.pages, vec![vec![1, 2]]);
        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
    }
}
