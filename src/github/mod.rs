use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, LINK};
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::fmt;
use tracing::{debug, warn};

use crate::error::{ApiError, ScopeDiagnostic, HEADER_GRANTED_SCOPES};
use crate::fetch::{Page, PageRequest};
use crate::model::{
    OutsideUser, RepoTeam, RepoUser, Repository, Team, TeamUser, TokenPermission, User,
};

pub mod model;

use model::{ApiCollaborator, ApiErrorBody, ApiRepoTeam, ApiRepository, ApiTeam, ApiUser};

pub const GITHUB_API_BASE: &str = "https://api.github.com/";
const API_VERSION: &str = "2022-11-28";
const MEDIA_TYPE: &str = "application/vnd.github+json";

static NEXT_LINK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"<([^>]+)>\s*;\s*rel="next""#).expect("valid link regex"));

/// Listing contract of the organization directory. Every method returns one
/// page of rows; scoped listings take the repository name or team slug.
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    /// Organization the listings belong to.
    fn organization(&self) -> &str;

    async fn list_members(&self, req: PageRequest) -> Result<Page<User>, ApiError>;

    async fn list_teams(&self, req: PageRequest) -> Result<Page<Team>, ApiError>;

    async fn list_repos(&self, req: PageRequest) -> Result<Page<Repository>, ApiError>;

    async fn list_outside_collaborators(
        &self,
        req: PageRequest,
    ) -> Result<Page<OutsideUser>, ApiError>;

    async fn list_repo_collaborators(
        &self,
        repo: &str,
        req: PageRequest,
    ) -> Result<Page<RepoUser>, ApiError>;

    async fn list_repo_teams(&self, repo: &str, req: PageRequest)
        -> Result<Page<RepoTeam>, ApiError>;

    async fn list_team_members(
        &self,
        team: &str,
        req: PageRequest,
    ) -> Result<Page<TeamUser>, ApiError>;

    /// OAuth scopes held by the credential, keyed by its owner's login.
    async fn token_permissions(&self, req: PageRequest)
        -> Result<Page<TokenPermission>, ApiError>;
}

#[derive(Clone)]
pub struct GitHubClient {
    http: Client,
    base_url: Url,
    token: String,
    org: String,
}

impl fmt::Debug for GitHubClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubClient")
            .field("base_url", &self.base_url)
            .field("org", &self.org)
            .finish_non_exhaustive()
    }
}

impl GitHubClient {
    pub fn new(token: String, org: String) -> Result<Self> {
        let base_url = Url::parse(GITHUB_API_BASE).context("invalid default GitHub URL")?;
        Self::with_base_url(token, org, base_url)
    }

    pub fn with_base_url(token: String, org: String, mut base_url: Url) -> Result<Self> {
        // Url::join drops the last segment unless the base ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = Client::builder()
            .user_agent(concat!("orgsync/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
            org,
        })
    }

    pub fn build_request(&self, path: &str, page: Option<PageRequest>) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid GitHub path {path}"))?;
        let mut builder = self
            .http
            .get(endpoint)
            .header(ACCEPT, MEDIA_TYPE)
            .header("X-GitHub-Api-Version", API_VERSION);
        if !self.token.is_empty() {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", self.token));
        }
        if let Some(page) = page {
            builder = builder.query(&[("per_page", page.page_size), ("page", page.page)]);
        }
        builder.build().context("failed to build GitHub request")
    }

    async fn get<W: DeserializeOwned>(
        &self,
        path: &str,
        page: Option<PageRequest>,
    ) -> Result<(W, HeaderMap), ApiError> {
        let request = self
            .build_request(path, page)
            .map_err(|e| ApiError::new(None, format!("{e:#}")))?;
        debug!(url = %request.url(), "github request");

        let res = self
            .http
            .execute(request)
            .await
            .map_err(|e| ApiError::new(None, format!("failed to reach GitHub: {e}")))?;
        let status = res.status();
        let headers = res.headers().clone();

        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            let error = error_from_response(status, &headers, &body);
            warn!(%status, path, error = %error, "github request failed");
            return Err(error);
        }

        let payload = res
            .json::<W>()
            .await
            .map_err(|e| {
                ApiError::new(Some(status.as_u16()), format!("invalid GitHub response: {e}"))
            })?;
        Ok((payload, headers))
    }

    async fn get_page<W: DeserializeOwned>(
        &self,
        path: &str,
        req: PageRequest,
    ) -> Result<Page<W>, ApiError> {
        let (items, headers) = self.get::<Vec<W>>(path, Some(req)).await?;
        Ok(Page::new(items, next_page(&headers)))
    }
}

#[async_trait]
impl DirectoryApi for GitHubClient {
    fn organization(&self) -> &str {
        &self.org
    }

    async fn list_members(&self, req: PageRequest) -> Result<Page<User>, ApiError> {
        let path = format!("orgs/{}/members", self.org);
        Ok(self.get_page::<ApiUser>(&path, req).await?.map(User::from))
    }

    async fn list_teams(&self, req: PageRequest) -> Result<Page<Team>, ApiError> {
        let path = format!("orgs/{}/teams", self.org);
        Ok(self.get_page::<ApiTeam>(&path, req).await?.map(Team::from))
    }

    async fn list_repos(&self, req: PageRequest) -> Result<Page<Repository>, ApiError> {
        let path = format!("orgs/{}/repos", self.org);
        Ok(self
            .get_page::<ApiRepository>(&path, req)
            .await?
            .map(Repository::from))
    }

    async fn list_outside_collaborators(
        &self,
        req: PageRequest,
    ) -> Result<Page<OutsideUser>, ApiError> {
        let path = format!("orgs/{}/outside_collaborators", self.org);
        Ok(self
            .get_page::<ApiUser>(&path, req)
            .await?
            .map(OutsideUser::from))
    }

    async fn list_repo_collaborators(
        &self,
        repo: &str,
        req: PageRequest,
    ) -> Result<Page<RepoUser>, ApiError> {
        let path = format!("repos/{}/{}/collaborators", self.org, repo);
        Ok(self
            .get_page::<ApiCollaborator>(&path, req)
            .await?
            .map(|c| c.into_row(repo)))
    }

    async fn list_repo_teams(
        &self,
        repo: &str,
        req: PageRequest,
    ) -> Result<Page<RepoTeam>, ApiError> {
        let path = format!("repos/{}/{}/teams", self.org, repo);
        Ok(self
            .get_page::<ApiRepoTeam>(&path, req)
            .await?
            .map(|t| t.into_row(repo)))
    }

    async fn list_team_members(
        &self,
        team: &str,
        req: PageRequest,
    ) -> Result<Page<TeamUser>, ApiError> {
        let path = format!("orgs/{}/teams/{}/members", self.org, team);
        Ok(self
            .get_page::<ApiUser>(&path, req)
            .await?
            .map(|u| model::team_member_row(team, u)))
    }

    async fn token_permissions(
        &self,
        _req: PageRequest,
    ) -> Result<Page<TokenPermission>, ApiError> {
        let (owner, headers) = self.get::<ApiUser>("user", None).await?;
        let rows = headers
            .get(HEADER_GRANTED_SCOPES)
            .and_then(|v| v.to_str().ok())
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|scope| TokenPermission {
                        login: owner.login.clone(),
                        scope: scope.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Page::last(rows))
    }
}

/// Page number of the `rel="next"` entry of a `Link` header.
pub fn next_page(headers: &HeaderMap) -> Option<u32> {
    let link = headers.get(LINK)?.to_str().ok()?;
    let target = NEXT_LINK.captures(link)?.get(1)?.as_str();
    let url = Url::parse(target).ok()?;
    let (_, page) = url.query_pairs().find(|(k, _)| k == "page")?;
    page.parse().ok()
}

fn error_from_response(status: StatusCode, headers: &HeaderMap, body: &str) -> ApiError {
    let mut message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.trim().to_string());
    let exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.trim() == "0");
    if status == StatusCode::TOO_MANY_REQUESTS || (status == StatusCode::FORBIDDEN && exhausted) {
        let reset = headers
            .get("x-ratelimit-reset")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown");
        message = format!("rate limit exhausted (resets at {reset}): {message}");
    }
    ApiError::new(Some(status.as_u16()), message)
        .with_diagnostic(ScopeDiagnostic::from_headers(headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn client() -> GitHubClient {
        GitHubClient::new("token".into(), "acme".into()).unwrap()
    }

    #[test]
    fn build_request_sets_headers_and_paging() {
        let request = client()
            .build_request(
                "orgs/acme/members",
                Some(PageRequest {
                    page: 3,
                    page_size: 50,
                }),
            )
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::GET);
        assert_eq!(request.url().path(), "/orgs/acme/members");
        assert_eq!(request.url().query(), Some("per_page=50&page=3"));
        let headers = request.headers();
        assert_eq!(
            headers.get(AUTHORIZATION).and_then(|h| h.to_str().ok()),
            Some("Bearer token")
        );
        assert_eq!(
            headers.get(ACCEPT).and_then(|h| h.to_str().ok()),
            Some(MEDIA_TYPE)
        );
    }

    #[test]
    fn base_url_without_trailing_slash_keeps_prefix() {
        let base = Url::parse("https://ghe.example.com/api/v3").unwrap();
        let client = GitHubClient::with_base_url("t".into(), "acme".into(), base).unwrap();
        let request = client.build_request("user", None).unwrap();
        assert_eq!(request.url().path(), "/api/v3/user");
        assert!(request.url().query().is_none());
    }

    #[test]
    fn next_page_reads_link_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                r#"<https://api.github.com/orgs/acme/repos?per_page=100&page=2>; rel="next", <https://api.github.com/orgs/acme/repos?per_page=100&page=9>; rel="last""#,
            ),
        );
        assert_eq!(next_page(&headers), Some(2));
    }

    #[test]
    fn next_page_absent_on_last_page() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                r#"<https://api.github.com/orgs/acme/repos?page=1>; rel="prev", <https://api.github.com/orgs/acme/repos?page=1>; rel="first""#,
            ),
        );
        assert_eq!(next_page(&headers), None);
        assert_eq!(next_page(&HeaderMap::new()), None);
    }

    #[test]
    fn rate_limit_errors_name_the_reset() {
        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        headers.insert("x-ratelimit-reset", HeaderValue::from_static("1700000000"));
        let err = error_from_response(
            StatusCode::FORBIDDEN,
            &headers,
            r#"{"message":"API rate limit exceeded"}"#,
        );
        assert_eq!(err.status, Some(403));
        assert!(err.message.contains("1700000000"));
        assert!(err.message.contains("API rate limit exceeded"));
        assert!(err.diagnostic.is_none());
    }
}
