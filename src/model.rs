use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::db::batch::SqlValue;

/// Scoping metadata attached to a sync target or a resume point.
pub type Metadata = BTreeMap<String, String>;

pub const META_REPO: &str = "repo";
pub const META_REPO_INDEX: &str = "repo_index";
pub const META_TEAM: &str = "team";
pub const META_TEAM_INDEX: &str = "team_index";
pub const META_USER: &str = "user";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SyncKind {
    Users,
    Teams,
    Repos,
    ReposUsers,
    ReposTeams,
    TeamsUsers,
    OutsideUsers,
    TokenPermission,
}

/// How a sync replaces the destination rows of its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplacePolicy {
    /// Delete every row of the table, then insert the fetched set.
    Full,
    /// Delete only the rows of one parent scope, then insert that scope's set.
    Scoped,
}

impl SyncKind {
    pub const ALL: [SyncKind; 8] = [
        SyncKind::Users,
        SyncKind::Teams,
        SyncKind::Repos,
        SyncKind::ReposUsers,
        SyncKind::ReposTeams,
        SyncKind::TeamsUsers,
        SyncKind::OutsideUsers,
        SyncKind::TokenPermission,
    ];

    /// Logical endpoint identity, used for resume matching.
    pub fn endpoint(&self) -> &'static str {
        match self {
            SyncKind::Users => "users",
            SyncKind::Teams => "teams",
            SyncKind::Repos => "repos",
            SyncKind::ReposUsers => "repos-users",
            SyncKind::ReposTeams => "repos-teams",
            SyncKind::TeamsUsers => "teams-users",
            SyncKind::OutsideUsers => "outside-users",
            SyncKind::TokenPermission => "token-permission",
        }
    }

    pub fn policy(&self) -> ReplacePolicy {
        match self {
            SyncKind::Users | SyncKind::Teams | SyncKind::Repos | SyncKind::OutsideUsers => {
                ReplacePolicy::Full
            }
            SyncKind::ReposUsers
            | SyncKind::ReposTeams
            | SyncKind::TeamsUsers
            | SyncKind::TokenPermission => ReplacePolicy::Scoped,
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.endpoint())
    }
}

impl FromStr for SyncKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().as_str() {
            "users" | "members" => SyncKind::Users,
            "teams" => SyncKind::Teams,
            "repos" | "repositories" => SyncKind::Repos,
            "repos-users" | "repo-collaborators" | "collaborators" => SyncKind::ReposUsers,
            "repos-teams" | "repo-teams" => SyncKind::ReposTeams,
            "teams-users" | "team-members" => SyncKind::TeamsUsers,
            "outside-users" | "outside-collaborators" => SyncKind::OutsideUsers,
            "token-permission" | "token" => SyncKind::TokenPermission,
            other => return Err(format!("unknown sync kind '{}'", other)),
        };
        Ok(kind)
    }
}

/// One sync pipeline instance: a kind plus its optional scoping fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
    pub kind: SyncKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_login: Option<String>,
}

impl SyncTarget {
    pub fn new(kind: SyncKind) -> Self {
        Self {
            kind,
            team_slug: None,
            repo_name: None,
            user_login: None,
        }
    }

    pub fn with_repo(mut self, repo: impl Into<String>) -> Self {
        self.repo_name = Some(repo.into());
        self
    }

    pub fn with_team(mut self, team: impl Into<String>) -> Self {
        self.team_slug = Some(team.into());
        self
    }

    pub fn with_user(mut self, login: impl Into<String>) -> Self {
        self.user_login = Some(login.into());
        self
    }

    /// Scoping metadata built from the fields that are set.
    pub fn metadata(&self) -> Metadata {
        let mut meta = Metadata::new();
        if let Some(team) = self.team_slug.as_deref().filter(|s| !s.is_empty()) {
            meta.insert(META_TEAM.to_string(), team.to_string());
        }
        if let Some(repo) = self.repo_name.as_deref().filter(|s| !s.is_empty()) {
            meta.insert(META_REPO.to_string(), repo.to_string());
        }
        if let Some(user) = self.user_login.as_deref().filter(|s| !s.is_empty()) {
            meta.insert(META_USER.to_string(), user.to_string());
        }
        meta
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        let meta = self.metadata();
        if !meta.is_empty() {
            let parts: Vec<String> = meta.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            write!(f, "[{}]", parts.join(","))?;
        }
        Ok(())
    }
}

/// A row type owned by one destination table.
///
/// `COLUMNS` order matches `values()`; the table's unique key makes
/// `INSERT OR REPLACE` idempotent.
pub trait TableRow: Serialize + Send + Sync {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
    /// Column holding the parent scope for relation tables.
    const SCOPE_COLUMN: Option<&'static str> = None;

    fn values(&self) -> Vec<SqlValue>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    pub id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub user_type: String,
    pub site_admin: bool,
}

impl TableRow for User {
    const TABLE: &'static str = "users";
    const COLUMNS: &'static [&'static str] =
        &["login", "id", "name", "email", "user_type", "site_admin"];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::from(self.login.as_str()),
            SqlValue::Int(self.id),
            SqlValue::from(self.name.as_deref()),
            SqlValue::from(self.email.as_deref()),
            SqlValue::from(self.user_type.as_str()),
            SqlValue::Bool(self.site_admin),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Team {
    pub slug: String,
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub privacy: Option<String>,
    pub permission: Option<String>,
    pub parent_slug: Option<String>,
}

impl TableRow for Team {
    const TABLE: &'static str = "teams";
    const COLUMNS: &'static [&'static str] = &[
        "slug",
        "id",
        "name",
        "description",
        "privacy",
        "permission",
        "parent_slug",
    ];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::from(self.slug.as_str()),
            SqlValue::Int(self.id),
            SqlValue::from(self.name.as_str()),
            SqlValue::from(self.description.as_deref()),
            SqlValue::from(self.privacy.as_deref()),
            SqlValue::from(self.permission.as_deref()),
            SqlValue::from(self.parent_slug.as_deref()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub id: i64,
    pub full_name: String,
    pub visibility: Option<String>,
    pub archived: bool,
    pub fork: bool,
    pub default_branch: Option<String>,
    pub pushed_at: Option<String>,
}

impl TableRow for Repository {
    const TABLE: &'static str = "repositories";
    const COLUMNS: &'static [&'static str] = &[
        "name",
        "id",
        "full_name",
        "visibility",
        "archived",
        "fork",
        "default_branch",
        "pushed_at",
    ];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::from(self.name.as_str()),
            SqlValue::Int(self.id),
            SqlValue::from(self.full_name.as_str()),
            SqlValue::from(self.visibility.as_deref()),
            SqlValue::Bool(self.archived),
            SqlValue::Bool(self.fork),
            SqlValue::from(self.default_branch.as_deref()),
            SqlValue::from(self.pushed_at.as_deref()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutsideUser {
    pub login: String,
    pub id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl TableRow for OutsideUser {
    const TABLE: &'static str = "outside_users";
    const COLUMNS: &'static [&'static str] = &["login", "id", "name", "email"];

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::from(self.login.as_str()),
            SqlValue::Int(self.id),
            SqlValue::from(self.name.as_deref()),
            SqlValue::from(self.email.as_deref()),
        ]
    }
}

/// Repository collaborator. `permission` is the direct grant; the effective
/// permission also folds in access inherited through teams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoUser {
    pub repo_name: String,
    pub login: String,
    pub permission: String,
    pub effective_permission: String,
}

impl TableRow for RepoUser {
    const TABLE: &'static str = "repo_users";
    const COLUMNS: &'static [&'static str] =
        &["repo_name", "login", "permission", "effective_permission"];
    const SCOPE_COLUMN: Option<&'static str> = Some("repo_name");

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::from(self.repo_name.as_str()),
            SqlValue::from(self.login.as_str()),
            SqlValue::from(self.permission.as_str()),
            SqlValue::from(self.effective_permission.as_str()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoTeam {
    pub repo_name: String,
    pub team_slug: String,
    pub permission: String,
}

impl TableRow for RepoTeam {
    const TABLE: &'static str = "repo_teams";
    const COLUMNS: &'static [&'static str] = &["repo_name", "team_slug", "permission"];
    const SCOPE_COLUMN: Option<&'static str> = Some("repo_name");

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::from(self.repo_name.as_str()),
            SqlValue::from(self.team_slug.as_str()),
            SqlValue::from(self.permission.as_str()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamUser {
    pub team_slug: String,
    pub login: String,
    pub role: String,
}

impl TableRow for TeamUser {
    const TABLE: &'static str = "team_users";
    const COLUMNS: &'static [&'static str] = &["team_slug", "login", "role"];
    const SCOPE_COLUMN: Option<&'static str> = Some("team_slug");

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::from(self.team_slug.as_str()),
            SqlValue::from(self.login.as_str()),
            SqlValue::from(self.role.as_str()),
        ]
    }
}

/// One OAuth scope granted to the syncing credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPermission {
    pub login: String,
    pub scope: String,
}

impl TableRow for TokenPermission {
    const TABLE: &'static str = "token_permissions";
    const COLUMNS: &'static [&'static str] = &["login", "scope"];
    const SCOPE_COLUMN: Option<&'static str> = Some("login");

    fn values(&self) -> Vec<SqlValue> {
        vec![
            SqlValue::from(self.login.as_str()),
            SqlValue::from(self.scope.as_str()),
        ]
    }
}
