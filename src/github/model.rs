//! Wire types returned by the GitHub REST API and their conversion into
//! store rows.
use serde::Deserialize;
use std::collections::HashMap;

use crate::model::{OutsideUser, RepoTeam, RepoUser, Repository, Team, TeamUser, User};
use crate::permission;

#[derive(Deserialize, Debug)]
pub struct ApiUser {
    pub login: String,
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, rename = "type")]
    pub typ: Option<String>,
    #[serde(default)]
    pub site_admin: bool,
}

#[derive(Deserialize, Debug)]
pub struct ApiTeamRef {
    pub slug: String,
}

#[derive(Deserialize, Debug)]
pub struct ApiTeam {
    pub id: i64,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub privacy: Option<String>,
    #[serde(default)]
    pub permission: Option<String>,
    #[serde(default)]
    pub parent: Option<ApiTeamRef>,
}

#[derive(Deserialize, Debug)]
pub struct ApiRepository {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub visibility: Option<String>,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub fork: bool,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub pushed_at: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ApiCollaborator {
    pub login: String,
    #[serde(default)]
    pub permissions: HashMap<String, bool>,
    #[serde(default)]
    pub role_name: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ApiRepoTeam {
    pub slug: String,
    #[serde(default)]
    pub permission: Option<String>,
    #[serde(default)]
    pub permissions: HashMap<String, bool>,
}

#[derive(Deserialize, Debug)]
pub struct ApiErrorBody {
    pub message: String,
}

impl From<ApiUser> for User {
    fn from(u: ApiUser) -> Self {
        User {
            login: u.login,
            id: u.id,
            name: u.name,
            email: u.email,
            user_type: u.typ.unwrap_or_else(|| "User".to_string()),
            site_admin: u.site_admin,
        }
    }
}

impl From<ApiUser> for OutsideUser {
    fn from(u: ApiUser) -> Self {
        OutsideUser {
            login: u.login,
            id: u.id,
            name: u.name,
            email: u.email,
        }
    }
}

impl From<ApiTeam> for Team {
    fn from(t: ApiTeam) -> Self {
        Team {
            slug: t.slug,
            id: t.id,
            name: t.name,
            description: t.description.filter(|d| !d.is_empty()),
            privacy: t.privacy,
            permission: t.permission,
            parent_slug: t.parent.map(|p| p.slug),
        }
    }
}

impl From<ApiRepository> for Repository {
    fn from(r: ApiRepository) -> Self {
        Repository {
            name: r.name,
            id: r.id,
            full_name: r.full_name,
            visibility: r.visibility,
            archived: r.archived,
            fork: r.fork,
            default_branch: r.default_branch,
            pushed_at: r.pushed_at,
        }
    }
}

impl ApiCollaborator {
    /// Direct permission. The capability flags win; `role_name` covers
    /// responses without them.
    pub fn into_row(self, repo: &str) -> RepoUser {
        let mut resolved = permission::resolve(&self.permissions);
        if resolved.is_empty() {
            resolved = normalize_role(self.role_name.as_deref());
        }
        RepoUser {
            repo_name: repo.to_string(),
            login: self.login,
            effective_permission: resolved.clone(),
            permission: resolved,
        }
    }
}

impl ApiRepoTeam {
    pub fn into_row(self, repo: &str) -> RepoTeam {
        let mut resolved = permission::resolve(&self.permissions);
        if resolved.is_empty() {
            resolved = normalize_role(self.permission.as_deref());
        }
        RepoTeam {
            repo_name: repo.to_string(),
            team_slug: self.slug,
            permission: resolved,
        }
    }
}

pub fn team_member_row(team: &str, user: ApiUser) -> TeamUser {
    TeamUser {
        team_slug: team.to_string(),
        login: user.login,
        role: "member".to_string(),
    }
}

/// The API names some levels differently in `role_name`/`permission` strings.
fn normalize_role(role: Option<&str>) -> String {
    match role.map(|r| r.trim().to_ascii_lowercase()).as_deref() {
        Some("write") => "push".to_string(),
        Some("read") => "pull".to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collaborator_permission_prefers_flags() {
        let c: ApiCollaborator = serde_json::from_value(json!({
            "login": "octo",
            "id": 1,
            "permissions": {"admin": false, "maintain": false, "push": true, "triage": true, "pull": true},
            "role_name": "write"
        }))
        .unwrap();
        let row = c.into_row("alpha");
        assert_eq!(row.permission, "push");
        assert_eq!(row.effective_permission, "push");
        assert_eq!(row.repo_name, "alpha");
    }

    #[test]
    fn repo_team_falls_back_to_permission_string() {
        let t: ApiRepoTeam = serde_json::from_value(json!({
            "slug": "core",
            "permission": "read"
        }))
        .unwrap();
        assert_eq!(t.into_row("alpha").permission, "pull");
    }

    #[test]
    fn team_parent_slug_is_kept() {
        let t: ApiTeam = serde_json::from_value(json!({
            "id": 5,
            "slug": "child",
            "name": "Child",
            "description": "",
            "privacy": "closed",
            "permission": "pull",
            "parent": {"slug": "parent", "id": 4}
        }))
        .unwrap();
        let team = Team::from(t);
        assert_eq!(team.parent_slug.as_deref(), Some("parent"));
        assert!(team.description.is_none());
    }
}
