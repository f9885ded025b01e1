use std::collections::BTreeMap;

use sqlx::{Sqlite, Transaction};
use tracing::{debug, instrument};

use super::batch::BatchUpsert;
use super::Pool;
use crate::error::SyncError;
use crate::model::{Repository, Team, TableRow};
use crate::permission::max_permission;

fn scope_column<T: TableRow>() -> Result<&'static str, SyncError> {
    T::SCOPE_COLUMN.ok_or_else(|| {
        SyncError::InvalidTarget(format!("table {} has no scope column", T::TABLE))
    })
}

async fn begin(pool: &Pool, scope: &str) -> Result<Transaction<'static, Sqlite>, SyncError> {
    pool.begin().await.map_err(SyncError::storage("begin", scope))
}

async fn delete_all_tx<T: TableRow>(tx: &mut Transaction<'_, Sqlite>) -> Result<u64, SyncError> {
    let res = sqlx::query(&format!("DELETE FROM \"{}\"", T::TABLE))
        .execute(&mut **tx)
        .await
        .map_err(SyncError::storage("delete", T::TABLE))?;
    Ok(res.rows_affected())
}

async fn delete_scope_tx<T: TableRow>(
    tx: &mut Transaction<'_, Sqlite>,
    scope: &str,
) -> Result<u64, SyncError> {
    let column = scope_column::<T>()?;
    let res = sqlx::query(&format!("DELETE FROM \"{}\" WHERE \"{}\" = ?", T::TABLE, column))
        .bind(scope)
        .execute(&mut **tx)
        .await
        .map_err(SyncError::storage("delete", format!("{}[{}]", T::TABLE, scope)))?;
    Ok(res.rows_affected())
}

/// Full replace: every row of `T`'s table is swapped for `rows` in one
/// transaction. Any failure leaves the previous rows in place.
#[instrument(skip_all, fields(table = T::TABLE, rows = rows.len()))]
pub async fn replace_all<T: TableRow>(pool: &Pool, rows: &[T]) -> Result<u64, SyncError> {
    let mut tx = begin(pool, T::TABLE).await?;
    let deleted = delete_all_tx::<T>(&mut tx).await?;
    BatchUpsert::for_row::<T>()
        .execute_rows(&mut tx, rows)
        .await?;
    tx.commit()
        .await
        .map_err(SyncError::storage("commit", T::TABLE))?;
    debug!(deleted, "table replaced");
    Ok(rows.len() as u64)
}

/// Scoped replace: only rows whose scope column equals `scope` are swapped.
#[instrument(skip_all, fields(table = T::TABLE, scope = %scope, rows = rows.len()))]
pub async fn replace_scope<T: TableRow>(
    pool: &Pool,
    scope: &str,
    rows: &[T],
) -> Result<u64, SyncError> {
    let mut tx = begin(pool, scope).await?;
    let deleted = delete_scope_tx::<T>(&mut tx, scope).await?;
    BatchUpsert::for_row::<T>()
        .execute_rows(&mut tx, rows)
        .await?;
    tx.commit()
        .await
        .map_err(SyncError::storage("commit", format!("{}[{}]", T::TABLE, scope)))?;
    debug!(deleted, "scope replaced");
    Ok(rows.len() as u64)
}

/// Upserts `rows` without deleting anything.
#[instrument(skip_all, fields(table = T::TABLE, rows = rows.len()))]
pub async fn upsert_rows<T: TableRow>(pool: &Pool, rows: &[T]) -> Result<u64, SyncError> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut tx = begin(pool, T::TABLE).await?;
    BatchUpsert::for_row::<T>()
        .execute_rows(&mut tx, rows)
        .await?;
    tx.commit()
        .await
        .map_err(SyncError::storage("commit", T::TABLE))?;
    Ok(rows.len() as u64)
}

/// Stores one streamed page of a scope. With `clear_first` the scope's old
/// rows are deleted in the same transaction as the page is written.
#[instrument(skip_all, fields(table = T::TABLE, scope = %scope, rows = rows.len(), clear_first))]
pub async fn store_scope_page<T: TableRow>(
    pool: &Pool,
    scope: &str,
    rows: &[T],
    clear_first: bool,
) -> Result<u64, SyncError> {
    let mut tx = begin(pool, scope).await?;
    if clear_first {
        delete_scope_tx::<T>(&mut tx, scope).await?;
    }
    BatchUpsert::for_row::<T>()
        .execute_rows(&mut tx, rows)
        .await?;
    tx.commit()
        .await
        .map_err(SyncError::storage("commit", format!("{}[{}]", T::TABLE, scope)))?;
    Ok(rows.len() as u64)
}

/// Deletes one scope's rows on its own.
pub async fn clear_scope<T: TableRow>(pool: &Pool, scope: &str) -> Result<u64, SyncError> {
    let mut tx = begin(pool, scope).await?;
    let deleted = delete_scope_tx::<T>(&mut tx, scope).await?;
    tx.commit()
        .await
        .map_err(SyncError::storage("commit", format!("{}[{}]", T::TABLE, scope)))?;
    Ok(deleted)
}

/// Repository names known locally, in stable order.
pub async fn list_repo_names(pool: &Pool) -> Result<Vec<String>, SyncError> {
    sqlx::query_scalar(&format!(
        "SELECT name FROM \"{}\" ORDER BY name",
        Repository::TABLE
    ))
    .fetch_all(pool)
    .await
    .map_err(SyncError::storage("select", Repository::TABLE))
}

/// Team slugs known locally, in stable order.
pub async fn list_team_slugs(pool: &Pool) -> Result<Vec<String>, SyncError> {
    sqlx::query_scalar(&format!("SELECT slug FROM \"{}\" ORDER BY slug", Team::TABLE))
        .fetch_all(pool)
        .await
        .map_err(SyncError::storage("select", Team::TABLE))
}

/// Highest permission each login inherits on `repo` through team membership.
#[instrument(skip_all, fields(repo = %repo))]
pub async fn team_permissions_for_repo(
    pool: &Pool,
    repo: &str,
) -> Result<BTreeMap<String, String>, SyncError> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT tu.login, rt.permission FROM repo_teams rt \
         JOIN team_users tu ON tu.team_slug = rt.team_slug \
         WHERE rt.repo_name = ?",
    )
    .bind(repo)
    .fetch_all(pool)
    .await
    .map_err(SyncError::storage("select", format!("repo_teams[{}]", repo)))?;

    let mut inherited: BTreeMap<String, String> = BTreeMap::new();
    for (login, permission) in rows {
        let merged = match inherited.get(&login) {
            Some(current) => max_permission(current, &permission),
            None => max_permission("", &permission),
        };
        inherited.insert(login, merged);
    }
    Ok(inherited)
}

pub async fn count_rows<T: TableRow>(pool: &Pool) -> Result<i64, SyncError> {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{}\"", T::TABLE))
        .fetch_one(pool)
        .await
        .map_err(SyncError::storage("count", T::TABLE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RepoTeam, RepoUser, TeamUser, User};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn user(login: &str, id: i64) -> User {
        User {
            login: login.into(),
            id,
            name: Some(login.to_uppercase()),
            email: None,
            user_type: "User".into(),
            site_admin: false,
        }
    }

    fn collaborator(repo: &str, login: &str, permission: &str) -> RepoUser {
        RepoUser {
            repo_name: repo.into(),
            login: login.into(),
            permission: permission.into(),
            effective_permission: permission.into(),
        }
    }

    async fn logins(pool: &Pool) -> Vec<String> {
        sqlx::query_scalar("SELECT login FROM users ORDER BY login")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn replace_all_is_idempotent_and_drops_leftovers() {
        let pool = setup_pool().await;
        replace_all(&pool, &[user("old", 1), user("alice", 2)])
            .await
            .unwrap();

        let fresh = vec![user("alice", 2), user("bob", 3)];
        replace_all(&pool, &fresh).await.unwrap();
        replace_all(&pool, &fresh).await.unwrap();
        assert_eq!(logins(&pool).await, vec!["alice", "bob"]);
        assert_eq!(count_rows::<User>(&pool).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn replace_scope_leaves_other_scopes() {
        let pool = setup_pool().await;
        upsert_rows(
            &pool,
            &[
                collaborator("alpha", "a1", "push"),
                collaborator("alpha", "a2", "pull"),
                collaborator("beta", "b1", "admin"),
            ],
        )
        .await
        .unwrap();

        replace_scope(&pool, "alpha", &[collaborator("alpha", "a3", "triage")])
            .await
            .unwrap();

        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT repo_name, login FROM repo_users ORDER BY repo_name, login")
                .fetch_all(&pool)
                .await
                .unwrap();
        assert_eq!(
            rows,
            vec![
                ("alpha".to_string(), "a3".to_string()),
                ("beta".to_string(), "b1".to_string()),
            ]
        );
    }

    /// Claims the users table but produces rows one value short.
    #[derive(serde::Serialize)]
    struct TruncatedUser(String);

    impl TableRow for TruncatedUser {
        const TABLE: &'static str = User::TABLE;
        const COLUMNS: &'static [&'static str] = User::COLUMNS;

        fn values(&self) -> Vec<crate::db::SqlValue> {
            vec![crate::db::SqlValue::from(self.0.as_str())]
        }
    }

    #[tokio::test]
    async fn failed_replace_rolls_back() {
        let pool = setup_pool().await;
        replace_all(&pool, &[user("keep", 1)]).await.unwrap();

        // The delete runs first; the malformed batch then aborts the transaction.
        let err = replace_all(&pool, &[TruncatedUser("new".into())])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RowWidth { .. }));
        assert_eq!(logins(&pool).await, vec!["keep"]);
    }

    #[tokio::test]
    async fn scope_replace_requires_scope_column() {
        let pool = setup_pool().await;
        let err = replace_scope(&pool, "x", &[user("a", 1)]).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidTarget(_)));
    }

    #[tokio::test]
    async fn store_scope_page_clears_only_when_asked() {
        let pool = setup_pool().await;
        upsert_rows(&pool, &[collaborator("alpha", "stale", "pull")])
            .await
            .unwrap();
        store_scope_page(&pool, "alpha", &[collaborator("alpha", "p1", "push")], true)
            .await
            .unwrap();
        store_scope_page(&pool, "alpha", &[collaborator("alpha", "p2", "push")], false)
            .await
            .unwrap();
        let logins: Vec<String> = sqlx::query_scalar(
            "SELECT login FROM repo_users WHERE repo_name = 'alpha' ORDER BY login",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(logins, vec!["p1", "p2"]);
    }

    #[tokio::test]
    async fn team_permissions_take_the_highest_grant() {
        let pool = setup_pool().await;
        upsert_rows(
            &pool,
            &[
                RepoTeam {
                    repo_name: "alpha".into(),
                    team_slug: "core".into(),
                    permission: "push".into(),
                },
                RepoTeam {
                    repo_name: "alpha".into(),
                    team_slug: "ops".into(),
                    permission: "admin".into(),
                },
            ],
        )
        .await
        .unwrap();
        upsert_rows(
            &pool,
            &[
                TeamUser {
                    team_slug: "core".into(),
                    login: "octo".into(),
                    role: "member".into(),
                },
                TeamUser {
                    team_slug: "ops".into(),
                    login: "octo".into(),
                    role: "maintainer".into(),
                },
                TeamUser {
                    team_slug: "core".into(),
                    login: "hubot".into(),
                    role: "member".into(),
                },
            ],
        )
        .await
        .unwrap();

        let inherited = team_permissions_for_repo(&pool, "alpha").await.unwrap();
        assert_eq!(inherited.get("octo").map(String::as_str), Some("admin"));
        assert_eq!(inherited.get("hubot").map(String::as_str), Some("push"));
        assert!(team_permissions_for_repo(&pool, "beta").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn candidate_lists_are_sorted() {
        let pool = setup_pool().await;
        sqlx::query(
            "INSERT INTO teams (slug, id, name) VALUES ('zeta', 1, 'Zeta'), ('alpha', 2, 'Alpha')",
        )
        .execute(&pool)
        .await
        .unwrap();
        assert_eq!(list_team_slugs(&pool).await.unwrap(), vec!["alpha", "zeta"]);
        assert!(list_repo_names(&pool).await.unwrap().is_empty());
    }
}
