use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

use crate::db::models::{
    Benefit, CampaignSnapshot, DropCampaignRow, DropSnapshot, GameRow, GameSnapshot, Organization,
    TimeBasedDrop,
};
use crate::error::{AppError, AppResult};

/// Storage for per-game campaign snapshots.
///
/// `save` replaces the stored tree of the game as a whole and `delete` removes
/// it with every child row. Both are all-or-nothing.
#[async_trait]
pub trait SnapshotRepository: Send + Sync + 'static {
    async fn load(&self, game_id: &str) -> AppResult<Option<GameSnapshot>>;
    async fn save(&self, snapshot: &GameSnapshot) -> AppResult<()>;
    /// Returns whether the game existed.
    async fn delete(&self, game_id: &str) -> AppResult<bool>;
    async fn list_game_ids(&self) -> AppResult<Vec<String>>;
    /// Whether the game has been stored, without loading its tree.
    async fn exists(&self, game_id: &str) -> AppResult<bool>;
}

pub struct SqliteSnapshotRepository {
    pool: SqlitePool,
}

impl SqliteSnapshotRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Explicit cascades, deepest child first
// ============================================================================

async fn delete_campaigns_of_game(conn: &mut SqliteConnection, game_id: &str) -> AppResult<()> {
    sqlx::query(
        r#"
        DELETE FROM benefits WHERE drop_id IN (
            SELECT d.id FROM drops d
            JOIN drop_campaigns c ON c.id = d.campaign_id
            WHERE c.game_id = ?
        )
        "#,
    )
    .bind(game_id)
    .execute(&mut *conn)
    .await
    .map_err(AppError::Database)?;

    sqlx::query(
        "DELETE FROM drops WHERE campaign_id IN (SELECT id FROM drop_campaigns WHERE game_id = ?)",
    )
    .bind(game_id)
    .execute(&mut *conn)
    .await
    .map_err(AppError::Database)?;

    sqlx::query("DELETE FROM drop_campaigns WHERE game_id = ?")
        .bind(game_id)
        .execute(&mut *conn)
        .await
        .map_err(AppError::Database)?;

    Ok(())
}

/// Remove a campaign wherever it is stored. Twitch occasionally moves a campaign
/// between games, and the id must not collide with the row under the old game.
async fn delete_campaign(conn: &mut SqliteConnection, campaign_id: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM benefits WHERE drop_id IN (SELECT id FROM drops WHERE campaign_id = ?)")
        .bind(campaign_id)
        .execute(&mut *conn)
        .await
        .map_err(AppError::Database)?;

    sqlx::query("DELETE FROM drops WHERE campaign_id = ?")
        .bind(campaign_id)
        .execute(&mut *conn)
        .await
        .map_err(AppError::Database)?;

    sqlx::query("DELETE FROM drop_campaigns WHERE id = ?")
        .bind(campaign_id)
        .execute(&mut *conn)
        .await
        .map_err(AppError::Database)?;

    Ok(())
}

async fn delete_drop(conn: &mut SqliteConnection, drop_id: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM benefits WHERE drop_id = ?")
        .bind(drop_id)
        .execute(&mut *conn)
        .await
        .map_err(AppError::Database)?;

    sqlx::query("DELETE FROM drops WHERE id = ?")
        .bind(drop_id)
        .execute(&mut *conn)
        .await
        .map_err(AppError::Database)?;

    Ok(())
}

async fn upsert_organization(conn: &mut SqliteConnection, org: &Organization) -> AppResult<()> {
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO organizations (id, name, created_at, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = COALESCE(excluded.name, organizations.name),
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&org.id)
    .bind(&org.name)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(AppError::Database)?;
    Ok(())
}

#[async_trait]
impl SnapshotRepository for SqliteSnapshotRepository {
    async fn load(&self, game_id: &str) -> AppResult<Option<GameSnapshot>> {
        let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

        let game = sqlx::query_as::<_, GameRow>(
            r#"
            SELECT id, name, slug, box_art_url, organization_id, snapshot_taken_at
            FROM games
            WHERE id = ?
            "#,
        )
        .bind(game_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let Some(game) = game else {
            return Ok(None);
        };

        let organization = match &game.organization_id {
            Some(org_id) => sqlx::query_as::<_, Organization>(
                "SELECT id, name FROM organizations WHERE id = ?",
            )
            .bind(org_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(AppError::Database)?,
            None => None,
        };

        let campaigns = sqlx::query_as::<_, DropCampaignRow>(
            r#"
            SELECT
                id, game_id, name, description, status_override,
                starts_at, ends_at, details_url, account_link_url, image_url
            FROM drop_campaigns
            WHERE game_id = ?
            "#,
        )
        .bind(game_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let drops = sqlx::query_as::<_, TimeBasedDrop>(
            r#"
            SELECT d.id, d.campaign_id, d.name, d.required_minutes_watched
            FROM drops d
            JOIN drop_campaigns c ON c.id = d.campaign_id
            WHERE c.game_id = ?
            "#,
        )
        .bind(game_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        let benefits = sqlx::query_as::<_, Benefit>(
            r#"
            SELECT b.id, b.drop_id, b.name, b.image_url, b.entitlement_limit
            FROM benefits b
            JOIN drops d ON d.id = b.drop_id
            JOIN drop_campaigns c ON c.id = d.campaign_id
            WHERE c.game_id = ?
            ORDER BY b.drop_id, b.position
            "#,
        )
        .bind(game_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;

        let mut benefits_by_drop: HashMap<String, Vec<Benefit>> = HashMap::new();
        for benefit in benefits {
            benefits_by_drop
                .entry(benefit.drop_id.clone())
                .or_default()
                .push(benefit);
        }

        let mut drops_by_campaign: HashMap<String, Vec<DropSnapshot>> = HashMap::new();
        for drop in drops {
            let benefits = benefits_by_drop.remove(&drop.id).unwrap_or_default();
            drops_by_campaign
                .entry(drop.campaign_id.clone())
                .or_default()
                .push(DropSnapshot { drop, benefits });
        }

        let campaigns = campaigns
            .into_iter()
            .map(|row| {
                let drops = drops_by_campaign.remove(&row.id).unwrap_or_default();
                CampaignSnapshot {
                    campaign: row.into(),
                    drops,
                }
            })
            .collect();

        let taken_at = game.snapshot_taken_at;
        let mut snapshot = GameSnapshot {
            game: game.into(),
            organization,
            taken_at,
            campaigns,
        };
        snapshot.normalize();
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &GameSnapshot) -> AppResult<()> {
        let now = Utc::now();
        let game = &snapshot.game;
        let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

        if let Some(org) = &snapshot.organization {
            upsert_organization(&mut tx, org).await?;
        }
        if let Some(org_id) = &game.organization_id {
            // The game may reference an organization the payload did not describe.
            sqlx::query(
                "INSERT OR IGNORE INTO organizations (id, name, created_at, updated_at) VALUES (?, NULL, ?, ?)",
            )
            .bind(org_id)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;
        }

        sqlx::query(
            r#"
            INSERT INTO games (
                id, name, slug, box_art_url, organization_id,
                snapshot_taken_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                slug = excluded.slug,
                box_art_url = excluded.box_art_url,
                organization_id = excluded.organization_id,
                snapshot_taken_at = excluded.snapshot_taken_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&game.id)
        .bind(&game.name)
        .bind(&game.slug)
        .bind(&game.box_art_url)
        .bind(&game.organization_id)
        .bind(snapshot.taken_at)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(AppError::Database)?;

        delete_campaigns_of_game(&mut tx, &game.id).await?;

        for entry in &snapshot.campaigns {
            let campaign = &entry.campaign;
            delete_campaign(&mut tx, &campaign.id).await?;

            sqlx::query(
                r#"
                INSERT INTO drop_campaigns (
                    id, game_id, name, description, status_override,
                    starts_at, ends_at, details_url, account_link_url, image_url
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&campaign.id)
            .bind(&game.id)
            .bind(&campaign.name)
            .bind(&campaign.description)
            .bind(campaign.status_override.map(|s| s.as_str()))
            .bind(campaign.starts_at)
            .bind(campaign.ends_at)
            .bind(&campaign.details_url)
            .bind(&campaign.account_link_url)
            .bind(&campaign.image_url)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

            for drop_entry in &entry.drops {
                let drop = &drop_entry.drop;
                delete_drop(&mut tx, &drop.id).await?;

                sqlx::query(
                    r#"
                    INSERT INTO drops (id, campaign_id, name, required_minutes_watched)
                    VALUES (?, ?, ?, ?)
                    "#,
                )
                .bind(&drop.id)
                .bind(&campaign.id)
                .bind(&drop.name)
                .bind(drop.required_minutes_watched)
                .execute(&mut *tx)
                .await
                .map_err(AppError::Database)?;

                for (position, benefit) in drop_entry.benefits.iter().enumerate() {
                    sqlx::query(
                        r#"
                        INSERT INTO benefits (id, drop_id, name, image_url, entitlement_limit, position)
                        VALUES (?, ?, ?, ?, ?, ?)
                        "#,
                    )
                    .bind(&benefit.id)
                    .bind(&drop.id)
                    .bind(&benefit.name)
                    .bind(&benefit.image_url)
                    .bind(benefit.entitlement_limit)
                    .bind(position as i64)
                    .execute(&mut *tx)
                    .await
                    .map_err(AppError::Database)?;
                }
            }
        }

        tx.commit().await.map_err(AppError::Database)?;
        Ok(())
    }

    async fn delete(&self, game_id: &str) -> AppResult<bool> {
        let mut tx = self.pool.begin().await.map_err(AppError::Database)?;

        delete_campaigns_of_game(&mut tx, game_id).await?;

        let result = sqlx::query("DELETE FROM games WHERE id = ?")
            .bind(game_id)
            .execute(&mut *tx)
            .await
            .map_err(AppError::Database)?;

        tx.commit().await.map_err(AppError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_game_ids(&self) -> AppResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>("SELECT id FROM games ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(ids)
    }

    async fn exists(&self, game_id: &str) -> AppResult<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT 1 FROM games WHERE id = ?")
            .bind(game_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::Database)?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, benefit, campaign_entry, drop_entry, game_snapshot, test_pool};

    fn sample() -> GameSnapshot {
        let mut snapshot = game_snapshot(
            "g1",
            at(2024, 1, 5),
            vec![campaign_entry(
                "g1",
                "c1",
                at(2024, 1, 1),
                at(2024, 1, 10),
                vec![
                    drop_entry("c1", "d1", 30, vec![benefit("d1", "b2"), benefit("d1", "b1")]),
                    drop_entry("c1", "d2", 120, vec![benefit("d2", "b1")]),
                ],
            )],
        );
        snapshot.game.organization_id = Some("o1".to_string());
        snapshot.organization = Some(Organization {
            id: "o1".to_string(),
            name: Some("Microsoft".to_string()),
        });
        snapshot.campaigns[0].campaign.details_url = Some("https://example.com".to_string());
        snapshot
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let repo = SqliteSnapshotRepository::new(test_pool().await);
        let snapshot = sample();

        repo.save(&snapshot).await.unwrap();
        let loaded = repo.load("g1").await.unwrap().unwrap();

        assert_eq!(loaded, snapshot);
        assert_eq!(repo.list_game_ids().await.unwrap(), vec!["g1".to_string()]);
    }

    #[tokio::test]
    async fn load_missing_game_is_none() {
        let repo = SqliteSnapshotRepository::new(test_pool().await);
        assert!(repo.load("nope").await.unwrap().is_none());
        assert!(!repo.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn stored_game_exists() {
        let repo = SqliteSnapshotRepository::new(test_pool().await);
        repo.save(&game_snapshot("g1", at(2024, 1, 5), vec![])).await.unwrap();
        assert!(repo.exists("g1").await.unwrap());
        assert!(!repo.exists("g2").await.unwrap());
    }

    #[tokio::test]
    async fn save_replaces_the_whole_tree() {
        let repo = SqliteSnapshotRepository::new(test_pool().await);
        repo.save(&sample()).await.unwrap();

        let mut next = sample();
        next.taken_at = at(2024, 1, 6);
        next.campaigns[0].drops.remove(1);
        next.campaigns[0].drops[0].benefits.truncate(1);
        repo.save(&next).await.unwrap();

        let loaded = repo.load("g1").await.unwrap().unwrap();
        assert_eq!(loaded, next);

        let drop_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM drops")
            .fetch_one(&repo.pool)
            .await
            .unwrap();
        assert_eq!(drop_rows, 1);
    }

    #[tokio::test]
    async fn campaign_moving_between_games_is_not_duplicated() {
        let repo = SqliteSnapshotRepository::new(test_pool().await);
        repo.save(&sample()).await.unwrap();

        let mut moved = game_snapshot(
            "g2",
            at(2024, 1, 6),
            vec![campaign_entry(
                "g2",
                "c1",
                at(2024, 1, 1),
                at(2024, 1, 10),
                vec![drop_entry("c1", "d1", 30, vec![])],
            )],
        );
        moved.normalize();
        repo.save(&moved).await.unwrap();

        let old = repo.load("g1").await.unwrap().unwrap();
        assert!(old.campaigns.is_empty());
        assert_eq!(repo.load("g2").await.unwrap().unwrap(), moved);
    }

    #[tokio::test]
    async fn delete_cascades_through_children() {
        let repo = SqliteSnapshotRepository::new(test_pool().await);
        repo.save(&sample()).await.unwrap();

        assert!(repo.delete("g1").await.unwrap());
        assert!(!repo.delete("g1").await.unwrap());
        assert!(repo.load("g1").await.unwrap().is_none());

        for table in ["drop_campaigns", "drops", "benefits"] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&repo.pool)
                .await
                .unwrap();
            assert_eq!(count, 0, "{} not emptied", table);
        }

        // Organizations are shared and outlive their games.
        let orgs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM organizations")
            .fetch_one(&repo.pool)
            .await
            .unwrap();
        assert_eq!(orgs, 1);
    }
}
