//! Parsing of Twitch GQL drop-campaign dumps into per-game snapshots.
//!
//! Two response shapes are understood:
//! - `data.currentUser.dropCampaigns[]`, the inventory/list query
//! - `data.user.dropCampaign`, the campaign details query with drops and benefits
//!
//! A payload is one response object or an array of them. Records describing
//! the same campaign are merged in payload order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::db::models::{
    Benefit, CampaignSnapshot, CampaignStatus, DropCampaign, DropSnapshot, Game, GameSnapshot,
    Organization, SnapshotBatch, TimeBasedDrop,
};
use crate::error::{AppError, AppResult};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum GqlPayload {
    Many(Vec<GqlResponse>),
    One(GqlResponse),
}

#[derive(Debug, Deserialize)]
struct GqlResponse {
    data: Option<GqlData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlData {
    current_user: Option<GqlCurrentUser>,
    user: Option<GqlUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlCurrentUser {
    drop_campaigns: Option<Vec<GqlCampaign>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlUser {
    drop_campaign: Option<GqlCampaign>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlCampaign {
    id: String,
    name: Option<String>,
    description: Option<String>,
    start_at: Option<DateTime<Utc>>,
    end_at: Option<DateTime<Utc>>,
    status: Option<String>,
    #[serde(rename = "detailsURL")]
    details_url: Option<String>,
    #[serde(rename = "accountLinkURL")]
    account_link_url: Option<String>,
    #[serde(rename = "imageURL")]
    image_url: Option<String>,
    owner: Option<GqlOwner>,
    game: Option<GqlGame>,
    time_based_drops: Option<Vec<GqlDrop>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GqlOwner {
    id: String,
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlGame {
    id: String,
    slug: Option<String>,
    display_name: Option<String>,
    name: Option<String>,
    #[serde(rename = "boxArtURL")]
    box_art_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlDrop {
    id: String,
    name: Option<String>,
    required_minutes_watched: Option<i64>,
    benefit_edges: Option<Vec<GqlBenefitEdge>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GqlBenefitEdge {
    benefit: GqlBenefit,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GqlBenefit {
    id: String,
    name: Option<String>,
    #[serde(rename = "imageAssetURL")]
    image_asset_url: Option<String>,
    entitlement_limit: Option<i64>,
}

/// Later values win field by field; drops are unioned by id.
fn merge_campaign(earlier: GqlCampaign, later: GqlCampaign) -> GqlCampaign {
    let time_based_drops = match (earlier.time_based_drops, later.time_based_drops) {
        (Some(a), Some(b)) => Some(union_by_id(a, b, |d| d.id.clone(), merge_drop)),
        (a, b) => b.or(a),
    };

    GqlCampaign {
        id: later.id,
        name: later.name.or(earlier.name),
        description: later.description.or(earlier.description),
        start_at: later.start_at.or(earlier.start_at),
        end_at: later.end_at.or(earlier.end_at),
        status: later.status.or(earlier.status),
        details_url: later.details_url.or(earlier.details_url),
        account_link_url: later.account_link_url.or(earlier.account_link_url),
        image_url: later.image_url.or(earlier.image_url),
        owner: later.owner.or(earlier.owner),
        game: match (earlier.game, later.game) {
            (Some(a), Some(b)) if a.id == b.id => Some(merge_game(a, b)),
            (a, b) => b.or(a),
        },
        time_based_drops,
    }
}

fn merge_game(earlier: GqlGame, later: GqlGame) -> GqlGame {
    GqlGame {
        id: later.id,
        slug: later.slug.or(earlier.slug),
        display_name: later.display_name.or(earlier.display_name),
        name: later.name.or(earlier.name),
        box_art_url: later.box_art_url.or(earlier.box_art_url),
    }
}

fn merge_drop(earlier: GqlDrop, later: GqlDrop) -> GqlDrop {
    let benefit_edges = match (earlier.benefit_edges, later.benefit_edges) {
        (Some(a), Some(b)) => Some(union_by_id(a, b, |e| e.benefit.id.clone(), |_, b| b)),
        (a, b) => b.or(a),
    };
    GqlDrop {
        id: later.id,
        name: later.name.or(earlier.name),
        required_minutes_watched: later
            .required_minutes_watched
            .or(earlier.required_minutes_watched),
        benefit_edges,
    }
}

/// Union of two lists keyed by `key`, keeping first-seen order and merging
/// entries present in both.
fn union_by_id<T, K, M>(earlier: Vec<T>, later: Vec<T>, key: K, merge: M) -> Vec<T>
where
    K: Fn(&T) -> String,
    M: Fn(T, T) -> T,
{
    let mut order: Vec<String> = Vec::new();
    let mut items: HashMap<String, T> = HashMap::new();
    for item in earlier.into_iter().chain(later) {
        let id = key(&item);
        let merged = match items.remove(&id) {
            Some(existing) => merge(existing, item),
            None => {
                order.push(id.clone());
                item
            }
        };
        items.insert(id, merged);
    }
    order
        .into_iter()
        .filter_map(|id| items.remove(&id))
        .collect()
}

fn collect_campaigns(payload: GqlPayload) -> Vec<GqlCampaign> {
    let responses = match payload {
        GqlPayload::Many(responses) => responses,
        GqlPayload::One(response) => vec![response],
    };

    let mut order: Vec<String> = Vec::new();
    let mut campaigns: HashMap<String, GqlCampaign> = HashMap::new();

    let records = responses
        .into_iter()
        .filter_map(|r| r.data)
        .flat_map(|data| {
            let listed = data
                .current_user
                .and_then(|u| u.drop_campaigns)
                .unwrap_or_default();
            let detail = data.user.and_then(|u| u.drop_campaign);
            listed.into_iter().chain(detail)
        });

    for record in records {
        let merged = match campaigns.remove(&record.id) {
            Some(existing) => merge_campaign(existing, record),
            None => {
                order.push(record.id.clone());
                record
            }
        };
        campaigns.insert(merged.id.clone(), merged);
    }

    order
        .into_iter()
        .filter_map(|id| campaigns.remove(&id))
        .collect()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn convert_drop(campaign_id: &str, drop: GqlDrop) -> DropSnapshot {
    let benefits = drop
        .benefit_edges
        .unwrap_or_default()
        .into_iter()
        .map(|edge| {
            let b = edge.benefit;
            Benefit {
                name: non_empty(b.name).unwrap_or_else(|| b.id.clone()),
                id: b.id,
                drop_id: drop.id.clone(),
                image_url: non_empty(b.image_asset_url),
                entitlement_limit: b.entitlement_limit,
            }
        })
        .collect();

    DropSnapshot {
        drop: TimeBasedDrop {
            name: non_empty(drop.name).unwrap_or_else(|| drop.id.clone()),
            id: drop.id,
            campaign_id: campaign_id.to_string(),
            required_minutes_watched: drop.required_minutes_watched.unwrap_or(0),
        },
        benefits,
    }
}

/// Parse one GQL dump into a validated batch stamped with `taken_at`.
///
/// Games come out sorted by id, campaigns and drops in canonical order.
pub fn parse_payload(raw: &str, taken_at: DateTime<Utc>) -> AppResult<SnapshotBatch> {
    let payload: GqlPayload = serde_json::from_str(raw)
        .map_err(|e| AppError::SnapshotInvalid(format!("payload is not a GQL response: {}", e)))?;

    let campaigns = collect_campaigns(payload);
    if campaigns.is_empty() {
        return Err(AppError::SnapshotInvalid(
            "payload contains no drop campaigns".to_string(),
        ));
    }

    let mut games: HashMap<String, GameSnapshot> = HashMap::new();

    for record in campaigns {
        let Some(gql_game) = record.game else {
            return Err(AppError::SnapshotInvalid(format!(
                "campaign {} has no game",
                record.id
            )));
        };
        let (Some(starts_at), Some(ends_at)) = (record.start_at, record.end_at) else {
            return Err(AppError::SnapshotInvalid(format!(
                "campaign {} is missing its start or end time",
                record.id
            )));
        };

        let organization = record.owner.map(|o| Organization {
            id: o.id,
            name: non_empty(o.name),
        });

        let snapshot = games.entry(gql_game.id.clone()).or_insert_with(|| {
            GameSnapshot::empty(
                Game {
                    id: gql_game.id.clone(),
                    name: gql_game.id.clone(),
                    slug: None,
                    box_art_url: None,
                    organization_id: None,
                },
                None,
                taken_at,
            )
        });

        // Game details may be spread over several campaigns; later records win.
        if let Some(name) = non_empty(gql_game.display_name).or(non_empty(gql_game.name)) {
            snapshot.game.name = name;
        }
        if let Some(slug) = non_empty(gql_game.slug) {
            snapshot.game.slug = Some(slug);
        }
        if let Some(box_art) = non_empty(gql_game.box_art_url) {
            snapshot.game.box_art_url = Some(box_art);
        }
        if snapshot.organization.is_none() {
            if let Some(org) = organization {
                snapshot.game.organization_id = Some(org.id.clone());
                snapshot.organization = Some(org);
            }
        }

        let status_override = record
            .status
            .as_deref()
            .and_then(CampaignStatus::from_str)
            .filter(|s| *s == CampaignStatus::Expired);

        let drops = record
            .time_based_drops
            .unwrap_or_default()
            .into_iter()
            .map(|d| convert_drop(&record.id, d))
            .collect();

        snapshot.campaigns.push(CampaignSnapshot {
            campaign: DropCampaign {
                name: non_empty(record.name).unwrap_or_else(|| record.id.clone()),
                id: record.id,
                game_id: gql_game.id,
                description: non_empty(record.description),
                status_override,
                starts_at,
                ends_at,
                details_url: non_empty(record.details_url),
                account_link_url: non_empty(record.account_link_url),
                image_url: non_empty(record.image_url),
            },
            drops,
        });
    }

    let mut games: Vec<GameSnapshot> = games.into_values().collect();
    games.sort_by(|a, b| a.game.id.cmp(&b.game.id));
    for game in &mut games {
        game.normalize();
    }

    let batch = SnapshotBatch { taken_at, games };
    batch.validate()?;
    Ok(batch)
}

/// Every `*.json` file under `dir`, searched recursively, merged into one
/// payload together with the number of files read.
///
/// Each file holds one GQL response or an array of them. Files are taken in
/// path order, so a later file wins when two describe the same campaign.
/// A file that is not valid JSON rejects the whole directory.
pub async fn read_dump_dir(dir: &Path) -> AppResult<Option<(usize, String)>> {
    let mut pending: Vec<PathBuf> = vec![dir.to_path_buf()];
    let mut files: Vec<PathBuf> = Vec::new();

    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!(
                "Failed to read ingest directory {}: {}",
                current.display(),
                e
            ))
        })?;

        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to list ingest directory: {}", e))
        })? {
            let path = entry.path();
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_dir() {
                pending.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
    }

    if files.is_empty() {
        return Ok(None);
    }
    files.sort();

    let mut responses: Vec<serde_json::Value> = Vec::new();
    for path in &files {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!("Failed to read {}: {}", path.display(), e))
        })?;
        let value: serde_json::Value = serde_json::from_str(&contents).map_err(|e| {
            AppError::SnapshotInvalid(format!("{} is not valid JSON: {}", path.display(), e))
        })?;
        match value {
            serde_json::Value::Array(items) => responses.extend(items),
            other => responses.push(other),
        }
    }

    Ok(Some((files.len(), serde_json::Value::Array(responses).to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::at;
    use serde_json::json;

    fn list_response() -> serde_json::Value {
        json!({
            "data": {
                "currentUser": {
                    "dropCampaigns": [
                        {
                            "id": "c2",
                            "name": "Season 2",
                            "status": "ACTIVE",
                            "startAt": "2024-08-01T00:00:00Z",
                            "endAt": "2024-08-12T05:59:59.999Z",
                            "owner": { "id": "o1", "name": "Studio" },
                            "game": {
                                "id": "509658",
                                "slug": "halo-infinite",
                                "displayName": "Halo Infinite",
                                "boxArtURL": "https://example.com/box.jpg"
                            }
                        },
                        {
                            "id": "c1",
                            "name": "Season 1",
                            "status": "EXPIRED",
                            "startAt": "2024-07-01T00:00:00Z",
                            "endAt": "2024-09-01T00:00:00Z",
                            "game": { "id": "509658", "displayName": "Halo Infinite" }
                        },
                        {
                            "id": "c3",
                            "name": "Launch",
                            "startAt": "2024-08-05T00:00:00Z",
                            "endAt": "2024-08-20T00:00:00Z",
                            "game": { "id": "21779", "displayName": "League of Legends" }
                        }
                    ]
                }
            }
        })
    }

    fn detail_response() -> serde_json::Value {
        json!({
            "data": {
                "user": {
                    "dropCampaign": {
                        "id": "c2",
                        "description": "Watch to earn",
                        "detailsURL": "https://example.com/c2",
                        "game": { "id": "509658" },
                        "timeBasedDrops": [
                            {
                                "id": "d2",
                                "name": "Helmet",
                                "requiredMinutesWatched": 120,
                                "benefitEdges": [
                                    { "benefit": { "id": "b2", "name": "Helmet", "entitlementLimit": 1 } }
                                ]
                            },
                            {
                                "id": "d1",
                                "name": "Emblem",
                                "requiredMinutesWatched": 30,
                                "benefitEdges": [
                                    { "benefit": { "id": "b1", "name": "Emblem", "imageAssetURL": "https://example.com/b1.png" } }
                                ]
                            }
                        ]
                    }
                }
            }
        })
    }

    #[test]
    fn parses_list_and_detail_responses() {
        let raw = json!([list_response(), detail_response()]).to_string();
        let batch = parse_payload(&raw, at(2024, 8, 6)).unwrap();

        let ids: Vec<_> = batch.games.iter().map(|g| g.game.id.as_str()).collect();
        assert_eq!(ids, vec!["21779", "509658"]);
        assert_eq!(batch.campaign_count(), 3);

        let halo = &batch.games[1];
        assert_eq!(halo.game.name, "Halo Infinite");
        assert_eq!(halo.game.slug.as_deref(), Some("halo-infinite"));
        assert_eq!(halo.game.organization_id.as_deref(), Some("o1"));
        assert_eq!(halo.organization.as_ref().unwrap().display_name(), "Studio");
        assert!(halo.taken_at == batch.taken_at);

        let campaign_ids: Vec<_> = halo.campaigns.iter().map(|c| c.campaign.id.as_str()).collect();
        assert_eq!(campaign_ids, vec!["c1", "c2"]);
    }

    #[test]
    fn records_for_one_campaign_are_merged() {
        let raw = json!([list_response(), detail_response()]).to_string();
        let batch = parse_payload(&raw, at(2024, 8, 6)).unwrap();
        let c2 = batch.games[1].find_campaign("c2").unwrap();

        assert_eq!(c2.campaign.name, "Season 2");
        assert_eq!(c2.campaign.description.as_deref(), Some("Watch to earn"));
        assert_eq!(c2.campaign.details_url.as_deref(), Some("https://example.com/c2"));

        let drop_ids: Vec<_> = c2.drops.iter().map(|d| d.drop.id.as_str()).collect();
        assert_eq!(drop_ids, vec!["d1", "d2"]);
        assert_eq!(c2.drops[0].benefits[0].drop_id, "d1");
        assert_eq!(
            c2.drops[0].benefits[0].image_url.as_deref(),
            Some("https://example.com/b1.png")
        );
    }

    #[test]
    fn drops_from_repeated_details_are_unioned() {
        let mut second = detail_response();
        second["data"]["user"]["dropCampaign"]["timeBasedDrops"] = json!([
            { "id": "d3", "name": "Armor", "requiredMinutesWatched": 240 }
        ]);
        let raw = json!([list_response(), detail_response(), second]).to_string();
        let batch = parse_payload(&raw, at(2024, 8, 6)).unwrap();
        let c2 = batch.games[1].find_campaign("c2").unwrap();

        let drop_ids: Vec<_> = c2.drops.iter().map(|d| d.drop.id.as_str()).collect();
        assert_eq!(drop_ids, vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn only_expired_status_is_kept() {
        let batch = parse_payload(&list_response().to_string(), at(2024, 8, 6)).unwrap();
        let halo = &batch.games[1];

        assert_eq!(
            halo.find_campaign("c1").unwrap().campaign.status_override,
            Some(CampaignStatus::Expired)
        );
        assert_eq!(halo.find_campaign("c2").unwrap().campaign.status_override, None);
    }

    #[test]
    fn rejects_non_json_and_empty_payloads() {
        let err = parse_payload("not json", at(2024, 8, 6)).unwrap_err();
        assert!(matches!(err, AppError::SnapshotInvalid(_)));

        let empty = json!({ "data": { "currentUser": { "dropCampaigns": [] } } }).to_string();
        let err = parse_payload(&empty, at(2024, 8, 6)).unwrap_err();
        assert!(matches!(err, AppError::SnapshotInvalid(_)));
    }

    #[test]
    fn rejects_campaign_without_game_or_window() {
        let mut no_game = list_response();
        no_game["data"]["currentUser"]["dropCampaigns"][0]["game"] = json!(null);
        let err = parse_payload(&no_game.to_string(), at(2024, 8, 6)).unwrap_err();
        assert!(err.to_string().contains("has no game"));

        let mut no_end = list_response();
        no_end["data"]["currentUser"]["dropCampaigns"][2]
            .as_object_mut()
            .unwrap()
            .remove("endAt");
        let err = parse_payload(&no_end.to_string(), at(2024, 8, 6)).unwrap_err();
        assert!(err.to_string().contains("start or end"));
    }

    #[test]
    fn rejects_inverted_window_and_negative_minutes() {
        let mut inverted = list_response();
        inverted["data"]["currentUser"]["dropCampaigns"][2]["endAt"] = json!("2024-08-01T00:00:00Z");
        let err = parse_payload(&inverted.to_string(), at(2024, 8, 6)).unwrap_err();
        assert!(err.to_string().contains("starts after it ends"));

        let mut negative = detail_response();
        negative["data"]["user"]["dropCampaign"]["timeBasedDrops"][0]["requiredMinutesWatched"] =
            json!(-5);
        negative["data"]["user"]["dropCampaign"]["startAt"] = json!("2024-08-01T00:00:00Z");
        negative["data"]["user"]["dropCampaign"]["endAt"] = json!("2024-08-10T00:00:00Z");
        let err = parse_payload(&negative.to_string(), at(2024, 8, 6)).unwrap_err();
        assert!(err.to_string().contains("negative watch time"));
    }

    #[test]
    fn rejects_drop_shared_by_two_campaigns_of_a_game() {
        let mut raw = list_response();
        raw["data"]["currentUser"]["dropCampaigns"][0]["timeBasedDrops"] =
            json!([{ "id": "dx", "name": "A", "requiredMinutesWatched": 10 }]);
        raw["data"]["currentUser"]["dropCampaigns"][1]["timeBasedDrops"] =
            json!([{ "id": "dx", "name": "A", "requiredMinutesWatched": 10 }]);

        let err = parse_payload(&raw.to_string(), at(2024, 8, 6)).unwrap_err();
        assert!(err.to_string().contains("duplicate drop dx"));
    }

    #[tokio::test]
    async fn dumps_are_read_recursively_and_merged() {
        let dir = std::env::temp_dir().join(format!("drops-ingest-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(dir.join("details")).await.unwrap();
        tokio::fs::write(dir.join("inventory.json"), list_response().to_string())
            .await
            .unwrap();
        tokio::fs::write(
            dir.join("details").join("c2.json"),
            json!([detail_response()]).to_string(),
        )
        .await
        .unwrap();
        tokio::fs::write(dir.join("notes.txt"), "ignored").await.unwrap();

        let (files, raw) = read_dump_dir(&dir).await.unwrap().unwrap();
        assert_eq!(files, 2);

        let batch = parse_payload(&raw, at(2024, 8, 6)).unwrap();
        let ids: Vec<_> = batch.games.iter().map(|g| g.game.id.as_str()).collect();
        assert_eq!(ids, vec!["21779", "509658"]);
        let halo = &batch.games[1];
        let season2 = halo
            .campaigns
            .iter()
            .find(|c| c.campaign.id == "c2")
            .unwrap();
        assert_eq!(season2.drops.len(), 2);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn broken_dump_file_rejects_the_directory() {
        let dir = std::env::temp_dir().join(format!("drops-ingest-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("a.json"), list_response().to_string())
            .await
            .unwrap();
        tokio::fs::write(dir.join("b.json"), "{\"data\": ").await.unwrap();

        let err = read_dump_dir(&dir).await.unwrap_err();
        assert!(matches!(err, AppError::SnapshotInvalid(_)));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn empty_directory_has_no_dump() {
        let dir = std::env::temp_dir().join(format!("drops-ingest-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        assert!(read_dump_dir(&dir).await.unwrap().is_none());
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
