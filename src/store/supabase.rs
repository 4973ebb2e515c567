//! Supabase REST ledger backend using the service_role key
//!
//! Players live in the `players` table. Score application goes through the
//! `commit_score_record` RPC, which inserts into `score_records` and updates
//! `players` in one database transaction and returns `false` for a replayed
//! (match, player) pair. The function is provisioned with the schema and
//! raises `no_data_found` (P0002) when the player does not exist.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::backend::{BackendError, CommitOutcome, LedgerBackend, Player, ScoreRecord};

/// PostgREST query parameters, percent-encoded by reqwest
pub type QueryParams<'a> = [(&'a str, String)];

/// SQLSTATE raised by `commit_score_record` for an unknown player
const NO_DATA_FOUND: &str = "P0002";
/// SQLSTATE for a score record referencing a missing player row
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Supabase client for server-side database operations
/// Uses service_role key which bypasses RLS - handle with care!
#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    service_role_key: String,
}

impl SupabaseClient {
    pub fn new(base_url: &str, service_role_key: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key: service_role_key.to_string(),
        }
    }

    /// Get the REST API URL for a table
    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
    }

    async fn check(response: Response) -> Result<Response, BackendError> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
        response
            .json()
            .await
            .map_err(|e| BackendError::Parse(e.to_string()))
    }

    fn select(&self, table: &str, query: &QueryParams<'_>) -> RequestBuilder {
        self.authed(self.client.get(self.rest_url(table)).query(query))
    }

    /// Make an authenticated GET request
    pub async fn get<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &QueryParams<'_>,
    ) -> Result<Vec<T>, BackendError> {
        let response = self.select(table, query).send().await?;
        Self::parse(Self::check(response).await?).await
    }

    /// Make an authenticated GET request expecting a single row
    pub async fn get_one<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &QueryParams<'_>,
    ) -> Result<Option<T>, BackendError> {
        let response = self
            .select(table, query)
            .header("Accept", "application/vnd.pgrst.object+json")
            .send()
            .await?;

        if response.status() == StatusCode::NOT_ACCEPTABLE {
            // No rows found
            return Ok(None);
        }

        Self::parse(Self::check(response).await?).await.map(Some)
    }

    /// Make an authenticated POST request (insert), returning the new row
    pub async fn insert<T: Serialize, R: DeserializeOwned>(
        &self,
        table: &str,
        data: &T,
    ) -> Result<R, BackendError> {
        let response = self
            .authed(self.client.post(self.rest_url(table)))
            .header("Prefer", "return=representation")
            .json(data)
            .send()
            .await?;

        // PostgREST returns an array, get first element
        let rows: Vec<R> = Self::parse(Self::check(response).await?).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::Parse("no row returned from insert".to_string()))
    }

    /// Insert, leaving existing rows untouched on conflict
    pub async fn insert_ignore<T: Serialize>(
        &self,
        table: &str,
        data: &T,
        on_conflict: &str,
    ) -> Result<(), BackendError> {
        let response = self
            .authed(
                self.client
                    .post(self.rest_url(table))
                    .query(&[("on_conflict", on_conflict)]),
            )
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(data)
            .send()
            .await?;

        Self::check(response).await.map(|_| ())
    }

    /// Call a Postgres function
    pub async fn rpc<T: Serialize, R: DeserializeOwned>(
        &self,
        function: &str,
        args: &T,
    ) -> Result<R, BackendError> {
        let url = self.rest_url(&format!("rpc/{}", function));
        let response = self
            .authed(self.client.post(&url))
            .json(args)
            .send()
            .await?;

        Self::parse(Self::check(response).await?).await
    }
}

/// Ledger backend over the Supabase REST API
pub struct SupabaseBackend {
    client: SupabaseClient,
}

impl SupabaseBackend {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }
}

#[derive(Serialize)]
struct NewPlayer<'a> {
    player_name: &'a str,
    created_at: chrono::DateTime<Utc>,
}

#[derive(Serialize)]
struct CommitArgs<'a> {
    p_match_id: uuid::Uuid,
    p_player_name: &'a str,
    p_delta: i64,
    p_recorded_at: chrono::DateTime<Utc>,
}

fn name_filter(name: &str) -> [(&'static str, String); 1] {
    [("player_name", format!("eq.{}", name))]
}

/// PostgREST error body
#[derive(Deserialize)]
struct PgError {
    code: Option<String>,
}

fn sqlstate(body: &str) -> Option<String> {
    serde_json::from_str::<PgError>(body).ok()?.code
}

#[async_trait]
impl LedgerBackend for SupabaseBackend {
    fn name(&self) -> &'static str {
        "supabase"
    }

    async fn register(&self, name: &str) -> Result<Player, BackendError> {
        let row = NewPlayer {
            player_name: name,
            created_at: Utc::now(),
        };
        match self.client.insert("players", &row).await {
            Err(BackendError::Api { status: 409, .. }) => Err(BackendError::Conflict(name.to_string())),
            other => other,
        }
    }

    async fn ensure_player(&self, name: &str) -> Result<Player, BackendError> {
        let row = NewPlayer {
            player_name: name,
            created_at: Utc::now(),
        };
        self.client
            .insert_ignore("players", &row, "player_name")
            .await?;
        self.player(name)
            .await?
            .ok_or_else(|| BackendError::UnknownPlayer(name.to_string()))
    }

    async fn player(&self, name: &str) -> Result<Option<Player>, BackendError> {
        self.client.get_one("players", &name_filter(name)).await
    }

    async fn apply(&self, record: &ScoreRecord) -> Result<CommitOutcome, BackendError> {
        let args = CommitArgs {
            p_match_id: record.match_id,
            p_player_name: &record.player_id,
            p_delta: record.delta,
            p_recorded_at: record.recorded_at,
        };
        let applied: bool = match self.client.rpc("commit_score_record", &args).await {
            Err(BackendError::Api { body, .. })
                if matches!(
                    sqlstate(&body).as_deref(),
                    Some(NO_DATA_FOUND | FOREIGN_KEY_VIOLATION)
                ) =>
            {
                return Err(BackendError::UnknownPlayer(record.player_id.clone()))
            }
            other => other?,
        };

        Ok(if applied {
            CommitOutcome::Applied
        } else {
            CommitOutcome::Duplicate
        })
    }

    async fn top(&self, limit: usize) -> Result<Vec<Player>, BackendError> {
        let query = [
            ("select", "*".to_string()),
            ("order", "score.desc,id.asc".to_string()),
            ("limit", limit.to_string()),
        ];
        self.client.get("players", &query).await
    }
}
