use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::{Client, RequestBuilder};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use super::{NewSignalingMessage, SignalingMessage, SignalingStore};
use crate::config::Config;
use crate::error::SignalingError;
use crate::session::SessionId;

/// How far behind the newest row each poll looks again. `created_at` is stamped
/// when the inserting transaction starts, so concurrent inserts can commit out
/// of timestamp order.
const COMMIT_SKEW_MS: i64 = 5_000;

fn commit_skew() -> chrono::Duration {
    chrono::Duration::milliseconds(COMMIT_SKEW_MS)
}

/// Signaling store backed by a PostgREST-style row endpoint.
///
/// Appends are `POST`s; the change feed polls for rows newer than the last one seen.
#[derive(Clone)]
pub struct RestStore {
    client: Client,
    rows_url: Url,
    api_key: Option<String>,
    poll_interval: Duration,
}

impl RestStore {
    pub fn new(
        base: &Url,
        table: &str,
        api_key: Option<String>,
        poll_interval: Duration,
    ) -> Result<Self, SignalingError> {
        Ok(Self {
            client: Client::new(),
            rows_url: rows_url(base, table)?,
            api_key,
            poll_interval,
        })
    }

    /// `None` when no signaling endpoint is configured.
    pub fn from_config(config: &Config) -> Result<Option<Self>, SignalingError> {
        config
            .signaling_url
            .as_ref()
            .map(|base| {
                Self::new(
                    base,
                    &config.signaling_table,
                    config.signaling_key.clone(),
                    config.poll_interval,
                )
            })
            .transpose()
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("apikey", key).bearer_auth(key),
            None => request,
        }
    }

    async fn fetch(&self, url: Url) -> Result<Vec<SignalingMessage>, reqwest::Error> {
        self.authorize(self.client.get(url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }
}

fn rows_url(base: &Url, table: &str) -> Result<Url, SignalingError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| SignalingError::Endpoint(format!("cannot use {base} as a row endpoint")))?
        .pop_if_empty()
        .push(table);
    Ok(url)
}

fn session_query(rows_url: &Url, session_id: &SessionId, since: Option<DateTime<Utc>>) -> Url {
    let mut url = rows_url.clone();
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("session_id", &format!("eq.{session_id}"));
        if let Some(since) = since {
            query.append_pair(
                "created_at",
                &format!("gte.{}", since.to_rfc3339_opts(SecondsFormat::Micros, true)),
            );
        }
        query.append_pair("order", "created_at.asc,id.asc");
    }
    url
}

fn latest_query(rows_url: &Url, session_id: &SessionId) -> Url {
    let mut url = rows_url.clone();
    url.query_pairs_mut()
        .append_pair("session_id", &format!("eq.{session_id}"))
        .append_pair("order", "created_at.desc,id.desc")
        .append_pair("limit", "1");
    url
}

/// Polling position. Every poll re-reads from [`COMMIT_SKEW_MS`] before the
/// newest row seen; ids inside that window are remembered so repeats are skipped.
#[derive(Default)]
struct Cursor {
    newest: Option<DateTime<Utc>>,
    seen: HashMap<String, DateTime<Utc>>,
}

impl Cursor {
    /// A cursor that treats `rows` as already delivered.
    fn seeded(rows: Vec<SignalingMessage>) -> Self {
        let mut cursor = Cursor::default();
        cursor.advance(rows);
        cursor
    }

    fn since(&self) -> Option<DateTime<Utc>> {
        self.newest.map(|newest| newest - commit_skew())
    }

    /// Filters a polled batch down to unseen rows and advances.
    fn advance(&mut self, rows: Vec<SignalingMessage>) -> Vec<SignalingMessage> {
        let fresh: Vec<_> = rows
            .into_iter()
            .filter(|row| self.seen.insert(row.id.clone(), row.created_at).is_none())
            .collect();
        if let Some(latest) = fresh.iter().map(|row| row.created_at).max() {
            self.newest = Some(self.newest.map_or(latest, |newest| newest.max(latest)));
        }
        if let Some(floor) = self.since() {
            self.seen.retain(|_, at| *at >= floor);
        }
        fresh
    }
}

#[async_trait]
impl SignalingStore for RestStore {
    async fn append(
        &self,
        message: NewSignalingMessage,
    ) -> Result<SignalingMessage, SignalingError> {
        let rows: Vec<SignalingMessage> = self
            .authorize(self.client.post(self.rows_url.clone()))
            .header("Prefer", "return=representation")
            .json(&message)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|err| SignalingError::Publish(err.to_string()))?
            .json()
            .await
            .map_err(|err| SignalingError::Publish(err.to_string()))?;
        rows.into_iter()
            .next()
            .ok_or_else(|| SignalingError::Publish("store returned no row".into()))
    }

    async fn history(
        &self,
        session_id: &SessionId,
    ) -> Result<Vec<SignalingMessage>, SignalingError> {
        self.fetch(session_query(&self.rows_url, session_id, None))
            .await
            .map_err(|err| SignalingError::Subscribe {
                session: session_id.to_string(),
                reason: err.to_string(),
            })
    }

    async fn subscribe(
        &self,
        session_id: &SessionId,
    ) -> Result<mpsc::UnboundedReceiver<SignalingMessage>, SignalingError> {
        let subscribe_failed = |err: reqwest::Error| SignalingError::Subscribe {
            session: session_id.to_string(),
            reason: err.to_string(),
        };
        let latest = self
            .fetch(latest_query(&self.rows_url, session_id))
            .await
            .map_err(subscribe_failed)?;
        // rows already in the poll window are history, not live traffic
        let existing = match latest.first() {
            Some(row) => self
                .fetch(session_query(
                    &self.rows_url,
                    session_id,
                    Some(row.created_at - commit_skew()),
                ))
                .await
                .map_err(subscribe_failed)?,
            None => Vec::new(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let store = self.clone();
        let session_id = session_id.clone();
        let mut cursor = Cursor::seeded(existing);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {
                        let url = session_query(&store.rows_url, &session_id, cursor.since());
                        match store.fetch(url).await {
                            Ok(rows) => {
                                for row in cursor.advance(rows) {
                                    if tx.send(row).is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(err) => {
                                warn!(session = %session_id, error = %err, "signaling poll failed");
                            }
                        }
                    }
                }
            }
            debug!(session = %session_id, "signaling poll stopped");
        });
        Ok(rx)
    }
}
