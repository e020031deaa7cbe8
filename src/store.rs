//! Relay catalog repository over PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use sqlx::{postgres::PgRow, PgPool, QueryBuilder, Row};
use thiserror::Error;

use crate::domain::{HealthCheck, Relay, RelayStatus};

/// Embedded schema migrations for the catalog tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Errors surfaced by the catalog store.
///
/// Transport-layer errors are always wrapped with the failing operation so
/// callers never see a raw driver error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("relay not found: {url}")]
    NotFound { url: String },
    #[error("{op}: {source}")]
    Database {
        op: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

fn db_err(op: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Database { op, source }
}

/// Options accepted by [`RelayRepository::list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    /// Inclusion filter; results preserve this order when present.
    pub urls: Option<Vec<String>>,
}

/// Abstract catalog contract, independent of any SQL dialect.
#[async_trait]
pub trait RelayRepository: Send + Sync {
    /// Idempotent insert keyed by `url`; conflicts are silent no-ops.
    async fn create(&self, relay: &Relay) -> Result<(), StoreError>;

    /// Overwrite the mutable metadata fields by `url`, bumping `updated_at`.
    /// Upserts, so a first-sighting probe creates the relay row.
    async fn update(&self, relay: &Relay) -> Result<(), StoreError>;

    /// One relay joined with its latest health check.
    async fn find_by_url(&self, url: &str) -> Result<RelayStatus, StoreError>;

    /// All relays joined with their latest health checks, one query.
    ///
    /// Without a `urls` filter the order is randomized with a seed derived
    /// from the UTC day-of-year: stable within a day, rotating daily.
    async fn list(&self, opts: Option<ListOptions>) -> Result<Vec<RelayStatus>, StoreError>;

    /// Append one health-check observation.
    async fn save_health_check(&self, hc: &HealthCheck) -> Result<(), StoreError>;
}

/// PostgreSQL-backed catalog store.
#[derive(Clone)]
pub struct PgRelayStore {
    pool: PgPool,
}

/// Seed in `[-1, 1]` for `setseed()`, derived from the UTC day-of-year.
pub fn daily_seed(date: DateTime<Utc>) -> f64 {
    (date.ordinal() as f64 / 366.0) * 2.0 - 1.0
}

const STATUS_SELECT: &str = r#"
SELECT r.url, r.name, r.description, r.pubkey, r.contact, r.supported_nips,
       r.software, r.version, r.icon, r.banner, r.privacy_policy,
       r.terms_of_service, r.posting_policy, r.tags, r.language_tags,
       r.relay_countries, r.created_at, r.updated_at,
       h.created_at AS hc_created_at,
       h.websocket_success AS hc_websocket_success,
       h.websocket_error AS hc_websocket_error,
       h.nip11_success AS hc_nip11_success,
       h.nip11_error AS hc_nip11_error,
       h.rtt_open AS hc_rtt_open,
       h.rtt_read AS hc_rtt_read,
       h.rtt_write AS hc_rtt_write,
       h.rtt_nip11 AS hc_rtt_nip11
  FROM relays r
  LEFT JOIN LATERAL (
       SELECT * FROM health_checks
        WHERE relay_url = r.url
        ORDER BY created_at DESC
        LIMIT 1
  ) h ON true
"#;

impl PgRelayStore {
    /// Open a connection pool against `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(db_err("connecting to database"))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RelayRepository for PgRelayStore {
    async fn create(&self, relay: &Relay) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO relays (
                url, name, description, pubkey, contact, supported_nips,
                software, version, icon, banner, privacy_policy,
                terms_of_service, posting_policy, tags, language_tags,
                relay_countries
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                      $14, $15, $16)
            ON CONFLICT (url) DO NOTHING
            "#,
        )
        .bind(&relay.url)
        .bind(&relay.name)
        .bind(&relay.description)
        .bind(&relay.pubkey)
        .bind(&relay.contact)
        .bind(&relay.supported_nips)
        .bind(&relay.software)
        .bind(&relay.version)
        .bind(&relay.icon)
        .bind(&relay.banner)
        .bind(&relay.privacy_policy)
        .bind(&relay.terms_of_service)
        .bind(&relay.posting_policy)
        .bind(&relay.tags)
        .bind(&relay.language_tags)
        .bind(&relay.relay_countries)
        .execute(&self.pool)
        .await
        .map_err(db_err("creating relay"))?;
        Ok(())
    }

    async fn update(&self, relay: &Relay) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO relays (
                url, name, description, pubkey, contact, supported_nips,
                software, version, icon, banner, privacy_policy,
                terms_of_service, posting_policy, tags, language_tags,
                relay_countries
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                      $14, $15, $16)
            ON CONFLICT (url) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                pubkey = EXCLUDED.pubkey,
                contact = EXCLUDED.contact,
                supported_nips = EXCLUDED.supported_nips,
                software = EXCLUDED.software,
                version = EXCLUDED.version,
                icon = EXCLUDED.icon,
                banner = EXCLUDED.banner,
                privacy_policy = EXCLUDED.privacy_policy,
                terms_of_service = EXCLUDED.terms_of_service,
                posting_policy = EXCLUDED.posting_policy,
                tags = EXCLUDED.tags,
                language_tags = EXCLUDED.language_tags,
                relay_countries = EXCLUDED.relay_countries,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&relay.url)
        .bind(&relay.name)
        .bind(&relay.description)
        .bind(&relay.pubkey)
        .bind(&relay.contact)
        .bind(&relay.supported_nips)
        .bind(&relay.software)
        .bind(&relay.version)
        .bind(&relay.icon)
        .bind(&relay.banner)
        .bind(&relay.privacy_policy)
        .bind(&relay.terms_of_service)
        .bind(&relay.posting_policy)
        .bind(&relay.tags)
        .bind(&relay.language_tags)
        .bind(&relay.relay_countries)
        .execute(&self.pool)
        .await
        .map_err(db_err("updating relay"))?;
        Ok(())
    }

    async fn find_by_url(&self, url: &str) -> Result<RelayStatus, StoreError> {
        let sql = format!("{STATUS_SELECT} WHERE r.url = $1");
        let row = sqlx::query(&sql)
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("finding relay by url"))?;
        match row {
            Some(row) => status_from_row(&row).map_err(db_err("decoding relay row")),
            None => Err(StoreError::NotFound { url: url.into() }),
        }
    }

    async fn list(&self, opts: Option<ListOptions>) -> Result<Vec<RelayStatus>, StoreError> {
        let opts = opts.unwrap_or_default();
        let mut qb = QueryBuilder::new(STATUS_SELECT);
        if let Some(urls) = &opts.urls {
            qb.push(" WHERE r.url = ANY(");
            qb.push_bind(urls.clone());
            qb.push(") ORDER BY array_position(");
            qb.push_bind(urls.clone());
            qb.push(", r.url)");
        } else {
            qb.push(" ORDER BY random()");
        }
        if let Some(limit) = opts.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit);
        }
        if let Some(offset) = opts.offset {
            qb.push(" OFFSET ");
            qb.push_bind(offset);
        }

        // setseed is transaction-scoped so the daily shuffle never leaks into
        // other queries on the pool.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_err("beginning list transaction"))?;
        if opts.urls.is_none() {
            sqlx::query("SELECT setseed($1)")
                .bind(daily_seed(Utc::now()))
                .execute(&mut *tx)
                .await
                .map_err(db_err("seeding daily shuffle"))?;
        }
        let rows = qb
            .build()
            .fetch_all(&mut *tx)
            .await
            .map_err(db_err("listing relays"))?;
        tx.commit()
            .await
            .map_err(db_err("committing list transaction"))?;

        rows.iter()
            .map(|row| status_from_row(row).map_err(db_err("decoding relay row")))
            .collect()
    }

    async fn save_health_check(&self, hc: &HealthCheck) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO health_checks (
                relay_url, created_at, websocket_success, websocket_error,
                nip11_success, nip11_error, rtt_open, rtt_read, rtt_write,
                rtt_nip11
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&hc.relay_url)
        .bind(hc.created_at)
        .bind(hc.websocket_success)
        .bind(&hc.websocket_error)
        .bind(hc.nip11_success)
        .bind(&hc.nip11_error)
        .bind(hc.rtt_open)
        .bind(hc.rtt_read)
        .bind(hc.rtt_write)
        .bind(hc.rtt_nip11)
        .execute(&self.pool)
        .await
        .map_err(db_err("saving health check"))?;
        Ok(())
    }
}

/// Decode one joined row into a `RelayStatus`.
fn status_from_row(row: &PgRow) -> Result<RelayStatus, sqlx::Error> {
    let relay = Relay {
        url: row.try_get("url")?,
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        pubkey: row.try_get("pubkey")?,
        contact: row.try_get("contact")?,
        supported_nips: row.try_get("supported_nips")?,
        software: row.try_get("software")?,
        version: row.try_get("version")?,
        icon: row.try_get("icon")?,
        banner: row.try_get("banner")?,
        privacy_policy: row.try_get("privacy_policy")?,
        terms_of_service: row.try_get("terms_of_service")?,
        posting_policy: row.try_get("posting_policy")?,
        tags: row.try_get("tags")?,
        language_tags: row.try_get("language_tags")?,
        relay_countries: row.try_get("relay_countries")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    };
    // The lateral join leaves every hc_ column NULL when no check exists.
    let last_check = match row.try_get::<Option<DateTime<Utc>>, _>("hc_created_at")? {
        Some(created_at) => Some(HealthCheck {
            relay_url: relay.url.clone(),
            created_at,
            websocket_success: row
                .try_get::<Option<bool>, _>("hc_websocket_success")?
                .unwrap_or(false),
            websocket_error: row.try_get("hc_websocket_error")?,
            nip11_success: row.try_get("hc_nip11_success")?,
            nip11_error: row.try_get("hc_nip11_error")?,
            rtt_open: row.try_get("hc_rtt_open")?,
            rtt_read: row.try_get("hc_rtt_read")?,
            rtt_write: row.try_get("hc_rtt_write")?,
            rtt_nip11: row.try_get("hc_rtt_nip11")?,
        }),
        None => None,
    };
    Ok(RelayStatus { relay, last_check })
}
