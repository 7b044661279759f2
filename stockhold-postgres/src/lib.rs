//! PostgreSQL adapters for the `stockhold` inventory library.
//!
//! [`PostgresInventoryStore`] keeps one row per lot in `inventory_lots` and
//! enforces optimistic concurrency with a `version` column: every update is a
//! `WHERE id = $1 AND version = $2` statement inside one transaction, and a
//! statement that matches no row rolls the whole batch back.
//!
//! [`PostgresProductCatalog`] reads the catalog's `products` table.
//!
//! Run [`PostgresInventoryStore::migrate`] once at startup to create the
//! schema.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nutype::nutype;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{query, PgConnection, Pool, Postgres, Row};
use stockhold::{
    CatalogError, InventoryLot, InventoryStore, InventoryWrites, LotId, LotRecord, LotScope, Money,
    Operation, ProductCatalog, ProductId, ProductSnapshot, StoreError, SyncStatus,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Failures setting up or administering the PostgreSQL adapters.
#[derive(Debug, Error)]
pub enum PostgresInventoryStoreError {
    /// The pool could not be created or could not reach the database.
    #[error("failed to create postgres connection pool")]
    ConnectionFailed(#[source] sqlx::Error),

    /// `SELECT 1` failed on a pooled connection.
    #[error("postgres health check failed")]
    PingFailed(#[source] sqlx::Error),

    /// Applying the bundled migrations failed.
    #[error("postgres migration failed")]
    MigrationFailed(#[source] sqlx::migrate::MigrateError),
}

/// Maximum number of database connections in the pool.
///
/// At least one connection, enforced by the `NonZeroU32` underneath.
///
/// # Examples
///
/// ```ignore
/// use stockhold_postgres::MaxConnections;
/// use std::num::NonZeroU32;
///
/// let small_pool = MaxConnections::new(NonZeroU32::new(5).expect("5 is non-zero"));
/// let large_pool = MaxConnections::new(NonZeroU32::new(50).expect("50 is non-zero"));
/// ```
#[nutype(derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRef, Into))]
pub struct MaxConnections(std::num::NonZeroU32);

/// Configuration for the PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Maximum number of connections in the pool (default: 10)
    pub max_connections: MaxConnections,
    /// Timeout for acquiring a connection from the pool (default: 30 seconds)
    pub acquire_timeout: Duration,
    /// Idle timeout for connections in the pool (default: 10 minutes)
    pub idle_timeout: Duration,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        const DEFAULT_MAX_CONNECTIONS: std::num::NonZeroU32 = match std::num::NonZeroU32::new(10) {
            Some(v) => v,
            None => unreachable!(),
        };

        Self {
            max_connections: MaxConnections::new(DEFAULT_MAX_CONNECTIONS),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600), // 10 minutes
        }
    }
}

async fn connect(
    connection_string: String,
    config: PostgresConfig,
) -> Result<Pool<Postgres>, PostgresInventoryStoreError> {
    let max_connections: std::num::NonZeroU32 = config.max_connections.into();
    PgPoolOptions::new()
        .max_connections(max_connections.get())
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .connect(&connection_string)
        .await
        .map_err(PostgresInventoryStoreError::ConnectionFailed)
}

const LOT_COLUMNS: &str = "id, product_id, available_quantity, reserved_quantity, sold_quantity, \
     cost_price, selling_price, expires_at, last_sync_at, sync_status, sync_error, \
     created_at, updated_at, deleted, version";

const INSERT_LOT: &str = "INSERT INTO inventory_lots (id, product_id, available_quantity, \
     reserved_quantity, sold_quantity, cost_price, selling_price, expires_at, last_sync_at, \
     sync_status, sync_error, created_at, updated_at, deleted, version) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, 1)";

const UPDATE_LOT: &str = "UPDATE inventory_lots SET available_quantity = $3, \
     reserved_quantity = $4, sold_quantity = $5, cost_price = $6, selling_price = $7, \
     expires_at = $8, last_sync_at = $9, sync_status = $10, sync_error = $11, deleted = $12, \
     version = version + 1, updated_at = now() \
     WHERE id = $1 AND version = $2";

/// Extra `WHERE` clause for a scope. Only `Sellable` uses `$2`, the `as_of` instant.
const fn scope_filter(scope: LotScope) -> &'static str {
    match scope {
        LotScope::Sellable => "AND NOT deleted AND (expires_at IS NULL OR expires_at > $2)",
        LotScope::Live => "AND NOT deleted",
        LotScope::All => "",
    }
}

/// PostgreSQL-backed [`InventoryStore`].
#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: Pool<Postgres>,
}

impl PostgresInventoryStore {
    /// Create a new PostgresInventoryStore with default configuration.
    pub async fn new<S: Into<String>>(
        connection_string: S,
    ) -> Result<Self, PostgresInventoryStoreError> {
        Self::with_config(connection_string, PostgresConfig::default()).await
    }

    /// Create a new PostgresInventoryStore with custom configuration.
    pub async fn with_config<S: Into<String>>(
        connection_string: S,
        config: PostgresConfig,
    ) -> Result<Self, PostgresInventoryStoreError> {
        let pool = connect(connection_string.into(), config).await?;
        Ok(Self { pool })
    }

    /// Create a PostgresInventoryStore from an existing connection pool.
    ///
    /// Use this to share one pool with [`PostgresProductCatalog`] or the rest
    /// of the application.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub const fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    /// Round-trip a trivial query to check the database is reachable.
    pub async fn ping(&self) -> Result<(), PostgresInventoryStoreError> {
        let _ = query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(PostgresInventoryStoreError::PingFailed)?;
        Ok(())
    }

    /// Apply pending schema migrations. Safe to call from several processes.
    pub async fn migrate(&self) -> Result<(), PostgresInventoryStoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(PostgresInventoryStoreError::MigrationFailed)
    }
}

impl InventoryStore for PostgresInventoryStore {
    #[instrument(name = "postgres.load_lots", skip(self, products), fields(products = products.len()))]
    async fn load_lots(
        &self,
        products: &[ProductId],
        scope: LotScope,
        as_of: DateTime<Utc>,
    ) -> Result<HashMap<ProductId, Vec<InventoryLot>>, StoreError> {
        let ids: Vec<i64> = products.iter().map(|product| product.into_inner()).collect();
        let sql = format!(
            "SELECT {LOT_COLUMNS} FROM inventory_lots WHERE product_id = ANY($1) {} \
             ORDER BY product_id, created_at, id",
            scope_filter(scope)
        );

        let mut statement = query(&sql).bind(ids);
        if scope == LotScope::Sellable {
            statement = statement.bind(as_of);
        }
        let rows = statement
            .fetch_all(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::LoadLots))?;

        debug!(
            scope = ?scope,
            rows = rows.len(),
            "[postgres.load_lots] loaded lots"
        );

        let mut by_product: HashMap<ProductId, Vec<InventoryLot>> = products
            .iter()
            .map(|product| (*product, Vec::new()))
            .collect();
        for row in &rows {
            let record = lot_from_row(row, Operation::LoadLots)?;
            by_product
                .entry(record.product_id)
                .or_default()
                .push(InventoryLot::from_record(record));
        }
        Ok(by_product)
    }

    #[instrument(name = "postgres.load_lot", skip(self))]
    async fn load_lot(&self, lot_id: LotId) -> Result<Option<InventoryLot>, StoreError> {
        let sql = format!("SELECT {LOT_COLUMNS} FROM inventory_lots WHERE id = $1");
        let row = query(&sql)
            .bind(*lot_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| map_sqlx_error(error, Operation::LoadLot))?;

        row.map(|row| lot_from_row(&row, Operation::LoadLot).map(InventoryLot::from_record))
            .transpose()
    }

    #[instrument(name = "postgres.commit", skip(self, writes), fields(lots = writes.len()))]
    async fn commit(&self, writes: InventoryWrites) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }
        let (inserts, updates) = writes.into_parts();

        info!(
            inserts = inserts.len(),
            updates = updates.len(),
            "[postgres.commit] writing lots to postgres"
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::BeginTransaction))?;

        // Returning early drops `tx`, which rolls the batch back
        for record in &inserts {
            insert_lot(&mut tx, record).await?;
        }
        for record in &updates {
            update_lot(&mut tx, record).await?;
        }

        tx.commit()
            .await
            .map_err(|error| map_sqlx_error(error, Operation::CommitTransaction))
    }
}

async fn insert_lot(conn: &mut PgConnection, record: &LotRecord) -> Result<(), StoreError> {
    let _ = query(INSERT_LOT)
        .bind(*record.id)
        .bind(record.product_id.into_inner())
        .bind(i64::from(record.available_quantity))
        .bind(i64::from(record.reserved_quantity))
        .bind(i64::from(record.sold_quantity))
        .bind(record.cost_price.map(Money::into_inner))
        .bind(record.selling_price.map(Money::into_inner))
        .bind(record.expires_at)
        .bind(record.last_sync_at)
        .bind(record.sync_status.as_str())
        .bind(record.sync_error.as_deref())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.deleted)
        .execute(&mut *conn)
        .await
        .map_err(|error| {
            if is_unique_violation(&error) {
                warn!(lot = %record.id, "[postgres.duplicate_lot] lot id already stored");
                StoreError::DuplicateLot(record.id)
            } else {
                map_sqlx_error(error, Operation::WriteLot)
            }
        })?;
    Ok(())
}

async fn update_lot(conn: &mut PgConnection, record: &LotRecord) -> Result<(), StoreError> {
    let expected_version = i64::try_from(record.version).map_err(|_| StoreError::Corrupted {
        lot: record.id.to_string(),
        detail: format!("version {} out of range", record.version),
    })?;

    let result = query(UPDATE_LOT)
        .bind(*record.id)
        .bind(expected_version)
        .bind(i64::from(record.available_quantity))
        .bind(i64::from(record.reserved_quantity))
        .bind(i64::from(record.sold_quantity))
        .bind(record.cost_price.map(Money::into_inner))
        .bind(record.selling_price.map(Money::into_inner))
        .bind(record.expires_at)
        .bind(record.last_sync_at)
        .bind(record.sync_status.as_str())
        .bind(record.sync_error.as_deref())
        .bind(record.deleted)
        .execute(&mut *conn)
        .await
        .map_err(|error| map_sqlx_error(error, Operation::WriteLot))?;

    if result.rows_affected() == 0 {
        warn!(
            lot = %record.id,
            expected = record.version,
            "[postgres.version_conflict] lot changed since it was read"
        );
        return Err(StoreError::ConcurrencyConflict);
    }
    Ok(())
}

fn lot_from_row(row: &PgRow, operation: Operation) -> Result<LotRecord, StoreError> {
    let raw_id: Uuid = column(row, "id", operation)?;
    let corrupted = |detail: String| StoreError::Corrupted {
        lot: raw_id.to_string(),
        detail,
    };
    let quantity = |name: &str| -> Result<u32, StoreError> {
        let raw: i64 = column(row, name, operation)?;
        u32::try_from(raw).map_err(|_| corrupted(format!("{name} {raw} out of range")))
    };
    let price = |name: &str| -> Result<Option<Money>, StoreError> {
        let raw: Option<i64> = column(row, name, operation)?;
        raw.map(|amount| {
            Money::try_new(amount).map_err(|_| corrupted(format!("{name} {amount} is negative")))
        })
        .transpose()
    };

    let id = LotId::try_new(raw_id).map_err(|_| corrupted("id is not a UUIDv7".to_string()))?;
    let raw_product: i64 = column(row, "product_id", operation)?;
    let product_id = ProductId::try_new(raw_product)
        .map_err(|_| corrupted(format!("product id {raw_product} is not positive")))?;
    let raw_status: String = column(row, "sync_status", operation)?;
    let sync_status = SyncStatus::parse(&raw_status)
        .ok_or_else(|| corrupted(format!("unknown sync status {raw_status:?}")))?;
    let raw_version: i64 = column(row, "version", operation)?;
    let version = u64::try_from(raw_version)
        .map_err(|_| corrupted(format!("version {raw_version} is negative")))?;

    Ok(LotRecord {
        id,
        product_id,
        available_quantity: quantity("available_quantity")?,
        reserved_quantity: quantity("reserved_quantity")?,
        sold_quantity: quantity("sold_quantity")?,
        cost_price: price("cost_price")?,
        selling_price: price("selling_price")?,
        expires_at: column(row, "expires_at", operation)?,
        last_sync_at: column(row, "last_sync_at", operation)?,
        sync_status,
        sync_error: column(row, "sync_error", operation)?,
        created_at: column(row, "created_at", operation)?,
        updated_at: column(row, "updated_at", operation)?,
        deleted: column(row, "deleted", operation)?,
        version,
    })
}

fn column<'r, T>(row: &'r PgRow, name: &str, operation: Operation) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name)
        .map_err(|error| map_sqlx_error(error, operation))
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db_error) if db_error.code().as_deref() == Some("23505"))
}

fn map_sqlx_error(error: sqlx::Error, operation: Operation) -> StoreError {
    if let sqlx::Error::Database(db_error) = &error {
        let code = db_error.code();
        let code_str = code.as_deref();
        // 40001: serialization_failure
        // 40P01: deadlock_detected
        if code_str == Some("40001") || code_str == Some("40P01") {
            warn!(
                error = %db_error,
                "[postgres.version_conflict] transaction lost a concurrent write race"
            );
            return StoreError::ConcurrencyConflict;
        }
    }

    error!(
        error = %error,
        operation = %operation,
        "[postgres.database_error] database operation failed"
    );
    StoreError::StoreFailure { operation }
}

/// [`ProductCatalog`] over the catalog's `products` table.
#[derive(Debug, Clone)]
pub struct PostgresProductCatalog {
    pool: Pool<Postgres>,
}

impl PostgresProductCatalog {
    /// Create a catalog reader with default pool configuration.
    pub async fn new<S: Into<String>>(
        connection_string: S,
    ) -> Result<Self, PostgresInventoryStoreError> {
        let pool = connect(connection_string.into(), PostgresConfig::default()).await?;
        Ok(Self { pool })
    }

    /// Create a catalog reader sharing an existing connection pool.
    pub fn from_pool(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

impl ProductCatalog for PostgresProductCatalog {
    #[instrument(name = "postgres.get_product", skip(self))]
    async fn get_product(
        &self,
        product_id: ProductId,
    ) -> Result<Option<ProductSnapshot>, CatalogError> {
        let row = query("SELECT stock_quantity FROM products WHERE id = $1")
            .bind(product_id.into_inner())
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| catalog_error(&error))?;

        row.map(|row| {
            let stock_quantity: i64 = row
                .try_get("stock_quantity")
                .map_err(|error| catalog_error(&error))?;
            Ok(ProductSnapshot {
                id: product_id,
                stock_quantity,
            })
        })
        .transpose()
    }
}

fn catalog_error(error: &sqlx::Error) -> CatalogError {
    error!(
        error = %error,
        operation = %Operation::LoadProduct,
        "[postgres.database_error] catalog query failed"
    );
    CatalogError::Unavailable(error.to_string())
}
