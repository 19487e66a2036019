mod blocks;
mod memory;
pub(crate) mod row_helpers;

pub use blocks::AddressBlockRepo;
pub use memory::MemoryStore;

use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AllocError, Result};
use crate::models::*;

/// The complete set of writes one allocator operation produces.
/// Stores apply it all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolChanges {
    pub inserted: Vec<AddressBlock>,
    pub updated: Vec<AddressBlock>,
    pub removed: Vec<Uuid>,
}

impl PoolChanges {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Persistence seam for the allocator.
///
/// The allocator holds `allocation_lock` from `load_pool` until `commit`
/// returns, so the check for a free block and the insert of the new one form
/// a single unit. Implementations must share the lock between clones.
#[async_trait]
pub trait BlockStore: Send + Sync {
    fn allocation_lock(&self) -> &Mutex<()>;

    /// Every block of the family, ordered by network address then prefix length
    async fn load_pool(&self, family: AddressFamily) -> Result<Vec<AddressBlock>>;

    /// Apply inserts, then updates, then removals atomically
    async fn commit(&self, changes: &PoolChanges) -> Result<()>;

    async fn get_block(&self, id: Uuid) -> Result<Option<AddressBlock>>;
}

/// SQLite-backed block store
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
    lock: Arc<Mutex<()>>,
}

impl Store {
    /// Open (or create) the database at `db_path` with the default pool size
    pub async fn new(db_path: &str) -> Result<Self> {
        Self::with_pool_size(db_path, 5).await
    }

    /// Open (or create) the database with a specific pool size
    pub async fn with_pool_size(db_path: &str, max_connections: u32) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path);
        Self::connect(&db_url, max_connections).await
    }

    /// Private in-memory database. A single connection keeps every query on
    /// the same database.
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    async fn connect(db_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(db_url)
            .await?;

        let store = Self {
            pool,
            lock: Arc::new(Mutex::new(())),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl BlockStore for Store {
    fn allocation_lock(&self) -> &Mutex<()> {
        &self.lock
    }

    async fn load_pool(&self, family: AddressFamily) -> Result<Vec<AddressBlock>> {
        AddressBlockRepo::list_by_family(&self.pool, family).await
    }

    async fn commit(&self, changes: &PoolChanges) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for block in &changes.inserted {
            AddressBlockRepo::insert(&mut *tx, block).await?;
        }
        // the insert took the write lock, so rows from other writers are visible now
        let ours: HashSet<Uuid> = changes.inserted.iter().map(|b| b.id).collect();
        for block in &changes.inserted {
            let conflict = AddressBlockRepo::find_conflicts(&mut *tx, block)
                .await?
                .into_iter()
                .find(|(id, _)| !ours.contains(id));
            if let Some((_, existing)) = conflict {
                return Err(AllocError::Overlap {
                    requested: block.network,
                    existing,
                });
            }
        }
        for block in &changes.updated {
            AddressBlockRepo::update(&mut *tx, block).await?;
        }
        for id in &changes.removed {
            AddressBlockRepo::delete(&mut *tx, *id).await?;
        }

        tx.commit().await?;
        tracing::debug!(
            "Committed {} inserts, {} updates, {} removals",
            changes.inserted.len(),
            changes.updated.len(),
            changes.removed.len()
        );
        Ok(())
    }

    async fn get_block(&self, id: Uuid) -> Result<Option<AddressBlock>> {
        AddressBlockRepo::get(&self.pool, id).await
    }
}
