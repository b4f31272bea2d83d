use std::future::Future;
use std::path::Path;

use log::info;
use sqlx::{SqlitePool, sqlite::*};

pub mod crud;

use crate::error::{Error, Result};

pub type Database = SqlitePool;

pub async fn init_db(filename: impl AsRef<Path>) -> Result<Database> {
    let filename = filename.as_ref();
    info!("初始化数据库连接: {}", filename.display());

    let options = SqliteConnectOptions::new()
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .filename(filename)
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// 将索引中的 ID 转换为数据库中的 ID
pub fn row_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| Error::IdOutOfRange(id))
}

/// 保存 `id -> 口令` 的行存储
pub trait RowStore: Send + Sync {
    /// 创建表，已存在时不做任何事
    fn create_table(&self) -> impl Future<Output = Result<()>> + Send;

    /// 在同一个事务中写入一批行
    fn insert_many(&self, rows: &[(i64, String)]) -> impl Future<Output = Result<()>> + Send;

    /// 根据 ID 查找口令
    fn get(&self, id: i64) -> impl Future<Output = Result<Option<String>>> + Send;

    /// 行总数
    fn count(&self) -> impl Future<Output = Result<u64>> + Send;

    /// ID 位于 [start, end) 的行数
    fn count_range(&self, start: i64, end: i64) -> impl Future<Output = Result<u64>> + Send;

    /// 删除所有行
    fn clear(&self) -> impl Future<Output = Result<()>> + Send;
}

/// 基于 SQLite 的行存储
#[derive(Clone)]
pub struct SqliteRowStore {
    pool: Database,
}

impl SqliteRowStore {
    pub fn new(pool: Database) -> Self {
        Self { pool }
    }

    /// 打开数据库文件并建表
    pub async fn open(filename: impl AsRef<Path>) -> Result<Self> {
        let store = Self::new(init_db(filename).await?);
        store.create_table().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Database {
        &self.pool
    }
}

impl RowStore for SqliteRowStore {
    async fn create_table(&self) -> Result<()> {
        crud::create_table(&self.pool).await?;
        Ok(())
    }

    async fn insert_many(&self, rows: &[(i64, String)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        crud::insert_passwords(&mut tx, rows).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<String>> {
        Ok(crud::get_password(&self.pool, id).await?)
    }

    async fn count(&self) -> Result<u64> {
        Ok(crud::count_passwords(&self.pool).await? as u64)
    }

    async fn count_range(&self, start: i64, end: i64) -> Result<u64> {
        Ok(crud::count_range(&self.pool, start, end).await? as u64)
    }

    async fn clear(&self) -> Result<()> {
        crud::clear_passwords(&self.pool).await?;
        Ok(())
    }
}
