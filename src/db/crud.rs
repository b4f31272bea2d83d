use sqlx::{Executor, QueryBuilder, Result, Sqlite};

/// 单条 INSERT 语句包含的最大行数
const INSERT_BATCH: usize = 5000;

/// 创建口令表
pub async fn create_table<'c, E>(executor: E) -> Result<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS passwords (
            id INTEGER PRIMARY KEY,
            password TEXT NOT NULL
        )
        "#,
    )
    .execute(executor)
    .await?;
    Ok(())
}

/// 批量写入口令，ID 已存在时覆盖
pub async fn insert_passwords(conn: &mut sqlx::SqliteConnection, rows: &[(i64, String)]) -> Result<u64> {
    let mut affected = 0;
    for batch in rows.chunks(INSERT_BATCH) {
        let mut builder = QueryBuilder::<Sqlite>::new("INSERT OR REPLACE INTO passwords (id, password) ");
        builder.push_values(batch, |mut b, (id, password)| {
            b.push_bind(*id).push_bind(password.as_str());
        });
        affected += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(affected)
}

/// 根据 ID 获取口令
pub async fn get_password<'c, E>(executor: E, id: i64) -> Result<Option<String>>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query_scalar("SELECT password FROM passwords WHERE id = ?")
        .bind(id)
        .fetch_optional(executor)
        .await
}

/// 口令总数
pub async fn count_passwords<'c, E>(executor: E) -> Result<i64>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query_scalar("SELECT COUNT(*) FROM passwords").fetch_one(executor).await
}

/// ID 位于 [start, end) 的口令数量
pub async fn count_range<'c, E>(executor: E, start: i64, end: i64) -> Result<i64>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query_scalar("SELECT COUNT(*) FROM passwords WHERE id >= ? AND id < ?")
        .bind(start)
        .bind(end)
        .fetch_one(executor)
        .await
}

/// 删除所有口令
pub async fn clear_passwords<'c, E>(executor: E) -> Result<()>
where
    E: Executor<'c, Database = Sqlite>,
{
    sqlx::query("DELETE FROM passwords").execute(executor).await?;
    Ok(())
}
