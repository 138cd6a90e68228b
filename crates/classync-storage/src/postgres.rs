//! PostgreSQL driver for the storage ports.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use classync_core::{EntityId, EntitySpec, FieldType, Lesson, LessonField, NaturalKey, SqlValue};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::query_builder::Separated;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder, Row, Transaction};
use tracing::debug;

use crate::lookup::{LookupPlan, LOOKUP_CHUNK_SIZE};
use crate::ports::{EntityStore, LessonStore, LessonTx, NewEntity, RunLock};
use crate::StoreError;

/// Rows per multi-row INSERT of natural-key entities.
const INSERT_CHUNK_SIZE: usize = 1000;

/// Advisory lock id shared by every sync run against one database.
const RUN_LOCK_ID: i64 = 0x636c_6173_796e_63;

const FIND_ACTIVE_SQL: &str = r#"
    SELECT l."id", l."group_id", l."period_id", l."subject_id", l."teacher_id",
           l."classroom_id", l."subgroup", l."is_active", l."created_at", l."updated_at"
      FROM "lesson" l
      JOIN "period" p ON p."id" = l."period_id"
     WHERE l."is_active"
       AND l."group_id" = ANY($1)
       AND p."date" >= $2
     ORDER BY l."id"
"#;

const DELETE_LESSONS_SQL: &str = r#"DELETE FROM "lesson" WHERE "id" = ANY($1)"#;

const INSERT_LESSONS_SQL: &str = r#"
    INSERT INTO "lesson" ("group_id", "period_id", "subject_id", "teacher_id",
                          "classroom_id", "subgroup", "is_active", "updated_at")
    SELECT * FROM unnest($1::bigint[], $2::bigint[], $3::bigint[], $4::bigint[],
                         $5::bigint[], $6::text[], $7::boolean[], $8::timestamptz[])
    RETURNING "id"
"#;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(2))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn find_ids_or_filter(
        &self,
        spec: &EntitySpec,
        keys: &[NaturalKey],
    ) -> Result<HashMap<NaturalKey, EntityId>, StoreError> {
        let sql = or_filter_sql(spec, keys.len());
        let mut query = sqlx::query(&sql);
        for key in keys {
            for value in key.values() {
                query = bind_value(query, value);
            }
        }
        let rows = query.fetch_all(&self.pool).await?;
        decode_id_map(spec, &rows)
    }

    async fn find_ids_unnest(
        &self,
        spec: &EntitySpec,
        keys: &[NaturalKey],
    ) -> Result<HashMap<NaturalKey, EntityId>, StoreError> {
        let sql = unnest_join_sql(spec);
        let mut query = sqlx::query(&sql);
        for column in column_arrays(spec, keys)? {
            query = column.bind_to(query);
        }
        let rows = query.fetch_all(&self.pool).await?;
        decode_id_map(spec, &rows)
    }
}

#[async_trait]
impl EntityStore for PgStore {
    async fn find_ids(
        &self,
        spec: &EntitySpec,
        keys: &[NaturalKey],
    ) -> Result<HashMap<NaturalKey, EntityId>, StoreError> {
        ensure_key_shapes(spec, keys)?;
        let plan = LookupPlan::for_key_count(keys.len());
        debug!(table = spec.table, keys = keys.len(), ?plan, "looking up natural keys");
        match plan {
            LookupPlan::Empty => Ok(HashMap::new()),
            LookupPlan::OrFilter => self.find_ids_or_filter(spec, keys).await,
            LookupPlan::UnnestJoin { .. } => {
                let mut out = HashMap::with_capacity(keys.len());
                for chunk in keys.chunks(LOOKUP_CHUNK_SIZE) {
                    out.extend(self.find_ids_unnest(spec, chunk).await?);
                }
                Ok(out)
            }
        }
    }

    async fn insert_entities(
        &self,
        spec: &EntitySpec,
        rows: &[NewEntity],
    ) -> Result<u64, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let keys = rows.iter().map(|r| r.key.clone()).collect::<Vec<_>>();
        ensure_key_shapes(spec, &keys)?;

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in rows.chunks(INSERT_CHUNK_SIZE) {
            let mut builder = insert_entities_query(spec, chunk)?;
            inserted += builder.build().execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }
}

#[async_trait]
impl LessonStore for PgStore {
    async fn find_active(
        &self,
        group_ids: &[EntityId],
        date_from: NaiveDate,
    ) -> Result<Vec<Lesson>, StoreError> {
        if group_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(FIND_ACTIVE_SQL)
            .bind(group_ids.to_vec())
            .bind(date_from)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_lesson).collect()
    }

    async fn begin(&self) -> Result<Box<dyn LessonTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLessonTx { tx }))
    }

    async fn acquire_run_lock(&self) -> Result<Box<dyn RunLock>, StoreError> {
        // Session-level lock on a connection that leaves the pool; if the
        // process dies the server drops the session and the lock with it.
        let mut conn = self.pool.acquire().await?.detach();
        sqlx::query("SELECT pg_advisory_lock($1)")
            .bind(RUN_LOCK_ID)
            .execute(&mut conn)
            .await
            .map_err(|e| StoreError::Lock(e.to_string()))?;
        Ok(Box::new(PgRunLock { conn }))
    }
}

struct PgLessonTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LessonTx for PgLessonTx {
    async fn delete_by_ids(&mut self, ids: &[EntityId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(DELETE_LESSONS_SQL)
            .bind(ids.to_vec())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected())
    }

    async fn bulk_update(
        &mut self,
        rows: &[Lesson],
        fields: &[LessonField],
    ) -> Result<u64, StoreError> {
        let Some(sql) = update_lessons_sql(fields) else {
            return Ok(0);
        };
        if rows.is_empty() {
            return Ok(0);
        }

        let ids = rows
            .iter()
            .map(|r| r.id.ok_or(StoreError::MissingId { entity: "Lesson" }))
            .collect::<Result<Vec<_>, _>>()?;
        let mut query = sqlx::query(&sql).bind(ids);
        for field in writable_fields(fields) {
            query = match field {
                LessonField::UpdatedAt => {
                    query.bind(rows.iter().map(|r| r.updated_at).collect::<Vec<DateTime<Utc>>>())
                }
                other => query.bind(
                    rows.iter()
                        .map(|r| r.id_field(other).unwrap_or_default())
                        .collect::<Vec<i64>>(),
                ),
            };
        }
        let result = query.execute(&mut *self.tx).await?;
        Ok(result.rows_affected())
    }

    async fn bulk_insert(&mut self, rows: &[Lesson]) -> Result<Vec<EntityId>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids = sqlx::query_scalar::<_, i64>(INSERT_LESSONS_SQL)
            .bind(rows.iter().map(|r| r.group_id).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.period_id).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.subject_id).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.teacher_id).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.classroom_id).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.subgroup.clone()).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.is_active).collect::<Vec<_>>())
            .bind(rows.iter().map(|r| r.updated_at).collect::<Vec<_>>())
            .fetch_all(&mut *self.tx)
            .await?;
        Ok(ids)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

struct PgRunLock {
    conn: PgConnection,
}

#[async_trait]
impl RunLock for PgRunLock {
    async fn release(mut self: Box<Self>) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(RUN_LOCK_ID)
            .execute(&mut self.conn)
            .await?;
        self.conn.close().await?;
        Ok(())
    }
}

fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

fn ensure_key_shapes(spec: &EntitySpec, keys: &[NaturalKey]) -> Result<(), StoreError> {
    match keys.iter().find(|k| !k.conforms_to(spec)) {
        Some(bad) => Err(StoreError::KeyShape {
            table: spec.table,
            key: bad.to_string(),
        }),
        None => Ok(()),
    }
}

fn select_list(spec: &EntitySpec, alias: &str) -> String {
    let mut columns = spec
        .key_fields
        .iter()
        .map(|f| format!("{alias}{}::{}", quote(f.name), f.ty.sql_type()))
        .collect::<Vec<_>>();
    columns.push(format!("{alias}{}", quote("id")));
    columns.join(", ")
}

/// `SELECT .. WHERE (k1 = $1 AND k2 = $2) OR (..)` with one group per key.
pub(crate) fn or_filter_sql(spec: &EntitySpec, key_count: usize) -> String {
    let mut param = 0usize;
    let groups = (0..key_count)
        .map(|_| {
            let terms = spec
                .key_fields
                .iter()
                .map(|f| {
                    param += 1;
                    format!("{} = ${param}", quote(f.name))
                })
                .collect::<Vec<_>>();
            format!("({})", terms.join(" AND "))
        })
        .collect::<Vec<_>>();
    format!(
        "SELECT {} FROM {} WHERE {}",
        select_list(spec, ""),
        quote(spec.table),
        groups.join(" OR ")
    )
}

/// Join the table against the pending keys passed as one array per key column.
pub(crate) fn unnest_join_sql(spec: &EntitySpec) -> String {
    let arrays = spec
        .key_fields
        .iter()
        .enumerate()
        .map(|(i, f)| format!("${}::{}[]", i + 1, f.ty.sql_type()))
        .collect::<Vec<_>>();
    let names = spec
        .key_fields
        .iter()
        .map(|f| quote(f.name))
        .collect::<Vec<_>>();
    let on = spec
        .key_fields
        .iter()
        .map(|f| format!("t.{name} = p.{name}", name = quote(f.name)))
        .collect::<Vec<_>>();
    format!(
        "SELECT {} FROM {} t JOIN unnest({}) AS p({}) ON {}",
        select_list(spec, "t."),
        quote(spec.table),
        arrays.join(", "),
        names.join(", "),
        on.join(" AND ")
    )
}

fn writable_fields(fields: &[LessonField]) -> Vec<LessonField> {
    let mut out = Vec::new();
    for field in fields {
        if *field != LessonField::CreatedAt && !out.contains(field) {
            out.push(*field);
        }
    }
    out
}

pub(crate) fn update_lessons_sql(fields: &[LessonField]) -> Option<String> {
    let fields = writable_fields(fields);
    if fields.is_empty() {
        return None;
    }
    let assignments = fields
        .iter()
        .map(|f| format!("{col} = v.{col}", col = quote(f.column())))
        .collect::<Vec<_>>();
    let mut arrays = vec!["$1::bigint[]".to_string()];
    let mut names = vec![quote("id")];
    for (i, field) in fields.iter().enumerate() {
        let ty = if field.is_timestamp() { "timestamptz" } else { "bigint" };
        arrays.push(format!("${}::{ty}[]", i + 2));
        names.push(quote(field.column()));
    }
    Some(format!(
        "UPDATE \"lesson\" AS l SET {} FROM unnest({}) AS v({}) WHERE l.\"id\" = v.\"id\"",
        assignments.join(", "),
        arrays.join(", "),
        names.join(", ")
    ))
}

fn insert_entities_query<'args>(
    spec: &EntitySpec,
    rows: &'args [NewEntity],
) -> Result<QueryBuilder<'args, Postgres>, StoreError> {
    let extra_columns = rows
        .first()
        .map(|r| r.extra.iter().map(|(c, _)| *c).collect::<Vec<_>>())
        .unwrap_or_default();
    if let Some(bad) = rows
        .iter()
        .find(|r| !r.extra.iter().map(|(c, _)| *c).eq(extra_columns.iter().copied()))
    {
        return Err(StoreError::KeyShape {
            table: spec.table,
            key: bad.key.to_string(),
        });
    }

    let columns = spec
        .key_fields
        .iter()
        .map(|f| f.name)
        .chain(extra_columns.iter().copied())
        .map(quote)
        .collect::<Vec<_>>();
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {} ({}) ",
        quote(spec.table),
        columns.join(", ")
    ));
    builder.push_values(rows, |mut row_values, row| {
        for value in row.key.values() {
            push_value(&mut row_values, value);
        }
        for (_, value) in &row.extra {
            push_value(&mut row_values, value);
        }
    });
    Ok(builder)
}

fn push_value(values: &mut Separated<'_, '_, Postgres, &'static str>, value: &SqlValue) {
    match value {
        SqlValue::Int(v) => {
            values.push_bind(*v);
        }
        SqlValue::Date(v) => {
            values.push_bind(*v);
        }
        SqlValue::Time(v) => {
            values.push_bind(*v);
        }
        SqlValue::Text(v) => {
            values.push_bind(v.clone());
        }
        SqlValue::Null => {
            values.push("NULL");
        }
    }
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &SqlValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Date(v) => query.bind(*v),
        SqlValue::Time(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.clone()),
        SqlValue::Null => query.bind(Option::<String>::None),
    }
}

enum ColumnArray {
    Int(Vec<i64>),
    Date(Vec<NaiveDate>),
    Time(Vec<NaiveTime>),
    Text(Vec<String>),
}

impl ColumnArray {
    fn bind_to<'q>(
        self,
        query: Query<'q, Postgres, PgArguments>,
    ) -> Query<'q, Postgres, PgArguments> {
        match self {
            Self::Int(v) => query.bind(v),
            Self::Date(v) => query.bind(v),
            Self::Time(v) => query.bind(v),
            Self::Text(v) => query.bind(v),
        }
    }
}

fn column_arrays(spec: &EntitySpec, keys: &[NaturalKey]) -> Result<Vec<ColumnArray>, StoreError> {
    let mut columns = spec
        .key_fields
        .iter()
        .map(|f| match f.ty {
            FieldType::Int => ColumnArray::Int(Vec::with_capacity(keys.len())),
            FieldType::Date => ColumnArray::Date(Vec::with_capacity(keys.len())),
            FieldType::Time => ColumnArray::Time(Vec::with_capacity(keys.len())),
            FieldType::Text => ColumnArray::Text(Vec::with_capacity(keys.len())),
        })
        .collect::<Vec<_>>();

    for key in keys {
        for (column, value) in columns.iter_mut().zip(key.values()) {
            match (column, value) {
                (ColumnArray::Int(out), SqlValue::Int(v)) => out.push(*v),
                (ColumnArray::Date(out), SqlValue::Date(v)) => out.push(*v),
                (ColumnArray::Time(out), SqlValue::Time(v)) => out.push(*v),
                (ColumnArray::Text(out), SqlValue::Text(v)) => out.push(v.clone()),
                _ => {
                    return Err(StoreError::KeyShape {
                        table: spec.table,
                        key: key.to_string(),
                    })
                }
            }
        }
    }
    Ok(columns)
}

fn decode_id_map(
    spec: &EntitySpec,
    rows: &[PgRow],
) -> Result<HashMap<NaturalKey, EntityId>, StoreError> {
    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        let mut values = Vec::with_capacity(spec.arity());
        for (idx, field) in spec.key_fields.iter().enumerate() {
            let value = match field.ty {
                FieldType::Int => SqlValue::Int(row.try_get(idx)?),
                FieldType::Date => SqlValue::Date(row.try_get(idx)?),
                FieldType::Time => SqlValue::Time(row.try_get(idx)?),
                FieldType::Text => SqlValue::Text(row.try_get(idx)?),
            };
            values.push(value);
        }
        let id: i64 = row.try_get(spec.arity())?;
        out.insert(NaturalKey::new(values), id);
    }
    Ok(out)
}

fn decode_lesson(row: &PgRow) -> Result<Lesson, StoreError> {
    Ok(Lesson {
        id: Some(row.try_get("id")?),
        group_id: row.try_get("group_id")?,
        period_id: row.try_get("period_id")?,
        subject_id: row.try_get("subject_id")?,
        teacher_id: row.try_get("teacher_id")?,
        classroom_id: row.try_get("classroom_id")?,
        subgroup: row.try_get("subgroup")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use classync_core::{PERIOD, TEACHER};

    #[test]
    fn or_filter_binds_one_group_per_key() {
        let sql = or_filter_sql(&PERIOD, 2);
        assert_eq!(
            sql,
            "SELECT \"date\"::date, \"lesson_number\"::bigint, \"id\" FROM \"period\" \
             WHERE (\"date\" = $1 AND \"lesson_number\" = $2) OR (\"date\" = $3 AND \"lesson_number\" = $4)"
        );
    }

    #[test]
    fn unnest_join_uses_one_array_per_key_column() {
        let sql = unnest_join_sql(&TEACHER);
        assert_eq!(
            sql,
            "SELECT t.\"full_name\"::text, t.\"id\" FROM \"teacher\" t \
             JOIN unnest($1::text[]) AS p(\"full_name\") ON t.\"full_name\" = p.\"full_name\""
        );
        let sql = unnest_join_sql(&PERIOD);
        assert!(sql.contains("unnest($1::date[], $2::bigint[]) AS p(\"date\", \"lesson_number\")"));
        assert!(sql.contains("t.\"date\" = p.\"date\" AND t.\"lesson_number\" = p.\"lesson_number\""));
    }

    #[test]
    fn update_sql_skips_created_at_and_types_timestamps() {
        let sql = update_lessons_sql(&[
            LessonField::SubjectId,
            LessonField::CreatedAt,
            LessonField::UpdatedAt,
        ])
        .unwrap();
        assert_eq!(
            sql,
            "UPDATE \"lesson\" AS l SET \"subject_id\" = v.\"subject_id\", \"updated_at\" = v.\"updated_at\" \
             FROM unnest($1::bigint[], $2::bigint[], $3::timestamptz[]) AS v(\"id\", \"subject_id\", \"updated_at\") \
             WHERE l.\"id\" = v.\"id\""
        );
        assert!(update_lessons_sql(&[LessonField::CreatedAt]).is_none());
    }

    #[test]
    fn insert_builder_appends_extra_columns() {
        let rows = vec![NewEntity {
            key: NaturalKey::single(SqlValue::text("Иванов Иван Иванович")),
            extra: vec![("short_name", SqlValue::text("Иванов И.И."))],
        }];
        let builder = insert_entities_query(&TEACHER, &rows).unwrap();
        assert_eq!(
            builder.sql(),
            "INSERT INTO \"teacher\" (\"full_name\", \"short_name\") VALUES ($1, $2)"
        );
    }

    #[test]
    fn mismatched_key_values_are_rejected() {
        let keys = vec![NaturalKey::single(SqlValue::Int(3))];
        assert!(matches!(
            column_arrays(&TEACHER, &keys),
            Err(StoreError::KeyShape { table: "teacher", .. })
        ));
    }
}
