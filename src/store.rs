use chrono::{NaiveDateTime, Utc};
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Event, EventObjectLink, NewEvent, NewEventObjectLink, NewObject, Object};
use crate::schema::{event_objects, events, meta, objects};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("object type {0} does not exist")]
    UnknownObjectType(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Streaming read contract: timestamp ascending with a stable tie-break on
/// `(bucket_id, id)`.
pub fn read_events(
    conn: &mut SqliteConnection,
    bucket: Option<&str>,
    start: NaiveDateTime,
    end: NaiveDateTime,
    limit: Option<i64>,
) -> StoreResult<Vec<Event>> {
    let mut query = events::table
        .filter(events::timestamp.ge(start))
        .filter(events::timestamp.le(end))
        .order((
            events::timestamp.asc(),
            events::bucket_id.asc(),
            events::id.asc(),
        ))
        .into_boxed();

    if let Some(bucket) = bucket {
        query = query.filter(events::bucket_id.eq(bucket.to_string()));
    }
    if let Some(limit) = limit {
        query = query.limit(limit);
    }

    Ok(query.load(conn)?)
}

pub fn count_events(
    conn: &mut SqliteConnection,
    bucket: Option<&str>,
    start: NaiveDateTime,
    end: NaiveDateTime,
) -> StoreResult<i64> {
    let query = events::table
        .filter(events::timestamp.ge(start))
        .filter(events::timestamp.le(end));
    let count = match bucket {
        Some(bucket) => query
            .filter(events::bucket_id.eq(bucket))
            .count()
            .get_result(conn)?,
        None => query.count().get_result(conn)?,
    };
    Ok(count)
}

pub fn insert_events(conn: &mut SqliteConnection, rows: &[NewEvent]) -> StoreResult<usize> {
    let mut inserted = 0;
    conn.transaction::<_, diesel::result::Error, _>(|conn| {
        for row in rows {
            inserted += diesel::insert_into(events::table)
                .values(row)
                .on_conflict((events::bucket_id, events::id))
                .do_nothing()
                .execute(conn)?;
        }
        Ok(())
    })?;
    Ok(inserted)
}

/// Enforces `(type, name)` uniqueness. An existing object has its `data`
/// merged: new keys are added, existing keys keep their value unless
/// `replace` is set.
pub fn upsert_object(
    conn: &mut SqliteConnection,
    object_type: &str,
    name: &str,
    data: &Value,
    replace: bool,
) -> StoreResult<Object> {
    conn.transaction::<Object, StoreError, _>(|conn| {
        let existing: Option<Object> = objects::table
            .filter(objects::object_type.eq(object_type))
            .filter(objects::name.eq(name))
            .first(conn)
            .optional()?;

        let now = Utc::now().naive_utc();

        if let Some(existing) = existing {
            let merged = merge_data(&existing.data_value(), data, replace);
            diesel::update(objects::table.find(&existing.id))
                .set((
                    objects::data.eq(merged.to_string()),
                    objects::updated_at.eq(now),
                ))
                .execute(conn)?;
            Ok(objects::table.find(&existing.id).first(conn)?)
        } else {
            let row = NewObject {
                id: Uuid::new_v4().to_string(),
                object_type: object_type.to_string(),
                name: name.to_string(),
                data: normalize_map(data).to_string(),
                created_at: now,
                updated_at: now,
            };
            let result = diesel::insert_into(objects::table).values(&row).execute(conn);
            match result {
                Ok(_) => {}
                Err(diesel::result::Error::DatabaseError(
                    diesel::result::DatabaseErrorKind::ForeignKeyViolation,
                    _,
                )) => return Err(StoreError::UnknownObjectType(object_type.to_string())),
                Err(err) => return Err(err.into()),
            }
            Ok(objects::table.find(&row.id).first(conn)?)
        }
    })
}

fn normalize_map(data: &Value) -> Value {
    match data {
        Value::Object(_) => data.clone(),
        Value::Null => Value::Object(Map::new()),
        other => serde_json::json!({ "value": other }),
    }
}

fn merge_data(existing: &Value, incoming: &Value, replace: bool) -> Value {
    let mut merged = match existing {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(incoming) = normalize_map(incoming) {
        for (key, value) in incoming {
            if replace || !merged.contains_key(&key) {
                merged.insert(key, value);
            }
        }
    }
    Value::Object(merged)
}

/// Idempotent on `(bucket, event, object)`; a repeat link records the latest
/// provenance and confidence.
pub fn link_event_to_object(
    conn: &mut SqliteConnection,
    bucket: &str,
    event_id: i64,
    object_id: &str,
    provenance: &str,
    confidence: f64,
) -> StoreResult<()> {
    let row = NewEventObjectLink {
        bucket_id: bucket.to_string(),
        event_id,
        object_id: object_id.to_string(),
        provenance: provenance.to_string(),
        confidence,
        created_at: Utc::now().naive_utc(),
    };
    diesel::insert_into(event_objects::table)
        .values(&row)
        .on_conflict((
            event_objects::bucket_id,
            event_objects::event_id,
            event_objects::object_id,
        ))
        .do_update()
        .set((
            event_objects::provenance.eq(provenance.to_string()),
            event_objects::confidence.eq(confidence),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn unlink_event_from_object(
    conn: &mut SqliteConnection,
    bucket: &str,
    event_id: i64,
    object_id: &str,
) -> StoreResult<usize> {
    Ok(diesel::delete(
        event_objects::table
            .filter(event_objects::bucket_id.eq(bucket))
            .filter(event_objects::event_id.eq(event_id))
            .filter(event_objects::object_id.eq(object_id)),
    )
    .execute(conn)?)
}

pub fn objects_for_event(
    conn: &mut SqliteConnection,
    bucket: &str,
    event_id: i64,
) -> StoreResult<Vec<(EventObjectLink, Object)>> {
    let rows = event_objects::table
        .inner_join(objects::table)
        .filter(event_objects::bucket_id.eq(bucket))
        .filter(event_objects::event_id.eq(event_id))
        .order(objects::name.asc())
        .load::<(EventObjectLink, Object)>(conn)?;
    Ok(rows)
}

pub fn events_for_object(
    conn: &mut SqliteConnection,
    object_id: &str,
    range: Option<(NaiveDateTime, NaiveDateTime)>,
) -> StoreResult<Vec<Event>> {
    let links: Vec<(String, i64)> = event_objects::table
        .filter(event_objects::object_id.eq(object_id))
        .select((event_objects::bucket_id, event_objects::event_id))
        .load(conn)?;

    let mut result = Vec::with_capacity(links.len());
    for (bucket, event_id) in links {
        let event: Option<Event> = events::table
            .find((bucket, event_id))
            .first(conn)
            .optional()?;
        if let Some(event) = event {
            if let Some((start, end)) = range {
                if event.timestamp < start || event.timestamp > end {
                    continue;
                }
            }
            result.push(event);
        }
    }
    result.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.bucket_id.cmp(&b.bucket_id))
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(result)
}

pub fn meta_get(conn: &mut SqliteConnection, key: &str) -> StoreResult<Option<String>> {
    Ok(meta::table
        .find(key)
        .select(meta::value)
        .first(conn)
        .optional()?)
}

pub fn meta_set(conn: &mut SqliteConnection, key: &str, value: &str) -> StoreResult<()> {
    diesel::insert_into(meta::table)
        .values((meta::key.eq(key), meta::value.eq(value)))
        .on_conflict(meta::key)
        .do_update()
        .set(meta::value.eq(value))
        .execute(conn)?;
    Ok(())
}
