use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;

// ============================================================================
// VEHICLE
// ============================================================================

/// Vehicle record with extensible metadata.
/// Identity fields drive matching; metadata can grow without schema changes.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Vehicle {
    /// Stable identity (UUID) - NEVER changes, survives corrections
    #[serde(default = "default_uuid")]
    pub id: String,

    #[serde(rename = "Year")]
    pub year: Option<i32>,

    #[serde(rename = "Make")]
    pub make: Option<String>,

    #[serde(rename = "Model")]
    pub model: Option<String>,

    /// May be a real identifier, a placeholder pattern, or absent
    #[serde(rename = "VIN")]
    pub vin: Option<String>,

    /// Which ingestion pipeline produced this record
    /// (e.g. "auction-feed-bat", "bulk-import", "user-upload")
    #[serde(rename = "Provenance")]
    pub provenance: String,

    #[serde(rename = "Owner_ID")]
    pub owner_id: String,

    /// Extensible metadata (aggregates as maps, not structs)
    #[serde(default)]
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,

    #[serde(default = "default_now")]
    pub created_at: DateTime<Utc>,
}

fn default_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_now() -> DateTime<Utc> {
    Utc::now()
}

impl Vehicle {
    /// Compute idempotency hash for ingest deduplication.
    /// NOTE: this is for skipping re-imported rows, not for identity!
    /// Identity = id (UUID), ingest dedup = hash.
    pub fn compute_idempotency_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!(
            "{:?}|{:?}|{:?}|{:?}|{}|{}",
            self.year, self.make, self.model, self.vin, self.provenance, self.owner_id
        ));
        format!("{:x}", hasher.finalize())
    }

    /// The matcher only runs when year, make, and model are all present.
    pub fn identity_complete(&self) -> bool {
        self.year.is_some()
            && self.make.as_deref().map_or(false, |m| !m.trim().is_empty())
            && self.model.as_deref().map_or(false, |m| !m.trim().is_empty())
    }

    pub fn vin_str(&self) -> Option<&str> {
        self.vin.as_deref().filter(|v| !v.trim().is_empty())
    }

    /// Display label for operator output ("1972 Ford Bronco")
    pub fn label(&self) -> String {
        format!(
            "{} {} {}",
            self.year.map_or("?".to_string(), |y| y.to_string()),
            self.make.as_deref().unwrap_or("?"),
            self.model.as_deref().unwrap_or("?"),
        )
    }
}

// ============================================================================
// DEPENDENT RECORDS
// ============================================================================

/// Categories of child records owned by exactly one vehicle at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Image,
    TimelineEvent,
    PriceObservation,
    OrgLink,
    Document,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Image => "image",
            RecordKind::TimelineEvent => "timeline_event",
            RecordKind::PriceObservation => "price_observation",
            RecordKind::OrgLink => "org_link",
            RecordKind::Document => "document",
        }
    }

    pub fn parse(s: &str) -> Option<RecordKind> {
        match s {
            "image" => Some(RecordKind::Image),
            "timeline_event" => Some(RecordKind::TimelineEvent),
            "price_observation" => Some(RecordKind::PriceObservation),
            "org_link" => Some(RecordKind::OrgLink),
            "document" => Some(RecordKind::Document),
            _ => None,
        }
    }

    pub const ALL: [RecordKind; 5] = [
        RecordKind::Image,
        RecordKind::TimelineEvent,
        RecordKind::PriceObservation,
        RecordKind::OrgLink,
        RecordKind::Document,
    ];
}

/// Child record owned by exactly one vehicle. Reassigning `vehicle_id` is the
/// only legal way to move one, and only the merge executor and rehydration
/// service do it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependentRecord {
    pub id: String,
    pub vehicle_id: String,
    pub kind: RecordKind,
    /// Payload text; for images and documents this is the stored URL, which
    /// embeds the owning vehicle id at upload time
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl DependentRecord {
    pub fn new(vehicle_id: &str, kind: RecordKind, body: &str) -> Self {
        DependentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            vehicle_id: vehicle_id.to_string(),
            kind,
            body: body.to_string(),
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// AUDIT EVENTS (append-only - every change is an event)
// ============================================================================

pub const EVENT_VEHICLE_ADDED: &str = "vehicle_added";
pub const EVENT_VEHICLES_MERGED: &str = "vehicles_merged";
pub const EVENT_VEHICLE_REHYDRATED: &str = "vehicle_rehydrated";

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

// ============================================================================
// UPSERT NOTIFICATION
// ============================================================================

/// Emitted by `upsert_vehicle` so the merge executor can subscribe explicitly
/// instead of hanging off an ambient write trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertEvent {
    pub vehicle_id: String,
    pub changed_fields: Vec<String>,
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS vehicles (
            id TEXT PRIMARY KEY,
            idempotency_hash TEXT UNIQUE,
            year INTEGER,
            make TEXT,
            model TEXT,
            vin TEXT,
            provenance TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            metadata TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dependent_records (
            id TEXT PRIMARY KEY,
            vehicle_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            body TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_vehicles_year ON vehicles(year)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_vehicles_vin ON vehicles(vin)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_vehicles_provenance ON vehicles(provenance)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_dependents_vehicle ON dependent_records(vehicle_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// VEHICLES
// ============================================================================

const VEHICLE_COLUMNS: &str =
    "id, year, make, model, vin, provenance, owner_id, metadata, created_at";

fn row_to_vehicle(row: &rusqlite::Row) -> rusqlite::Result<Vehicle> {
    let metadata_json: Option<String> = row.get(7)?;
    let metadata = metadata_json
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or_default();

    let created_at_str: String = row.get(8)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_str)
        .map_err(|_| rusqlite::Error::InvalidQuery)?
        .with_timezone(&Utc);

    Ok(Vehicle {
        id: row.get(0)?,
        year: row.get(1)?,
        make: row.get(2)?,
        model: row.get(3)?,
        vin: row.get(4)?,
        provenance: row.get(5)?,
        owner_id: row.get(6)?,
        metadata,
        created_at,
    })
}

/// Insert a vehicle. Returns false if an identical row (by idempotency hash)
/// already exists - re-running a bulk import never double-inserts.
pub fn insert_vehicle(conn: &Connection, vehicle: &Vehicle) -> Result<bool> {
    let hash = vehicle.compute_idempotency_hash();
    let metadata_json = serde_json::to_string(&vehicle.metadata)?;

    let result = conn.execute(
        "INSERT INTO vehicles (
            id, idempotency_hash, year, make, model, vin, provenance, owner_id,
            metadata, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            vehicle.id,
            hash,
            vehicle.year,
            vehicle.make,
            vehicle.model,
            vehicle.vin,
            vehicle.provenance,
            vehicle.owner_id,
            metadata_json,
            vehicle.created_at.to_rfc3339(),
        ],
    );

    match result {
        Ok(_) => Ok(true),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Insert a vehicle created by this engine (not by an ingestion pipeline),
/// bypassing the ingest dedup hash. Rehydration may legitimately create
/// identity-identical vehicles more than once.
pub fn insert_vehicle_no_dedup(conn: &Connection, vehicle: &Vehicle) -> Result<()> {
    let metadata_json = serde_json::to_string(&vehicle.metadata)?;

    conn.execute(
        "INSERT INTO vehicles (
            id, idempotency_hash, year, make, model, vin, provenance, owner_id,
            metadata, created_at
        ) VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            vehicle.id,
            vehicle.year,
            vehicle.make,
            vehicle.model,
            vehicle.vin,
            vehicle.provenance,
            vehicle.owner_id,
            metadata_json,
            vehicle.created_at.to_rfc3339(),
        ],
    )?;

    Ok(())
}

/// Insert or update a vehicle and emit the upsert notification the merge
/// executor subscribes to. `changed_fields` lists identity fields that
/// actually changed (all of them for a fresh insert).
pub fn upsert_vehicle(conn: &Connection, vehicle: &Vehicle) -> Result<UpsertEvent> {
    let existing = get_vehicle(conn, &vehicle.id)?;

    let changed_fields = match &existing {
        None => vec![
            "year".to_string(),
            "make".to_string(),
            "model".to_string(),
            "vin".to_string(),
            "provenance".to_string(),
        ],
        Some(old) => {
            let mut changed = Vec::new();
            if old.year != vehicle.year {
                changed.push("year".to_string());
            }
            if old.make != vehicle.make {
                changed.push("make".to_string());
            }
            if old.model != vehicle.model {
                changed.push("model".to_string());
            }
            if old.vin != vehicle.vin {
                changed.push("vin".to_string());
            }
            if old.provenance != vehicle.provenance {
                changed.push("provenance".to_string());
            }
            changed
        }
    };

    if existing.is_some() {
        let metadata_json = serde_json::to_string(&vehicle.metadata)?;
        conn.execute(
            "UPDATE vehicles
             SET year = ?1, make = ?2, model = ?3, vin = ?4, provenance = ?5,
                 owner_id = ?6, metadata = ?7
             WHERE id = ?8",
            params![
                vehicle.year,
                vehicle.make,
                vehicle.model,
                vehicle.vin,
                vehicle.provenance,
                vehicle.owner_id,
                metadata_json,
                vehicle.id,
            ],
        )?;
    } else {
        insert_vehicle(conn, vehicle)?;
    }

    Ok(UpsertEvent {
        vehicle_id: vehicle.id.clone(),
        changed_fields,
    })
}

pub fn get_vehicle(conn: &Connection, id: &str) -> Result<Option<Vehicle>> {
    let vehicle = conn
        .query_row(
            &format!("SELECT {} FROM vehicles WHERE id = ?1", VEHICLE_COLUMNS),
            params![id],
            row_to_vehicle,
        )
        .optional()?;

    Ok(vehicle)
}

/// Candidate scan: every other vehicle sharing the exact year.
pub fn get_vehicles_by_year(conn: &Connection, year: i32, exclude_id: &str) -> Result<Vec<Vehicle>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM vehicles WHERE year = ?1 AND id != ?2 ORDER BY created_at, id",
        VEHICLE_COLUMNS
    ))?;

    let vehicles = stmt
        .query_map(params![year, exclude_id], row_to_vehicle)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(vehicles)
}

pub fn delete_vehicle(conn: &Connection, id: &str) -> Result<bool> {
    let deleted = conn.execute("DELETE FROM vehicles WHERE id = ?1", params![id])?;
    Ok(deleted > 0)
}

pub fn count_vehicles(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM vehicles", [], |row| row.get(0))?;
    Ok(count)
}

/// Authorization boundary consumed from the record store: the actor must own
/// the vehicle. Anything richer (roles, sharing) lives outside this engine.
pub fn has_access(conn: &Connection, vehicle_id: &str, actor_id: &str) -> Result<bool> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT owner_id FROM vehicles WHERE id = ?1",
            params![vehicle_id],
            |row| row.get(0),
        )
        .optional()?;

    Ok(owner.map_or(false, |o| o == actor_id))
}

// ============================================================================
// DEPENDENT RECORDS
// ============================================================================

pub fn insert_dependent(conn: &Connection, record: &DependentRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO dependent_records (id, vehicle_id, kind, body, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.id,
            record.vehicle_id,
            record.kind.as_str(),
            record.body,
            record.created_at.to_rfc3339(),
        ],
    )?;

    Ok(())
}

pub fn get_dependents(conn: &Connection, vehicle_id: &str) -> Result<Vec<DependentRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, vehicle_id, kind, body, created_at
         FROM dependent_records
         WHERE vehicle_id = ?1
         ORDER BY created_at, id",
    )?;

    let records = stmt
        .query_map(params![vehicle_id], |row| {
            let kind_str: String = row.get(2)?;
            let kind = RecordKind::parse(&kind_str).ok_or(rusqlite::Error::InvalidQuery)?;

            let created_at_str: String = row.get(4)?;
            let created_at = DateTime::parse_from_rfc3339(&created_at_str)
                .map_err(|_| rusqlite::Error::InvalidQuery)?
                .with_timezone(&Utc);

            Ok(DependentRecord {
                id: row.get(0)?,
                vehicle_id: row.get(1)?,
                kind,
                body: row.get(3)?,
                created_at,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(records)
}

/// Move every dependent record from one vehicle to another. The only legal
/// ownership mutation; called by the merge executor and rehydration service.
pub fn reassign_dependents(
    conn: &Connection,
    from_vehicle: &str,
    to_vehicle: &str,
) -> Result<usize> {
    let moved = conn.execute(
        "UPDATE dependent_records SET vehicle_id = ?1 WHERE vehicle_id = ?2",
        params![to_vehicle, from_vehicle],
    )?;

    Ok(moved)
}

/// Move a specific set of records (rehydration moves only the planned ones).
pub fn reassign_dependents_by_id(
    conn: &Connection,
    record_ids: &[String],
    to_vehicle: &str,
) -> Result<usize> {
    let mut moved = 0;
    for id in record_ids {
        moved += conn.execute(
            "UPDATE dependent_records SET vehicle_id = ?1 WHERE id = ?2",
            params![to_vehicle, id],
        )?;
    }

    Ok(moved)
}

// ============================================================================
// EVENTS
// ============================================================================

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let timestamp_str: String = row.get(1)?;
    let data_json: String = row.get(5)?;

    Ok(Event {
        event_id: row.get(0)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
            .map_err(|_| rusqlite::Error::InvalidQuery)?
            .with_timezone(&Utc),
        event_type: row.get(2)?,
        entity_type: row.get(3)?,
        entity_id: row.get(4)?,
        data: serde_json::from_str(&data_json).map_err(|_| rusqlite::Error::InvalidQuery)?,
        actor: row.get(6)?,
    })
}

pub fn get_event(conn: &Connection, event_id: &str) -> Result<Option<Event>> {
    let event = conn
        .query_row(
            "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
             FROM events
             WHERE event_id = ?1",
            params![event_id],
            row_to_event,
        )
        .optional()?;

    Ok(event)
}

pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], row_to_event)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// BULK IMPORT
// ============================================================================

pub fn load_vehicles_csv(csv_path: &Path) -> Result<Vec<Vehicle>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;

    let mut vehicles = Vec::new();
    for result in rdr.deserialize() {
        let vehicle: Vehicle = result.context("Failed to deserialize vehicle row")?;
        vehicles.push(vehicle);
    }

    Ok(vehicles)
}

/// Insert a batch, skipping rows already present (by idempotency hash).
/// Returns (inserted, skipped) and logs one audit event per inserted vehicle.
pub fn import_vehicles(conn: &Connection, vehicles: &[Vehicle]) -> Result<(usize, usize)> {
    let mut inserted = 0;
    let mut skipped = 0;

    for vehicle in vehicles {
        if insert_vehicle(conn, vehicle)? {
            inserted += 1;

            let event = Event::new(
                EVENT_VEHICLE_ADDED,
                "vehicle",
                &vehicle.id,
                serde_json::json!({
                    "year": vehicle.year,
                    "make": vehicle.make,
                    "model": vehicle.model,
                    "provenance": vehicle.provenance,
                }),
                "csv_importer",
            );
            insert_event(conn, &event)?;
        } else {
            skipped += 1;
        }
    }

    Ok((inserted, skipped))
}

// ============================================================================
// TESTS
// ============================================================================
