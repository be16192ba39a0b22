//! SQLite project and version store.
//!
//! A project is a diagram (title + engine); a version is an immutable
//! snapshot of its content. The collab CLI seeds its document from the
//! latest version and saves a new one on exit.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{NexusError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    #[default]
    Mermaid,
    Excalidraw,
    Drawio,
}

impl EngineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineType::Mermaid => "mermaid",
            EngineType::Excalidraw => "excalidraw",
            EngineType::Drawio => "drawio",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "mermaid" => Some(EngineType::Mermaid),
            "excalidraw" => Some(EngineType::Excalidraw),
            "drawio" => Some(EngineType::Drawio),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub title: String,
    pub engine_type: EngineType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Version {
    pub id: String,
    pub project_id: String,
    pub content: String,
    pub change_summary: String,
    pub created_at: DateTime<Utc>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    engine_type TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS versions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    project_id TEXT NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    change_summary TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS versions_by_project ON versions(project_id, seq);
";

pub struct ProjectStore {
    conn: Connection,
}

impl ProjectStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn create_project(&self, title: &str, engine_type: EngineType) -> Result<Project> {
        self.create_project_with_id(&uuid::Uuid::new_v4().to_string(), title, engine_type)
    }

    /// Create a project under a caller-chosen id, e.g. a collab channel name.
    pub fn create_project_with_id(&self, id: &str, title: &str, engine_type: EngineType) -> Result<Project> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO projects (id, title, engine_type, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
            params![id, title, engine_type.as_str(), now.timestamp_millis()],
        )?;
        tracing::debug!(project = id, engine = engine_type.as_str(), "project created");
        Ok(Project {
            id: id.to_string(),
            title: title.to_string(),
            engine_type,
            created_at: from_millis(now.timestamp_millis())?,
            updated_at: from_millis(now.timestamp_millis())?,
        })
    }

    pub fn get_project(&self, id: &str) -> Result<Option<Project>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, title, engine_type, created_at, updated_at FROM projects WHERE id = ?1",
                params![id],
                project_row,
            )
            .optional()?;
        row.map(project_from_row).transpose()
    }

    /// Most recently updated first.
    pub fn list_projects(&self) -> Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, title, engine_type, created_at, updated_at FROM projects ORDER BY updated_at DESC, id")?;
        let rows = stmt.query_map([], project_row)?;
        rows.map(|r| project_from_row(r?)).collect()
    }

    /// Returns false when no such project exists.
    pub fn update_title(&self, id: &str, title: &str) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE projects SET title = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, title.trim(), Utc::now().timestamp_millis()],
        )?;
        Ok(changed > 0)
    }

    pub fn create_version(&self, project_id: &str, content: &str, change_summary: &str) -> Result<Version> {
        let now = Utc::now().timestamp_millis();
        let id = uuid::Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO versions (id, project_id, content, change_summary, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, project_id, content, change_summary, now],
        )?;
        self.conn.execute(
            "UPDATE projects SET updated_at = ?2 WHERE id = ?1",
            params![project_id, now],
        )?;
        tracing::debug!(project = project_id, version = %id, "version saved");
        Ok(Version {
            id,
            project_id: project_id.to_string(),
            content: content.to_string(),
            change_summary: change_summary.to_string(),
            created_at: from_millis(now)?,
        })
    }

    pub fn latest_version(&self, project_id: &str) -> Result<Option<Version>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, project_id, content, change_summary, created_at FROM versions
                 WHERE project_id = ?1 ORDER BY seq DESC LIMIT 1",
                params![project_id],
                version_row,
            )
            .optional()?;
        row.map(version_from_row).transpose()
    }

    /// Oldest first.
    pub fn list_versions(&self, project_id: &str) -> Result<Vec<Version>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, project_id, content, change_summary, created_at FROM versions
             WHERE project_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![project_id], version_row)?;
        rows.map(|r| version_from_row(r?)).collect()
    }
}

type ProjectRow = (String, String, String, i64, i64);
type VersionRow = (String, String, String, String, i64);

fn project_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProjectRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn version_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn project_from_row((id, title, engine, created, updated): ProjectRow) -> Result<Project> {
    let engine_type = EngineType::parse(&engine)
        .ok_or_else(|| NexusError::Config(format!("unknown engine type '{}' for project {}", engine, id)))?;
    Ok(Project {
        id,
        title,
        engine_type,
        created_at: from_millis(created)?,
        updated_at: from_millis(updated)?,
    })
}

fn version_from_row((id, project_id, content, change_summary, created): VersionRow) -> Result<Version> {
    Ok(Version {
        id,
        project_id,
        content,
        change_summary,
        created_at: from_millis(created)?,
    })
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| NexusError::Config(format!("invalid timestamp {}", ms)))
}
