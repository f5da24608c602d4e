pub mod atomic;
pub mod events;

use std::ops::Deref;

use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension, params};

use crate::sites::{ConsolidatedSite, SiteMetadata};

/// Tables whose rows reference `sites(site_id)`.
pub const SITE_DEPENDENT_TABLES: [&str; 4] = [
    "chemical_collection_events",
    "fish_collection_events",
    "macro_collection_events",
    "habitat_assessments",
];

const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct PersistedSite {
    pub site_id: i64,
    pub site_name: String,
    pub metadata: SiteMetadata,
    pub active: bool,
    pub last_chemical_reading_date: Option<NaiveDate>,
}

/// The site table as read once at the start of a pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteSnapshot {
    pub sites: Vec<PersistedSite>,
}

impl SiteSnapshot {
    pub fn by_name(&self, name: &str) -> Option<&PersistedSite> {
        self.sites.iter().find(|site| site.site_name == name)
    }

    pub fn by_id(&self, site_id: i64) -> Option<&PersistedSite> {
        self.sites.iter().find(|site| site.site_id == site_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: &str) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        let version: i64 = self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                self.create_schema_v1()?;
                self.conn
                    .execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
            }
            SCHEMA_VERSION => self.create_schema_v1()?,
            _ => return Err(rusqlite::Error::InvalidQuery),
        }
        Ok(())
    }

    fn create_schema_v1(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sites (
                site_id INTEGER PRIMARY KEY,
                site_name TEXT NOT NULL UNIQUE,
                latitude REAL,
                longitude REAL,
                county TEXT,
                river_basin TEXT,
                ecoregion TEXT,
                active INTEGER NOT NULL DEFAULT 1 CHECK (active IN (0, 1)),
                last_chemical_reading_date TEXT
            );

            CREATE TABLE IF NOT EXISTS chemical_parameters (
                parameter_id INTEGER PRIMARY KEY,
                parameter_code TEXT NOT NULL UNIQUE,
                parameter_name TEXT NOT NULL,
                unit TEXT
            );

            INSERT OR IGNORE INTO chemical_parameters (parameter_id, parameter_code, parameter_name, unit)
            VALUES
                (1, 'do_percent', 'Dissolved Oxygen', '% Saturation'),
                (2, 'pH', 'pH', 'pH units'),
                (3, 'soluble_nitrogen', 'Nitrogen', 'mg/L'),
                (4, 'Phosphorus', 'Phosphorus', 'mg/L'),
                (5, 'Chloride', 'Chloride', 'mg/L');

            CREATE TABLE IF NOT EXISTS chemical_reference_values (
                parameter_id INTEGER NOT NULL REFERENCES chemical_parameters(parameter_id),
                threshold_type TEXT NOT NULL,
                value REAL NOT NULL,
                PRIMARY KEY (parameter_id, threshold_type)
            );

            CREATE TABLE IF NOT EXISTS chemical_collection_events (
                event_id INTEGER PRIMARY KEY,
                site_id INTEGER NOT NULL REFERENCES sites(site_id),
                collection_date TEXT NOT NULL,
                year INTEGER NOT NULL,
                month INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chemical_events_site_date
                ON chemical_collection_events(site_id, collection_date);

            CREATE TABLE IF NOT EXISTS chemical_measurements (
                event_id INTEGER NOT NULL
                    REFERENCES chemical_collection_events(event_id) ON DELETE CASCADE,
                parameter_id INTEGER NOT NULL REFERENCES chemical_parameters(parameter_id),
                value REAL,
                status TEXT,
                PRIMARY KEY (event_id, parameter_id)
            );

            CREATE TABLE IF NOT EXISTS fish_collection_events (
                event_id INTEGER PRIMARY KEY,
                site_id INTEGER NOT NULL REFERENCES sites(site_id),
                sample_id INTEGER NOT NULL UNIQUE,
                collection_date TEXT NOT NULL,
                year INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_fish_events_site_year
                ON fish_collection_events(site_id, year);

            CREATE TABLE IF NOT EXISTS fish_metrics (
                event_id INTEGER NOT NULL
                    REFERENCES fish_collection_events(event_id) ON DELETE CASCADE,
                metric_name TEXT NOT NULL,
                raw_value REAL,
                metric_result REAL,
                metric_score INTEGER CHECK (metric_score IS NULL OR metric_score IN (1, 3, 5)),
                PRIMARY KEY (event_id, metric_name)
            );

            CREATE TABLE IF NOT EXISTS fish_summary_scores (
                event_id INTEGER PRIMARY KEY
                    REFERENCES fish_collection_events(event_id) ON DELETE CASCADE,
                total_score INTEGER,
                comparison_to_reference REAL,
                integrity_class TEXT
            );

            CREATE TABLE IF NOT EXISTS macro_collection_events (
                event_id INTEGER PRIMARY KEY,
                site_id INTEGER NOT NULL REFERENCES sites(site_id),
                sample_id INTEGER NOT NULL,
                habitat TEXT NOT NULL,
                season TEXT CHECK (season IS NULL OR season IN ('Summer', 'Winter')),
                collection_date TEXT NOT NULL,
                year INTEGER NOT NULL,
                UNIQUE(sample_id, habitat)
            );

            CREATE TABLE IF NOT EXISTS macro_metrics (
                event_id INTEGER NOT NULL
                    REFERENCES macro_collection_events(event_id) ON DELETE CASCADE,
                metric_name TEXT NOT NULL,
                raw_value REAL,
                metric_score INTEGER CHECK (metric_score IS NULL OR metric_score IN (0, 2, 4, 6)),
                PRIMARY KEY (event_id, metric_name)
            );

            CREATE TABLE IF NOT EXISTS habitat_assessments (
                assessment_id INTEGER PRIMARY KEY,
                site_id INTEGER NOT NULL REFERENCES sites(site_id),
                assessment_date TEXT NOT NULL,
                year INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_habitat_site_date
                ON habitat_assessments(site_id, assessment_date);

            CREATE TABLE IF NOT EXISTS habitat_metrics (
                assessment_id INTEGER NOT NULL
                    REFERENCES habitat_assessments(assessment_id) ON DELETE CASCADE,
                metric_name TEXT NOT NULL,
                score REAL,
                PRIMARY KEY (assessment_id, metric_name)
            );

            CREATE TABLE IF NOT EXISTS habitat_summary_scores (
                assessment_id INTEGER PRIMARY KEY
                    REFERENCES habitat_assessments(assessment_id) ON DELETE CASCADE,
                total_score INTEGER,
                habitat_grade TEXT
            );
            ",
        )?;
        Ok(())
    }

    pub fn upsert_site(&self, site: &ConsolidatedSite) -> rusqlite::Result<UpsertOutcome> {
        Self::upsert_site_on(&self.conn, site)
    }

    /// Inserts or refreshes every site in one transaction. Returns (inserted, updated).
    pub fn upsert_sites(&self, sites: &[ConsolidatedSite]) -> rusqlite::Result<(usize, usize)> {
        let tx = self.conn.unchecked_transaction()?;
        let mut inserted = 0;
        let mut updated = 0;
        for site in sites {
            match Self::upsert_site_on(tx.deref(), site)? {
                UpsertOutcome::Inserted => inserted += 1,
                UpsertOutcome::Updated => updated += 1,
            }
        }
        tx.commit()?;
        Ok((inserted, updated))
    }

    fn upsert_site_on(conn: &Connection, site: &ConsolidatedSite) -> rusqlite::Result<UpsertOutcome> {
        Self::validate_site_name(&site.site_name)?;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT site_id FROM sites WHERE site_name = ?1",
                params![site.site_name],
                |row| row.get(0),
            )
            .optional()?;

        let meta = &site.metadata;
        conn.execute(
            "INSERT INTO sites (site_name, latitude, longitude, county, river_basin, ecoregion)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(site_name) DO UPDATE SET
                latitude = COALESCE(excluded.latitude, sites.latitude),
                longitude = COALESCE(excluded.longitude, sites.longitude),
                county = COALESCE(excluded.county, sites.county),
                river_basin = COALESCE(excluded.river_basin, sites.river_basin),
                ecoregion = COALESCE(excluded.ecoregion, sites.ecoregion)",
            params![
                site.site_name,
                meta.latitude,
                meta.longitude,
                meta.county,
                meta.river_basin,
                meta.ecoregion
            ],
        )?;
        Ok(if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    pub fn site_snapshot(&self) -> rusqlite::Result<SiteSnapshot> {
        let mut stmt = self.conn.prepare(
            "SELECT site_id, site_name, latitude, longitude, county, river_basin, ecoregion,
                    active, last_chemical_reading_date
             FROM sites
             ORDER BY site_name ASC",
        )?;

        let mut rows = stmt.query([])?;
        let mut sites = Vec::new();
        while let Some(row) = rows.next()? {
            sites.push(PersistedSite {
                site_id: row.get(0)?,
                site_name: row.get(1)?,
                metadata: SiteMetadata {
                    latitude: row.get(2)?,
                    longitude: row.get(3)?,
                    county: row.get(4)?,
                    river_basin: row.get(5)?,
                    ecoregion: row.get(6)?,
                },
                active: row.get::<_, i64>(7)? != 0,
                last_chemical_reading_date: row.get(8)?,
            });
        }
        Ok(SiteSnapshot { sites })
    }

    pub fn site_by_name(&self, name: &str) -> rusqlite::Result<Option<PersistedSite>> {
        Ok(self
            .site_snapshot()?
            .sites
            .into_iter()
            .find(|site| site.site_name == name))
    }

    /// Row counts per dependent table for one site.
    pub fn dependent_counts(&self, site_id: i64) -> rusqlite::Result<Vec<(&'static str, i64)>> {
        Self::dependent_counts_on(&self.conn, site_id)
    }

    pub(crate) fn dependent_counts_on(
        conn: &Connection,
        site_id: i64,
    ) -> rusqlite::Result<Vec<(&'static str, i64)>> {
        let mut out = Vec::with_capacity(SITE_DEPENDENT_TABLES.len());
        for table in SITE_DEPENDENT_TABLES {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {table} WHERE site_id = ?1"),
                params![site_id],
                |row| row.get(0),
            )?;
            out.push((table, count));
        }
        Ok(out)
    }

    pub(crate) fn repoint_dependents_on(
        conn: &Connection,
        table: &str,
        from_site: i64,
        to_site: i64,
    ) -> rusqlite::Result<usize> {
        if !SITE_DEPENDENT_TABLES.contains(&table) {
            return Err(rusqlite::Error::InvalidParameterName(format!(
                "`{table}` does not reference sites"
            )));
        }
        conn.execute(
            &format!("UPDATE {table} SET site_id = ?1 WHERE site_id = ?2"),
            params![to_site, from_site],
        )
    }

    pub(crate) fn delete_site_on(conn: &Connection, site_id: i64) -> rusqlite::Result<usize> {
        conn.execute("DELETE FROM sites WHERE site_id = ?1", params![site_id])
    }

    /// Sets metadata columns that are still null; populated columns are left alone.
    pub(crate) fn fill_site_metadata_on(
        conn: &Connection,
        site_id: i64,
        metadata: &SiteMetadata,
    ) -> rusqlite::Result<usize> {
        conn.execute(
            "UPDATE sites SET
                latitude = COALESCE(latitude, ?2),
                longitude = COALESCE(longitude, ?3),
                county = COALESCE(county, ?4),
                river_basin = COALESCE(river_basin, ?5),
                ecoregion = COALESCE(ecoregion, ?6)
             WHERE site_id = ?1",
            params![
                site_id,
                metadata.latitude,
                metadata.longitude,
                metadata.county,
                metadata.river_basin,
                metadata.ecoregion
            ],
        )
    }

    /// Removes sites that no event table references. Returns the deleted names.
    pub fn delete_unused_sites(&self) -> rusqlite::Result<Vec<String>> {
        let filter = SITE_DEPENDENT_TABLES
            .iter()
            .map(|table| format!("NOT EXISTS (SELECT 1 FROM {table} d WHERE d.site_id = s.site_id)"))
            .collect::<Vec<_>>()
            .join(" AND ");

        let tx = self.conn.unchecked_transaction()?;
        let mut names = Vec::new();
        {
            let mut stmt = tx.prepare(&format!(
                "SELECT s.site_name FROM sites s WHERE {filter} ORDER BY s.site_name ASC"
            ))?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                names.push(row.get::<_, String>(0)?);
            }
        }
        for name in &names {
            tx.execute("DELETE FROM sites WHERE site_name = ?1", params![name])?;
        }
        tx.commit()?;
        Ok(names)
    }

    /// Latest chemical collection date per site that has any chemical events.
    pub fn latest_chemical_dates(&self) -> rusqlite::Result<Vec<(i64, NaiveDate)>> {
        let mut stmt = self.conn.prepare(
            "SELECT site_id, MAX(collection_date)
             FROM chemical_collection_events
             GROUP BY site_id
             ORDER BY site_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((row.get(0)?, row.get(1)?));
        }
        Ok(out)
    }

    /// Writes activity flags for every site in one transaction.
    pub fn set_site_activity(
        &self,
        updates: &[(i64, bool, Option<NaiveDate>)],
    ) -> rusqlite::Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut changed = 0;
        for (site_id, active, last_reading) in updates {
            changed += tx.execute(
                "UPDATE sites SET active = ?2, last_chemical_reading_date = ?3 WHERE site_id = ?1",
                params![site_id, if *active { 1_i64 } else { 0_i64 }, last_reading],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }
}

impl SqliteStore {
    fn validate_site_name(name: &str) -> rusqlite::Result<()> {
        if name.trim().is_empty() {
            return Err(rusqlite::Error::InvalidParameterName(
                "site_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
