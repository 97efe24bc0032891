use super::BASE_DB_VERSION;
use anyhow::{bail, Result};
use rusqlite::{params, Connection};

pub const DEFAULT_TIMESTAMP: &str = "(cast(strftime('%s','now') as int))";

#[macro_export]
macro_rules! sqlite_column {
    ($name:expr, $sql_type:expr $(, $field:ident = $value:expr)*) => {
        {
            // Only mutated when optional field assignments are passed
            #[allow(unused_mut)]
            let mut column = Column {
                name: $name,
                sql_type: $sql_type,
                is_primary_key: false,
                non_null: false,
                default_value: None,
                foreign_key: None,
            };
            $(
                column.$field = $value;
            )*
            column
        }
    };
}

#[derive(Debug, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Real,
}

impl SqlType {
    fn as_sql(&self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Integer => "INTEGER",
            SqlType::Real => "REAL",
        }
    }

    fn from_sql(s: &str) -> Option<&'static SqlType> {
        match s {
            "TEXT" => Some(&SqlType::Text),
            "INTEGER" => Some(&SqlType::Integer),
            "REAL" => Some(&SqlType::Real),
            _ => None,
        }
    }
}

#[allow(unused)]
pub enum ForeignKeyOnChange {
    NoAction,
    Cascade,
}

impl ForeignKeyOnChange {
    fn as_sql(&self) -> &'static str {
        match self {
            ForeignKeyOnChange::NoAction => "NO ACTION",
            ForeignKeyOnChange::Cascade => "CASCADE",
        }
    }
}

pub struct ForeignKey {
    pub foreign_table: &'static str,
    pub foreign_column: &'static str,
    pub on_delete: ForeignKeyOnChange,
}

pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static SqlType,
    pub is_primary_key: bool,
    pub non_null: bool,
    pub default_value: Option<&'static str>,
    pub foreign_key: Option<&'static ForeignKey>,
}

impl Column {
    fn definition(&self) -> String {
        let mut sql = format!("{} {}", self.name, self.sql_type.as_sql());
        if self.is_primary_key {
            sql.push_str(" PRIMARY KEY");
        }
        if self.non_null {
            sql.push_str(" NOT NULL");
        }
        if let Some(default_value) = self.default_value {
            sql.push_str(&format!(" DEFAULT {}", default_value));
        }
        if let Some(fk) = self.foreign_key {
            sql.push_str(&format!(
                " REFERENCES {}({}) ON DELETE {}",
                fk.foreign_table,
                fk.foreign_column,
                fk.on_delete.as_sql()
            ));
        }
        sql
    }
}

pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    pub indices: &'static [(&'static str, &'static str)],
}

impl Table {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        let columns = self
            .columns
            .iter()
            .map(Column::definition)
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute(
            &format!("CREATE TABLE {} ({});", self.name, columns),
            params![],
        )?;

        for (index_name, column_names) in self.indices {
            conn.execute(
                &format!(
                    "CREATE INDEX {} ON {}({});",
                    index_name, self.name, column_names
                ),
                params![],
            )?;
        }
        Ok(())
    }

    /// Compares the live table against this definition.
    fn validate(&self, conn: &Connection) -> Result<()> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", self.name))?;
        let actual: Vec<(String, String, bool, bool)> = stmt
            .query_map(params![], |row| {
                Ok((
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i32>(3)? == 1,
                    row.get::<_, i32>(5)? == 1,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;

        if actual.len() != self.columns.len() {
            bail!(
                "Table {} has {} columns, expected {} ({})",
                self.name,
                actual.len(),
                self.columns.len(),
                self.columns
                    .iter()
                    .map(|c| c.name)
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        for ((name, sql_type, non_null, is_pk), expected) in actual.iter().zip(self.columns) {
            if name != expected.name {
                bail!(
                    "Table {} column name mismatch: expected {}, got {}",
                    self.name,
                    expected.name,
                    name
                );
            }
            if SqlType::from_sql(sql_type) != Some(expected.sql_type) {
                bail!(
                    "Table {} column {} type mismatch: expected {:?}, got {}",
                    self.name,
                    expected.name,
                    expected.sql_type,
                    sql_type
                );
            }
            if *non_null != expected.non_null || *is_pk != expected.is_primary_key {
                bail!(
                    "Table {} column {} constraint mismatch",
                    self.name,
                    expected.name
                );
            }
        }

        for (index_name, _) in self.indices {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='index' AND name=?1 AND tbl_name=?2",
                    params![index_name, self.name],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            if !exists {
                bail!("Table {} is missing index '{}'", self.name, index_name);
            }
        }
        Ok(())
    }
}

pub struct VersionedSchema {
    pub version: usize,
    pub tables: &'static [Table],
    pub migration: Option<fn(&Connection) -> Result<()>>,
}

impl VersionedSchema {
    pub fn create(&self, conn: &Connection) -> Result<()> {
        conn.execute("PRAGMA foreign_keys = ON;", params![])?;
        for table in self.tables {
            table.create(conn)?;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + self.version),
            [],
        )?;
        Ok(())
    }

    pub fn validate(&self, conn: &Connection) -> Result<()> {
        for table in self.tables {
            table.validate(conn)?;
        }
        Ok(())
    }
}
