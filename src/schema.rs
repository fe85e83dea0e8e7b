//! Description of the queue table.
//!
//! The transport does not run migrations of its own. It describes the table it
//! needs in a small [`Schema`] model which either a caller supplied
//! [`SchemaSynchronizer`] or the driver itself turns into DDL.

use futures_util::future::BoxFuture;
use strum::{Display, EnumString};

/// Table option marking tables created by this crate.
pub const TABLE_OPTION_NAME: &str = "_tablemq_table_name";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Platform {
    Sqlite,
    Postgres,
}

impl Platform {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "sqlite" => Some(Self::Sqlite),
            "postgres" | "postgresql" => Some(Self::Postgres),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    BigInt,
    Text,
    String,
    DateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub not_null: bool,
    pub autoincrement: bool,
    pub length: Option<u32>,
}

impl Column {
    fn new(name: &str, column_type: ColumnType) -> Self {
        Self {
            name: name.to_owned(),
            column_type,
            not_null: true,
            autoincrement: false,
            length: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.not_null = false;
        self
    }

    pub fn autoincrement(mut self) -> Self {
        self.autoincrement = true;
        self
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub name: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
    pub indexes: Vec<Index>,
    pub options: Vec<(String, String)>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn add_column(&mut self, column: Column) -> &mut Self {
        self.columns.push(column);
        self
    }

    pub fn set_primary_key(&mut self, columns: &[&str]) -> &mut Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Adds an index named after the table and its columns.
    pub fn add_index(&mut self, columns: &[&str]) -> &mut Self {
        let name = format!("{}_{}_idx", self.name.replace('.', "_"), columns.join("_"));
        self.indexes.push(Index {
            name,
            columns: columns.iter().map(|c| c.to_string()).collect(),
        });
        self
    }

    pub fn add_option(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.options.push((key.into(), value.into()));
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Idempotent DDL creating the table and its indexes.
    pub fn create_sql(&self, platform: Platform) -> Vec<String> {
        let mut definitions: Vec<String> = self
            .columns
            .iter()
            .map(|column| column_sql(column, &self.primary_key, platform))
            .collect();

        // SQLite declares an autoincrement key inline.
        let inline_key = platform == Platform::Sqlite
            && self.primary_key.len() == 1
            && self
                .column(&self.primary_key[0])
                .is_some_and(|c| c.autoincrement);

        if !self.primary_key.is_empty() && !inline_key {
            definitions.push(format!("PRIMARY KEY ({})", self.primary_key.join(", ")));
        }

        let mut statements = vec![format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.name,
            definitions.join(", ")
        )];

        for index in &self.indexes {
            let (name, table) = match (platform, self.name.split_once('.')) {
                // SQLite qualifies the index name instead of the indexed table.
                (Platform::Sqlite, Some((schema, table))) => {
                    (format!("{schema}.{}", index.name), table)
                }
                _ => (index.name.clone(), self.name.as_str()),
            };

            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS {name} ON {table} ({})",
                index.columns.join(", ")
            ));
        }

        statements
    }
}

fn column_sql(column: &Column, primary_key: &[String], platform: Platform) -> String {
    let ty = match (platform, column.column_type, column.autoincrement) {
        (Platform::Sqlite, ColumnType::BigInt, true) => {
            // Only an INTEGER PRIMARY KEY can autoincrement in SQLite, and
            // AUTOINCREMENT guarantees ids are never handed out twice.
            return format!("{} INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL", column.name);
        }
        (Platform::Postgres, ColumnType::BigInt, true) => "BIGSERIAL".to_owned(),
        (_, ColumnType::BigInt, false) => "BIGINT".to_owned(),
        (_, ColumnType::Text, _) => "TEXT".to_owned(),
        (_, ColumnType::String, _) => format!("VARCHAR({})", column.length.unwrap_or(255)),
        (Platform::Sqlite, ColumnType::DateTime, _) => "DATETIME".to_owned(),
        (Platform::Postgres, ColumnType::DateTime, _) => "TIMESTAMPTZ".to_owned(),
    };

    let null = if column.not_null || primary_key.contains(&column.name) {
        "NOT NULL"
    } else {
        "DEFAULT NULL"
    };

    format!("{} {ty} {null}", column.name)
}

/// A set of tables, filled in by whoever is assembling the database schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    tables: Vec<Table>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.iter().any(|t| t.name == name)
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn create_table(&mut self, name: impl Into<String>) -> &mut Table {
        self.tables.push(Table::new(name));
        let last = self.tables.len() - 1;
        &mut self.tables[last]
    }

    pub fn create_sql(&self, platform: Platform) -> Vec<String> {
        self.tables
            .iter()
            .flat_map(|table| table.create_sql(platform))
            .collect()
    }
}

/// Adds the queue table definition to `schema`.
pub fn add_table_to_schema(schema: &mut Schema, table_name: &str) {
    let table = schema.create_table(table_name);
    table
        .add_option(TABLE_OPTION_NAME, table_name)
        .add_column(Column::new("id", ColumnType::BigInt).autoincrement())
        .add_column(Column::new("body", ColumnType::Text))
        .add_column(Column::new("headers", ColumnType::Text))
        // MySQL 5.6 can only index 191 characters of a utf8mb4 column; the
        // limit is kept so the table stays portable.
        .add_column(Column::new("queue_name", ColumnType::String).length(190))
        .add_column(Column::new("created_at", ColumnType::DateTime))
        .add_column(Column::new("available_at", ColumnType::DateTime))
        .add_column(Column::new("delivered_at", ColumnType::DateTime).nullable())
        .set_primary_key(&["id"])
        .add_index(&["queue_name"])
        .add_index(&["available_at"])
        .add_index(&["delivered_at"]);
}

/// Applies a schema to the database. Implementations must be idempotent.
pub trait SchemaSynchronizer: Send + Sync {
    fn update_schema<'a>(
        &'a self,
        schema: &'a Schema,
        platform: Platform,
    ) -> BoxFuture<'a, Result<(), sqlx::Error>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue_schema(name: &str) -> Schema {
        let mut schema = Schema::new();
        add_table_to_schema(&mut schema, name);
        schema
    }

    #[test]
    fn queue_table_layout() {
        let schema = queue_schema("messenger_messages");
        let table = schema.table("messenger_messages").unwrap();

        let names: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "id",
                "body",
                "headers",
                "queue_name",
                "created_at",
                "available_at",
                "delivered_at"
            ]
        );
        assert_eq!(table.column("queue_name").unwrap().length, Some(190));
        assert!(!table.column("delivered_at").unwrap().not_null);
        assert_eq!(table.primary_key, ["id"]);
        assert_eq!(table.indexes.len(), 3);
        assert_eq!(
            table.options,
            [(TABLE_OPTION_NAME.to_owned(), "messenger_messages".to_owned())]
        );
    }

    #[test]
    fn sqlite_ddl() {
        let sql = queue_schema("messenger_messages").create_sql(Platform::Sqlite);

        assert_eq!(
            sql[0],
            "CREATE TABLE IF NOT EXISTS messenger_messages (\
             id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL, \
             body TEXT NOT NULL, \
             headers TEXT NOT NULL, \
             queue_name VARCHAR(190) NOT NULL, \
             created_at DATETIME NOT NULL, \
             available_at DATETIME NOT NULL, \
             delivered_at DATETIME DEFAULT NULL)"
        );
        assert_eq!(
            sql[1..],
            [
                "CREATE INDEX IF NOT EXISTS messenger_messages_queue_name_idx ON messenger_messages (queue_name)",
                "CREATE INDEX IF NOT EXISTS messenger_messages_available_at_idx ON messenger_messages (available_at)",
                "CREATE INDEX IF NOT EXISTS messenger_messages_delivered_at_idx ON messenger_messages (delivered_at)",
            ]
        );
    }

    #[test]
    fn postgres_ddl() {
        let sql = queue_schema("jobs.messages").create_sql(Platform::Postgres);

        assert_eq!(
            sql[0],
            "CREATE TABLE IF NOT EXISTS jobs.messages (\
             id BIGSERIAL NOT NULL, \
             body TEXT NOT NULL, \
             headers TEXT NOT NULL, \
             queue_name VARCHAR(190) NOT NULL, \
             created_at TIMESTAMPTZ NOT NULL, \
             available_at TIMESTAMPTZ NOT NULL, \
             delivered_at TIMESTAMPTZ DEFAULT NULL, \
             PRIMARY KEY (id))"
        );
        assert_eq!(
            sql[1],
            "CREATE INDEX IF NOT EXISTS jobs_messages_queue_name_idx ON jobs.messages (queue_name)"
        );
    }

    #[test]
    fn sqlite_ddl_for_qualified_table() {
        let sql = queue_schema("main.messages").create_sql(Platform::Sqlite);

        assert!(sql[0].starts_with("CREATE TABLE IF NOT EXISTS main.messages ("));
        assert_eq!(
            sql[1..],
            [
                "CREATE INDEX IF NOT EXISTS main.main_messages_queue_name_idx ON messages (queue_name)",
                "CREATE INDEX IF NOT EXISTS main.main_messages_available_at_idx ON messages (available_at)",
                "CREATE INDEX IF NOT EXISTS main.main_messages_delivered_at_idx ON messages (delivered_at)",
            ]
        );
    }

    #[test]
    fn platform_names() {
        assert_eq!(Platform::from_scheme("postgresql"), Some(Platform::Postgres));
        assert_eq!(Platform::from_scheme("mysql"), None);
        assert_eq!(Platform::Sqlite.to_string(), "sqlite");
        assert_eq!("postgres".parse::<Platform>().unwrap(), Platform::Postgres);
    }
}
