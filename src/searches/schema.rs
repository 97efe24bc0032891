//! Database schema for searches.db.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP,
};
use anyhow::Result;
use rusqlite::Connection;

// =============================================================================
// Version 1
// =============================================================================

const SEARCHES_TABLE_V1: Table = Table {
    name: "searches",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("user_id", &SqlType::Text, non_null = true),
        sqlite_column!("query", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("skip_value", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!(
            "num_results_downloaded",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "num_results_in_search",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "submitted_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_download_at", &SqlType::Integer),
        sqlite_column!("started_compression_at", &SqlType::Integer),
        sqlite_column!("completed_compression_at", &SqlType::Integer),
        sqlite_column!("failed_at", &SqlType::Integer),
        sqlite_column!("retry_count", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("notified", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!(
            "run_time_seconds",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
    ],
    indices: &[
        ("idx_searches_state_updated", "state, updated_at"),
        ("idx_searches_user", "user_id"),
    ],
};

const SEARCH_FILTERS_TABLE_V1: Table = Table {
    name: "search_filters",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "search_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "searches",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("filter_name", &SqlType::Text, non_null = true),
        sqlite_column!("filter_value", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_search_filters_search", "search_id")],
};

const SEARCH_FORMATS_TABLE_V1: Table = Table {
    name: "search_formats",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "search_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "searches",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("format", &SqlType::Text, non_null = true),
    ],
    indices: &[("idx_search_formats_search", "search_id")],
};

/// Append-only copy of deleted searches, used for reporting.
const HISTORICAL_SEARCHES_TABLE_V1: Table = Table {
    name: "historical_searches",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("search_id", &SqlType::Integer, non_null = true),
        sqlite_column!("query", &SqlType::Text, non_null = true),
        sqlite_column!("final_state", &SqlType::Text, non_null = true),
        sqlite_column!("num_results_downloaded", &SqlType::Integer, non_null = true),
        sqlite_column!("num_results_in_search", &SqlType::Integer, non_null = true),
        sqlite_column!("submitted_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_download_at", &SqlType::Integer),
        sqlite_column!("completed_compression_at", &SqlType::Integer),
        sqlite_column!("failed_at", &SqlType::Integer),
        sqlite_column!("retry_count", &SqlType::Integer, non_null = true),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("run_time_seconds", &SqlType::Integer, non_null = true),
        sqlite_column!("deleted_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_historical_search_id", "search_id")],
};

/// Rate-limit ledger, one row per call class.
const API_LIMITS_TABLE_V1: Table = Table {
    name: "api_limits",
    columns: &[
        sqlite_column!("call_class", &SqlType::Text, is_primary_key = true),
        sqlite_column!("limit_per_minute", &SqlType::Integer, non_null = true),
        sqlite_column!("limit_per_hour", &SqlType::Integer, non_null = true),
        sqlite_column!("limit_per_day", &SqlType::Integer, non_null = true),
        sqlite_column!("remaining_per_minute", &SqlType::Integer, non_null = true),
        sqlite_column!("remaining_per_hour", &SqlType::Integer, non_null = true),
        sqlite_column!("remaining_per_day", &SqlType::Integer, non_null = true),
        sqlite_column!("reset_on_minute", &SqlType::Integer, non_null = true),
        sqlite_column!("reset_on_hour", &SqlType::Integer, non_null = true),
        sqlite_column!("reset_on_day", &SqlType::Integer, non_null = true),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
};

// =============================================================================
// Version 2: shard resume point and API call log
// =============================================================================

const SEARCHES_TABLE_V2: Table = Table {
    name: "searches",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("user_id", &SqlType::Text, non_null = true),
        sqlite_column!("query", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("skip_value", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!(
            "num_results_downloaded",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "num_results_in_search",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!(
            "submitted_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!("updated_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_download_at", &SqlType::Integer),
        sqlite_column!("started_compression_at", &SqlType::Integer),
        sqlite_column!("completed_compression_at", &SqlType::Integer),
        sqlite_column!("failed_at", &SqlType::Integer),
        sqlite_column!("retry_count", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("notified", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!(
            "run_time_seconds",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("last_save_dir", &SqlType::Text),
    ],
    indices: &[
        ("idx_searches_state_updated", "state, updated_at"),
        ("idx_searches_user", "user_id"),
    ],
};

const API_CALL_LOG_TABLE_V2: Table = Table {
    name: "api_call_log",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("call_class", &SqlType::Text, non_null = true),
        sqlite_column!("request_url", &SqlType::Text, non_null = true),
        sqlite_column!("response_code", &SqlType::Integer),
        sqlite_column!("num_results", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("requested_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_api_call_log_class_time", "call_class, requested_at")],
};

fn migrate_to_v2(conn: &Connection) -> Result<()> {
    conn.execute("ALTER TABLE searches ADD COLUMN last_save_dir TEXT", [])?;
    API_CALL_LOG_TABLE_V2.create(conn)?;
    Ok(())
}

// =============================================================================
// Version 3: full history copies and the searchable sources list
// =============================================================================

/// Version 1 columns plus the remaining fields of `searches`, appended so the
/// migration can add them in place.
const HISTORICAL_SEARCHES_TABLE_V3: Table = Table {
    name: "historical_searches",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("search_id", &SqlType::Integer, non_null = true),
        sqlite_column!("query", &SqlType::Text, non_null = true),
        sqlite_column!("final_state", &SqlType::Text, non_null = true),
        sqlite_column!("num_results_downloaded", &SqlType::Integer, non_null = true),
        sqlite_column!("num_results_in_search", &SqlType::Integer, non_null = true),
        sqlite_column!("submitted_at", &SqlType::Integer, non_null = true),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("completed_download_at", &SqlType::Integer),
        sqlite_column!("completed_compression_at", &SqlType::Integer),
        sqlite_column!("failed_at", &SqlType::Integer),
        sqlite_column!("retry_count", &SqlType::Integer, non_null = true),
        sqlite_column!("error_message", &SqlType::Text),
        sqlite_column!("run_time_seconds", &SqlType::Integer, non_null = true),
        sqlite_column!("deleted_at", &SqlType::Integer, non_null = true),
        sqlite_column!("user_id", &SqlType::Text),
        sqlite_column!("skip_value", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("updated_at", &SqlType::Integer),
        sqlite_column!("started_compression_at", &SqlType::Integer),
        sqlite_column!("notified", &SqlType::Integer, non_null = true, default_value = Some("0")),
        sqlite_column!("last_save_dir", &SqlType::Text),
    ],
    indices: &[("idx_historical_search_id", "search_id")],
};

/// Sources the API can be searched by. A refresh stages new rows inactive and
/// swaps them in once the whole list was fetched.
const SOURCES_TABLE_V3: Table = Table {
    name: "sources",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("source_id", &SqlType::Text, non_null = true),
        sqlite_column!("source_name", &SqlType::Text, non_null = true),
        sqlite_column!("active", &SqlType::Integer, non_null = true, default_value = Some("0")),
    ],
    indices: &[("idx_sources_active", "active")],
};

fn migrate_to_v3(conn: &Connection) -> Result<()> {
    for column in [
        "user_id TEXT",
        "skip_value INTEGER NOT NULL DEFAULT 0",
        "updated_at INTEGER",
        "started_compression_at INTEGER",
        "notified INTEGER NOT NULL DEFAULT 0",
        "last_save_dir TEXT",
    ] {
        conn.execute(
            &format!("ALTER TABLE historical_searches ADD COLUMN {}", column),
            [],
        )?;
    }
    SOURCES_TABLE_V3.create(conn)?;
    Ok(())
}

pub const SEARCHES_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 0,
        tables: &[
            SEARCHES_TABLE_V1,
            SEARCH_FILTERS_TABLE_V1,
            SEARCH_FORMATS_TABLE_V1,
            HISTORICAL_SEARCHES_TABLE_V1,
            API_LIMITS_TABLE_V1,
        ],
        migration: None,
    },
    VersionedSchema {
        version: 1,
        tables: &[
            SEARCHES_TABLE_V2,
            SEARCH_FILTERS_TABLE_V1,
            SEARCH_FORMATS_TABLE_V1,
            HISTORICAL_SEARCHES_TABLE_V1,
            API_LIMITS_TABLE_V1,
            API_CALL_LOG_TABLE_V2,
        ],
        migration: Some(migrate_to_v2),
    },
    VersionedSchema {
        version: 2,
        tables: &[
            SEARCHES_TABLE_V2,
            SEARCH_FILTERS_TABLE_V1,
            SEARCH_FORMATS_TABLE_V1,
            HISTORICAL_SEARCHES_TABLE_V3,
            API_LIMITS_TABLE_V1,
            API_CALL_LOG_TABLE_V2,
            SOURCES_TABLE_V3,
        ],
        migration: Some(migrate_to_v3),
    },
];
