// SQL schema for the sentinel's SQLite store: chain metadata plus the
// users/keys projection tables.

pub const INITIAL_SCHEMA: &str = include_str!("../../migrations/001_initial_schema.sql");
