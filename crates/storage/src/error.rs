use snafu::Snafu;

/// Failures of the durable message log. `stage` names the step that failed.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("`{raw}` is not a valid {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
    #[snafu(display("stored message is malformed on `{stage}`: {details}"))]
    CorruptRow {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("could not create database directory {path}: {source}"))]
    CreateDatabaseDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("could not open message database `{database_url}` on `{stage}`: {source}"))]
    OpenDatabase {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("message schema migration failed: {source}"))]
    Migrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("message query failed on `{stage}`: {source}"))]
    Query {
        stage: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("message store is unavailable: {details}"))]
    Unavailable {
        stage: &'static str,
        details: String,
    },
}

impl StorageError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::InvalidId { stage, .. }
            | Self::CorruptRow { stage, .. }
            | Self::CreateDatabaseDirectory { stage, .. }
            | Self::OpenDatabase { stage, .. }
            | Self::Migrate { stage, .. }
            | Self::Query { stage, .. }
            | Self::Unavailable { stage, .. } => stage,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
