use snafu::Snafu;

use crate::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CliError {
    #[snafu(display("settings failed on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to open message storage on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: hilo_storage::StorageError,
    },
    #[snafu(display("failed to create chat backend on `{stage}`: {source}"))]
    Backend {
        stage: &'static str,
        source: hilo_llm::ProviderError,
    },
    #[snafu(display("terminal io failed on `{stage}`: {source}"))]
    Terminal {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type CliResult<T> = Result<T, CliError>;
