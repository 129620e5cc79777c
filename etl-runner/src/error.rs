use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("failed to connect to the warehouse: {0}")]
    Database(#[from] sqlx::Error),
    #[error("the one-shot run failed; see the run summary above")]
    RunFailed,
}
