/***************************************************************************************************
Fatal, local errors: malformed wire payloads. These never cross to peers
as messages; they are surfaced to the host, which halts and awaits
restart.
***************************************************************************************************/

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("received a malformed message: {0}")]
    Malformed(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
