//! Error taxonomy for lifecycle operations.

use crate::model::entity::{ContractViolation, EntityId, EntityRef};
use crate::repo::store::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug)]
pub enum EngineError {
    /// Caller misuse. Fatal, never retried.
    Contract(ContractViolation),
    /// A chain pointer references a missing or non-head row.
    InconsistentChain {
        revision: EntityRef,
        head_id: EntityId,
        details: &'static str,
    },
    /// Persistence failure, propagated unchanged.
    Repo(RepoError),
}

impl EngineError {
    pub(crate) fn inconsistent(
        entity_type: &str,
        id: EntityId,
        head_id: EntityId,
        details: &'static str,
    ) -> Self {
        Self::InconsistentChain {
            revision: EntityRef::new(entity_type, id),
            head_id,
            details,
        }
    }
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Contract(err) => write!(f, "contract violation: {err}"),
            Self::InconsistentChain {
                revision,
                head_id,
                details,
            } => write!(
                f,
                "inconsistent version chain: {revision} -> head {head_id}: {details}"
            ),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Contract(err) => Some(err),
            Self::InconsistentChain { .. } => None,
            Self::Repo(err) => Some(err),
        }
    }
}

impl From<ContractViolation> for EngineError {
    fn from(value: ContractViolation) -> Self {
        Self::Contract(value)
    }
}

impl From<RepoError> for EngineError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Contract(err) => Self::Contract(err),
            other => Self::Repo(other),
        }
    }
}
