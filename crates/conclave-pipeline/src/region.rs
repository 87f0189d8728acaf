//! Orthogonal regions shared by both pipeline kinds.
//!
//! Alongside its main phase every pipeline tracks liveness (has it been told
//! to stop?) and fault state (has a step failed?). Both are checked on every
//! tick before the main phase runs.

use conclave_types::Mode;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    /// Terminal. The supervised process has been killed.
    Terminated,
}

#[derive(Debug)]
pub enum Fault {
    Valid,
    /// A step failed. Holds the error until the node collects it.
    Error(Option<PipelineError>),
}

impl Fault {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Hand over the captured error. The pipeline stays in `Error`.
    pub fn take(&mut self) -> Option<PipelineError> {
        match self {
            Self::Error(err) => err.take(),
            Self::Valid => None,
        }
    }
}

/// What the node does with a pipeline that reached `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Discard it and start a fresh pipeline for the same slot.
    Replace,
    /// Terminate the slot and leave its working directory for inspection.
    Terminate,
}

impl Recovery {
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Distributed => Self::Replace,
            Mode::Developer   => Self::Terminate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_error_is_taken_once() {
        let mut fault = Fault::Error(Some(PipelineError::Timeout("handshake".into())));
        assert!(fault.is_error());
        assert!(matches!(fault.take(), Some(PipelineError::Timeout(_))));
        assert!(fault.take().is_none());
        assert!(fault.is_error());
        assert!(Fault::Valid.take().is_none());
    }

    #[test]
    fn recovery_follows_mode() {
        assert_eq!(Recovery::for_mode(Mode::Distributed), Recovery::Replace);
        assert_eq!(Recovery::for_mode(Mode::Developer), Recovery::Terminate);
    }
}
