//! Classification of failures for exit-code mapping and log summaries.
//!
//! Errors are propagated with [`anyhow`] throughout the crate; a [`FailureKind`] is attached as
//! context wherever the failure class is known, so the CLI can report a one-line summary and exit
//! with the documented code without losing the underlying chain.
use std::process::ExitCode;
use strum::Display;

/// The class of a failure, attached to `anyhow` error chains as context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum FailureKind {
    /// A mandatory building column (ERA, Uh, set points) is missing
    MissingBuildingField,
    /// A referenced unit family or layer is absent from the catalog
    MissingCatalogEntry,
    /// Fewer candidate days survived than the requested cluster count
    BadClusterCount,
    /// An attribute column is constant everywhere, so normalization is degenerate
    ClusteringDegenerate,
    /// The optimization problem has no feasible point
    Infeasible,
    /// The optimization problem is unbounded
    Unbounded,
    /// The external solver failed for a reason other than infeasibility
    SolverError,
    /// The solver hit its time limit
    SolverTimeout,
    /// The restricted master problem is infeasible
    MasterInfeasible,
    /// A building subproblem is infeasible
    SubproblemInfeasible,
    /// The scenario is malformed (unknown objective, conflicting enforce/exclude, ...)
    InvalidScenario,
    /// A file could not be read or written
    IoError,
    /// The run was cancelled before completing
    Cancelled,
}

impl FailureKind {
    /// The process exit code documented for this failure class.
    pub fn exit_code(self) -> ExitCode {
        let code: u8 = match self {
            Self::Infeasible
            | Self::Unbounded
            | Self::MasterInfeasible
            | Self::SubproblemInfeasible => 1,
            Self::MissingBuildingField
            | Self::MissingCatalogEntry
            | Self::BadClusterCount
            | Self::ClusteringDegenerate
            | Self::InvalidScenario
            | Self::IoError => 2,
            Self::SolverError | Self::SolverTimeout => 3,
            Self::Cancelled => 4,
        };
        ExitCode::from(code)
    }
}

/// Find the innermost [`FailureKind`] in an error chain, if any was attached.
pub fn failure_kind(error: &anyhow::Error) -> Option<FailureKind> {
    error
        .chain()
        .filter_map(|cause| cause.downcast_ref::<FailureKindMarker>())
        .map(|marker| marker.0)
        .next_back()
}

/// Wrapper making [`FailureKind`] usable as `anyhow` context.
#[derive(Debug)]
pub struct FailureKindMarker(pub FailureKind);

impl std::fmt::Display for FailureKindMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for FailureKindMarker {}

/// Attach a [`FailureKind`] to an error chain.
///
/// Usage: `some_result.with_context(|| kind(FailureKind::Infeasible))`.
pub fn kind(kind: FailureKind) -> FailureKindMarker {
    FailureKindMarker(kind)
}
