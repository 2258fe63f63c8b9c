//! Derivation graph, content store, realization, bundling and publishing
//! for kiln.

pub mod bundle;
pub mod derivation;
pub mod error;
pub mod graph;
pub mod init;
pub mod ops;
pub mod project;
pub mod publish;
pub mod realize;
pub mod source;
pub mod store;

pub use bundle::{plan_bundle, write_bundle, Bundle, BundlePlan};
pub use derivation::{DerivationId, DerivationInputs};
pub use error::EngineError;
pub use graph::{DerivationGraph, GraphError, Selection};
pub use init::init_project;
pub use project::Project;
pub use publish::{
    publish, DirectoryBackend, HttpBackend, PublishAction, PublishError, PublishReport,
    ReleaseBackend,
};
pub use realize::{NodeOutcome, Plan, PlanEntry, RealizeError, RealizeOptions, RealizeReport, Realizer};
pub use store::ContentStore;
