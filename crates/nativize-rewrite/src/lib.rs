//! Post-link rewriting of declarative native-import stubs.
//!
//! Every method carrying native-import metadata is replaced by an ordinary
//! method that loads its library and resolves its symbol on first use, then
//! marshals its arguments explicitly and calls through the resolved address.
//! A generated helper type supplies library loading for Windows, Linux,
//! Darwin and the BSDs.
//!
//! ## Pipeline
//!
//! 1. [`discover`]: find stubs, assign a [`MarshallingPlan`] to every slot,
//!    reject unsupported shapes before anything changes
//! 2. [`plan`]: address cells, initializers and native thunks per stub
//! 3. [`compile`]: replacement bodies
//! 4. [`loader`] / [`helpers`]: the helper type
//!
//! [`rewrite`] runs all of them and returns the new module with a
//! [`RewriteReport`].

pub mod classify;
pub mod compile;
pub mod config;
pub mod discover;
pub mod error;
pub mod helpers;
pub mod loader;
pub mod marshal;
pub mod pipeline;
pub mod plan;
pub mod report;

pub use classify::TypeClassifier;
pub use compile::MarshallingCompiler;
pub use config::RewriteConfig;
pub use discover::{discover, DiscoveredImports, DiscoveryOptions, ImportedFunction};
pub use error::RewriteError;
pub use loader::{HelperType, PlatformLoaderBuilder};
pub use marshal::{MarshallingPlan, StringEncoding};
pub use pipeline::{rewrite, rewrite_in_place, RewriteOutput};
pub use plan::{TransformationPlanner, TransformationRecord};
pub use report::RewriteReport;
