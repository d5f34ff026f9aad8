//! Custom Resource Definitions for the notebook operator

mod notebook;
mod types;

pub use notebook::{Notebook, NotebookSpec, NotebookStatus};
pub use types::{NotebookFlavor, NotebookIngressBackend, NotebookPhase, NotebookTls};
